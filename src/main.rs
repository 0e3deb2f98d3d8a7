// main.rs - Command-line front end of the BCI spectral feature pipeline
//
// Every long command (extract, analyze, train, search) runs on the session
// worker; this thread only drains its events into a progress bar and prints
// the terminal message. A failed job exits with a non-zero status.

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

mod config;
mod data_loader;
mod electrodes;
mod engine;
mod error;
mod extraction;
mod feature_extractor;
mod merge;
mod scenario;
mod signal_processing;
mod statistics;
mod training;
mod types;
mod worker;

use crate::config::{parse_override, ParameterDict, PipelineRegistry, Workspace, ELECTRODE_MATCH};
use crate::data_loader::{DataLoader, SignalHeader};
use crate::electrodes::MatchMode;
use crate::engine::{DesignerProcess, ExperimentEngine};
use crate::extraction::{update_extraction_parameters, Extractor};
use crate::feature_extractor::{ExportRequest, FeatureExtractor};
use crate::training::{Trainer, TrainingMode, TrainingRequest};
use crate::types::{describe_features, validate_features, Condition, PipelineKind};
use crate::worker::{Reporter, Session, WorkerEvent};

/// Offline spectral feature extraction, analysis and classifier training for
/// two-class motor-imagery BCI experiments
#[derive(Parser)]
#[command(name = "bcifeat")]
#[command(version)]
#[command(about = "BCI spectral feature pipeline", long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Project folder holding generated/ and the template scenarios
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Path of the engine launcher, overriding params.json
    #[arg(long)]
    designer: Option<PathBuf>,

    /// Parameter override (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_override)]
    overrides: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write default parameters for a pipeline to generated/params.json
    Init {
        /// PowSpectrumGraz or Connectivity
        #[arg(long, default_value = "PowSpectrumGraz")]
        pipeline: String,
    },

    /// Run the extraction scenario over recorded signal files
    Extract {
        /// Signal files in generated/signals (all .ov files if omitted)
        files: Vec<String>,
    },

    /// Compute contrast maps over extracted runs and export them as CSV
    Analyze {
        /// Run basenames (all extracted runs if omitted)
        runs: Vec<String>,

        /// Electrode for the PSD and ERD/ERS arrays
        #[arg(short, long)]
        electrode: Option<String>,

        /// Frequency (Hz) for the topography
        #[arg(short, long)]
        freq: Option<f64>,

        /// Lower bound (Hz) of the band-limited R² map
        #[arg(long, requires = "fmax")]
        fmin: Option<f64>,

        /// Upper bound (Hz) of the band-limited R² map
        #[arg(long, requires = "fmin")]
        fmax: Option<f64>,

        /// Output directory (generated/figures by default)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Fail on channels outside the canonical montage instead of dropping them
        #[arg(long)]
        strict_electrodes: bool,
    },

    /// Train the classifier once on all selected runs
    Train(TrainArgs),

    /// Train on every subset of the selected runs and keep the best
    Search(TrainArgs),

    /// Validate a feature selection against a recording
    CheckFeatures {
        /// "<channel>;<freq>" or "<channel>;<lo>:<hi>"
        #[arg(short, long = "feature", required = true)]
        features: Vec<String>,

        /// Trial table to validate against (first one if omitted)
        #[arg(long)]
        run: Option<String>,
    },

    /// List signal files, extracted runs and training tables
    List,
}

#[derive(clap::Args)]
struct TrainArgs {
    /// Trial tables in generated/signals/training (all if omitted)
    runs: Vec<String>,

    /// "<channel>;<freq>" or "<channel>;<lo>:<hi>" (repeatable)
    #[arg(short, long = "feature", required = true)]
    features: Vec<String>,

    /// Number of cross-validation partitions
    #[arg(short, long, default_value_t = 10)]
    kfold: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    info!("bcifeat v{}", env!("CARGO_PKG_VERSION"));
    info!("Starting at {}", Local::now().format("%Y-%m-%d %H:%M:%S"));

    let workspace = Workspace::new(&cli.workspace);
    let registry = Arc::new(PipelineRegistry::standard());

    if let Commands::Init { pipeline } = &cli.command {
        return init(&workspace, &registry, pipeline, cli.designer.as_deref());
    }

    let params_path = workspace.params_path();
    let mut params = ParameterDict::load(&params_path)
        .with_context(|| format!("reading {:?} (run `bcifeat init` first)", params_path))?;
    if let Some(designer) = &cli.designer {
        params.set("ovDesignerPath", designer.to_string_lossy().to_string());
    }

    let start = Instant::now();
    match cli.command {
        Commands::Init { .. } => {}

        Commands::Extract { files } => {
            let changed = update_extraction_parameters(&workspace, &registry, &mut params, &cli.overrides)?;
            debug!("Changed parameters: {:?}", changed);
            let loader = DataLoader::new(workspace.clone());
            let files = if files.is_empty() { loader.signal_files()? } else { files };
            let extractor = Extractor::new(workspace, registry, params.clone());
            let session = engine_session(&params)?;
            run_job(&session, "extract", move |engine, reporter| extractor.run(&files, engine, reporter))?;
        }

        Commands::Analyze {
            runs,
            electrode,
            freq,
            fmin,
            fmax,
            output,
            strict_electrodes,
        } => {
            params.apply_overrides(&cli.overrides);
            if strict_electrodes {
                params.set(ELECTRODE_MATCH, MatchMode::Strict.as_str());
            }
            let loader = DataLoader::new(workspace.clone());
            let runs = if runs.is_empty() {
                loader.spectrum_basenames(
                    &params.class_label(Condition::Class1)?,
                    &params.class_label(Condition::Class2)?,
                )?
            } else {
                runs
            };
            let output = output.unwrap_or_else(|| workspace.figures());
            let request = ExportRequest {
                electrode,
                frequency: freq,
                band: fmin.zip(fmax),
            };
            let extractor = FeatureExtractor::new(loader, params.clone());
            let session = Session::new(Box::new(DesignerProcess::new(params.designer_path().unwrap_or_default())));
            run_job(&session, "analyze", move |_, reporter| {
                let features = extractor.load(&runs, reporter)?;
                let written = features.export(&output, &request)?;
                Ok(format!(
                    "Analysed {} runs over {} electrodes; wrote {} files to {:?}",
                    features.runs.len(),
                    features.electrodes.len(),
                    written.len(),
                    output
                ))
            })?;
        }

        Commands::Train(args) => {
            params.apply_overrides(&cli.overrides);
            train(workspace, registry, params, args, TrainingMode::Single)?;
        }

        Commands::Search(args) => {
            params.apply_overrides(&cli.overrides);
            train(workspace, registry, params, args, TrainingMode::Combination)?;
        }

        Commands::CheckFeatures { features, run } => {
            let loader = DataLoader::new(workspace.clone());
            let run = match run {
                Some(run) => run,
                None => loader
                    .training_files()?
                    .into_iter()
                    .next()
                    .context("no trial tables in generated/signals/training")?,
            };
            let header = SignalHeader::read(&workspace.training().join(&run))?;
            let validated = validate_features(&features, header.sampling_frequency, &header.electrodes)?;
            print!("{}", describe_features(&validated));
        }

        Commands::List => list(&workspace, &params)?,
    }

    info!("Done in {:.2} seconds", start.elapsed().as_secs_f64());
    Ok(())
}

/// Create the workspace layout and a fresh params.json
fn init(workspace: &Workspace, registry: &PipelineRegistry, pipeline: &str, designer: Option<&Path>) -> Result<()> {
    let kind = PipelineKind::from_str(pipeline).with_context(|| {
        let known: Vec<&str> = PipelineKind::all().iter().map(|k| k.as_str()).collect();
        format!("unknown pipeline '{}', expected one of {}", pipeline, known.join(", "))
    })?;
    workspace.ensure_layout()?;
    let params = registry.default_parameters(kind, designer.unwrap_or_else(|| Path::new("")));
    params.save(&workspace.params_path())?;
    println!(
        "{}: wrote {} parameters to {:?}",
        registry.definition(kind).description,
        params.len(),
        workspace.params_path()
    );
    Ok(())
}

fn engine_session(params: &ParameterDict) -> Result<Session> {
    let designer = params.designer_path().context("no engine launcher configured")?;
    Ok(Session::new(Box::new(DesignerProcess::new(designer))))
}

fn train(
    workspace: Workspace,
    registry: Arc<PipelineRegistry>,
    params: ParameterDict,
    args: TrainArgs,
    mode: TrainingMode,
) -> Result<()> {
    let runs = if args.runs.is_empty() {
        DataLoader::new(workspace.clone()).training_files()?
    } else {
        args.runs
    };
    let request = TrainingRequest {
        runs,
        features: args.features,
        kfold: args.kfold,
        mode,
    };
    let session = engine_session(&params)?;
    let trainer = Trainer::new(workspace, registry, params);
    let name = match mode {
        TrainingMode::Single => "train",
        TrainingMode::Combination => "search",
    };
    run_job(&session, name, move |engine, reporter| {
        trainer.run(&request, engine, reporter).map(|outcome| outcome.message)
    })
}

/// Run `job` on the session worker and follow it to completion
fn run_job<F>(session: &Session, name: &str, job: F) -> Result<()>
where
    F: FnOnce(&mut dyn ExperimentEngine, &Reporter) -> Result<String> + Send + 'static,
{
    let worker = session.spawn(name, job)?;

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {prefix}: {bar:40} {pos}/{len} {msg}")?
            .progress_chars("##-"),
    );
    pb.set_prefix(name.to_string());

    let (success, message) = worker.drain(|event| match event {
        WorkerEvent::Progress { completed, total } => {
            pb.set_length(*total as u64);
            pb.set_position(*completed as u64);
        }
        WorkerEvent::Status(text) => pb.set_message(text.clone()),
        WorkerEvent::Complete { .. } => pb.finish_and_clear(),
    });

    if success {
        println!("{}", message);
        Ok(())
    } else {
        anyhow::bail!("{} failed: {}", name, message)
    }
}

fn list(workspace: &Workspace, params: &ParameterDict) -> Result<()> {
    let loader = DataLoader::new(workspace.clone());

    println!("Signal files:");
    for file in loader.signal_files()? {
        println!("\t{}", file);
    }

    println!("Extracted runs:");
    let class1 = params.class_label(Condition::Class1)?;
    let class2 = params.class_label(Condition::Class2)?;
    for run in loader.spectrum_basenames(&class1, &class2)? {
        println!("\t{}", run);
    }

    println!("Training tables:");
    for file in loader.training_files()? {
        println!("\t{}", file);
    }
    Ok(())
}
