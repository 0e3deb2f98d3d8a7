// extraction.rs - Spectral extraction through the external engine
//
// For every recorded signal file the extraction scenario is configured with
// the run's metadata (channel names, sampling-derived orders) and its
// input/output paths, then played by the engine. The engine writes one
// spectral export per condition, one per baseline and the run's trial table.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{remove_stale, ParameterDict, PipelineRegistry, Workspace};
use crate::data_loader::{DataLoader, SignalHeader};
use crate::engine::ExperimentEngine;
use crate::error::{PipelineError, PipelineResult};
use crate::scenario::{load_checked, settings, Scenario};
use crate::types::Condition;
use crate::worker::Reporter;

// ============================================================================
// Parameter updates
// ============================================================================

/// Apply parameter overrides before an extraction
///
/// Changed values are persisted to params.json. When one of the pipeline's
/// extraction parameters changed, the spectra and trial tables of the previous
/// extraction no longer match and are deleted.
///
/// # Returns
/// The keys whose value changed
pub fn update_extraction_parameters(
    workspace: &Workspace,
    registry: &PipelineRegistry,
    params: &mut ParameterDict,
    updates: &[(String, String)],
) -> PipelineResult<Vec<String>> {
    let changed = params.apply_overrides(updates);
    if changed.is_empty() {
        return Ok(changed);
    }

    workspace.ensure_layout()?;
    params.save(&workspace.params_path())?;
    log::info!("Saved {} changed parameters: {}", changed.len(), changed.join(", "));

    let kind = params.pipeline_kind()?;
    let keys = registry.definition(kind).extraction_keys();
    if changed.iter().any(|k| keys.contains(&k.as_str())) {
        workspace.delete_work_files()?;
    }
    Ok(changed)
}

/// Scenario settings computed from a run's metadata
///
/// `AutoRegressiveOrder` and `PsdSize` are only derived when the pipeline
/// defines `AutoRegressiveOrderTime` and `FreqRes`.
pub fn derived_settings(params: &ParameterDict, header: &SignalHeader) -> PipelineResult<Vec<(String, String)>> {
    let fs = f64::from(header.sampling_frequency);
    let mut pairs = vec![(settings::CHANNEL_NAMES.to_string(), header.electrodes.join(";"))];

    if params.contains("AutoRegressiveOrderTime") {
        let seconds = params.get_f64("AutoRegressiveOrderTime")?;
        if seconds <= 0.0 {
            return Err(PipelineError::invalid_parameter("AutoRegressiveOrderTime", "must be positive"));
        }
        let order = (seconds * fs).round() as usize;
        pairs.push((settings::AUTO_REGRESSIVE_ORDER.to_string(), order.to_string()));
    }

    if params.contains("FreqRes") {
        let resolution = params.get_f64("FreqRes")?;
        if resolution <= 0.0 {
            return Err(PipelineError::invalid_parameter("FreqRes", "must be positive"));
        }
        let size = (fs / resolution).round() as usize;
        pairs.push((settings::PSD_SIZE.to_string(), size.to_string()));
    }

    Ok(pairs)
}

// ============================================================================
// Extractor
// ============================================================================

/// Output files the engine writes for one run
#[derive(Debug, Clone)]
pub struct RunOutputs {
    pub class1: PathBuf,
    pub class2: PathBuf,
    pub class1_baseline: PathBuf,
    pub class2_baseline: PathBuf,
    pub trials: PathBuf,
}

impl RunOutputs {
    fn settings(&self) -> Vec<(&'static str, String)> {
        vec![
            (settings::OUTPUT_CLASS1, path_string(&self.class1)),
            (settings::OUTPUT_CLASS2, path_string(&self.class2)),
            (settings::OUTPUT_BASELINE1, path_string(&self.class1_baseline)),
            (settings::OUTPUT_BASELINE2, path_string(&self.class2_baseline)),
            (settings::OUTPUT_TRIALS, path_string(&self.trials)),
        ]
    }

    fn all(&self) -> [&Path; 5] {
        [
            self.class1.as_path(),
            self.class2.as_path(),
            self.class1_baseline.as_path(),
            self.class2_baseline.as_path(),
            self.trials.as_path(),
        ]
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Runs the extraction scenario over signal files of one workspace
#[derive(Debug, Clone)]
pub struct Extractor {
    pub loader: DataLoader,
    pub registry: Arc<PipelineRegistry>,
    pub params: ParameterDict,
}

impl Extractor {
    pub fn new(workspace: Workspace, registry: Arc<PipelineRegistry>, params: ParameterDict) -> Self {
        Self {
            loader: DataLoader::new(workspace),
            registry,
            params,
        }
    }

    fn workspace(&self) -> &Workspace {
        &self.loader.workspace
    }

    /// Where the engine must write the exports of `signal_file`
    pub fn outputs(&self, signal_file: &str) -> PipelineResult<RunOutputs> {
        let run = signal_file.strip_suffix(".ov").unwrap_or(signal_file);
        let class1 = self.params.class_label(Condition::Class1)?;
        let class2 = self.params.class_label(Condition::Class2)?;
        let spectra = self.loader.run_spectra(run, &class1, &class2);
        Ok(RunOutputs {
            class1: spectra.class1,
            class2: spectra.class2,
            class1_baseline: spectra.class1_baseline,
            class2_baseline: spectra.class2_baseline,
            trials: self.workspace().training().join(format!("{}-TRIALS.csv", run)),
        })
    }

    /// Extract every file of `signal_files`, one progress unit per file
    ///
    /// # Returns
    /// A summary message for the front end
    pub fn run(
        &self,
        signal_files: &[String],
        engine: &mut dyn ExperimentEngine,
        reporter: &Reporter,
    ) -> Result<String> {
        if signal_files.is_empty() {
            return Err(PipelineError::InsufficientData {
                what: "signal files to extract".to_string(),
                needed: 1,
                got: 0,
            }
            .into());
        }
        self.workspace().ensure_layout()?;
        let scenario_path = self.extraction_scenario()?;
        let general = self.params.setting_pairs();

        let total = signal_files.len();
        reporter.progress(0, total);
        for (idx, file) in signal_files.iter().enumerate() {
            reporter.status(format!("Extracting {} ({}/{})", file, idx + 1, total));
            self.extract_one(file, &scenario_path, &general, engine)
                .with_context(|| format!("extracting {}", file))?;
            reporter.progress(idx + 1, total);
        }

        Ok(format!("Extracted spectral features from {} signal files", total))
    }

    fn extract_one(
        &self,
        signal_file: &str,
        scenario_path: &Path,
        general: &[(String, String)],
        engine: &mut dyn ExperimentEngine,
    ) -> Result<()> {
        let signal_path = self.workspace().signals().join(signal_file);
        if !signal_path.exists() {
            return Err(PipelineError::format(&signal_path, "signal file not found").into());
        }

        let header = self.metadata(signal_file, &signal_path, engine)?;
        log::debug!(
            "{}: {} Hz, {} electrodes",
            signal_file,
            header.sampling_frequency,
            header.electrodes.len()
        );

        let outputs = self.outputs(signal_file)?;
        let mut scenario = Scenario::load(scenario_path)?;
        scenario.apply_settings(general);
        scenario.apply_settings(&derived_settings(&self.params, &header)?);
        scenario.set_setting(settings::SIGNAL_FILE, &path_string(&signal_path));
        scenario.apply_settings(&outputs.settings());
        scenario.save()?;
        for path in outputs.all() {
            remove_stale(path)?;
        }

        let run = engine.run_scenario(scenario_path)?;
        if !run.terminated {
            log::warn!("{}: engine exited without the termination line", signal_file);
        }

        let missing: Vec<String> = outputs
            .all()
            .iter()
            .filter(|p| !p.exists())
            .map(|p| path_string(p))
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::ExternalProcess(format!(
                "extraction of {} produced no {}",
                signal_file,
                missing.join(", ")
            ))
            .into());
        }
        Ok(())
    }

    /// Read the run's metadata, generating it through the engine if absent
    fn metadata(
        &self,
        signal_file: &str,
        signal_path: &Path,
        engine: &mut dyn ExperimentEngine,
    ) -> Result<SignalHeader> {
        let meta_path = self.loader.metadata_path(signal_file);
        if !meta_path.exists() {
            log::info!("No metadata for {}, generating {:?}", signal_file, meta_path);
            let names = &self.registry.templates;
            let template = self.template_dir()?.join(names.metadata);
            let mut scenario = Scenario::from_template(&template, &self.workspace().scenario(names.metadata))
                .with_context(|| format!("copying template {}", names.metadata))?;
            scenario.set_setting(settings::SIGNAL_FILE, &path_string(signal_path));
            scenario.set_setting(settings::METADATA_FILE, &path_string(&meta_path));
            scenario.save()?;
            engine.run_scenario(scenario.path())?;
        }

        if !meta_path.exists() {
            return Err(PipelineError::format(
                &meta_path,
                format!("metadata for session {} could not be generated", signal_file),
            )
            .into());
        }
        Ok(SignalHeader::read(&meta_path)?)
    }

    fn template_dir(&self) -> PipelineResult<PathBuf> {
        let kind = self.params.pipeline_kind()?;
        Ok(self.workspace().template_dir(self.registry.definition(kind)))
    }

    /// The generated extraction scenario, copied from the template if absent
    fn extraction_scenario(&self) -> Result<PathBuf> {
        let name = self.registry.templates.extract;
        let path = self.workspace().scenario(name);
        if !path.exists() {
            Scenario::from_template(&self.template_dir()?.join(name), &path)
                .with_context(|| format!("copying template {}", name))?;
        }
        load_checked(&path)?;
        Ok(path)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::tests::write_trials_csv;
    use crate::scenario::tests::scenario_xml;
    use crate::types::PipelineKind;
    use crate::worker::tests::ScriptedEngine;
    use crate::worker::WorkerEvent;
    use std::fs;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Extractor) {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        ws.ensure_layout().unwrap();

        let registry = Arc::new(PipelineRegistry::standard());
        let params = registry.default_parameters(PipelineKind::PowSpectrumGraz, Path::new("designer"));

        let template_dir = ws.template_dir(registry.definition(PipelineKind::PowSpectrumGraz));
        fs::create_dir_all(&template_dir).unwrap();
        let extract = scenario_xml(&[
            (settings::CHANNEL_NAMES, ""),
            (settings::AUTO_REGRESSIVE_ORDER, "0"),
            (settings::PSD_SIZE, "0"),
            (settings::SIGNAL_FILE, ""),
            (settings::OUTPUT_CLASS1, ""),
            (settings::OUTPUT_CLASS2, ""),
            (settings::OUTPUT_BASELINE1, ""),
            (settings::OUTPUT_BASELINE2, ""),
            (settings::OUTPUT_TRIALS, ""),
            ("FreqRes", "0"),
        ]);
        fs::write(template_dir.join(registry.templates.extract), extract).unwrap();
        let metadata = scenario_xml(&[(settings::SIGNAL_FILE, ""), (settings::METADATA_FILE, "")]);
        fs::write(template_dir.join(registry.templates.metadata), metadata).unwrap();

        (dir, Extractor::new(ws, registry, params))
    }

    /// Engine that creates whatever files the played scenario names
    fn writing_engine() -> impl FnMut(&Path) -> PipelineResult<Vec<String>> + Send {
        |scenario: &Path| {
            let scen = Scenario::load(scenario)?;
            if let Some(meta) = scen.setting(settings::METADATA_FILE) {
                write_trials_csv(Path::new(&meta), 500, &["C3", "Cz", "C4"], 0.01, &[]);
            }
            for name in [
                settings::OUTPUT_CLASS1,
                settings::OUTPUT_CLASS2,
                settings::OUTPUT_BASELINE1,
                settings::OUTPUT_BASELINE2,
                settings::OUTPUT_TRIALS,
            ] {
                if let Some(out) = scen.setting(name) {
                    fs::write(out, "x")?;
                }
            }
            Ok(vec!["Application terminated".to_string()])
        }
    }

    #[test]
    fn test_derived_settings() {
        let mut params = ParameterDict::new();
        params.set("AutoRegressiveOrderTime", 0.038);
        params.set("FreqRes", 2);
        let header = SignalHeader {
            sampling_frequency: 500,
            electrodes: vec!["C3".into(), "C4".into()],
        };
        let pairs = derived_settings(&params, &header).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("ChannelNames".to_string(), "C3;C4".to_string()),
                ("AutoRegressiveOrder".to_string(), "19".to_string()),
                ("PsdSize".to_string(), "250".to_string()),
            ]
        );

        params.set("FreqRes", 0);
        assert!(matches!(
            derived_settings(&params, &header),
            Err(PipelineError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_extract_generates_metadata_and_configures_scenario() {
        let (_dir, extractor) = fixture();
        let ws = extractor.workspace().clone();
        fs::write(ws.signals().join("run1.ov"), "signal").unwrap();
        fs::write(ws.signals().join("run2.ov"), "signal").unwrap();

        let mut engine = ScriptedEngine::new(writing_engine());
        let (tx, rx) = mpsc::channel();
        let files = extractor.loader.signal_files().unwrap();
        let message = extractor.run(&files, &mut engine, &Reporter::new(tx)).unwrap();
        assert!(message.contains("2 signal files"));

        // metadata pass + extraction pass per file
        assert_eq!(engine.played.len(), 4);
        assert!(ws.signals().join("run1-META.csv").exists());
        assert!(ws.analysis().join("run2-LEFT-BASELINE.csv").exists());
        assert!(ws.training().join("run2-TRIALS.csv").exists());

        let scen = Scenario::load(&ws.scenario("sc2-extract.xml")).unwrap();
        assert_eq!(scen.setting(settings::CHANNEL_NAMES).as_deref(), Some("C3;Cz;C4"));
        assert_eq!(scen.setting(settings::AUTO_REGRESSIVE_ORDER).as_deref(), Some("19"));
        assert_eq!(scen.setting(settings::PSD_SIZE).as_deref(), Some("500"));
        assert_eq!(scen.setting("FreqRes").as_deref(), Some("1"));
        assert!(scen.setting(settings::OUTPUT_CLASS2).unwrap().ends_with("run2-RIGHT.csv"));

        let progress: Vec<WorkerEvent> = rx
            .try_iter()
            .filter(|e| matches!(e, WorkerEvent::Progress { .. }))
            .collect();
        assert_eq!(progress.last(), Some(&WorkerEvent::Progress { completed: 2, total: 2 }));
    }

    #[test]
    fn test_missing_metadata_after_generation_fails() {
        let (_dir, extractor) = fixture();
        fs::write(extractor.workspace().signals().join("run1.ov"), "signal").unwrap();

        let mut engine = ScriptedEngine::new(|_: &Path| Ok(Vec::new()));
        let (tx, _rx) = mpsc::channel();
        let err = extractor
            .run(&["run1.ov".to_string()], &mut engine, &Reporter::new(tx))
            .unwrap_err();
        let text = format!("{:#}", err);
        assert!(text.contains("metadata for session run1.ov"));
        assert_eq!(engine.played.len(), 1);
    }

    #[test]
    fn test_outputs_from_an_earlier_run_do_not_mask_a_failed_extraction() {
        let (_dir, extractor) = fixture();
        let ws = extractor.workspace().clone();
        fs::write(ws.signals().join("run1.ov"), "signal").unwrap();
        let earlier = extractor.outputs("run1.ov").unwrap();
        for path in earlier.all() {
            fs::write(path, "earlier").unwrap();
        }

        // writes the metadata table, then fails silently on extraction
        let mut engine = ScriptedEngine::new(|scenario: &Path| {
            let scen = Scenario::load(scenario)?;
            if let Some(meta) = scen.setting(settings::METADATA_FILE) {
                write_trials_csv(Path::new(&meta), 500, &["C3", "Cz", "C4"], 0.01, &[]);
            }
            Ok(vec!["Application terminated".to_string()])
        });
        let (tx, _rx) = mpsc::channel();
        let err = extractor
            .run(&["run1.ov".to_string()], &mut engine, &Reporter::new(tx))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("produced no"));
        assert!(!ws.training().join("run1-TRIALS.csv").exists());
    }

    #[test]
    fn test_parameter_change_deletes_work_files() {
        let (_dir, extractor) = fixture();
        let ws = extractor.workspace().clone();
        let stale = ws.analysis().join("run1-LEFT.csv");
        fs::write(&stale, "old").unwrap();

        let mut params = extractor.params.clone();
        let changed = update_extraction_parameters(
            &ws,
            &extractor.registry,
            &mut params,
            &[("TrialNb".to_string(), "40".to_string())],
        )
        .unwrap();
        assert_eq!(changed, vec!["TrialNb".to_string()]);
        assert!(stale.exists());

        let changed = update_extraction_parameters(
            &ws,
            &extractor.registry,
            &mut params,
            &[("FreqRes".to_string(), "2".to_string())],
        )
        .unwrap();
        assert_eq!(changed, vec!["FreqRes".to_string()]);
        assert!(!stale.exists());
        assert_eq!(ParameterDict::load(&ws.params_path()).unwrap().get_f64("FreqRes").unwrap(), 2.0);

        let unchanged = update_extraction_parameters(
            &ws,
            &extractor.registry,
            &mut params,
            &[("FreqRes".to_string(), "2".to_string())],
        )
        .unwrap();
        assert!(unchanged.is_empty());
    }
}
