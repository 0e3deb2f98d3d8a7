// training.rs - Classifier training orchestration
//
// Builds composite training tables from per-run trial files, configures the
// training scenario, runs it through the engine and scores the
// cross-validation output. Combination mode repeats this for every
// non-empty subset of the selected runs and keeps the best weights.

use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{remove_stale, ParameterDict, PipelineRegistry, Workspace};
use crate::data_loader::SignalHeader;
use crate::engine::{display_number, ClassifierScore, ExperimentEngine};
use crate::error::{PipelineError, PipelineResult};
use crate::merge::{merge_runs, MergeRequest};
use crate::scenario::{settings, Scenario};
use crate::types::{describe_features, validate_features, Condition, Feature};
use crate::worker::Reporter;

/// Largest run selection accepted by the combination search
pub const MAX_COMBINATION_RUNS: usize = 5;

/// Weights file written by a single training pass
pub const SINGLE_WEIGHTS: &str = "classifier-weights.xml";

// ============================================================================
// State machine
// ============================================================================

/// Lifecycle of one training request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Idle,
    PreparingScenario,
    Running,
    ParsingResults,
    Done,
    Failed,
}

impl TrainingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingState::Idle => "Idle",
            TrainingState::PreparingScenario => "PreparingScenario",
            TrainingState::Running => "Running",
            TrainingState::ParsingResults => "ParsingResults",
            TrainingState::Done => "Done",
            TrainingState::Failed => "Failed",
        }
    }

    /// Whether `self -> next` is a legal step
    ///
    /// ParsingResults may loop back to PreparingScenario for the next subset
    /// of a combination search. Any non-terminal state may fail.
    pub fn can_advance_to(&self, next: TrainingState) -> bool {
        use TrainingState::*;
        matches!(
            (*self, next),
            (Idle, PreparingScenario)
                | (PreparingScenario, Running)
                | (Running, ParsingResults)
                | (ParsingResults, PreparingScenario)
                | (ParsingResults, Done)
                | (Idle, Failed)
                | (PreparingScenario, Failed)
                | (Running, Failed)
                | (ParsingResults, Failed)
        )
    }
}

impl fmt::Display for TrainingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the state of one request and rejects illegal transitions
#[derive(Debug)]
pub struct StateMachine {
    state: TrainingState,
    history: Vec<TrainingState>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: TrainingState::Idle,
            history: vec![TrainingState::Idle],
        }
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    pub fn history(&self) -> &[TrainingState] {
        &self.history
    }

    pub fn advance(&mut self, next: TrainingState) -> PipelineResult<()> {
        if !self.state.can_advance_to(next) {
            return Err(PipelineError::IllegalTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        log::debug!("Training state {} -> {}", self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Powerset
// ============================================================================

/// Every non-empty subset of `0..n`: by size, then in input order
pub fn powerset(n: usize) -> Vec<Vec<usize>> {
    fn combinations(n: usize, k: usize, start: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if current.len() == k {
            out.push(current.clone());
            return;
        }
        for i in start..n {
            current.push(i);
            combinations(n, k, i + 1, current, out);
            current.pop();
        }
    }

    let mut out = Vec::new();
    for k in 1..=n {
        combinations(n, k, 0, &mut Vec::with_capacity(k), &mut out);
    }
    out
}

/// Index of the first strictly maximal accuracy
pub fn best_index(accuracies: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, &acc) in accuracies.iter().enumerate() {
        match best {
            Some(b) if acc <= accuracies[b] => {}
            _ => best = Some(idx),
        }
    }
    best
}

fn format_subset(subset: &[usize]) -> String {
    let items: Vec<String> = subset.iter().map(|i| i.to_string()).collect();
    format!("[{}]", items.join(","))
}

// ============================================================================
// Requests and results
// ============================================================================

/// Single pass over all runs, or search over every subset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingMode {
    Single,
    Combination,
}

#[derive(Debug, Clone)]
pub struct TrainingRequest {
    /// Trial file names inside the workspace training directory
    pub runs: Vec<String>,
    /// "<channel>;<freq>" or "<channel>;<lo>:<hi>"
    pub features: Vec<String>,
    /// Number of k-fold partitions
    pub kfold: usize,
    pub mode: TrainingMode,
}

/// Outcome of one subset in combination mode
#[derive(Debug, Clone)]
pub struct CombinationResult {
    pub runs: Vec<usize>,
    pub score: ClassifierScore,
    pub weights: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub features: Vec<Feature>,
    pub results: Vec<CombinationResult>,
    /// Index into `results` of the promoted weights
    pub best: usize,
    pub message: String,
}

// ============================================================================
// Trainer
// ============================================================================

/// Runs training requests against one workspace
#[derive(Debug, Clone)]
pub struct Trainer {
    pub workspace: Workspace,
    pub registry: Arc<PipelineRegistry>,
    pub params: ParameterDict,
}

impl Trainer {
    pub fn new(workspace: Workspace, registry: Arc<PipelineRegistry>, params: ParameterDict) -> Self {
        Self {
            workspace,
            registry,
            params,
        }
    }

    /// Run a training request to completion
    pub fn run(
        &self,
        request: &TrainingRequest,
        engine: &mut dyn ExperimentEngine,
        reporter: &Reporter,
    ) -> Result<TrainingOutcome> {
        let mut machine = StateMachine::new();
        let result = self.run_inner(request, engine, reporter, &mut machine);
        if result.is_err() && machine.state() != TrainingState::Failed {
            machine.advance(TrainingState::Failed)?;
        }
        log::debug!("Training went through {:?}", machine.history());
        result
    }

    fn run_inner(
        &self,
        request: &TrainingRequest,
        engine: &mut dyn ExperimentEngine,
        reporter: &Reporter,
        machine: &mut StateMachine,
    ) -> Result<TrainingOutcome> {
        machine.advance(TrainingState::PreparingScenario)?;
        self.check_request(request)?;

        let run_paths: Vec<PathBuf> = request
            .runs
            .iter()
            .map(|r| self.workspace.training().join(r))
            .collect();
        let (sampling_frequency, electrodes) = common_header(&run_paths)?;
        log::info!(
            "Sampling frequency {} Hz, sensors {}",
            sampling_frequency,
            electrodes.join(";")
        );

        let features = validate_features(&request.features, sampling_frequency, &electrodes)?;
        let train_scenario = self
            .prepare_scenarios(&features, request.kfold)
            .context("preparing training scenarios")?;

        let merge_request = MergeRequest::standard(
            &self.params.class_label(Condition::Class1)?,
            &self.params.class_label(Condition::Class2)?,
            self.params.get_f64("StimulationEpoch")?,
        );

        let subsets = match request.mode {
            TrainingMode::Single => vec![(0..run_paths.len()).collect::<Vec<_>>()],
            TrainingMode::Combination => powerset(run_paths.len()),
        };
        let total = subsets.len();

        let mut results = Vec::with_capacity(total);
        for (idx, subset) in subsets.iter().enumerate() {
            if idx > 0 {
                machine.advance(TrainingState::PreparingScenario)?;
            }
            let weights_name = match request.mode {
                TrainingMode::Single => SINGLE_WEIGHTS.to_string(),
                TrainingMode::Combination => {
                    reporter.status(format!("Combination {}", format_subset(subset)));
                    format!("classifier-weights-{}.xml", idx)
                }
            };

            let paths: Vec<PathBuf> = subset.iter().map(|&i| run_paths[i].clone()).collect();
            let composite = merge_runs(&paths, &merge_request)
                .with_context(|| format!("merging runs {}", format_subset(subset)))?;
            let weights = self.workspace.training().join(&weights_name);

            let mut scenario = Scenario::load(&train_scenario)?;
            scenario.set_setting(settings::TRAINING_FILE, &composite.to_string_lossy());
            scenario.set_setting(settings::WEIGHTS_FILE, &weights.to_string_lossy());
            scenario.save()?;
            remove_stale(&weights)?;

            machine.advance(TrainingState::Running)?;
            if request.mode == TrainingMode::Single {
                reporter.status("Running training scenario");
            }
            let run = engine
                .run_scenario(&train_scenario)
                .with_context(|| format!("training on runs {}", format_subset(subset)))?;

            machine.advance(TrainingState::ParsingResults)?;
            let score = ClassifierScore::from_run(&run)
                .with_context(|| format!("scoring runs {}", format_subset(subset)))?;
            log::info!("Runs {}: {}% accuracy", format_subset(subset), score.accuracy);

            if !weights.exists() {
                return Err(PipelineError::ExternalProcess(format!(
                    "training finished without writing {:?}",
                    weights
                ))
                .into());
            }
            results.push(CombinationResult {
                runs: subset.clone(),
                score,
                weights,
            });
            reporter.progress(idx + 1, total);
        }

        let accuracies: Vec<f64> = results.iter().map(|r| r.score.accuracy).collect();
        let best = best_index(&accuracies).ok_or_else(|| PipelineError::InsufficientData {
            what: "training results".to_string(),
            needed: 1,
            got: 0,
        })?;
        self.promote_weights(&results, best)?;
        machine.advance(TrainingState::Done)?;

        let message = match request.mode {
            TrainingMode::Single => single_report(&features, &results[best].score),
            TrainingMode::Combination => combination_report(&features, &request.runs, &results, best),
        };
        Ok(TrainingOutcome {
            features,
            results,
            best,
            message,
        })
    }

    fn check_request(&self, request: &TrainingRequest) -> PipelineResult<()> {
        if request.kfold == 0 {
            return Err(PipelineError::invalid_parameter(
                "kfold",
                "number of partitions must be a positive integer",
            ));
        }
        if request.runs.is_empty() {
            return Err(PipelineError::InsufficientData {
                what: "training runs".to_string(),
                needed: 1,
                got: 0,
            });
        }
        if request.mode == TrainingMode::Combination && request.runs.len() > MAX_COMBINATION_RUNS {
            return Err(PipelineError::invalid_parameter(
                "runs",
                format!(
                    "combination search takes at most {} runs, got {}",
                    MAX_COMBINATION_RUNS,
                    request.runs.len()
                ),
            ));
        }
        Ok(())
    }

    /// Re-copy training and online scenarios from the templates and configure them
    fn prepare_scenarios(&self, features: &[Feature], kfold: usize) -> Result<PathBuf> {
        let kind = self.params.pipeline_kind()?;
        let definition = self.registry.definition(kind);
        let templates = self.workspace.template_dir(definition);
        let names = &self.registry.templates;
        let general = self.params.setting_pairs();

        let train_path = self.workspace.scenario(names.train);
        let mut train = Scenario::from_template(&templates.join(names.train), &train_path)
            .with_context(|| format!("copying template {}", names.train))?;
        train.apply_settings(&general);
        train.set_features(features);
        train.set_setting(settings::PARTITIONS, &kfold.to_string());
        train.save()?;

        let online_path = self.workspace.scenario(names.online);
        let mut online = Scenario::from_template(&templates.join(names.online), &online_path)
            .with_context(|| format!("copying template {}", names.online))?;
        online.apply_settings(&general);
        online.set_features(features);
        online.save()?;

        Ok(train_path)
    }

    /// Copy the best weights to the canonical location and drop the others
    fn promote_weights(&self, results: &[CombinationResult], best: usize) -> Result<()> {
        let target = self.workspace.final_weights();
        fs::copy(&results[best].weights, &target)
            .with_context(|| format!("promoting {:?}", results[best].weights))?;
        log::info!("Promoted {:?} to {:?}", results[best].weights, target);

        for (idx, result) in results.iter().enumerate() {
            let is_single = result.weights.file_name().map(|n| n == SINGLE_WEIGHTS).unwrap_or(false);
            if idx != best && !is_single {
                fs::remove_file(&result.weights).ok();
            }
        }
        Ok(())
    }
}

/// Sampling frequency and electrode list shared by every run
fn common_header(runs: &[PathBuf]) -> PipelineResult<(u32, Vec<String>)> {
    let mut reference: Option<(PathBuf, SignalHeader)> = None;
    for path in runs {
        let header = SignalHeader::read(path)?;
        if let Some((first, ref_header)) = &reference {
            if header.sampling_frequency != ref_header.sampling_frequency {
                return Err(PipelineError::consistency(
                    "sampling frequency",
                    ref_header.sampling_frequency,
                    header.sampling_frequency,
                ));
            }
            if header.electrodes != ref_header.electrodes {
                return Err(PipelineError::ElectrodeMismatch {
                    first: first.clone(),
                    other: path.clone(),
                });
            }
        } else {
            reference = Some((path.clone(), header));
        }
    }
    let (_, header) = reference.ok_or_else(|| PipelineError::InsufficientData {
        what: "training runs".to_string(),
        needed: 1,
        got: 0,
    })?;
    Ok((header.sampling_frequency, header.electrodes))
}

// ============================================================================
// Reports
// ============================================================================

fn single_report(features: &[Feature], score: &ClassifierScore) -> String {
    let mut text = describe_features(features);
    text.push_str("\n\n");
    text.push_str(&score.message());
    text.push_str("\n\nResults written in file:\t generated/classifier-weights.xml\n");
    text.push_str("If those results are satisfying, you can now open generated/sc3-online.xml in the Designer");
    text
}

fn combination_report(
    features: &[Feature],
    runs: &[String],
    results: &[CombinationResult],
    best: usize,
) -> String {
    let mut text = describe_features(features);
    text.push_str("\n... and experiment runs:");
    for (idx, run) in runs.iter().enumerate() {
        text.push_str(&format!("\n\t[{}]: {}", idx, run));
    }

    text.push_str("\n\nTraining Cross-Validation Test Accuracies per combination:\n");
    for result in results {
        text.push_str(&format!(
            "\t{}: {}%\n",
            format_subset(&result.runs),
            display_number(result.score.accuracy)
        ));
    }
    let winner = &results[best];
    text.push_str(&format!(
        "\nMax is combination {} with {}%\n",
        format_subset(&winner.runs),
        display_number(winner.score.accuracy)
    ));
    text.push_str(&winner.score.message());

    text.push_str("\n\nThe weights for this combination have been written to:\n");
    text.push_str("\tgenerated/classifier-weights.xml\n");
    text.push_str("If those results are satisfying, you can now open this scenario in the Designer:\n");
    text.push_str("\tgenerated/sc3-online.xml");
    text
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::training_output;
    use crate::merge::tests::write_trials_csv;
    use crate::scenario::tests::scenario_xml;
    use crate::types::PipelineKind;
    use crate::worker::tests::ScriptedEngine;
    use crate::worker::WorkerEvent;
    use std::path::Path;
    use std::sync::mpsc;
    use tempfile::TempDir;

    #[test]
    fn test_powerset_order() {
        let sets = powerset(3);
        assert_eq!(
            sets,
            vec![
                vec![0],
                vec![1],
                vec![2],
                vec![0, 1],
                vec![0, 2],
                vec![1, 2],
                vec![0, 1, 2]
            ]
        );
        for n in 1..=5 {
            assert_eq!(powerset(n).len(), (1 << n) - 1);
        }
    }

    #[test]
    fn test_best_index_first_strict_max() {
        assert_eq!(best_index(&[60.0, 75.0, 75.0, 70.0]), Some(1));
        assert_eq!(best_index(&[80.0]), Some(0));
        assert_eq!(best_index(&[]), None);
    }

    #[test]
    fn test_state_transitions() {
        let mut machine = StateMachine::new();
        assert!(matches!(
            machine.advance(TrainingState::Running),
            Err(PipelineError::IllegalTransition { .. })
        ));
        machine.advance(TrainingState::PreparingScenario).unwrap();
        machine.advance(TrainingState::Running).unwrap();
        machine.advance(TrainingState::ParsingResults).unwrap();
        machine.advance(TrainingState::Done).unwrap();
        assert!(machine.advance(TrainingState::Failed).is_err());
        assert_eq!(machine.history().len(), 5);
    }

    /// Workspace with templates, `runs` trial files and default parameters
    fn fixture(runs: usize) -> (TempDir, Trainer, Vec<String>) {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        ws.ensure_layout().unwrap();

        let registry = Arc::new(PipelineRegistry::standard());
        let mut params = registry.default_parameters(PipelineKind::PowSpectrumGraz, Path::new("designer"));
        params.set("StimulationEpoch", 1.0);

        let template_dir = ws.template_dir(registry.definition(PipelineKind::PowSpectrumGraz));
        fs::create_dir_all(&template_dir).unwrap();
        let xml = scenario_xml(&[
            (settings::TRAINING_FILE, ""),
            (settings::WEIGHTS_FILE, ""),
            (settings::PARTITIONS, "10"),
            (settings::FEATURE_COUNT, "0"),
            (settings::FEATURE_CHANNELS, ""),
            (settings::FEATURE_FREQUENCIES, ""),
            ("Class1", ""),
        ]);
        fs::write(template_dir.join(registry.templates.train), &xml).unwrap();
        fs::write(template_dir.join(registry.templates.online), &xml).unwrap();

        let mut names = Vec::new();
        for r in 0..runs {
            let name = format!("run{}-TRIALS.csv", r);
            write_trials_csv(&ws.training().join(&name), 10, &["C3", "Cz", "C4"], 5.0, &[(0.5, 769), (2.0, 770)]);
            names.push(name);
        }

        (dir, Trainer::new(ws, registry, params), names)
    }

    /// Engine that writes the requested weights file and reports the
    /// (TN, TP) pairs in call order
    fn scripted_accuracies(
        training_dir: PathBuf,
        accuracies: Vec<(f64, f64)>,
    ) -> impl FnMut(&Path) -> PipelineResult<Vec<String>> + Send {
        let mut call = 0;
        move |scenario: &Path| {
            let scen = Scenario::load(scenario)?;
            let weights = scen.setting(settings::WEIGHTS_FILE).unwrap_or_default();
            fs::write(training_dir.join(weights), "<weights/>")?;
            let (tn, tp) = accuracies[call % accuracies.len()];
            call += 1;
            Ok(training_output((tn, 100.0 - tn), (100.0 - tp, tp)))
        }
    }

    #[test]
    fn test_combination_search_evaluates_every_subset_once() {
        let (_dir, trainer, runs) = fixture(3);
        // accuracies 60, 75, 70, 75, 65, 50, 72 -> first max is subset index 1 ([1])
        let script = scripted_accuracies(
            trainer.workspace.training(),
            vec![(60.0, 60.0), (75.0, 75.0), (70.0, 70.0), (75.0, 75.0), (65.0, 65.0), (50.0, 50.0), (72.0, 72.0)],
        );
        let mut engine = ScriptedEngine::new(script);
        let (tx, rx) = mpsc::channel();
        let reporter = Reporter::new(tx);

        let request = TrainingRequest {
            runs: runs.clone(),
            features: vec!["C3;4".to_string(), "Cz;2:4".to_string()],
            kfold: 5,
            mode: TrainingMode::Combination,
        };
        let outcome = trainer.run(&request, &mut engine, &reporter).unwrap();

        assert_eq!(engine.played.len(), 7);
        assert_eq!(outcome.results.len(), 7);
        assert_eq!(outcome.best, 1);
        assert_eq!(outcome.results[1].runs, vec![1]);

        // winner promoted, losers removed
        let ws = &trainer.workspace;
        assert!(ws.final_weights().exists());
        assert!(ws.training().join("classifier-weights-1.xml").exists());
        assert!(!ws.training().join("classifier-weights-0.xml").exists());
        assert!(!ws.training().join("classifier-weights-6.xml").exists());

        let progress: Vec<(usize, usize)> = rx
            .try_iter()
            .filter_map(|e| match e {
                WorkerEvent::Progress { completed, total } => Some((completed, total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress.len(), 7);
        assert_eq!(progress[6], (7, 7));

        assert!(outcome.message.contains("\t[0,1,2]: 72.0%\n"));
        assert!(outcome.message.contains("Max is combination [1] with 75.0%"));

        // scenarios carry features and partitions
        let train = Scenario::load(&ws.scenario("sc2-train-composite.xml")).unwrap();
        assert_eq!(train.setting(settings::PARTITIONS).as_deref(), Some("5"));
        assert_eq!(train.setting(settings::FEATURE_CHANNELS).as_deref(), Some("C3;Cz"));
        assert_eq!(train.setting("Class1").as_deref(), Some("LEFT"));
    }

    #[test]
    fn test_single_mode() {
        let (_dir, trainer, runs) = fixture(2);
        let script = scripted_accuracies(trainer.workspace.training(), vec![(80.0, 70.0)]);
        let mut engine = ScriptedEngine::new(script);
        let (tx, _rx) = mpsc::channel();

        let request = TrainingRequest {
            runs,
            features: vec!["C4;3".to_string()],
            kfold: 10,
            mode: TrainingMode::Single,
        };
        let outcome = trainer.run(&request, &mut engine, &Reporter::new(tx)).unwrap();
        assert_eq!(engine.played.len(), 1);
        assert_eq!(outcome.results[0].runs, vec![0, 1]);
        assert!(outcome.message.contains("Overall accuracy : 75.0%"));
        assert!(trainer.workspace.final_weights().exists());
    }

    #[test]
    fn test_weights_from_an_earlier_run_are_not_reused() {
        let (_dir, trainer, runs) = fixture(1);
        let ws = &trainer.workspace;
        fs::write(ws.training().join(SINGLE_WEIGHTS), "<earlier/>").unwrap();

        // scores the run but never writes weights
        let mut engine = ScriptedEngine::new(|_: &Path| Ok(training_output((80.0, 20.0), (30.0, 70.0))));
        let (tx, _rx) = mpsc::channel();
        let request = TrainingRequest {
            runs,
            features: vec!["C4;3".to_string()],
            kfold: 10,
            mode: TrainingMode::Single,
        };
        let err = trainer.run(&request, &mut engine, &Reporter::new(tx)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ExternalProcess(_))
        ));
        assert!(!ws.training().join(SINGLE_WEIGHTS).exists());
        assert!(!ws.final_weights().exists());
    }

    #[test]
    fn test_invalid_feature_stops_before_engine() {
        let (_dir, trainer, runs) = fixture(1);
        let mut engine = ScriptedEngine::new(|_: &Path| Ok(Vec::new()));
        let (tx, _rx) = mpsc::channel();

        let request = TrainingRequest {
            runs,
            features: vec!["Pz;10".to_string()],
            kfold: 5,
            mode: TrainingMode::Single,
        };
        let err = trainer.run(&request, &mut engine, &Reporter::new(tx)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Validation { position: 1, .. })
        ));
        assert!(engine.played.is_empty());
    }

    #[test]
    fn test_request_checks() {
        let (_dir, trainer, runs) = fixture(1);
        let mut engine = ScriptedEngine::new(|_: &Path| Ok(Vec::new()));
        let (tx, _rx) = mpsc::channel();
        let reporter = Reporter::new(tx);

        let zero_fold = TrainingRequest {
            runs: runs.clone(),
            features: vec!["C3;10".to_string()],
            kfold: 0,
            mode: TrainingMode::Single,
        };
        let err = trainer.run(&zero_fold, &mut engine, &reporter).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidParameter { .. })
        ));

        let too_many = TrainingRequest {
            runs: vec![runs[0].clone(); 6],
            features: vec!["C3;10".to_string()],
            kfold: 5,
            mode: TrainingMode::Combination,
        };
        assert!(trainer.run(&too_many, &mut engine, &reporter).is_err());
        assert!(engine.played.is_empty());
    }
}
