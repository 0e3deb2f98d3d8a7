// engine.rs - External engine invocation and classifier score parsing
//
// The engine is a black box run as
//   <designer> --no-gui --play-fast <scenario>
// Its stdout is read line by line. Training scenarios print a
// cross-validation section; the confusion matrix is scraped from the
// "trainer>" lines that follow it.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::error::{PipelineError, PipelineResult};

/// Printed by the engine once a scenario has finished
pub const TERMINATION_SENTINEL: &str = "Application terminated";
/// How long the engine may keep running after printing the sentinel
const EXIT_GRACE: Duration = Duration::from_secs(2);
const EXIT_POLL: Duration = Duration::from_millis(50);
/// Marks the start of the cross-validation results
pub const CROSS_VALIDATION_MARKER: &str = "Cross-validation test";
/// Prefix of the classifier trainer's log lines
pub const TRAINER_MARKER: &str = "trainer>";

/// Captured console output of one scenario run
#[derive(Debug, Clone, Default)]
pub struct EngineRun {
    pub lines: Vec<String>,
    /// Whether the termination sentinel was seen
    pub terminated: bool,
}

/// Something that can play a scenario to completion
///
/// The subprocess implementation is the production one; tests substitute a
/// scripted engine.
pub trait ExperimentEngine: Send {
    fn run_scenario(&mut self, scenario: &Path) -> PipelineResult<EngineRun>;
}

/// The designer executable driven as a subprocess
#[derive(Debug, Clone)]
pub struct DesignerProcess {
    pub designer: PathBuf,
}

impl DesignerProcess {
    pub fn new(designer: impl Into<PathBuf>) -> Self {
        Self {
            designer: designer.into(),
        }
    }
}

impl ExperimentEngine for DesignerProcess {
    fn run_scenario(&mut self, scenario: &Path) -> PipelineResult<EngineRun> {
        log::info!("Running {:?} {:?}", self.designer, scenario);

        let mut child = Command::new(&self.designer)
            .arg("--no-gui")
            .arg("--play-fast")
            .arg(scenario)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| {
                PipelineError::ExternalProcess(format!("cannot start {:?}: {}", self.designer, e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::ExternalProcess("no stdout pipe".to_string()))?;

        let mut run = EngineRun::default();
        for line in BufReader::new(stdout).lines() {
            let line = line?;
            log::trace!("engine: {}", line);
            let terminated = line.contains(TERMINATION_SENTINEL);
            run.lines.push(line);
            if terminated {
                run.terminated = true;
                break;
            }
        }

        let status = if run.terminated {
            // the engine can linger after the sentinel; give it a grace period
            wait_or_kill(&mut child, EXIT_GRACE)?
        } else {
            Some(child.wait()?)
        };
        let Some(status) = status else {
            log::warn!("Engine still running {:?} after termination, killed", scenario);
            return Ok(run);
        };
        if !status.success() && !run.terminated {
            return Err(PipelineError::ExternalProcess(format!(
                "{:?} on {:?} exited with {}",
                self.designer, scenario, status
            )));
        }
        log::debug!("Engine finished {:?} ({} lines)", scenario, run.lines.len());
        Ok(run)
    }
}

/// Wait up to `grace` for `child` to exit, killing it afterwards
///
/// # Returns
/// The exit status, or None when the child had to be killed
fn wait_or_kill(child: &mut Child, grace: Duration) -> PipelineResult<Option<ExitStatus>> {
    let deadline = Instant::now() + grace;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(EXIT_POLL);
    }
    child.kill()?;
    child.wait()?;
    Ok(None)
}

// ============================================================================
// Cross-validation results
// ============================================================================

/// The four scalars of the engine's 2x2 confusion matrix
///
/// Field names follow the engine's own row labelling: row 1 holds the
/// class-1 true negatives and false positives, row 2 the class-2 false
/// negatives and true positives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfusionMatrix {
    pub class1_true_negative: f64,
    pub class1_false_positive: f64,
    pub class2_false_negative: f64,
    pub class2_true_positive: f64,
}

/// Text after "trainer> " on every trainer line from the cross-validation marker on
pub fn trainer_lines(lines: &[String]) -> Vec<String> {
    let start = match lines.iter().position(|l| l.contains(CROSS_VALIDATION_MARKER)) {
        Some(idx) => idx,
        None => return Vec::new(),
    };
    lines[start..]
        .iter()
        .take_while(|l| !l.contains(TERMINATION_SENTINEL))
        .filter(|l| l.contains(TRAINER_MARKER))
        .map(|l| {
            let marker = format!("{} ", TRAINER_MARKER);
            match l.split_once(&marker) {
                Some((_, text)) => text.split(&marker).next().unwrap_or(text).trim_end().to_string(),
                None => String::new(),
            }
        })
        .collect()
}

/// Extract the confusion matrix from the engine's console output
pub fn parse_cross_validation(lines: &[String]) -> PipelineResult<ConfusionMatrix> {
    let collected = trainer_lines(lines);
    if collected.len() < 4 {
        return Err(PipelineError::ExternalProcess(format!(
            "cross-validation section has {} trainer lines, expected at least 4",
            collected.len()
        )));
    }

    let field = |line: usize, idx: usize| -> PipelineResult<f64> {
        let text = &collected[line];
        let raw = text.split_whitespace().nth(idx).ok_or_else(|| {
            PipelineError::ExternalProcess(format!("missing field {} in '{}'", idx, text))
        })?;
        raw.trim_end_matches('%').parse().map_err(|_| {
            PipelineError::ExternalProcess(format!("field {} of '{}' is not numeric", idx, text))
        })
    };

    Ok(ConfusionMatrix {
        class1_true_negative: field(2, 2)?,
        class1_false_positive: field(2, 3)?,
        class2_false_negative: field(3, 2)?,
        class2_true_positive: field(3, 3)?,
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn ratio(what: &str, num: f64, den: f64) -> PipelineResult<f64> {
    if den == 0.0 {
        return Err(PipelineError::MetricComputation(what.to_string()));
    }
    Ok(num / den)
}

/// Per-class precision, sensitivity and F1 plus overall accuracy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierScore {
    /// Percent, rounded to 2 decimals
    pub accuracy: f64,
    pub precision1: f64,
    pub sensitivity1: f64,
    pub f1_1: f64,
    pub precision2: f64,
    pub sensitivity2: f64,
    pub f1_2: f64,
}

impl ClassifierScore {
    /// Derive every metric from a confusion matrix
    ///
    /// Ratios are rounded to 2 decimals before F1 is computed from them.
    pub fn from_matrix(m: &ConfusionMatrix) -> PipelineResult<Self> {
        let tn = m.class1_true_negative;
        let fp = m.class1_false_positive;
        let fn_ = m.class2_false_negative;
        let tp = m.class2_true_positive;

        let precision1 = round2(ratio("class 1 precision", tn, tn + fn_)?);
        let sensitivity1 = round2(ratio("class 1 sensitivity", tn, tn + fp)?);
        let precision2 = round2(ratio("class 2 precision", tp, tp + fp)?);
        let sensitivity2 = round2(ratio("class 2 sensitivity", tp, tp + fn_)?);
        let accuracy = round2(100.0 * ratio("accuracy", tn + tp, tn + fp + fn_ + tp)?);
        let f1_1 = round2(ratio(
            "class 1 F1 score",
            2.0 * precision1 * sensitivity1,
            precision1 + sensitivity1,
        )?);
        let f1_2 = round2(ratio(
            "class 2 F1 score",
            2.0 * precision2 * sensitivity2,
            precision2 + sensitivity2,
        )?);

        Ok(Self {
            accuracy,
            precision1,
            sensitivity1,
            f1_1,
            precision2,
            sensitivity2,
            f1_2,
        })
    }

    /// Parse an engine run into a score
    pub fn from_run(run: &EngineRun) -> PipelineResult<Self> {
        Self::from_matrix(&parse_cross_validation(&run.lines)?)
    }

    /// Human-readable score report
    pub fn message(&self) -> String {
        format!(
            "Overall accuracy : {}%\n\
             Class 1 | Precision  : {} | Sensitivity : {} | F_1 Score : {}\n\
             Class 2 | Precision  : {} | Sensitivity : {} | F_1 Score : {}",
            display_number(self.accuracy),
            display_number(self.precision1),
            display_number(self.sensitivity1),
            display_number(self.f1_1),
            display_number(self.precision2),
            display_number(self.sensitivity2),
            display_number(self.f1_2),
        )
    }
}

/// Always show a decimal point: 80 -> "80.0", 0.8 -> "0.8"
pub fn display_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;

    impl EngineRun {
        pub(crate) fn from_lines<I, S>(lines: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            let mut run = EngineRun::default();
            for line in lines {
                let line = line.into();
                if line.contains(TERMINATION_SENTINEL) {
                    run.terminated = true;
                }
                run.lines.push(line);
            }
            run
        }
    }

    /// Console output of a training run with the given confusion rows
    pub(crate) fn training_output(row1: (f64, f64), row2: (f64, f64)) -> Vec<String> {
        vec![
            "[  INF  ] Loading scenario".to_string(),
            "[  INF  ] At time 0.5 sec <Box algorithm::(0x1) aka Classifier trainer> Received train stimulation".to_string(),
            "[  INF  ] At time 9.1 sec <Box algorithm::(0x1) aka Classifier trainer> Cross-validation test accuracy is 75.00% (sigma = 4.1%)".to_string(),
            "[  INF  ] At time 9.1 sec <Box algorithm::(0x1) aka Classifier trainer> Cls vs cls 1 2".to_string(),
            format!("[  INF  ] At time 9.1 sec <Box algorithm::(0x1) aka Classifier trainer> Target 1: {} {} %, 40 examples", row1.0, row1.1),
            format!("[  INF  ] At time 9.1 sec <Box algorithm::(0x1) aka Classifier trainer> Target 2: {} {} %, 40 examples", row2.0, row2.1),
            "[  INF  ] Application terminated, releasing allocated objects".to_string(),
        ]
    }

    #[test]
    fn test_parse_cross_validation() {
        let lines = training_output((80.0, 20.0), (30.0, 70.0));
        let m = parse_cross_validation(&lines).unwrap();
        assert_eq!(m.class1_true_negative, 80.0);
        assert_eq!(m.class1_false_positive, 20.0);
        assert_eq!(m.class2_false_negative, 30.0);
        assert_eq!(m.class2_true_positive, 70.0);
    }

    #[test]
    fn test_lines_before_marker_are_ignored() {
        let lines = training_output((80.0, 20.0), (30.0, 70.0));
        let collected = trainer_lines(&lines);
        assert_eq!(collected.len(), 4);
        assert!(collected[0].starts_with("Cross-validation test"));
        assert_eq!(collected[2], "Target 1: 80 20 %, 40 examples");
    }

    #[test]
    fn test_score_metrics() {
        let m = ConfusionMatrix {
            class1_true_negative: 80.0,
            class1_false_positive: 20.0,
            class2_false_negative: 30.0,
            class2_true_positive: 70.0,
        };
        let score = ClassifierScore::from_matrix(&m).unwrap();
        assert_relative_eq!(score.accuracy, 75.0);
        assert_relative_eq!(score.precision1, 0.73); // 80/110
        assert_relative_eq!(score.sensitivity1, 0.8);
        assert_relative_eq!(score.precision2, 0.78); // 70/90
        assert_relative_eq!(score.sensitivity2, 0.7);
        // F1 from the rounded ratios: 2*0.73*0.8/1.53 = 0.7634
        assert_relative_eq!(score.f1_1, 0.76);
        assert_relative_eq!(score.f1_2, 0.74);

        let msg = score.message();
        assert!(msg.starts_with("Overall accuracy : 75.0%\n"));
        assert!(msg.contains("Class 1 | Precision  : 0.73 | Sensitivity : 0.8 | F_1 Score : 0.76"));
    }

    #[test]
    fn test_zero_denominator() {
        let m = ConfusionMatrix {
            class1_true_negative: 0.0,
            class1_false_positive: 50.0,
            class2_false_negative: 0.0,
            class2_true_positive: 50.0,
        };
        assert!(matches!(
            ClassifierScore::from_matrix(&m),
            Err(PipelineError::MetricComputation(_))
        ));
    }

    #[test]
    fn test_missing_section_is_external_error() {
        let run = EngineRun::from_lines(["[  INF  ] Application terminated"]);
        assert!(run.terminated);
        assert!(matches!(
            ClassifierScore::from_run(&run),
            Err(PipelineError::ExternalProcess(_))
        ));
    }

    #[test]
    fn test_missing_designer_is_external_error() {
        let mut engine = DesignerProcess::new("/nonexistent/openvibe-designer.sh");
        assert!(matches!(
            engine.run_scenario(Path::new("sc2-extract.xml")),
            Err(PipelineError::ExternalProcess(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_lingering_engine_is_killed_after_termination() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let designer = dir.path().join("designer.sh");
        std::fs::write(
            &designer,
            "#!/bin/sh\necho 'Loading scenario'\necho 'Application terminated, releasing allocated objects'\nsleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&designer, std::fs::Permissions::from_mode(0o755)).unwrap();

        let started = Instant::now();
        let run = DesignerProcess::new(&designer)
            .run_scenario(Path::new("sc3-train.xml"))
            .unwrap();
        assert!(run.terminated);
        assert_eq!(run.lines.len(), 2);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
