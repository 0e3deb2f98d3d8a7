// config.rs - Parameters, pipeline registry and workspace layout
//
// The parameter dictionary is a flat JSON object persisted as
// generated/params.json. Values are kept loosely typed on disk and parsed
// at the point of use, so a bad value is reported against its key.
//
// The registry holds pipeline definitions, parameter labels and template
// scenario names. It is built once at startup and passed explicitly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::electrodes::MatchMode;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{Condition, PipelineKind};

// ============================================================================
// Parameter dictionary
// ============================================================================

/// Parameter selecting lenient or strict electrode matching during analysis
pub const ELECTRODE_MATCH: &str = "ElectrodeMatch";

/// Flat string-keyed parameter table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterDict {
    values: BTreeMap<String, Value>,
}

impl ParameterDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let text = fs::read_to_string(path)?;
        let dict: ParameterDict = serde_json::from_str(&text)?;
        log::debug!("Loaded {} parameters from {:?}", dict.len(), path);
        Ok(dict)
    }

    /// Save as pretty-printed JSON
    pub fn save(&self, path: &Path) -> PipelineResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Set a value, returning true when it differs from the previous one
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> bool {
        let value = value.into();
        let changed = self
            .values
            .get(key)
            .map(|old| value_to_string(old) != value_to_string(&value))
            .unwrap_or(true);
        self.values.insert(key.to_string(), value);
        changed
    }

    /// Raw string form of a value, whatever its JSON type
    pub fn get_str(&self, key: &str) -> PipelineResult<String> {
        self.values
            .get(key)
            .map(value_to_string)
            .ok_or_else(|| PipelineError::invalid_parameter(key, "missing"))
    }

    /// Parse a value as a float, accepting numbers or numeric strings
    pub fn get_f64(&self, key: &str) -> PipelineResult<f64> {
        let raw = self.get_str(key)?;
        let value: f64 = raw
            .trim()
            .parse()
            .map_err(|_| PipelineError::invalid_parameter(key, format!("'{}' is not a number", raw)))?;
        if !value.is_finite() {
            return Err(PipelineError::invalid_parameter(key, "must be finite"));
        }
        Ok(value)
    }

    /// Label of one experimental condition ("Class1" / "Class2")
    pub fn class_label(&self, condition: Condition) -> PipelineResult<String> {
        let label = self.get_str(condition.parameter_key())?;
        if label.trim().is_empty() {
            return Err(PipelineError::invalid_parameter(condition.parameter_key(), "empty label"));
        }
        Ok(label)
    }

    pub fn pipeline_kind(&self) -> PipelineResult<PipelineKind> {
        let raw = self.get_str("pipelineType")?;
        PipelineKind::from_str(&raw).ok_or_else(|| {
            PipelineError::invalid_parameter("pipelineType", format!("unknown pipeline '{}'", raw))
        })
    }

    /// How analysis treats channels missing from the canonical montage
    /// ("ElectrodeMatch", lenient unless set)
    pub fn electrode_match(&self) -> PipelineResult<MatchMode> {
        if !self.contains(ELECTRODE_MATCH) {
            return Ok(MatchMode::default());
        }
        let raw = self.get_str(ELECTRODE_MATCH)?;
        MatchMode::from_str(&raw).ok_or_else(|| {
            PipelineError::invalid_parameter(ELECTRODE_MATCH, format!("expected lenient or strict, got '{}'", raw))
        })
    }

    /// Path to the external engine launcher ("ovDesignerPath")
    pub fn designer_path(&self) -> PipelineResult<PathBuf> {
        let raw = self.get_str("ovDesignerPath")?;
        if raw.trim().is_empty() {
            return Err(PipelineError::invalid_parameter("ovDesignerPath", "empty path"));
        }
        Ok(PathBuf::from(raw))
    }

    /// Every entry as (name, string value), for scenario setting substitution
    pub fn setting_pairs(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect()
    }

    /// Apply "key=value" overrides, returning the keys whose value changed
    pub fn apply_overrides(&mut self, overrides: &[(String, String)]) -> Vec<String> {
        overrides
            .iter()
            .filter_map(|(k, v)| {
                if self.set(k, v.clone()) {
                    Some(k.clone())
                } else {
                    None
                }
            })
            .collect()
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parse a "key=value" command-line override
pub fn parse_override(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

// ============================================================================
// Pipeline registry
// ============================================================================

/// Scenario file names copied from a pipeline's template directory
#[derive(Debug, Clone)]
pub struct TemplateScenarios {
    pub monitor: &'static str,
    pub extract: &'static str,
    pub train: &'static str,
    pub online: &'static str,
    pub stimulations: &'static str,
    pub metadata: &'static str,
}

/// Static description of one BCI pipeline
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub kind: PipelineKind,
    pub description: &'static str,
    pub template_dir: &'static str,
    pub acquisition_defaults: Vec<(&'static str, Value)>,
    pub extraction_defaults: Vec<(&'static str, Value)>,
}

impl PipelineDefinition {
    /// Keys the user may tune before extraction
    pub fn extraction_keys(&self) -> Vec<&'static str> {
        self.extraction_defaults.iter().map(|(k, _)| *k).collect()
    }
}

/// Immutable registry of pipelines, labels and template names
#[derive(Debug, Clone)]
pub struct PipelineRegistry {
    pipelines: Vec<PipelineDefinition>,
    labels: BTreeMap<&'static str, &'static str>,
    pub templates: TemplateScenarios,
}

impl PipelineRegistry {
    /// The built-in registry
    pub fn standard() -> Self {
        let acquisition = || {
            vec![
                ("TrialNb", Value::from(20)),
                ("Class1", Value::from("LEFT")),
                ("Class2", Value::from("RIGHT")),
                ("Baseline", Value::from(20)),
                ("TrialWait", Value::from(3)),
                ("TrialLength", Value::from(3)),
                ("EndTrialMin", Value::from(2.5)),
                ("EndTrialMax", Value::from(3.5)),
                ("FeedbackLength", Value::from(3)),
            ]
        };

        let pipelines = vec![
            PipelineDefinition {
                kind: PipelineKind::PowSpectrumGraz,
                description: "GrazBCI - Power Spectrum Features (2 classes)",
                template_dir: "spectralpower-templates",
                acquisition_defaults: acquisition(),
                extraction_defaults: vec![
                    ("StimulationEpoch", Value::from(3)),
                    ("StimulationDelay", Value::from(0)),
                    ("TimeWindowLength", Value::from(0.25)),
                    ("TimeWindowShift", Value::from(0.161)),
                    ("AutoRegressiveOrderTime", Value::from(0.038)),
                    ("FreqRes", Value::from(1)),
                ],
            },
            PipelineDefinition {
                kind: PipelineKind::Connectivity,
                description: "GrazBCI - Connectivity Features",
                template_dir: "connectivity-templates",
                acquisition_defaults: acquisition(),
                extraction_defaults: vec![
                    ("StimulationEpoch", Value::from(1.5)),
                    ("StimulationDelay", Value::from(0)),
                    ("ConnectivityMetric", Value::from("MSC")),
                    ("WelchLength", Value::from(4)),
                    ("WelchOverlap", Value::from(50)),
                    ("WindowMethod", Value::from("Hann")),
                    ("WelchWinLength", Value::from(0.25)),
                    ("WelchWinOverlap", Value::from(50)),
                    ("FftSize", Value::from(256)),
                ],
            },
        ];

        let labels = BTreeMap::from([
            ("TrialNb", "Nb Trials per class"),
            ("Class1", "Class / Stimulation 1"),
            ("Class2", "Class / Stimulation 2"),
            ("Baseline", "\"Get Set\" time (s)"),
            ("TrialWait", "Pre-Stimulus time (s)"),
            ("TrialLength", "Trial duration (s)"),
            ("EndTrialMin", "Inter-trial interval min (s)"),
            ("EndTrialMax", "Inter-trial interval max (s)"),
            ("FeedbackLength", "Feedback time (s) (online scenario)"),
            ("StimulationEpoch", "Epoch of Interest (EOI) (s)"),
            ("StimulationDelay", "EOI offset (s)"),
            ("TimeWindowLength", "Sliding Window (Burg) (s)"),
            ("TimeWindowShift", "Overlap (Burg) (s)"),
            ("AutoRegressiveOrderTime", "Auto-regressive estim. length (s)"),
            ("FreqRes", "Frequency resolution (Hz)"),
            ("ConnectivityMetric", "Connectivity Metric (MSC or IMCOH)"),
            ("WelchLength", "Length of a Connectivity estimation (s)"),
            ("WelchOverlap", "Connectivity estimation overlapping (%)"),
            ("WindowMethod", "Welch sliding window (Hann or Hamming)"),
            ("WelchWinLength", "Welch sliding window length (s)"),
            ("WelchWinOverlap", "Welch sliding window overlap (%)"),
            ("FftSize", "Connectivity: FFT Size"),
        ]);

        Self {
            pipelines,
            labels,
            templates: TemplateScenarios {
                monitor: "sc1-monitor-acq.xml",
                extract: "sc2-extract.xml",
                train: "sc2-train-composite.xml",
                online: "sc3-online.xml",
                stimulations: "mi-stimulations.lua",
                metadata: "toolbox-generate-metadata.xml",
            },
        }
    }

    pub fn definition(&self, kind: PipelineKind) -> &PipelineDefinition {
        // Every PipelineKind variant is registered in standard()
        self.pipelines
            .iter()
            .find(|p| p.kind == kind)
            .unwrap_or(&self.pipelines[0])
    }

    pub fn definitions(&self) -> &[PipelineDefinition] {
        &self.pipelines
    }

    /// Display label of a parameter, when one is registered
    pub fn label(&self, key: &str) -> Option<&'static str> {
        self.labels.get(key).copied()
    }

    /// Fresh parameter dictionary for a pipeline
    pub fn default_parameters(&self, kind: PipelineKind, designer: &Path) -> ParameterDict {
        let def = self.definition(kind);
        let mut dict = ParameterDict::new();
        dict.set("pipelineType", kind.as_str());
        dict.set("ovDesignerPath", designer.to_string_lossy().to_string());
        for (key, value) in def.acquisition_defaults.iter().chain(&def.extraction_defaults) {
            dict.set(key, value.clone());
        }
        dict
    }
}

// ============================================================================
// Workspace layout
// ============================================================================

/// Generated-artifact directory layout rooted at the project folder
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn generated(&self) -> PathBuf {
        self.root.join("generated")
    }

    pub fn signals(&self) -> PathBuf {
        self.generated().join("signals")
    }

    pub fn analysis(&self) -> PathBuf {
        self.signals().join("analysis")
    }

    pub fn training(&self) -> PathBuf {
        self.signals().join("training")
    }

    /// Numeric arrays exported for plotting
    pub fn figures(&self) -> PathBuf {
        self.generated().join("figures")
    }

    pub fn params_path(&self) -> PathBuf {
        self.generated().join("params.json")
    }

    /// Canonical location of the promoted classifier weights
    pub fn final_weights(&self) -> PathBuf {
        self.generated().join("classifier-weights.xml")
    }

    /// A scenario file inside generated/
    pub fn scenario(&self, name: &str) -> PathBuf {
        self.generated().join(name)
    }

    pub fn template_dir(&self, def: &PipelineDefinition) -> PathBuf {
        self.root.join(def.template_dir)
    }

    /// Create every directory of the layout
    pub fn ensure_layout(&self) -> PipelineResult<()> {
        for dir in [self.generated(), self.signals(), self.analysis(), self.training()] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Remove intermediate CSV/XML files left by a previous extraction
    pub fn delete_work_files(&self) -> PipelineResult<usize> {
        let mut removed = 0;
        for (dir, exts) in [
            (self.analysis(), &["csv"][..]),
            (self.training(), &["csv", "xml"][..]),
        ] {
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                let matches = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| exts.contains(&e))
                    .unwrap_or(false);
                if matches {
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        log::info!("Deleted {} stale work files", removed);
        Ok(removed)
    }
}

/// Remove an output the engine is about to regenerate
///
/// A file left over from an earlier run would otherwise pass the
/// post-run existence check even if the engine failed to write it.
pub fn remove_stale(path: &Path) -> PipelineResult<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            log::debug!("Removed stale {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Tests
// ============================================================================
