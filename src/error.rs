// error.rs - Error taxonomy for the feature pipeline
//
// Every failure is detected as close to its source as possible and carried
// as a PipelineError. The orchestration layer wraps these in anyhow for
// context, and the worker boundary turns them into a single message.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias for the numeric and IO core
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Reasons a user-entered feature spec is rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureViolation {
    Empty,
    Malformed(String),
    UnknownChannel(String),
    NonIntegerFrequency(String),
    FrequencyOutOfRange { value: u32, max: u32 },
    ReversedRange { low: u32, high: u32 },
}

impl std::fmt::Display for FeatureViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureViolation::Empty => write!(f, "is empty"),
            FeatureViolation::Malformed(text) => {
                write!(f, "({}) must be formatted as <channel>;<freq> or <channel>;<lo>:<hi>", text)
            }
            FeatureViolation::UnknownChannel(chan) => {
                write!(f, "uses channel {} which is not in the electrode list", chan)
            }
            FeatureViolation::NonIntegerFrequency(freq) => {
                write!(f, "has frequency ({}) with an invalid format, must be an integer", freq)
            }
            FeatureViolation::FrequencyOutOfRange { value, max } => {
                write!(f, "has frequency {} outside the acceptable range [0, {}]", value, max)
            }
            FeatureViolation::ReversedRange { low, high } => {
                write!(f, "has a reversed frequency range {}:{}", low, high)
            }
        }
    }
}

/// All failures the pipeline can report
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed file {path:?}: {reason}")]
    Format { path: PathBuf, reason: String },

    #[error("{what} mismatch: {left} vs {right}")]
    Consistency {
        what: String,
        left: String,
        right: String,
    },

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("insufficient data for {what}: need at least {needed}, got {got}")]
    InsufficientData {
        what: String,
        needed: usize,
        got: usize,
    },

    #[error("electrode list mismatch between {first:?} and {other:?}")]
    ElectrodeMismatch { first: PathBuf, other: PathBuf },

    #[error("feature {position} {violation}")]
    Validation {
        position: usize,
        violation: FeatureViolation,
    },

    #[error("cannot compute {0}: zero denominator in confusion matrix")]
    MetricComputation(String),

    #[error("external engine failure: {0}")]
    ExternalProcess(String),

    #[error("a worker is already running in this session")]
    WorkerBusy,

    #[error("illegal training state transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Shorthand for a format error on a given file
    pub fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a consistency error with displayable values
    pub fn consistency(
        what: impl Into<String>,
        left: impl std::fmt::Display,
        right: impl std::fmt::Display,
    ) -> Self {
        PipelineError::Consistency {
            what: what.into(),
            left: left.to_string(),
            right: right.to_string(),
        }
    }

    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
