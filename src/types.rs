// types.rs - Shared enums and small records
//
// Pipeline kinds, experimental conditions and the user-declared
// (channel, frequency) features that drive classifier training.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{FeatureViolation, PipelineError, PipelineResult};

// ============================================================================
// Enums
// ============================================================================

/// BCI pipelines the toolchain knows how to configure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineKind {
    PowSpectrumGraz,
    Connectivity,
}

impl PipelineKind {
    /// Key used in params.json ("pipelineType")
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::PowSpectrumGraz => "PowSpectrumGraz",
            PipelineKind::Connectivity => "Connectivity",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PowSpectrumGraz" => Some(PipelineKind::PowSpectrumGraz),
            "Connectivity" => Some(PipelineKind::Connectivity),
            _ => None,
        }
    }

    pub fn all() -> Vec<PipelineKind> {
        vec![PipelineKind::PowSpectrumGraz, PipelineKind::Connectivity]
    }
}

/// One of the two experimental conditions being contrasted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Class1,
    Class2,
}

impl Condition {
    pub fn all() -> [Condition; 2] {
        [Condition::Class1, Condition::Class2]
    }

    /// Parameter key holding this condition's label
    pub fn parameter_key(&self) -> &'static str {
        match self {
            Condition::Class1 => "Class1",
            Condition::Class2 => "Class2",
        }
    }
}

// ============================================================================
// Features
// ============================================================================

/// Frequency part of a feature: one bin or an inclusive range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencySpec {
    Single(u32),
    Range(u32, u32),
}

impl FrequencySpec {
    pub fn low(&self) -> u32 {
        match *self {
            FrequencySpec::Single(f) => f,
            FrequencySpec::Range(lo, _) => lo,
        }
    }

    pub fn high(&self) -> u32 {
        match *self {
            FrequencySpec::Single(f) => f,
            FrequencySpec::Range(_, hi) => hi,
        }
    }
}

impl fmt::Display for FrequencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrequencySpec::Single(freq) => write!(f, "{}", freq),
            FrequencySpec::Range(lo, hi) => write!(f, "{}:{}", lo, hi),
        }
    }
}

/// A validated (channel, frequency) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature {
    pub channel: String,
    pub frequency: FrequencySpec,
}

impl Feature {
    /// Parse and validate one "<channel>;<freq>" or "<channel>;<lo>:<hi>" spec
    ///
    /// `position` is 1-based and only used for error reporting.
    /// Frequencies must lie in `[0, max_frequency]`.
    pub fn parse(
        spec: &str,
        position: usize,
        electrodes: &[String],
        max_frequency: u32,
    ) -> PipelineResult<Self> {
        let fail = |violation| PipelineError::Validation { position, violation };

        let spec = spec.trim();
        if spec.is_empty() {
            return Err(fail(FeatureViolation::Empty));
        }

        let parts: Vec<&str> = spec.split(';').collect();
        let (chan, freq_str) = match parts.as_slice() {
            [chan, freq] if !chan.is_empty() && !freq.is_empty() => (*chan, *freq),
            _ => return Err(fail(FeatureViolation::Malformed(spec.to_string()))),
        };

        if !electrodes.iter().any(|e| e == chan) {
            return Err(fail(FeatureViolation::UnknownChannel(chan.to_string())));
        }

        let mut freqs = Vec::with_capacity(2);
        for freq in freq_str.split(':') {
            if freq.is_empty() || !freq.chars().all(|c| c.is_ascii_digit()) {
                return Err(fail(FeatureViolation::NonIntegerFrequency(freq.to_string())));
            }
            let value: u32 = freq
                .parse()
                .map_err(|_| fail(FeatureViolation::NonIntegerFrequency(freq.to_string())))?;
            if value > max_frequency {
                return Err(fail(FeatureViolation::FrequencyOutOfRange {
                    value,
                    max: max_frequency,
                }));
            }
            freqs.push(value);
        }

        let frequency = match freqs.as_slice() {
            [single] => FrequencySpec::Single(*single),
            [lo, hi] if lo <= hi => FrequencySpec::Range(*lo, *hi),
            [lo, hi] => {
                return Err(fail(FeatureViolation::ReversedRange { low: *lo, high: *hi }));
            }
            _ => return Err(fail(FeatureViolation::Malformed(spec.to_string()))),
        };

        Ok(Self {
            channel: chan.to_string(),
            frequency,
        })
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.channel, self.frequency)
    }
}

/// Validate every feature spec against the recorded layout
///
/// The highest usable bin is `floor(sampling_frequency / 2)`. The first
/// invalid entry short-circuits the whole list.
pub fn validate_features(
    specs: &[String],
    sampling_frequency: u32,
    electrodes: &[String],
) -> PipelineResult<Vec<Feature>> {
    let max_frequency = sampling_frequency / 2;
    specs
        .iter()
        .enumerate()
        .map(|(idx, spec)| Feature::parse(spec, idx + 1, electrodes, max_frequency))
        .collect()
}

/// Human-readable list used in training reports
pub fn describe_features(features: &[Feature]) -> String {
    let mut text = String::from("Using spectral features:\n");
    for feat in features {
        text.push_str(&format!("\tChannel {} at {} Hz\n", feat.channel, feat.frequency));
    }
    text
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn electrodes() -> Vec<String> {
        ["C3", "Cz", "FCz"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_and_range_features() {
        let specs = vec!["FCz;14".to_string(), "C3;14:22".to_string()];
        let feats = validate_features(&specs, 500, &electrodes()).unwrap();
        assert_eq!(feats[0].frequency, FrequencySpec::Single(14));
        assert_eq!(feats[1].frequency, FrequencySpec::Range(14, 22));
        assert_eq!(feats[1].to_string(), "C3;14:22");
    }

    #[test]
    fn test_unknown_channel_reports_position() {
        let specs = vec!["C4;22".to_string()];
        let err = validate_features(&specs, 500, &electrodes()).unwrap_err();
        match err {
            PipelineError::Validation { position, violation } => {
                assert_eq!(position, 1);
                assert_eq!(violation, FeatureViolation::UnknownChannel("C4".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_first_invalid_entry_short_circuits() {
        let specs = vec![
            "Cz;10".to_string(),
            "".to_string(),
            "Foo;10".to_string(),
        ];
        let err = validate_features(&specs, 500, &electrodes()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Validation { position: 2, violation: FeatureViolation::Empty }
        ));
    }

    #[test]
    fn test_frequency_bounds() {
        // 500 Hz sampling -> bins 0..=250
        let ok = validate_features(&["Cz;250".to_string()], 500, &electrodes());
        assert!(ok.is_ok());

        let err = validate_features(&["Cz;251".to_string()], 500, &electrodes()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Validation {
                violation: FeatureViolation::FrequencyOutOfRange { value: 251, max: 250 },
                ..
            }
        ));
    }

    #[test]
    fn test_non_integer_and_reversed() {
        let err = validate_features(&["Cz;12.5".to_string()], 500, &electrodes()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Validation { violation: FeatureViolation::NonIntegerFrequency(_), .. }
        ));

        let err = validate_features(&["Cz;22:14".to_string()], 500, &electrodes()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Validation {
                violation: FeatureViolation::ReversedRange { low: 22, high: 14 },
                ..
            }
        ));
    }

    #[test]
    fn test_pipeline_kind_round_trip_names() {
        for kind in PipelineKind::all() {
            assert_eq!(PipelineKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(PipelineKind::from_str("unknown"), None);
    }
}
