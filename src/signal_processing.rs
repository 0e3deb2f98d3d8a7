// signal_processing.rs - Trial/window reshaping of spectral exports
//
// An export holds one row per analysis window and one column per
// (channel, bin). Consecutive blocks of `window_count` rows form a trial.
// This module turns that flat table into
//   time-frequency tensor [trial, channel, bin, window]
//   power tensor          [trial, channel, bin]   (mean over windows)

use ndarray::{concatenate, s, Array1, Array2, Array3, Array4, ArrayView, Axis, Dimension, RemoveAxis};
use statrs::statistics::Statistics;
use std::path::Path;

use crate::error::{PipelineError, PipelineResult};

/// Number of analysis windows in one trial
///
/// `round((trial_duration - window_length) / window_shift)`. Every trial and
/// window count in the crate goes through this function.
pub fn window_count(trial_duration: f64, window_length: f64, window_shift: f64) -> PipelineResult<usize> {
    if !(window_shift > 0.0) {
        return Err(PipelineError::invalid_parameter(
            "TimeWindowShift",
            format!("must be positive, got {}", window_shift),
        ));
    }
    if !(window_length < trial_duration) {
        return Err(PipelineError::invalid_parameter(
            "TimeWindowLength",
            format!("{} must be shorter than the trial ({} s)", window_length, trial_duration),
        ));
    }
    if window_length <= 0.0 {
        return Err(PipelineError::invalid_parameter(
            "TimeWindowLength",
            format!("must be positive, got {}", window_length),
        ));
    }

    let count = ((trial_duration - window_length) / window_shift).round() as usize;
    if count == 0 {
        return Err(PipelineError::invalid_parameter(
            "TimeWindowShift",
            format!("{} s leaves no complete window in a {} s trial", window_shift, trial_duration),
        ));
    }
    Ok(count)
}

/// Windowing parameters shared by every export of one analysis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowConfig {
    /// Trial duration in seconds
    pub trial_duration: f64,
    pub window_length: f64,
    pub window_shift: f64,
    windows: usize,
}

impl WindowConfig {
    /// Validate the parameters and fix the window count once
    pub fn new(trial_duration: f64, window_length: f64, window_shift: f64) -> PipelineResult<Self> {
        let windows = window_count(trial_duration, window_length, window_shift)?;
        Ok(Self {
            trial_duration,
            window_length,
            window_shift,
            windows,
        })
    }

    pub fn window_count(&self) -> usize {
        self.windows
    }

    /// Window start times within one trial: [0, shift, 2*shift, ...]
    pub fn time_vector(&self) -> Array1<f64> {
        Array1::from_iter((0..self.windows).map(|i| i as f64 * self.window_shift))
    }

    /// Slice a flat export body into per-trial tensors
    ///
    /// # Arguments
    /// * `body` - [rows x (channels * bins)], channel-major columns
    /// * `channels` - Channel count
    /// * `bins` - Frequency bins per channel
    /// * `source` - File the body came from, for error reporting
    ///
    /// # Returns
    /// (power[trial, ch, bin], timefreq[trial, ch, bin, window])
    pub fn reshape(
        &self,
        body: &Array2<f64>,
        channels: usize,
        bins: usize,
        source: &Path,
    ) -> PipelineResult<TrialTensors> {
        let (rows, cols) = body.dim();
        if cols != channels * bins {
            return Err(PipelineError::format(
                source,
                format!("{} feature columns, expected {} channels x {} bins", cols, channels, bins),
            ));
        }

        let windows = self.windows;
        let trials = rows / windows;
        if trials == 0 {
            return Err(PipelineError::InsufficientData {
                what: "a complete trial".to_string(),
                needed: windows,
                got: rows,
            });
        }
        let leftover = rows - trials * windows;
        if leftover > 0 {
            log::warn!(
                "Dropping {} trailing rows that do not fill a trial of {} windows",
                leftover,
                windows
            );
        }

        // timefreq[t, c, b, w] = body[t * windows + w, c * bins + b]
        let timefreq = Array4::from_shape_fn((trials, channels, bins, windows), |(t, c, b, w)| {
            body[[t * windows + w, c * bins + b]]
        });
        let power = timefreq.map_axis(Axis(3), |lane| lane.iter().mean());

        Ok(TrialTensors { power, timefreq })
    }
}

/// Reshaped trials of one export (or of several concatenated exports)
#[derive(Debug, Clone, PartialEq)]
pub struct TrialTensors {
    pub power: Array3<f64>,
    pub timefreq: Array4<f64>,
}

impl TrialTensors {
    /// Concatenate trials from several runs along the trial axis
    pub fn concat(parts: &[TrialTensors]) -> PipelineResult<TrialTensors> {
        let power = concat_trials(parts.iter().map(|p| p.power.view()).collect())?;
        let timefreq = concat_trials(parts.iter().map(|p| p.timefreq.view()).collect())?;
        Ok(TrialTensors { power, timefreq })
    }
}

fn concat_trials<D>(views: Vec<ArrayView<'_, f64, D>>) -> PipelineResult<ndarray::Array<f64, D>>
where
    D: Dimension + RemoveAxis,
{
    if views.is_empty() {
        return Err(PipelineError::InsufficientData {
            what: "runs to concatenate".to_string(),
            needed: 1,
            got: 0,
        });
    }
    concatenate(Axis(0), &views)
        .map_err(|e| PipelineError::consistency("trial tensor shape", e.to_string(), "matching runs"))
}

/// Mean and population standard deviation across trials, per channel and bin
pub fn trial_mean_std(power: &Array3<f64>) -> (Array2<f64>, Array2<f64>) {
    let mean = power.map_axis(Axis(0), |lane| lane.iter().mean());
    let std = power.map_axis(Axis(0), |lane| lane.iter().population_std_dev());
    (mean, std)
}

/// Restrict a [.., bin] map to bins `low..=high`
pub fn bin_range(map: &Array2<f64>, low: usize, high: usize) -> Array2<f64> {
    map.slice(s![.., low..=high]).to_owned()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    impl TrialTensors {
        fn trial_count(&self) -> usize {
            self.power.len_of(Axis(0))
        }
    }

    #[test]
    fn test_window_count_formula() {
        assert_eq!(window_count(1.0, 0.25, 0.161).unwrap(), 5);
        assert_eq!(window_count(3.0, 0.25, 0.161).unwrap(), 17);
        assert_eq!(window_count(1.5, 0.5, 0.25).unwrap(), 4);
    }

    #[test]
    fn test_invalid_window_parameters() {
        assert!(matches!(
            window_count(1.0, 0.25, 0.0),
            Err(PipelineError::InvalidParameter { .. })
        ));
        assert!(matches!(
            window_count(1.0, 0.25, -0.1),
            Err(PipelineError::InvalidParameter { .. })
        ));
        assert!(matches!(
            window_count(1.0, 1.0, 0.1),
            Err(PipelineError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_reshape_two_trials_three_channels_four_bins() {
        // Time:3x4:500, two 1 s trials, 0.25 s windows shifted by 0.161 s
        let config = WindowConfig::new(1.0, 0.25, 0.161).unwrap();
        let rows = 2 * config.window_count();
        let body = Array2::from_shape_fn((rows, 12), |(r, c)| (r * 100 + c) as f64);

        let tensors = config.reshape(&body, 3, 4, Path::new("run1-LEFT.csv")).unwrap();
        assert_eq!(tensors.timefreq.shape(), &[2, 3, 4, 5]);
        assert_eq!(tensors.power.shape(), &[2, 3, 4]);

        // trial 1, channel 2, bin 1, window 3 -> row 8, column 9
        assert_eq!(tensors.timefreq[[1, 2, 1, 3]], 809.0);
        // power is the window mean: rows 5..10 -> mean row index 7
        assert_relative_eq!(tensors.power[[1, 2, 1]], 709.0);
    }

    #[test]
    fn test_every_trial_has_same_window_count() {
        let config = WindowConfig::new(3.0, 0.25, 0.161).unwrap();
        let w = config.window_count();
        let body = Array2::zeros((4 * w + 3, 2));
        let tensors = config.reshape(&body, 1, 2, Path::new("run1-LEFT.csv")).unwrap();
        // trailing 3 rows dropped
        assert_eq!(tensors.timefreq.shape(), &[4, 1, 2, w]);
    }

    #[test]
    fn test_column_count_mismatch_is_format_error() {
        let config = WindowConfig::new(1.0, 0.25, 0.161).unwrap();
        let body = Array2::zeros((10, 7));
        assert!(matches!(
            config.reshape(&body, 2, 4, Path::new("odd.csv")),
            Err(PipelineError::Format { .. })
        ));
    }

    #[test]
    fn test_no_complete_trial() {
        let config = WindowConfig::new(1.0, 0.25, 0.161).unwrap();
        let body = Array2::zeros((4, 2));
        assert!(matches!(
            config.reshape(&body, 1, 2, Path::new("run1-LEFT.csv")),
            Err(PipelineError::InsufficientData { needed: 5, got: 4, .. })
        ));
    }

    #[test]
    fn test_time_vector() {
        let config = WindowConfig::new(1.0, 0.25, 0.161).unwrap();
        let t = config.time_vector();
        assert_eq!(t.len(), 5);
        assert_relative_eq!(t[0], 0.0);
        assert_relative_eq!(t[4], 0.644, epsilon = 1e-12);
    }

    #[test]
    fn test_concat_and_baseline_stats() {
        let config = WindowConfig::new(1.0, 0.25, 0.161).unwrap();
        let a = config.reshape(&Array2::from_elem((5, 2), 1.0), 1, 2, Path::new("a.csv")).unwrap();
        let b = config.reshape(&Array2::from_elem((10, 2), 3.0), 1, 2, Path::new("b.csv")).unwrap();

        let all = TrialTensors::concat(&[a, b]).unwrap();
        assert_eq!(all.trial_count(), 3);

        let (mean, std) = trial_mean_std(&all.power);
        assert_relative_eq!(mean[[0, 0]], 7.0 / 3.0, epsilon = 1e-12);
        // population std of [1, 3, 3]
        assert_relative_eq!(std[[0, 1]], (8.0f64 / 9.0).sqrt(), epsilon = 1e-12);
    }
}
