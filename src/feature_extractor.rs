// feature_extractor.rs - Spectral feature analysis over extracted runs
//
// Loads the four spectral exports of every selected run, reshapes them into
// trial tensors, pools the trials of all runs and computes the contrast maps
// between the two conditions. The result is an immutable SpectralFeatures
// record from which the visualisation arrays are derived on demand.

use anyhow::{Context, Result};
use csv::Writer;
use ndarray::{Array1, Array2, Array3, Array4, Axis};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::ParameterDict;
use crate::data_loader::{ensure_consistent, DataLoader, SpectralExport, SpectralHeader};
use crate::electrodes::Reorderer;
use crate::error::{PipelineError, PipelineResult};
use crate::signal_processing::{bin_range, trial_mean_std, TrialTensors, WindowConfig};
use crate::statistics::{erd_ers, erd_ers_timefreq, psd_db, r_squared_map, wilcoxon_map};
use crate::types::Condition;
use crate::worker::Reporter;

// ============================================================================
// Analysis result
// ============================================================================

/// Pooled trials of one condition, channels in canonical order
#[derive(Debug, Clone)]
pub struct ConditionSpectra {
    pub label: String,
    /// [trial, channel, bin]
    pub power: Array3<f64>,
    /// [trial, channel, bin, window]
    pub timefreq: Array4<f64>,
    /// [channel, bin], over baseline trials
    pub baseline_mean: Array2<f64>,
    pub baseline_std: Array2<f64>,
}

/// Class-1 and class-2 power spectra of one electrode in dB
#[derive(Debug, Clone)]
pub struct PowerSpectrum {
    pub electrode: String,
    pub class1_mean: Array1<f64>,
    pub class1_std: Array1<f64>,
    pub class2_mean: Array1<f64>,
    pub class2_std: Array1<f64>,
}

/// Everything one analysis session derives from the selected runs
///
/// Contrast maps are signed so that positive values mean class 2 has more
/// power than class 1.
#[derive(Debug, Clone)]
pub struct SpectralFeatures {
    pub runs: Vec<String>,
    pub electrodes: Vec<String>,
    pub sampling_frequency: u32,
    pub frequency_resolution: f64,
    /// Frequency of each bin
    pub freqs: Array1<f64>,
    /// Window start times within a trial
    pub time: Array1<f64>,
    pub class1: ConditionSpectra,
    pub class2: ConditionSpectra,
    /// [channel, bin]
    pub r_squared: Array2<f64>,
    pub wilcoxon_z: Array2<f64>,
    pub wilcoxon_p: Array2<f64>,
}

impl SpectralFeatures {
    pub fn condition(&self, condition: Condition) -> &ConditionSpectra {
        match condition {
            Condition::Class1 => &self.class1,
            Condition::Class2 => &self.class2,
        }
    }

    pub fn bin_count(&self) -> usize {
        self.freqs.len()
    }

    /// Index of an electrode in the canonical order
    pub fn channel_index(&self, electrode: &str) -> PipelineResult<usize> {
        self.electrodes
            .iter()
            .position(|e| e == electrode)
            .ok_or_else(|| {
                PipelineError::invalid_parameter(
                    "electrode",
                    format!("'{}' is not among {}", electrode, self.electrodes.join(";")),
                )
            })
    }

    /// Bin holding `frequency` (Hz)
    pub fn bin_index(&self, frequency: f64) -> PipelineResult<usize> {
        let bin = (frequency / self.frequency_resolution).round();
        if frequency < 0.0 || bin as usize >= self.bin_count() {
            return Err(PipelineError::invalid_parameter(
                "frequency",
                format!("{} Hz is outside 0..{} bins", frequency, self.bin_count()),
            ));
        }
        Ok(bin as usize)
    }

    /// PSD curves of one electrode for both conditions
    pub fn psd(&self, electrode: &str) -> PipelineResult<PowerSpectrum> {
        let ch = self.channel_index(electrode)?;
        let (class1_mean, class1_std) = psd_db(&self.class1.power, ch)?;
        let (class2_mean, class2_std) = psd_db(&self.class2.power, ch)?;
        Ok(PowerSpectrum {
            electrode: electrode.to_string(),
            class1_mean,
            class1_std,
            class2_mean,
            class2_std,
        })
    }

    /// ERD/ERS time-frequency map of one electrode: [bin, window]
    pub fn erd_map(&self, electrode: &str, condition: Condition) -> PipelineResult<Array2<f64>> {
        let ch = self.channel_index(electrode)?;
        let spectra = self.condition(condition);
        erd_ers_timefreq(&spectra.timefreq, &spectra.baseline_mean, ch)
    }

    /// Trial-averaged ERD/ERS of every channel and bin
    pub fn erd(&self, condition: Condition) -> PipelineResult<Array2<f64>> {
        let spectra = self.condition(condition);
        let (mean, _) = trial_mean_std(&spectra.power);
        erd_ers(&mean, &spectra.baseline_mean)
    }

    /// Signed R² of every electrode at one frequency
    pub fn topography(&self, frequency: f64) -> PipelineResult<Vec<(String, f64)>> {
        let bin = self.bin_index(frequency)?;
        Ok(self
            .electrodes
            .iter()
            .cloned()
            .zip(self.r_squared.column(bin).iter().copied())
            .collect())
    }

    /// R² map restricted to `fmin..=fmax` Hz
    pub fn r_squared_band(&self, fmin: f64, fmax: f64) -> PipelineResult<Array2<f64>> {
        check_frequency_range(fmin, fmax, self.sampling_frequency)?;
        let low = self.bin_index(fmin)?;
        let high = self.bin_index(fmax.min(self.freqs[self.bin_count() - 1]))?;
        Ok(bin_range(&self.r_squared, low, high))
    }
}

/// Require `0 <= fmin < fmax <= fs/2 + 1`
pub fn check_frequency_range(fmin: f64, fmax: f64, sampling_frequency: u32) -> PipelineResult<()> {
    let limit = f64::from(sampling_frequency) / 2.0 + 1.0;
    if fmin < 0.0 || fmax > limit {
        return Err(PipelineError::invalid_parameter(
            "frequency range",
            format!("{}..{} Hz must lie within 0..{} Hz", fmin, fmax, limit),
        ));
    }
    if fmin >= fmax {
        return Err(PipelineError::invalid_parameter(
            "frequency range",
            format!("fmin {} must be below fmax {}", fmin, fmax),
        ));
    }
    Ok(())
}

// ============================================================================
// Loading
// ============================================================================

/// Builds SpectralFeatures from the exports in a workspace
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    pub loader: DataLoader,
    pub params: ParameterDict,
}

/// Per-condition tensors of one run before pooling
struct RunTensors {
    class1: TrialTensors,
    class2: TrialTensors,
    class1_baseline: TrialTensors,
    class2_baseline: TrialTensors,
}

impl FeatureExtractor {
    pub fn new(loader: DataLoader, params: ParameterDict) -> Self {
        Self { loader, params }
    }

    fn window_config(&self) -> PipelineResult<WindowConfig> {
        WindowConfig::new(
            self.params.get_f64("StimulationEpoch")?,
            self.params.get_f64("TimeWindowLength")?,
            self.params.get_f64("TimeWindowShift")?,
        )
    }

    /// Load and analyse the given runs, one progress unit per run plus one
    /// for the statistics
    pub fn load(&self, runs: &[String], reporter: &Reporter) -> Result<SpectralFeatures> {
        let start_time = Instant::now();
        if runs.is_empty() {
            return Err(PipelineError::InsufficientData {
                what: "runs to analyse".to_string(),
                needed: 1,
                got: 0,
            }
            .into());
        }

        let class1_label = self.params.class_label(Condition::Class1)?;
        let class2_label = self.params.class_label(Condition::Class2)?;
        let resolution = self.params.get_f64("FreqRes")?;
        if resolution <= 0.0 {
            return Err(PipelineError::invalid_parameter("FreqRes", "must be positive").into());
        }
        let windows = self.window_config()?;
        let match_mode = self.params.electrode_match()?;

        let total = runs.len() + 1;
        let mut reference: Option<SpectralHeader> = None;
        let mut tensors = Vec::with_capacity(runs.len());
        for (idx, run) in runs.iter().enumerate() {
            reporter.status(format!("Processing data for run {}", run));
            let loaded = self
                .load_run(run, &class1_label, &class2_label, &windows, &mut reference)
                .with_context(|| format!("loading spectra of {}", run))?;
            tensors.push(loaded);
            reporter.progress(idx + 1, total);
        }
        let header = reference.ok_or_else(|| PipelineError::InvalidData("no run loaded".to_string()))?;

        reporter.status("Computing statistics");
        let pool = |pick: fn(&RunTensors) -> &TrialTensors| -> PipelineResult<TrialTensors> {
            let parts: Vec<TrialTensors> = tensors.iter().map(|t| pick(t).clone()).collect();
            TrialTensors::concat(&parts)
        };
        let class1 = pool(|t| &t.class1)?;
        let class2 = pool(|t| &t.class2)?;
        let class1_baseline = pool(|t| &t.class1_baseline)?;
        let class2_baseline = pool(|t| &t.class2_baseline)?;

        // maps span every bin, the highest one included
        let r_squared = r_squared_map(&class2.power, &class1.power)?;
        let (wilcoxon_z, wilcoxon_p) = wilcoxon_map(&class2.power, &class1.power)?;

        let reorderer = Reorderer::for_source(&header.channels, match_mode);
        let source = &header.channels;
        let (r_squared, electrodes) = reorderer.reorder(&r_squared, Axis(0), source)?;
        let (wilcoxon_z, _) = reorderer.reorder(&wilcoxon_z, Axis(0), source)?;
        let (wilcoxon_p, _) = reorderer.reorder(&wilcoxon_p, Axis(0), source)?;

        let condition = |label: String, trials: &TrialTensors, baseline: &TrialTensors| -> PipelineResult<ConditionSpectra> {
            let (baseline_mean, baseline_std) = trial_mean_std(&baseline.power);
            Ok(ConditionSpectra {
                label,
                power: reorderer.reorder(&trials.power, Axis(1), source)?.0,
                timefreq: reorderer.reorder(&trials.timefreq, Axis(1), source)?.0,
                baseline_mean: reorderer.reorder(&baseline_mean, Axis(0), source)?.0,
                baseline_std: reorderer.reorder(&baseline_std, Axis(0), source)?.0,
            })
        };
        let class1 = condition(class1_label, &class1, &class1_baseline)?;
        let class2 = condition(class2_label, &class2, &class2_baseline)?;
        reporter.progress(total, total);

        let freqs = Array1::from_iter((0..header.bin_count).map(|b| b as f64 * resolution));
        log::info!(
            "Analysed {} runs ({} + {} trials, {} electrodes) in {:.2}s",
            runs.len(),
            class1.power.len_of(Axis(0)),
            class2.power.len_of(Axis(0)),
            electrodes.len(),
            start_time.elapsed().as_secs_f64()
        );

        Ok(SpectralFeatures {
            runs: runs.to_vec(),
            electrodes,
            sampling_frequency: header.sampling_frequency,
            frequency_resolution: resolution,
            freqs,
            time: windows.time_vector(),
            class1,
            class2,
            r_squared,
            wilcoxon_z,
            wilcoxon_p,
        })
    }

    /// Load one run's four exports, all checked against `reference`
    fn load_run(
        &self,
        run: &str,
        class1: &str,
        class2: &str,
        windows: &WindowConfig,
        reference: &mut Option<SpectralHeader>,
    ) -> PipelineResult<RunTensors> {
        let paths = self.loader.run_spectra(run, class1, class2);
        let mut reshaped = Vec::with_capacity(4);
        for path in [&paths.class1, &paths.class2, &paths.class1_baseline, &paths.class2_baseline] {
            let export = SpectralExport::load(path)?;
            if let Some(first) = reference.as_ref() {
                ensure_consistent(first, &export.header)?;
            } else {
                *reference = Some(export.header.clone());
            }
            reshaped.push(windows.reshape(
                &export.body,
                export.header.channel_count(),
                export.header.bin_count,
                &export.path,
            )?);
        }

        let mut it = reshaped.into_iter();
        match (it.next(), it.next(), it.next(), it.next()) {
            (Some(class1), Some(class2), Some(class1_baseline), Some(class2_baseline)) => Ok(RunTensors {
                class1,
                class2,
                class1_baseline,
                class2_baseline,
            }),
            _ => Err(PipelineError::InvalidData(format!("incomplete exports for {}", run))),
        }
    }
}

// ============================================================================
// CSV export
// ============================================================================

/// Write a labelled 2-D map: one row per `rows` entry, one column per `columns`
pub fn write_map_csv(
    path: &Path,
    corner: &str,
    rows: &[String],
    columns: &[String],
    map: &Array2<f64>,
) -> PipelineResult<()> {
    if map.dim() != (rows.len(), columns.len()) {
        return Err(PipelineError::consistency(
            "map shape",
            format!("{:?}", map.dim()),
            format!("{:?}", (rows.len(), columns.len())),
        ));
    }
    let file = File::create(path)?;
    let mut writer = Writer::from_writer(file);

    let mut header = vec![corner.to_string()];
    header.extend(columns.iter().cloned());
    writer.write_record(&header)?;

    for (label, row) in rows.iter().zip(map.rows()) {
        let mut record = vec![label.clone()];
        record.extend(row.iter().map(|v| format!("{:.6}", v)));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// What `export` writes besides the full-band contrast maps
#[derive(Debug, Clone, Default)]
pub struct ExportRequest {
    pub electrode: Option<String>,
    pub frequency: Option<f64>,
    pub band: Option<(f64, f64)>,
}

fn labels(values: &Array1<f64>) -> Vec<String> {
    values.iter().map(|v| format!("{}", v)).collect()
}

impl SpectralFeatures {
    /// Write the numeric arrays behind the analysis figures into `dir`
    ///
    /// # Returns
    /// Paths of the written files
    pub fn export(&self, dir: &Path, request: &ExportRequest) -> PipelineResult<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;
        let mut written = Vec::new();
        let freqs = labels(&self.freqs);

        for (name, map) in [
            ("rsquared.csv", &self.r_squared),
            ("wilcoxon-z.csv", &self.wilcoxon_z),
            ("wilcoxon-p.csv", &self.wilcoxon_p),
        ] {
            let path = dir.join(name);
            write_map_csv(&path, "electrode", &self.electrodes, &freqs, map)?;
            written.push(path);
        }

        if let Some((fmin, fmax)) = request.band {
            let band = self.r_squared_band(fmin, fmax)?;
            let low = self.bin_index(fmin)?;
            let path = dir.join(format!("rsquared-{}-{}Hz.csv", fmin, fmax));
            write_map_csv(&path, "electrode", &self.electrodes, &freqs[low..low + band.ncols()], &band)?;
            written.push(path);
        }

        if let Some(electrode) = &request.electrode {
            let psd = self.psd(electrode)?;
            let map = ndarray::stack(
                Axis(0),
                &[
                    psd.class1_mean.view(),
                    psd.class1_std.view(),
                    psd.class2_mean.view(),
                    psd.class2_std.view(),
                ],
            )
            .map_err(|e| PipelineError::InvalidData(e.to_string()))?;
            let rows = vec![
                format!("{} mean dB", self.class1.label),
                format!("{} std dB", self.class1.label),
                format!("{} mean dB", self.class2.label),
                format!("{} std dB", self.class2.label),
            ];
            let path = dir.join(format!("psd-{}.csv", electrode));
            write_map_csv(&path, "Hz", &rows, &freqs, &map)?;
            written.push(path);

            let times = labels(&self.time);
            for condition in Condition::all() {
                let map = self.erd_map(electrode, condition)?;
                let label = &self.condition(condition).label;
                let path = dir.join(format!("erd-{}-{}.csv", electrode, label));
                write_map_csv(&path, "Hz", &freqs, &times, &map)?;
                written.push(path);
            }
        }

        if let Some(frequency) = request.frequency {
            let values: Vec<f64> = self.topography(frequency)?.into_iter().map(|(_, v)| v).collect();
            let map = Array2::from_shape_vec((values.len(), 1), values)
                .map_err(|e| PipelineError::InvalidData(e.to_string()))?;
            let path = dir.join(format!("topography-{}Hz.csv", frequency));
            write_map_csv(&path, "electrode", &self.electrodes, &["rsquared".to_string()], &map)?;
            written.push(path);
        }

        log::info!("Wrote {} analysis files to {:?}", written.len(), dir);
        Ok(written)
    }
}

// ============================================================================
// Tests
// ============================================================================
