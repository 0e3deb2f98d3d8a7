// data_loader.rs - Spectral CSV and signal header ingestion
//
// Spectral exports carry their layout in the first column name:
//   "Time:<channels>x<bins>:<samplingFreq>", then optional leading metadata
//   columns, then "<channel>:<bin>" columns contiguous per channel, then
//   three trailing metadata columns.
//
// Signal tables (per-run trials, metadata) use:
//   "Time:<fs>Hz,Epoch,<ch1>,...,<chN>,Event Id,Event Date,Event Duration"

use csv::{Reader, StringRecord};
use ndarray::Array2;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::config::Workspace;
use crate::error::{PipelineError, PipelineResult};

/// Number of non-feature columns at the end of every export
pub const TRAILING_METADATA_COLUMNS: usize = 3;

/// Number of leading columns (time, epoch) in signal tables
pub const SIGNAL_LEADING_COLUMNS: usize = 2;

// ============================================================================
// Spectral exports
// ============================================================================

/// Layout recovered from a spectral export header
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralHeader {
    pub sampling_frequency: u32,
    pub bin_count: usize,
    pub channels: Vec<String>,
    /// Index of the first feature column
    pub first_feature_column: usize,
}

impl SpectralHeader {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn feature_count(&self) -> usize {
        self.channels.len() * self.bin_count
    }

    /// Parse the header row of a spectral export
    pub fn parse(path: &Path, headers: &StringRecord) -> PipelineResult<Self> {
        let first = headers
            .get(0)
            .ok_or_else(|| PipelineError::format(path, "empty header"))?;

        // "Time:32x251:500"
        let parts: Vec<&str> = first.split(':').collect();
        if parts.len() != 3 {
            return Err(PipelineError::format(
                path,
                format!("first column '{}' is not <label>:<channels>x<bins>:<fs>", first),
            ));
        }
        let (chan_str, bin_str) = parts[1].split_once('x').ok_or_else(|| {
            PipelineError::format(path, format!("layout '{}' is not <channels>x<bins>", parts[1]))
        })?;
        let channel_count: usize = parse_field(path, "channel count", chan_str)?;
        let bin_count: usize = parse_field(path, "frequency bin count", bin_str)?;
        let sampling_frequency = parse_sampling_frequency(path, parts[2])?;

        if channel_count == 0 || bin_count == 0 {
            return Err(PipelineError::format(path, "channel and bin counts must be positive"));
        }

        // Skip leading metadata columns ("End Time", ...) that carry no channel:bin pair
        let first_feature_column = (1..headers.len())
            .find(|&i| headers.get(i).map(|h| h.contains(':')).unwrap_or(false))
            .ok_or_else(|| PipelineError::format(path, "no <channel>:<bin> columns"))?;

        let feature_columns = headers
            .len()
            .checked_sub(first_feature_column + TRAILING_METADATA_COLUMNS)
            .unwrap_or(0);
        if feature_columns != channel_count * bin_count {
            return Err(PipelineError::format(
                path,
                format!(
                    "expected {}x{} = {} feature columns, found {}",
                    channel_count,
                    bin_count,
                    channel_count * bin_count,
                    feature_columns
                ),
            ));
        }

        // Channel names from the first column of each channel block
        let mut channels = Vec::with_capacity(channel_count);
        for ch in 0..channel_count {
            let start = first_feature_column + ch * bin_count;
            let name = channel_of(&headers[start]);
            for col in start..start + bin_count {
                if channel_of(&headers[col]) != name {
                    return Err(PipelineError::format(
                        path,
                        format!("column '{}' breaks the block of channel {}", &headers[col], name),
                    ));
                }
            }
            channels.push(name.to_string());
        }

        Ok(Self {
            sampling_frequency,
            bin_count,
            channels,
            first_feature_column,
        })
    }
}

fn channel_of(column: &str) -> &str {
    column.split(':').next().unwrap_or(column).trim()
}

fn parse_field<T: std::str::FromStr>(path: &Path, what: &str, raw: &str) -> PipelineResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| PipelineError::format(path, format!("invalid {} '{}'", what, raw)))
}

fn parse_sampling_frequency(path: &Path, raw: &str) -> PipelineResult<u32> {
    let value: f64 = parse_field(path, "sampling frequency", raw)?;
    if value <= 0.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
        return Err(PipelineError::format(
            path,
            format!("sampling frequency '{}' must be a positive integer", raw),
        ));
    }
    Ok(value as u32)
}

/// One spectral export: layout plus numeric body [rows x features]
#[derive(Debug, Clone)]
pub struct SpectralExport {
    pub path: PathBuf,
    pub header: SpectralHeader,
    pub body: Array2<f64>,
}

impl SpectralExport {
    /// Load and parse a spectral CSV export
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let file = File::open(path)?;
        let mut reader = Reader::from_reader(file);

        let headers = reader.headers()?.clone();
        let header = SpectralHeader::parse(path, &headers)?;
        let start = header.first_feature_column;
        let width = header.feature_count();

        let mut values = Vec::new();
        let mut rows = 0;
        for (row_idx, result) in reader.records().enumerate() {
            let record = result?;
            if record.len() < start + width {
                return Err(PipelineError::format(
                    path,
                    format!("row {} has {} columns, expected at least {}", row_idx + 1, record.len(), start + width),
                ));
            }
            for col in start..start + width {
                let raw = &record[col];
                let value: f64 = raw.trim().parse().map_err(|_| {
                    PipelineError::format(
                        path,
                        format!("row {}, column '{}': '{}' is not numeric", row_idx + 1, &headers[col], raw),
                    )
                })?;
                values.push(value);
            }
            rows += 1;
        }

        let body = Array2::from_shape_vec((rows, width), values)
            .map_err(|e| PipelineError::format(path, e.to_string()))?;

        log::debug!(
            "Loaded {:?}: {} rows, {} channels x {} bins @ {} Hz",
            path,
            rows,
            header.channel_count(),
            header.bin_count,
            header.sampling_frequency
        );

        Ok(Self {
            path: path.to_path_buf(),
            header,
            body,
        })
    }
}

/// Require two exports to share sampling frequency, bin count and channel order
pub fn ensure_consistent(a: &SpectralHeader, b: &SpectralHeader) -> PipelineResult<()> {
    if a.sampling_frequency != b.sampling_frequency {
        return Err(PipelineError::consistency(
            "sampling frequency",
            a.sampling_frequency,
            b.sampling_frequency,
        ));
    }
    if a.bin_count != b.bin_count {
        return Err(PipelineError::consistency("frequency bin count", a.bin_count, b.bin_count));
    }
    if a.channels != b.channels {
        return Err(PipelineError::consistency(
            "channel order",
            a.channels.join(";"),
            b.channels.join(";"),
        ));
    }
    Ok(())
}

// ============================================================================
// Signal tables
// ============================================================================

/// Sampling frequency and electrode list of a signal table
#[derive(Debug, Clone, PartialEq)]
pub struct SignalHeader {
    pub sampling_frequency: u32,
    pub electrodes: Vec<String>,
}

impl SignalHeader {
    /// Parse a "Time:<fs>Hz,Epoch,<channels...>,<3 metadata>" header row
    pub fn parse(path: &Path, headers: &StringRecord) -> PipelineResult<Self> {
        let first = headers
            .get(0)
            .ok_or_else(|| PipelineError::format(path, "empty header"))?;
        let freq = first
            .split(':')
            .nth(1)
            .map(|s| s.trim().trim_end_matches("Hz"))
            .ok_or_else(|| PipelineError::format(path, format!("first column '{}' is not Time:<fs>Hz", first)))?;
        let sampling_frequency = parse_sampling_frequency(path, freq)?;

        if headers.len() <= SIGNAL_LEADING_COLUMNS + TRAILING_METADATA_COLUMNS {
            return Err(PipelineError::format(path, "no electrode columns"));
        }
        let electrodes = headers
            .iter()
            .skip(SIGNAL_LEADING_COLUMNS)
            .take(headers.len() - SIGNAL_LEADING_COLUMNS - TRAILING_METADATA_COLUMNS)
            .map(|h| h.trim().to_string())
            .collect();

        Ok(Self {
            sampling_frequency,
            electrodes,
        })
    }

    /// Read only the header row of a signal table
    pub fn read(path: &Path) -> PipelineResult<Self> {
        let file = File::open(path)?;
        let mut reader = Reader::from_reader(file);
        let headers = reader.headers()?.clone();
        Self::parse(path, &headers)
    }
}

// ============================================================================
// Workspace discovery
// ============================================================================

/// Paths of the four spectral exports belonging to one run
#[derive(Debug, Clone)]
pub struct RunSpectra {
    pub basename: String,
    pub class1: PathBuf,
    pub class2: PathBuf,
    pub class1_baseline: PathBuf,
    pub class2_baseline: PathBuf,
}

/// Finds the files the pipeline works on inside a workspace
#[derive(Debug, Clone)]
pub struct DataLoader {
    pub workspace: Workspace,
}

impl DataLoader {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    /// File names in `dir` ending with `suffix`, sorted
    fn list_with_suffix(dir: &Path, suffix: &str) -> PipelineResult<Vec<String>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<String> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().map(String::from))
            .filter(|name| name.ends_with(suffix))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Recorded signal files (.ov) available for extraction
    pub fn signal_files(&self) -> PipelineResult<Vec<String>> {
        Self::list_with_suffix(&self.workspace.signals(), ".ov")
    }

    /// Per-run trial tables available for training
    pub fn training_files(&self) -> PipelineResult<Vec<String>> {
        Self::list_with_suffix(&self.workspace.training(), "-TRIALS.csv")
    }

    /// Run basenames for which both class exports exist
    pub fn spectrum_basenames(&self, class1: &str, class2: &str) -> PipelineResult<Vec<String>> {
        let dir = self.workspace.analysis();
        let suffix1 = format!("-{}.csv", class1);
        let basenames = Self::list_with_suffix(&dir, &suffix1)?
            .into_iter()
            .filter_map(|name| name.strip_suffix(&suffix1).map(String::from))
            .filter(|base| dir.join(format!("{}-{}.csv", base, class2)).exists())
            .collect();
        Ok(basenames)
    }

    /// The four export paths of a run
    pub fn run_spectra(&self, basename: &str, class1: &str, class2: &str) -> RunSpectra {
        let dir = self.workspace.analysis();
        RunSpectra {
            basename: basename.to_string(),
            class1: dir.join(format!("{}-{}.csv", basename, class1)),
            class2: dir.join(format!("{}-{}.csv", basename, class2)),
            class1_baseline: dir.join(format!("{}-{}-BASELINE.csv", basename, class1)),
            class2_baseline: dir.join(format!("{}-{}-BASELINE.csv", basename, class2)),
        }
    }

    /// Metadata file generated next to a signal file
    pub fn metadata_path(&self, signal_file: &str) -> PathBuf {
        let stem = signal_file.strip_suffix(".ov").unwrap_or(signal_file);
        self.workspace.signals().join(format!("{}-META.csv", stem))
    }
}

// ============================================================================
// Tests
// ============================================================================
