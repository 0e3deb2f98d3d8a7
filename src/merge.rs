// merge.rs - Composite training table from several per-run trial tables
//
// Every run is a signal table (see data_loader). For each class
// stimulation in each run, the rows inside [stim + start, stim + end) are
// copied into one composite table on a continuous timeline. Nothing is
// written unless every run agrees on layout and both classes have epochs.

use csv::{Reader, StringRecord, Writer};
use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::data_loader::{SignalHeader, SIGNAL_LEADING_COLUMNS, TRAILING_METADATA_COLUMNS};
use crate::error::{PipelineError, PipelineResult};

/// Stimulation names with their numeric codes
const STIMULATION_CODES: &[(&str, u32)] = &[
    ("OVTK_GDF_Left", 0x301),
    ("OVTK_GDF_Right", 0x302),
    ("OVTK_GDF_Foot", 0x303),
    ("OVTK_GDF_Tongue", 0x304),
];

/// Stimulation marking class-1 trials in the recorded signals
pub const CLASS1_STIMULATION: &str = "OVTK_GDF_Left";
/// Stimulation marking class-2 trials
pub const CLASS2_STIMULATION: &str = "OVTK_GDF_Right";

/// Numeric code of a named stimulation
pub fn stimulation_code(name: &str) -> Option<u32> {
    STIMULATION_CODES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, code)| *code)
}

/// Does an "Event Id" field (possibly several ids joined by ':') carry `marker`?
fn carries_marker(event_field: &str, marker: &str) -> bool {
    let code = stimulation_code(marker).map(|c| c.to_string());
    event_field
        .split(':')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .any(|id| id == marker || Some(id) == code.as_deref())
}

/// What to extract from each run
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub class1_label: String,
    pub class2_label: String,
    pub class1_stim: String,
    pub class2_stim: String,
    /// Epoch start relative to the stimulation, seconds
    pub epoch_start: f64,
    /// Epoch end relative to the stimulation, seconds (exclusive)
    pub epoch_end: f64,
}

impl MergeRequest {
    /// Request for the standard left/right stimulations and a [0, epoch) window
    pub fn standard(class1_label: &str, class2_label: &str, epoch: f64) -> Self {
        Self {
            class1_label: class1_label.to_string(),
            class2_label: class2_label.to_string(),
            class1_stim: CLASS1_STIMULATION.to_string(),
            class2_stim: CLASS2_STIMULATION.to_string(),
            epoch_start: 0.0,
            epoch_end: epoch,
        }
    }

    /// Composite file name for this class pair
    pub fn composite_name(&self) -> String {
        format!("composite-{}-{}.csv", self.class1_label, self.class2_label)
    }
}

/// One run loaded in memory
struct RunTable {
    path: PathBuf,
    header: SignalHeader,
    times: Vec<f64>,
    records: Vec<StringRecord>,
}

impl RunTable {
    fn load(path: &Path) -> PipelineResult<Self> {
        let mut reader = Reader::from_reader(File::open(path)?);
        let headers = reader.headers()?.clone();
        let header = SignalHeader::parse(path, &headers)?;

        let mut times = Vec::new();
        let mut records = Vec::new();
        for (row, result) in reader.records().enumerate() {
            let record = result?;
            if record.len() != headers.len() {
                return Err(PipelineError::format(
                    path,
                    format!("row {} has {} columns, header has {}", row + 1, record.len(), headers.len()),
                ));
            }
            let time: f64 = record[0].trim().parse().map_err(|_| {
                PipelineError::format(path, format!("row {}: invalid time '{}'", row + 1, &record[0]))
            })?;
            times.push(time);
            records.push(record);
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            times,
            records,
        })
    }

    fn event_column(&self) -> usize {
        SIGNAL_LEADING_COLUMNS + self.header.electrodes.len()
    }

    /// Row ranges of complete epochs following each `marker` stimulation
    fn epochs(&self, marker: &str, start: f64, end: f64, expected_rows: usize) -> Vec<std::ops::Range<usize>> {
        let event_col = self.event_column();
        // half a sample of slack on the window bounds
        let slack = 0.5 / self.header.sampling_frequency as f64;

        let mut ranges = Vec::new();
        for (row, record) in self.records.iter().enumerate() {
            if !carries_marker(&record[event_col], marker) {
                continue;
            }
            let stim = self.times[row];
            let lo = stim + start - slack;
            let hi = stim + end - slack;
            let first = self.times.partition_point(|&t| t < lo);
            let last = self.times.partition_point(|&t| t < hi);
            if last - first == expected_rows {
                ranges.push(first..last);
            } else {
                log::warn!(
                    "{:?}: incomplete epoch at {:.3} s ({} of {} samples), skipped",
                    self.path,
                    stim,
                    last - first,
                    expected_rows
                );
            }
        }
        ranges
    }
}

/// Merge per-run trial tables into one composite training table
///
/// # Arguments
/// * `runs` - Per-run signal tables, in the order they are concatenated
/// * `request` - Class labels, stimulations and epoch window
///
/// # Returns
/// Path of the composite table, written next to the first run
pub fn merge_runs(runs: &[PathBuf], request: &MergeRequest) -> PipelineResult<PathBuf> {
    let first_path = runs.first().ok_or_else(|| PipelineError::InsufficientData {
        what: "runs to merge".to_string(),
        needed: 1,
        got: 0,
    })?;
    if !(request.epoch_end > request.epoch_start) {
        return Err(PipelineError::invalid_parameter(
            "StimulationEpoch",
            format!("epoch window [{}, {}) is empty", request.epoch_start, request.epoch_end),
        ));
    }

    let tables = runs
        .iter()
        .map(|p| RunTable::load(p))
        .collect::<PipelineResult<Vec<_>>>()?;

    let reference = &tables[0];
    for table in &tables[1..] {
        if table.header.sampling_frequency != reference.header.sampling_frequency {
            return Err(PipelineError::consistency(
                "sampling frequency",
                reference.header.sampling_frequency,
                table.header.sampling_frequency,
            ));
        }
        if table.header.electrodes != reference.header.electrodes {
            return Err(PipelineError::ElectrodeMismatch {
                first: reference.path.clone(),
                other: table.path.clone(),
            });
        }
    }

    let fs = reference.header.sampling_frequency as f64;
    let expected_rows = ((request.epoch_end - request.epoch_start) * fs).round() as usize;
    let channels = reference.header.electrodes.len();

    // (run, rows, stimulation) in concatenation order
    let mut epochs = Vec::new();
    for (label, marker) in [
        (&request.class1_label, &request.class1_stim),
        (&request.class2_label, &request.class2_stim),
    ] {
        let mut count = 0;
        for (run_idx, table) in tables.iter().enumerate() {
            for range in table.epochs(marker, request.epoch_start, request.epoch_end, expected_rows) {
                epochs.push((run_idx, range, marker.as_str()));
                count += 1;
            }
        }
        if count == 0 {
            return Err(PipelineError::InsufficientData {
                what: format!("{} epochs ({})", label, marker),
                needed: 1,
                got: 0,
            });
        }
        log::info!("Merging {} {} epochs", count, label);
    }
    // chronological within each run, runs in input order
    epochs.sort_by_key(|(run, range, _)| (*run, range.start));

    let parent = first_path.parent().unwrap_or_else(|| Path::new("."));
    let output = parent.join(request.composite_name());

    let mut tmp = NamedTempFile::new_in(parent)?;
    {
        let mut writer = Writer::from_writer(tmp.as_file_mut());
        let headers = first_header_row(&reference.header);
        writer.write_record(&headers)?;

        let mut out_row = 0usize;
        for (epoch_idx, (run_idx, range, marker)) in epochs.iter().enumerate() {
            let table = &tables[*run_idx];
            for (offset, row) in range.clone().enumerate() {
                let time = out_row as f64 / fs;
                let record = &table.records[row];
                let mut fields = Vec::with_capacity(headers.len());
                fields.push(format!("{:.6}", time));
                fields.push(epoch_idx.to_string());
                for ch in 0..channels {
                    fields.push(record[SIGNAL_LEADING_COLUMNS + ch].to_string());
                }
                if offset == 0 {
                    let id = stimulation_code(marker)
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| marker.to_string());
                    fields.push(id);
                    fields.push(format!("{:.6}", time));
                    fields.push("0".to_string());
                } else {
                    fields.extend(std::iter::repeat(String::new()).take(TRAILING_METADATA_COLUMNS));
                }
                writer.write_record(&fields)?;
                out_row += 1;
            }
        }
        writer.flush()?;
    }
    tmp.persist(&output).map_err(|e| e.error)?;

    log::info!("Composite table {:?}: {} epochs from {} runs", output, epochs.len(), runs.len());
    Ok(output)
}

fn first_header_row(header: &SignalHeader) -> Vec<String> {
    let mut row = vec![format!("Time:{}Hz", header.sampling_frequency), "Epoch".to_string()];
    row.extend(header.electrodes.iter().cloned());
    row.extend(["Event Id", "Event Date", "Event Duration"].iter().map(|s| s.to_string()));
    row
}
