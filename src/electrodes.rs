// electrodes.rs - Canonical electrode layouts and channel reordering
//
// Recordings list their channels in acquisition order. Maps and tensors are
// reindexed by name onto a canonical montage so that plots and topographies
// line up across recordings.

use ndarray::{Array, Axis, RemoveAxis};

use crate::error::{PipelineError, PipelineResult};

/// High-density montage for 64-channel caps
pub const HIGH_DENSITY_LAYOUT: &[&str] = &[
    "FP1", "AF7", "AF3", "F7", "F5", "F3", "F1", "FT9", "FT7", "FC5", "FC3", "FC1", "T7", "C5",
    "C3", "C1", "TP9", "TP7", "CP5", "CP3", "CP1", "P7", "P5", "P3", "P1", "PO9", "PO7", "PO3",
    "O1", "AFz", "Fz", "FCz", "Cz", "CPz", "Pz", "POz", "Oz", "FP2", "AF8", "AF4", "F8", "F6",
    "F4", "F2", "FT10", "FT8", "FC6", "FC4", "FC2", "T8", "C6", "C4", "C2", "TP10", "TP8", "CP6",
    "CP4", "CP2", "P8", "P6", "P4", "P2", "PO10", "PO8", "PO4", "O2",
];

/// 32-channel montage
pub const STANDARD_LAYOUT: &[&str] = &[
    "Fp1", "F7", "F3", "FC5", "FC1", "T7", "C3", "CP5", "CP1", "P7", "P3", "PO9", "O1", "AFz",
    "Fz", "FCz", "Cz", "Pz", "Oz", "Fp2", "F8", "F4", "FC6", "FC2", "T8", "C4", "CP6", "CP2",
    "P8", "P4", "PO10", "O2",
];

/// A canonical electrode ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectrodeLayout {
    Standard32,
    HighDensity64,
}

impl ElectrodeLayout {
    /// Layout that recognises the most of `source`
    ///
    /// Ties go to the 32-channel montage. Any output of a reorder is a subset
    /// of the chosen layout, so choosing again from it gives the same layout.
    pub fn for_channels(source: &[String]) -> Self {
        let coverage = |layout: ElectrodeLayout| {
            source
                .iter()
                .filter(|name| layout.names().contains(&name.as_str()))
                .count()
        };
        if coverage(ElectrodeLayout::HighDensity64) > coverage(ElectrodeLayout::Standard32) {
            ElectrodeLayout::HighDensity64
        } else {
            ElectrodeLayout::Standard32
        }
    }

    pub fn names(&self) -> &'static [&'static str] {
        match self {
            ElectrodeLayout::Standard32 => STANDARD_LAYOUT,
            ElectrodeLayout::HighDensity64 => HIGH_DENSITY_LAYOUT,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ElectrodeLayout::Standard32 => "standard-32",
            ElectrodeLayout::HighDensity64 => "high-density-64",
        }
    }
}

/// What to do with source channels that the layout does not know
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Drop them (logged at debug level)
    #[default]
    Lenient,
    /// Fail with a consistency error
    Strict,
}

impl MatchMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lenient" => Some(MatchMode::Lenient),
            "strict" => Some(MatchMode::Strict),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::Lenient => "lenient",
            MatchMode::Strict => "strict",
        }
    }
}

/// Source index and name for each output position
struct ReorderPlan {
    indices: Vec<usize>,
    order: Vec<String>,
}

/// Reindexes arrays onto one fixed canonical layout
///
/// Keeping the layout fixed makes reordering idempotent: applying the same
/// reorderer to its own output returns that output unchanged.
#[derive(Debug, Clone, Copy)]
pub struct Reorderer {
    pub layout: ElectrodeLayout,
    pub mode: MatchMode,
}

impl Reorderer {
    pub fn new(layout: ElectrodeLayout, mode: MatchMode) -> Self {
        Self { layout, mode }
    }

    /// Reorderer whose layout is the one best matching `source`
    pub fn for_source(source: &[String], mode: MatchMode) -> Self {
        Self::new(ElectrodeLayout::for_channels(source), mode)
    }

    fn plan(&self, source: &[String]) -> PipelineResult<ReorderPlan> {
        let dropped: Vec<&str> = source
            .iter()
            .map(String::as_str)
            .filter(|name| !self.layout.names().contains(name))
            .collect();

        if !dropped.is_empty() {
            match self.mode {
                MatchMode::Strict => {
                    return Err(PipelineError::consistency(
                        format!("channels outside the {} layout", self.layout.as_str()),
                        dropped.join(", "),
                        self.layout.names().join(", "),
                    ));
                }
                MatchMode::Lenient => {
                    log::debug!(
                        "Dropping {} channels absent from the {} layout: {}",
                        dropped.len(),
                        self.layout.as_str(),
                        dropped.join(", ")
                    );
                }
            }
        }

        let mut indices = Vec::new();
        let mut order = Vec::new();
        for &name in self.layout.names() {
            if let Some(idx) = source.iter().position(|s| s == name) {
                indices.push(idx);
                order.push(name.to_string());
            }
        }

        Ok(ReorderPlan { indices, order })
    }

    /// Reindex `array` along `axis` (the channel axis) onto the layout
    ///
    /// # Returns
    /// The reordered array and its channel order
    pub fn reorder<A, D>(
        &self,
        array: &Array<A, D>,
        axis: Axis,
        source: &[String],
    ) -> PipelineResult<(Array<A, D>, Vec<String>)>
    where
        A: Clone,
        D: RemoveAxis,
    {
        if array.len_of(axis) != source.len() {
            return Err(PipelineError::consistency(
                "channel axis length",
                array.len_of(axis),
                source.len(),
            ));
        }
        let plan = self.plan(source)?;
        Ok((array.select(axis, &plan.indices), plan.order))
    }
}
