//! Core enums used throughout the monitor.

use serde::{Deserialize, Serialize};

/// One ordered phase of a pipeline run.
///
/// Each variant maps to exactly one externally dispatched job. The
/// declaration order is the execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    HostFiltering,
    Alignment,
    Postprocess,
    Experimental,
}

impl StageName {
    /// All stages in step order.
    pub const ALL: [StageName; 4] = [
        StageName::HostFiltering,
        StageName::Alignment,
        StageName::Postprocess,
        StageName::Experimental,
    ];

    /// 1-based step number defining the total order of stages.
    pub fn step_number(&self) -> u8 {
        match self {
            StageName::HostFiltering => 1,
            StageName::Alignment => 2,
            StageName::Postprocess => 3,
            StageName::Experimental => 4,
        }
    }

    /// Display name used in the composite run status.
    pub fn display_name(&self) -> &'static str {
        match self {
            StageName::HostFiltering => "Host Filtering",
            StageName::Alignment => "GSNAPL/RAPSEARCH alignment",
            StageName::Postprocess => "Post Processing",
            StageName::Experimental => "Experimental",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Status of a dispatched stage job.
///
/// A stage that has never been dispatched has no status at all
/// (`Option::None` on [`crate::models::Stage::job_status`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Started,
    Runnable,
    Running,
    Succeeded,
    Failed,
}

impl StageStatus {
    /// Whether the stage can no longer change on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Succeeded | StageStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Started => "STARTED",
            StageStatus::Runnable => "RUNNABLE",
            StageStatus::Running => "RUNNING",
            StageStatus::Succeeded => "SUCCEEDED",
            StageStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named artifact type produced by the pipeline and ingested into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    ErccCounts,
    TaxonCounts,
    ContigCounts,
    TaxonByteranges,
    AmrCounts,
}

impl OutputKind {
    /// Every output tracked for a run, in creation order.
    pub const ALL: [OutputKind; 5] = [
        OutputKind::ErccCounts,
        OutputKind::TaxonCounts,
        OutputKind::ContigCounts,
        OutputKind::TaxonByteranges,
        OutputKind::AmrCounts,
    ];

    /// The output whose load marks the main report as ready.
    pub const REPORT_READY: OutputKind = OutputKind::TaxonCounts;

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::ErccCounts => "ercc_counts",
            OutputKind::TaxonCounts => "taxon_counts",
            OutputKind::ContigCounts => "contig_counts",
            OutputKind::TaxonByteranges => "taxon_byteranges",
            OutputKind::AmrCounts => "amr_counts",
        }
    }
}

impl std::fmt::Display for OutputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OutputKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutputKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown output kind '{}'", s))
    }
}

/// Ingestion state of one output.
///
/// ```text
/// UNKNOWN / LOADING_ERROR -> LOADING_QUEUED -> LOADING -> LOADED
///          \                                         \-> LOADING_ERROR
///           \-> FAILED (run finalized, output never appeared)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadState {
    #[default]
    Unknown,
    LoadingQueued,
    Loading,
    Loaded,
    LoadingError,
    Failed,
}

impl LoadState {
    /// States from which the monitor will poll for the output again.
    pub fn is_retry_eligible(&self) -> bool {
        matches!(self, LoadState::Unknown | LoadState::LoadingError)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoadState::Loaded | LoadState::Failed)
    }
}

impl std::fmt::Display for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoadState::Unknown => "UNKNOWN",
            LoadState::LoadingQueued => "LOADING_QUEUED",
            LoadState::Loading => "LOADING",
            LoadState::Loaded => "LOADED",
            LoadState::LoadingError => "LOADING_ERROR",
            LoadState::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Whether result ingestion for a run is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultsFinalized {
    #[default]
    InProgress,
    FinalizedSuccess,
    FinalizedFail,
}

impl ResultsFinalized {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResultsFinalized::InProgress)
    }
}

/// Taxonomic level of a count row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum TaxLevel {
    Species,
    Genus,
    Family,
}

impl TaxLevel {
    pub fn id(&self) -> i64 {
        match self {
            TaxLevel::Species => 1,
            TaxLevel::Genus => 2,
            TaxLevel::Family => 3,
        }
    }
}

impl TryFrom<i64> for TaxLevel {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TaxLevel::Species),
            2 => Ok(TaxLevel::Genus),
            3 => Ok(TaxLevel::Family),
            other => Err(format!("unsupported tax level {}", other)),
        }
    }
}

impl From<TaxLevel> for i64 {
    fn from(level: TaxLevel) -> Self {
        level.id()
    }
}
