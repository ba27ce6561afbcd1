//! Pipeline run aggregate: the run row, its stages and output states.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{LoadState, OutputKind, ResultsFinalized, StageName, StageStatus};
use super::version::PipelineVersion;

/// Opaque pipeline run identifier.
pub type RunId = u64;

/// Handle returned by the job runner for a dispatched stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle(pub String);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The input sample a run analyses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRef {
    pub id: u64,
    pub project_id: u64,
    /// Number of uploaded FASTQ files (2 means paired-end).
    pub input_file_count: u32,
}

impl SampleRef {
    pub fn is_paired(&self) -> bool {
        self.input_file_count == 2
    }
}

/// Parameters for creating a new run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRun {
    pub sample: SampleRef,
    /// Name of the versioned alignment configuration.
    pub alignment_config: String,
    /// Reads (or read pairs) to subsample to after host filtering.
    #[serde(default)]
    pub subsample: Option<u64>,
}

/// One ordered step of a run, mapped to one external job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: StageName,
    /// `None` until the stage has been dispatched.
    pub job_status: Option<StageStatus>,
    /// Command built once at dispatch.
    pub job_command: Option<String>,
    pub job_handle: Option<JobHandle>,
    pub updated_at: DateTime<Utc>,
}

impl Stage {
    pub fn new(name: StageName, now: DateTime<Utc>) -> Self {
        Self {
            name,
            job_status: None,
            job_command: None,
            job_handle: None,
            updated_at: now,
        }
    }

    pub fn step_number(&self) -> u8 {
        self.name.step_number()
    }

    pub fn started(&self) -> bool {
        self.job_status.is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.job_status == Some(StageStatus::Succeeded)
    }

    pub fn failed(&self) -> bool {
        self.job_status == Some(StageStatus::Failed)
    }

    /// Clear job fields so the stage is dispatched again.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.job_status = None;
        self.job_command = None;
        self.job_handle = None;
        self.updated_at = now;
    }
}

/// Ingestion state of one output of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputState {
    pub output: OutputKind,
    pub state: LoadState,
}

impl OutputState {
    pub fn unknown(output: OutputKind) -> Self {
        Self {
            output,
            state: LoadState::Unknown,
        }
    }
}

/// Composite run status, rendered as `"<step>.<stage>-<status>[|READY]"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunStatus {
    /// Every stage succeeded.
    Checked,
    /// Progress of the active stage.
    Stage {
        name: StageName,
        status: StageStatus,
        /// The primary report output has loaded.
        ready: bool,
    },
}

impl RunStatus {
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            RunStatus::Stage {
                status: StageStatus::Failed,
                ..
            }
        )
    }

    /// Step number of the active stage, if any.
    pub fn step_number(&self) -> Option<u8> {
        match self {
            RunStatus::Checked => None,
            RunStatus::Stage { name, .. } => Some(name.step_number()),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Checked => write!(f, "CHECKED"),
            RunStatus::Stage {
                name,
                status,
                ready,
            } => {
                write!(f, "{}.{}-{}", name.step_number(), name.display_name(), status)?;
                if *ready {
                    write!(f, "|READY")?;
                }
                Ok(())
            }
        }
    }
}

/// Aggregate root for one execution attempt of one sample.
///
/// Output states are not embedded here: ingestion workers update them
/// concurrently, so they live in their own store rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub sample: SampleRef,
    pub alignment_config: String,
    #[serde(default)]
    pub subsample: Option<u64>,
    #[serde(default)]
    pub pipeline_version: Option<PipelineVersion>,
    /// `None` until the first stage has been dispatched.
    #[serde(default)]
    pub job_status: Option<RunStatus>,
    pub finalized: bool,
    pub results_finalized: ResultsFinalized,
    pub completed_gsnap_chunks: u64,
    pub completed_rapsearch_chunks: u64,
    #[serde(default)]
    pub total_reads: Option<u64>,
    #[serde(default)]
    pub truncated: Option<u64>,
    #[serde(default)]
    pub fraction_subsampled: Option<f64>,
    #[serde(default)]
    pub adjusted_remaining_reads: Option<u64>,
    #[serde(default)]
    pub unmapped_reads: Option<u64>,
    /// ERCC spike-in reads across every input file, once ercc counts load.
    #[serde(default)]
    pub total_ercc_reads: Option<u64>,
    /// Consecutive ticks where every output had loaded but stats failed.
    #[serde(default)]
    pub stats_failures: u32,
    pub alert_sent: bool,
    pub created_at: DateTime<Utc>,
    /// All four stages, created up front, in step order.
    pub stages: Vec<Stage>,
}

impl PipelineRun {
    /// Create a run with every stage pre-created and nothing dispatched.
    pub fn new(id: RunId, new_run: NewRun, now: DateTime<Utc>) -> Self {
        Self {
            id,
            sample: new_run.sample,
            alignment_config: new_run.alignment_config,
            subsample: new_run.subsample,
            pipeline_version: None,
            job_status: None,
            finalized: false,
            results_finalized: ResultsFinalized::InProgress,
            completed_gsnap_chunks: 0,
            completed_rapsearch_chunks: 0,
            total_reads: None,
            truncated: None,
            fraction_subsampled: None,
            adjusted_remaining_reads: None,
            unmapped_reads: None,
            total_ercc_reads: None,
            stats_failures: 0,
            alert_sent: false,
            created_at: now,
            stages: StageName::ALL.iter().map(|n| Stage::new(*n, now)).collect(),
        }
    }

    /// Index of the first stage, in step order, that has not succeeded.
    pub fn active_stage_index(&self) -> Option<usize> {
        self.stages.iter().position(|s| !s.succeeded())
    }

    pub fn active_stage(&self) -> Option<&Stage> {
        self.active_stage_index().map(|i| &self.stages[i])
    }

    pub fn last_stage(&self) -> Option<&Stage> {
        self.stages.iter().max_by_key(|s| s.step_number())
    }

    /// Whether the run is in failure (stage failure or failed results).
    pub fn is_failed(&self) -> bool {
        self.job_status.as_ref().is_some_and(RunStatus::is_failed)
            || self.results_finalized == ResultsFinalized::FinalizedFail
    }

    /// Whether the subsample suffix applies to this run's paths.
    pub fn subsamples(&self) -> bool {
        self.subsample.is_some_and(|n| n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run() -> PipelineRun {
        PipelineRun::new(
            7,
            NewRun {
                sample: SampleRef {
                    id: 42,
                    project_id: 3,
                    input_file_count: 2,
                },
                alignment_config: "2018-02-15".to_string(),
                subsample: Some(1_000_000),
            },
            Utc::now(),
        )
    }

    #[test]
    fn new_run_precreates_all_stages() {
        let run = sample_run();
        assert_eq!(run.stages.len(), 4);
        assert!(run.stages.iter().all(|s| s.job_status.is_none()));
        assert_eq!(run.active_stage().unwrap().name, StageName::HostFiltering);
        assert!(!run.finalized);
        assert_eq!(run.results_finalized, ResultsFinalized::InProgress);
    }

    #[test]
    fn active_stage_skips_succeeded() {
        let mut run = sample_run();
        run.stages[0].job_status = Some(StageStatus::Succeeded);
        assert_eq!(run.active_stage().unwrap().name, StageName::Alignment);

        for stage in &mut run.stages {
            stage.job_status = Some(StageStatus::Succeeded);
        }
        assert!(run.active_stage().is_none());
    }

    #[test]
    fn run_status_renders_composite_string() {
        let status = RunStatus::Stage {
            name: StageName::Postprocess,
            status: StageStatus::Failed,
            ready: true,
        };
        assert_eq!(status.to_string(), "3.Post Processing-FAILED|READY");
        assert_eq!(RunStatus::Checked.to_string(), "CHECKED");
    }

    #[test]
    fn failed_results_count_as_failure() {
        let mut run = sample_run();
        assert!(!run.is_failed());
        run.results_finalized = ResultsFinalized::FinalizedFail;
        assert!(run.is_failed());
    }

    #[test]
    fn run_serializes() {
        let run = sample_run();
        let json = serde_json::to_string(&run).unwrap();
        let back: PipelineRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 7);
        assert_eq!(back.stages.len(), 4);
    }
}
