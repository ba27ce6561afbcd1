//! Compiles per-step read counters into run metrics and a summary file.
//!
//! Each step of the pipeline drops a small JSON counter file (name ending
//! in `count`) next to its outputs, mapping a step key to the reads left
//! after that step. The compiler merges them, derives the run metrics,
//! uploads the merged `stats.json` and replaces the run's job stats.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::external::{basename, BlobError, BlobStore, Store, StoreError};
use crate::models::{JobStat, PipelineRun};
use crate::paths::PathResolver;

pub const TOTAL_READS_TASK: &str = "fastqs";
pub const TRUNCATED_TASK: &str = "truncated";
pub const PRE_SUBSAMPLE_TASK: &str = "bowtie2_out";
pub const POST_SUBSAMPLE_TASK: &str = "subsampled_out";
pub const REMAINING_TASK: &str = "gsnap_filter_out";
pub const UNMAPPED_TASK: &str = "unidentified_fasta";

/// Subsample fraction when it cannot be computed.
pub const FRACTION_SENTINEL: f64 = -1.0;

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed counter file '{path}': {message}")]
    Malformed { path: String, message: String },
}

impl StatsError {
    fn malformed(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            message: message.into(),
        }
    }
}

pub type StatsResult<T> = Result<T, StatsError>;

/// One record of the compiled summary file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatsRecord {
    Task { task: String, reads_after: u64 },
    TotalReads { total_reads: u64 },
    FractionSubsampled { fraction_subsampled: f64 },
    AdjustedRemainingReads { adjusted_remaining_reads: u64 },
}

/// Metrics derived from the merged counters.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedMetrics {
    pub total_reads: Option<u64>,
    pub truncated: Option<u64>,
    /// [`FRACTION_SENTINEL`] unless both subsample counts are known.
    pub fraction_subsampled: f64,
    pub adjusted_remaining_reads: Option<u64>,
    /// Whether the adjusted count was projected from the late-stage count.
    pub adjusted_from_remaining: bool,
    pub unmapped_reads: Option<u64>,
}

impl DerivedMetrics {
    pub fn has_fraction(&self) -> bool {
        self.fraction_subsampled != FRACTION_SENTINEL
    }
}

fn find(entries: &[JobStat], task: &str) -> Option<u64> {
    entries.iter().find(|e| e.task == task).map(|e| e.reads_after)
}

/// Derive run metrics from merged step counters.
pub fn derive_metrics(entries: &[JobStat]) -> DerivedMetrics {
    let before = find(entries, PRE_SUBSAMPLE_TASK);
    let after = find(entries, POST_SUBSAMPLE_TASK);
    let fraction = match (before, after) {
        (Some(before), Some(after)) if before > 0 => after as f64 / before as f64,
        _ => FRACTION_SENTINEL,
    };

    let remaining = find(entries, REMAINING_TASK);
    let (adjusted, from_remaining) = match remaining {
        Some(rem) if fraction != FRACTION_SENTINEL => {
            (Some((rem as f64 * (1.0 / fraction)) as u64), true)
        }
        // Late filtering has not run yet: use host-filtered reads.
        _ => (before, false),
    };

    DerivedMetrics {
        total_reads: find(entries, TOTAL_READS_TASK),
        truncated: find(entries, TRUNCATED_TASK),
        fraction_subsampled: fraction,
        adjusted_remaining_reads: adjusted,
        adjusted_from_remaining: from_remaining,
        unmapped_reads: find(entries, UNMAPPED_TASK),
    }
}

/// Summary file records: every step entry, then the derived ones.
pub fn summary_records(entries: &[JobStat], metrics: &DerivedMetrics) -> Vec<StatsRecord> {
    let mut records: Vec<StatsRecord> = entries
        .iter()
        .map(|e| StatsRecord::Task {
            task: e.task.clone(),
            reads_after: e.reads_after,
        })
        .collect();
    if let Some(total_reads) = metrics.total_reads {
        records.push(StatsRecord::TotalReads { total_reads });
    }
    if metrics.has_fraction() {
        records.push(StatsRecord::FractionSubsampled {
            fraction_subsampled: metrics.fraction_subsampled,
        });
    }
    if metrics.adjusted_from_remaining {
        if let Some(adjusted_remaining_reads) = metrics.adjusted_remaining_reads {
            records.push(StatsRecord::AdjustedRemainingReads {
                adjusted_remaining_reads,
            });
        }
    }
    records
}

/// Parse one counter file: a JSON object of step key to count.
pub fn parse_counter_file(path: &str, content: &str) -> StatsResult<Vec<JobStat>> {
    let value: serde_json::Value = serde_json::from_str(content)
        .map_err(|e| StatsError::malformed(path, e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| StatsError::malformed(path, "expected a JSON object"))?;

    object
        .iter()
        .map(|(task, count)| {
            let reads_after = count
                .as_u64()
                .or_else(|| count.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .ok_or_else(|| {
                    StatsError::malformed(path, format!("count for '{}' is not a number", task))
                })?;
            Ok(JobStat {
                task: task.clone(),
                reads_after,
            })
        })
        .collect()
}

/// Result of a compile that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsOutcome {
    /// No counter files exist yet.
    NoCounters,
    Compiled(DerivedMetrics),
}

/// Reads counters from the blob store and applies them to a run.
pub struct StatsCompiler {
    blob: Arc<dyn BlobStore>,
    store: Arc<dyn Store>,
    paths: PathResolver,
    work_dir: PathBuf,
}

impl StatsCompiler {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        store: Arc<dyn Store>,
        paths: PathResolver,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            blob,
            store,
            paths,
            work_dir: work_dir.into(),
        }
    }

    /// Compile the run's counters, update its metrics and job stats.
    ///
    /// The caller persists `run`.
    pub fn compile(&self, run: &mut PipelineRun) -> StatsResult<StatsOutcome> {
        let folder = self.paths.output_with_version(run);
        let names = self.blob.list_by_prefix(&format!("{}/", folder))?;
        let counter_files: Vec<&String> = names.iter().filter(|n| n.ends_with("count")).collect();
        if counter_files.is_empty() {
            tracing::debug!(run_id = run.id, "No counter files yet");
            return Ok(StatsOutcome::NoCounters);
        }

        let local_dir = self.work_dir.join(run.id.to_string()).join("stats");
        let mut entries = Vec::new();
        for name in counter_files {
            let path = format!("{}/{}", folder, name);
            let local = self.blob.download(&path, &local_dir)?;
            let content = read_and_remove(&local)?;
            entries.extend(parse_counter_file(&path, &content)?);
        }

        let metrics = derive_metrics(&entries);
        self.upload_summary(run, &summary_records(&entries, &metrics), &local_dir)?;

        if let Some(total) = metrics.total_reads {
            run.total_reads = Some(total);
        }
        if let Some(truncated) = metrics.truncated {
            run.truncated = Some(truncated);
        }
        if metrics.has_fraction() {
            run.fraction_subsampled = Some(metrics.fraction_subsampled);
        }
        if let Some(adjusted) = metrics.adjusted_remaining_reads {
            run.adjusted_remaining_reads = Some(adjusted);
        }
        if let Some(unmapped) = metrics.unmapped_reads {
            run.unmapped_reads = Some(unmapped);
        }

        tracing::debug!(run_id = run.id, entries = entries.len(), "Compiled stats");
        self.store.replace_job_stats(run.id, entries)?;
        Ok(StatsOutcome::Compiled(metrics))
    }

    /// Write the summary file; a failed upload is only logged.
    fn upload_summary(
        &self,
        run: &PipelineRun,
        records: &[StatsRecord],
        local_dir: &Path,
    ) -> StatsResult<()> {
        let target = self.paths.stats_summary_path(run);
        let local = local_dir.join(basename(&target));
        let json = serde_json::to_string(records)
            .map_err(|e| StatsError::malformed(&target, e.to_string()))?;
        fs::create_dir_all(local_dir).map_err(|e| StatsError::Io {
            path: local_dir.to_path_buf(),
            source: e,
        })?;
        fs::write(&local, json).map_err(|e| StatsError::Io {
            path: local.clone(),
            source: e,
        })?;

        if let Err(e) = self.blob.upload(&local, &target) {
            tracing::warn!(run_id = run.id, "Failed to write compiled stats file: {}", e);
        }
        let _ = fs::remove_file(&local);
        Ok(())
    }
}

fn read_and_remove(local: &Path) -> StatsResult<String> {
    let content = fs::read_to_string(local).map_err(|e| StatsError::Io {
        path: local.to_path_buf(),
        source: e,
    })?;
    let _ = fs::remove_file(local);
    Ok(content)
}
