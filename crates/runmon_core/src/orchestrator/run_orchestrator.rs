//! Per-run tick: stage progression, result monitoring and finalization.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::errors::{MonitorError, MonitorResult};
use crate::chunks::poll_chunk_progress;
use crate::config::Settings;
use crate::external::{BlobStore, JobRunner, Store, Telemetry, WorkQueue};
use crate::models::{
    LoadState, OutputKind, OutputState, PipelineRun, PipelineVersion, ResultRows, ResultTable,
    ResultsFinalized, RunId, RunStatus,
};
use crate::paths::PathResolver;
use crate::results::{total_ercc_reads, ResultMonitor};
use crate::stages::{StageAdvance, StageStateMachine};
use crate::stats::StatsCompiler;

pub const SUCCEEDED_RUN_TIME_METRIC: &str = "samples.succeeded.run_time";

/// External services the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub blob: Arc<dyn BlobStore>,
    pub store: Arc<dyn Store>,
    pub runner: Arc<dyn JobRunner>,
    pub queue: Arc<dyn WorkQueue>,
    pub telemetry: Arc<dyn Telemetry>,
}

/// Path resolver for the configured bucket and assembly threshold.
pub fn path_resolver(settings: &Settings) -> MonitorResult<PathResolver> {
    let assembly_version = settings
        .pipeline
        .assembly_version
        .parse::<PipelineVersion>()
        .map_err(|e| MonitorError::invalid_setting("pipeline.assembly_version", e))?;
    Ok(PathResolver::new(
        settings.paths.samples_bucket.clone(),
        assembly_version,
    ))
}

/// Outcome of one tick, for logging and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub run_id: RunId,
    /// `None` when the stage machine was not advanced (run already finalized).
    pub stage: Option<StageAdvance>,
    pub outputs: Vec<OutputState>,
    pub stats_failed: bool,
    pub results_finalized: ResultsFinalized,
    pub job_status: Option<String>,
}

/// Top-level driver: one serialized tick per run.
pub struct PipelineRunOrchestrator {
    stages: StageStateMachine,
    monitor: ResultMonitor,
    stats: StatsCompiler,
    paths: PathResolver,
    blob: Arc<dyn BlobStore>,
    store: Arc<dyn Store>,
    telemetry: Arc<dyn Telemetry>,
    max_stats_failures: u32,
    busy: Mutex<HashSet<RunId>>,
}

/// Marks a run as busy until dropped.
struct RunClaim<'a> {
    busy: &'a Mutex<HashSet<RunId>>,
    run_id: RunId,
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        self.busy.lock().remove(&self.run_id);
    }
}

impl PipelineRunOrchestrator {
    pub fn new(deps: Collaborators, settings: &Settings) -> MonitorResult<Self> {
        let paths = path_resolver(settings)?;
        let work_dir = PathBuf::from(&settings.paths.work_dir);

        let stages = StageStateMachine::new(
            deps.runner,
            deps.telemetry.clone(),
            paths.clone(),
            settings.pipeline.clone(),
            settings.monitor.long_run_threshold(),
        );
        let monitor = ResultMonitor::new(
            deps.blob.clone(),
            deps.store.clone(),
            deps.queue,
            paths.clone(),
            work_dir.clone(),
            settings.monitor.output_grace(),
        );
        let stats = StatsCompiler::new(deps.blob.clone(), deps.store.clone(), paths.clone(), work_dir);

        Ok(Self {
            stages,
            monitor,
            stats,
            paths,
            blob: deps.blob,
            store: deps.store,
            telemetry: deps.telemetry,
            max_stats_failures: settings.monitor.max_stats_failures.max(1),
            busy: Mutex::new(HashSet::new()),
        })
    }

    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    pub fn tick(&self, run_id: RunId) -> MonitorResult<TickReport> {
        self.tick_at(run_id, Utc::now())
    }

    /// Advance one run as of `now`.
    ///
    /// Only store failures abort the tick. Blob, queue and stats failures
    /// are logged and re-evaluated on the next tick.
    pub fn tick_at(&self, run_id: RunId, now: DateTime<Utc>) -> MonitorResult<TickReport> {
        let _claim = self.claim(run_id)?;
        let mut run = self.store.run(run_id)?;

        let mut stage = None;
        if !run.finalized {
            let ready = report_ready(&self.store.output_states(run_id)?);
            stage = Some(self.stages.advance(&mut run, ready, now));
        }

        let mut stats_failed = false;
        if !run.results_finalized.is_terminal() {
            stats_failed = self.monitor_results(&mut run, now)?;
        }

        let outputs = self.store.output_states(run_id)?;
        refresh_ready(&mut run, &outputs);
        self.store.save_run(&run)?;

        let report = TickReport {
            run_id,
            stage,
            outputs,
            stats_failed,
            results_finalized: run.results_finalized,
            job_status: run.job_status.as_ref().map(RunStatus::to_string),
        };
        tracing::debug!(
            run_id,
            job_status = report.job_status.as_deref().unwrap_or("-"),
            results = ?report.results_finalized,
            "Tick complete"
        );
        Ok(report)
    }

    /// Tick every run that still has work, in id order.
    ///
    /// A failing run is logged and skipped.
    pub fn tick_all(&self) -> MonitorResult<Vec<TickReport>> {
        let now = Utc::now();
        let mut reports = Vec::new();
        for run_id in self.store.run_ids()? {
            let run = self.store.run(run_id)?;
            if run.finalized && run.results_finalized.is_terminal() {
                continue;
            }
            match self.tick_at(run_id, now) {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!(run_id, "Tick failed: {}", e),
            }
        }
        Ok(reports)
    }

    /// Retry a run in failure.
    ///
    /// Returns `false` when the run is not in failure. Outputs that already
    /// loaded are kept; every other output is polled again from UNKNOWN.
    pub fn retry(&self, run_id: RunId) -> MonitorResult<bool> {
        let _claim = self.claim(run_id)?;
        let mut run = self.store.run(run_id)?;
        if !self.stages.reset_failed(&mut run, Utc::now()) {
            tracing::info!(run_id, "Run is not in failure, nothing to retry");
            return Ok(false);
        }
        run.stats_failures = 0;
        for output in self.store.output_states(run_id)? {
            if output.state != LoadState::Loaded {
                self.store
                    .set_output_state(run_id, output.output, LoadState::Unknown)?;
            }
        }
        self.store.save_run(&run)?;
        Ok(true)
    }

    /// Return outputs left queued or loading by an earlier process to UNKNOWN.
    ///
    /// The in-process queue does not survive a restart, so call this once
    /// before any worker starts.
    pub fn recover_interrupted_ingestion(&self) -> MonitorResult<usize> {
        let mut recovered = 0;
        for run_id in self.store.run_ids()? {
            for output in self.store.output_states(run_id)? {
                if matches!(output.state, LoadState::LoadingQueued | LoadState::Loading) {
                    self.store
                        .set_output_state(run_id, output.output, LoadState::Unknown)?;
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, "Reset interrupted ingestion tasks");
        }
        Ok(recovered)
    }

    fn claim(&self, run_id: RunId) -> MonitorResult<RunClaim<'_>> {
        if !self.busy.lock().insert(run_id) {
            return Err(MonitorError::RunBusy(run_id));
        }
        Ok(RunClaim {
            busy: &self.busy,
            run_id,
        })
    }

    /// Poll outputs, compile stats and apply the finalization rule.
    ///
    /// Returns whether the stats compile failed this tick.
    fn monitor_results(&self, run: &mut PipelineRun, now: DateTime<Utc>) -> MonitorResult<bool> {
        let had_version = run.pipeline_version.is_some();
        let has_version = self.monitor.discover_version(run).unwrap_or_else(|e| {
            tracing::warn!(run_id = run.id, "Pipeline version check failed: {}", e);
            false
        });
        if has_version && !had_version {
            // Workers read output paths from the stored run.
            self.store.save_run(run)?;
        }
        if !has_version && !run.finalized {
            tracing::debug!(run_id = run.id, "No pipeline version yet");
            return Ok(false);
        }

        for output in self.store.output_states(run.id)? {
            if let Err(e) = self.monitor.advance(run, output, now) {
                tracing::warn!(run_id = run.id, output = %output.output, "Output check failed: {}", e);
            }
        }

        let stats_failed = match self.compile_stats(run) {
            Ok(()) => false,
            Err(e) => {
                tracing::warn!(run_id = run.id, "{}", e);
                true
            }
        };

        if !stats_failed {
            run.stats_failures = 0;
        }

        let outputs = self.store.output_states(run.id)?;
        self.copy_ercc_total(run, &outputs)?;
        self.finalize_results(run, &outputs, stats_failed, now);
        Ok(stats_failed)
    }

    /// The ercc worker writes rows only; the run total is derived here.
    fn copy_ercc_total(&self, run: &mut PipelineRun, outputs: &[OutputState]) -> MonitorResult<()> {
        let loaded = outputs
            .iter()
            .any(|o| o.output == OutputKind::ErccCounts && o.state == LoadState::Loaded);
        if !loaded {
            return Ok(());
        }
        if let ResultRows::ErccCounts(rows) = self.store.rows(run.id, ResultTable::ErccCounts)? {
            run.total_ercc_reads = Some(total_ercc_reads(&rows, run.sample.input_file_count));
        }
        Ok(())
    }

    fn compile_stats(&self, run: &mut PipelineRun) -> MonitorResult<()> {
        self.stats.compile(run)?;
        poll_chunk_progress(self.blob.as_ref(), &self.paths, run)?;
        Ok(())
    }

    fn finalize_results(
        &self,
        run: &mut PipelineRun,
        outputs: &[OutputState],
        stats_failed: bool,
        now: DateTime<Utc>,
    ) {
        if !outputs.iter().all(|o| o.state.is_terminal()) {
            return;
        }
        let failed: Vec<OutputKind> = outputs
            .iter()
            .filter(|o| o.state == LoadState::Failed)
            .map(|o| o.output)
            .collect();

        if !failed.is_empty() {
            run.results_finalized = ResultsFinalized::FinalizedFail;
            tracing::warn!(run_id = run.id, failed = ?failed, "Results finalized with failures");
        } else if stats_failed {
            run.stats_failures += 1;
            if run.stats_failures >= self.max_stats_failures {
                run.results_finalized = ResultsFinalized::FinalizedFail;
                tracing::warn!(
                    run_id = run.id,
                    failures = run.stats_failures,
                    "Results finalized as failed, stats never compiled"
                );
            } else {
                tracing::info!(run_id = run.id, "Outputs loaded, waiting for a stats compile");
            }
        } else {
            run.results_finalized = ResultsFinalized::FinalizedSuccess;
            let elapsed = (now - run.created_at).num_seconds() as f64;
            self.telemetry.emit_metric(
                SUCCEEDED_RUN_TIME_METRIC,
                elapsed,
                &[format!("sample_id:{}", run.sample.id)],
            );
            tracing::info!(run_id = run.id, "Results finalized");
        }
    }
}

fn report_ready(outputs: &[OutputState]) -> bool {
    outputs
        .iter()
        .any(|o| o.output == OutputKind::REPORT_READY && o.state == LoadState::Loaded)
}

/// Keep the READY suffix current once the stage machine has stopped.
fn refresh_ready(run: &mut PipelineRun, outputs: &[OutputState]) {
    if let Some(RunStatus::Stage { ready, .. }) = run.job_status.as_mut() {
        *ready = report_ready(outputs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_ready_tracks_taxon_counts() {
        let mut outputs: Vec<OutputState> =
            OutputKind::ALL.iter().map(|k| OutputState::unknown(*k)).collect();
        assert!(!report_ready(&outputs));
        for o in outputs.iter_mut() {
            if o.output == OutputKind::TaxonCounts {
                o.state = LoadState::Loaded;
            }
        }
        assert!(report_ready(&outputs));
    }

    #[test]
    fn invalid_assembly_version_is_rejected() {
        let mut settings = Settings::default();
        settings.pipeline.assembly_version = "abc".to_string();
        let err = path_resolver(&settings).unwrap_err();
        assert!(matches!(err, MonitorError::InvalidSetting { ref key, .. } if key == "pipeline.assembly_version"));
    }
}
