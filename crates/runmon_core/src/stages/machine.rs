//! Forward progression of a run through its stages.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::commands::{build_command, CommandInputs};
use crate::config::PipelineSettings;
use crate::external::{JobRunner, JobRunnerError, RemoteStatus, Telemetry};
use crate::models::{JobHandle, PipelineRun, RunStatus, StageName, StageStatus};
use crate::paths::PathResolver;

pub const RUNNING_RUN_TIME_METRIC: &str = "samples.running.run_time";

/// What one `advance` call did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "stage", rename_all = "snake_case")]
pub enum StageAdvance {
    /// Every stage succeeded; the run is finalized.
    Checked,
    /// The active stage failed; the run is finalized.
    Failed(StageName),
    /// The active stage was dispatched.
    Dispatched(StageName),
    /// Dispatch was rejected and the stage marked failed.
    DispatchFailed(StageName),
    /// The active stage's job was polled.
    Polled { stage: StageName, status: StageStatus },
}

fn map_remote(status: RemoteStatus) -> StageStatus {
    match status {
        RemoteStatus::Runnable => StageStatus::Runnable,
        RemoteStatus::Running => StageStatus::Running,
        RemoteStatus::Succeeded => StageStatus::Succeeded,
        RemoteStatus::Failed => StageStatus::Failed,
    }
}

/// Dispatches and polls the active stage of a run.
pub struct StageStateMachine {
    runner: Arc<dyn JobRunner>,
    telemetry: Arc<dyn Telemetry>,
    paths: PathResolver,
    pipeline: PipelineSettings,
    long_run_threshold: Duration,
}

impl StageStateMachine {
    pub fn new(
        runner: Arc<dyn JobRunner>,
        telemetry: Arc<dyn Telemetry>,
        paths: PathResolver,
        pipeline: PipelineSettings,
        long_run_threshold: Duration,
    ) -> Self {
        Self {
            runner,
            telemetry,
            paths,
            pipeline,
            long_run_threshold,
        }
    }

    /// Advance the run by at most one stage transition.
    ///
    /// `report_ready` says whether the primary report output has loaded;
    /// it only affects the composite status.
    pub fn advance(
        &self,
        run: &mut PipelineRun,
        report_ready: bool,
        now: DateTime<Utc>,
    ) -> StageAdvance {
        let Some(index) = run.active_stage_index() else {
            run.finalized = true;
            run.job_status = Some(RunStatus::Checked);
            tracing::info!(run_id = run.id, "All stages succeeded");
            return StageAdvance::Checked;
        };

        let name = run.stages[index].name;
        let outcome = if run.stages[index].failed() {
            run.finalized = true;
            self.telemetry.emit_alert(&format!(
                "SampleFailedEvent: Sample {} failed {}",
                run.sample.id, name
            ));
            StageAdvance::Failed(name)
        } else if !run.stages[index].started() {
            self.dispatch(run, index, now)
        } else {
            let outcome = self.poll(run, index, now);
            self.check_long_run(run, now);
            outcome
        };

        let stage = &run.stages[index];
        if let Some(status) = stage.job_status {
            run.job_status = Some(RunStatus::Stage {
                name: stage.name,
                status,
                ready: report_ready,
            });
        }
        outcome
    }

    fn dispatch(&self, run: &mut PipelineRun, index: usize, now: DateTime<Utc>) -> StageAdvance {
        let inputs = CommandInputs::for_run(run, &self.paths, &self.pipeline);
        let stage = &mut run.stages[index];
        let command = build_command(stage.name, &self.pipeline.program, &inputs);
        stage.job_command = Some(command.to_string());
        stage.updated_at = now;

        match self.runner.dispatch(&command) {
            Ok(handle) => {
                tracing::info!(run_id = run.id, stage = %stage.name, job = %handle, "Dispatched stage");
                stage.job_handle = Some(handle);
                stage.job_status = Some(StageStatus::Started);
                StageAdvance::Dispatched(stage.name)
            }
            Err(e) => {
                tracing::error!(run_id = run.id, stage = %stage.name, "Stage dispatch failed: {}", e);
                stage.job_status = Some(StageStatus::Failed);
                StageAdvance::DispatchFailed(stage.name)
            }
        }
    }

    fn poll(&self, run: &mut PipelineRun, index: usize, now: DateTime<Utc>) -> StageAdvance {
        let run_id = run.id;
        let stage = &mut run.stages[index];
        let current = stage.job_status.unwrap_or(StageStatus::Started);

        let polled = match &stage.job_handle {
            Some(handle) => self.poll_handle(run_id, stage.name, handle),
            None => {
                tracing::warn!(run_id, stage = %stage.name, "Started stage has no job handle");
                Some(StageStatus::Failed)
            }
        };

        let status = polled.unwrap_or(current);
        if status != current {
            tracing::info!(run_id, stage = %stage.name, from = %current, to = %status, "Stage status changed");
            stage.job_status = Some(status);
            stage.updated_at = now;
        }
        StageAdvance::Polled {
            stage: stage.name,
            status,
        }
    }

    /// `None` leaves the stage unchanged until the next tick.
    fn poll_handle(&self, run_id: u64, name: StageName, handle: &JobHandle) -> Option<StageStatus> {
        match self.runner.poll_status(handle) {
            Ok(status) => Some(map_remote(status)),
            Err(JobRunnerError::UnknownJob(_)) => {
                tracing::warn!(run_id, stage = %name, job = %handle, "Job runner has no record of the job");
                None
            }
            Err(e) => {
                tracing::warn!(run_id, stage = %name, job = %handle, "Polling job failed: {}", e);
                None
            }
        }
    }

    fn check_long_run(&self, run: &mut PipelineRun, now: DateTime<Utc>) {
        let run_time = now - run.created_at;
        let seconds = run_time.num_milliseconds() as f64 / 1000.0;
        let tags = [format!("sample_id:{}", run.sample.id)];
        self.telemetry
            .emit_metric(RUNNING_RUN_TIME_METRIC, seconds, &tags);

        if !run.alert_sent && run_time > self.long_run_threshold {
            let hours = (seconds / 3600.0 * 100.0).round() / 100.0;
            self.telemetry.emit_alert(&format!(
                "LongRunningSampleEvent: Sample {} has been running for {} hours.",
                run.sample.id, hours
            ));
            run.alert_sent = true;
        }
    }

    /// Clear the failed stage so the next `advance` dispatches it again.
    ///
    /// Returns `false` (and changes nothing) unless the run is in failure.
    /// Output states are reset by the caller.
    pub fn reset_failed(&self, run: &mut PipelineRun, now: DateTime<Utc>) -> bool {
        if !run.is_failed() {
            return false;
        }
        if let Some(index) = run.active_stage_index() {
            run.stages[index].reset(now);
        }
        run.finalized = false;
        run.results_finalized = crate::models::ResultsFinalized::InProgress;
        tracing::info!(run_id = run.id, "Retrying failed run");
        true
    }
}
