//! Per-output polling and ingestion dispatch.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::external::{BlobStore, IngestTask, Store, WorkQueue};
use crate::models::{LoadState, OutputState, PipelineRun, PipelineVersion};
use crate::orchestrator::MonitorResult;
use crate::paths::PathResolver;

/// Decides when each output can be ingested, or has failed for good.
pub struct ResultMonitor {
    blob: Arc<dyn BlobStore>,
    store: Arc<dyn Store>,
    queue: Arc<dyn WorkQueue>,
    paths: PathResolver,
    work_dir: PathBuf,
    grace: Duration,
}

impl ResultMonitor {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        store: Arc<dyn Store>,
        queue: Arc<dyn WorkQueue>,
        paths: PathResolver,
        work_dir: impl Into<PathBuf>,
        grace: Duration,
    ) -> Self {
        Self {
            blob,
            store,
            queue,
            paths,
            work_dir: work_dir.into(),
            grace,
        }
    }

    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    /// Pick up the pipeline version once the first stage has published it.
    ///
    /// Returns whether the run has a version afterwards.
    pub fn discover_version(&self, run: &mut PipelineRun) -> MonitorResult<bool> {
        if run.pipeline_version.is_some() {
            return Ok(true);
        }
        let path = self.paths.pipeline_version_file(run);
        if !self.blob.exists(&path)? {
            return Ok(false);
        }

        let local_dir = self.work_dir.join(run.id.to_string());
        let local = self.blob.download(&path, &local_dir)?;
        let content = fs::read_to_string(&local);
        let _ = fs::remove_file(&local);
        let content = content.map_err(|e| crate::orchestrator::MonitorError::io(&path, e))?;

        match content.parse::<PipelineVersion>() {
            Ok(version) => {
                tracing::info!(run_id = run.id, version = %version, "Discovered pipeline version");
                run.pipeline_version = Some(version);
                Ok(true)
            }
            Err(message) => {
                tracing::warn!(run_id = run.id, "Ignoring pipeline version file: {}", message);
                Ok(false)
            }
        }
    }

    /// Advance one output; returns its state afterwards.
    pub fn advance(
        &self,
        run: &PipelineRun,
        output: OutputState,
        now: DateTime<Utc>,
    ) -> MonitorResult<LoadState> {
        let OutputState { output, state } = output;
        if !state.is_retry_eligible() {
            return Ok(state);
        }

        let path = self.paths.output_path(run, output);
        if self.blob.exists(&path)? {
            // Queued before enqueueing, so a fast worker's LOADING is not overwritten.
            self.store
                .set_output_state(run.id, output, LoadState::LoadingQueued)?;
            match self.queue.enqueue(IngestTask::new(run.id, output)) {
                Ok(true) => {
                    tracing::info!(run_id = run.id, output = %output, "Queued ingestion");
                    Ok(LoadState::LoadingQueued)
                }
                Ok(false) => {
                    // A previous task still holds the key; poll again next tick.
                    self.store.set_output_state(run.id, output, state)?;
                    Ok(state)
                }
                Err(e) => {
                    self.store.set_output_state(run.id, output, state)?;
                    Err(e.into())
                }
            }
        } else if run.finalized && self.producer_stopped(run, now) {
            tracing::warn!(run_id = run.id, output = %output, path, "Output never appeared");
            self.store.set_output_state(run.id, output, LoadState::Failed)?;
            Ok(LoadState::Failed)
        } else {
            Ok(state)
        }
    }

    /// The last stage has not been updated within the grace period.
    fn producer_stopped(&self, run: &PipelineRun, now: DateTime<Utc>) -> bool {
        run.last_stage()
            .is_some_and(|stage| stage.updated_at < now - self.grace)
    }
}
