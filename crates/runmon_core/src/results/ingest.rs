//! Ingestion tasks: download one output, parse it and replace its rows.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::enrich::{enrich_taxon_counts, LineageSnapshot};
use super::parsers::{self, ParseError};
use crate::external::{
    BlobError, BlobStore, InProcessQueue, IngestTask, QueueError, Store, StoreError,
};
use crate::models::{LoadState, OutputKind, PipelineRun, ResultRows};
use crate::paths::PathResolver;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Download of '{path}' failed after {attempts} attempts: {source}")]
    Download {
        path: String,
        attempts: u32,
        #[source]
        source: BlobError,
    },

    #[error("Failed to parse {output} from '{path}': {source}")]
    Parse {
        output: OutputKind,
        path: String,
        #[source]
        source: ParseError,
    },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl IngestError {
    fn parse(output: OutputKind, path: impl Into<String>, source: ParseError) -> Self {
        Self::Parse {
            output,
            path: path.into(),
            source,
        }
    }
}

pub type IngestResult<T> = Result<T, IngestError>;

/// Bounded retry for downloads with a fixed backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Download `path` into `local_dir`, retrying each failure.
    pub fn download(
        &self,
        blob: &dyn BlobStore,
        path: &str,
        local_dir: &Path,
    ) -> IngestResult<PathBuf> {
        let mut attempt = 1;
        loop {
            match blob.download(path, local_dir) {
                Ok(local) => return Ok(local),
                Err(e) if attempt >= self.attempts => {
                    return Err(IngestError::Download {
                        path: path.to_string(),
                        attempts: attempt,
                        source: e,
                    })
                }
                Err(e) => {
                    tracing::debug!(path, attempt, "Download failed, retrying: {}", e);
                    attempt += 1;
                    if !self.backoff.is_zero() {
                        std::thread::sleep(self.backoff);
                    }
                }
            }
        }
    }
}

/// Executes ingestion tasks for every output kind.
pub struct Ingestor {
    blob: Arc<dyn BlobStore>,
    store: Arc<dyn Store>,
    paths: PathResolver,
    work_dir: PathBuf,
    retry: RetryPolicy,
    lineage: Arc<LineageSnapshot>,
}

impl Ingestor {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        store: Arc<dyn Store>,
        paths: PathResolver,
        work_dir: impl Into<PathBuf>,
        retry: RetryPolicy,
        lineage: Arc<LineageSnapshot>,
    ) -> Self {
        Self {
            blob,
            store,
            paths,
            work_dir: work_dir.into(),
            retry,
            lineage,
        }
    }

    /// Run one task, leaving the output LOADED or LOADING_ERROR.
    ///
    /// Any failure after the task was taken, store writes included, ends in
    /// LOADING_ERROR so the next tick polls the output again.
    pub fn run(&self, task: IngestTask) -> IngestResult<()> {
        let IngestTask { run_id, output } = task;
        let result = self
            .store
            .set_output_state(run_id, output, LoadState::Loading)
            .and_then(|()| self.store.run(run_id))
            .map_err(IngestError::from)
            .and_then(|run| self.load(&run, output))
            .and_then(|()| {
                self.store
                    .set_output_state(run_id, output, LoadState::Loaded)
                    .map_err(IngestError::from)
            });

        match result {
            Ok(()) => {
                tracing::info!(run_id, output = %output, "Loaded output");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(run_id, output = %output, "Loading output failed: {}", e);
                if let Err(mark) = self
                    .store
                    .set_output_state(run_id, output, LoadState::LoadingError)
                {
                    tracing::error!(run_id, output = %output, "Could not mark output for retry: {}", mark);
                }
                Err(e)
            }
        }
    }

    fn load(&self, run: &PipelineRun, output: OutputKind) -> IngestResult<()> {
        let local_dir = self.work_dir.join(run.id.to_string()).join(output.as_str());
        match output {
            OutputKind::ErccCounts => {
                let (path, content) = self.fetch(&self.paths.output_path(run, output), &local_dir)?;
                let rows = parsers::parse_ercc_counts(&content)
                    .map_err(|e| IngestError::parse(output, path, e))?;
                self.store.replace_rows(run.id, ResultRows::ErccCounts(rows))?;
            }
            OutputKind::TaxonCounts => {
                let (path, content) = self.fetch(&self.paths.output_path(run, output), &local_dir)?;
                let multihit = PathResolver::is_multihit(run);
                let refined = self.paths.is_assembly(run);
                let rows = parsers::parse_taxon_counts(&content, multihit, refined)
                    .map_err(|e| IngestError::parse(output, path, e))?;
                let rows = enrich_taxon_counts(rows, multihit, &self.lineage);
                self.store.replace_rows(run.id, ResultRows::TaxonCounts(rows))?;
            }
            OutputKind::TaxonByteranges => {
                let (path, content) = self.fetch(&self.paths.output_path(run, output), &local_dir)?;
                let rows = parsers::parse_taxon_byteranges(&content)
                    .map_err(|e| IngestError::parse(output, path, e))?;
                self.store
                    .replace_rows(run.id, ResultRows::TaxonByteranges(rows))?;
            }
            OutputKind::ContigCounts => self.load_contigs(run, &local_dir)?,
            OutputKind::AmrCounts => {
                let (path, content) = self.fetch(&self.paths.output_path(run, output), &local_dir)?;
                let rows = parsers::parse_amr_counts(&content)
                    .map_err(|e| IngestError::parse(output, path, e))?;
                self.store.replace_rows(run.id, ResultRows::AmrCounts(rows))?;
            }
        }
        Ok(())
    }

    /// Contig counts, then the contigs themselves.
    fn load_contigs(&self, run: &PipelineRun, local_dir: &Path) -> IngestResult<()> {
        let output = OutputKind::ContigCounts;
        let (path, content) = self.fetch(&self.paths.output_path(run, output), local_dir)?;
        let (counts, assignments) =
            parsers::parse_contig_counts(&content).map_err(|e| IngestError::parse(output, path, e))?;

        let (stats_path, stats) = self.fetch(&self.paths.contig_stats_path(run), local_dir)?;
        let read_counts = parsers::parse_contig_stats(&stats)
            .map_err(|e| IngestError::parse(output, stats_path, e))?;

        let contigs = if read_counts.is_empty() {
            Vec::new()
        } else {
            let (_, fasta) = self.fetch(&self.paths.contigs_fasta_path(run), local_dir)?;
            parsers::parse_contigs(&fasta, &read_counts, &assignments, &self.lineage)
        };

        self.store.replace_tables(
            run.id,
            vec![ResultRows::ContigCounts(counts), ResultRows::Contigs(contigs)],
        )?;
        Ok(())
    }

    /// Download with retry and return `(path, contents)`; the local copy is removed.
    fn fetch(&self, path: &str, local_dir: &Path) -> IngestResult<(String, String)> {
        let local = self.retry.download(self.blob.as_ref(), path, local_dir)?;
        let content = fs::read_to_string(&local).map_err(|e| IngestError::Io {
            path: local.clone(),
            source: e,
        })?;
        if let Err(e) = fs::remove_file(&local) {
            tracing::debug!(path = %local.display(), "Could not remove download: {}", e);
        }
        Ok((path.to_string(), content))
    }
}

/// Worker loop: run tasks from `queue` until it is closed.
///
/// Returns the number of tasks executed. Task failures are recorded on
/// the output state and do not stop the worker.
pub fn run_worker(queue: &InProcessQueue, ingestor: &Ingestor, poll: Duration) -> usize {
    let mut executed = 0;
    loop {
        match queue.take(poll) {
            Ok(Some(task)) => {
                if let Err(e) = ingestor.run(task) {
                    tracing::debug!(run_id = task.run_id, output = %task.output, "Task failed: {}", e);
                }
                queue.complete(&task);
                executed += 1;
            }
            Ok(None) => continue,
            Err(QueueError::Closed) => return executed,
        }
    }
}

/// Run every pending task on the calling thread.
pub fn drain_queue(queue: &InProcessQueue, ingestor: &Ingestor) -> usize {
    let tasks = queue.drain();
    for task in &tasks {
        if let Err(e) = ingestor.run(*task) {
            tracing::debug!(run_id = task.run_id, output = %task.output, "Task failed: {}", e);
        }
        queue.complete(task);
    }
    tasks.len()
}
