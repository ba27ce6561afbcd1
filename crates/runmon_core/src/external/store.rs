//! Persistence for runs, stages, output states and ingested rows.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
    JobStat, LoadState, NewRun, OutputKind, OutputState, PipelineRun, ResultRows, ResultTable,
    RunId,
};

/// Errors from the store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Pipeline run {0} not found")]
    RunNotFound(RunId),

    #[error("Output {output} not tracked for pipeline run {run_id}")]
    OutputNotFound { run_id: RunId, output: OutputKind },

    #[error("I/O error in {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to (de)serialize store state: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub fn io(operation: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Keyed persistence with bulk-replace for ingested rows.
///
/// Each method is atomic on its own. The run row (with its stages) is written
/// only by the orchestrator; output states and result rows are also written by
/// ingestion workers.
pub trait Store: Send + Sync {
    /// Create a run with its stages and one UNKNOWN state per output.
    fn create_run(&self, new_run: NewRun) -> StoreResult<PipelineRun>;

    fn run(&self, run_id: RunId) -> StoreResult<PipelineRun>;

    fn run_ids(&self) -> StoreResult<Vec<RunId>>;

    /// Write the run row and its stage rows.
    fn save_run(&self, run: &PipelineRun) -> StoreResult<()>;

    fn output_states(&self, run_id: RunId) -> StoreResult<Vec<OutputState>>;

    fn set_output_state(
        &self,
        run_id: RunId,
        output: OutputKind,
        state: LoadState,
    ) -> StoreResult<()>;

    fn job_stats(&self, run_id: RunId) -> StoreResult<Vec<JobStat>>;

    /// Destroy all job stats for the run, then insert `stats`.
    fn replace_job_stats(&self, run_id: RunId, stats: Vec<JobStat>) -> StoreResult<()>;

    fn rows(&self, run_id: RunId, table: ResultTable) -> StoreResult<ResultRows>;

    /// Replace every row of `rows.table()` for the run.
    fn replace_rows(&self, run_id: RunId, rows: ResultRows) -> StoreResult<()> {
        self.replace_tables(run_id, vec![rows])
    }

    /// Replace several tables for the run in one mutation: either every
    /// table is replaced or none is.
    fn replace_tables(&self, run_id: RunId, tables: Vec<ResultRows>) -> StoreResult<()>;
}

/// Everything persisted for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunRecord {
    run: PipelineRun,
    outputs: BTreeMap<OutputKind, LoadState>,
    #[serde(default)]
    job_stats: Vec<JobStat>,
    #[serde(default)]
    results: BTreeMap<ResultTable, ResultRows>,
}

/// Persistent store state (saved to the store file).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreState {
    version: u32,
    next_id: RunId,
    runs: BTreeMap<RunId, RunRecord>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            version: 1,
            next_id: 1,
            runs: BTreeMap::new(),
        }
    }
}

/// In-memory store, optionally persisted as a JSON file.
///
/// Every mutation rewrites the file atomically (temp file, then rename)
/// while holding the state lock, so readers in the same process never
/// see a partial write. A mutation whose write fails is rolled back in
/// memory too.
#[derive(Debug)]
pub struct FileStore {
    state: Mutex<StoreState>,
    path: Option<PathBuf>,
}

impl FileStore {
    /// Open (or start) a store persisted at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let content =
                fs::read_to_string(&path).map_err(|e| StoreError::io("reading store file", e))?;
            let state: StoreState = serde_json::from_str(&content)?;
            tracing::info!("Loaded {} pipeline runs from {}", state.runs.len(), path.display());
            state
        } else {
            StoreState::default()
        };

        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
        })
    }

    /// Create a store without persistence (for testing).
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            path: None,
        }
    }

    fn persist(&self, state: &StoreState) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io("creating store dir", e))?;
        }

        let json = serde_json::to_string_pretty(state)?;
        let temp_file = path.with_extension("json.tmp");
        fs::write(&temp_file, &json).map_err(|e| StoreError::io("writing store file", e))?;
        fs::rename(&temp_file, path).map_err(|e| StoreError::io("renaming store file", e))?;
        Ok(())
    }

    /// Apply a mutation to one run record and persist.
    fn update<T>(
        &self,
        run_id: RunId,
        f: impl FnOnce(&mut RunRecord) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut state = self.state.lock();
        let record = state
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        let before = record.clone();

        let result = f(record).and_then(|value| self.persist(&state).map(|()| value));
        if result.is_err() {
            state.runs.insert(run_id, before);
        }
        result
    }

    fn read<T>(&self, run_id: RunId, f: impl FnOnce(&RunRecord) -> T) -> StoreResult<T> {
        let state = self.state.lock();
        state
            .runs
            .get(&run_id)
            .map(f)
            .ok_or(StoreError::RunNotFound(run_id))
    }
}

impl Store for FileStore {
    fn create_run(&self, new_run: NewRun) -> StoreResult<PipelineRun> {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        let run = PipelineRun::new(id, new_run, Utc::now());
        let outputs = OutputKind::ALL
            .iter()
            .map(|o| (*o, LoadState::Unknown))
            .collect();
        state.runs.insert(
            id,
            RunRecord {
                run: run.clone(),
                outputs,
                job_stats: Vec::new(),
                results: BTreeMap::new(),
            },
        );
        if let Err(e) = self.persist(&state) {
            state.runs.remove(&id);
            state.next_id = id;
            return Err(e);
        }
        tracing::info!(run_id = id, sample_id = run.sample.id, "Created pipeline run");
        Ok(run)
    }

    fn run(&self, run_id: RunId) -> StoreResult<PipelineRun> {
        self.read(run_id, |r| r.run.clone())
    }

    fn run_ids(&self) -> StoreResult<Vec<RunId>> {
        Ok(self.state.lock().runs.keys().copied().collect())
    }

    fn save_run(&self, run: &PipelineRun) -> StoreResult<()> {
        self.update(run.id, |record| {
            record.run = run.clone();
            Ok(())
        })
    }

    fn output_states(&self, run_id: RunId) -> StoreResult<Vec<OutputState>> {
        self.read(run_id, |r| {
            r.outputs
                .iter()
                .map(|(output, state)| OutputState {
                    output: *output,
                    state: *state,
                })
                .collect()
        })
    }

    fn set_output_state(
        &self,
        run_id: RunId,
        output: OutputKind,
        state: LoadState,
    ) -> StoreResult<()> {
        self.update(run_id, |record| {
            let slot = record
                .outputs
                .get_mut(&output)
                .ok_or(StoreError::OutputNotFound { run_id, output })?;
            *slot = state;
            Ok(())
        })
    }

    fn job_stats(&self, run_id: RunId) -> StoreResult<Vec<JobStat>> {
        self.read(run_id, |r| r.job_stats.clone())
    }

    fn replace_job_stats(&self, run_id: RunId, stats: Vec<JobStat>) -> StoreResult<()> {
        self.update(run_id, |record| {
            record.job_stats = stats;
            Ok(())
        })
    }

    fn rows(&self, run_id: RunId, table: ResultTable) -> StoreResult<ResultRows> {
        self.read(run_id, |r| {
            r.results
                .get(&table)
                .cloned()
                .unwrap_or_else(|| ResultRows::empty(table))
        })
    }

    fn replace_tables(&self, run_id: RunId, tables: Vec<ResultRows>) -> StoreResult<()> {
        self.update(run_id, |record| {
            for rows in tables {
                record.results.insert(rows.table(), rows);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ErccCount, SampleRef};
    use tempfile::tempdir;

    fn new_run() -> NewRun {
        NewRun {
            sample: SampleRef {
                id: 11,
                project_id: 2,
                input_file_count: 1,
            },
            alignment_config: "2018-02-15".to_string(),
            subsample: None,
        }
    }

    #[test]
    fn create_run_tracks_every_output() {
        let store = FileStore::in_memory();
        let run = store.create_run(new_run()).unwrap();

        let outputs = store.output_states(run.id).unwrap();
        assert_eq!(outputs.len(), OutputKind::ALL.len());
        assert!(outputs.iter().all(|o| o.state == LoadState::Unknown));
    }

    #[test]
    fn missing_run_is_an_error() {
        let store = FileStore::in_memory();
        assert!(matches!(store.run(99), Err(StoreError::RunNotFound(99))));
    }

    #[test]
    fn replace_rows_supersedes_previous_rows() {
        let store = FileStore::in_memory();
        let run = store.create_run(new_run()).unwrap();
        let rows = |n: u64| {
            ResultRows::ErccCounts(
                (0..n)
                    .map(|i| ErccCount {
                        name: format!("ERCC-{}", i),
                        count: i,
                    })
                    .collect(),
            )
        };

        store.replace_rows(run.id, rows(3)).unwrap();
        store.replace_rows(run.id, rows(2)).unwrap();

        assert_eq!(store.rows(run.id, ResultTable::ErccCounts).unwrap().len(), 2);
        assert!(store.rows(run.id, ResultTable::Contigs).unwrap().is_empty());
    }

    #[test]
    fn replace_tables_swaps_each_table() {
        let store = FileStore::in_memory();
        let run = store.create_run(new_run()).unwrap();
        store
            .replace_tables(
                run.id,
                vec![ResultRows::ContigCounts(Vec::new()), ResultRows::Contigs(Vec::new())],
            )
            .unwrap();
        assert!(store.rows(run.id, ResultTable::ContigCounts).unwrap().is_empty());
        assert!(matches!(
            store.replace_tables(99, Vec::new()),
            Err(StoreError::RunNotFound(99))
        ));
    }

    #[test]
    fn failed_write_leaves_memory_matching_disk() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("state");
        let path = folder.join("store.json");
        let store = FileStore::open(&path).unwrap();
        let run = store.create_run(new_run()).unwrap();

        // Replace the folder with a plain file so the next write fails.
        fs::remove_dir_all(&folder).unwrap();
        fs::write(&folder, "").unwrap();

        let err = store
            .set_output_state(run.id, OutputKind::AmrCounts, LoadState::Loaded)
            .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        let amr = store
            .output_states(run.id)
            .unwrap()
            .into_iter()
            .find(|o| o.output == OutputKind::AmrCounts)
            .unwrap();
        assert_eq!(amr.state, LoadState::Unknown);

        assert!(store.create_run(new_run()).is_err());
        assert_eq!(store.run_ids().unwrap(), vec![run.id]);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let id = {
            let store = FileStore::open(&path).unwrap();
            let run = store.create_run(new_run()).unwrap();
            store
                .set_output_state(run.id, OutputKind::AmrCounts, LoadState::Loaded)
                .unwrap();
            store
                .replace_job_stats(
                    run.id,
                    vec![JobStat {
                        task: "star_out".to_string(),
                        reads_after: 5,
                    }],
                )
                .unwrap();
            run.id
        };

        let reopened = FileStore::open(&path).unwrap();
        let states = reopened.output_states(id).unwrap();
        let amr = states
            .iter()
            .find(|o| o.output == OutputKind::AmrCounts)
            .unwrap();
        assert_eq!(amr.state, LoadState::Loaded);
        assert_eq!(reopened.job_stats(id).unwrap().len(), 1);
        assert!(!path.with_extension("json.tmp").exists());

        let second = reopened.create_run(new_run()).unwrap();
        assert_eq!(second.id, id + 1);
    }
}
