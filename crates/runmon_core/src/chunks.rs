//! Alignment chunk accounting.
//!
//! The estimate of outstanding chunks is advisory: it is recomputed from
//! live counters each time and feeds the worker autoscaler.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::ChunkSettings;
use crate::external::{BlobResult, BlobStore, Store, StoreResult};
use crate::models::{PipelineRun, RunId};
use crate::paths::PathResolver;

const GSNAP_CHUNK_PREFIX: &str = "multihit-gsnap-out";
const RAPSEARCH_CHUNK_PREFIX: &str = "multihit-rapsearch2-out";
const CHUNK_SUFFIX: &str = ".m8";

/// Job stat whose count is the number of reads entering alignment.
pub const ALIGNMENT_INPUT_TASK: &str = "subsampled_out";

/// Chunking rules of one aligner class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignerConfig {
    pub chunk_size: u64,
    /// Paired inputs count one chunk slot per read pair.
    pub can_pair_chunks: bool,
    pub max_chunks_in_flight: u64,
}

impl AlignerConfig {
    pub fn gsnap(settings: &ChunkSettings) -> Self {
        Self {
            chunk_size: settings.gsnap_chunk_size,
            can_pair_chunks: true,
            max_chunks_in_flight: settings.max_chunks_in_flight,
        }
    }

    pub fn rapsearch(settings: &ChunkSettings) -> Self {
        Self {
            chunk_size: settings.rapsearch_chunk_size,
            can_pair_chunks: false,
            max_chunks_in_flight: settings.max_chunks_in_flight,
        }
    }
}

/// A run that still has alignment work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRun {
    pub run_id: RunId,
    pub paired: bool,
}

/// Outstanding chunks per run for one aligner class.
///
/// Runs with unknown read counts are estimated at one chunk.
pub fn estimate_outstanding_chunks(
    runs: &[ChunkRun],
    known_reads: &HashMap<RunId, u64>,
    config: &AlignerConfig,
    completed: &HashMap<RunId, u64>,
) -> BTreeMap<RunId, u64> {
    runs.iter()
        .map(|run| {
            let estimate = match known_reads.get(&run.run_id) {
                None => 1,
                Some(&reads) => {
                    let reads = if config.can_pair_chunks && run.paired {
                        reads / 2
                    } else {
                        reads
                    };
                    reads.div_ceil(config.chunk_size.max(1))
                }
            };
            let done = completed.get(&run.run_id).copied().unwrap_or(0);
            let outstanding = estimate
                .saturating_sub(done)
                .min(config.max_chunks_in_flight);
            (run.run_id, outstanding)
        })
        .collect()
}

/// Completed `(gsnap, rapsearch)` chunk outputs among `names`.
pub fn count_completed_chunks<S: AsRef<str>>(names: &[S]) -> (u64, u64) {
    let count = |prefix: &str| {
        names
            .iter()
            .map(|n| n.as_ref())
            .filter(|n| n.starts_with(prefix) && n.ends_with(CHUNK_SUFFIX))
            .count() as u64
    };
    (count(GSNAP_CHUNK_PREFIX), count(RAPSEARCH_CHUNK_PREFIX))
}

/// Refresh the run's chunk counters from the chunk output listing.
///
/// Counters only move forward; a shorter listing leaves them alone.
pub fn poll_chunk_progress(
    blob: &dyn BlobStore,
    paths: &PathResolver,
    run: &mut PipelineRun,
) -> BlobResult<()> {
    let names = blob.list_by_prefix(&paths.chunks_prefix(run))?;
    let (gsnap, rapsearch) = count_completed_chunks(&names);
    run.completed_gsnap_chunks = run.completed_gsnap_chunks.max(gsnap);
    run.completed_rapsearch_chunks = run.completed_rapsearch_chunks.max(rapsearch);
    tracing::debug!(
        run_id = run.id,
        gsnap = run.completed_gsnap_chunks,
        rapsearch = run.completed_rapsearch_chunks,
        "Chunk progress"
    );
    Ok(())
}

/// Total outstanding chunks per aligner class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentBacklog {
    pub gsnap: u64,
    pub rapsearch: u64,
}

/// Whether a run may still dispatch alignment chunks.
fn in_alignment_window(run: &PipelineRun) -> bool {
    if run.finalized || run.is_failed() {
        return false;
    }
    !matches!(
        run.job_status.as_ref().and_then(|s| s.step_number()),
        Some(3) | Some(4)
    )
}

/// Outstanding alignment work across every active run in the store.
pub fn alignment_backlog(store: &dyn Store, settings: &ChunkSettings) -> StoreResult<AlignmentBacklog> {
    let mut runs = Vec::new();
    let mut known_reads = HashMap::new();
    let mut gsnap_done = HashMap::new();
    let mut rapsearch_done = HashMap::new();

    for run_id in store.run_ids()? {
        let run = store.run(run_id)?;
        if !in_alignment_window(&run) {
            continue;
        }
        if let Some(stat) = store
            .job_stats(run_id)?
            .into_iter()
            .find(|s| s.task == ALIGNMENT_INPUT_TASK)
        {
            known_reads.insert(run_id, stat.reads_after);
        }
        gsnap_done.insert(run_id, run.completed_gsnap_chunks);
        rapsearch_done.insert(run_id, run.completed_rapsearch_chunks);
        runs.push(ChunkRun {
            run_id,
            paired: run.sample.is_paired(),
        });
    }

    let gsnap = estimate_outstanding_chunks(
        &runs,
        &known_reads,
        &AlignerConfig::gsnap(settings),
        &gsnap_done,
    );
    let rapsearch = estimate_outstanding_chunks(
        &runs,
        &known_reads,
        &AlignerConfig::rapsearch(settings),
        &rapsearch_done,
    );

    Ok(AlignmentBacklog {
        gsnap: gsnap.values().sum(),
        rapsearch: rapsearch.values().sum(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{FileStore, LocalBlobStore};
    use crate::models::{JobStat, NewRun, PipelineVersion, RunStatus, SampleRef, StageName, StageStatus};
    use chrono::Utc;
    use tempfile::tempdir;

    fn gsnap() -> AlignerConfig {
        AlignerConfig::gsnap(&ChunkSettings::default())
    }

    #[test]
    fn large_unpaired_input_is_capped() {
        let runs = [ChunkRun { run_id: 1, paired: false }];
        let known = HashMap::from([(1, 2_000_000)]);
        let out = estimate_outstanding_chunks(&runs, &known, &gsnap(), &HashMap::new());
        assert_eq!(out[&1], 32);
    }

    #[test]
    fn paired_input_halves_and_subtracts_completed() {
        let runs = [ChunkRun { run_id: 1, paired: true }];
        let known = HashMap::from([(1, 300_000)]);
        let completed = HashMap::from([(1, 10)]);
        let out = estimate_outstanding_chunks(&runs, &known, &gsnap(), &completed);
        assert_eq!(out[&1], 0);
    }

    #[test]
    fn unknown_reads_default_to_one_chunk() {
        let runs = [ChunkRun { run_id: 4, paired: true }];
        let out = estimate_outstanding_chunks(&runs, &HashMap::new(), &gsnap(), &HashMap::new());
        assert_eq!(out[&4], 1);
    }

    #[test]
    fn rapsearch_never_pairs() {
        let settings = ChunkSettings::default();
        let runs = [ChunkRun { run_id: 1, paired: true }];
        let known = HashMap::from([(1, 100_000)]);
        let out = estimate_outstanding_chunks(
            &runs,
            &known,
            &AlignerConfig::rapsearch(&settings),
            &HashMap::from([(1, 3)]),
        );
        assert_eq!(out[&1], 7);
    }

    #[test]
    fn counts_only_matching_chunk_outputs() {
        let names = [
            "multihit-gsnap-out_0_1.m8",
            "multihit-gsnap-out_0_2.m8",
            "multihit-gsnap-out_0_2.hitsummary.tab",
            "multihit-rapsearch2-out_0_1.m8",
            "other.m8",
        ];
        assert_eq!(count_completed_chunks(&names), (2, 1));
    }

    #[test]
    fn chunk_counters_never_decrease() {
        let dir = tempdir().unwrap();
        let blob = LocalBlobStore::new(dir.path());
        let paths = PathResolver::new("bucket", PipelineVersion::new(3, 1));
        let mut run = PipelineRun::new(
            1,
            NewRun {
                sample: SampleRef { id: 2, project_id: 3, input_file_count: 1 },
                alignment_config: "cfg".to_string(),
                subsample: None,
            },
            Utc::now(),
        );
        let prefix = paths.chunks_prefix(&run);
        blob.put(&format!("{}multihit-gsnap-out_1.m8", prefix), "").unwrap();

        poll_chunk_progress(&blob, &paths, &mut run).unwrap();
        assert_eq!(run.completed_gsnap_chunks, 1);

        run.completed_gsnap_chunks = 5;
        poll_chunk_progress(&blob, &paths, &mut run).unwrap();
        assert_eq!(run.completed_gsnap_chunks, 5);
    }

    #[test]
    fn backlog_skips_runs_past_alignment() {
        let store = FileStore::in_memory();
        let new_run = |id| NewRun {
            sample: SampleRef { id, project_id: 1, input_file_count: 2 },
            alignment_config: "cfg".to_string(),
            subsample: None,
        };

        let aligning = store.create_run(new_run(1)).unwrap();
        store
            .replace_job_stats(
                aligning.id,
                vec![JobStat { task: ALIGNMENT_INPUT_TASK.to_string(), reads_after: 150_000 }],
            )
            .unwrap();

        let mut postprocessing = store.create_run(new_run(2)).unwrap();
        postprocessing.job_status = Some(RunStatus::Stage {
            name: StageName::Postprocess,
            status: StageStatus::Running,
            ready: false,
        });
        store.save_run(&postprocessing).unwrap();

        let mut done = store.create_run(new_run(3)).unwrap();
        done.finalized = true;
        store.save_run(&done).unwrap();

        let backlog = alignment_backlog(&store, &ChunkSettings::default()).unwrap();
        // 150k paired reads: 5 gsnap chunks, 15 rapsearch chunks.
        assert_eq!(backlog, AlignmentBacklog { gsnap: 5, rapsearch: 15 });
    }
}
