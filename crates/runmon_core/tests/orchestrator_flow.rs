//! End-to-end ticks against the in-memory store and a filesystem blob store.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tempfile::{tempdir, TempDir};

use runmon_core::chunks::{alignment_backlog, AlignmentBacklog};
use runmon_core::config::{ChunkSettings, Settings};
use runmon_core::external::{
    FileStore, InProcessQueue, IngestTask, JobCommand, JobRunner, JobRunnerError, JobRunnerResult,
    LocalBlobStore, ProcessJobRunner, RecordingTelemetry, RemoteStatus, Store,
};
use runmon_core::models::{
    JobHandle, LoadState, NewRun, OutputKind, PipelineRun, ResultRows, ResultTable,
    ResultsFinalized, RunId, SampleRef, StageStatus,
};
use runmon_core::orchestrator::{
    Collaborators, PipelineRunOrchestrator, TickReport, SUCCEEDED_RUN_TIME_METRIC,
};
use runmon_core::paths::PathResolver;
use runmon_core::results::{drain_queue, Ingestor, LineageSnapshot, RetryPolicy};

/// Succeeds every job on its first poll, except jobs whose subcommand is
/// marked to fail.
#[derive(Default)]
struct ScriptedRunner {
    fail_subcommand: Mutex<Option<&'static str>>,
    jobs: Mutex<Vec<bool>>,
}

impl JobRunner for ScriptedRunner {
    fn dispatch(&self, command: &JobCommand) -> JobRunnerResult<JobHandle> {
        let fails = self
            .fail_subcommand
            .lock()
            .is_some_and(|sub| command.args.first().is_some_and(|a| a == sub));
        let mut jobs = self.jobs.lock();
        jobs.push(fails);
        Ok(JobHandle(format!("job-{}", jobs.len() - 1)))
    }

    fn poll_status(&self, handle: &JobHandle) -> JobRunnerResult<RemoteStatus> {
        let index: usize = handle
            .0
            .strip_prefix("job-")
            .and_then(|i| i.parse().ok())
            .ok_or_else(|| JobRunnerError::UnknownJob(handle.clone()))?;
        match self.jobs.lock().get(index) {
            Some(true) => Ok(RemoteStatus::Failed),
            Some(false) => Ok(RemoteStatus::Succeeded),
            None => Err(JobRunnerError::UnknownJob(handle.clone())),
        }
    }
}

struct Harness {
    _dir: TempDir,
    blob: Arc<LocalBlobStore>,
    store: Arc<FileStore>,
    queue: Arc<InProcessQueue>,
    runner: Arc<ScriptedRunner>,
    telemetry: Arc<RecordingTelemetry>,
    paths: PathResolver,
    orchestrator: PipelineRunOrchestrator,
    ingestor: Ingestor,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.paths.work_dir = dir.path().join("work").to_string_lossy().into_owned();

        let blob = Arc::new(LocalBlobStore::new(dir.path().join("blobs")));
        let store = Arc::new(FileStore::in_memory());
        let queue = Arc::new(InProcessQueue::new());
        let runner = Arc::new(ScriptedRunner::default());
        let telemetry = Arc::new(RecordingTelemetry::new());

        let orchestrator = PipelineRunOrchestrator::new(
            Collaborators {
                blob: blob.clone(),
                store: store.clone(),
                runner: runner.clone(),
                queue: queue.clone(),
                telemetry: telemetry.clone(),
            },
            &settings,
        )
        .unwrap();
        let paths = orchestrator.paths().clone();
        let ingestor = Ingestor::new(
            blob.clone(),
            store.clone(),
            paths.clone(),
            dir.path().join("work"),
            RetryPolicy::new(3, StdDuration::ZERO),
            Arc::new(LineageSnapshot::default()),
        );

        Self {
            _dir: dir,
            blob,
            store,
            queue,
            runner,
            telemetry,
            paths,
            orchestrator,
            ingestor,
        }
    }

    fn create_run(&self) -> PipelineRun {
        self.store
            .create_run(NewRun {
                sample: SampleRef {
                    id: 5,
                    project_id: 1,
                    input_file_count: 2,
                },
                alignment_config: "2021-01-22".to_string(),
                subsample: None,
            })
            .unwrap()
    }

    /// The run as the path resolver will see it once the version is known.
    fn versioned(&self, run: &PipelineRun) -> PipelineRun {
        let mut run = run.clone();
        run.pipeline_version = Some("3.0".parse().unwrap());
        run
    }

    fn publish_version(&self, run: &PipelineRun) {
        let path = self.paths.pipeline_version_file(run);
        self.blob.put(&path, "3.0\n").unwrap();
    }

    fn publish_output(&self, run: &PipelineRun, output: OutputKind) {
        let run = self.versioned(run);
        let path = self.paths.output_path(&run, output);
        match output {
            OutputKind::ErccCounts => {
                self.blob
                    .put(&path, "N_noFeature\t3\t0\t0\nERCC-00002\t30\t0\t0\nERCC-00003\t4\t0\t0\n")
                    .unwrap();
            }
            OutputKind::TaxonCounts => {
                let json = r#"{"pipeline_output": {"taxon_counts_attributes": [
                    {"tax_id": 573, "tax_level": 1, "count_type": "NT", "count": 10, "genus_taxid": 570, "family_taxid": 543},
                    {"tax_id": 570, "tax_level": 2, "count_type": "NT", "count": 10, "family_taxid": 543}
                ]}}"#;
                self.blob.put(&path, json).unwrap();
            }
            OutputKind::TaxonByteranges => {
                self.blob
                    .put(&path, r#"[{"taxid": 573, "hit_type": "NT", "first_byte": 0, "last_byte": 99}]"#)
                    .unwrap();
            }
            OutputKind::ContigCounts => {
                self.blob.put(&path, "[]").unwrap();
                self.blob.put(&self.paths.contig_stats_path(&run), "{}").unwrap();
            }
            OutputKind::AmrCounts => {
                self.blob.put(&path, "sample,db,gene,allele,coverage,depth\n").unwrap();
            }
        }
    }

    fn publish_counters(&self, run: &PipelineRun) {
        let run = self.versioned(run);
        let folder = self.paths.output_with_version(&run);
        self.blob
            .put(&format!("{}/star.count", folder), r#"{"fastqs": 1000, "truncated": 0}"#)
            .unwrap();
        self.blob
            .put(
                &format!("{}/subsample.count", folder),
                r#"{"bowtie2_out": 800, "subsampled_out": 400}"#,
            )
            .unwrap();
        self.blob
            .put(&format!("{}/gsnap_filter.count", folder), r#"{"gsnap_filter_out": 100}"#)
            .unwrap();
    }

    fn publish_all(&self, run: &PipelineRun) {
        self.publish_version(run);
        self.publish_counters(run);
        for output in OutputKind::ALL {
            self.publish_output(run, output);
        }
    }

    /// Tick and run queued ingestion until the stage machine finalizes.
    fn drive_stages(&self, run_id: RunId, now: DateTime<Utc>) -> TickReport {
        for _ in 0..20 {
            let report = self.orchestrator.tick_at(run_id, now).unwrap();
            drain_queue(&self.queue, &self.ingestor);
            if self.store.run(run_id).unwrap().finalized {
                return report;
            }
        }
        panic!("run {} never finalized", run_id);
    }

    fn state_of(&self, run_id: RunId, output: OutputKind) -> LoadState {
        self.store
            .output_states(run_id)
            .unwrap()
            .into_iter()
            .find(|o| o.output == output)
            .map(|o| o.state)
            .unwrap()
    }
}

#[test]
fn completed_run_loads_every_output_and_finalizes() {
    let h = Harness::new();
    let run = h.create_run();
    h.publish_all(&run);

    let now = Utc::now();
    h.drive_stages(run.id, now);
    let report = h.orchestrator.tick_at(run.id, now).unwrap();

    assert_eq!(report.results_finalized, ResultsFinalized::FinalizedSuccess);
    assert_eq!(report.job_status.as_deref(), Some("CHECKED"));
    for output in OutputKind::ALL {
        assert_eq!(h.state_of(run.id, output), LoadState::Loaded, "{}", output);
    }

    let stored = h.store.run(run.id).unwrap();
    assert!(stored.finalized);
    assert_eq!(stored.total_reads, Some(1000));
    assert_eq!(stored.fraction_subsampled, Some(0.5));
    assert_eq!(stored.adjusted_remaining_reads, Some(200));
    // 34 spike-in reads on each of two input files.
    assert_eq!(stored.total_ercc_reads, Some(68));
    assert_eq!(h.store.job_stats(run.id).unwrap().len(), 5);
    assert_eq!(h.store.rows(run.id, ResultTable::ErccCounts).unwrap().len(), 2);
    assert!(h.store.rows(run.id, ResultTable::Contigs).unwrap().is_empty());

    // Four stages dispatched, in order.
    assert_eq!(h.runner.jobs.lock().len(), 4);
    assert_eq!(h.telemetry.metrics_named(SUCCEEDED_RUN_TIME_METRIC).len(), 1);

    // A finalized run is left alone.
    let again = h.orchestrator.tick_at(run.id, now + Duration::hours(1)).unwrap();
    assert_eq!(again.stage, None);
    assert_eq!(h.telemetry.metrics_named(SUCCEEDED_RUN_TIME_METRIC).len(), 1);
}

#[test]
fn reingesting_an_output_replaces_its_rows() {
    let h = Harness::new();
    let run = h.create_run();
    h.publish_all(&run);
    h.orchestrator.tick_at(run.id, Utc::now()).unwrap();
    drain_queue(&h.queue, &h.ingestor);
    assert_eq!(h.store.rows(run.id, ResultTable::ErccCounts).unwrap().len(), 2);

    let task = IngestTask::new(run.id, OutputKind::ErccCounts);
    h.ingestor.run(task).unwrap();
    assert_eq!(h.store.rows(run.id, ResultTable::ErccCounts).unwrap().len(), 2);

    let path = h.paths.output_path(&h.versioned(&run), OutputKind::ErccCounts);
    h.blob.put(&path, "ERCC-00009\t1\t0\t0\n").unwrap();
    h.ingestor.run(task).unwrap();
    match h.store.rows(run.id, ResultTable::ErccCounts).unwrap() {
        ResultRows::ErccCounts(rows) => {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].name, "ERCC-00009");
        }
        other => panic!("unexpected rows {:?}", other),
    }
}

#[test]
fn missing_output_fails_after_grace_and_fails_results() {
    let h = Harness::new();
    let run = h.create_run();
    h.publish_version(&run);
    h.publish_counters(&run);
    for output in OutputKind::ALL {
        if output != OutputKind::AmrCounts {
            h.publish_output(&run, output);
        }
    }

    let now = Utc::now();
    h.drive_stages(run.id, now);

    let within = h.orchestrator.tick_at(run.id, now + Duration::seconds(30)).unwrap();
    assert_eq!(within.results_finalized, ResultsFinalized::InProgress);
    assert_eq!(h.state_of(run.id, OutputKind::AmrCounts), LoadState::Unknown);

    let after = h.orchestrator.tick_at(run.id, now + Duration::minutes(2)).unwrap();
    assert_eq!(h.state_of(run.id, OutputKind::AmrCounts), LoadState::Failed);
    assert_eq!(after.results_finalized, ResultsFinalized::FinalizedFail);
    assert_eq!(h.state_of(run.id, OutputKind::TaxonCounts), LoadState::Loaded);
    assert!(h.telemetry.metrics_named(SUCCEEDED_RUN_TIME_METRIC).is_empty());

    let again = h.orchestrator.tick_at(run.id, now + Duration::minutes(5)).unwrap();
    assert_eq!(again.results_finalized, ResultsFinalized::FinalizedFail);
    assert_eq!(h.state_of(run.id, OutputKind::AmrCounts), LoadState::Failed);
}

#[test]
fn absent_outputs_stay_unknown_while_running() {
    let h = Harness::new();
    let run = h.create_run();
    h.publish_version(&run);

    let now = Utc::now();
    for _ in 0..3 {
        h.orchestrator.tick_at(run.id, now).unwrap();
    }
    for output in OutputKind::ALL {
        assert_eq!(h.state_of(run.id, output), LoadState::Unknown);
    }
    assert_eq!(h.queue.pending_count(), 0);
    assert_eq!(
        h.store.run(run.id).unwrap().results_finalized,
        ResultsFinalized::InProgress
    );
}

#[test]
fn results_wait_for_the_pipeline_version() {
    let h = Harness::new();
    let run = h.create_run();
    h.publish_counters(&run);

    let now = Utc::now();
    let report = h.orchestrator.tick_at(run.id, now).unwrap();
    assert!(report.stage.is_some());
    assert!(!report.stats_failed);
    let stored = h.store.run(run.id).unwrap();
    assert_eq!(stored.pipeline_version, None);
    assert_eq!(stored.total_reads, None);
    assert!(h.store.job_stats(run.id).unwrap().is_empty());

    h.publish_version(&run);
    h.orchestrator.tick_at(run.id, now).unwrap();
    let stored = h.store.run(run.id).unwrap();
    assert_eq!(stored.pipeline_version.map(|v| v.to_string()).as_deref(), Some("3.0"));
    assert_eq!(stored.total_reads, Some(1000));
}

#[test]
fn stats_failure_blocks_success_for_that_tick() {
    let h = Harness::new();
    let run = h.create_run();
    h.publish_all(&run);
    let folder = h.paths.output_with_version(&h.versioned(&run));
    h.blob.put(&format!("{}/broken.count", folder), "not json").unwrap();

    let now = Utc::now();
    h.orchestrator.tick_at(run.id, now).unwrap();
    drain_queue(&h.queue, &h.ingestor);

    let blocked = h.orchestrator.tick_at(run.id, now).unwrap();
    assert!(blocked.stats_failed);
    assert!(blocked.outputs.iter().all(|o| o.state == LoadState::Loaded));
    assert_eq!(blocked.results_finalized, ResultsFinalized::InProgress);

    h.blob
        .put(&format!("{}/broken.count", folder), r#"{"unidentified_fasta": 7}"#)
        .unwrap();
    let fixed = h.orchestrator.tick_at(run.id, now).unwrap();
    assert!(!fixed.stats_failed);
    assert_eq!(fixed.results_finalized, ResultsFinalized::FinalizedSuccess);
    let stored = h.store.run(run.id).unwrap();
    assert_eq!(stored.unmapped_reads, Some(7));
    assert_eq!(stored.stats_failures, 0);
}

#[test]
fn stats_that_never_compile_finalize_as_failed() {
    let h = Harness::new();
    let run = h.create_run();
    h.publish_all(&run);
    let folder = h.paths.output_with_version(&h.versioned(&run));
    h.blob.put(&format!("{}/broken.count", folder), "not json").unwrap();

    let now = Utc::now();
    h.orchestrator.tick_at(run.id, now).unwrap();
    drain_queue(&h.queue, &h.ingestor);

    let max = Settings::default().monitor.max_stats_failures;
    for attempt in 1..max {
        let report = h.orchestrator.tick_at(run.id, now).unwrap();
        assert_eq!(report.results_finalized, ResultsFinalized::InProgress, "tick {}", attempt);
        assert_eq!(h.store.run(run.id).unwrap().stats_failures, attempt);
    }

    let last = h.orchestrator.tick_at(run.id, now).unwrap();
    assert!(last.stats_failed);
    assert!(last.outputs.iter().all(|o| o.state == LoadState::Loaded));
    assert_eq!(last.results_finalized, ResultsFinalized::FinalizedFail);
    assert!(h.telemetry.metrics_named(SUCCEEDED_RUN_TIME_METRIC).is_empty());
}

#[test]
fn failed_stage_reports_ready_and_can_be_retried() {
    let h = Harness::new();
    let run = h.create_run();
    h.publish_all(&run);
    *h.runner.fail_subcommand.lock() = Some("non_host_alignment");

    let now = Utc::now();
    let failed = h.drive_stages(run.id, now);
    assert_eq!(
        failed.job_status.as_deref(),
        Some("2.GSNAPL/RAPSEARCH alignment-FAILED|READY")
    );
    assert!(h
        .telemetry
        .alerts()
        .iter()
        .any(|a| a == "SampleFailedEvent: Sample 5 failed GSNAPL/RAPSEARCH alignment"));
    let stored = h.store.run(run.id).unwrap();
    assert!(stored.stages[1].failed());
    assert!(!stored.stages[2].started());

    *h.runner.fail_subcommand.lock() = None;
    assert!(h.orchestrator.retry(run.id).unwrap());
    let reset = h.store.run(run.id).unwrap();
    assert!(!reset.finalized);
    assert_eq!(reset.results_finalized, ResultsFinalized::InProgress);
    assert!(reset.stages[1].job_command.is_none());
    // Loaded outputs are kept.
    assert_eq!(h.state_of(run.id, OutputKind::TaxonCounts), LoadState::Loaded);

    let done = h.drive_stages(run.id, now);
    assert_eq!(done.job_status.as_deref(), Some("CHECKED"));
    assert_eq!(h.queue.pending_count(), 0);
    let final_report = h.orchestrator.tick_at(run.id, now).unwrap();
    assert_eq!(final_report.results_finalized, ResultsFinalized::FinalizedSuccess);

    // Not in failure any more.
    assert!(!h.orchestrator.retry(run.id).unwrap());
}

#[test]
fn backlog_counts_outstanding_alignment_chunks() {
    let h = Harness::new();
    let run = h.create_run();
    h.publish_version(&run);
    h.publish_counters(&run);
    h.orchestrator.tick_at(run.id, Utc::now()).unwrap();

    let settings = ChunkSettings::default();
    // 400 reads entering alignment: one chunk per aligner.
    assert_eq!(
        alignment_backlog(h.store.as_ref(), &settings).unwrap(),
        AlignmentBacklog { gsnap: 1, rapsearch: 1 }
    );

    let chunks = h.paths.chunks_prefix(&h.versioned(&run));
    h.blob.put(&format!("{}multihit-gsnap-out_0.m8", chunks), "").unwrap();
    h.orchestrator.tick_at(run.id, Utc::now()).unwrap();
    assert_eq!(h.store.run(run.id).unwrap().completed_gsnap_chunks, 1);
    assert_eq!(
        alignment_backlog(h.store.as_ref(), &settings).unwrap(),
        AlignmentBacklog { gsnap: 0, rapsearch: 1 }
    );
}

#[test]
fn interrupted_ingestion_is_polled_again() {
    let h = Harness::new();
    let run = h.create_run();
    h.publish_all(&run);
    h.orchestrator.tick_at(run.id, Utc::now()).unwrap();
    assert_eq!(h.state_of(run.id, OutputKind::ErccCounts), LoadState::LoadingQueued);

    // A fresh process starts with an empty queue.
    assert_eq!(h.orchestrator.recover_interrupted_ingestion().unwrap(), OutputKind::ALL.len());
    assert_eq!(h.state_of(run.id, OutputKind::ErccCounts), LoadState::Unknown);
    assert_eq!(h.orchestrator.recover_interrupted_ingestion().unwrap(), 0);
}

/// One `runmon tick` invocation: a fresh store handle and job runner over
/// the same files.
#[cfg(unix)]
fn local_invocation(dir: &std::path::Path, settings: &Settings) -> (Arc<FileStore>, PipelineRunOrchestrator) {
    let store = Arc::new(FileStore::open(dir.join("store.json")).unwrap());
    let orchestrator = PipelineRunOrchestrator::new(
        Collaborators {
            blob: Arc::new(LocalBlobStore::new(dir.join("blobs"))),
            store: store.clone(),
            runner: Arc::new(ProcessJobRunner::new(dir.join("jobs"))),
            queue: Arc::new(InProcessQueue::new()),
            telemetry: Arc::new(RecordingTelemetry::new()),
        },
        settings,
    )
    .unwrap();
    (store, orchestrator)
}

#[cfg(unix)]
#[test]
fn stage_started_by_an_earlier_process_keeps_running_to_success() {
    let dir = tempdir().unwrap();
    let mut settings = Settings::default();
    settings.paths.work_dir = dir.path().join("work").to_string_lossy().into_owned();
    settings.pipeline.program = "true".to_string();

    let run_id = {
        let (store, first) = local_invocation(dir.path(), &settings);
        let run = store
            .create_run(NewRun {
                sample: SampleRef {
                    id: 8,
                    project_id: 1,
                    input_file_count: 1,
                },
                alignment_config: "2021-01-22".to_string(),
                subsample: None,
            })
            .unwrap();
        first.tick(run.id).unwrap();
        assert_eq!(store.run(run.id).unwrap().stages[0].job_status, Some(StageStatus::Started));
        run.id
    };

    let deadline = std::time::Instant::now() + StdDuration::from_secs(10);
    loop {
        let (store, next) = local_invocation(dir.path(), &settings);
        next.tick(run_id).unwrap();
        let run = store.run(run_id).unwrap();
        let status = run.stages[0].job_status;
        assert_ne!(status, Some(StageStatus::Failed));
        assert!(!run.finalized);
        if status == Some(StageStatus::Succeeded) {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "host filtering never finished");
        std::thread::sleep(StdDuration::from_millis(20));
    }
}
