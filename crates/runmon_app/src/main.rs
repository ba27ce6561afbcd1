//! Runmon - pipeline run monitor CLI
//!
//! Drives the core on a fixed cadence: one orchestrator tick per active
//! run, plus a pool of ingestion workers fed by the in-process queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use runmon_core::chunks::alignment_backlog;
use runmon_core::config::{ConfigManager, ConfigSection, Settings};
use runmon_core::external::{
    FileStore, InProcessQueue, LocalBlobStore, ProcessJobRunner, Store, TracingTelemetry,
};
use runmon_core::logging::init_tracing;
use runmon_core::models::{NewRun, SampleRef};
use runmon_core::orchestrator::{path_resolver, Collaborators, PipelineRunOrchestrator};
use runmon_core::results::{drain_queue, run_worker, Ingestor, LineageSnapshot, RetryPolicy};

/// How long an idle worker waits before re-checking for shutdown.
const WORKER_POLL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "runmon")]
#[command(version, about = "Monitor multi-stage pipeline runs and ingest their results", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a run for a sample
    Create {
        #[arg(long)]
        sample_id: u64,

        #[arg(long)]
        project_id: u64,

        /// Uploaded FASTQ files (2 for paired-end)
        #[arg(long, default_value_t = 1)]
        input_files: u32,

        #[arg(long)]
        alignment_config: String,

        /// Reads to subsample to after host filtering
        #[arg(long)]
        subsample: Option<u64>,
    },

    /// Tick one run (or every active run) once and run queued ingestion
    Tick {
        run_id: Option<u64>,
    },

    /// Tick every active run on the configured interval until Ctrl-C
    Watch,

    /// Retry a failed run
    Retry { run_id: u64 },

    /// Print outstanding alignment chunks as JSON
    Backlog,

    /// Write the configuration file, with defaults for missing values
    Config {
        /// Replace the file with pure defaults
        #[arg(long)]
        reset: bool,

        /// Rewrite only this table (paths, logging, monitor, chunks, ingest, pipeline)
        #[arg(long, value_parser = parse_section)]
        section: Option<ConfigSection>,
    },
}

fn parse_section(name: &str) -> Result<ConfigSection, String> {
    ConfigSection::from_table_name(name).ok_or_else(|| format!("unknown config section '{}'", name))
}

/// Default config path: the platform config dir, else `.runmon/runmon.toml`.
fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "runmon")
        .map(|dirs| dirs.config_dir().join("runmon.toml"))
        .unwrap_or_else(|| PathBuf::from(".runmon").join("runmon.toml"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);

    if let Commands::Config { reset, section } = cli.command {
        return write_config(&config_path, reset, section);
    }

    // Config first: it names the logs folder.
    let mut config = ConfigManager::new(&config_path);
    config
        .load_or_create()
        .with_context(|| format!("loading config {}", config_path.display()))?;
    config.ensure_dirs_exist()?;
    let settings = config.settings().clone();

    let log_dir = settings
        .logging
        .file_output
        .then(|| PathBuf::from(&settings.paths.logs_folder));
    let _log_guard = init_tracing(settings.logging.level, log_dir.as_deref());
    tracing::info!("Config: {}", config_path.display());
    tracing::debug!("Core version: {}", runmon_core::version());

    let monitor = Monitor::build(&settings)?;

    match cli.command {
        Commands::Create {
            sample_id,
            project_id,
            input_files,
            alignment_config,
            subsample,
        } => {
            let run = monitor.store.create_run(NewRun {
                sample: SampleRef {
                    id: sample_id,
                    project_id,
                    input_file_count: input_files,
                },
                alignment_config,
                subsample,
            })?;
            tracing::info!(run_id = run.id, sample_id, "Created run");
            println!("{}", serde_json::to_string_pretty(&run)?);
        }

        Commands::Tick { run_id } => {
            monitor.orchestrator.recover_interrupted_ingestion()?;
            let reports = match run_id {
                Some(id) => vec![monitor.orchestrator.tick(id)?],
                None => monitor.orchestrator.tick_all()?,
            };
            let loaded = drain_queue(&monitor.queue, &monitor.ingestor);
            tracing::info!(runs = reports.len(), tasks = loaded, "Tick finished");
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }

        Commands::Watch => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(watch(monitor, &settings))?;
        }

        Commands::Retry { run_id } => {
            if monitor.orchestrator.retry(run_id)? {
                println!("Run {} will be retried on the next tick", run_id);
            } else {
                println!("Run {} is not in failure", run_id);
            }
        }

        Commands::Backlog => {
            let backlog = alignment_backlog(monitor.store.as_ref(), &settings.chunks)?;
            println!("{}", serde_json::to_string_pretty(&backlog)?);
        }

        // Written before logging setup.
        Commands::Config { .. } => {}
    }

    Ok(())
}

fn write_config(path: &Path, reset: bool, section: Option<ConfigSection>) -> Result<()> {
    let mut config = ConfigManager::new(path);
    if reset {
        *config.settings_mut() = Settings::default();
    } else {
        config
            .load_or_create()
            .with_context(|| format!("loading config {}", path.display()))?;
    }

    // A section write takes the other tables from the file as they are.
    match section {
        Some(section) => {
            config.update_section(section)?;
            println!("Wrote [{}] in {}", section.table_name(), path.display());
        }
        None => {
            config.save()?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

/// Concrete adapters wired around the core.
struct Monitor {
    store: Arc<FileStore>,
    queue: Arc<InProcessQueue>,
    orchestrator: Arc<PipelineRunOrchestrator>,
    ingestor: Arc<Ingestor>,
}

impl Monitor {
    fn build(settings: &Settings) -> Result<Self> {
        let paths = &settings.paths;
        let store = Arc::new(
            FileStore::open(&paths.store_file)
                .with_context(|| format!("opening store {}", paths.store_file))?,
        );
        let blob = Arc::new(LocalBlobStore::new(&paths.blob_root));
        let queue = Arc::new(InProcessQueue::new());

        let lineage = match &paths.lineage_snapshot {
            Some(path) => LineageSnapshot::load(Path::new(path)).map_err(anyhow::Error::msg)?,
            None => {
                tracing::warn!("No lineage snapshot configured; taxon names are not enriched");
                LineageSnapshot::default()
            }
        };

        let orchestrator = PipelineRunOrchestrator::new(
            Collaborators {
                blob: blob.clone(),
                store: store.clone(),
                runner: Arc::new(ProcessJobRunner::new(&paths.jobs_dir)),
                queue: queue.clone(),
                telemetry: Arc::new(TracingTelemetry),
            },
            settings,
        )?;
        let ingestor = Ingestor::new(
            blob,
            store.clone(),
            path_resolver(settings)?,
            &paths.work_dir,
            RetryPolicy::new(
                settings.ingest.download_attempts,
                settings.ingest.download_backoff(),
            ),
            Arc::new(lineage),
        );

        Ok(Self {
            store,
            queue,
            orchestrator: Arc::new(orchestrator),
            ingestor: Arc::new(ingestor),
        })
    }
}

async fn watch(monitor: Monitor, settings: &Settings) -> Result<()> {
    monitor.orchestrator.recover_interrupted_ingestion()?;

    let workers: Vec<_> = (0..settings.ingest.workers.max(1))
        .map(|_| {
            let queue = monitor.queue.clone();
            let ingestor = monitor.ingestor.clone();
            tokio::task::spawn_blocking(move || run_worker(&queue, &ingestor, WORKER_POLL))
        })
        .collect();
    tracing::info!(
        workers = workers.len(),
        interval_secs = settings.monitor.tick_interval().as_secs(),
        "Watching runs"
    );

    let mut interval = tokio::time::interval(settings.monitor.tick_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let orchestrator = monitor.orchestrator.clone();
                match tokio::task::spawn_blocking(move || orchestrator.tick_all()).await {
                    Ok(Ok(reports)) => tracing::debug!(runs = reports.len(), "Tick finished"),
                    Ok(Err(e)) => tracing::error!("Tick failed: {}", e),
                    Err(e) => tracing::error!("Tick task panicked: {}", e),
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutting down, waiting for ingestion workers");
                break;
            }
        }
    }

    monitor.queue.close();
    let mut executed = 0;
    for worker in workers {
        executed += worker.await.context("ingestion worker panicked")?;
    }
    tracing::info!(tasks = executed, "Ingestion workers stopped");
    Ok(())
}
