//! Settings struct with TOML-based sections.
//!
//! Settings are organized into logical sections that map to TOML tables.
//! Each section can be updated independently for atomic section-level updates.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logging::LogLevel;

/// Root settings structure containing all configuration sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Storage locations.
    #[serde(default)]
    pub paths: PathSettings,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Monitor tick cadence and thresholds.
    #[serde(default)]
    pub monitor: MonitorSettings,

    /// Alignment chunk sizing.
    #[serde(default)]
    pub chunks: ChunkSettings,

    /// Output ingestion.
    #[serde(default)]
    pub ingest: IngestSettings,

    /// Stage command parameters.
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

/// Storage locations for blobs, local downloads, the store and logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Local directory backing the blob store.
    #[serde(default = "default_blob_root")]
    pub blob_root: String,

    /// Bucket that holds sample inputs and outputs.
    #[serde(default = "default_samples_bucket")]
    pub samples_bucket: String,

    /// Local directory that downloads land in.
    #[serde(default = "default_work_dir")]
    pub work_dir: String,

    /// JSON file persisting runs, stages, output states and rows.
    #[serde(default = "default_store_file")]
    pub store_file: String,

    /// Folder for log files.
    #[serde(default = "default_logs_folder")]
    pub logs_folder: String,

    /// Per-job directories of the local job runner.
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: String,

    /// Optional JSON lineage snapshot used to enrich taxon counts.
    #[serde(default)]
    pub lineage_snapshot: Option<String>,
}

fn default_blob_root() -> String {
    ".runmon/blobs".to_string()
}

fn default_samples_bucket() -> String {
    "idseq-samples".to_string()
}

fn default_work_dir() -> String {
    ".runmon/tmp/results_json".to_string()
}

fn default_store_file() -> String {
    ".runmon/store.json".to_string()
}

fn default_logs_folder() -> String {
    ".runmon/logs".to_string()
}

fn default_jobs_dir() -> String {
    ".runmon/jobs".to_string()
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            blob_root: default_blob_root(),
            samples_bucket: default_samples_bucket(),
            work_dir: default_work_dir(),
            store_file: default_store_file(),
            logs_folder: default_logs_folder(),
            jobs_dir: default_jobs_dir(),
            lineage_snapshot: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is not set.
    #[serde(default)]
    pub level: LogLevel,

    /// Also write a daily-rolling log file under `paths.logs_folder`.
    #[serde(default = "default_true")]
    pub file_output: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            file_output: true,
        }
    }
}

/// Tick cadence and the fixed thresholds of the monitors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Seconds between scheduler ticks in watch mode.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Run age after which a single long-running alert fires.
    #[serde(default = "default_long_run_alert_hours")]
    pub long_run_alert_hours: u64,

    /// How long after the last stage update a missing output is declared failed.
    #[serde(default = "default_output_grace")]
    pub output_grace_secs: u64,

    /// Ticks with every output loaded but a failing stats compile before
    /// the results are finalized as failed.
    #[serde(default = "default_max_stats_failures")]
    pub max_stats_failures: u32,
}

fn default_tick_interval() -> u64 {
    60
}

fn default_long_run_alert_hours() -> u64 {
    5
}

fn default_output_grace() -> u64 {
    60
}

fn default_max_stats_failures() -> u32 {
    3
}

impl MonitorSettings {
    pub fn long_run_threshold(&self) -> chrono::Duration {
        chrono::Duration::hours(self.long_run_alert_hours as i64)
    }

    pub fn output_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.output_grace_secs as i64)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            long_run_alert_hours: default_long_run_alert_hours(),
            output_grace_secs: default_output_grace(),
            max_stats_failures: default_max_stats_failures(),
        }
    }
}

/// Alignment chunk sizing shared with the autoscaler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSettings {
    /// Reads per gsnap chunk.
    #[serde(default = "default_gsnap_chunk_size")]
    pub gsnap_chunk_size: u64,

    /// Reads per rapsearch chunk.
    #[serde(default = "default_rapsearch_chunk_size")]
    pub rapsearch_chunk_size: u64,

    /// Cap on chunks a single run dispatches concurrently.
    #[serde(default = "default_max_chunks_in_flight")]
    pub max_chunks_in_flight: u64,
}

fn default_gsnap_chunk_size() -> u64 {
    15_000
}

fn default_rapsearch_chunk_size() -> u64 {
    10_000
}

fn default_max_chunks_in_flight() -> u64 {
    32
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            gsnap_chunk_size: default_gsnap_chunk_size(),
            rapsearch_chunk_size: default_rapsearch_chunk_size(),
            max_chunks_in_flight: default_max_chunks_in_flight(),
        }
    }
}

/// Download retry bounds and worker pool size for ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSettings {
    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,

    #[serde(default = "default_download_backoff")]
    pub download_backoff_secs: u64,

    /// Number of ingestion workers in watch mode.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_download_attempts() -> u32 {
    3
}

fn default_download_backoff() -> u64 {
    15
}

fn default_workers() -> usize {
    2
}

impl IngestSettings {
    pub fn download_backoff(&self) -> Duration {
        Duration::from_secs(self.download_backoff_secs)
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            download_attempts: default_download_attempts(),
            download_backoff_secs: default_download_backoff(),
            workers: default_workers(),
        }
    }
}

/// Parameters that go into stage commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Executable dispatched for every stage.
    #[serde(default = "default_program")]
    pub program: String,

    /// Fragments to subsample to after host filtering when the run sets none.
    #[serde(default = "default_subsample")]
    pub default_subsample: u64,

    /// Maximum fragments going into the pipeline.
    #[serde(default = "default_max_input_fragments")]
    pub max_input_fragments: u64,

    /// First version that publishes the assembly output layout.
    #[serde(default = "default_assembly_version")]
    pub assembly_version: String,

    /// Adapter sequences for single-end input.
    #[serde(default = "default_adapters_single")]
    pub adapters_single_end: String,

    /// Adapter sequences for paired-end input.
    #[serde(default = "default_adapters_paired")]
    pub adapters_paired_end: String,
}

fn default_program() -> String {
    "idseq_dag".to_string()
}

fn default_subsample() -> u64 {
    1_000_000
}

fn default_max_input_fragments() -> u64 {
    75_000_000
}

fn default_assembly_version() -> String {
    "3.1".to_string()
}

fn default_adapters_single() -> String {
    "s3://idseq-database/adapter_sequences/illumina_TruSeq3-SE.fasta".to_string()
}

fn default_adapters_paired() -> String {
    "s3://idseq-database/adapter_sequences/illumina_TruSeq3-PE-2_NexteraPE-PE.fasta".to_string()
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            default_subsample: default_subsample(),
            max_input_fragments: default_max_input_fragments(),
            assembly_version: default_assembly_version(),
            adapters_single_end: default_adapters_single(),
            adapters_paired_end: default_adapters_paired(),
        }
    }
}

/// Names of config sections for targeted updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigSection {
    Paths,
    Logging,
    Monitor,
    Chunks,
    Ingest,
    Pipeline,
}

impl ConfigSection {
    pub const ALL: [ConfigSection; 6] = [
        ConfigSection::Paths,
        ConfigSection::Logging,
        ConfigSection::Monitor,
        ConfigSection::Chunks,
        ConfigSection::Ingest,
        ConfigSection::Pipeline,
    ];

    /// Get the TOML table name for this section.
    pub fn table_name(&self) -> &'static str {
        match self {
            ConfigSection::Paths => "paths",
            ConfigSection::Logging => "logging",
            ConfigSection::Monitor => "monitor",
            ConfigSection::Chunks => "chunks",
            ConfigSection::Ingest => "ingest",
            ConfigSection::Pipeline => "pipeline",
        }
    }

    /// Section named by its TOML table, as given on the command line.
    pub fn from_table_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|section| section.table_name() == name)
    }

    /// Comment written above the section in generated files.
    pub fn description(&self) -> &'static str {
        match self {
            ConfigSection::Paths => "Storage locations",
            ConfigSection::Logging => "Logging configuration",
            ConfigSection::Monitor => "Tick cadence and monitor thresholds",
            ConfigSection::Chunks => "Alignment chunk sizing",
            ConfigSection::Ingest => "Output ingestion",
            ConfigSection::Pipeline => "Stage command parameters",
        }
    }
}
