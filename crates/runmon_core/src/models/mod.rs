//! Data models for the run monitor.
//!
//! This module contains the persisted state the monitor works on:
//! - Enums for stage names, stage status, output kinds and load states
//! - The `PipelineRun` aggregate with its stages
//! - Rows ingested from pipeline outputs
//! - Pipeline version parsing

mod enums;
mod results;
mod run;
mod version;

pub use enums::{LoadState, OutputKind, ResultsFinalized, StageName, StageStatus, TaxLevel};
pub use results::{
    AmrCount, Contig, ContigCount, ErccCount, JobStat, ResultRows, ResultTable, TaxonByterange,
    TaxonCount,
};
pub use run::{
    JobHandle, NewRun, OutputState, PipelineRun, RunId, RunStatus, SampleRef, Stage,
};
pub use version::{after, PipelineVersion};
