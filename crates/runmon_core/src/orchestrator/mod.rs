//! Run orchestrator.
//!
//! Each tick drives one run through two state machines that share the run
//! row:
//!
//! ```text
//! tick(run)
//!     ├── StageStateMachine   dispatch / poll the active stage
//!     └── results (until finalized)
//!         ├── version discovery
//!         ├── ResultMonitor     per output: queue ingestion or fail
//!         ├── StatsCompiler     counters -> run metrics, chunk progress
//!         └── finalization rule
//! ```

mod errors;
mod run_orchestrator;

pub use errors::{MonitorError, MonitorResult};
pub use run_orchestrator::{
    path_resolver, Collaborators, PipelineRunOrchestrator, TickReport, SUCCEEDED_RUN_TIME_METRIC,
};
