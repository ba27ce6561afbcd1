//! Runmon Core - monitoring for multi-stage pipeline runs
//!
//! Tracks externally dispatched stage jobs, estimates alignment chunk
//! backlog, detects stage outputs in object storage and ingests them
//! into the store. Has no async runtime; the driver calls
//! [`orchestrator::PipelineRunOrchestrator::tick`] on its own cadence.

pub mod chunks;
pub mod config;
pub mod external;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod paths;
pub mod results;
pub mod stages;
pub mod stats;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_returns_value() {
        assert!(!version().is_empty());
    }
}
