//! `runmon.toml`: one table per [`ConfigSection`], every key optional.
//!
//! ```no_run
//! use runmon_core::config::{ConfigManager, ConfigSection};
//!
//! # fn main() -> Result<(), runmon_core::config::ConfigError> {
//! let mut config = ConfigManager::new(".runmon/runmon.toml");
//! config.load_or_create()?;
//! println!("samples bucket: {}", config.settings().paths.samples_bucket);
//!
//! config.settings_mut().monitor.tick_interval_secs = 30;
//! config.update_section(ConfigSection::Monitor)?;
//! # Ok(())
//! # }
//! ```

mod manager;
mod settings;

pub use manager::{ConfigError, ConfigManager, ConfigResult};
pub use settings::{
    ChunkSettings, ConfigSection, IngestSettings, LoggingSettings, MonitorSettings, PathSettings,
    PipelineSettings, Settings,
};
