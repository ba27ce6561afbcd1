//! Reading, validating and writing `runmon.toml`.
//!
//! Whole-file writes render every section from the in-memory settings.
//! Section writes edit the on-disk document with toml_edit, so hand edits
//! to the other tables survive. Both go through a temp file and rename.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use toml_edit::{DocumentMut, Item, Table};

use super::settings::{ConfigSection, Settings};
use crate::models::PipelineVersion;

const FILE_HEADER: &str = "# runmon configuration\n# Regenerated by `runmon config`; edit values in place.\n\n";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cannot encode settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Cannot edit config document: {0}")]
    Edit(#[from] toml_edit::TomlError),

    #[error("No config file at {0}")]
    Missing(PathBuf),

    #[error("{key}: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    fn io(path: &Path, source: io::Error) -> Self {
        ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Owns the settings and the file they came from.
pub struct ConfigManager {
    config_path: PathBuf,
    settings: Settings,
}

impl ConfigManager {
    /// Starts from defaults; nothing is read until `load` or `load_or_create`.
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            settings: Settings::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// In-memory only until `save` or `update_section`.
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn load(&mut self) -> ConfigResult<()> {
        let content = match fs::read_to_string(&self.config_path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::Missing(self.config_path.clone()))
            }
            Err(e) => return Err(ConfigError::io(&self.config_path, e)),
        };
        self.settings = validated(toml::from_str(&content)?)?;
        tracing::debug!("Loaded config from {}", self.config_path.display());
        Ok(())
    }

    /// Load, or write a default file when none exists yet.
    pub fn load_or_create(&mut self) -> ConfigResult<()> {
        match self.load() {
            Err(ConfigError::Missing(_)) => {
                self.settings = Settings::default();
                tracing::info!("Writing default config to {}", self.config_path.display());
                self.save()
            }
            other => other,
        }
    }

    /// Create the configured local directories and the store's parent.
    pub fn ensure_dirs_exist(&self) -> ConfigResult<()> {
        let paths = &self.settings.paths;
        let store_parent = Path::new(&paths.store_file)
            .parent()
            .filter(|p| !p.as_os_str().is_empty());
        let dirs = [
            Some(Path::new(&paths.blob_root)),
            Some(Path::new(&paths.work_dir)),
            Some(Path::new(&paths.logs_folder)),
            Some(Path::new(&paths.jobs_dir)),
            store_parent,
        ];
        for dir in dirs.into_iter().flatten() {
            fs::create_dir_all(dir).map_err(|e| ConfigError::io(dir, e))?;
        }
        Ok(())
    }

    /// Rewrite the whole file from the in-memory settings.
    pub fn save(&self) -> ConfigResult<()> {
        let mut doc = DocumentMut::new();
        for section in ConfigSection::ALL {
            let mut table = self.section_table(section)?;
            table.decor_mut().set_prefix(format!("# {}\n", section.description()));
            doc.insert(section.table_name(), Item::Table(table));
        }
        write_atomic(&self.config_path, &format!("{}{}", FILE_HEADER, doc))
    }

    /// Replace a single table in the file on disk.
    ///
    /// Other tables are taken from the file, not from memory.
    pub fn update_section(&mut self, section: ConfigSection) -> ConfigResult<()> {
        let mut doc = match fs::read_to_string(&self.config_path) {
            Ok(content) => content.parse::<DocumentMut>()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => DocumentMut::new(),
            Err(e) => return Err(ConfigError::io(&self.config_path, e)),
        };

        let mut table = self.section_table(section)?;
        if let Some(old) = doc.get(section.table_name()).and_then(Item::as_table) {
            *table.decor_mut() = old.decor().clone();
        }
        doc.insert(section.table_name(), Item::Table(table));
        write_atomic(&self.config_path, &doc.to_string())
    }

    fn section_table(&self, section: ConfigSection) -> ConfigResult<Table> {
        let s = &self.settings;
        let rendered = match section {
            ConfigSection::Paths => toml::to_string(&s.paths)?,
            ConfigSection::Logging => toml::to_string(&s.logging)?,
            ConfigSection::Monitor => toml::to_string(&s.monitor)?,
            ConfigSection::Chunks => toml::to_string(&s.chunks)?,
            ConfigSection::Ingest => toml::to_string(&s.ingest)?,
            ConfigSection::Pipeline => toml::to_string(&s.pipeline)?,
        };
        Ok(rendered.parse::<DocumentMut>()?.as_table().clone())
    }
}

/// Reject values the monitor cannot run with.
fn validated(settings: Settings) -> ConfigResult<Settings> {
    let chunks = &settings.chunks;
    if chunks.gsnap_chunk_size == 0 {
        return Err(ConfigError::invalid("chunks.gsnap_chunk_size", "must be greater than zero"));
    }
    if chunks.rapsearch_chunk_size == 0 {
        return Err(ConfigError::invalid(
            "chunks.rapsearch_chunk_size",
            "must be greater than zero",
        ));
    }
    if settings.ingest.download_attempts == 0 {
        return Err(ConfigError::invalid("ingest.download_attempts", "must be at least 1"));
    }
    if settings.monitor.tick_interval_secs == 0 {
        return Err(ConfigError::invalid("monitor.tick_interval_secs", "must be at least 1"));
    }
    if settings.monitor.max_stats_failures == 0 {
        return Err(ConfigError::invalid("monitor.max_stats_failures", "must be at least 1"));
    }
    settings
        .pipeline
        .assembly_version
        .parse::<PipelineVersion>()
        .map_err(|e| ConfigError::invalid("pipeline.assembly_version", e))?;
    Ok(settings)
}

fn write_atomic(path: &Path, content: &str) -> ConfigResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;
    }

    let tmp = path.with_extension("toml.tmp");
    let written = fs::File::create(&tmp).and_then(|mut file| {
        file.write_all(content.as_bytes())?;
        file.sync_all()
    });
    written.map_err(|e| ConfigError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| ConfigError::io(path, e))
}
