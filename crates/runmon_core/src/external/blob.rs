//! Durable object storage.
//!
//! Objects are addressed by URI-like paths (`s3://bucket/key`). The monitor
//! only needs existence checks, whole-object transfers and one-level
//! listings; anything richer belongs to the backend.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors from blob store operations.
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Object not found: {path}")]
    NotFound { path: String },

    #[error("Invalid object path: {0}")]
    InvalidPath(String),

    #[error("I/O error during {operation} of '{path}': {source}")]
    Io {
        operation: String,
        path: String,
        #[source]
        source: io::Error,
    },
}

impl BlobError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn io(operation: impl Into<String>, path: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Object storage the monitor polls for stage outputs.
pub trait BlobStore: Send + Sync {
    /// Whether an object exists at `path`.
    fn exists(&self, path: &str) -> BlobResult<bool>;

    /// Copy the object to `local_dir/<basename>` and return the local path.
    fn download(&self, path: &str, local_dir: &Path) -> BlobResult<PathBuf>;

    /// Write a local file to `path`, replacing any existing object.
    fn upload(&self, local_path: &Path, path: &str) -> BlobResult<()>;

    /// Names of the objects directly under `prefix`.
    ///
    /// A prefix ending in `/` lists that directory; otherwise the last
    /// component acts as a name filter. Results are sorted. A missing
    /// directory lists as empty.
    fn list_by_prefix(&self, prefix: &str) -> BlobResult<Vec<String>>;
}

/// Last path component of an object path.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Blob store backed by a local directory.
///
/// `s3://bucket/key` maps to `<root>/bucket/key`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an object path to a local file path.
    pub fn resolve(&self, path: &str) -> BlobResult<PathBuf> {
        let key = path.strip_prefix("s3://").unwrap_or(path);
        let key = key.trim_start_matches('/');
        if key.is_empty() || key.split('/').any(|c| c == "..") {
            return Err(BlobError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(key))
    }

    /// Write bytes directly to an object path (fixture and tooling helper).
    pub fn put(&self, path: &str, contents: impl AsRef<[u8]>) -> BlobResult<()> {
        let target = self.resolve(path)?;
        atomic_write(&target, contents.as_ref()).map_err(|e| BlobError::io("put", path, e))
    }
}

impl BlobStore for LocalBlobStore {
    fn exists(&self, path: &str) -> BlobResult<bool> {
        Ok(self.resolve(path)?.is_file())
    }

    fn download(&self, path: &str, local_dir: &Path) -> BlobResult<PathBuf> {
        let source = self.resolve(path)?;
        if !source.is_file() {
            return Err(BlobError::not_found(path));
        }
        fs::create_dir_all(local_dir)
            .map_err(|e| BlobError::io("creating download directory", path, e))?;
        let target = local_dir.join(basename(path));
        fs::copy(&source, &target).map_err(|e| BlobError::io("download", path, e))?;
        tracing::debug!(path, local = %target.display(), "Downloaded object");
        Ok(target)
    }

    fn upload(&self, local_path: &Path, path: &str) -> BlobResult<()> {
        let contents = fs::read(local_path).map_err(|e| BlobError::io("reading upload", path, e))?;
        let target = self.resolve(path)?;
        atomic_write(&target, &contents).map_err(|e| BlobError::io("upload", path, e))?;
        tracing::debug!(path, "Uploaded object");
        Ok(())
    }

    fn list_by_prefix(&self, prefix: &str) -> BlobResult<Vec<String>> {
        let (dir, name_prefix) = match prefix.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => return Err(BlobError::InvalidPath(prefix.to_string())),
        };
        let local_dir = self.resolve(dir)?;
        let entries = match fs::read_dir(&local_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BlobError::io("list", prefix, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BlobError::io("list", prefix, e))?;
            let is_file = entry
                .file_type()
                .map_err(|e| BlobError::io("list", prefix, e))?
                .is_file();
            let name = entry.file_name().to_string_lossy().to_string();
            // Temp files from in-progress writes are not objects yet.
            if is_file && name.starts_with(name_prefix) && !name.ends_with(".tmp") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Write to a temp file in the same directory, then rename over the target.
fn atomic_write(target: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut temp_name = target.as_os_str().to_os_string();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);
    {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, target)
}
