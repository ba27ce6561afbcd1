//! External batch-job runner.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::JobHandle;

/// A command to run as one external batch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl JobCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append `--flag value`.
    pub fn flag(self, flag: &str, value: impl Into<String>) -> Self {
        self.arg(flag).arg(value)
    }
}

impl fmt::Display for JobCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Coarse job status reported by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteStatus {
    Runnable,
    Running,
    Succeeded,
    Failed,
}

/// Errors from the job runner.
#[derive(Error, Debug)]
pub enum JobRunnerError {
    #[error("Failed to dispatch '{program}': {message}")]
    DispatchFailed { program: String, message: String },

    /// The runner has no record of the job.
    #[error("Unknown job: {0}")]
    UnknownJob(JobHandle),

    #[error("I/O error in {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },
}

impl JobRunnerError {
    pub fn io(operation: impl Into<String>, source: io::Error) -> Self {
        JobRunnerError::Io {
            operation: operation.into(),
            source,
        }
    }
}

pub type JobRunnerResult<T> = Result<T, JobRunnerError>;

/// Accepts commands and later reports their coarse status.
pub trait JobRunner: Send + Sync {
    fn dispatch(&self, command: &JobCommand) -> JobRunnerResult<JobHandle>;

    fn poll_status(&self, handle: &JobHandle) -> JobRunnerResult<RemoteStatus>;
}

/// Written by the job wrapper once the command exits.
const EXIT_STATUS_FILE: &str = "exit_status";

/// Runs the command, then records its exit code atomically in the job dir.
const WRAPPER: &str = r#""$@"; code=$?; printf '%s\n' "$code" > "$RUNMON_JOB_DIR/exit_status.tmp" && mv "$RUNMON_JOB_DIR/exit_status.tmp" "$RUNMON_JOB_DIR/exit_status""#;

/// Runs each job as a local child process under `sh`.
///
/// Every job gets a directory under `jobs_dir` named by its handle, holding
/// `command.json`, `pid`, `stdout.log`, `stderr.log` and, once the command
/// exits, `exit_status`. Status is read from that directory, so any runner
/// pointed at the same `jobs_dir` can poll a job, including one started by
/// an earlier process. Exit code 0 reports `Succeeded`, anything else
/// `Failed`; no exit record yet reports `Running`.
pub struct ProcessJobRunner {
    jobs_dir: PathBuf,
    next_id: AtomicU64,
    /// Children spawned by this process, kept until reaped.
    children: Mutex<HashMap<JobHandle, Child>>,
}

impl ProcessJobRunner {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs_dir: jobs_dir.into(),
            next_id: AtomicU64::new(1),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Job directory for `handle`, or `None` if the handle is not one of ours.
    fn job_dir(&self, handle: &JobHandle) -> Option<PathBuf> {
        let name = handle.0.as_str();
        let valid = name.starts_with("local-")
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        let dir = self.jobs_dir.join(name);
        (valid && dir.is_dir()).then_some(dir)
    }

    /// Reap a finished child of this process, recording its exit if the
    /// wrapper could not (e.g. it was killed by a signal).
    fn reap(&self, handle: &JobHandle, dir: &Path) -> JobRunnerResult<()> {
        let mut children = self.children.lock();
        let Some(child) = children.get_mut(handle) else {
            return Ok(());
        };
        let exited = child
            .try_wait()
            .map_err(|e| JobRunnerError::io(format!("polling job {}", handle), e))?;
        let Some(exit) = exited else {
            return Ok(());
        };
        children.remove(handle);

        let status_path = dir.join(EXIT_STATUS_FILE);
        if !status_path.exists() {
            let code = exit.code().unwrap_or(-1);
            tracing::warn!(job = %handle, code, "Job wrapper exited without an exit record");
            fs::write(&status_path, format!("{}\n", code))
                .map_err(|e| JobRunnerError::io(format!("recording exit of job {}", handle), e))?;
        }
        Ok(())
    }
}

impl JobRunner for ProcessJobRunner {
    fn dispatch(&self, command: &JobCommand) -> JobRunnerResult<JobHandle> {
        let dispatch_failed = |message: String| JobRunnerError::DispatchFailed {
            program: command.program.clone(),
            message,
        };

        let handle = JobHandle(format!(
            "local-{}-{}-{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            std::process::id(),
            self.next_id.fetch_add(1, Ordering::SeqCst)
        ));
        let dir = self.jobs_dir.join(&handle.0);
        fs::create_dir_all(&dir)
            .map_err(|e| dispatch_failed(format!("creating {}: {}", dir.display(), e)))?;

        let record = serde_json::to_string_pretty(command)
            .map_err(|e| dispatch_failed(format!("encoding command: {}", e)))?;
        fs::write(dir.join("command.json"), record)
            .map_err(|e| dispatch_failed(format!("writing command record: {}", e)))?;
        let stdout = fs::File::create(dir.join("stdout.log"))
            .map_err(|e| dispatch_failed(format!("creating stdout.log: {}", e)))?;
        let stderr = fs::File::create(dir.join("stderr.log"))
            .map_err(|e| dispatch_failed(format!("creating stderr.log: {}", e)))?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(WRAPPER)
            .arg("runmon-job")
            .arg(&command.program)
            .args(&command.args)
            .env("RUNMON_JOB_DIR", &dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| dispatch_failed(e.to_string()))?;

        if let Err(e) = fs::write(dir.join("pid"), format!("{}\n", child.id())) {
            tracing::warn!(job = %handle, "Could not write pid file: {}", e);
        }
        tracing::info!(job = %handle, pid = child.id(), "$ {}", command);
        self.children.lock().insert(handle.clone(), child);
        Ok(handle)
    }

    fn poll_status(&self, handle: &JobHandle) -> JobRunnerResult<RemoteStatus> {
        let dir = self
            .job_dir(handle)
            .ok_or_else(|| JobRunnerError::UnknownJob(handle.clone()))?;
        self.reap(handle, &dir)?;

        let content = match fs::read_to_string(dir.join(EXIT_STATUS_FILE)) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RemoteStatus::Running),
            Err(e) => return Err(JobRunnerError::io(format!("reading exit of job {}", handle), e)),
        };
        let code: i32 = content.trim().parse().map_err(|_| {
            JobRunnerError::io(
                format!("reading exit of job {}", handle),
                io::Error::new(io::ErrorKind::InvalidData, format!("bad exit record {:?}", content.trim())),
            )
        })?;
        Ok(if code == 0 {
            RemoteStatus::Succeeded
        } else {
            RemoteStatus::Failed
        })
    }
}
