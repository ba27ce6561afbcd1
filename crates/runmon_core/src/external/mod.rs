//! Interfaces to the collaborators the monitor drives, with the
//! reference implementations the CLI and tests use.

mod blob;
mod job_runner;
mod store;
mod telemetry;
mod work_queue;

pub use blob::{basename, BlobError, BlobResult, BlobStore, LocalBlobStore};
pub use job_runner::{
    JobCommand, JobRunner, JobRunnerError, JobRunnerResult, ProcessJobRunner, RemoteStatus,
};
pub use store::{FileStore, Store, StoreError, StoreResult};
pub use telemetry::{MetricEvent, RecordingTelemetry, Telemetry, TracingTelemetry};
pub use work_queue::{InProcessQueue, IngestTask, QueueError, QueueResult, WorkQueue};
