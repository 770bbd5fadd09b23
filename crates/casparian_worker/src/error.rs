//! Worker-local error type. Every terminal job failure is classified into
//! the §7 taxonomy before it reaches `fail_job`.

use casparian_protocol::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("topic name '{0}' fails the handle-table grammar")]
    InvalidTopicName(String),

    #[error("unknown topic handle {0}")]
    UnknownHandle(usize),

    #[error("plugin source_hash {found} does not match manifest {expected}")]
    ArtifactDrift { expected: String, found: String },

    #[error("sandbox exited with status {0}: {1}")]
    SandboxFailed(i32, String),

    #[error("sandbox wall-clock timeout exceeded")]
    Timeout,

    #[error("job lease lost: {0}")]
    LeaseLost(String),

    #[error("sink commit failed: {0}")]
    Commit(String),

    #[error(transparent)]
    Db(#[from] casparian_db::DbError),

    #[error(transparent)]
    Sink(#[from] casparian_sinks::SinkError),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Protocol(#[from] casparian_protocol::ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

impl WorkerError {
    /// Classification into §7's error kind, and whether it is retryable by
    /// default policy. Mirrors `ErrorKind::retryable_by_default` but some
    /// variants here override the default (e.g. `artifact_drift` is always
    /// non-retryable regardless of its kind's usual policy).
    pub fn classify(&self) -> (ErrorKind, bool) {
        match self {
            WorkerError::InvalidTopicName(_) => (ErrorKind::Validation, false),
            WorkerError::UnknownHandle(_) => (ErrorKind::Validation, false),
            WorkerError::ArtifactDrift { .. } => (ErrorKind::ArtifactDrift, false),
            WorkerError::SandboxFailed(..) => (ErrorKind::PluginError, false),
            WorkerError::Timeout => (ErrorKind::Timeout, true),
            WorkerError::LeaseLost(_) => (ErrorKind::LeaseLost, false),
            WorkerError::Commit(_) => (ErrorKind::Commit, true),
            WorkerError::Db(_) => (ErrorKind::TransientIo, true),
            WorkerError::Sink(_) => (ErrorKind::TransientIo, true),
            WorkerError::Sqlx(_) => (ErrorKind::TransientIo, true),
            WorkerError::Protocol(_) => (ErrorKind::Protocol, true),
            WorkerError::Io(_) => (ErrorKind::TransientIo, true),
            WorkerError::Arrow(_) => (ErrorKind::Validation, false),
            WorkerError::Json(_) => (ErrorKind::Protocol, true),
        }
    }
}
