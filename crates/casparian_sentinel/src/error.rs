//! Sentinel-local error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SentinelError {
    #[error(transparent)]
    Db(#[from] casparian_db::DbError),

    #[error(transparent)]
    Protocol(#[from] casparian_protocol::ProtocolError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("zmq error: {0}")]
    Zmq(String),

    #[error("worker '{0}' is not registered")]
    UnknownWorker(String),

    #[error("no routing entry for plugin '{0}'")]
    UnknownPlugin(String),
}

pub type Result<T> = std::result::Result<T, SentinelError>;
