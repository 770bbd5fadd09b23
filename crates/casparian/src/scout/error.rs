//! Errors for the Scout walk/tag/version/enqueue pipeline (§4.2).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScoutError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] casparian_db::DbError),

    #[error("invalid tagging pattern '{0}': {1}")]
    Pattern(String, String),

    #[error("source path does not exist or is not a directory: {0}")]
    InvalidRoot(String),
}

pub type Result<T> = std::result::Result<T, ScoutError>;
