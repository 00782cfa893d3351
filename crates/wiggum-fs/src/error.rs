//! Error taxonomy shared across the filesystem-persistence modules.

use thiserror::Error;

pub use crate::board::BoardError;

#[derive(Debug, Error)]
pub enum FsError {
    #[error(transparent)]
    Board(#[from] BoardError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed json at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
