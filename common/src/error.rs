use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed record: {reason}")]
    MalformedRecord { reason: String },

    #[error("field {index} is {size} bytes, over the {limit} byte limit")]
    FieldTooLarge {
        index: usize,
        size: usize,
        limit: usize,
    },

    #[error("failed to write partition {}: {source}", path.display())]
    PartitionWriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("keys {existing:?} and {incoming:?} both map to {}", path.display())]
    SanitizationCollision {
        path: PathBuf,
        existing: String,
        incoming: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("task failed: {0}")]
    Task(String),
}

impl Error {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedRecord {
            reason: reason.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn partition(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::PartitionWriteFailure {
            path: path.into(),
            source,
        }
    }

    /// Errors scoped to a single input line. Only these may be skipped.
    pub fn is_record_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedRecord { .. } | Error::FieldTooLarge { .. }
        )
    }
}
