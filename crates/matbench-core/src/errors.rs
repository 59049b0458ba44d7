//! Typed errors for the orchestration engine.

use std::path::PathBuf;

/// Invalid sweep or case configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("size list for {case} is empty")]
    EmptySizes { case: String },

    #[error("size list for {case} must be strictly increasing (got {sizes:?})")]
    SizesNotIncreasing { case: String, sizes: Vec<usize> },

    #[error("{field} must be > 0")]
    Zero { field: &'static str },

    #[error("tolerance must be finite and > 0 (got {value})")]
    Tolerance { value: f64 },

    #[error("unknown operation: {name}")]
    UnknownOperation { name: String },
}

/// Failures reading or writing persisted case records.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt case record {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("unsupported record schema {found} in {path}")]
    Schema { path: PathBuf, found: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures in the controller/worker file protocol.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {what} in {path}: {message}")]
    Malformed {
        what: &'static str,
        path: PathBuf,
        message: String,
    },
}
