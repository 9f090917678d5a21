use std::io;
use std::path::PathBuf;

/// Error returned when loading or validating [`crate::config::Config`].
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid value for environment variable {key}: {value:?}")]
    Env { key: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Error returned by [`crate::buffer::IngestBuffer::enqueue`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    #[error("ingest buffer is full")]
    Full,

    #[error("ingest buffer is closed")]
    Closed,
}

/// Error returned when a record could not be appended to its stream file.
#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    #[error("invalid stream key {0:?}")]
    InvalidStream(String),

    #[error("i/o error writing {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("stream {stream} failed to rotate {path}: {source}")]
    Rotation {
        stream: String,
        path: PathBuf,
        source: io::Error,
    },

    #[error("stream {0} is disabled after a rotation failure")]
    StreamFailed(String),

    #[error("write was dropped before completion")]
    Dropped,
}

impl WriteError {
    /// True for errors after which the stream can no longer accept data.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WriteError::Rotation { .. } | WriteError::StreamFailed(_))
    }
}

/// Error returned while reconciling the output directory at startup.
#[derive(thiserror::Error, Debug)]
pub enum ReloadError {
    #[error("cannot prepare log directory {path}: {source}")]
    Directory { path: PathBuf, source: io::Error },

    #[error("cannot reconcile {path}: {source}")]
    File { path: PathBuf, source: io::Error },
}

/// Error returned by an [`crate::upload::Uploader`].
#[derive(thiserror::Error, Debug)]
pub enum UploadError {
    #[error("i/o error reading {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("upload target rejected {file}: {reason}")]
    Rejected { file: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),
}
