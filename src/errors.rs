// sitebackup/src/errors.rs
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stage '{stage}' failed. Details in {}", log.display())]
    Stage {
        stage: String,
        log: PathBuf,
        #[source]
        source: Box<AppError>,
    },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Chunking failed: {0}")]
    Chunking(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Upload verification failed: {0}")]
    Verification(String),

    #[error("{key} is already in the bucket with {remote_bytes} bytes but the local chunk has {local_bytes}; it belongs to another archive")]
    RemoteMismatch {
        key: String,
        remote_bytes: u64,
        local_bytes: u64,
    },

    #[error("Couldn't remove local artifact {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl AppError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AppError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure of a single process invocation.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("{program} not found in PATH")]
    NotFound { program: String },

    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {}", code.map_or_else(|| "unknown".to_string(), |c| c.to_string()))]
    Exit { program: String, code: Option<i32> },

    #[error("{program} targets a remote host but the runner only executes locally")]
    RemoteUnsupported { program: String },

    #[error("Couldn't write to run log {}: {source}", path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure reported by the object store client.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store answered, but with an error other than "not found".
    #[error("{operation} on {target} failed: {message}")]
    Service {
        operation: &'static str,
        target: String,
        status: Option<u16>,
        message: String,
    },

    /// The request never got a usable answer (connection reset, timeout, ...).
    #[error("{operation} on {target} failed in transit: {message}")]
    Transport {
        operation: &'static str,
        target: String,
        message: String,
    },

    #[error("Couldn't read {} for upload: {message}", path.display())]
    Body { path: PathBuf, message: String },
}

impl StoreError {
    pub fn is_transport(&self) -> bool {
        matches!(self, StoreError::Transport { .. })
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
