use std::path::PathBuf;

/// Errors produced by the shadow-tree engine, traversal, scheduler and readers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("i/o error at {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The on-disk object changed identity (device/inode/mode) between the
    /// `lstat` used to decide how to handle it and the `open`/`fstat` used to
    /// read it. The caller should retry once; a second race aborts the step.
    #[error("race detected while backing up {path}: {detail}")]
    RaceDetected { path: PathBuf, detail: String },

    #[error("revision {revision} missing for {path}")]
    MissingRevision { path: PathBuf, revision: u64 },

    /// A patch helper failed or produced an unusable patch. Callers should
    /// demote this to a warning and fall back to storing a full payload.
    #[error("patch helper failed for {path}: {detail}")]
    PatchFailed { path: PathBuf, detail: String },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::IoError {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
