use thiserror::Error;

/// Errors raised by every kinesync component.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Key absent from the index or the store.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Topic or pattern rejected by the bus.
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Store call that may succeed after refreshing credentials.
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// The engine failed to start or exited unsuccessfully.
    #[error("Engine failure (exit code {exit_code:?}): {message}")]
    EngineFailure {
        /// Exit code, when the engine ran at all.
        exit_code: Option<i32>,
        /// What went wrong.
        message: String,
    },

    /// A status record that is not a JSON object with a known state.
    #[error("Corrupt status record at {path}: {reason}")]
    CorruptStatus {
        /// Key of the record.
        path: String,
        /// Parser complaint.
        reason: String,
    },

    /// Local filesystem or process I/O.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Directory watch could not be set up.
    #[error("Watch error: {0}")]
    Watch(String),

    /// Broken invariant or failed background task.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Flat tag for a [`SyncError`], handy for matching in callers and tests.
/// Variants mirror the error's.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidTopic,
    TransientStore,
    EngineFailure,
    CorruptStatus,
    Io,
    Serialization,
    Watch,
    Internal,
}

impl SyncError {
    /// Variant tag without the payload.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::InvalidTopic(_) => ErrorKind::InvalidTopic,
            SyncError::TransientStore(_) => ErrorKind::TransientStore,
            SyncError::EngineFailure { .. } => ErrorKind::EngineFailure,
            SyncError::CorruptStatus { .. } => ErrorKind::CorruptStatus,
            SyncError::Io(_) => ErrorKind::Io,
            SyncError::Serialization(_) => ErrorKind::Serialization,
            SyncError::Watch(_) => ErrorKind::Watch,
            SyncError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for [`SyncError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }
}

impl From<notify::Error> for SyncError {
    fn from(err: notify::Error) -> Self {
        SyncError::Watch(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;
