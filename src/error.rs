use thiserror::Error;

/// Failures the scan engine distinguishes between.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Neither the environment-facing nor the user-facing camera could be attached.
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    /// The decoder stopped scanning while it was believed to be running.
    #[error("decoder health check failed: {0}")]
    DecoderHealthFailure(String),

    /// The local queue could not store or update a scan record.
    #[error("failed to save scan locally: {0}")]
    PersistenceFailure(#[from] sqlx::Error),

    /// Batch submission to the server failed. Retried on the next trigger.
    #[error("sync failed: {0}")]
    SyncFailure(String),

    #[error("no active session selected")]
    NoActiveSession,

    #[error("session {0} is not active")]
    InactiveSession(i64),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ScanError {
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::SyncFailure(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl From<reqwest::Error> for ScanError {
    fn from(err: reqwest::Error) -> Self {
        Self::SyncFailure(err.to_string())
    }
}
