use thiserror::Error;

/// Failure of a single outbound delivery attempt.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The platform answered, but with a non-success status.
    #[error("platform rejected delivery with {status}: {body}")]
    RemoteRejection { status: u16, body: String },

    /// No interpretable response (connect error, timeout, broken body).
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("invalid delivery target: {0}")]
    InvalidTarget(String),

    #[error("refusing to deliver an empty message")]
    EmptyBody,
}

impl DeliveryError {
    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::RemoteRejection { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        DeliveryError::Transport(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing database could not be reached. Callers log and move on.
    #[error("pending store unavailable: {0}")]
    Unavailable(String),

    #[error("pending store query failed: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// The classifier or generator could not produce a reply for an event.
#[derive(Debug, Error)]
#[error("classification failed: {0:#}")]
pub struct ClassificationError(pub anyhow::Error);

impl From<anyhow::Error> for ClassificationError {
    fn from(err: anyhow::Error) -> Self {
        ClassificationError(err)
    }
}
