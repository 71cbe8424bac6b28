use thiserror::Error;

/// Every way a device exchange can fail.
///
/// Recovery does not branch on the variant: the engine reports the error and
/// schedules a fresh login regardless. The variants exist so that logs and
/// subscribers can tell a dead network from a device that refused a request.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection refused, timeout, DNS failure, unreadable body.
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The body was not the JSON object the device normally answers with.
    #[error("Malformed response from {path}: {message}")]
    Malformed { path: String, message: String },

    /// The device answered with a `STATUS` other than `OK`/`EOL`.
    #[error("Device rejected {path} with status {status}")]
    Status { path: String, status: String },

    /// The login handshake did not yield a session id.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A historical log entry could not be mapped onto a record.
    #[error("Invalid log record: {0}")]
    InvalidRecord(String),

    /// The request queue worker has shut down.
    #[error("Request queue closed")]
    QueueClosed,
}

impl Error {
    /// Returns `true` if the failure happened below the HTTP layer.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
