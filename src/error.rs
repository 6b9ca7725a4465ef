use std::io;

/// Error type for rapidpool operations.
///
/// Expected network failures (a probe timing out, a source returning 503)
/// are not errors: they come back as [`crate::ValidationResult`] values or
/// per-source fetch summaries. This enum covers contract violations and
/// unrecoverable I/O only.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Bad configuration detected up front, before any cycle runs.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// A candidate identity that does not parse as `[scheme://]host:port`.
    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),
    /// Failure building a probe client for a candidate.
    #[error("Probe setup failed: {0}")]
    ProbeSetup(String),
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for rapidpool operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(0)
        } else if err.is_builder() {
            Error::ProbeSetup(err.to_string())
        } else {
            Error::Request(err.to_string())
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
