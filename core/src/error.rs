use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned status {status} for {url}")]
    UpstreamStatus { status: u16, url: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{target}: retries exhausted after {attempts} attempts, last error: {cause}")]
    RetryExhausted {
        target: String,
        attempts: u32,
        cause: Box<Error>,
    },

    #[error("table '{id}' failed: {cause}")]
    Table { id: String, cause: Arc<Error> },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient failures worth another attempt. Configuration errors and
    /// already-exhausted operations are excluded.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Http(_) | Error::UpstreamStatus { .. } | Error::Io(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// The upstream status buried in an exhausted retry chain, if any.
    pub fn last_upstream_status(&self) -> Option<u16> {
        match self {
            Error::UpstreamStatus { status, .. } => Some(*status),
            Error::RetryExhausted { cause, .. } => cause.last_upstream_status(),
            Error::Table { cause, .. } => cause.last_upstream_status(),
            _ => None,
        }
    }
}
