use std::time::Duration;

use thiserror::Error;

/// Error taxonomy shared by every kbase component.
///
/// Payloads are plain strings so one failure can be cloned out to every
/// waiter of a coalesced cache miss or a single-flight sync.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Bad endpoint, credentials or settings. Never triggers failover.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Timeout or refused connection; retried locally, then fails over.
    #[error("Transient connection failure: {0}")]
    TransientConnection(String),

    /// The embedding provider kept failing after the retry budget.
    #[error("Embedding provider unavailable after {attempts} attempt(s): {reason}")]
    ProviderUnavailable { attempts: u32, reason: String },

    /// Rejected before any I/O.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A sync failed and was rolled back.
    #[error("Sync aborted: {0}")]
    SyncAborted(String),

    /// The operation ran past its deadline or was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Non-transient backend failure.
    #[error("Store error: {0}")]
    Store(String),
}

impl Error {
    pub fn store(err: impl std::fmt::Display) -> Self { Self::Store(err.to_string()) }

    pub fn transient(err: impl std::fmt::Display) -> Self { Self::TransientConnection(err.to_string()) }

    pub fn timed_out(what: &str, after: Duration) -> Self {
        Self::TransientConnection(format!("{what} timed out after {}ms", after.as_millis()))
    }

    /// Whether the failure should count against Primary health.
    pub fn is_transient(&self) -> bool { matches!(self, Self::TransientConnection(_)) }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe => Self::TransientConnection(err.to_string()),
            _ => Self::Store(err.to_string()),
        }
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self { Self::Configuration(err.to_string()) }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self { Self::Store(format!("json: {err}")) }
}

/// Failures reported by an embedding provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmbedError {
    /// Provider-side throttling; retryable.
    #[error("rate limited{}", .retry_after.map(|d| format!(" (retry after {}ms)", d.as_millis())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// The input can never be embedded; not retryable.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Network or model failure; retryable.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl EmbedError {
    pub fn is_retryable(&self) -> bool { !matches!(self, Self::InvalidInput(_)) }
}

pub type Result<T> = std::result::Result<T, Error>;
