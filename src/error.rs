//! Crate-level error types.
//!
//! - [`StatsError`]: runtime failures of a statistics backend.
//! - [`BuildError`]: a [`StatsService`](crate::stats::StatsService) was built
//!   without its required repository.
//! - [`ConfigError`]: an environment variable was set to an unusable value.
//! - [`ValidationError`]: a `/fizzbuzz` query was malformed.
//! - [`StartupError`]: anything that stops the process from starting.

use std::time::Duration;

use thiserror::Error;

/// Failure of a statistics backend operation.
///
/// `Unavailable`, `Timeout` and `CorruptMember` all mean the backend cannot
/// currently be trusted; callers decide whether to degrade. None of them are
/// retried inside the crate.
#[derive(Debug, Error)]
pub enum StatsError {
    /// Transport or server error reported by the remote store.
    #[error("stats backend unavailable during {op}: {detail}")]
    Unavailable { op: &'static str, detail: String },

    /// The remote store did not answer within the per-operation timeout.
    #[error("stats backend timed out during {op} after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// A stored member could not be decoded back into a signature.
    #[error("stored member {member:?} is not a valid signature: {detail}")]
    CorruptMember { member: String, detail: String },

    /// A signature could not be encoded to its canonical form.
    #[error("failed to encode signature: {0}")]
    Encode(String),
}

impl StatsError {
    /// Returns `true` for every failure that originates in the backend
    /// (transport, timeout, protocol), as opposed to a local encoding bug.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(
            self,
            StatsError::Unavailable { .. }
                | StatsError::Timeout { .. }
                | StatsError::CorruptMember { .. }
        )
    }
}

/// Construction failure for [`StatsService`](crate::stats::StatsService).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("stats service requires a repository")]
    MissingRepository,
}

/// An environment variable was present but could not be used.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{key}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(key: &'static str, reason: impl Into<String>) -> Self {
        Self {
            key,
            reason: reason.into(),
        }
    }
}

/// Rejection of a `/fizzbuzz` request. The `Display` text is the message
/// returned to the client in the `{"error": ...}` body.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} must be a positive integer")]
    NotPositive(&'static str),

    #[error("limit is too large")]
    LimitTooLarge,

    #[error("str1 and str2 must be non-empty strings")]
    EmptyString,

    #[error("str1 and str2 must not contain control characters")]
    ControlCharacters,

    #[error("str1 and str2 are too long")]
    StringTooLong,
}

/// Everything that can abort process startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("stats backend: {0}")]
    Stats(#[from] StatsError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("server i/o: {0}")]
    Io(#[from] std::io::Error),
}
