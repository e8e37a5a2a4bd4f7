//! Error kinds for the IPS core.
//!
//! Every subsystem boundary returns a tagged kind instead of a generic
//! failure; the orchestrator is the sole arbiter that may escalate a kind
//! to `Fatal`.

use thiserror::Error;

/// Coarse error classification used to decide retry/degrade/shutdown policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Subprocess timeout, empty queue, classifier predict noise — retry
    /// bounded, degrade to heuristic path after repeated failures.
    Transient,
    /// Config reload failure, persistence write failure — keep running
    /// with previous in-memory state.
    Recoverable,
    /// Attempted to act on a protected address range — suppressed, never
    /// alerted as an attack.
    Protected,
    /// Missing capture privilege, artifact version mismatch, unrecoverable
    /// pool exhaustion — orderly shutdown.
    Fatal,
}

/// IPS core error type, tagged with an `ErrorKind` for dispatch.
#[derive(Error, Debug)]
pub enum IpsError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("recoverable: {0}")]
    Recoverable(String),

    #[error("protected range: {0}")]
    Protected(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(String),
}

impl From<serde_json::Error> for IpsError {
    fn from(e: serde_json::Error) -> Self {
        IpsError::Serde(e.to_string())
    }
}

impl IpsError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn recoverable(msg: impl Into<String>) -> Self {
        Self::Recoverable(msg.into())
    }

    pub fn protected(msg: impl Into<String>) -> Self {
        Self::Protected(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Classify this error for the statistics `error_counts_by_kind` map
    /// and the process health enum.
    pub fn kind(&self) -> ErrorKind {
        match self {
            IpsError::Transient(_) => ErrorKind::Transient,
            IpsError::Recoverable(_) => ErrorKind::Recoverable,
            IpsError::Protected(_) => ErrorKind::Protected,
            IpsError::Fatal(_) => ErrorKind::Fatal,
            IpsError::Io(_) => ErrorKind::Recoverable,
            IpsError::Serde(_) => ErrorKind::Recoverable,
        }
    }
}

/// Result alias for IPS core fallible operations.
pub type IpsResult<T> = Result<T, IpsError>;

/// Process health derived from the recent error mix; exposed via the
/// statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Health {
    Healthy,
    Degraded,
    Failing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_maps_correctly() {
        assert_eq!(IpsError::transient("x").kind(), ErrorKind::Transient);
        assert_eq!(IpsError::protected("x").kind(), ErrorKind::Protected);
        assert_eq!(IpsError::fatal("x").kind(), ErrorKind::Fatal);
    }
}
