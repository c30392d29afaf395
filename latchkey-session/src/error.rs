//! Error types for session operations.

use std::time::Duration;
use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Result type for store adapter operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Session-specific errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Pessimistic lock acquisition exceeded the configured wait
    #[error("Timed out after {waited:?} waiting for the lock on session {id}")]
    LockTimeout {
        /// Store key of the contended session
        id: String,
        /// How long the acquirer waited before giving up
        waited: Duration,
    },

    /// Optimistic compare-and-swap lost the race
    #[error("Session {0} was modified concurrently")]
    ConcurrentModification(String),

    /// The lock is not held by this handler, either because another request
    /// holds it or because it went stale and was taken over
    #[error("Lock on session {0} is not held")]
    LockLost(String),

    /// A conditional store operation was rejected
    #[error("Conditional check failed for session {0}")]
    ConditionFailed(String),

    /// The backing store could not be reached or returned an error
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// Whether the failure came from coordination (timeout, lost race, lost
    /// lock) rather than from the store itself.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            SessionError::LockTimeout { .. }
                | SessionError::ConcurrentModification(_)
                | SessionError::LockLost(_)
                | SessionError::ConditionFailed(_)
        )
    }
}

/// Errors reported by a [`SessionStore`](crate::traits::SessionStore) adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The condition attached to a put or delete did not hold
    #[error("Conditional check failed")]
    ConditionFailed,

    /// Network or service failure
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Convert into a [`SessionError`] naming the affected key.
    pub fn for_key(self, key: &str) -> SessionError {
        match self {
            StoreError::ConditionFailed => SessionError::ConditionFailed(key.to_string()),
            StoreError::Unavailable(msg) => SessionError::StoreUnavailable(msg),
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConditionFailed => SessionError::ConditionFailed(String::new()),
            StoreError::Unavailable(msg) => SessionError::StoreUnavailable(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_for_key() {
        let err = StoreError::ConditionFailed.for_key("abc");
        assert!(matches!(err, SessionError::ConditionFailed(ref id) if id == "abc"));

        let err = StoreError::Unavailable("down".to_string()).for_key("abc");
        assert!(matches!(err, SessionError::StoreUnavailable(ref msg) if msg == "down"));
    }

    #[test]
    fn test_contention_classification() {
        assert!(SessionError::ConcurrentModification("a".into()).is_contention());
        assert!(
            SessionError::LockTimeout {
                id: "a".into(),
                waited: Duration::from_secs(1)
            }
            .is_contention()
        );
        assert!(!SessionError::StoreUnavailable("x".into()).is_contention());
        assert!(!SessionError::Config("x".into()).is_contention());
    }

    #[test]
    fn test_error_display() {
        let err = SessionError::LockLost("sess_1".to_string());
        assert!(err.to_string().contains("sess_1"));
    }
}
