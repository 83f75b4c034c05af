//! Error types for Nixie.
//!
//! TigerStyle: explicit error variants with context, using thiserror. The taxonomy
//! follows the operational split: caller errors (invalid argument),
//! reported-not-failed conditions (not found, conflict), capacity, and
//! transient I/O.

use thiserror::Error;

/// Result type alias for Nixie operations
pub type Result<T> = std::result::Result<T, Error>;

/// Nixie error types
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Invalid argument
    // =========================================================================
    #[error("invalid actor id: {id}, reason: {reason}")]
    InvalidActorId { id: String, reason: String },

    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },

    #[error("value too large: {size} bytes exceeds limit of {limit} bytes")]
    ValueTooLarge { size: usize, limit: usize },

    #[error("invalid value: {reason}")]
    InvalidValue { reason: String },

    #[error("invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    // =========================================================================
    // Conflict / lifecycle
    // =========================================================================
    #[error("actor already active: {id}")]
    ActorAlreadyActive { id: String },

    #[error("actor not active: {id}")]
    ActorNotActive { id: String },

    #[error("actor not initialized: {id}")]
    ActorNotInitialized { id: String },

    // =========================================================================
    // Capacity
    // =========================================================================
    #[error("mailbox full: {depth} items (limit: {limit})")]
    MailboxFull { depth: usize, limit: usize },

    #[error("mailbox stopped")]
    MailboxStopped,

    #[error("worker pool stopped")]
    PoolStopped,

    // =========================================================================
    // Transient I/O
    // =========================================================================
    #[error("wal append failed: {reason}")]
    WalAppendFailed { reason: String },

    #[error("wal rotate failed: {reason}")]
    WalRotateFailed { reason: String },

    #[error("wal open failed: {path}, reason: {reason}")]
    WalOpenFailed { path: String, reason: String },

    // =========================================================================
    // Internal
    // =========================================================================
    #[error("serialization failed: {reason}")]
    SerializationFailed { reason: String },

    #[error("deserialization failed: {reason}")]
    DeserializationFailed { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an invalid actor id error
    pub fn invalid_actor_id(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidActorId {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid key error
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value(reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            reason: reason.into(),
        }
    }

    /// Create a wal append failure
    pub fn wal_append(reason: impl Into<String>) -> Self {
        Self::WalAppendFailed {
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Whether retrying the operation may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::WalAppendFailed { .. } | Self::WalRotateFailed { .. } | Self::MailboxFull { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_carries_context() {
        let err = Error::invalid_actor_id("bad/id", "contains invalid characters");
        assert!(err.to_string().contains("bad/id"));
    }

    #[test]
    fn retriable_classification() {
        assert!(Error::wal_append("disk full").is_retriable());
        assert!(!Error::ActorNotActive { id: "a1".into() }.is_retriable());
        assert!(!Error::invalid_key("empty").is_retriable());
    }
}
