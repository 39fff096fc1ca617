//! Error types for the reconciler crate.

use thiserror::Error;

use crate::types::{ErrorKind, ResourceKey};

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Key is absent from the state store.
    #[error("resource '{key}' not found")]
    NotFound { key: ResourceKey },

    /// Observed-state write raced with another write to the same key.
    #[error("version conflict on '{key}' (expected {expected}, found {actual})")]
    Conflict {
        key: ResourceKey,
        expected: u64,
        actual: u64,
    },

    /// Transient failure from the external system.
    #[error("retryable failure: {reason}")]
    Retryable { reason: String },

    /// Permanent failure that needs a spec change or manual intervention.
    #[error("fatal failure: {reason}")]
    Fatal { reason: String },

    /// Desired spec rejected at the API boundary.
    #[error("invalid spec for '{key}': {reason}")]
    InvalidSpec { key: ResourceKey, reason: String },

    /// No controller registered for a resource kind.
    #[error("no controller registered for kind '{kind}'")]
    UnknownKind { kind: String },

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The loop is shutting down and accepts no new work.
    #[error("reconciliation loop is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Create a not found error.
    pub fn not_found(key: &ResourceKey) -> Self {
        Self::NotFound { key: key.clone() }
    }

    /// Create a version conflict error.
    pub fn conflict(key: &ResourceKey, expected: u64, actual: u64) -> Self {
        Self::Conflict {
            key: key.clone(),
            expected,
            actual,
        }
    }

    /// Create a retryable error.
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable {
            reason: reason.into(),
        }
    }

    /// Create a fatal error.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    /// Create an invalid spec error.
    pub fn invalid_spec(key: &ResourceKey, reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            key: key.clone(),
            reason: reason.into(),
        }
    }

    /// Create an unknown kind error.
    pub fn unknown_kind(kind: impl Into<String>) -> Self {
        Self::UnknownKind { kind: kind.into() }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Map onto the engine's error taxonomy.
    ///
    /// Errors raised by the host (bad spec, bad config, shutdown) have no
    /// cycle-level kind and return `None`. An unknown kind can never succeed
    /// without operator action, so it counts as fatal.
    #[must_use]
    pub const fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::NotFound { .. } => Some(ErrorKind::NotFound),
            Self::Conflict { .. } => Some(ErrorKind::Conflict),
            Self::Retryable { .. } => Some(ErrorKind::Retryable),
            Self::Fatal { .. } | Self::UnknownKind { .. } => Some(ErrorKind::Fatal),
            Self::InvalidSpec { .. } | Self::InvalidConfig { .. } | Self::ShuttingDown => None,
        }
    }

    /// Whether the engine may retry the failed cycle on its own.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. } | Self::Conflict { .. })
    }
}
