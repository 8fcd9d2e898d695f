//! Error types for consent and access-control operations.
//!
//! The taxonomy is deliberately small. Calling layers map each kind to a
//! response code through [`ConsentError::kind`]; the message carries the
//! human-readable detail.
//!
//! # Propagation
//!
//! - `Validation` and `Authorization` are raised before any mutation.
//! - `StoreUnavailable` is a hard error on write paths. On the access
//!   validation path it is converted into a denied decision instead.
//! - `AuditWriteFailure` is reported to callers of the audit log. Registry
//!   operations downgrade it to a degraded-audit warning once the store write
//!   has succeeded.

use thiserror::Error;

/// Errors raised by consent and access-control operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConsentError {
    /// Malformed input: empty permissions, unknown enum value, missing field.
    #[error("validation failed for {field}: {reason}")]
    Validation {
        /// The offending field.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The referenced token or principal does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// What kind of entity was looked up.
        entity: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// The caller lacks rights over the resource.
    #[error("actor {actor_id} is not authorized: {reason}")]
    Authorization {
        /// The actor that attempted the operation.
        actor_id: String,
        /// Why the operation was refused.
        reason: String,
    },

    /// The ledger-backed store timed out or failed.
    #[error("store unavailable during {operation}: {reason}")]
    StoreUnavailable {
        /// The store operation that failed.
        operation: String,
        /// The underlying failure.
        reason: String,
    },

    /// An audit append failed.
    #[error("audit write failed for {event_type}: {reason}")]
    AuditWriteFailure {
        /// The event type that could not be recorded.
        event_type: String,
        /// The underlying failure.
        reason: String,
    },
}

/// Stable error codes for calling layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`ConsentError::Validation`].
    Validation,
    /// See [`ConsentError::NotFound`].
    NotFound,
    /// See [`ConsentError::Authorization`].
    Authorization,
    /// See [`ConsentError::StoreUnavailable`].
    StoreUnavailable,
    /// See [`ConsentError::AuditWriteFailure`].
    AuditWriteFailure,
}

impl ErrorKind {
    /// Returns the wire code for this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Authorization => "AUTHORIZATION_ERROR",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::AuditWriteFailure => "AUDIT_WRITE_FAILURE",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConsentError {
    /// Creates a new validation error.
    #[must_use]
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new not-found error.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates a new authorization error.
    #[must_use]
    pub fn authorization(actor_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Authorization {
            actor_id: actor_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new store-unavailable error.
    #[must_use]
    pub fn store_unavailable(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new audit-write-failure error.
    #[must_use]
    pub fn audit_write_failure(event_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AuditWriteFailure {
            event_type: event_type.into(),
            reason: reason.into(),
        }
    }

    /// Returns the stable kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Authorization { .. } => ErrorKind::Authorization,
            Self::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
            Self::AuditWriteFailure { .. } => ErrorKind::AuditWriteFailure,
        }
    }

    /// Returns `true` if retrying the same request may succeed.
    ///
    /// Only store outages are transient. Every other kind describes the
    /// request itself and will fail again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}

/// Result alias for consent operations.
pub type ConsentResult<T> = Result<T, ConsentError>;
