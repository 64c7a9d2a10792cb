//! Outcome type returned by every orchestrator operation.

use chrono::{DateTime, Utc};
use std::fmt::Display;
use thiserror::Error;
use tracing::error;

use super::store::StoreError;

/// Typed rejection surfaced to callers. Collaborator failures never pass
/// through as-is: they are logged and collapsed into [`IdentityError::Internal`].
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Malformed or missing input, detected before any collaborator call.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("{0} not found")]
    NotFound(String),
    /// Uniqueness violation, or a stale write that exhausted its retries.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("locked out until {until}")]
    LockedOut { until: DateTime<Utc> },
    /// Unknown username or wrong password; deliberately indistinguishable.
    #[error("invalid username or password")]
    InvalidCredential,
    #[error("not allowed")]
    NotAllowed,
    #[error("internal error")]
    Internal,
}

impl IdentityError {
    pub(super) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(vec![message.into()])
    }

    /// Log a collaborator failure and hide its detail from the caller.
    pub(super) fn internal(context: &str, err: impl Display) -> Self {
        error!("{context}: {err}");
        Self::Internal
    }

    /// Map a store failure for an operation on `entity`.
    pub(super) fn from_store(entity: &str, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::NotFound(entity.to_string()),
            StoreError::Conflict(kind) => Self::Conflict(kind.to_string()),
            StoreError::Unexpected(err) => Self::internal(&format!("{entity} storage"), err),
        }
    }
}
