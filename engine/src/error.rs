//! Error types for the tether engine.

use crate::gateway::NetworkError;
use crate::{CollectionName, LocalId};
use thiserror::Error;

/// All possible errors from the tether engine.
///
/// Version conflicts are deliberately absent: they are an expected outcome of a
/// push and travel as [`crate::PushResult::Rejected`] to the conflict resolver.
#[derive(Debug, Error)]
pub enum Error {
    // Validation errors
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("entity not found: {0}")]
    EntityNotFound(LocalId),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("operation on deleted entity: {0}")]
    EntityDeleted(LocalId),

    #[error("entity has an unresolved conflict: {0}")]
    UnresolvedConflict(LocalId),

    #[error("no conflict recorded for entity: {0}")]
    NoConflict(LocalId),

    // Storage errors
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row: {0}")]
    CorruptRow(String),

    // Network errors
    #[error(transparent)]
    Network(#[from] NetworkError),

    // Lifecycle errors
    #[error("sync cancelled")]
    Cancelled,

    #[error("trigger coordinator stopped")]
    CoordinatorStopped,
}

impl Error {
    /// Returns true for errors caused by a malformed caller mutation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::CollectionNotFound(_)
                | Error::EntityNotFound(_)
                | Error::InvalidPayload(_)
                | Error::MissingRequiredField(_)
                | Error::TypeMismatch { .. }
                | Error::EntityDeleted(_)
                | Error::UnresolvedConflict(_)
                | Error::NoConflict(_)
        )
    }

    /// Returns true for local storage failures. These are fatal to the call.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Migration(_) | Error::CorruptRow(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
