//! Error types for the Trellis engine.

use crate::{resolve::ResolutionStrategy, LocalId, RemoteId, SchemaVersion};
use thiserror::Error;

/// All possible errors from the Trellis engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // State errors
    #[error("invalid sync state: {0}")]
    InvalidState(String),

    #[error("unsupported state schema version: {found} (max supported: {supported})")]
    UnsupportedVersion {
        found: SchemaVersion,
        supported: SchemaVersion,
    },

    #[error("mapping not found for local id: {0}")]
    MappingNotFound(LocalId),

    #[error("conflict not found: {local_id} <-> #{remote_id}")]
    ConflictNotFound {
        local_id: LocalId,
        remote_id: RemoteId,
    },

    #[error("history entry not found: {0}")]
    HistoryEntryNotFound(String),

    // Resolution errors
    #[error("strategy {strategy} cannot be applied: {reason}")]
    UnsupportedStrategy {
        strategy: ResolutionStrategy,
        reason: String,
    },

    #[error("field '{0}' is not part of the conflict")]
    FieldNotInConflict(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
