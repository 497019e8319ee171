//! Unified error handling for the sync runtime.

use crate::resilience::ResilienceError;
use std::io;
use std::path::PathBuf;

/// Runtime error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to persist {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("engine error: {0}")]
    Engine(#[from] trellis_engine::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("remote call failed: {0}")]
    Remote(#[from] ResilienceError),

    #[error("state file {} is corrupt: {reason}", path.display())]
    Corruption { path: PathBuf, reason: String },
}

impl SyncError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }

    /// Whether the error means the addressed entity does not exist.
    pub fn is_not_found(&self) -> bool {
        use trellis_engine::Error as E;
        matches!(
            self,
            Self::NotFound(_)
                | Self::Engine(
                    E::MappingNotFound(_)
                        | E::ConflictNotFound { .. }
                        | E::HistoryEntryNotFound(_)
                )
        )
    }
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, SyncError>;
