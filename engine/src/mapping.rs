//! Mapping records linking local items to remote issues.

use crate::{ContainerId, LocalId, RemoteId, Timestamp};
use serde::{Deserialize, Serialize};

/// Direction of the last sync for a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncDirection {
    /// Local changes were pushed to the remote
    ToRemote,
    /// Remote changes were pulled into the local item
    FromRemote,
    /// Both sides were updated
    Bidirectional,
}

/// Health of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingStatus {
    #[default]
    Synced,
    Pending,
    Conflict,
    Error,
}

/// Link between one local item and one remote issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub local_id: LocalId,
    pub remote_id: RemoteId,
    /// Remote container (e.g. `owner/repo`)
    pub container: ContainerId,
    /// When the pair was last brought in sync
    pub last_synced_at: Timestamp,
    pub last_sync_direction: SyncDirection,
    #[serde(default)]
    pub status: MappingStatus,
}

impl Mapping {
    /// Create a freshly synced mapping.
    pub fn new(
        local_id: impl Into<LocalId>,
        remote_id: RemoteId,
        container: impl Into<ContainerId>,
        last_synced_at: Timestamp,
        direction: SyncDirection,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            remote_id,
            container: container.into(),
            last_synced_at,
            last_sync_direction: direction,
            status: MappingStatus::Synced,
        }
    }

    pub fn with_status(mut self, status: MappingStatus) -> Self {
        self.status = status;
        self
    }

    /// Record a completed sync.
    pub fn touch(&mut self, at: Timestamp, direction: SyncDirection) {
        self.last_synced_at = at;
        self.last_sync_direction = direction;
        self.status = MappingStatus::Synced;
    }
}
