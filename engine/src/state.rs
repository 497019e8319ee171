//! The persisted sync state aggregate.
//!
//! [`SyncState`] is what the runtime writes to disk. Every mutation here is
//! pure and takes `now` explicitly; persistence, locking and backups live in
//! the runtime crate.

use crate::{
    change::ChangeMetadata,
    conflict::Conflict,
    error::Result,
    history::{OperationRecord, ResolutionRecord},
    mapping::{Mapping, MappingStatus},
    ContainerId, Error, LocalId, RemoteId, SchemaVersion, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Current version of the state file format.
pub const STATE_SCHEMA_VERSION: SchemaVersion = 1;

/// Default cap on the operation history.
pub const DEFAULT_MAX_HISTORY: usize = 1000;

/// Resolved conflicts beyond this count make the state ask for cleanup.
pub const RESOLVED_CONFLICT_CLEANUP_THRESHOLD: usize = 100;

/// Metadata about the most recent backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub path: String,
    pub created_at: Timestamp,
    pub mapping_count: usize,
    pub schema_version: SchemaVersion,
}

/// Left on a state that was recovered after corruption.
///
/// Stays set across reads and writes until the caller has reconciled and
/// clears it, so the loss is visible to whoever looks next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryMarker {
    pub recovered_at: Timestamp,
    /// Backup the state was restored from; `None` when it was reset empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
}

/// Aggregate root of everything the sync engine persists.
///
/// Uses BTreeMap for deterministic serialization order. The remote-id index
/// is rebuilt on load and never serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub version: SchemaVersion,
    pub container: ContainerId,
    #[serde(default)]
    pub mappings: BTreeMap<LocalId, Mapping>,
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    #[serde(default)]
    pub change_metadata: BTreeMap<LocalId, ChangeMetadata>,
    /// Oldest first; capped at `max_history_size`
    #[serde(default)]
    pub operation_history: Vec<OperationRecord>,
    pub max_history_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<Timestamp>,
    #[serde(default)]
    pub sync_in_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup: Option<BackupInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryMarker>,
    #[serde(skip)]
    remote_index: HashMap<RemoteId, LocalId>,
}

/// Derived statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStats {
    pub total_mappings: usize,
    pub synced: usize,
    pub pending: usize,
    pub conflicted: usize,
    pub errored: usize,
    pub unresolved_conflicts: usize,
    pub resolved_conflicts: usize,
    pub history_size: usize,
    pub max_history_size: usize,
    pub last_sync_at: Option<Timestamp>,
    pub sync_in_progress: bool,
    /// Size of the state file; filled in by the runtime
    pub file_size_bytes: Option<u64>,
    pub needs_cleanup: bool,
}

/// What a history cleanup removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub operations_removed: usize,
    pub conflicts_removed: usize,
}

impl SyncState {
    /// Create an empty state for a container.
    pub fn new(container: impl Into<ContainerId>, now: Timestamp) -> Self {
        Self {
            version: STATE_SCHEMA_VERSION,
            container: container.into(),
            mappings: BTreeMap::new(),
            conflicts: Vec::new(),
            change_metadata: BTreeMap::new(),
            operation_history: Vec::new(),
            max_history_size: DEFAULT_MAX_HISTORY,
            last_sync_at: None,
            sync_in_progress: false,
            last_sync_error: None,
            created_at: now,
            updated_at: now,
            last_backup: None,
            recovery: None,
            remote_index: HashMap::new(),
        }
    }

    pub fn with_max_history(mut self, max: usize) -> Self {
        self.set_max_history(max);
        self
    }

    /// Change the history cap, dropping the oldest entries beyond it.
    pub fn set_max_history(&mut self, max: usize) {
        self.max_history_size = max;
        self.trim_history();
    }

    fn trim_history(&mut self) {
        let overflow = self
            .operation_history
            .len()
            .saturating_sub(self.max_history_size);
        if overflow > 0 {
            self.operation_history.drain(..overflow);
        }
    }

    /// Flag the state as recovered; `backup` is where it came from.
    pub fn mark_recovered(&mut self, backup: Option<String>, now: Timestamp) {
        self.recovery = Some(RecoveryMarker {
            recovered_at: now,
            backup,
        });
        self.touch(now);
    }

    /// Clear the recovery flag, returning it if one was set.
    pub fn clear_recovery(&mut self, now: Timestamp) -> Option<RecoveryMarker> {
        let marker = self.recovery.take();
        if marker.is_some() {
            self.touch(now);
        }
        marker
    }

    /// Check the structural invariants of the state.
    pub fn validate(&self) -> Result<()> {
        if self.version == 0 || self.version > STATE_SCHEMA_VERSION {
            return Err(Error::UnsupportedVersion {
                found: self.version,
                supported: STATE_SCHEMA_VERSION,
            });
        }
        if self.container.trim().is_empty() {
            return Err(Error::InvalidState("container is empty".into()));
        }
        if self.max_history_size == 0 {
            return Err(Error::InvalidState("history cap must be positive".into()));
        }
        if self.operation_history.len() > self.max_history_size {
            return Err(Error::InvalidState(format!(
                "history holds {} entries, cap is {}",
                self.operation_history.len(),
                self.max_history_size
            )));
        }

        let mut seen: HashMap<RemoteId, &str> = HashMap::new();
        for (key, mapping) in &self.mappings {
            if *key != mapping.local_id {
                return Err(Error::InvalidState(format!(
                    "mapping key {key} does not match local id {}",
                    mapping.local_id
                )));
            }
            if let Some(other) = seen.insert(mapping.remote_id, key) {
                return Err(Error::InvalidState(format!(
                    "remote #{} is mapped by both {other} and {key}",
                    mapping.remote_id
                )));
            }
        }

        for (key, meta) in &self.change_metadata {
            if *key != meta.local_id {
                return Err(Error::InvalidState(format!(
                    "change metadata key {key} does not match local id {}",
                    meta.local_id
                )));
            }
        }

        Ok(())
    }

    /// Parse and validate a state file.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut state: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidState(format!("malformed state file: {e}")))?;
        state.validate()?;
        state.rebuild_index();
        Ok(state)
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidState(e.to_string()))
    }

    fn rebuild_index(&mut self) {
        self.remote_index = self
            .mappings
            .values()
            .map(|m| (m.remote_id, m.local_id.clone()))
            .collect();
    }

    fn touch(&mut self, now: Timestamp) {
        self.updated_at = self.updated_at.max(now);
    }

    // Mappings

    pub fn mapping(&self, local_id: &str) -> Option<&Mapping> {
        self.mappings.get(local_id)
    }

    pub fn mapping_by_remote_id(&self, remote_id: RemoteId) -> Option<&Mapping> {
        let local_id = self.remote_index.get(&remote_id)?;
        self.mappings.get(local_id)
    }

    /// Insert or replace the mapping for its local id.
    ///
    /// Fails if the remote id is already mapped to a different local item.
    pub fn set_mapping(&mut self, mapping: Mapping, now: Timestamp) -> Result<()> {
        if let Some(owner) = self.remote_index.get(&mapping.remote_id) {
            if *owner != mapping.local_id {
                return Err(Error::InvalidState(format!(
                    "remote #{} is already mapped to {owner}",
                    mapping.remote_id
                )));
            }
        }

        if let Some(previous) = self.mappings.get(&mapping.local_id) {
            self.remote_index.remove(&previous.remote_id);
        }
        self.remote_index
            .insert(mapping.remote_id, mapping.local_id.clone());
        self.mappings.insert(mapping.local_id.clone(), mapping);
        self.touch(now);
        Ok(())
    }

    /// Remove a mapping together with its change metadata.
    pub fn remove_mapping(&mut self, local_id: &str, now: Timestamp) -> Result<Mapping> {
        let mapping = self
            .mappings
            .remove(local_id)
            .ok_or_else(|| Error::MappingNotFound(local_id.to_string()))?;
        self.remote_index.remove(&mapping.remote_id);
        self.change_metadata.remove(local_id);
        self.touch(now);
        Ok(mapping)
    }

    // Conflicts

    pub fn unresolved_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| !c.resolved)
    }

    /// Insert a conflict, replacing any conflict with the same key.
    pub fn upsert_conflict(&mut self, conflict: Conflict, now: Timestamp) {
        match self.conflicts.iter_mut().find(|c| c.same_key(&conflict)) {
            Some(existing) => *existing = conflict,
            None => self.conflicts.push(conflict),
        }
        self.touch(now);
    }

    /// Mark every conflict between the pair resolved.
    pub fn resolve_conflict(
        &mut self,
        local_id: &str,
        remote_id: RemoteId,
        now: Timestamp,
    ) -> Result<()> {
        let mut found = false;
        for conflict in self
            .conflicts
            .iter_mut()
            .filter(|c| c.local_id == local_id && c.remote_id == remote_id)
        {
            conflict.resolved = true;
            found = true;
        }

        if !found {
            return Err(Error::ConflictNotFound {
                local_id: local_id.to_string(),
                remote_id,
            });
        }
        self.touch(now);
        Ok(())
    }

    // Change metadata

    pub fn change_metadata(&self, local_id: &str) -> Option<&ChangeMetadata> {
        self.change_metadata.get(local_id)
    }

    pub fn set_change_metadata(&mut self, metadata: ChangeMetadata, now: Timestamp) {
        self.change_metadata
            .insert(metadata.local_id.clone(), metadata);
        self.touch(now);
    }

    // History

    /// Append an operation, dropping the oldest entries beyond the cap.
    pub fn push_operation(&mut self, record: OperationRecord, now: Timestamp) {
        self.operation_history.push(record);
        self.trim_history();
        self.touch(now);
    }

    /// Store a resolved conflict and its history entry together.
    ///
    /// `record` is expected to be a resolve operation for `conflict`.
    pub fn apply_resolution(&mut self, mut conflict: Conflict, record: OperationRecord, now: Timestamp) {
        conflict.resolved = true;
        if let Some(resolution) = record.resolution() {
            conflict.strategy = Some(resolution.resolution.strategy);
        }
        self.upsert_conflict(conflict, now);
        self.push_operation(record, now);
    }

    /// Remove a resolution from history and put its conflict back exactly as
    /// it was before the resolution, unresolved.
    ///
    /// If the conflict was cleaned up in the meantime it is recreated from
    /// the snapshot.
    pub fn take_resolution(&mut self, history_id: &str, now: Timestamp) -> Result<ResolutionRecord> {
        let index = self
            .operation_history
            .iter()
            .position(|op| op.id == history_id && op.resolution().is_some())
            .ok_or_else(|| Error::HistoryEntryNotFound(history_id.to_string()))?;

        let record = match self.operation_history.remove(index).kind {
            crate::history::OperationKind::Resolve(record) => *record,
            _ => return Err(Error::HistoryEntryNotFound(history_id.to_string())),
        };

        let mut restored = record.snapshot.clone();
        restored.resolved = false;
        self.upsert_conflict(restored, now);
        Ok(record)
    }

    /// Resolution entries, newest first, optionally for one local item.
    pub fn resolution_history(&self, local_id: Option<&str>) -> Vec<&OperationRecord> {
        self.operation_history
            .iter()
            .rev()
            .filter(|op| {
                op.resolution()
                    .is_some_and(|r| local_id.map_or(true, |id| r.local_id == id))
            })
            .collect()
    }

    // Sync bookkeeping

    pub fn begin_sync(&mut self, now: Timestamp) {
        self.sync_in_progress = true;
        self.touch(now);
    }

    /// Clear the in-progress flag. Only a successful sync advances
    /// `last_sync_at`.
    pub fn finish_sync(&mut self, error: Option<String>, now: Timestamp) {
        self.sync_in_progress = false;
        if error.is_none() {
            self.last_sync_at = Some(now);
        }
        self.last_sync_error = error;
        self.touch(now);
    }

    pub fn set_last_backup(&mut self, info: BackupInfo) {
        self.last_backup = Some(info);
    }

    pub fn stats(&self) -> StateStats {
        let mut stats = StateStats {
            total_mappings: self.mappings.len(),
            history_size: self.operation_history.len(),
            max_history_size: self.max_history_size,
            last_sync_at: self.last_sync_at,
            sync_in_progress: self.sync_in_progress,
            ..StateStats::default()
        };

        for mapping in self.mappings.values() {
            match mapping.status {
                MappingStatus::Synced => stats.synced += 1,
                MappingStatus::Pending => stats.pending += 1,
                MappingStatus::Conflict => stats.conflicted += 1,
                MappingStatus::Error => stats.errored += 1,
            }
        }
        for conflict in &self.conflicts {
            if conflict.resolved {
                stats.resolved_conflicts += 1;
            } else {
                stats.unresolved_conflicts += 1;
            }
        }

        // 90% of the cap, rounded up
        let history_threshold = (self.max_history_size * 9).div_ceil(10);
        stats.needs_cleanup = stats.history_size >= history_threshold
            || stats.resolved_conflicts > RESOLVED_CONFLICT_CLEANUP_THRESHOLD;
        stats
    }

    /// Drop operations older than `cutoff` and every resolved conflict.
    pub fn cleanup(&mut self, cutoff: Timestamp, now: Timestamp) -> CleanupReport {
        let before_ops = self.operation_history.len();
        self.operation_history.retain(|op| op.timestamp >= cutoff);
        let before_conflicts = self.conflicts.len();
        self.conflicts.retain(|c| !c.resolved);

        let report = CleanupReport {
            operations_removed: before_ops - self.operation_history.len(),
            conflicts_removed: before_conflicts - self.conflicts.len(),
        };
        if report != CleanupReport::default() {
            self.touch(now);
        }
        report
    }
}
