//! The persisted sync state store.
//!
//! One JSON file per container holds the [`SyncState`]. Every access takes
//! the file's lock from the injected [`LockManager`], so a read-modify-write
//! by one caller can never interleave with another's. Writes go through a
//! temp file and an atomic rename; the previous file is copied to a rolling
//! backup first.
//!
//! On load, a file that fails to decode, parse or validate is moved aside
//! and the newest valid backup is restored. If no backup validates the store
//! writes an empty state and reports [`Recovery::Reset`]; callers must then
//! run a full reconciliation. Either way the recovered file carries a
//! [`RecoveryMarker`], and every later load keeps reporting the recovery
//! until [`SyncStateStore::acknowledge_recovery`] clears it.
//!
//! Mutations return [`StoreResult`] values. Getters return [`Result`].

mod atomic;
mod backup;

pub use backup::BackupEntry;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::fs;
use trellis_engine::{
    BackupInfo, ChangeMetadata, CleanupReport, Conflict, Mapping, NewOperation,
    OperationKind, OperationRecord, RecoveryMarker, RemoteId, ResolutionRecord, StateStats,
    SyncState, Timestamp, STATE_SCHEMA_VERSION,
};

use crate::{config::StoreConfig, error::Result, lock::LockManager, now_millis, SyncError};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// How a loaded state was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// Read and validated as-is
    Clean,
    /// No state file existed
    Fresh,
    /// The file was corrupt and this backup was restored
    FromBackup(PathBuf),
    /// The file was corrupt and no backup was usable; the state is empty
    Reset,
}

impl Recovery {
    fn from_marker(marker: &RecoveryMarker) -> Self {
        match &marker.backup {
            Some(path) => Self::FromBackup(PathBuf::from(path)),
            None => Self::Reset,
        }
    }

    /// Whether mappings may have been lost.
    pub fn needs_reconciliation(&self) -> bool {
        matches!(self, Self::FromBackup(_) | Self::Reset)
    }
}

/// Why a store mutation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreErrorKind {
    NotFound,
    Invalid,
    Persistence,
}

impl From<&SyncError> for StoreErrorKind {
    fn from(err: &SyncError) -> Self {
        if err.is_not_found() {
            Self::NotFound
        } else if matches!(err, SyncError::Engine(_)) {
            Self::Invalid
        } else {
            Self::Persistence
        }
    }
}

/// Outcome of a store mutation.
///
/// Failures are values here; they have already been logged.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreResult<T = ()> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<StoreErrorKind>,
}

impl<T> StoreResult<T> {
    pub fn ok(value: T) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
            kind: None,
        }
    }

    pub fn failed(err: &SyncError) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(err.to_string()),
            kind: Some(StoreErrorKind::from(err)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == Some(StoreErrorKind::NotFound)
    }
}

impl<T> From<Result<T>> for StoreResult<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(err) => {
                if err.is_not_found() {
                    tracing::debug!(error = %err, "Store lookup failed");
                } else {
                    tracing::warn!(error = %err, "Store operation failed");
                }
                Self::failed(&err)
            }
        }
    }
}

/// File-backed store for one container's [`SyncState`].
#[derive(Debug, Clone)]
pub struct SyncStateStore {
    config: StoreConfig,
    path: PathBuf,
    backup_dir: PathBuf,
    stem: String,
    locks: Arc<LockManager>,
}

impl SyncStateStore {
    pub fn new(config: StoreConfig, locks: Arc<LockManager>) -> Self {
        Self {
            path: config.state_path(),
            backup_dir: config.backup_dir(),
            stem: config.file_stem(),
            config,
            locks,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn empty_state(&self, now: Timestamp) -> SyncState {
        SyncState::new(self.config.container.clone(), now).with_max_history(self.config.max_history)
    }

    /// Create an empty state file if none exists. Idempotent; a corrupt file
    /// is recovered as on any load.
    pub async fn init(&self) -> Result<Recovery> {
        let _guard = self.locks.acquire(&self.path).await;
        let (state, recovery) = self.load_unlocked().await?;
        if recovery == Recovery::Fresh {
            self.write(&state).await?;
            tracing::info!(path = %self.path.display(), container = %state.container, "Initialized sync state");
        }
        Ok(recovery)
    }

    /// Current state plus how it was obtained.
    pub async fn load(&self) -> Result<(SyncState, Recovery)> {
        let _guard = self.locks.acquire(&self.path).await;
        self.load_unlocked().await
    }

    async fn load_unlocked(&self) -> Result<(SyncState, Recovery)> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok((self.empty_state(now_millis()), Recovery::Fresh));
            }
            Err(e) => return Err(SyncError::persistence(&self.path, e)),
        };

        match parse_state(bytes) {
            Ok(mut state) => {
                self.check_container(&state)?;
                self.apply_history_cap(&mut state);
                let recovery = state
                    .recovery
                    .as_ref()
                    .map_or(Recovery::Clean, Recovery::from_marker);
                Ok((state, recovery))
            }
            Err(reason) => {
                tracing::warn!(path = %self.path.display(), error = %reason, "State file is invalid, attempting recovery");
                self.recover().await
            }
        }
    }

    /// Files written under a larger cap are trimmed to the configured one.
    fn apply_history_cap(&self, state: &mut SyncState) {
        if state.max_history_size != self.config.max_history {
            let before = state.operation_history.len();
            state.set_max_history(self.config.max_history);
            let dropped = before - state.operation_history.len();
            if dropped > 0 {
                tracing::debug!(dropped, cap = self.config.max_history, "Trimmed history to the configured cap");
            }
        }
    }

    fn check_container(&self, state: &SyncState) -> Result<()> {
        if state.container != self.config.container {
            return Err(SyncError::Corruption {
                path: self.path.clone(),
                reason: format!(
                    "file belongs to container {}, expected {}",
                    state.container, self.config.container
                ),
            });
        }
        Ok(())
    }

    async fn quarantine(&self) -> Result<PathBuf> {
        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("state.json");
        let target = self
            .path
            .with_file_name(format!("{file_name}.corrupt-{}", now_millis()));
        fs::rename(&self.path, &target)
            .await
            .map_err(|e| SyncError::persistence(&self.path, e))?;
        tracing::warn!(from = %self.path.display(), to = %target.display(), "Moved corrupt state file aside");
        Ok(target)
    }

    async fn recover(&self) -> Result<(SyncState, Recovery)> {
        self.quarantine().await?;

        let backups = backup::list(&self.backup_dir, &self.stem)
            .await
            .map_err(|e| SyncError::persistence(&self.backup_dir, e))?;

        for entry in backups {
            let bytes = match fs::read(&entry.path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(backup = %entry.path.display(), error = %e, "Unreadable backup");
                    continue;
                }
            };
            let mut state = match parse_state(bytes) {
                Ok(state) if state.container == self.config.container => state,
                Ok(_) => {
                    tracing::warn!(backup = %entry.path.display(), "Backup belongs to another container");
                    continue;
                }
                Err(reason) => {
                    tracing::warn!(backup = %entry.path.display(), error = %reason, "Backup failed validation");
                    continue;
                }
            };

            self.apply_history_cap(&mut state);
            state.mark_recovered(Some(entry.path.display().to_string()), now_millis());
            self.write(&state).await?;

            // Re-read what actually landed on disk
            let restored = fs::read(&self.path)
                .await
                .map_err(|e| SyncError::persistence(&self.path, e))?;
            match parse_state(restored) {
                Ok(state) => {
                    tracing::info!(
                        backup = %entry.path.display(),
                        mappings = state.mappings.len(),
                        "Restored sync state from backup"
                    );
                    return Ok((state, Recovery::FromBackup(entry.path)));
                }
                Err(reason) => {
                    tracing::warn!(backup = %entry.path.display(), error = %reason, "Restored file failed validation");
                }
            }
        }

        tracing::error!(
            path = %self.path.display(),
            "No valid backup found, continuing with an empty state; a full reconciliation is required"
        );
        let now = now_millis();
        let mut state = self.empty_state(now);
        state.mark_recovered(None, now);
        self.write(&state).await?;
        Ok((state, Recovery::Reset))
    }

    async fn write(&self, state: &SyncState) -> Result<()> {
        let json = state.to_json_pretty()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::persistence(parent, e))?;
        }
        atomic::write_atomic(&self.path, json.as_bytes())
            .await
            .map_err(|e| SyncError::persistence(&self.path, e))
    }

    async fn backup_current(&self, state: &mut SyncState, previous_mappings: usize, now: Timestamp) {
        match backup::create(&self.backup_dir, &self.stem, &self.path).await {
            Ok(entry) => {
                tracing::debug!(backup = %entry.path.display(), "Backed up sync state");
                state.set_last_backup(BackupInfo {
                    path: entry.path.display().to_string(),
                    created_at: entry.created_at,
                    mapping_count: previous_mappings,
                    schema_version: STATE_SCHEMA_VERSION,
                });
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Backup failed, continuing without one");
                return;
            }
        }

        match backup::prune(
            &self.backup_dir,
            &self.stem,
            self.config.max_backups,
            self.config.max_backup_age,
            now,
        )
        .await
        {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Pruned old backups"),
            Err(e) => tracing::warn!(error = %e, "Backup pruning failed"),
        }
    }

    /// Run `f` against the current state and persist the result.
    ///
    /// If `f` fails nothing is written.
    async fn mutate<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut SyncState, Timestamp) -> Result<R>,
    {
        let _guard = self.locks.acquire(&self.path).await;
        let (mut state, recovery) = self.load_unlocked().await?;
        let previous_mappings = state.mappings.len();
        let now = now_millis();

        let value = f(&mut state, now)?;

        // Every outcome but Fresh leaves a file on disk
        if self.config.backups_enabled && recovery != Recovery::Fresh {
            self.backup_current(&mut state, previous_mappings, now).await;
        }

        self.write(&state).await?;
        Ok(value)
    }

    async fn read<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SyncState) -> R,
    {
        let (state, _) = self.load().await?;
        Ok(f(&state))
    }

    // Mappings

    pub async fn get_mapping(&self, local_id: &str) -> Result<Option<Mapping>> {
        self.read(|state| state.mapping(local_id).cloned()).await
    }

    pub async fn get_mapping_by_remote_id(&self, remote_id: RemoteId) -> Result<Option<Mapping>> {
        self.read(|state| state.mapping_by_remote_id(remote_id).cloned())
            .await
    }

    pub async fn get_all_mappings(&self) -> Result<Vec<Mapping>> {
        self.read(|state| state.mappings.values().cloned().collect())
            .await
    }

    /// Insert or replace a mapping.
    pub async fn set_mapping(&self, mapping: Mapping) -> StoreResult {
        let local_id = mapping.local_id.clone();
        let result = self
            .mutate(|state, now| Ok(state.set_mapping(mapping, now)?))
            .await;
        if result.is_ok() {
            tracing::debug!(local_id = %local_id, "Mapping saved");
        }
        result.into()
    }

    /// Remove a mapping and its change metadata.
    pub async fn delete_mapping(&self, local_id: &str) -> StoreResult<Mapping> {
        self.mutate(|state, now| Ok(state.remove_mapping(local_id, now)?))
            .await
            .into()
    }

    // Conflicts

    /// Unresolved conflicts.
    pub async fn get_conflicts(&self) -> Result<Vec<Conflict>> {
        self.read(|state| state.unresolved_conflicts().cloned().collect())
            .await
    }

    /// Insert a conflict, replacing one with the same key.
    pub async fn add_conflict(&self, conflict: Conflict) -> StoreResult {
        self.mutate(|state, now| {
            state.upsert_conflict(conflict, now);
            Ok(())
        })
        .await
        .into()
    }

    pub async fn resolve_conflict(&self, local_id: &str, remote_id: RemoteId) -> StoreResult {
        self.mutate(|state, now| Ok(state.resolve_conflict(local_id, remote_id, now)?))
            .await
            .into()
    }

    // History

    /// Append an operation; returns its generated id.
    pub async fn record_operation(&self, operation: NewOperation) -> StoreResult<String> {
        self.mutate(|state, now| {
            let id = uuid::Uuid::new_v4().to_string();
            state.push_operation(operation.into_record(id.clone(), now), now);
            Ok(id)
        })
        .await
        .into()
    }

    /// Store a resolved conflict together with its undo entry.
    ///
    /// Returns the history id.
    pub async fn record_resolution(
        &self,
        conflict: Conflict,
        record: ResolutionRecord,
    ) -> Result<String> {
        self.mutate(|state, now| {
            let id = uuid::Uuid::new_v4().to_string();
            let operation = NewOperation::succeeded(
                OperationKind::Resolve(Box::new(record)),
                conflict.local_id.clone(),
                conflict.remote_id,
            )
            .into_record(id.clone(), now);
            state.apply_resolution(conflict, operation, now);
            Ok(id)
        })
        .await
    }

    /// Remove a resolution entry and reopen its conflict.
    pub async fn take_resolution(&self, history_id: &str) -> Result<ResolutionRecord> {
        self.mutate(|state, now| Ok(state.take_resolution(history_id, now)?))
            .await
    }

    /// Resolution entries, newest first.
    pub async fn resolution_history(&self, local_id: Option<&str>) -> Result<Vec<OperationRecord>> {
        self.read(|state| {
            state
                .resolution_history(local_id)
                .into_iter()
                .cloned()
                .collect()
        })
        .await
    }

    pub async fn history_entry(&self, id: &str) -> Result<Option<OperationRecord>> {
        self.read(|state| {
            state
                .operation_history
                .iter()
                .find(|op| op.id == id)
                .cloned()
        })
        .await
    }

    /// Drop operations older than `max_age_days` and all resolved conflicts.
    pub async fn cleanup_history(&self, max_age_days: u32) -> StoreResult<CleanupReport> {
        let result = self
            .mutate(|state, now| {
                let cutoff = now.saturating_sub(u64::from(max_age_days) * DAY_MS);
                Ok(state.cleanup(cutoff, now))
            })
            .await;
        if let Ok(report) = &result {
            tracing::info!(
                operations = report.operations_removed,
                conflicts = report.conflicts_removed,
                "Cleaned up sync history"
            );
        }
        result.into()
    }

    // Change metadata

    pub async fn get_change_metadata(&self, local_id: &str) -> Result<Option<ChangeMetadata>> {
        self.read(|state| state.change_metadata(local_id).cloned())
            .await
    }

    pub async fn update_change_metadata(&self, metadata: ChangeMetadata) -> StoreResult {
        self.mutate(|state, now| {
            state.set_change_metadata(metadata, now);
            Ok(())
        })
        .await
        .into()
    }

    // Sync bookkeeping

    pub async fn mark_sync_in_progress(&self) -> StoreResult {
        self.mutate(|state, now| {
            state.begin_sync(now);
            Ok(())
        })
        .await
        .into()
    }

    /// Clear the in-progress flag; a `None` error stamps `last_sync_at`.
    pub async fn mark_sync_complete(&self, error: Option<String>) -> StoreResult {
        self.mutate(|state, now| {
            state.finish_sync(error, now);
            Ok(())
        })
        .await
        .into()
    }

    /// Clear the recovery flag once the caller has reconciled.
    ///
    /// Returns the marker that was cleared, if any.
    pub async fn acknowledge_recovery(&self) -> StoreResult<Option<RecoveryMarker>> {
        let result = self
            .mutate(|state, now| Ok(state.clear_recovery(now)))
            .await;
        if let Ok(Some(marker)) = &result {
            tracing::info!(recovered_at = marker.recovered_at, "Recovery acknowledged");
        }
        result.into()
    }

    pub async fn get_stats(&self) -> Result<StateStats> {
        let mut stats = self.read(SyncState::stats).await?;
        stats.file_size_bytes = match fs::metadata(&self.path).await {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(SyncError::persistence(&self.path, e)),
        };
        Ok(stats)
    }

    /// Backups of this state file, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        backup::list(&self.backup_dir, &self.stem)
            .await
            .map_err(|e| SyncError::persistence(&self.backup_dir, e))
    }
}

/// Decode and validate raw file contents. Invalid UTF-8 is corruption like
/// any other parse failure.
fn parse_state(bytes: Vec<u8>) -> std::result::Result<SyncState, String> {
    let text = String::from_utf8(bytes).map_err(|e| format!("state file is not UTF-8: {e}"))?;
    SyncState::from_json(&text).map_err(|e| e.to_string())
}
