//! Integration tests for the sync state store.
//!
//! Every test works in its own temporary directory.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{store, store_config, CONTAINER};
use serde_json::json;
use tokio::fs;
use trellis_engine::{
    Conflict, ConflictType, Mapping, MappingStatus, NewOperation, OperationKind, SyncDirection,
};
use trellis_sync::{LockManager, Recovery, StoreErrorKind, SyncStateStore};

fn mapping(local_id: &str, remote_id: u64) -> Mapping {
    Mapping::new(local_id, remote_id, CONTAINER, 1_000, SyncDirection::ToRemote)
}

fn conflict(local_id: &str, remote_id: u64, title: &str) -> Conflict {
    Conflict::new(
        local_id,
        remote_id,
        ConflictType::BothModified,
        json!({"title": title}),
        json!({"title": "Remote title"}),
        2_000,
    )
}

/// Backup names carry millisecond timestamps; keep successive backups apart.
async fn tick() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

async fn corrupt(store: &SyncStateStore) {
    fs::write(store.path(), b"{\"version\": 1, \"mappings\": ")
        .await
        .unwrap();
}

async fn quarantined_files(dir: &std::path::Path) -> usize {
    let mut count = 0;
    let mut read = fs::read_dir(dir).await.unwrap();
    while let Some(entry) = read.next_entry().await.unwrap() {
        if entry.file_name().to_string_lossy().contains(".corrupt-") {
            count += 1;
        }
    }
    count
}

// ============================================================================
// Mappings
// ============================================================================

#[tokio::test]
async fn test_mapping_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store.init().await.unwrap();

    assert!(store.set_mapping(mapping("task-1", 11)).await.success);
    assert!(store.set_mapping(mapping("task-2", 12)).await.success);

    let found = store.get_mapping("task-1").await.unwrap().unwrap();
    assert_eq!(found.remote_id, 11);
    let by_remote = store.get_mapping_by_remote_id(12).await.unwrap().unwrap();
    assert_eq!(by_remote.local_id, "task-2");
    assert_eq!(store.get_all_mappings().await.unwrap().len(), 2);
    assert!(store.get_mapping("task-3").await.unwrap().is_none());

    // A second store instance sees the same file
    let reopened = common::store(dir.path());
    assert_eq!(reopened.get_all_mappings().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_delete_mapping_twice() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store.set_mapping(mapping("task-1", 11)).await;

    let first = store.delete_mapping("task-1").await;
    assert!(first.success);
    assert_eq!(first.value.unwrap().remote_id, 11);

    let second = store.delete_mapping("task-1").await;
    assert!(!second.success);
    assert_eq!(second.kind, Some(StoreErrorKind::NotFound));
    assert!(store.get_mapping_by_remote_id(11).await.unwrap().is_none());
}

#[tokio::test]
async fn test_remote_id_cannot_be_mapped_twice() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store.set_mapping(mapping("task-1", 11)).await;

    let result = store.set_mapping(mapping("task-2", 11)).await;
    assert!(!result.success);
    assert_eq!(result.kind, Some(StoreErrorKind::Invalid));

    // Re-mapping the same local item is fine
    let moved = store.set_mapping(mapping("task-1", 12)).await;
    assert!(moved.success);
    assert!(store.get_mapping_by_remote_id(11).await.unwrap().is_none());
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test]
async fn test_conflict_upsert_and_resolve() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());

    store.add_conflict(conflict("task-1", 11, "First")).await;
    store.add_conflict(conflict("task-1", 11, "Second")).await;
    store.add_conflict(conflict("task-2", 12, "Other")).await;

    let conflicts = store.get_conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 2);
    assert_eq!(conflicts[0].local_value, json!({"title": "Second"}));

    assert!(store.resolve_conflict("task-1", 11).await.success);
    assert_eq!(store.get_conflicts().await.unwrap().len(), 1);

    let missing = store.resolve_conflict("task-9", 99).await;
    assert!(missing.is_not_found());
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_corrupt_file_restored_from_latest_backup() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store.init().await.unwrap();
    store.set_mapping(mapping("task-1", 11)).await;
    tick().await;
    store.set_mapping(mapping("task-2", 12)).await;

    corrupt(&store).await;

    let (state, recovery) = store.load().await.unwrap();
    assert!(matches!(recovery, Recovery::FromBackup(_)));
    assert!(recovery.needs_reconciliation());
    // The newest backup was taken before task-2 was added
    assert_eq!(state.mappings.len(), 1);
    assert!(state.mappings.contains_key("task-1"));
    assert_eq!(quarantined_files(dir.path()).await, 1);

    // The recovery stays reported until acknowledged
    let (_, again) = store.load().await.unwrap();
    assert_eq!(again, recovery);

    let cleared = store.acknowledge_recovery().await;
    assert!(cleared.value.unwrap().is_some());
    assert_eq!(store.load().await.unwrap().1, Recovery::Clean);
}

#[tokio::test]
async fn test_non_utf8_file_restored_from_backup() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store.init().await.unwrap();
    store.set_mapping(mapping("task-1", 11)).await;

    fs::write(store.path(), [0xff, 0xfe, 0x00, 0x7b]).await.unwrap();

    let (state, recovery) = store.load().await.unwrap();
    assert!(matches!(recovery, Recovery::FromBackup(_)));
    assert!(state.mappings.is_empty());
    assert_eq!(quarantined_files(dir.path()).await, 1);
}

#[tokio::test]
async fn test_non_utf8_file_without_backups_resets() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = store_config(dir.path());
    config.backups_enabled = false;
    let store = SyncStateStore::new(config, LockManager::new_shared());
    store.init().await.unwrap();

    fs::write(store.path(), [0xc3, 0x28]).await.unwrap();

    assert_eq!(store.load().await.unwrap().1, Recovery::Reset);
}

#[tokio::test]
async fn test_corrupt_file_without_backups_resets() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = store_config(dir.path());
    config.backups_enabled = false;
    let store = SyncStateStore::new(config, LockManager::new_shared());
    store.init().await.unwrap();
    store.set_mapping(mapping("task-1", 11)).await;

    corrupt(&store).await;

    assert_eq!(store.init().await.unwrap(), Recovery::Reset);
    assert!(store.get_all_mappings().await.unwrap().is_empty());
    assert_eq!(quarantined_files(dir.path()).await, 1);
    assert_eq!(store.load().await.unwrap().1, Recovery::Reset);

    store.acknowledge_recovery().await;
    assert_eq!(store.load().await.unwrap().1, Recovery::Clean);
}

#[tokio::test]
async fn test_reset_during_a_read_is_still_reported() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = store_config(dir.path());
    config.backups_enabled = false;
    let store = SyncStateStore::new(config, LockManager::new_shared());
    store.init().await.unwrap();
    store.set_mapping(mapping("task-1", 11)).await;

    corrupt(&store).await;

    // A plain getter hits the corruption first
    assert!(store.get_mapping("task-1").await.unwrap().is_none());
    assert_eq!(quarantined_files(dir.path()).await, 1);

    let (state, recovery) = store.load().await.unwrap();
    assert_eq!(recovery, Recovery::Reset);
    assert!(recovery.needs_reconciliation());
    assert!(state.recovery.is_some());

    // Mutations keep the flag
    assert!(store.set_mapping(mapping("task-2", 12)).await.success);
    assert_eq!(store.load().await.unwrap().1, Recovery::Reset);
    assert_eq!(quarantined_files(dir.path()).await, 1);
}

#[tokio::test]
async fn test_invalid_backups_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store.init().await.unwrap();
    store.set_mapping(mapping("task-1", 11)).await;
    tick().await;
    store.set_mapping(mapping("task-2", 12)).await;

    let backups = store.list_backups().await.unwrap();
    assert_eq!(backups.len(), 2);
    fs::write(&backups[0].path, b"garbage").await.unwrap();

    corrupt(&store).await;

    let (state, recovery) = store.load().await.unwrap();
    assert_eq!(recovery, Recovery::FromBackup(backups[1].path.clone()));
    assert!(state.mappings.is_empty());
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_concurrent_mutations_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let locks = LockManager::new_shared();
    let store = Arc::new(SyncStateStore::new(
        store_config(dir.path()),
        Arc::clone(&locks),
    ));
    store.init().await.unwrap();

    let handles: Vec<_> = (0..20u64)
        .map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.set_mapping(mapping(&format!("task-{i}"), i)).await })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().success);
    }

    assert_eq!(store.get_all_mappings().await.unwrap().len(), 20);
    assert_eq!(locks.tracked_paths(), 1);
}

// ============================================================================
// History and statistics
// ============================================================================

#[tokio::test]
async fn test_history_is_capped() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = store_config(dir.path());
    config.max_history = 5;
    config.backups_enabled = false;
    let store = SyncStateStore::new(config, LockManager::new_shared());

    let mut ids = Vec::new();
    for i in 0..8u64 {
        let result = store
            .record_operation(NewOperation::succeeded(OperationKind::Push, "task-1", i))
            .await;
        ids.push(result.value.unwrap());
    }

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.history_size, 5);
    assert!(stats.needs_cleanup);
    assert!(store.history_entry(&ids[0]).await.unwrap().is_none());
    assert!(store.history_entry(&ids[7]).await.unwrap().is_some());
}

#[tokio::test]
async fn test_lower_history_cap_applies_to_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = store_config(dir.path());
    config.max_history = 10;
    config.backups_enabled = false;
    let wide = SyncStateStore::new(config.clone(), LockManager::new_shared());
    for i in 0..8u64 {
        wide.record_operation(NewOperation::succeeded(OperationKind::Push, "task-1", i))
            .await;
    }

    config.max_history = 3;
    let narrow = SyncStateStore::new(config, LockManager::new_shared());
    let stats = narrow.get_stats().await.unwrap();
    assert_eq!(stats.history_size, 3);
    assert_eq!(stats.max_history_size, 3);

    assert!(narrow
        .record_operation(NewOperation::succeeded(OperationKind::Pull, "task-1", 9))
        .await
        .success);
    let (state, _) = narrow.load().await.unwrap();
    assert_eq!(state.operation_history.len(), 3);
    assert_eq!(state.max_history_size, 3);
    assert!(matches!(
        state.operation_history.last().map(|op| &op.kind),
        Some(OperationKind::Pull)
    ));
}

#[tokio::test]
async fn test_stats_count_statuses() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());

    store.set_mapping(mapping("task-1", 11)).await;
    store
        .set_mapping(mapping("task-2", 12).with_status(MappingStatus::Pending))
        .await;
    store
        .set_mapping(mapping("task-3", 13).with_status(MappingStatus::Conflict))
        .await;
    store.add_conflict(conflict("task-3", 13, "Local")).await;

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.total_mappings, 3);
    assert_eq!(stats.synced, 1);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.conflicted, 1);
    assert_eq!(stats.unresolved_conflicts, 1);
    assert!(stats.file_size_bytes.unwrap() > 0);
    assert!(!stats.needs_cleanup);
}

#[tokio::test]
async fn test_cleanup_drops_resolved_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());

    store.add_conflict(conflict("task-1", 11, "A")).await;
    store.add_conflict(conflict("task-2", 12, "B")).await;
    store.resolve_conflict("task-1", 11).await;
    store
        .record_operation(NewOperation::succeeded(OperationKind::Pull, "task-2", 12))
        .await;

    let report = store.cleanup_history(30).await.value.unwrap();
    assert_eq!(report.conflicts_removed, 1);
    assert_eq!(report.operations_removed, 0);

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.resolved_conflicts, 0);
    assert_eq!(stats.unresolved_conflicts, 1);
    assert_eq!(stats.history_size, 1);
}

#[tokio::test]
async fn test_sync_bookkeeping() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());

    store.mark_sync_in_progress().await;
    let (state, _) = store.load().await.unwrap();
    assert!(state.sync_in_progress);
    assert!(state.last_sync_at.is_none());

    store.mark_sync_complete(Some("remote down".into())).await;
    let (state, _) = store.load().await.unwrap();
    assert!(!state.sync_in_progress);
    assert!(state.last_sync_at.is_none());
    assert_eq!(state.last_sync_error.as_deref(), Some("remote down"));

    store.mark_sync_complete(None).await;
    let stats = store.get_stats().await.unwrap();
    assert!(stats.last_sync_at.is_some());
}

#[tokio::test]
async fn test_backups_are_pruned_to_max_count() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = store_config(dir.path());
    config.max_backups = 3;
    let store = SyncStateStore::new(config, LockManager::new_shared());
    store.init().await.unwrap();

    for i in 0..6u64 {
        store.set_mapping(mapping(&format!("task-{i}"), i)).await;
    }

    assert_eq!(store.list_backups().await.unwrap().len(), 3);
}
