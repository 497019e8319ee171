//! Trellis maintenance - opens the sync state for the configured container,
//! recovers it if needed, reports statistics and prunes old history.

use trellis_sync::{telemetry, LockManager, Recovery, SyncConfig, SyncStateStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let config = SyncConfig::from_env()?;
    let cleanup_age_days = config.store.cleanup_age_days;

    tracing::info!(
        container = %config.store.container,
        path = %config.store.state_path().display(),
        "Opening sync state"
    );

    let store = SyncStateStore::new(config.store, LockManager::new_shared());
    match store.init().await? {
        Recovery::Clean => {}
        Recovery::Fresh => tracing::info!("Created new sync state"),
        Recovery::FromBackup(path) => {
            tracing::warn!(backup = %path.display(), "Sync state restored from backup; reconcile, then acknowledge the recovery")
        }
        Recovery::Reset => {
            tracing::warn!("Sync state was reset; rebuild all mappings, then acknowledge the recovery")
        }
    }

    let stats = store.get_stats().await?;
    tracing::info!(
        mappings = stats.total_mappings,
        synced = stats.synced,
        pending = stats.pending,
        conflicted = stats.conflicted,
        errored = stats.errored,
        unresolved_conflicts = stats.unresolved_conflicts,
        history = stats.history_size,
        file_size = stats.file_size_bytes.unwrap_or(0),
        "Sync state statistics"
    );

    if stats.needs_cleanup {
        let result = store.cleanup_history(cleanup_age_days).await;
        match result.value {
            Some(report) => tracing::info!(
                operations_removed = report.operations_removed,
                conflicts_removed = report.conflicts_removed,
                "History cleaned up"
            ),
            None => {
                return Err(result
                    .error
                    .unwrap_or_else(|| "history cleanup failed".to_string())
                    .into())
            }
        }
    }

    Ok(())
}
