//! Change detection against the remote tracker.
//!
//! Wraps the pure [`trellis_engine::detect`] with the I/O it needs: the
//! mapping and previous metadata come from the store, the remote side is
//! fetched through the resilience layer, and the outcome is written back.

use std::sync::Arc;

use futures::future::join_all;
use trellis_engine::{detect, ChangeReport, DetectionStrategy, LocalId, LocalItem};

use crate::config::DetectorConfig;
use crate::error::Result;
use crate::now_millis;
use crate::remote::RemoteClient;
use crate::resilience::ResilienceLayer;
use crate::store::SyncStateStore;

/// Per-call detection options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectOptions {
    /// Overrides the configured strategy
    pub strategy: Option<DetectionStrategy>,
    /// Persist updated change metadata
    pub record_metadata: bool,
    /// Store a conflict record when both sides changed
    pub record_conflicts: bool,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            strategy: None,
            record_metadata: true,
            record_conflicts: true,
        }
    }
}

impl DetectOptions {
    pub fn with_strategy(strategy: DetectionStrategy) -> Self {
        Self {
            strategy: Some(strategy),
            ..Self::default()
        }
    }
}

/// Aggregate outcome of [`ChangeDetector::detect_changes_batch`].
#[derive(Debug, Clone, Default)]
pub struct BatchDetection {
    pub total: usize,
    pub changed: usize,
    pub conflicts: usize,
    /// Items with no mapping, skipped
    pub unmapped: usize,
    pub failed: usize,
    /// Reports for mapped items, in input order
    pub results: Vec<ChangeReport>,
    pub failures: Vec<(LocalId, String)>,
}

pub struct ChangeDetector {
    store: Arc<SyncStateStore>,
    resilience: Arc<ResilienceLayer>,
    client: Arc<dyn RemoteClient>,
    config: DetectorConfig,
}

impl ChangeDetector {
    pub fn new(
        store: Arc<SyncStateStore>,
        resilience: Arc<ResilienceLayer>,
        client: Arc<dyn RemoteClient>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            store,
            resilience,
            client,
            config,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detect changes for one item.
    ///
    /// Returns `Ok(None)` when the item has no mapping.
    pub async fn detect_changes(
        &self,
        item: &LocalItem,
        options: DetectOptions,
    ) -> Result<Option<ChangeReport>> {
        let Some(mapping) = self.store.get_mapping(&item.id).await? else {
            tracing::debug!(local_id = %item.id, "Item not mapped, skipping detection");
            return Ok(None);
        };

        let client = self.client.as_ref();
        let container = mapping.container.as_str();
        let remote_id = mapping.remote_id;
        let resource = self
            .resilience
            .execute_with_retry(move || client.get_resource(container, remote_id))
            .await?;

        let previous = self.store.get_change_metadata(&item.id).await?;
        let strategy = options.strategy.unwrap_or(self.config.strategy);
        let report = detect(
            strategy,
            item,
            &resource,
            &mapping,
            previous.as_ref(),
            now_millis(),
        );

        tracing::debug!(
            local_id = %item.id,
            remote_id,
            ?strategy,
            local_changed = report.local_changed,
            remote_changed = report.remote_changed,
            conflict = report.has_conflict,
            "Detected changes"
        );

        if options.record_metadata {
            // Failures are logged by the store; detection still succeeds
            let _ = self
                .store
                .update_change_metadata(report.next_metadata(previous.as_ref()))
                .await;
        }

        if options.record_conflicts {
            if let Some(conflict) = report.to_conflict(item, &resource) {
                tracing::info!(
                    local_id = %item.id,
                    remote_id,
                    fields = conflict.fields.len(),
                    "Conflict detected"
                );
                let _ = self.store.add_conflict(conflict).await;
            }
        }

        Ok(Some(report))
    }

    /// Detect changes for many items, `batch_size` at a time.
    ///
    /// Per-item failures are counted and logged; they do not abort the run.
    pub async fn detect_changes_batch(
        &self,
        items: &[LocalItem],
        options: DetectOptions,
    ) -> BatchDetection {
        let mut summary = BatchDetection {
            total: items.len(),
            ..BatchDetection::default()
        };

        for chunk in items.chunks(self.config.batch_size.max(1)) {
            let outcomes = join_all(chunk.iter().map(|item| self.detect_changes(item, options))).await;

            for (item, outcome) in chunk.iter().zip(outcomes) {
                match outcome {
                    Ok(Some(report)) => {
                        if report.has_changes {
                            summary.changed += 1;
                        }
                        if report.has_conflict {
                            summary.conflicts += 1;
                        }
                        summary.results.push(report);
                    }
                    Ok(None) => summary.unmapped += 1,
                    Err(e) => {
                        tracing::warn!(local_id = %item.id, error = %e, "Change detection failed");
                        summary.failed += 1;
                        summary.failures.push((item.id.clone(), e.to_string()));
                    }
                }
            }
        }

        tracing::info!(
            total = summary.total,
            changed = summary.changed,
            conflicts = summary.conflicts,
            unmapped = summary.unmapped,
            failed = summary.failed,
            "Batch detection finished"
        );
        summary
    }
}
