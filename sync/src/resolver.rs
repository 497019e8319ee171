//! Conflict resolution with undo.
//!
//! Analysis, validation and previews are pure and delegate to
//! [`ConflictAnalyzer`]. Applying a resolution writes a history entry that
//! carries the pre-resolution snapshot, which is what
//! [`ConflictResolver::undo_resolution`] restores.

use std::sync::Arc;

use trellis_engine::{
    Conflict, ConflictAnalysis, ConflictAnalyzer, Error as EngineError, FieldOutcome, LocalId,
    OperationRecord, Resolution, ResolutionRecord, ResolutionRequest, ResolutionStrategy,
    ValidationReport,
};

use crate::config::ResolverConfig;
use crate::error::Result;
use crate::now_millis;
use crate::store::SyncStateStore;

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    Applied {
        history_id: String,
        resolution: Resolution,
        warnings: Vec<String>,
    },
    /// Validation failed; nothing was written
    Rejected(ValidationReport),
}

impl ResolveOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Per-conflict result inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Resolved { history_id: String },
    Rejected(ValidationReport),
    Failed(String),
    /// Already resolved, or not attempted after an abort
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchResolveOptions {
    /// Stop at the first rejected or failed conflict
    pub stop_on_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResolution {
    pub resolved: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<(LocalId, ItemOutcome)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UndoOutcome {
    Restored(ResolutionRecord),
    NotFound,
}

pub struct ConflictResolver {
    store: Arc<SyncStateStore>,
    analyzer: ConflictAnalyzer,
}

impl ConflictResolver {
    pub fn new(store: Arc<SyncStateStore>, config: ResolverConfig) -> Self {
        let window_ms = u64::try_from(config.simultaneous_window.as_millis()).unwrap_or(u64::MAX);
        Self {
            store,
            analyzer: ConflictAnalyzer::new(window_ms),
        }
    }

    pub fn analyze_conflict(&self, conflict: &Conflict) -> ConflictAnalysis {
        self.analyzer.analyze(conflict)
    }

    pub fn validate_resolution(
        &self,
        conflict: &Conflict,
        request: &ResolutionRequest,
    ) -> ValidationReport {
        self.analyzer.validate(conflict, request)
    }

    pub fn preview_resolution(
        &self,
        conflict: &Conflict,
        request: &ResolutionRequest,
    ) -> Vec<FieldOutcome> {
        self.analyzer.preview(conflict, request)
    }

    /// Validate, then apply and record a resolution.
    pub async fn resolve_conflict(
        &self,
        conflict: &Conflict,
        request: &ResolutionRequest,
    ) -> Result<ResolveOutcome> {
        let report = self.analyzer.validate(conflict, request);
        if !report.valid {
            tracing::info!(
                local_id = %conflict.local_id,
                strategy = %request.strategy,
                errors = ?report.errors,
                "Resolution rejected"
            );
            return Ok(ResolveOutcome::Rejected(report));
        }

        let resolution = self.analyzer.materialize(conflict, request, now_millis())?;
        let record = ResolutionRecord::new(conflict, resolution.clone());
        let history_id = self.store.record_resolution(conflict.clone(), record).await?;

        tracing::info!(
            local_id = %conflict.local_id,
            remote_id = conflict.remote_id,
            strategy = %request.strategy,
            history_id = %history_id,
            "Conflict resolved"
        );

        Ok(ResolveOutcome::Applied {
            history_id,
            resolution,
            warnings: report.warnings,
        })
    }

    /// Apply one automatic strategy to many conflicts, in order.
    pub async fn resolve_conflicts(
        &self,
        conflicts: &[Conflict],
        strategy: ResolutionStrategy,
        options: BatchResolveOptions,
    ) -> Result<BatchResolution> {
        if !strategy.is_automatic() {
            return Err(EngineError::UnsupportedStrategy {
                strategy,
                reason: "batch resolution needs an automatic strategy".into(),
            }
            .into());
        }

        let request = ResolutionRequest::new(strategy);
        let mut batch = BatchResolution::default();
        let mut aborted = false;

        for conflict in conflicts {
            let outcome = if aborted || conflict.resolved {
                ItemOutcome::Skipped
            } else {
                match self.resolve_conflict(conflict, &request).await {
                    Ok(ResolveOutcome::Applied { history_id, .. }) => {
                        ItemOutcome::Resolved { history_id }
                    }
                    Ok(ResolveOutcome::Rejected(report)) => ItemOutcome::Rejected(report),
                    Err(e) => {
                        tracing::warn!(local_id = %conflict.local_id, error = %e, "Resolution failed");
                        ItemOutcome::Failed(e.to_string())
                    }
                }
            };

            match &outcome {
                ItemOutcome::Resolved { .. } => batch.resolved += 1,
                ItemOutcome::Skipped => batch.skipped += 1,
                ItemOutcome::Rejected(_) | ItemOutcome::Failed(_) => {
                    batch.failed += 1;
                    aborted = options.stop_on_error;
                }
            }
            batch.results.push((conflict.local_id.clone(), outcome));
        }

        tracing::info!(
            %strategy,
            resolved = batch.resolved,
            failed = batch.failed,
            skipped = batch.skipped,
            "Batch resolution finished"
        );
        Ok(batch)
    }

    /// Restore the snapshot behind a history entry and reopen its conflict.
    pub async fn undo_resolution(&self, history_id: &str) -> Result<UndoOutcome> {
        match self.store.take_resolution(history_id).await {
            Ok(record) => {
                tracing::info!(
                    local_id = %record.local_id,
                    history_id,
                    "Resolution undone"
                );
                Ok(UndoOutcome::Restored(record))
            }
            Err(e) if e.is_not_found() => Ok(UndoOutcome::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Resolution entries, newest first.
    pub async fn history(&self, local_id: Option<&str>) -> Result<Vec<OperationRecord>> {
        self.store.resolution_history(local_id).await
    }

    pub async fn history_entry(&self, history_id: &str) -> Result<Option<OperationRecord>> {
        self.store.history_entry(history_id).await
    }
}
