//! # Trellis Sync
//!
//! Async runtime around [`trellis_engine`]: the persisted sync state store,
//! change detection against a remote tracker, conflict resolution with an
//! undo log, and a resilience layer for remote calls.
//!
//! ## Components
//!
//! - [`SyncStateStore`] - lock-serialized, atomically written state file with
//!   rolling backups and automatic recovery
//! - [`ResilienceLayer`] - retry with jittered backoff, a circuit breaker and
//!   rate-limit waits
//! - [`ChangeDetector`] - compares local items with their mapped remote
//!   issues and records change metadata
//! - [`ConflictResolver`] - analyses, applies and undoes conflict resolutions
//!
//! The remote tracker is reached through the [`RemoteClient`] trait; callers
//! provide the implementation.

pub mod config;
pub mod detector;
pub mod error;
pub mod lock;
pub mod remote;
pub mod resilience;
pub mod resolver;
pub mod store;
pub mod telemetry;

pub use config::{
    ConfigError, DetectorConfig, ResilienceConfig, ResolverConfig, StoreConfig, SyncConfig,
};
pub use detector::{BatchDetection, ChangeDetector, DetectOptions};
pub use error::{Result, SyncError};
pub use lock::LockManager;
pub use remote::{FailureClass, RateLimitStatus, RemoteClient, RemoteError, ResourceDraft};
pub use resilience::{
    BatchOptions, CircuitStatus, RateLimitCheck, ResilienceError, ResilienceLayer,
    ResilienceStats,
};
pub use resolver::{
    BatchResolution, BatchResolveOptions, ConflictResolver, ItemOutcome, ResolveOutcome,
    UndoOutcome,
};
pub use store::{BackupEntry, Recovery, StoreErrorKind, StoreResult, SyncStateStore};

use trellis_engine::Timestamp;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
