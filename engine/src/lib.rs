//! # Trellis Engine
//!
//! Deterministic core for keeping local work items and remote tracker issues
//! in sync.
//!
//! This crate owns every decision the sync runtime makes: what the persisted
//! state looks like, whether an item changed, which fields conflict, how
//! severe a conflict is, and what a resolution strategy produces. It performs
//! no I/O; the `trellis-sync` crate wraps it with persistence, remote calls
//! and retries.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches files, network or clocks. Callers
//!   pass `now` explicitly.
//! - **Deterministic**: the same inputs always produce the same outputs,
//!   including serialized state (maps are `BTreeMap`).
//! - **Closed strategy sets**: detection and resolution strategies are enums,
//!   so a new strategy is a compile-checked variant.
//!
//! ## Core Concepts
//!
//! ### Mappings
//!
//! A [`Mapping`] links a local item id to a remote issue number within one
//! container (`owner/repo`) and remembers when and in which direction the pair
//! was last synced.
//!
//! ### Change detection
//!
//! [`DetectionStrategy`] selects how [`detect`] compares a [`LocalItem`] with
//! a [`RemoteResource`]:
//! - [`DetectionStrategy::Timestamp`] - compare modification times against the
//!   last sync point
//! - [`DetectionStrategy::ContentHash`] - compare SHA-256 hashes of a stable
//!   serialization
//! - [`DetectionStrategy::FieldByField`] - compare the mapped fields
//! - [`DetectionStrategy::Hybrid`] - timestamps first, fields only when dirty
//!
//! ### Conflict resolution
//!
//! [`ConflictAnalyzer`] ranks the applicable [`ResolutionStrategy`] values for
//! a [`Conflict`], assesses risk, and materializes a [`Resolution`].
//!
//! ## Quick Start
//!
//! ```rust
//! use trellis_engine::{
//!     Conflict, ConflictAnalyzer, ConflictType, FieldConflict, ResolutionRequest,
//!     ResolutionStrategy,
//! };
//! use serde_json::json;
//!
//! let conflict = Conflict::new(
//!     "task-1",
//!     42,
//!     ConflictType::BothModified,
//!     json!({"title": "Local title"}),
//!     json!({"title": "Remote title"}),
//!     1_706_745_600_000,
//! )
//! .with_fields(vec![FieldConflict::new(
//!     "title",
//!     json!("Local title"),
//!     json!("Remote title"),
//!     None,
//! )]);
//!
//! let analyzer = ConflictAnalyzer::default();
//! let request = ResolutionRequest::new(ResolutionStrategy::LastWriteWinsRemote);
//! let resolution = analyzer
//!     .materialize(&conflict, &request, 1_706_745_700_000)
//!     .unwrap();
//!
//! assert_eq!(resolution.fields["title"], json!("Remote title"));
//! assert!(resolution.automatic);
//! ```
//!
//! ## Persistence
//!
//! [`SyncState`] is the aggregate root written to disk by the runtime. Use
//! [`SyncState::to_json_pretty`] and [`SyncState::from_json`]; the latter
//! validates the schema so a corrupt file is rejected rather than half-read.

pub mod change;
pub mod conflict;
pub mod diff;
pub mod error;
pub mod fields;
pub mod history;
pub mod item;
pub mod mapping;
pub mod resolve;
pub mod state;

// Re-export main types at crate root
pub use change::{
    content_hash, detect, hash_item, hash_resource, ChangeMetadata, ChangeReport,
    DetectionStrategy, FieldChange,
};
pub use conflict::{Conflict, ConflictType, FieldConflict, Severity};
pub use diff::{diff_field, diff_lines, diff_lists, FieldDiff, LineChange, ListDiff};
pub use error::Error;
pub use fields::{project_local, project_remote, values_equal, FieldRule, FieldTransform, FIELD_RULES};
pub use history::{NewOperation, OperationKind, OperationRecord, ResolutionRecord};
pub use item::{LocalItem, RemoteResource};
pub use mapping::{Mapping, MappingStatus, SyncDirection};
pub use resolve::{
    merge_three_way, ConflictAnalysis, ConflictAnalyzer, FieldOutcome, Resolution,
    ResolutionRequest, ResolutionStrategy, RiskLevel, ValidationReport, ValueSource,
    DEFAULT_SIMULTANEOUS_WINDOW_MS,
};
pub use state::{
    BackupInfo, CleanupReport, RecoveryMarker, StateStats, SyncState, DEFAULT_MAX_HISTORY,
    RESOLVED_CONFLICT_CLEANUP_THRESHOLD, STATE_SCHEMA_VERSION,
};

/// Type aliases for clarity
pub type LocalId = String;
pub type RemoteId = u64;
pub type ContainerId = String;
pub type Timestamp = u64;
pub type SchemaVersion = u32;
