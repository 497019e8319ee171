//! Change detection between a local item and its mapped remote issue.
//!
//! Detection is a pure function of the two sides, the mapping (which carries
//! the last sync point) and the change metadata persisted by the previous
//! run. The runtime fetches the remote side and persists the metadata that
//! [`ChangeReport::next_metadata`] produces.
//!
//! # Strategies
//!
//! | Strategy        | Cost  | Field detail | Notes                                   |
//! |-----------------|-------|--------------|-----------------------------------------|
//! | `Timestamp`     | O(1)  | no           | sensitive to clock skew                 |
//! | `ContentHash`   | O(n)  | no           | detects any content change              |
//! | `FieldByField`  | O(n)  | yes          | every differing field is two-sided      |
//! | `Hybrid`        | O(1)* | when dirty   | timestamps first, fields only if needed |

use crate::{
    conflict::{Conflict, ConflictType, FieldConflict},
    fields::{project_local, project_remote, values_equal},
    LocalId, LocalItem, Mapping, RemoteId, RemoteResource, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// How changes are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionStrategy {
    /// Compare modification times with the last sync point
    Timestamp,
    /// Compare SHA-256 hashes of a stable serialization
    ContentHash,
    /// Compare every mapped field
    FieldByField,
    /// Timestamps first, field comparison only for dirty items (default)
    #[default]
    Hybrid,
}

impl std::str::FromStr for DetectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timestamp" => Ok(Self::Timestamp),
            "content-hash" => Ok(Self::ContentHash),
            "field-by-field" => Ok(Self::FieldByField),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown detection strategy: {other}")),
        }
    }
}

/// Per-item bookkeeping written on every detector run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMetadata {
    pub local_id: LocalId,
    pub last_local_modified: Option<Timestamp>,
    pub last_remote_modified: Option<Timestamp>,
    pub last_checked_at: Timestamp,
    /// Local side changed since the last sync
    pub local_changed: bool,
    /// Remote side changed since the last sync
    pub remote_changed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_hash: Option<String>,
}

impl ChangeMetadata {
    pub fn new(local_id: impl Into<LocalId>, checked_at: Timestamp) -> Self {
        Self {
            local_id: local_id.into(),
            last_local_modified: None,
            last_remote_modified: None,
            last_checked_at: checked_at,
            local_changed: false,
            remote_changed: false,
            local_hash: None,
            remote_hash: None,
        }
    }
}

/// A mapped field whose two sides differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    /// Local field name
    pub field: String,
    pub local_value: Value,
    pub remote_value: Value,
    pub local_changed: bool,
    pub remote_changed: bool,
}

impl FieldChange {
    pub fn is_conflict(&self) -> bool {
        self.local_changed && self.remote_changed
    }
}

/// Outcome of one detection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeReport {
    pub local_id: LocalId,
    pub remote_id: RemoteId,
    pub strategy: DetectionStrategy,
    pub has_changes: bool,
    /// Local side changed since the last sync
    pub local_changed: bool,
    /// Remote side changed since the last sync
    pub remote_changed: bool,
    pub has_conflict: bool,
    /// Local side changed since the previous detector run
    pub local_changed_since_check: bool,
    /// Remote side changed since the previous detector run
    pub remote_changed_since_check: bool,
    pub field_changes: Vec<FieldChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_hash: Option<String>,
    pub checked_at: Timestamp,
    /// Modification times observed during this run
    pub local_modified_at: Timestamp,
    pub remote_modified_at: Timestamp,
}

impl ChangeReport {
    fn new(
        strategy: DetectionStrategy,
        item: &LocalItem,
        resource: &RemoteResource,
        previous: Option<&ChangeMetadata>,
        now: Timestamp,
    ) -> Self {
        let (local_since_check, remote_since_check) = match previous {
            Some(meta) => (
                meta.last_local_modified
                    .map_or(true, |seen| item.updated_at > seen),
                meta.last_remote_modified
                    .map_or(true, |seen| resource.updated_at > seen),
            ),
            None => (false, false),
        };

        Self {
            local_id: item.id.clone(),
            remote_id: resource.number,
            strategy,
            has_changes: false,
            local_changed: false,
            remote_changed: false,
            has_conflict: false,
            local_changed_since_check: local_since_check,
            remote_changed_since_check: remote_since_check,
            field_changes: Vec::new(),
            local_hash: None,
            remote_hash: None,
            checked_at: now,
            local_modified_at: item.updated_at,
            remote_modified_at: resource.updated_at,
        }
    }

    fn set_sides(&mut self, local: bool, remote: bool) {
        self.local_changed = local;
        self.remote_changed = remote;
        self.has_changes = local || remote;
        self.has_conflict = local && remote;
    }

    /// Metadata to persist after this run.
    ///
    /// Content hashes act as a baseline that only advances when the side is
    /// unchanged, so a change stays reported until the next sync.
    pub fn next_metadata(&self, previous: Option<&ChangeMetadata>) -> ChangeMetadata {
        let keep = |prev: Option<&String>, changed: bool, current: &Option<String>| {
            if changed {
                prev.cloned().or_else(|| current.clone())
            } else {
                current.clone().or_else(|| prev.cloned())
            }
        };

        ChangeMetadata {
            local_id: self.local_id.clone(),
            last_local_modified: Some(self.local_modified_at),
            last_remote_modified: Some(self.remote_modified_at),
            last_checked_at: self.checked_at,
            local_changed: self.local_changed,
            remote_changed: self.remote_changed,
            local_hash: keep(
                previous.and_then(|m| m.local_hash.as_ref()),
                self.local_changed,
                &self.local_hash,
            ),
            remote_hash: keep(
                previous.and_then(|m| m.remote_hash.as_ref()),
                self.remote_changed,
                &self.remote_hash,
            ),
        }
    }

    /// Build a conflict record from a conflicting report.
    ///
    /// Returns `None` when the report carries no conflict.
    pub fn to_conflict(&self, item: &LocalItem, resource: &RemoteResource) -> Option<Conflict> {
        if !self.has_conflict {
            return None;
        }

        let local_value = Value::Object(project_local(item).into_iter().collect());
        let remote_value = Value::Object(project_remote(resource).into_iter().collect());
        let fields: Vec<FieldConflict> = self
            .field_changes
            .iter()
            .filter(|c| c.is_conflict())
            .map(|c| {
                FieldConflict::new(
                    c.field.clone(),
                    c.local_value.clone(),
                    c.remote_value.clone(),
                    None,
                )
            })
            .collect();

        Some(
            Conflict::new(
                self.local_id.clone(),
                self.remote_id,
                ConflictType::BothModified,
                local_value,
                remote_value,
                self.checked_at,
            )
            .with_timestamps(self.local_modified_at, self.remote_modified_at)
            .with_fields(fields),
        )
    }
}

/// Run one detection strategy.
///
/// `previous` is the change metadata persisted by the last run, if any.
pub fn detect(
    strategy: DetectionStrategy,
    item: &LocalItem,
    resource: &RemoteResource,
    mapping: &Mapping,
    previous: Option<&ChangeMetadata>,
    now: Timestamp,
) -> ChangeReport {
    let mut report = ChangeReport::new(strategy, item, resource, previous, now);

    match strategy {
        DetectionStrategy::Timestamp => {
            let (local, remote) = timestamp_sides(item, resource, mapping);
            report.set_sides(local, remote);
        }
        DetectionStrategy::ContentHash => {
            let local_hash = hash_item(item);
            let remote_hash = hash_resource(resource);
            // A baseline recorded before the last sync no longer describes
            // the synced content.
            let baseline = previous.filter(|m| m.last_checked_at >= mapping.last_synced_at);
            let local = baseline
                .and_then(|m| m.local_hash.as_ref())
                .is_some_and(|h| *h != local_hash);
            let remote = baseline
                .and_then(|m| m.remote_hash.as_ref())
                .is_some_and(|h| *h != remote_hash);
            report.set_sides(local, remote);
            report.local_hash = Some(local_hash);
            report.remote_hash = Some(remote_hash);
        }
        DetectionStrategy::FieldByField => {
            let changes = compare_fields(item, resource, true, true);
            let dirty = !changes.is_empty();
            report.set_sides(dirty, dirty);
            report.field_changes = changes;
        }
        DetectionStrategy::Hybrid => {
            let (local, remote) = timestamp_sides(item, resource, mapping);
            report.set_sides(local, remote);
            if report.has_changes {
                report.field_changes = compare_fields(item, resource, local, remote);
                report.has_conflict = local && remote && !report.field_changes.is_empty();
            }
        }
    }

    report
}

fn timestamp_sides(item: &LocalItem, resource: &RemoteResource, mapping: &Mapping) -> (bool, bool) {
    (
        item.updated_at > mapping.last_synced_at,
        resource.updated_at > mapping.last_synced_at,
    )
}

/// Compare every mapped field, tagging differences with the given sides.
fn compare_fields(
    item: &LocalItem,
    resource: &RemoteResource,
    local_changed: bool,
    remote_changed: bool,
) -> Vec<FieldChange> {
    let local = project_local(item);
    let mut remote = project_remote(resource);

    local
        .into_iter()
        .filter_map(|(field, local_value)| {
            let remote_value = remote.remove(&field).unwrap_or(Value::Null);
            if values_equal(&local_value, &remote_value) {
                None
            } else {
                Some(FieldChange {
                    field,
                    local_value,
                    remote_value,
                    local_changed,
                    remote_changed,
                })
            }
        })
        .collect()
}

/// Recursively rebuild a value with object keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), v))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// SHA-256 (hex) of a value's stable serialization.
pub fn content_hash(value: &Value) -> String {
    let canonical = canonicalize(value).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn hash_without_timestamp<T: Serialize>(value: &T) -> String {
    let mut value = serde_json::to_value(value).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.remove("updatedAt");
    }
    content_hash(&value)
}

/// Content hash of a local item, ignoring its modification time.
pub fn hash_item(item: &LocalItem) -> String {
    hash_without_timestamp(item)
}

/// Content hash of a remote issue, ignoring its modification time.
pub fn hash_resource(resource: &RemoteResource) -> String {
    hash_without_timestamp(resource)
}
