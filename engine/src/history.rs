//! Operation history entries.
//!
//! The history is a capped ring buffer inside [`SyncState`](crate::SyncState).
//! Resolution entries double as the undo log: each carries the full
//! conflict as it stood before the resolution.

use crate::{
    conflict::{Conflict, ConflictType},
    resolve::Resolution,
    LocalId, RemoteId, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What an operation did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OperationKind {
    /// Local changes written to the remote
    Push,
    /// Remote changes written to the local item
    Pull,
    Create,
    Update,
    Delete,
    /// A conflict resolution, with its undo snapshot
    Resolve(Box<ResolutionRecord>),
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Resolve(_) => "resolve",
        }
    }
}

/// An operation as submitted by a caller, before the store stamps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOperation {
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteId>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NewOperation {
    /// A successful operation on a mapped pair.
    pub fn succeeded(kind: OperationKind, local_id: impl Into<LocalId>, remote_id: RemoteId) -> Self {
        Self {
            kind,
            local_id: Some(local_id.into()),
            remote_id: Some(remote_id),
            success: true,
            error: None,
        }
    }

    /// A failed operation on a mapped pair.
    pub fn failed(
        kind: OperationKind,
        local_id: impl Into<LocalId>,
        remote_id: Option<RemoteId>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            local_id: Some(local_id.into()),
            remote_id,
            success: false,
            error: Some(error.into()),
        }
    }

    /// Stamp the operation with an id and a time.
    pub fn into_record(self, id: impl Into<String>, timestamp: Timestamp) -> OperationRecord {
        OperationRecord {
            id: id.into(),
            timestamp,
            kind: self.kind,
            local_id: self.local_id,
            remote_id: self.remote_id,
            success: self.success,
            error: self.error,
        }
    }
}

/// A stamped history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub id: String,
    pub timestamp: Timestamp,
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteId>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationRecord {
    pub fn resolution(&self) -> Option<&ResolutionRecord> {
        match &self.kind {
            OperationKind::Resolve(record) => Some(record),
            _ => None,
        }
    }
}

/// Undo information for an applied resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRecord {
    pub local_id: LocalId,
    pub remote_id: RemoteId,
    pub conflict_type: ConflictType,
    pub resolution: Resolution,
    /// The conflict before the resolution was applied, restored verbatim on undo
    pub snapshot: Conflict,
}

impl ResolutionRecord {
    /// Snapshot a conflict together with the resolution applied to it.
    pub fn new(conflict: &Conflict, resolution: Resolution) -> Self {
        Self {
            local_id: conflict.local_id.clone(),
            remote_id: conflict.remote_id,
            conflict_type: conflict.conflict_type,
            resolution,
            snapshot: conflict.clone(),
        }
    }

    /// Local side before the resolution was applied.
    pub fn local_snapshot(&self) -> &Value {
        &self.snapshot.local_value
    }

    /// Remote side before the resolution was applied.
    pub fn remote_snapshot(&self) -> &Value {
        &self.snapshot.remote_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::ResolutionStrategy;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn resolve_kind_serializes_tagged() {
        let conflict = Conflict::new(
            "task-1",
            2,
            ConflictType::BothModified,
            json!({"title": "a"}),
            json!({"title": "b"}),
            10,
        );
        let resolution = Resolution {
            strategy: ResolutionStrategy::LastWriteWinsLocal,
            resolved_at: 20,
            fields: BTreeMap::from([("title".to_string(), json!("a"))]),
            automatic: true,
        };
        let record = NewOperation::succeeded(
            OperationKind::Resolve(Box::new(ResolutionRecord::new(&conflict, resolution))),
            "task-1",
            2,
        )
        .into_record("op-1", 30);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["kind"]["type"], json!("resolve"));
        assert_eq!(value["kind"]["snapshot"]["localValue"], json!({"title": "a"}));

        let back: OperationRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.resolution().unwrap().remote_snapshot(), &json!({"title": "b"}));
    }

    #[test]
    fn plain_kinds_have_names() {
        assert_eq!(OperationKind::Push.name(), "push");
        assert_eq!(OperationKind::Delete.name(), "delete");
    }
}
