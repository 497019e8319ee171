//! Conflict records and severity classification.

use crate::{fields::values_equal, resolve::ResolutionStrategy, LocalId, RemoteId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Kind of divergence between the two sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    /// Mapped fields disagree
    FieldMismatch,
    /// Both sides were edited since the last sync
    BothModified,
    /// Deleted locally, edited remotely
    DeletedLocally,
    /// Deleted remotely, edited locally
    DeletedRemotely,
}

impl ConflictType {
    pub fn is_deletion(self) -> bool {
        matches!(self, Self::DeletedLocally | Self::DeletedRemotely)
    }
}

/// How much damage a wrong resolution could do.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity of a conflicting field, by name.
    pub fn for_field(field: &str) -> Self {
        match field {
            "title" | "status" => Self::High,
            "description" => Self::Medium,
            _ => Self::Low,
        }
    }

    pub fn is_high(self) -> bool {
        self >= Self::High
    }
}

/// Field-level detail of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConflict {
    pub field: String,
    pub local_value: Value,
    pub remote_value: Value,
    /// Common ancestor value, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_value: Option<Value>,
    /// Whether a 3-way merge can settle this field on its own
    #[serde(default)]
    pub auto_mergeable: bool,
}

impl FieldConflict {
    /// Create a field conflict. A field is auto-mergeable exactly when a base
    /// value is known.
    pub fn new(
        field: impl Into<String>,
        local_value: Value,
        remote_value: Value,
        base_value: Option<Value>,
    ) -> Self {
        let auto_mergeable = base_value.is_some();
        Self {
            field: field.into(),
            local_value,
            remote_value,
            base_value,
            auto_mergeable,
        }
    }
}

/// A detected divergence between a local item and its remote issue.
///
/// Identified by `(local_id, remote_id, conflict_type)`; the store upserts on
/// that key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub local_id: LocalId,
    pub remote_id: RemoteId,
    pub conflict_type: ConflictType,
    pub local_value: Value,
    pub remote_value: Value,
    pub detected_at: Timestamp,
    /// Chosen or suggested strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ResolutionStrategy>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldConflict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_modified_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_modified_at: Option<Timestamp>,
}

impl Conflict {
    /// Create an unresolved conflict; severity is classified immediately.
    pub fn new(
        local_id: impl Into<LocalId>,
        remote_id: RemoteId,
        conflict_type: ConflictType,
        local_value: Value,
        remote_value: Value,
        detected_at: Timestamp,
    ) -> Self {
        let mut conflict = Self {
            local_id: local_id.into(),
            remote_id,
            conflict_type,
            local_value,
            remote_value,
            detected_at,
            strategy: None,
            resolved: false,
            severity: Severity::Low,
            fields: Vec::new(),
            local_modified_at: None,
            remote_modified_at: None,
        };
        conflict.severity = conflict.classify();
        conflict
    }

    pub fn with_fields(mut self, fields: Vec<FieldConflict>) -> Self {
        self.fields = fields;
        self.severity = self.classify();
        self
    }

    pub fn with_timestamps(mut self, local: Timestamp, remote: Timestamp) -> Self {
        self.local_modified_at = Some(local);
        self.remote_modified_at = Some(remote);
        self
    }

    pub fn with_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Whether `other` shares this conflict's identity.
    pub fn same_key(&self, other: &Conflict) -> bool {
        self.local_id == other.local_id
            && self.remote_id == other.remote_id
            && self.conflict_type == other.conflict_type
    }

    /// Severity derived from the conflict type and its fields.
    pub fn classify(&self) -> Severity {
        if self.conflict_type.is_deletion() {
            return Severity::Critical;
        }
        self.effective_fields()
            .iter()
            .map(|f| Severity::for_field(&f.field))
            .max()
            .unwrap_or(Severity::Low)
    }

    /// Field conflicts, derived from the top-level values when none were
    /// recorded.
    pub fn effective_fields(&self) -> Vec<FieldConflict> {
        if !self.fields.is_empty() {
            return self.fields.clone();
        }

        match (&self.local_value, &self.remote_value) {
            (Value::Object(local), Value::Object(remote)) => {
                let keys: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
                keys.into_iter()
                    .filter_map(|key| {
                        let l = local.get(key).cloned().unwrap_or(Value::Null);
                        let r = remote.get(key).cloned().unwrap_or(Value::Null);
                        (!values_equal(&l, &r)).then(|| FieldConflict::new(key.clone(), l, r, None))
                    })
                    .collect()
            }
            (l, r) if !values_equal(l, r) => {
                vec![FieldConflict::new("value", l.clone(), r.clone(), None)]
            }
            _ => Vec::new(),
        }
    }

    /// Names of the conflicting fields.
    pub fn field_names(&self) -> Vec<String> {
        self.effective_fields().into_iter().map(|f| f.field).collect()
    }

    /// Auto-merge is supported only when every conflicting field carries a
    /// base value.
    pub fn is_auto_mergeable(&self) -> bool {
        let fields = self.effective_fields();
        !fields.is_empty() && fields.iter().all(|f| f.auto_mergeable)
    }

    /// Both modification times, when recorded.
    pub fn timestamps(&self) -> Option<(Timestamp, Timestamp)> {
        self.local_modified_at.zip(self.remote_modified_at)
    }
}
