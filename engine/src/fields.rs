//! Field mapping between local items and remote issues.
//!
//! Each [`FieldRule`] names a local field, the remote field it maps to, and
//! the transform that brings the local value into the remote shape. Both
//! [`project_local`] and [`project_remote`] produce maps keyed by local field
//! name whose values are in the remote shape, so the two projections can be
//! compared key by key.

use crate::{LocalItem, RemoteResource};
use serde_json::Value;
use std::collections::BTreeMap;

/// Label prefix carrying the local priority.
pub const PRIORITY_LABEL_PREFIX: &str = "priority:";
/// Label prefix carrying the local complexity score.
pub const COMPLEXITY_LABEL_PREFIX: &str = "complexity:";

/// How a local value is translated into the remote shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldTransform {
    /// Value is copied as-is
    Identity,
    /// Workflow status collapses to `open`/`closed`
    StatusToState,
    /// Priority becomes a `priority:<value>` label
    PriorityLabel,
    /// Complexity becomes a `complexity:<n>` label
    ComplexityLabel,
    /// Tags map to remote labels that carry no reserved prefix
    PlainLabels,
}

/// A single local↔remote field correspondence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRule {
    pub local_field: &'static str,
    pub remote_field: &'static str,
    pub transform: FieldTransform,
}

/// The fixed mapping the change detector mirrors.
pub const FIELD_RULES: [FieldRule; 6] = [
    FieldRule {
        local_field: "title",
        remote_field: "title",
        transform: FieldTransform::Identity,
    },
    FieldRule {
        local_field: "description",
        remote_field: "body",
        transform: FieldTransform::Identity,
    },
    FieldRule {
        local_field: "status",
        remote_field: "state",
        transform: FieldTransform::StatusToState,
    },
    FieldRule {
        local_field: "priority",
        remote_field: "labels",
        transform: FieldTransform::PriorityLabel,
    },
    FieldRule {
        local_field: "complexity",
        remote_field: "labels",
        transform: FieldTransform::ComplexityLabel,
    },
    FieldRule {
        local_field: "labels",
        remote_field: "labels",
        transform: FieldTransform::PlainLabels,
    },
];

/// Look up the rule for a local field name.
pub fn rule_for(local_field: &str) -> Option<&'static FieldRule> {
    FIELD_RULES.iter().find(|r| r.local_field == local_field)
}

/// Map a local workflow status to the remote issue state.
pub fn status_to_state(status: &str) -> &'static str {
    match status {
        "done" | "cancelled" | "closed" => "closed",
        _ => "open",
    }
}

fn is_reserved_label(label: &str) -> bool {
    label.starts_with(PRIORITY_LABEL_PREFIX) || label.starts_with(COMPLEXITY_LABEL_PREFIX)
}

fn find_label(labels: &[String], prefix: &str) -> Value {
    labels
        .iter()
        .find(|l| l.starts_with(prefix))
        .map_or(Value::Null, |l| Value::String(l.clone()))
}

fn string_array<'a>(labels: impl Iterator<Item = &'a String>) -> Value {
    Value::Array(labels.map(|l| Value::String(l.clone())).collect())
}

/// Project a local item into remote-shaped values keyed by local field.
pub fn project_local(item: &LocalItem) -> BTreeMap<String, Value> {
    FIELD_RULES
        .iter()
        .map(|rule| {
            let value = match rule.transform {
                FieldTransform::Identity => match rule.local_field {
                    "title" => Value::String(item.title.clone()),
                    _ => Value::String(item.description.clone()),
                },
                FieldTransform::StatusToState => {
                    Value::String(status_to_state(&item.status).to_string())
                }
                FieldTransform::PriorityLabel => item.priority.as_ref().map_or(Value::Null, |p| {
                    Value::String(format!("{PRIORITY_LABEL_PREFIX}{p}"))
                }),
                FieldTransform::ComplexityLabel => {
                    item.complexity.map_or(Value::Null, |c| {
                        Value::String(format!("{COMPLEXITY_LABEL_PREFIX}{c}"))
                    })
                }
                FieldTransform::PlainLabels => {
                    string_array(item.labels.iter().filter(|l| !is_reserved_label(l)))
                }
            };
            (rule.local_field.to_string(), value)
        })
        .collect()
}

/// Project a remote issue into values keyed by local field.
pub fn project_remote(resource: &RemoteResource) -> BTreeMap<String, Value> {
    FIELD_RULES
        .iter()
        .map(|rule| {
            let value = match rule.transform {
                FieldTransform::Identity => match rule.remote_field {
                    "title" => Value::String(resource.title.clone()),
                    _ => Value::String(resource.body.clone()),
                },
                FieldTransform::StatusToState => Value::String(resource.state.clone()),
                FieldTransform::PriorityLabel => {
                    find_label(&resource.labels, PRIORITY_LABEL_PREFIX)
                }
                FieldTransform::ComplexityLabel => {
                    find_label(&resource.labels, COMPLEXITY_LABEL_PREFIX)
                }
                FieldTransform::PlainLabels => {
                    string_array(resource.labels.iter().filter(|l| !is_reserved_label(l)))
                }
            };
            (rule.local_field.to_string(), value)
        })
        .collect()
}

/// Deep equality where arrays compare as multisets.
///
/// Objects compare key by key; every other value uses plain equality.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(xs), Value::Array(ys)) => {
            if xs.len() != ys.len() {
                return false;
            }
            let mut used = vec![false; ys.len()];
            xs.iter().all(|x| {
                let slot = ys
                    .iter()
                    .enumerate()
                    .find(|(i, y)| !used[*i] && values_equal(x, y))
                    .map(|(i, _)| i);
                match slot {
                    Some(i) => {
                        used[i] = true;
                        true
                    }
                    None => false,
                }
            })
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}
