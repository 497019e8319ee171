//! Field diffs shown when analysing a conflict.
//!
//! Diffs read from the local side towards the remote side: `added` means
//! present remotely only, `removed` means present locally only.

use crate::{conflict::FieldConflict, fields::values_equal};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Text longer than this is diffed line by line.
pub const LONG_TEXT_THRESHOLD: usize = 80;

/// Membership diff of two arrays.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDiff {
    pub added: Vec<Value>,
    pub removed: Vec<Value>,
    pub unchanged: Vec<Value>,
}

/// One line of a line diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "line", rename_all = "lowercase")]
pub enum LineChange {
    Equal(String),
    Removed(String),
    Added(String),
}

/// Per-field diff, shaped by the field's value type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FieldDiff {
    List {
        field: String,
        diff: ListDiff,
    },
    Lines {
        field: String,
        lines: Vec<LineChange>,
    },
    Value {
        field: String,
        local: Value,
        remote: Value,
    },
}

impl FieldDiff {
    pub fn field(&self) -> &str {
        match self {
            Self::List { field, .. } | Self::Lines { field, .. } | Self::Value { field, .. } => {
                field
            }
        }
    }
}

/// Diff a conflicting field: list diff for arrays, line diff for long text,
/// plain comparison otherwise.
pub fn diff_field(conflict: &FieldConflict) -> FieldDiff {
    let field = conflict.field.clone();
    match (&conflict.local_value, &conflict.remote_value) {
        (Value::Array(local), Value::Array(remote)) => FieldDiff::List {
            field,
            diff: diff_lists(local, remote),
        },
        (Value::String(local), Value::String(remote))
            if is_long_text(local) || is_long_text(remote) =>
        {
            FieldDiff::Lines {
                field,
                lines: diff_lines(local, remote),
            }
        }
        (local, remote) => FieldDiff::Value {
            field,
            local: local.clone(),
            remote: remote.clone(),
        },
    }
}

fn is_long_text(text: &str) -> bool {
    text.len() > LONG_TEXT_THRESHOLD || text.contains('\n')
}

/// Membership diff; duplicates are reported once.
pub fn diff_lists(local: &[Value], remote: &[Value]) -> ListDiff {
    let contains = |list: &[Value], v: &Value| list.iter().any(|x| values_equal(x, v));
    let mut diff = ListDiff::default();

    for value in local {
        let bucket = if contains(remote, value) {
            &mut diff.unchanged
        } else {
            &mut diff.removed
        };
        if !contains(bucket.as_slice(), value) {
            bucket.push(value.clone());
        }
    }
    for value in remote {
        if !contains(local, value) && !contains(&diff.added, value) {
            diff.added.push(value.clone());
        }
    }

    diff
}

/// Longest-common-subsequence line diff.
pub fn diff_lines(local: &str, remote: &str) -> Vec<LineChange> {
    let a: Vec<&str> = local.lines().collect();
    let b: Vec<&str> = remote.lines().collect();

    // lcs[i][j] = LCS length of a[i..] and b[j..]
    let mut lcs = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            lcs[i][j] = if a[i] == b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut out = Vec::with_capacity(a.len().max(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            out.push(LineChange::Equal(a[i].to_string()));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            out.push(LineChange::Removed(a[i].to_string()));
            i += 1;
        } else {
            out.push(LineChange::Added(b[j].to_string()));
            j += 1;
        }
    }
    out.extend(a[i..].iter().map(|l| LineChange::Removed((*l).to_string())));
    out.extend(b[j..].iter().map(|l| LineChange::Added((*l).to_string())));
    out
}
