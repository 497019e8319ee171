//! Conflict analysis and resolution.
//!
//! Every [`ResolutionStrategy`] maps to a per-field resolver function through
//! [`ResolutionStrategy::field_resolver`]. Adding a strategy means adding a
//! variant and its resolver; the compiler enforces the rest.
//!
//! # Strategies
//!
//! - `LastWriteWinsLocal` / `LastWriteWinsRemote` - take one side
//!   unconditionally
//! - `TimestampBased` - take the more recently edited side; edits closer than
//!   the simultaneous-edit window tie-break to remote
//! - `AutoMerge` - 3-way merge against the base value (see
//!   [`merge_three_way`])
//! - `Manual` - caller-supplied values, never chosen automatically

use crate::{
    conflict::{Conflict, FieldConflict, Severity},
    diff::{diff_field, FieldDiff},
    error::Result,
    fields::values_equal,
    Error, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Edits closer together than this are treated as simultaneous.
pub const DEFAULT_SIMULTANEOUS_WINDOW_MS: u64 = 5_000;

/// How a conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    Manual,
    TimestampBased,
    LastWriteWinsLocal,
    LastWriteWinsRemote,
    AutoMerge,
}

impl ResolutionStrategy {
    pub const ALL: [ResolutionStrategy; 5] = [
        Self::Manual,
        Self::TimestampBased,
        Self::LastWriteWinsLocal,
        Self::LastWriteWinsRemote,
        Self::AutoMerge,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::TimestampBased => "timestamp-based",
            Self::LastWriteWinsLocal => "last-write-wins-local",
            Self::LastWriteWinsRemote => "last-write-wins-remote",
            Self::AutoMerge => "auto-merge",
        }
    }

    /// Whether the strategy can run without caller-supplied values.
    pub fn is_automatic(self) -> bool {
        self != Self::Manual
    }

    fn field_resolver(self) -> FieldResolver {
        match self {
            Self::Manual => resolve_manual,
            Self::TimestampBased => resolve_by_timestamp,
            Self::LastWriteWinsLocal => resolve_local,
            Self::LastWriteWinsRemote => resolve_remote,
            Self::AutoMerge => resolve_auto_merge,
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| format!("unknown resolution strategy: {s}"))
    }
}

/// A concrete set of field values settling a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    pub resolved_at: Timestamp,
    pub fields: BTreeMap<String, Value>,
    /// False only for manual resolutions
    pub automatic: bool,
}

/// What the caller asks the resolver to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRequest {
    pub strategy: ResolutionStrategy,
    /// Values for the manual strategy, keyed by field
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub manual_values: BTreeMap<String, Value>,
}

impl ResolutionRequest {
    pub fn new(strategy: ResolutionStrategy) -> Self {
        Self {
            strategy,
            manual_values: BTreeMap::new(),
        }
    }

    pub fn manual<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            strategy: ResolutionStrategy::Manual,
            manual_values: values.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Risk of applying a resolution without review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Where a resolved field value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    Local,
    Remote,
    Merged,
    Manual,
    Unresolved,
}

/// Result of analysing a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictAnalysis {
    pub applicable_strategies: Vec<ResolutionStrategy>,
    pub recommended_strategy: ResolutionStrategy,
    pub risk: RiskLevel,
    pub severity: Severity,
    /// `None` when modification times are unknown
    pub simultaneous_edit: Option<bool>,
    pub auto_mergeable: bool,
    pub field_diffs: Vec<FieldDiff>,
}

/// Errors and warnings for a proposed resolution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Per-field result of a previewed resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldOutcome {
    pub field: String,
    pub local_value: Value,
    pub remote_value: Value,
    pub resolved_value: Option<Value>,
    pub source: ValueSource,
}

struct ResolveContext<'a> {
    request: &'a ResolutionRequest,
    timestamps: Option<(Timestamp, Timestamp)>,
    window_ms: u64,
}

type FieldResolver = fn(&ResolveContext<'_>, &FieldConflict) -> Option<(Value, ValueSource)>;

fn resolve_manual(ctx: &ResolveContext<'_>, field: &FieldConflict) -> Option<(Value, ValueSource)> {
    ctx.request
        .manual_values
        .get(&field.field)
        .map(|v| (v.clone(), ValueSource::Manual))
}

fn resolve_local(_: &ResolveContext<'_>, field: &FieldConflict) -> Option<(Value, ValueSource)> {
    Some((field.local_value.clone(), ValueSource::Local))
}

fn resolve_remote(_: &ResolveContext<'_>, field: &FieldConflict) -> Option<(Value, ValueSource)> {
    Some((field.remote_value.clone(), ValueSource::Remote))
}

fn resolve_by_timestamp(
    ctx: &ResolveContext<'_>,
    field: &FieldConflict,
) -> Option<(Value, ValueSource)> {
    let (local_at, remote_at) = ctx.timestamps?;
    if local_at.abs_diff(remote_at) >= ctx.window_ms && local_at > remote_at {
        resolve_local(ctx, field)
    } else {
        resolve_remote(ctx, field)
    }
}

fn resolve_auto_merge(_: &ResolveContext<'_>, field: &FieldConflict) -> Option<(Value, ValueSource)> {
    Some(merge_with_source(
        field.base_value.as_ref(),
        &field.local_value,
        &field.remote_value,
    ))
}

fn contains(list: &[Value], value: &Value) -> bool {
    list.iter().any(|v| values_equal(v, value))
}

/// Union of two arrays relative to a base: additions from either side are
/// kept, removals by either side are dropped, duplicates are eliminated.
fn merge_arrays(base: &[Value], local: &[Value], remote: &[Value]) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::with_capacity(local.len() + remote.len());
    for value in local.iter().chain(remote) {
        if contains(&merged, value) {
            continue;
        }
        let keep = !contains(base, value) || (contains(local, value) && contains(remote, value));
        if keep {
            merged.push(value.clone());
        }
    }
    merged
}

fn merge_with_source(base: Option<&Value>, local: &Value, remote: &Value) -> (Value, ValueSource) {
    if values_equal(local, remote) {
        return (local.clone(), ValueSource::Local);
    }

    if let Some(base) = base {
        if values_equal(local, base) {
            return (remote.clone(), ValueSource::Remote);
        }
        if values_equal(remote, base) {
            return (local.clone(), ValueSource::Local);
        }
    }

    match (local, remote) {
        (Value::Array(l), Value::Array(r)) => {
            let base_items: &[Value] = match base {
                Some(Value::Array(b)) => b,
                _ => &[],
            };
            (Value::Array(merge_arrays(base_items, l, r)), ValueSource::Merged)
        }
        _ => (remote.clone(), ValueSource::Remote),
    }
}

/// Three-way merge of one field.
///
/// If only one side differs from `base`, that side wins. If both differ,
/// arrays are unioned relative to `base` and anything else takes the remote
/// value. Without a base, arrays are unioned and other values take remote.
pub fn merge_three_way(base: Option<&Value>, local: &Value, remote: &Value) -> Value {
    merge_with_source(base, local, remote).0
}

/// Stateless conflict analyst and resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictAnalyzer {
    simultaneous_window_ms: u64,
}

impl Default for ConflictAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_SIMULTANEOUS_WINDOW_MS)
    }
}

impl ConflictAnalyzer {
    pub fn new(simultaneous_window_ms: u64) -> Self {
        Self {
            simultaneous_window_ms,
        }
    }

    pub fn simultaneous_window_ms(&self) -> u64 {
        self.simultaneous_window_ms
    }

    /// Whether both sides were edited within the simultaneous-edit window.
    pub fn is_simultaneous(&self, conflict: &Conflict) -> Option<bool> {
        conflict
            .timestamps()
            .map(|(local, remote)| local.abs_diff(remote) < self.simultaneous_window_ms)
    }

    /// Strategies that can be applied to this conflict.
    pub fn applicable_strategies(&self, conflict: &Conflict) -> Vec<ResolutionStrategy> {
        ResolutionStrategy::ALL
            .into_iter()
            .filter(|strategy| match strategy {
                ResolutionStrategy::TimestampBased => conflict.timestamps().is_some(),
                ResolutionStrategy::AutoMerge => conflict.is_auto_mergeable(),
                _ => true,
            })
            .collect()
    }

    pub fn analyze(&self, conflict: &Conflict) -> ConflictAnalysis {
        let severity = conflict.classify();
        let simultaneous = self.is_simultaneous(conflict);

        let recommended = if severity.is_high() || simultaneous != Some(false) {
            ResolutionStrategy::Manual
        } else {
            ResolutionStrategy::TimestampBased
        };

        let risk = if severity.is_high() {
            RiskLevel::High
        } else if simultaneous == Some(true) {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        ConflictAnalysis {
            applicable_strategies: self.applicable_strategies(conflict),
            recommended_strategy: recommended,
            risk,
            severity,
            simultaneous_edit: simultaneous,
            auto_mergeable: conflict.is_auto_mergeable(),
            field_diffs: conflict.effective_fields().iter().map(diff_field).collect(),
        }
    }

    fn check(&self, conflict: &Conflict, request: &ResolutionRequest) -> (Vec<Error>, Vec<String>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let fields = conflict.field_names();

        for key in request.manual_values.keys() {
            if !fields.contains(key) {
                errors.push(Error::FieldNotInConflict(key.clone()));
            }
        }

        match request.strategy {
            ResolutionStrategy::Manual => {
                if request.manual_values.is_empty() {
                    errors.push(Error::UnsupportedStrategy {
                        strategy: request.strategy,
                        reason: "manual resolution requires caller-supplied values".into(),
                    });
                } else {
                    let missing: Vec<&str> = fields
                        .iter()
                        .filter(|f| !request.manual_values.contains_key(*f))
                        .map(String::as_str)
                        .collect();
                    if !missing.is_empty() {
                        warnings.push(format!("fields left unresolved: {}", missing.join(", ")));
                    }
                }
            }
            ResolutionStrategy::AutoMerge if !conflict.is_auto_mergeable() => {
                errors.push(Error::UnsupportedStrategy {
                    strategy: request.strategy,
                    reason: "conflict has fields without a base value".into(),
                });
            }
            ResolutionStrategy::TimestampBased if conflict.timestamps().is_none() => {
                errors.push(Error::UnsupportedStrategy {
                    strategy: request.strategy,
                    reason: "modification timestamps are unknown".into(),
                });
            }
            strategy => {
                if !request.manual_values.is_empty() {
                    warnings.push(format!("manual values are ignored by {strategy}"));
                }
            }
        }

        if self.is_simultaneous(conflict) == Some(true) {
            if let Some((local, remote)) = conflict.timestamps() {
                warnings.push(format!(
                    "near-simultaneous edits ({} ms apart); review the result",
                    local.abs_diff(remote)
                ));
            }
        }
        if conflict.resolved {
            warnings.push("conflict is already resolved".into());
        }

        (errors, warnings)
    }

    /// Validate a resolution request against a conflict.
    pub fn validate(&self, conflict: &Conflict, request: &ResolutionRequest) -> ValidationReport {
        let (errors, warnings) = self.check(conflict, request);
        ValidationReport {
            valid: errors.is_empty(),
            errors: errors.iter().map(ToString::to_string).collect(),
            warnings,
        }
    }

    /// Per-field outcome of a request, without validating it.
    pub fn preview(&self, conflict: &Conflict, request: &ResolutionRequest) -> Vec<FieldOutcome> {
        let ctx = ResolveContext {
            request,
            timestamps: conflict.timestamps(),
            window_ms: self.simultaneous_window_ms,
        };
        let resolver = request.strategy.field_resolver();

        conflict
            .effective_fields()
            .into_iter()
            .map(|field| {
                let (resolved_value, source) = match resolver(&ctx, &field) {
                    Some((value, source)) => (Some(value), source),
                    None => (None, ValueSource::Unresolved),
                };
                FieldOutcome {
                    field: field.field,
                    local_value: field.local_value,
                    remote_value: field.remote_value,
                    resolved_value,
                    source,
                }
            })
            .collect()
    }

    /// Validate and compute the resolved field values.
    pub fn materialize(
        &self,
        conflict: &Conflict,
        request: &ResolutionRequest,
        now: Timestamp,
    ) -> Result<Resolution> {
        let (errors, _) = self.check(conflict, request);
        if let Some(err) = errors.into_iter().next() {
            return Err(err);
        }

        let fields = self
            .preview(conflict, request)
            .into_iter()
            .filter_map(|outcome| outcome.resolved_value.map(|v| (outcome.field, v)))
            .collect();

        Ok(Resolution {
            strategy: request.strategy,
            resolved_at: now,
            fields,
            automatic: request.strategy.is_automatic(),
        })
    }
}
