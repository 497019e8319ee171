//! Local work items and remote tracker resources.
//!
//! These are the two shapes the engine compares. Neither side is ever written
//! by the engine; the orchestrator applies resolved values back.

use crate::{LocalId, RemoteId, Timestamp};
use serde::{Deserialize, Serialize};

/// A work item as held by the local repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalItem {
    /// Stable local identifier
    pub id: LocalId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Workflow status (`pending`, `in-progress`, `done`, ...)
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<u8>,
    /// Free-form tags, mirrored to remote labels
    #[serde(default)]
    pub labels: Vec<String>,
    /// Last local modification (milliseconds since epoch)
    pub updated_at: Timestamp,
}

impl LocalItem {
    /// Create an item with the required fields; optional fields start empty.
    pub fn new(
        id: impl Into<LocalId>,
        title: impl Into<String>,
        status: impl Into<String>,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: status.into(),
            priority: None,
            complexity: None,
            labels: Vec::new(),
            updated_at,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.complexity = Some(complexity);
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }
}

/// An issue as returned by the remote tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteResource {
    /// Issue number within its container
    pub number: RemoteId,
    pub title: String,
    #[serde(default)]
    pub body: String,
    /// `open` or `closed`
    pub state: String,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Last remote modification (milliseconds since epoch)
    pub updated_at: Timestamp,
}

impl RemoteResource {
    pub fn new(
        number: RemoteId,
        title: impl Into<String>,
        state: impl Into<String>,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            number,
            title: title.into(),
            body: String::new(),
            state: state.into(),
            labels: Vec::new(),
            updated_at,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }
}
