//! The remote tracker boundary.
//!
//! The runtime never talks HTTP itself. Callers implement [`RemoteClient`]
//! for their tracker and report failures as [`RemoteError`], which the
//! resilience layer classifies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use trellis_engine::{
    fields::{status_to_state, COMPLEXITY_LABEL_PREFIX, PRIORITY_LABEL_PREFIX},
    LocalItem, RemoteId, RemoteResource, Timestamp,
};

/// Failure reported by a remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("remote returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Quota exhausted; `reset_at` is when it refills, if the remote said
    #[error("rate limited")]
    RateLimited { reset_at: Option<Timestamp> },
}

/// How the resilience layer treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    RateLimited { reset_at: Option<Timestamp> },
    Retryable,
    NonRetryable,
}

impl RemoteError {
    pub fn classify(&self) -> FailureClass {
        match self {
            Self::RateLimited { reset_at } => FailureClass::RateLimited {
                reset_at: *reset_at,
            },
            Self::Network(_) => FailureClass::Retryable,
            Self::Status { status, .. } => match status {
                408 | 429 | 500..=599 => FailureClass::Retryable,
                _ => FailureClass::NonRetryable,
            },
        }
    }
}

/// Remote API quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: Timestamp,
}

/// Fields sent when creating or updating a remote issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDraft {
    pub title: String,
    pub body: String,
    pub state: String,
    pub labels: Vec<String>,
}

impl ResourceDraft {
    /// Translate a local item into the remote shape.
    pub fn from_item(item: &LocalItem) -> Self {
        let mut labels = item.labels.clone();
        if let Some(priority) = &item.priority {
            labels.push(format!("{PRIORITY_LABEL_PREFIX}{priority}"));
        }
        if let Some(complexity) = item.complexity {
            labels.push(format!("{COMPLEXITY_LABEL_PREFIX}{complexity}"));
        }

        Self {
            title: item.title.clone(),
            body: item.description.clone(),
            state: status_to_state(&item.status).to_string(),
            labels,
        }
    }
}

/// Client for the remote issue tracker.
///
/// `container` identifies the repository (`owner/repo`).
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn get_resource(
        &self,
        container: &str,
        number: RemoteId,
    ) -> Result<RemoteResource, RemoteError>;

    async fn create_resource(
        &self,
        container: &str,
        draft: &ResourceDraft,
    ) -> Result<RemoteResource, RemoteError>;

    async fn update_resource(
        &self,
        container: &str,
        number: RemoteId,
        draft: &ResourceDraft,
    ) -> Result<RemoteResource, RemoteError>;

    async fn list_resources(&self, container: &str) -> Result<Vec<RemoteResource>, RemoteError>;

    async fn rate_limit(&self) -> Result<RateLimitStatus, RemoteError>;
}
