//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use trellis_engine::{RemoteId, RemoteResource};
use trellis_sync::{
    LockManager, RateLimitStatus, RemoteClient, RemoteError, ResilienceConfig, ResilienceLayer,
    ResourceDraft, StoreConfig, SyncStateStore,
};

pub const CONTAINER: &str = "acme/app";

/// In-memory remote tracker with scripted failures.
#[derive(Default)]
pub struct MockRemote {
    resources: Mutex<BTreeMap<RemoteId, RemoteResource>>,
    failures: Mutex<VecDeque<RemoteError>>,
    rate_limit: Mutex<Option<RateLimitStatus>>,
    calls: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, resource: RemoteResource) {
        self.resources
            .lock()
            .unwrap()
            .insert(resource.number, resource);
    }

    /// Fail the next calls with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn set_rate_limit(&self, status: RateLimitStatus) {
        *self.rate_limit.lock().unwrap() = Some(status);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn not_found(number: RemoteId) -> RemoteError {
        RemoteError::Status {
            status: 404,
            message: format!("issue {number} not found"),
        }
    }
}

fn apply(resource: &mut RemoteResource, draft: &ResourceDraft) {
    resource.title = draft.title.clone();
    resource.body = draft.body.clone();
    resource.state = draft.state.clone();
    resource.labels = draft.labels.clone();
}

#[async_trait]
impl RemoteClient for MockRemote {
    async fn get_resource(
        &self,
        _container: &str,
        number: RemoteId,
    ) -> Result<RemoteResource, RemoteError> {
        self.begin()?;
        self.resources
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or_else(|| Self::not_found(number))
    }

    async fn create_resource(
        &self,
        _container: &str,
        draft: &ResourceDraft,
    ) -> Result<RemoteResource, RemoteError> {
        self.begin()?;
        let mut resources = self.resources.lock().unwrap();
        let number = resources.keys().next_back().map_or(1, |n| n + 1);
        let mut resource = RemoteResource::new(number, "", "open", trellis_sync::now_millis());
        apply(&mut resource, draft);
        resources.insert(number, resource.clone());
        Ok(resource)
    }

    async fn update_resource(
        &self,
        _container: &str,
        number: RemoteId,
        draft: &ResourceDraft,
    ) -> Result<RemoteResource, RemoteError> {
        self.begin()?;
        let mut resources = self.resources.lock().unwrap();
        let resource = resources
            .get_mut(&number)
            .ok_or_else(|| Self::not_found(number))?;
        apply(resource, draft);
        resource.updated_at = trellis_sync::now_millis();
        Ok(resource.clone())
    }

    async fn list_resources(&self, _container: &str) -> Result<Vec<RemoteResource>, RemoteError> {
        self.begin()?;
        Ok(self.resources.lock().unwrap().values().cloned().collect())
    }

    async fn rate_limit(&self) -> Result<RateLimitStatus, RemoteError> {
        self.begin()?;
        Ok(self.rate_limit.lock().unwrap().unwrap_or(RateLimitStatus {
            limit: 5000,
            remaining: 5000,
            reset_at: 0,
        }))
    }
}

pub fn store_config(dir: &Path) -> StoreConfig {
    StoreConfig::new(dir, CONTAINER)
}

pub fn store(dir: &Path) -> Arc<SyncStateStore> {
    Arc::new(SyncStateStore::new(
        store_config(dir),
        LockManager::new_shared(),
    ))
}

/// Millisecond-scale delays so retries do not slow the suite down.
pub fn fast_resilience() -> Arc<ResilienceLayer> {
    Arc::new(ResilienceLayer::new(ResilienceConfig {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        min_rate_limit_wait: Duration::from_millis(1),
        max_rate_limit_wait: Duration::from_millis(5),
        batch_delay: Duration::ZERO,
        ..ResilienceConfig::default()
    }))
}
