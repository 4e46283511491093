use dashmap::DashSet;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::index::IndexRef;
use crate::error::ApiError;

pub type RefreshFuture = BoxFuture<'static, Result<Value, ApiError>>;

/// Produces a fresh value for a cache entry in the background.
pub type RefreshCallback = Arc<dyn Fn() -> RefreshFuture + Send + Sync>;

/// Wraps a closure returning a future into a [`RefreshCallback`].
pub fn refresh_with<F, Fut>(f: F) -> RefreshCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, ApiError>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as RefreshFuture)
}

/// Bounds background refreshes and keeps at most one per `(scope, key)`.
#[derive(Debug)]
pub(crate) struct RefreshCoordinator {
    permits: Arc<Semaphore>,
    in_flight: Arc<DashSet<IndexRef>>,
}

/// Held for the lifetime of one refresh; frees the slot on drop.
#[derive(Debug)]
pub(crate) struct RefreshGuard {
    in_flight: Arc<DashSet<IndexRef>>,
    target: IndexRef,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.target);
    }
}

impl RefreshCoordinator {
    pub(crate) fn new(max_in_flight: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            in_flight: Arc::new(DashSet::new()),
        }
    }

    /// `None` when a refresh for `target` is already running.
    pub(crate) fn begin(&self, target: IndexRef) -> Option<RefreshGuard> {
        if !self.in_flight.insert(target.clone()) {
            return None;
        }
        Some(RefreshGuard {
            in_flight: Arc::clone(&self.in_flight),
            target,
        })
    }

    pub(crate) fn permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.permits)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
