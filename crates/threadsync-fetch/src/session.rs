//! Per-login fetch state shared by every paginated view.

use std::sync::Arc;

use dashmap::DashSet;
use tracing::info;

use crate::{QueueLease, QueueRegistry, ThrottleConfig};

/// Session-scoped fetch context.
///
/// Holds the queries that have already been fetched once (warm keys) and
/// the registry of throttle queues. Create one per login session and call
/// [`end`](Self::end) on logout or instance switch.
pub struct FetchSession {
    warm_keys: DashSet<String>,
    registry: Arc<QueueRegistry>,
    config: ThrottleConfig,
}

impl FetchSession {
    pub fn new(config: ThrottleConfig) -> Arc<Self> {
        Arc::new(Self {
            warm_keys: DashSet::new(),
            registry: QueueRegistry::new(config),
            config,
        })
    }

    pub fn config(&self) -> ThrottleConfig {
        self.config
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    /// Lease the throttle queue for a canonical query key.
    pub fn lease(&self, key: &str) -> QueueLease {
        self.registry.acquire(key)
    }

    pub fn is_warm(&self, key: &str) -> bool {
        self.warm_keys.contains(key)
    }

    /// Record that `key` has been fetched in this session.
    ///
    /// Returns `true` if it was cold before.
    pub fn mark_warm(&self, key: &str) -> bool {
        self.warm_keys.insert(key.to_string())
    }

    /// Forget one key so the next automatic refetch runs again.
    pub fn invalidate(&self, key: &str) -> bool {
        self.warm_keys.remove(key).is_some()
    }

    pub fn warm_count(&self) -> usize {
        self.warm_keys.len()
    }

    /// Cancel all queued work and forget every warm key.
    pub fn end(&self) {
        let queues = self.registry.len();
        let warm = self.warm_keys.len();
        self.registry.clear_all();
        self.warm_keys.clear();
        info!(queues, warm, "fetch session ended");
    }
}
