//! Reference-counted throttle queues keyed by query identity.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::{ThrottleConfig, ThrottleQueue};

struct RegistryEntry {
    /// Distinguishes a re-created queue from one removed by `clear_all`.
    generation: u64,
    queue: Arc<ThrottleQueue>,
    leases: usize,
}

/// Hands out one shared [`ThrottleQueue`] per canonical query key.
///
/// Queues are created and started on first [`acquire`](Self::acquire) and
/// cleared and dropped when their last [`QueueLease`] goes away.
pub struct QueueRegistry {
    queues: DashMap<String, RegistryEntry>,
    config: ThrottleConfig,
    next_generation: AtomicU64,
}

impl QueueRegistry {
    pub fn new(config: ThrottleConfig) -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            config,
            next_generation: AtomicU64::new(0),
        })
    }

    /// Lease the queue for `key`, creating and starting it if needed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn acquire(self: &Arc<Self>, key: &str) -> QueueLease {
        let (queue, generation) = match self.queues.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                entry.leases += 1;
                (Arc::clone(&entry.queue), entry.generation)
            }
            Entry::Vacant(entry) => {
                let queue = ThrottleQueue::new(key, self.config);
                queue.start();
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                entry.insert(RegistryEntry {
                    generation,
                    queue: Arc::clone(&queue),
                    leases: 1,
                });
                debug!(key, "throttle queue created");
                (queue, generation)
            }
        };

        QueueLease {
            registry: Arc::clone(self),
            key: key.to_string(),
            generation,
            queue,
        }
    }

    /// Number of live queues.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Outstanding leases on `key`, zero if it has no queue.
    pub fn lease_count(&self, key: &str) -> usize {
        self.queues.get(key).map_or(0, |entry| entry.leases)
    }

    /// Clear and forget every queue, regardless of outstanding leases.
    pub fn clear_all(&self) {
        let keys: Vec<String> = self.queues.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.queues.remove(&key) {
                entry.queue.clear();
            }
        }
    }

    fn release(&self, key: &str, generation: u64) {
        let removed = match self.queues.entry(key.to_string()) {
            Entry::Occupied(mut entry) if entry.get().generation == generation => {
                entry.get_mut().leases -= 1;
                if entry.get().leases == 0 {
                    Some(entry.remove())
                } else {
                    None
                }
            }
            // The queue was already dropped by `clear_all`.
            _ => None,
        };

        if let Some(entry) = removed {
            entry.queue.clear();
            debug!(key, "throttle queue released");
        }
    }
}

/// Shared handle to a registry queue; releases its reference on drop.
pub struct QueueLease {
    registry: Arc<QueueRegistry>,
    key: String,
    generation: u64,
    queue: Arc<ThrottleQueue>,
}

impl QueueLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn queue(&self) -> &Arc<ThrottleQueue> {
        &self.queue
    }
}

impl Deref for QueueLease {
    type Target = ThrottleQueue;

    fn deref(&self) -> &ThrottleQueue {
        &self.queue
    }
}

impl Drop for QueueLease {
    fn drop(&mut self) {
        self.registry.release(&self.key, self.generation);
    }
}
