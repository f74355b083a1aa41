//! Generic entity cache with optimistic overlays.
//!
//! One [`CacheStore`] exists per entity kind. Writers are serialized behind
//! a single lock whose critical sections never suspend; readers take an
//! `Arc` snapshot of the map, so they observe either the state before or
//! after a mutation (including a cleanup pass), never a partial one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::lock::{rw_read, rw_write};
use crate::{BlobStore, CacheError, CachePrefix, Entity, Overlay};

/// Entries not touched for this long are evicted by cleanup (7 days).
pub const MAX_CACHE_AGE_SECS: i64 = 7 * 24 * 60 * 60;

/// Broadcast channel capacity for cache events.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Cache store settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum age since last use before an entry is evicted.
    pub max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::seconds(MAX_CACHE_AGE_SECS),
        }
    }
}

/// A cached entity with its last-use timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: Entity")]
pub struct CacheRecord<T> {
    pub data: T,
    pub last_used: DateTime<Utc>,
}

/// Change notification for store subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// An entity was written from authoritative data.
    Upserted { key: String },
    /// An existing entity was patched in place.
    Patched { key: String },
    /// An entity was removed.
    Removed { key: String },
    /// A cleanup pass evicted stale entries.
    Evicted { count: usize },
}

type RecordMap<T> = HashMap<String, CacheRecord<T>>;

/// Cache of one entity kind, keyed by prefixed natural key.
pub struct CacheStore<T: Entity> {
    records: RwLock<Arc<RecordMap<T>>>,
    blob: Arc<dyn BlobStore>,
    blob_key: String,
    config: CacheConfig,
    updates_tx: broadcast::Sender<CacheEvent>,
}

impl<T: Entity> CacheStore<T> {
    /// Create an empty store persisting into `blob`.
    pub fn new(blob: Arc<dyn BlobStore>, config: CacheConfig) -> Arc<Self> {
        Arc::new(Self::with_records(blob, config, RecordMap::new()))
    }

    /// Load the persisted map from `blob`, then run a cleanup pass.
    ///
    /// A missing blob yields an empty store.
    pub fn rehydrate(blob: Arc<dyn BlobStore>, config: CacheConfig) -> Result<Arc<Self>, CacheError> {
        let blob_key = Self::blob_key();
        let records: RecordMap<T> = match blob.get(&blob_key)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => RecordMap::new(),
        };
        let loaded = records.len();

        let store = Arc::new(Self::with_records(blob, config, records));
        let surviving = store.cleanup()?;

        info!(
            kind = %T::KIND,
            loaded,
            surviving = surviving.len(),
            "cache store rehydrated"
        );
        Ok(store)
    }

    fn with_records(blob: Arc<dyn BlobStore>, config: CacheConfig, records: RecordMap<T>) -> Self {
        let (updates_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            records: RwLock::new(Arc::new(records)),
            blob,
            blob_key: Self::blob_key(),
            config,
            updates_tx,
        }
    }

    /// Key under which this kind's map is persisted.
    pub fn blob_key() -> String {
        format!("cache.{}", T::KIND.as_str())
    }

    /// Subscribe to store changes.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.updates_tx.subscribe()
    }

    fn broadcast(&self, event: CacheEvent) {
        if self.updates_tx.send(event).is_err() {
            trace!("no subscribers for cache event");
        }
    }

    /// Current map, shared with concurrent readers.
    pub fn snapshot(&self) -> Arc<RecordMap<T>> {
        Arc::clone(&*rw_read(&self.records, "snapshot"))
    }

    /// Get an entity by natural key.
    pub fn get(&self, natural_key: &str, prefix: &CachePrefix) -> Option<T> {
        self.get_record(natural_key, prefix).map(|r| r.data)
    }

    /// Get an entity together with its last-use timestamp.
    pub fn get_record(&self, natural_key: &str, prefix: &CachePrefix) -> Option<CacheRecord<T>> {
        rw_read(&self.records, "get")
            .get(&prefix.key(natural_key))
            .cloned()
    }

    /// All entities in one namespace, keyed by natural key.
    pub fn list(&self, prefix: &CachePrefix) -> Vec<(String, T)> {
        let snapshot = self.snapshot();
        snapshot
            .iter()
            .filter_map(|(key, record)| {
                prefix
                    .strip(key)
                    .map(|natural| (natural.to_string(), record.data.clone()))
            })
            .collect()
    }

    /// Number of cached entities across all namespaces.
    pub fn len(&self) -> usize {
        rw_read(&self.records, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or update one entity from authoritative data.
    pub fn cache_one(&self, prefix: &CachePrefix, entity: T) -> Result<(), CacheError> {
        self.cache_many(prefix, std::iter::once(entity))
    }

    /// Insert or update entities from authoritative data.
    ///
    /// Incoming fields win, except optimistic overlay fields that the
    /// incoming entity leaves unset: those survive from the previous record
    /// so an in-flight action is not clobbered by a background refresh.
    pub fn cache_many(
        &self,
        prefix: &CachePrefix,
        entities: impl IntoIterator<Item = T>,
    ) -> Result<(), CacheError> {
        let now = Utc::now();
        let mut guard = rw_write(&self.records, "cache_many");
        let records = Arc::make_mut(&mut *guard);

        let mut keys = Vec::new();
        for mut entity in entities {
            let key = prefix.key(entity.natural_key());
            if let Some(previous) = records.get(&key) {
                entity.overlay_mut().carry_over(previous.data.overlay());
            }
            records.insert(
                key.clone(),
                CacheRecord {
                    data: entity,
                    last_used: now,
                },
            );
            keys.push(key);
        }

        if keys.is_empty() {
            return Ok(());
        }
        self.persist(records)?;
        drop(guard);

        for key in keys {
            trace!(kind = %T::KIND, key = %key, "cache: entity upserted");
            self.broadcast(CacheEvent::Upserted { key });
        }
        Ok(())
    }

    /// Apply `update` to an existing entity.
    ///
    /// Returns `Ok(false)` and logs a diagnostic when the key is not cached;
    /// patching an absent entry is a caller bug but must not disturb the UI.
    pub fn patch(
        &self,
        natural_key: &str,
        prefix: &CachePrefix,
        update: impl FnOnce(&mut T),
    ) -> Result<bool, CacheError> {
        let key = prefix.key(natural_key);
        let mut guard = rw_write(&self.records, "patch");

        if !guard.contains_key(&key) {
            warn!(kind = %T::KIND, key = %key, "patch on missing cache entry ignored");
            return Ok(false);
        }

        let records = Arc::make_mut(&mut *guard);
        if let Some(record) = records.get_mut(&key) {
            update(&mut record.data);
            record.last_used = Utc::now();
        }
        self.persist(records)?;
        drop(guard);

        trace!(kind = %T::KIND, key = %key, "cache: entity patched");
        self.broadcast(CacheEvent::Patched { key });
        Ok(true)
    }

    /// Set or clear optimistic fields of an existing entity.
    pub fn patch_overlay(
        &self,
        natural_key: &str,
        prefix: &CachePrefix,
        update: impl FnOnce(&mut T::Overlay),
    ) -> Result<bool, CacheError> {
        self.patch(natural_key, prefix, |entity| update(entity.overlay_mut()))
    }

    /// Remove an entity, e.g. after the backend reports it gone.
    pub fn remove(&self, natural_key: &str, prefix: &CachePrefix) -> Result<bool, CacheError> {
        let key = prefix.key(natural_key);
        let mut guard = rw_write(&self.records, "remove");

        if !guard.contains_key(&key) {
            return Ok(false);
        }

        let records = Arc::make_mut(&mut *guard);
        records.remove(&key);
        self.persist(records)?;
        drop(guard);

        trace!(kind = %T::KIND, key = %key, "cache: entity removed");
        self.broadcast(CacheEvent::Removed { key });
        Ok(true)
    }

    /// Evict entries unused for longer than the configured maximum age.
    ///
    /// Returns the surviving map.
    pub fn cleanup(&self) -> Result<Arc<RecordMap<T>>, CacheError> {
        self.cleanup_at(Utc::now())
    }

    /// [`cleanup`](Self::cleanup) against an explicit clock reading.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> Result<Arc<RecordMap<T>>, CacheError> {
        let mut guard = rw_write(&self.records, "cleanup");

        let survivors: RecordMap<T> = guard
            .iter()
            .filter(|(_, record)| now - record.last_used <= self.config.max_age)
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect();
        let evicted = guard.len() - survivors.len();

        if evicted == 0 {
            return Ok(Arc::clone(&*guard));
        }

        // Swap in a fresh map: readers holding the old snapshot keep it intact.
        *guard = Arc::new(survivors);
        self.persist(&guard)?;
        let surviving = Arc::clone(&*guard);
        drop(guard);

        debug!(kind = %T::KIND, evicted, remaining = surviving.len(), "cache: stale entries evicted");
        self.broadcast(CacheEvent::Evicted { count: evicted });
        Ok(surviving)
    }

    /// Drop every entry (e.g. on logout) and persist the empty map.
    pub fn clear(&self) -> Result<(), CacheError> {
        let mut guard = rw_write(&self.records, "clear");
        let count = guard.len();
        *guard = Arc::new(RecordMap::new());
        self.persist(&guard)?;
        drop(guard);

        if count > 0 {
            self.broadcast(CacheEvent::Evicted { count });
        }
        Ok(())
    }

    fn persist(&self, records: &RecordMap<T>) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(records)?;
        self.blob.set(&self.blob_key, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryBlobStore, Post, PostOverlay, Vote};
    use pretty_assertions::assert_eq;

    fn test_post(ap_id: &str) -> Post {
        Post {
            id: 7,
            ap_id: ap_id.to_string(),
            name: "A post".to_string(),
            url: None,
            body: Some("body".to_string()),
            community_ap_id: "https://lemmy.world/c/rust".to_string(),
            creator_ap_id: "https://lemmy.world/u/ferris".to_string(),
            published: Utc::now(),
            score: 3,
            upvotes: 3,
            downvotes: 0,
            comment_count: 2,
            my_vote: Vote::Neutral,
            saved: false,
            read: false,
            deleted: false,
            hidden: false,
            optimistic: PostOverlay::default(),
        }
    }

    fn test_store() -> (Arc<MemoryBlobStore>, Arc<CacheStore<Post>>) {
        let blob = Arc::new(MemoryBlobStore::new());
        let store = CacheStore::<Post>::new(blob.clone(), CacheConfig::default());
        (blob, store)
    }

    fn prefix() -> CachePrefix {
        CachePrefix::new("lemmy.world", true)
    }

    const URI: &str = "https://lemmy.world/post/7";

    #[test]
    fn test_cache_one_and_get() {
        let (_, store) = test_store();
        store.cache_one(&prefix(), test_post(URI)).unwrap();

        assert_eq!(store.len(), 1);
        let post = store.get(URI, &prefix()).unwrap();
        assert_eq!(post.name, "A post");
    }

    #[test]
    fn test_incoming_data_wins() {
        let (_, store) = test_store();
        store.cache_one(&prefix(), test_post(URI)).unwrap();

        let mut updated = test_post(URI);
        updated.score = 42;
        updated.name = "Edited".to_string();
        store.cache_one(&prefix(), updated).unwrap();

        let post = store.get(URI, &prefix()).unwrap();
        assert_eq!(post.score, 42);
        assert_eq!(post.name, "Edited");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_pending_overlay_survives_refresh() {
        let (_, store) = test_store();
        let mut first = test_post(URI);
        first.optimistic.my_vote = Some(Vote::Up);
        store.cache_one(&prefix(), first).unwrap();

        // Background refresh carries no overlay.
        store.cache_one(&prefix(), test_post(URI)).unwrap();

        let post = store.get(URI, &prefix()).unwrap();
        assert_eq!(post.optimistic.my_vote, Some(Vote::Up));
        assert_eq!(post.effective_vote(), Vote::Up);
    }

    #[test]
    fn test_incoming_overlay_field_overrides_previous() {
        let (_, store) = test_store();
        let mut first = test_post(URI);
        first.optimistic.saved = Some(true);
        first.optimistic.read = Some(true);
        store.cache_one(&prefix(), first).unwrap();

        let mut second = test_post(URI);
        second.optimistic.saved = Some(false);
        store.cache_one(&prefix(), second).unwrap();

        let post = store.get(URI, &prefix()).unwrap();
        assert_eq!(post.optimistic.saved, Some(false));
        assert_eq!(post.optimistic.read, Some(true));
    }

    #[test]
    fn test_patch_sets_and_clears_overlay() {
        let (_, store) = test_store();
        store.cache_one(&prefix(), test_post(URI)).unwrap();

        let patched = store
            .patch_overlay(URI, &prefix(), |o| o.saved = Some(true))
            .unwrap();
        assert!(patched);
        assert!(store.get(URI, &prefix()).unwrap().effective_saved());

        store
            .patch_overlay(URI, &prefix(), |o| o.saved = None)
            .unwrap();
        let post = store.get(URI, &prefix()).unwrap();
        assert!(post.optimistic.is_empty());
        assert!(!post.effective_saved());
    }

    #[test]
    fn test_patch_missing_key_is_noop() {
        let (blob, store) = test_store();

        let patched = store
            .patch(URI, &prefix(), |p| p.score = 1000)
            .unwrap();

        assert!(!patched);
        assert!(store.is_empty());
        assert!(blob.is_empty(), "no-op patch must not persist");
    }

    #[test]
    fn test_prefixes_do_not_alias() {
        let (_, store) = test_store();
        let anon = CachePrefix::new("lemmy.world", false);
        let other = CachePrefix::new("lemmy.ml", true);

        store.cache_one(&prefix(), test_post(URI)).unwrap();

        assert!(store.get(URI, &anon).is_none());
        assert!(store.get(URI, &other).is_none());
        assert_eq!(store.list(&prefix()).len(), 1);
        assert!(store.list(&anon).is_empty());
    }

    #[test]
    fn test_cleanup_evicts_only_stale_entries() {
        let (_, store) = test_store();
        store.cache_one(&prefix(), test_post(URI)).unwrap();
        let last_used = store.get_record(URI, &prefix()).unwrap().last_used;
        let max_age = CacheConfig::default().max_age;

        // Exactly at the limit: retained.
        let surviving = store.cleanup_at(last_used + max_age).unwrap();
        assert_eq!(surviving.len(), 1);

        // One millisecond past the limit: evicted.
        let surviving = store
            .cleanup_at(last_used + max_age + Duration::milliseconds(1))
            .unwrap();
        assert!(surviving.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let (_, store) = test_store();
        store.cache_one(&prefix(), test_post(URI)).unwrap();
        store
            .cache_one(&prefix(), test_post("https://lemmy.world/post/8"))
            .unwrap();

        let first = store.cleanup().unwrap();
        let second = store.cleanup().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn test_snapshot_unaffected_by_cleanup() {
        let (_, store) = test_store();
        store.cache_one(&prefix(), test_post(URI)).unwrap();

        let before = store.snapshot();
        store
            .cleanup_at(Utc::now() + Duration::days(30))
            .unwrap();

        assert_eq!(before.len(), 1);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_rehydrate_restores_and_evicts() {
        let blob = Arc::new(MemoryBlobStore::new());
        let mut records = RecordMap::new();
        let fresh = prefix().key(URI);
        let stale = prefix().key("https://lemmy.world/post/old");
        records.insert(
            fresh.clone(),
            CacheRecord {
                data: test_post(URI),
                last_used: Utc::now(),
            },
        );
        records.insert(
            stale,
            CacheRecord {
                data: test_post("https://lemmy.world/post/old"),
                last_used: Utc::now() - Duration::days(8),
            },
        );
        blob.set("cache.posts", &serde_json::to_vec(&records).unwrap())
            .unwrap();

        let store = CacheStore::<Post>::rehydrate(blob.clone(), CacheConfig::default()).unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.get(URI, &prefix()).is_some());

        // The eviction was persisted as well.
        let persisted: RecordMap<Post> =
            serde_json::from_slice(&blob.get("cache.posts").unwrap().unwrap()).unwrap();
        assert_eq!(persisted.len(), 1);
        assert!(persisted.contains_key(&fresh));
    }

    #[test]
    fn test_rehydrate_empty_blob_store() {
        let blob = Arc::new(MemoryBlobStore::new());
        let store = CacheStore::<Post>::rehydrate(blob, CacheConfig::default()).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove() {
        let (_, store) = test_store();
        store.cache_one(&prefix(), test_post(URI)).unwrap();

        assert!(store.remove(URI, &prefix()).unwrap());
        assert!(!store.remove(URI, &prefix()).unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_subscribe_events() {
        let (_, store) = test_store();
        let mut rx = store.subscribe();

        store.cache_one(&prefix(), test_post(URI)).unwrap();
        store
            .patch_overlay(URI, &prefix(), |o| o.hidden = Some(true))
            .unwrap();
        store.remove(URI, &prefix()).unwrap();

        let key = prefix().key(URI);
        assert_eq!(rx.try_recv().unwrap(), CacheEvent::Upserted { key: key.clone() });
        assert_eq!(rx.try_recv().unwrap(), CacheEvent::Patched { key: key.clone() });
        assert_eq!(rx.try_recv().unwrap(), CacheEvent::Removed { key });
    }

    #[test]
    fn test_every_mutation_persists() {
        let (blob, store) = test_store();
        store.cache_one(&prefix(), test_post(URI)).unwrap();

        let persisted: RecordMap<Post> =
            serde_json::from_slice(&blob.get("cache.posts").unwrap().unwrap()).unwrap();
        assert_eq!(persisted.len(), 1);

        store
            .patch_overlay(URI, &prefix(), |o| o.my_vote = Some(Vote::Down))
            .unwrap();
        let persisted: RecordMap<Post> =
            serde_json::from_slice(&blob.get("cache.posts").unwrap().unwrap()).unwrap();
        let record = persisted.get(&prefix().key(URI)).unwrap();
        assert_eq!(record.data.optimistic.my_vote, Some(Vote::Down));
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        use std::thread;

        let (_, store) = test_store();
        let mut handles = Vec::new();

        for i in 0..4 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for j in 0..25 {
                    let uri = format!("https://lemmy.world/post/{}_{}", i, j);
                    store.cache_one(&prefix(), test_post(&uri)).unwrap();
                }
            }));
        }
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for _ in 0..25 {
                    let snapshot = store.snapshot();
                    let _ = snapshot.len();
                    let _ = store.cleanup().unwrap();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 100);
    }
}
