//! Cache statistics and garbage collection over persisted stores.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use miette::{IntoDiagnostic, Result};
use threadsync_cache::{
    BlobStore, CacheConfig, CachePrefix, CacheRecord, CacheStore, Comment, Community, Entity,
    EntityKind, Person, Post,
};
use tracing::info;

/// Counts for one entity kind, read without modifying the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindStats {
    pub kind: EntityKind,
    pub total: usize,
    /// Entries under the selected namespace (equals `total` if none).
    pub in_namespace: usize,
    /// Entries the next cleanup pass would evict.
    pub stale: usize,
    pub oldest: Option<DateTime<Utc>>,
}

/// Entry counts of one kind before and after a gc pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcReport {
    pub kind: EntityKind,
    pub before: usize,
    pub after: usize,
}

fn read_raw<T: Entity>(blob: &dyn BlobStore) -> Result<HashMap<String, CacheRecord<T>>> {
    let key = CacheStore::<T>::blob_key();
    match blob
        .get(&key)
        .map_err(|e| miette::miette!("failed to read {}: {}", key, e))?
    {
        Some(bytes) => serde_json::from_slice(&bytes).into_diagnostic(),
        None => Ok(HashMap::new()),
    }
}

fn kind_stats<T: Entity>(
    blob: &dyn BlobStore,
    config: &CacheConfig,
    prefix: Option<&CachePrefix>,
    now: DateTime<Utc>,
) -> Result<KindStats> {
    let records = read_raw::<T>(blob)?;
    let in_namespace = match prefix {
        Some(prefix) => records.keys().filter(|k| prefix.strip(k).is_some()).count(),
        None => records.len(),
    };

    Ok(KindStats {
        kind: T::KIND,
        total: records.len(),
        in_namespace,
        stale: records
            .values()
            .filter(|r| now - r.last_used > config.max_age)
            .count(),
        oldest: records.values().map(|r| r.last_used).min(),
    })
}

/// Statistics for every entity kind.
pub fn stats(
    blob: Arc<dyn BlobStore>,
    config: CacheConfig,
    prefix: Option<&CachePrefix>,
) -> Result<Vec<KindStats>> {
    let now = Utc::now();
    let blob = blob.as_ref();
    Ok(vec![
        kind_stats::<Post>(blob, &config, prefix, now)?,
        kind_stats::<Comment>(blob, &config, prefix, now)?,
        kind_stats::<Community>(blob, &config, prefix, now)?,
        kind_stats::<Person>(blob, &config, prefix, now)?,
    ])
}

pub fn format_stats(rows: &[KindStats], prefix: Option<&CachePrefix>) -> String {
    let mut out = String::new();
    let scope = prefix.map_or("all", |p| p.as_str());
    let _ = writeln!(
        out,
        "{:<12} {:>8} {:>8} {:>8}  oldest",
        "kind",
        "total",
        scope.trim_end_matches('/'),
        "stale"
    );
    for row in rows {
        let oldest = row
            .oldest
            .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
        let _ = writeln!(
            out,
            "{:<12} {:>8} {:>8} {:>8}  {}",
            row.kind.as_str(),
            row.total,
            row.in_namespace,
            row.stale,
            oldest
        );
    }
    out
}

fn gc_kind<T: Entity>(
    blob: Arc<dyn BlobStore>,
    config: &CacheConfig,
    prefix: Option<&CachePrefix>,
    purge: bool,
) -> Result<GcReport> {
    let before = read_raw::<T>(blob.as_ref())?.len();

    // Rehydration runs the cleanup pass.
    let store = CacheStore::<T>::rehydrate(blob, config.clone())
        .map_err(|e| miette::miette!("failed to load {} cache: {}", T::KIND, e))?;

    if purge {
        match prefix {
            Some(prefix) => {
                for (natural_key, _) in store.list(prefix) {
                    store
                        .remove(&natural_key, prefix)
                        .map_err(|e| miette::miette!("failed to purge {}: {}", natural_key, e))?;
                }
            }
            None => store
                .clear()
                .map_err(|e| miette::miette!("failed to clear {} cache: {}", T::KIND, e))?,
        }
    }

    let after = store.len();
    info!(kind = %T::KIND, before, after, purge, "cache gc finished");
    Ok(GcReport {
        kind: T::KIND,
        before,
        after,
    })
}

/// Evict stale entries of every kind; with `purge`, also drop the namespace.
pub fn gc(
    blob: Arc<dyn BlobStore>,
    config: CacheConfig,
    prefix: Option<&CachePrefix>,
    purge: bool,
) -> Result<Vec<GcReport>> {
    Ok(vec![
        gc_kind::<Post>(Arc::clone(&blob), &config, prefix, purge)?,
        gc_kind::<Comment>(Arc::clone(&blob), &config, prefix, purge)?,
        gc_kind::<Community>(Arc::clone(&blob), &config, prefix, purge)?,
        gc_kind::<Person>(blob, &config, prefix, purge)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use threadsync_cache::{FileBlobStore, PostOverlay, Vote};

    fn test_post(ap_id: &str) -> Post {
        Post {
            id: 1,
            ap_id: ap_id.to_string(),
            name: "hello".to_string(),
            url: None,
            body: None,
            community_ap_id: "https://lemmy.world/c/rust".to_string(),
            creator_ap_id: "https://lemmy.world/u/ferris".to_string(),
            published: Utc::now(),
            score: 3,
            upvotes: 3,
            downvotes: 0,
            comment_count: 0,
            my_vote: Vote::Neutral,
            saved: false,
            read: false,
            deleted: false,
            hidden: false,
            optimistic: PostOverlay::default(),
        }
    }

    fn setup() -> (TempDir, Arc<dyn BlobStore>) {
        let dir = TempDir::new().unwrap();
        let blob: Arc<dyn BlobStore> = Arc::new(FileBlobStore::open(dir.path()).unwrap());
        (dir, blob)
    }

    /// Persist posts with explicit last-use times.
    fn seed_posts(blob: &dyn BlobStore, entries: &[(&CachePrefix, &str, DateTime<Utc>)]) {
        let records: HashMap<String, CacheRecord<Post>> = entries
            .iter()
            .map(|(prefix, ap_id, last_used)| {
                (
                    prefix.key(ap_id),
                    CacheRecord {
                        data: test_post(ap_id),
                        last_used: *last_used,
                    },
                )
            })
            .collect();
        blob.set(
            &CacheStore::<Post>::blob_key(),
            &serde_json::to_vec(&records).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_stats_on_empty_dir() {
        let (_dir, blob) = setup();
        let rows = stats(blob, CacheConfig::default(), None).unwrap();

        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.total == 0 && r.oldest.is_none()));
    }

    #[test]
    fn test_stats_counts_namespace_and_stale() {
        let (_dir, blob) = setup();
        let world = CachePrefix::new("lemmy.world", false);
        let ml = CachePrefix::new("lemmy.ml", true);
        let old = Utc::now() - Duration::days(30);
        seed_posts(
            blob.as_ref(),
            &[
                (&world, "https://lemmy.world/post/1", Utc::now()),
                (&world, "https://lemmy.world/post/2", old),
                (&ml, "https://lemmy.ml/post/3", Utc::now()),
            ],
        );

        let rows = stats(Arc::clone(&blob), CacheConfig::default(), Some(&world)).unwrap();
        let posts = &rows[0];
        assert_eq!(posts.kind, EntityKind::Post);
        assert_eq!(posts.total, 3);
        assert_eq!(posts.in_namespace, 2);
        assert_eq!(posts.stale, 1);
        assert_eq!(posts.oldest, Some(old));

        // Stats never evicts.
        assert_eq!(read_raw::<Post>(blob.as_ref()).unwrap().len(), 3);
    }

    #[test]
    fn test_gc_evicts_stale_entries() {
        let (_dir, blob) = setup();
        let world = CachePrefix::new("lemmy.world", false);
        seed_posts(
            blob.as_ref(),
            &[
                (&world, "https://lemmy.world/post/1", Utc::now()),
                (&world, "https://lemmy.world/post/2", Utc::now() - Duration::days(8)),
            ],
        );

        let reports = gc(Arc::clone(&blob), CacheConfig::default(), None, false).unwrap();

        assert_eq!(
            reports[0],
            GcReport {
                kind: EntityKind::Post,
                before: 2,
                after: 1
            }
        );
        assert_eq!(read_raw::<Post>(blob.as_ref()).unwrap().len(), 1);
    }

    #[test]
    fn test_gc_purge_only_touches_selected_namespace() {
        let (_dir, blob) = setup();
        let anon = CachePrefix::new("lemmy.world", false);
        let authed = CachePrefix::new("lemmy.world", true);
        seed_posts(
            blob.as_ref(),
            &[
                (&anon, "https://lemmy.world/post/1", Utc::now()),
                (&authed, "https://lemmy.world/post/1", Utc::now()),
            ],
        );

        let reports = gc(Arc::clone(&blob), CacheConfig::default(), Some(&authed), true).unwrap();

        assert_eq!(reports[0].after, 1);
        let remaining = read_raw::<Post>(blob.as_ref()).unwrap();
        assert!(remaining.contains_key(&anon.key("https://lemmy.world/post/1")));
    }

    #[test]
    fn test_gc_purge_without_instance_clears_everything() {
        let (_dir, blob) = setup();
        let anon = CachePrefix::new("lemmy.world", false);
        seed_posts(blob.as_ref(), &[(&anon, "https://lemmy.world/post/1", Utc::now())]);

        let reports = gc(Arc::clone(&blob), CacheConfig::default(), None, true).unwrap();

        assert!(reports.iter().all(|r| r.after == 0));
    }

    #[test]
    fn test_format_stats_has_row_per_kind() {
        let rows = vec![KindStats {
            kind: EntityKind::Comment,
            total: 5,
            in_namespace: 5,
            stale: 0,
            oldest: None,
        }];
        let out = format_stats(&rows, None);

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("kind"));
        assert!(lines[1].starts_with("comments"));
        assert!(lines[1].ends_with('-'));
    }
}
