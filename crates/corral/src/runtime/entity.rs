//! Copy-on-write snapshot cache, one instance per entity kind.
//!
//! Readers load the current snapshot through an `ArcSwap` and never block;
//! writers rebuild under a short mutex and publish by swapping. A second
//! snapshot tracks last-known items per spec so listings survive server
//! downtime.

use super::items::EntityItem;
use crate::catalog::SpecKey;
use crate::hash::ContentHash;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

const SUBSCRIBER_CAPACITY: usize = 1;

/// Content-addressed hash of a canonical snapshot serialization.
pub type ETag = ContentHash;

/// Pre-indexed per-server sub-slice of a snapshot.
#[derive(Debug, Clone)]
pub struct ServerSlice<T> {
    pub items: Arc<Vec<T>>,
    pub etag: ETag,
}

/// An immutable, globally sorted listing with its ETag.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub items: Arc<Vec<T>>,
    pub etag: ETag,
    by_server: HashMap<String, ServerSlice<T>>,
}

impl<T: EntityItem> Snapshot<T> {
    pub fn empty() -> Self {
        Self::build(Vec::new())
    }

    /// Canonical order is (spec key, item key); the ETag hashes the sorted
    /// items, so equal contents hash equally everywhere.
    pub fn build(mut items: Vec<T>) -> Self {
        items.sort_by(|a, b| {
            (a.spec_key(), a.item_key()).cmp(&(b.spec_key(), b.item_key()))
        });
        let etag = ContentHash::of_canonical(&items);

        let mut grouped: HashMap<String, Vec<T>> = HashMap::new();
        for item in &items {
            grouped
                .entry(item.server_name().to_string())
                .or_default()
                .push(item.clone());
        }
        let by_server = grouped
            .into_iter()
            .map(|(server, items)| {
                let etag = ContentHash::of_canonical(&items);
                (server, ServerSlice { items: Arc::new(items), etag })
            })
            .collect();

        Self {
            items: Arc::new(items),
            etag,
            by_server,
        }
    }

    pub fn for_server(&self, server: &str) -> Option<&ServerSlice<T>> {
        self.by_server.get(server)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Where a merged-catalog entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrySource {
    Live,
    Cache,
}

/// One row of the merged live/cache view.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry<T> {
    #[serde(flatten)]
    pub entry: T,
    pub source: EntrySource,
    /// Unix seconds of the last successful listing for this spec.
    pub cached_at: u64,
}

struct CachedPart<T> {
    items: Arc<Vec<T>>,
    cached_at: u64,
}

struct CacheInner<T> {
    live_parts: BTreeMap<SpecKey, Arc<Vec<T>>>,
    cached_parts: BTreeMap<SpecKey, CachedPart<T>>,
}

/// Snapshot cache for one entity kind.
pub struct EntityCache<T: EntityItem> {
    live: ArcSwap<Snapshot<T>>,
    cached: ArcSwap<Snapshot<T>>,
    inner: Mutex<CacheInner<T>>,
    subs: Mutex<Vec<mpsc::Sender<ETag>>>,
}

impl<T: EntityItem> EntityCache<T> {
    pub fn new() -> Self {
        Self {
            live: ArcSwap::from_pointee(Snapshot::empty()),
            cached: ArcSwap::from_pointee(Snapshot::empty()),
            inner: Mutex::new(CacheInner {
                live_parts: BTreeMap::new(),
                cached_parts: BTreeMap::new(),
            }),
            subs: Mutex::new(Vec::new()),
        }
    }

    /// Currently-live items only.
    pub fn snapshot(&self) -> Arc<Snapshot<T>> {
        self.live.load_full()
    }

    /// Last-known items, surviving server downtime.
    pub fn cached_snapshot(&self) -> Arc<Snapshot<T>> {
        self.cached.load_full()
    }

    pub fn snapshot_for_server(&self, server: &str) -> Option<ServerSlice<T>> {
        self.live.load().for_server(server).cloned()
    }

    /// Record a successful listing for one spec and publish.
    pub fn set_spec_items(&self, spec_key: SpecKey, items: Vec<T>) {
        let items = Arc::new(items);
        {
            let mut inner = self.inner.lock();
            inner.live_parts.insert(spec_key, Arc::clone(&items));
            inner.cached_parts.insert(
                spec_key,
                CachedPart {
                    items,
                    cached_at: unix_now(),
                },
            );
            self.publish_locked(&inner);
        }
        self.notify();
    }

    /// Drop a spec from the live view, keeping its cached part.
    pub fn mark_spec_down(&self, spec_key: SpecKey) {
        let changed = {
            let mut inner = self.inner.lock();
            let changed = inner.live_parts.remove(&spec_key).is_some();
            if changed {
                self.publish_locked(&inner);
            }
            changed
        };
        if changed {
            self.notify();
        }
    }

    /// Keep only the given specs; everything else leaves both views. Used on
    /// catalog swaps.
    pub fn retain_specs(&self, keep: &BTreeSet<SpecKey>) {
        let changed = {
            let mut inner = self.inner.lock();
            let before = inner.live_parts.len() + inner.cached_parts.len();
            inner.live_parts.retain(|key, _| keep.contains(key));
            inner.cached_parts.retain(|key, _| keep.contains(key));
            let changed = before != inner.live_parts.len() + inner.cached_parts.len();
            if changed {
                self.publish_locked(&inner);
            }
            changed
        };
        if changed {
            self.notify();
        }
    }

    /// Merged live/cache view, each row tagged with its source.
    pub fn catalog_view(&self) -> Vec<CatalogEntry<T>> {
        let inner = self.inner.lock();
        let mut rows = Vec::new();
        for (spec_key, part) in &inner.cached_parts {
            let source = if inner.live_parts.contains_key(spec_key) {
                EntrySource::Live
            } else {
                EntrySource::Cache
            };
            for item in part.items.iter() {
                rows.push(CatalogEntry {
                    entry: item.clone(),
                    source,
                    cached_at: part.cached_at,
                });
            }
        }
        rows.sort_by(|a, b| {
            (a.entry.spec_key(), a.entry.item_key()).cmp(&(b.entry.spec_key(), b.entry.item_key()))
        });
        rows
    }

    /// Wake-up stream: receives the new ETag whenever the live snapshot
    /// changes. Capacity 1; treat receipt as an edge and read `snapshot()`.
    pub fn subscribe(&self) -> mpsc::Receiver<ETag> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let _ = tx.try_send(self.live.load().etag);
        self.subs.lock().push(tx);
        rx
    }

    /// Map an item key to its target, in canonical order when names collide
    /// across servers.
    pub fn resolve(&self, key: &str) -> Option<(SpecKey, String)> {
        self.live
            .load()
            .items
            .iter()
            .find(|item| item.item_key() == key)
            .map(|item| (item.spec_key(), item.server_name().to_string()))
    }

    pub fn resolve_for_server(&self, server: &str, key: &str) -> Option<(SpecKey, String)> {
        let snapshot = self.live.load();
        let slice = snapshot.for_server(server)?;
        slice
            .items
            .iter()
            .find(|item| item.item_key() == key)
            .map(|item| (item.spec_key(), item.server_name().to_string()))
    }

    fn publish_locked(&self, inner: &CacheInner<T>) {
        let live_items: Vec<T> = inner
            .live_parts
            .values()
            .flat_map(|part| part.iter().cloned())
            .collect();
        self.live.store(Arc::new(Snapshot::build(live_items)));

        let cached_items: Vec<T> = inner
            .cached_parts
            .values()
            .flat_map(|part| part.items.iter().cloned())
            .collect();
        self.cached.store(Arc::new(Snapshot::build(cached_items)));
    }

    fn notify(&self) {
        let etag = self.live.load().etag;
        self.subs.lock().retain(|sub| match sub.try_send(etag) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

impl<T: EntityItem> Default for EntityCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::items::ToolEntry;
    use serde_json::json;

    fn entry(spec: &str, server: &str, name: &str) -> ToolEntry {
        ToolEntry {
            spec_key: ContentHash::of_bytes(spec.as_bytes()),
            server_name: server.into(),
            name: name.into(),
            description: None,
            input_schema: json!({"type": "object"}),
            output_schema: None,
        }
    }

    #[test]
    fn snapshot_sorts_and_hashes_deterministically() {
        let a = Snapshot::build(vec![entry("s1", "git", "b"), entry("s1", "git", "a")]);
        let b = Snapshot::build(vec![entry("s1", "git", "a"), entry("s1", "git", "b")]);
        assert_eq!(a.etag, b.etag);
        assert_eq!(a.items[0].name, "a");
    }

    #[test]
    fn per_server_slices_have_their_own_etags() {
        let snapshot = Snapshot::build(vec![
            entry("s1", "git", "status"),
            entry("s2", "docker", "ps"),
        ]);
        let git = snapshot.for_server("git").unwrap();
        let docker = snapshot.for_server("docker").unwrap();
        assert_eq!(git.items.len(), 1);
        assert_ne!(git.etag, docker.etag);
        assert!(snapshot.for_server("nope").is_none());
    }

    #[test]
    fn live_and_cached_views_diverge_on_downtime() {
        let cache: EntityCache<ToolEntry> = EntityCache::new();
        let key = ContentHash::of_bytes(b"s1");
        cache.set_spec_items(key, vec![entry("s1", "git", "status")]);
        assert_eq!(cache.snapshot().items.len(), 1);

        cache.mark_spec_down(key);
        assert!(cache.snapshot().is_empty());
        assert_eq!(cache.cached_snapshot().items.len(), 1);

        let view = cache.catalog_view();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].source, EntrySource::Cache);
        assert!(view[0].cached_at > 0);
    }

    #[test]
    fn retain_specs_drops_removed_servers_everywhere() {
        let cache: EntityCache<ToolEntry> = EntityCache::new();
        let keep = ContentHash::of_bytes(b"s1");
        let drop_key = ContentHash::of_bytes(b"s2");
        cache.set_spec_items(keep, vec![entry("s1", "git", "status")]);
        cache.set_spec_items(drop_key, vec![entry("s2", "docker", "ps")]);

        cache.retain_specs(&BTreeSet::from([keep]));
        assert_eq!(cache.snapshot().items.len(), 1);
        assert_eq!(cache.cached_snapshot().items.len(), 1);
        assert!(cache.resolve("ps").is_none());
    }

    #[test]
    fn resolve_prefers_canonical_order_on_collision() {
        let cache: EntityCache<ToolEntry> = EntityCache::new();
        let s1 = ContentHash::of_bytes(b"s1");
        let s2 = ContentHash::of_bytes(b"s2");
        cache.set_spec_items(s1, vec![entry("s1", "git", "status")]);
        cache.set_spec_items(s2, vec![entry("s2", "hub", "status")]);

        let (resolved, _) = cache.resolve("status").unwrap();
        let first = cache.snapshot().items[0].clone();
        assert_eq!(resolved, first.spec_key);

        let (pinned, server) = cache.resolve_for_server("hub", "status").unwrap();
        assert_eq!(pinned, s2);
        assert_eq!(server, "hub");
    }

    #[tokio::test]
    async fn subscribers_wake_on_publish() {
        let cache: EntityCache<ToolEntry> = EntityCache::new();
        let mut rx = cache.subscribe();
        let initial = rx.recv().await.unwrap();

        cache.set_spec_items(ContentHash::of_bytes(b"s1"), vec![entry("s1", "git", "a")]);
        let next = rx.recv().await.unwrap();
        assert_ne!(initial, next);
        assert_eq!(next, cache.snapshot().etag);
    }
}
