// ── Generic reactive entity collection ──
//
// Concurrent keyed storage with in-place mutation under the per-key
// shard lock and push-based change notification via `watch` channels.

use std::cmp::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

/// Snapshot ordering applied on every rebuild.
pub(crate) type SnapshotOrder<T> = fn(&T, &T) -> Ordering;

/// A concurrent, reactive collection for a single entity type.
///
/// Mutations through [`modify`](Self::modify) and
/// [`upsert_with`](Self::upsert_with) run while holding the entry's shard
/// lock, so two writers touching the same key are serialized and neither
/// can lose the other's fields. Every mutation rebuilds the snapshot that
/// subscribers receive.
pub(crate) struct EntityCollection<T: Clone + Send + Sync + 'static> {
    by_key: DashMap<String, Arc<T>>,

    /// Full snapshot, rebuilt on mutation for efficient subscription.
    snapshot: watch::Sender<Arc<Vec<Arc<T>>>>,

    order: Option<SnapshotOrder<T>>,
}

impl<T: Clone + Send + Sync + 'static> EntityCollection<T> {
    /// A collection whose snapshots are sorted by `order`.
    pub(crate) fn with_order(order: Option<SnapshotOrder<T>>) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            by_key: DashMap::new(),
            snapshot,
            order,
        }
    }

    /// Mutate an existing entity in place. Returns `None` if the key is
    /// unknown, otherwise the closure's result.
    pub(crate) fn modify<R>(&self, key: &str, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let result = {
            let mut entry = self.by_key.get_mut(key)?;
            let mut value = (**entry).clone();
            let result = f(&mut value);
            *entry = Arc::new(value);
            result
        };
        // The shard lock is released before the rebuild iterates all shards.
        self.rebuild_snapshot();
        Some(result)
    }

    /// Mutate an entity in place, creating it with `create` first if absent.
    pub(crate) fn upsert_with<R>(
        &self,
        key: &str,
        create: impl FnOnce() -> T,
        f: impl FnOnce(&mut T) -> R,
    ) -> R {
        let result = {
            let mut entry = self
                .by_key
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(create()));
            let mut value = (**entry).clone();
            let result = f(&mut value);
            *entry = Arc::new(value);
            result
        };
        self.rebuild_snapshot();
        result
    }

    pub(crate) fn get(&self, key: &str) -> Option<Arc<T>> {
        self.by_key.get(key).map(|r| Arc::clone(r.value()))
    }

    /// Get the current snapshot (cheap `Arc` clone).
    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to snapshot changes via a `watch::Receiver`.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<T>>>> {
        self.snapshot.subscribe()
    }

    /// Remove all entities.
    pub(crate) fn clear(&self) {
        self.by_key.clear();
        self.rebuild_snapshot();
    }

    pub(crate) fn len(&self) -> usize {
        self.by_key.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Return all current primary keys in the collection.
    pub(crate) fn keys(&self) -> Vec<String> {
        self.by_key.iter().map(|r| r.key().clone()).collect()
    }

    // ── Private helpers ──────────────────────────────────────────────

    /// Collect all values into a snapshot vec and broadcast to subscribers.
    fn rebuild_snapshot(&self) {
        let mut values: Vec<Arc<T>> = self.by_key.iter().map(|r| Arc::clone(r.value())).collect();
        if let Some(order) = self.order {
            values.sort_by(|a, b| order(a, b));
        }
        // `send_modify` updates unconditionally, even with zero receivers.
        self.snapshot.send_modify(|snap| *snap = Arc::new(values));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn put(col: &EntityCollection<String>, key: &str, value: &str) {
        col.upsert_with(key, String::new, |s| value.clone_into(s));
    }

    #[test]
    fn modify_unknown_key_is_none() {
        let col: EntityCollection<String> = EntityCollection::with_order(None);
        assert!(col.modify("missing", |s| s.push('!')).is_none());
        assert!(col.is_empty());
    }

    #[test]
    fn upsert_with_creates_then_mutates() {
        let col: EntityCollection<Vec<u32>> = EntityCollection::with_order(None);
        col.upsert_with("a", Vec::new, |v| v.push(1));
        col.upsert_with("a", Vec::new, |v| v.push(2));
        assert_eq!(*col.get("a").unwrap(), vec![1, 2]);
        assert_eq!(col.len(), 1);
    }

    #[test]
    fn snapshot_is_sorted_when_ordered() {
        let col: EntityCollection<String> = EntityCollection::with_order(Some(|a, b| a.cmp(b)));
        put(&col, "2", "zeta");
        put(&col, "1", "alpha");
        let snap = col.snapshot();
        let names: Vec<&str> = snap.iter().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn keys_and_clear() {
        let col: EntityCollection<String> = EntityCollection::with_order(None);
        put(&col, "a", "x");
        put(&col, "b", "y");
        let mut keys = col.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_owned(), "b".to_owned()]);

        col.clear();
        assert!(col.is_empty());
        assert!(col.snapshot().is_empty());
    }

    #[test]
    fn subscribers_see_mutations() {
        let col: EntityCollection<String> = EntityCollection::with_order(None);
        let rx = col.subscribe();
        put(&col, "a", "x");
        col.modify("a", |s| s.push('y'));
        assert_eq!(*rx.borrow()[0], "xy");
    }

    #[test]
    fn concurrent_modifications_do_not_lose_updates() {
        let col: Arc<EntityCollection<u64>> = Arc::new(EntityCollection::with_order(None));
        col.upsert_with("n", || 0, |_| ());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let col = Arc::clone(&col);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        col.modify("n", |n| *n += 1);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*col.get("n").unwrap(), 800);
    }
}
