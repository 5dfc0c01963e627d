//! A capacity-bounded LRU cache keyed by an integer or string id, with a
//! pluggable eviction callback that flushes dirty objects before they're
//! dropped.
//!
//! `spec.md` §9's redesign flag collapses the source's pointer-rich,
//! dynamically-dispatched object graph into a typed map: the cache owns
//! every object behind an `Arc<Cached<V>>`, so a caller that got a handle
//! before an eviction keeps a live, correctly-locked reference even after
//! the cache itself has dropped its own entry — there is no "returned
//! pointer freed by a concurrent eviction" race to guard against, because
//! nothing is freed while a strong reference survives.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

/// The per-object mutex + dirty flag every cached value carries
/// (`spec.md` §4.6's `CacheableObject`).
pub struct Cached<V> {
    value: Mutex<V>,
    dirty: Mutex<bool>,
}

impl<V> Cached<V> {
    fn new(value: V) -> Self {
        Self {
            value: Mutex::new(value),
            dirty: Mutex::new(false),
        }
    }

    /// Locks the object. Callers must release this on every exit path,
    /// including error returns (`spec.md` §5) — in Rust this falls out of
    /// the guard's `Drop`.
    pub fn lock(&self) -> MutexGuard<'_, V> {
        self.value.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mark_dirty(&self) {
        *self.dirty.lock().unwrap_or_else(|e| e.into_inner()) = true;
    }

    pub fn is_dirty(&self) -> bool {
        *self.dirty.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn clear_dirty(&self) {
        *self.dirty.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }
}

struct Inner<K, V> {
    map: HashMap<K, Arc<Cached<V>>>,
    /// Recency order, LRU at the front, MRU at the back. Linear touch/evict
    /// is fine at the cache sizes `bfsUtilLayer.cache_sz_limit` configures
    /// in practice; see `DESIGN.md`.
    order: VecDeque<K>,
}

/// An LRU map from `K` to `V`, flushing evicted dirty values through a
/// caller-supplied callback (`spec.md` §4.6). `K` is either an inode id
/// (`u64`) or a path (`String`) in this crate's two instantiations.
pub struct Cache<K, V> {
    inner: Mutex<Inner<K, V>>,
    max_sz: usize,
    flush: Box<dyn Fn(&K, &V) + Send + Sync>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// `flush` is invoked with the key and the current value whenever a
    /// dirty entry is evicted, replaced, or the cache is dropped. It is the
    /// FS layer's job to check dirtiness itself if it needs to (the cache
    /// only calls it for entries it has already confirmed are dirty).
    pub fn new(max_sz: usize, flush: impl Fn(&K, &V) + Send + Sync + 'static) -> Self {
        assert!(max_sz > 0, "cache capacity must be positive");
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_sz,
            flush: Box::new(flush),
        }
    }

    fn touch(order: &mut VecDeque<K>, key: &K) {
        if let Some(pos) = order.iter().position(|k| k == key) {
            order.remove(pos);
        }
        order.push_back(key.clone());
    }

    fn flush_if_dirty(&self, key: &K, cached: &Cached<V>) {
        if cached.is_dirty() {
            (self.flush)(key, &cached.lock());
            cached.clear_dirty();
        }
    }

    /// Looks up `key`, moving it to MRU on a hit.
    pub fn get(&self, key: &K) -> Option<Arc<Cached<V>>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let hit = inner.map.get(key).cloned();
        if hit.is_some() {
            Self::touch(&mut inner.order, key);
        }
        hit
    }

    /// Inserts `value` under `key`, evicting the LRU entry first if the
    /// cache is full and `key` is new. If `key` was already present, the
    /// old value is flushed (if dirty) before being replaced, per
    /// `spec.md` §4.6's `insert` contract.
    pub fn insert(&self, key: K, value: V) -> Arc<Cached<V>> {
        let new = Arc::new(Cached::new(value));
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = inner.map.insert(key.clone(), new.clone()) {
            self.flush_if_dirty(&key, &old);
        } else {
            if inner.map.len() > self.max_sz {
                self.evict_locked(&mut inner);
            }
            inner.order.push_back(key.clone());
        }
        Self::touch(&mut inner.order, &key);
        new
    }

    /// Removes `key` from the cache without flushing it — used when the
    /// FS layer has already deallocated the underlying object (e.g. an
    /// unlinked inode) and a stale flush would just rewrite garbage.
    pub fn pop(&self, key: &K) -> Option<Arc<Cached<V>>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let removed = inner.map.remove(key);
        if removed.is_some() {
            if let Some(pos) = inner.order.iter().position(|k| k == key) {
                inner.order.remove(pos);
            }
        }
        removed
    }

    fn evict_locked(&self, inner: &mut Inner<K, V>) {
        while inner.map.len() > self.max_sz.saturating_sub(1) {
            let Some(lru_key) = inner.order.pop_front() else {
                break;
            };
            if let Some(v) = inner.map.remove(&lru_key) {
                self.flush_if_dirty(&lru_key, &v);
            }
        }
    }

    /// Flushes every dirty entry without evicting it. Used at `fsync` and
    /// at clean unmount.
    pub fn flush_all(&self) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for (key, value) in inner.map.iter() {
            self.flush_if_dirty(key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Drop for Cache<K, V> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        for (key, value) in inner.map.iter() {
            self.flush_if_dirty(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn get_after_insert_hits() {
        let cache: Cache<u64, String> = Cache::new(4, |_, _| {});
        cache.insert(1, "one".to_string());
        let got = cache.get(&1).unwrap();
        assert_eq!(*got.lock(), "one");
    }

    #[test]
    fn eviction_flushes_dirty_lru_entry() {
        let flushed = Arc::new(Mutex::new(Vec::new()));
        let flushed_cb = flushed.clone();
        let cache: Cache<u64, String> = Cache::new(2, move |k, v| {
            flushed_cb.lock().unwrap().push((*k, v.clone()));
        });
        let a = cache.insert(1, "a".to_string());
        a.mark_dirty();
        cache.insert(2, "b".to_string());
        // Touch 2 so 1 is the LRU entry, then insert a third to evict it.
        cache.get(&2);
        cache.insert(3, "c".to_string());
        assert_eq!(*flushed.lock().unwrap(), vec![(1, "a".to_string())]);
        assert!(cache.get(&1).is_none());
    }

    #[test]
    fn clean_lru_entry_evicted_without_flush() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = count.clone();
        let cache: Cache<u64, String> = Cache::new(1, move |_, _| {
            count_cb.fetch_add(1, Ordering::SeqCst);
        });
        cache.insert(1, "a".to_string());
        cache.insert(2, "b".to_string());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(cache.get(&1).is_none());
        assert!(cache.get(&2).is_some());
    }

    #[test]
    fn replacing_a_dirty_key_flushes_the_old_value() {
        let flushed = Arc::new(Mutex::new(Vec::new()));
        let flushed_cb = flushed.clone();
        let cache: Cache<u64, String> = Cache::new(4, move |k, v| {
            flushed_cb.lock().unwrap().push((*k, v.clone()));
        });
        let old = cache.insert(1, "old".to_string());
        old.mark_dirty();
        cache.insert(1, "new".to_string());
        assert_eq!(*flushed.lock().unwrap(), vec![(1, "old".to_string())]);
    }

    #[test]
    fn drop_flushes_all_dirty_entries() {
        let flushed = Arc::new(Mutex::new(Vec::new()));
        let flushed_cb = flushed.clone();
        {
            let cache: Cache<u64, String> = Cache::new(4, move |k, v| {
                flushed_cb.lock().unwrap().push((*k, v.clone()));
            });
            let a = cache.insert(1, "a".to_string());
            a.mark_dirty();
            cache.insert(2, "b".to_string());
        }
        assert_eq!(*flushed.lock().unwrap(), vec![(1, "a".to_string())]);
    }

    #[test]
    fn a_reference_held_across_an_eviction_stays_valid() {
        let cache: Cache<u64, String> = Cache::new(1, |_, _| {});
        let handle = cache.insert(1, "a".to_string());
        cache.insert(2, "b".to_string());
        assert_eq!(*handle.lock(), "a");
    }
}
