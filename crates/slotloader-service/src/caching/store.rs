use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use rustc_hash::FxBuildHasher;

/// A cached load result.
///
/// [`None`] records a load that finished without producing a resource.
pub type Cached<R> = Option<Arc<R>>;

/// Computes the weight of a resource about to be cached.
pub type Weigher<K, R> = Arc<dyn Fn(&K, &R) -> u64 + Send + Sync>;

#[derive(Debug)]
struct Entry<R> {
    value: Cached<R>,
    weight: u64,
}

struct Inner<K, R> {
    /// Ordered from most to least recently used.
    entries: LruCache<K, Entry<R>, FxBuildHasher>,
    weight: u64,
}

impl<K: Eq + Hash, R> Inner<K, R> {
    fn remove(&mut self, key: &K) -> Option<Entry<R>> {
        let entry = self.entries.pop(key)?;
        self.weight = self.weight.saturating_sub(entry.weight);
        Some(entry)
    }

    /// Evicts least recently used entries until `incoming` more weight fits into `max_weight`, or
    /// until the cache is empty.
    fn make_room(&mut self, incoming: u64, max_weight: u64) -> usize {
        let mut evicted = 0;
        while self.weight.saturating_add(incoming) > max_weight {
            let Some((_, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.weight = self.weight.saturating_sub(entry.weight);
            evicted += 1;
        }
        evicted
    }
}

/// A weight-bounded in-memory LRU cache of load results.
///
/// See the [module docs](crate::caching) for the eviction rules.
pub struct CacheStore<K, R> {
    inner: Mutex<Inner<K, R>>,
    max_weight: u64,
    weigher: Weigher<K, R>,
}

impl<K, R> CacheStore<K, R>
where
    K: Eq + Hash + Clone + 'static,
    R: 'static,
{
    /// Creates a new store that holds up to `max_weight`, weighing resources by their in-memory
    /// size.
    pub fn new(max_weight: u64) -> Self {
        Self::builder(max_weight).build()
    }

    pub fn builder(max_weight: u64) -> CacheStoreBuilder<K, R> {
        CacheStoreBuilder {
            max_weight,
            weigher: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, R>> {
        // The sequences under this lock never leave the bookkeeping half-updated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up `key` and marks its entry as most recently used.
    ///
    /// The outer [`Option`] tells whether there is an entry at all, the inner one whether that
    /// entry holds a resource.
    pub fn get(&self, key: &K) -> Option<Cached<R>> {
        let mut inner = self.lock();
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Checks for an entry without marking it as used.
    pub fn contains(&self, key: &K) -> bool {
        self.lock().entries.contains(key)
    }

    /// Inserts `value` unless `key` already has an entry.
    ///
    /// Returns `true` if the value was inserted. An existing entry is left untouched, including
    /// its position in the recency order. Eviction of other entries happens as part of the same
    /// critical section.
    pub fn put_if_absent(&self, key: K, value: Cached<R>) -> bool {
        let weight = value.as_deref().map_or(0, |v| (self.weigher)(&key, v));

        let mut inner = self.lock();
        if inner.entries.contains(&key) {
            return false;
        }

        // room is made before the insert, so the new entry is never the one evicted
        let evicted = inner.make_room(weight, self.max_weight);
        inner.entries.push(key, Entry { value, weight });
        inner.weight = inner.weight.saturating_add(weight);
        let total = inner.weight;
        drop(inner);

        metric!(counter("cache.insert") += 1);
        if evicted > 0 {
            tracing::trace!(evicted, total, "Evicted cache entries");
            metric!(counter("cache.evicted") += evicted as i64);
        }
        metric!(gauge("cache.weight") = total);

        true
    }

    /// Removes the entry for `key`, returning whether there was one.
    pub fn remove(&self, key: &K) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Removes all entries.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.weight = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The total weight of all entries.
    pub fn weight(&self) -> u64 {
        self.lock().weight
    }

    pub fn max_weight(&self) -> u64 {
        self.max_weight
    }

    /// All keys, ordered from least to most recently used.
    pub fn keys(&self) -> Vec<K> {
        self.lock().entries.iter().rev().map(|(key, _)| key.clone()).collect()
    }
}

impl<K: Eq + Hash, R> fmt::Debug for CacheStore<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (entries, weight) = self
            .inner
            .try_lock()
            .map(|inner| (inner.entries.len(), inner.weight))
            .unwrap_or_default();
        f.debug_struct("CacheStore")
            .field("entries", &entries)
            .field("weight", &weight)
            .field("max_weight", &self.max_weight)
            .finish()
    }
}

/// Builder for a [`CacheStore`].
pub struct CacheStoreBuilder<K, R> {
    max_weight: u64,
    weigher: Option<Weigher<K, R>>,
}

impl<K, R> CacheStoreBuilder<K, R>
where
    K: Eq + Hash + Clone + 'static,
    R: 'static,
{
    /// Sets the function used to weigh resources.
    ///
    /// Defaults to the in-memory size of the resource type.
    pub fn weigher<F>(mut self, weigher: F) -> Self
    where
        F: Fn(&K, &R) -> u64 + Send + Sync + 'static,
    {
        self.weigher = Some(Arc::new(weigher));
        self
    }

    pub(crate) fn weigher_arc(mut self, weigher: Option<Weigher<K, R>>) -> Self {
        self.weigher = weigher;
        self
    }

    pub fn build(self) -> CacheStore<K, R> {
        let weigher: Weigher<K, R> = match self.weigher {
            Some(weigher) => weigher,
            None => Arc::new(|_k: &K, v: &R| std::mem::size_of_val(v) as u64),
        };
        CacheStore {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded_with_hasher(FxBuildHasher),
                weight: 0,
            }),
            max_weight: self.max_weight,
            weigher,
        }
    }
}
