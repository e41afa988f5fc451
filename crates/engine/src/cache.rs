//! Key-value cache capability plus an LRU implementation.
//!
//! [`LruCache`] is single-threaded; share it through [`Synchronized`].

use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{EngineError, ResultEngine};

pub trait Cache<K, V> {
    fn get(&mut self, key: &K) -> Option<&V>;
    fn get_mut(&mut self, key: &K) -> Option<&mut V>;
    fn set(&mut self, key: K, value: V);
    /// Returns `true` when the key was present.
    fn remove(&mut self, key: &K) -> bool;
    fn clear(&mut self);
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Least recently used cache with a fixed capacity.
///
/// Every access stamps the entry with a fresh tick; the smallest tick is the
/// eviction candidate.
#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    tick: u64,
    entries: HashMap<K, (V, u64)>,
    recency: BTreeMap<u64, K>,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> ResultEngine<Self> {
        if capacity == 0 {
            return Err(EngineError::Validation(
                "cache capacity must be > 0".to_string(),
            ));
        }
        Ok(Self {
            capacity,
            tick: 0,
            entries: HashMap::with_capacity(capacity),
            recency: BTreeMap::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn touch(&mut self, key: &K) -> bool {
        let Some((_, stamp)) = self.entries.get_mut(key) else {
            return false;
        };
        self.recency.remove(stamp);
        self.tick += 1;
        *stamp = self.tick;
        self.recency.insert(self.tick, key.clone());
        true
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.recency.pop_first() {
            self.entries.remove(&key);
        }
    }
}

impl<K: Eq + Hash + Clone, V> Cache<K, V> for LruCache<K, V> {
    fn get(&mut self, key: &K) -> Option<&V> {
        if !self.touch(key) {
            return None;
        }
        self.entries.get(key).map(|(value, _)| value)
    }

    fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if !self.touch(key) {
            return None;
        }
        self.entries.get_mut(key).map(|(value, _)| value)
    }

    fn set(&mut self, key: K, value: V) {
        if let Some((stored, _)) = self.entries.get_mut(&key) {
            *stored = value;
            self.touch(&key);
            return;
        }
        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.tick += 1;
        self.recency.insert(self.tick, key.clone());
        self.entries.insert(key, (value, self.tick));
    }

    fn remove(&mut self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some((_, stamp)) => {
                self.recency.remove(&stamp);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Mutex-guarded wrapper making any [`Cache`] shareable between tasks.
#[derive(Debug, Default)]
pub struct Synchronized<C> {
    inner: Mutex<C>,
}

impl<C> Synchronized<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Locks the cache. A poisoned lock is recovered: cached values are
    /// always replaceable.
    pub fn lock(&self) -> MutexGuard<'_, C> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get<K, V: Clone>(&self, key: &K) -> Option<V>
    where
        C: Cache<K, V>,
    {
        self.lock().get(key).cloned()
    }

    pub fn set<K, V>(&self, key: K, value: V)
    where
        C: Cache<K, V>,
    {
        self.lock().set(key, value);
    }

    pub fn remove<K, V>(&self, key: &K) -> bool
    where
        C: Cache<K, V>,
    {
        self.lock().remove(key)
    }
}
