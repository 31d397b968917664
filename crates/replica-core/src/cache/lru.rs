//! Least-recently-used cache
//!
//! Entries live in a slab (`Vec<Option<Entry>>`) threaded by a doubly linked
//! recency list: `head` is the most recently used entry, `tail` the least.
//! A hash index maps keys to slab slots, so lookup, insertion, promotion and
//! eviction are all O(1).

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;

/// Sentinel slot index for "no neighbour"
const NIL: usize = usize::MAX;

struct Entry<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// Fixed-capacity cache evicting the least recently used entry
///
/// A stored value may itself be a negative result (for example `Option<T>`
/// holding `None`); `try_get` returning `Some(&None)` is a hit, `None` is a
/// miss.
pub struct LruCache<K, V> {
    capacity: usize,
    index: FxHashMap<K, usize>,
    slots: Vec<Option<Entry<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    /// Create a cache holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            index: FxHashMap::default(),
            slots: Vec::with_capacity(capacity.min(1024)),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries currently stored
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Check if the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Check if a key is cached without touching its recency
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(key)
    }

    /// Look up a key and mark it most recently used
    pub fn try_get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = *self.index.get(key)?;
        self.promote(idx);
        self.slots[idx].as_ref().map(|e| &e.value)
    }

    /// Look up a key without changing recency
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = *self.index.get(key)?;
        self.slots[idx].as_ref().map(|e| &e.value)
    }

    /// Insert or update a key, making it most recently used
    ///
    /// Returns the evicted entry when the insertion pushed the cache past its
    /// capacity. Updating an existing key never evicts.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&idx) = self.index.get(&key) {
            if let Some(entry) = self.slots[idx].as_mut() {
                entry.value = value;
            }
            self.promote(idx);
            return None;
        }

        let mut evicted = None;
        if self.index.len() >= self.capacity {
            evicted = self.evict_tail();
        }

        let entry = Entry {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
        evicted
    }

    /// Return the cached value or insert the one produced by `f`
    ///
    /// `None` only if the freshly inserted entry is missing from the slab.
    pub fn get_or_insert_with<F>(&mut self, key: K, f: F) -> Option<&V>
    where
        F: FnOnce() -> V,
    {
        match self.index.get(&key).copied() {
            Some(idx) => self.promote(idx),
            None => {
                self.put(key.clone(), f());
            }
        }
        let idx = *self.index.get(&key)?;
        self.slots[idx].as_ref().map(|e| &e.value)
    }

    /// Remove a key, returning its value
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.index.remove(key)?;
        self.detach(idx);
        self.free.push(idx);
        self.slots[idx].take().map(|e| e.value)
    }

    /// Drop every entry, keeping the capacity
    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Keys from most to least recently used
    pub fn keys_by_recency(&self) -> Vec<&K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while cursor != NIL {
            let Some(entry) = self.slots[cursor].as_ref() else {
                break;
            };
            keys.push(&entry.key);
            cursor = entry.next;
        }
        keys
    }

    // ========================================================================
    // Recency list plumbing
    // ========================================================================

    fn evict_tail(&mut self) -> Option<(K, V)> {
        let idx = self.tail;
        if idx == NIL {
            return None;
        }
        self.detach(idx);
        let entry = self.slots[idx].take()?;
        self.index.remove(&entry.key);
        self.free.push(idx);
        Some((entry.key, entry.value))
    }

    fn promote(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.detach(idx);
        self.push_front(idx);
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(e) => (e.prev, e.next),
            None => return,
        };
        if prev != NIL {
            if let Some(p) = self.slots[prev].as_mut() {
                p.next = next;
            }
        } else if self.head == idx {
            self.head = next;
        }
        if next != NIL {
            if let Some(n) = self.slots[next].as_mut() {
                n.prev = prev;
            }
        } else if self.tail == idx {
            self.tail = prev;
        }
        if let Some(e) = self.slots[idx].as_mut() {
            e.prev = NIL;
            e.next = NIL;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(e) = self.slots[idx].as_mut() {
            e.prev = NIL;
            e.next = old_head;
        }
        if old_head != NIL {
            if let Some(h) = self.slots[old_head].as_mut() {
                h.prev = idx;
            }
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }
}

impl<K, V> fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("capacity", &self.capacity)
            .field("len", &self.index.len())
            .finish()
    }
}

/// Lock-protected [`LruCache`] shared between call sites
///
/// Values are cloned out of the lock. `get_or_compute` runs the factory with
/// the lock released, so a factory may itself consult the same cache.
pub struct SharedLru<K, V> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> SharedLru<K, V> {
    /// Create a shared cache with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Look up a key, cloning the cached value
    pub fn try_get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().try_get(key).cloned()
    }

    /// Insert or update a key
    pub fn put(&self, key: K, value: V) {
        self.inner.lock().put(key, value);
    }

    /// Return the cached value or compute, store and return a fresh one
    pub fn get_or_compute<F>(&self, key: K, f: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(v) = self.try_get(&key) {
            return v;
        }
        let value = f();
        self.put(key, value.clone());
        value
    }

    /// Fallible variant of [`SharedLru::get_or_compute`]; errors are not cached
    pub fn get_or_try_compute<E, F>(&self, key: K, f: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(v) = self.try_get(&key) {
            return Ok(v);
        }
        let value = f()?;
        self.put(key, value.clone());
        Ok(value)
    }

    /// Remove a key
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().remove(key)
    }

    /// Check if a key is cached
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().contains(key)
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl<K, V> fmt::Debug for SharedLru<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedLru").finish_non_exhaustive()
    }
}
