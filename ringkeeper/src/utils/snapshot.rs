//! Copy-on-write map.
//!
//! Readers load the current immutable snapshot without locking and keep it
//! for as long as they like. Writers serialize on a mutex, clone the current
//! snapshot, apply their change and publish the result with a single atomic
//! swap, so a reader sees either the whole change or none of it.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;

/// An atomically swapped snapshot plus the lock serializing copy-then-swap sections.
#[derive(Debug)]
struct Snapshot<C> {
    current: ArcSwap<C>,
    write_lock: Mutex<()>,
}

impl<C: Clone> Snapshot<C> {
    fn new(initial: C) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            write_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded data is `()`, a panicking writer cannot leave it inconsistent.
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self) -> Arc<C> {
        self.current.load_full()
    }

    fn update<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        let _guard = self.lock();
        let mut copy = C::clone(&self.current.load());
        let result = f(&mut copy);
        self.current.store(Arc::new(copy));
        result
    }

    /// Like `update`, but publishes only if `f` returns `Some`.
    fn try_update<R>(&self, f: impl FnOnce(&mut C) -> Option<R>) -> Option<R> {
        let _guard = self.lock();
        let mut copy = C::clone(&self.current.load());
        let result = f(&mut copy)?;
        self.current.store(Arc::new(copy));
        Some(result)
    }

    fn replace(&self, new: C) -> Arc<C> {
        let _guard = self.lock();
        self.current.swap(Arc::new(new))
    }
}

/// Copy-on-write ordered map.
#[derive(Debug)]
pub struct CowMap<K, V> {
    inner: Snapshot<BTreeMap<K, V>>,
}

impl<K: Ord + Clone, V: Clone> CowMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Snapshot::new(BTreeMap::new()),
        }
    }

    /// The current snapshot. It never changes once obtained.
    pub fn snapshot(&self) -> Arc<BTreeMap<K, V>> {
        self.inner.load()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.inner.current.load().get(key).cloned()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.inner.current.load().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.current.load().is_empty()
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.update(|map| map.insert(key, value))
    }

    /// Removes `key`. Nothing is published if the key was absent.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        if !self.contains_key(key) {
            return None;
        }
        self.inner.try_update(|map| map.remove(key))
    }

    /// Applies an arbitrary batch of changes as one snapshot swap.
    pub fn update<R>(&self, f: impl FnOnce(&mut BTreeMap<K, V>) -> R) -> R {
        self.inner.update(f)
    }

    /// Publishes `new` as the whole content, returning the previous snapshot.
    pub fn replace(&self, new: BTreeMap<K, V>) -> Arc<BTreeMap<K, V>> {
        self.inner.replace(new)
    }
}

impl<K: Ord + Clone, V: Clone> Default for CowMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Clone> FromIterator<(K, V)> for CowMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            inner: Snapshot::new(iter.into_iter().collect()),
        }
    }
}
