// src/concurrent/containers.rs

use super::SerialQueue;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// State bound to a serial queue
///
/// Reads and synchronous writes block until the queue runs them; plain writes
/// are fire-and-forget. On the queue itself everything runs inline.
///
/// Closures passed to `read`/`write` must not touch the same container again.
struct Bound<T> {
    queue: SerialQueue,
    value: Arc<Mutex<T>>,
}

impl<T: Send + 'static> Bound<T> {
    fn new(queue: &SerialQueue, value: T) -> Self {
        Self {
            queue: queue.clone(),
            value: Arc::new(Mutex::new(value)),
        }
    }

    fn read<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.queue.is_current() {
            return f(&self.value.lock());
        }
        let value = Arc::clone(&self.value);
        self.queue.dispatch_sync(move || f(&value.lock()))
    }

    fn write<F>(&self, f: F)
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        if self.queue.is_current() {
            f(&mut self.value.lock());
            return;
        }
        let value = Arc::clone(&self.value);
        self.queue.dispatch(move || f(&mut value.lock()));
    }

    fn write_sync<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.queue.is_current() {
            return f(&mut self.value.lock());
        }
        let value = Arc::clone(&self.value);
        self.queue.dispatch_sync(move || f(&mut value.lock()))
    }
}

impl<T> Clone for Bound<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            value: Arc::clone(&self.value),
        }
    }
}

/// Thread-safe dictionary bound to a serial queue
pub struct SafeMap<K, V> {
    bound: Bound<HashMap<K, V>>,
}

impl<K, V> SafeMap<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(queue: &SerialQueue) -> Self {
        Self {
            bound: Bound::new(queue, HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let key = key.clone();
        self.bound.read(move |map| map.get(&key).cloned())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let key = key.clone();
        self.bound.read(move |map| map.contains_key(&key))
    }

    pub fn insert(&self, key: K, value: V) {
        self.bound.write(move |map| {
            map.insert(key, value);
        });
    }

    pub fn remove(&self, key: &K) {
        let key = key.clone();
        self.bound.write(move |map| {
            map.remove(&key);
        });
    }

    pub fn remove_all(&self) {
        self.bound.write(|map| map.clear());
    }

    /// Replace the whole dictionary, waiting until the swap has happened
    pub fn set_to(&self, value: HashMap<K, V>) {
        self.bound.write_sync(move |map| *map = value);
    }

    pub fn len(&self) -> usize {
        self.bound.read(|map| map.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current contents
    pub fn raw(&self) -> HashMap<K, V> {
        self.bound.read(|map| map.clone())
    }

    pub fn values(&self) -> Vec<V> {
        self.bound.read(|map| map.values().cloned().collect())
    }

    /// Read through a closure without cloning the dictionary
    pub fn read<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&HashMap<K, V>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.bound.read(f)
    }

    /// Multi-step mutation applied atomically on the queue
    pub fn with_mut<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut HashMap<K, V>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.bound.write_sync(f)
    }
}

impl<K, V> Clone for SafeMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            bound: self.bound.clone(),
        }
    }
}

impl<K, V> fmt::Debug for SafeMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeMap")
            .field("queue", &self.bound.queue)
            .finish_non_exhaustive()
    }
}

/// Thread-safe set bound to a serial queue
pub struct SafeSet<T> {
    bound: Bound<HashSet<T>>,
}

impl<T> SafeSet<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(queue: &SerialQueue) -> Self {
        Self {
            bound: Bound::new(queue, HashSet::new()),
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        let item = item.clone();
        self.bound.read(move |set| set.contains(&item))
    }

    pub fn insert(&self, item: T) {
        self.bound.write(move |set| {
            set.insert(item);
        });
    }

    pub fn remove(&self, item: &T) {
        let item = item.clone();
        self.bound.write(move |set| {
            set.remove(&item);
        });
    }

    /// Remove every element matching `predicate`
    pub fn remove_where<F>(&self, predicate: F)
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        self.bound.write(move |set| set.retain(|item| !predicate(item)));
    }

    pub fn remove_all(&self) {
        self.bound.write(|set| set.clear());
    }

    /// Replace the whole set, waiting until the swap has happened
    pub fn set_to(&self, value: HashSet<T>) {
        self.bound.write_sync(move |set| *set = value);
    }

    pub fn len(&self) -> usize {
        self.bound.read(|set| set.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current contents
    pub fn raw(&self) -> HashSet<T> {
        self.bound.read(|set| set.clone())
    }
}

impl<T> Clone for SafeSet<T> {
    fn clone(&self) -> Self {
        Self {
            bound: self.bound.clone(),
        }
    }
}

impl<T> fmt::Debug for SafeSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeSet")
            .field("queue", &self.bound.queue)
            .finish_non_exhaustive()
    }
}

/// Thread-safe array bound to a serial queue
pub struct SafeVec<T> {
    bound: Bound<Vec<T>>,
}

impl<T> SafeVec<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(queue: &SerialQueue) -> Self {
        Self {
            bound: Bound::new(queue, Vec::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.bound.write(move |items| items.push(item));
    }

    pub fn remove_all(&self) {
        self.bound.write(|items| items.clear());
    }

    pub fn len(&self) -> usize {
        self.bound.read(|items| items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current contents
    pub fn raw(&self) -> Vec<T> {
        self.bound.read(|items| items.clone())
    }
}

impl<T> Clone for SafeVec<T> {
    fn clone(&self) -> Self {
        Self {
            bound: self.bound.clone(),
        }
    }
}
