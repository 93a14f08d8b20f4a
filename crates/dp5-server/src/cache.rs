//! Lazily populated map with double-checked population
//!
//! Reads take a shared lock only. A miss serializes on the population
//! mutex and checks again before running the (expensive, idempotent)
//! initializer, so each key is populated at most once per process.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug)]
pub struct LazyMap<K, V> {
    entries: RwLock<HashMap<K, V>>,
    populate: Mutex<()>,
}

impl<K: Eq + Hash + Copy, V: Clone> LazyMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            populate: Mutex::new(()),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.entries.read().await.get(key).cloned()
    }

    /// Value for `key`, running `init` if nobody has populated it yet.
    /// A failed `init` leaves the key absent.
    pub async fn get_or_try_insert_with<F, Fut, Err>(&self, key: K, init: F) -> Result<V, Err>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, Err>>,
    {
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }

        let _populating = self.populate.lock().await;
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }

        let value = init().await?;
        self.entries.write().await.insert(key, value.clone());
        Ok(value)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl<K: Eq + Hash + Copy, V: Clone> Default for LazyMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
