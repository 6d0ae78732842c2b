//! In-memory tables with per-key mutual exclusion.
//!
//! Every row of a [`Table`] sits behind its own lock, so that operations on different keys (two
//! different runs, say) never wait for each other. The lock on the table itself is only held
//! for as long as it takes to look up or insert a row.
//!
//! Components that need to hold several rows at once acquire them in a fixed order to stay clear
//! of deadlocks: project, then run, then site, then mailbox. A mailbox lock is never held while
//! acquiring anything else.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// A row of a [`Table`], locked for exclusive access.
pub type RowGuard<V> = OwnedMutexGuard<V>;

/// A table of rows, each guarded by its own mutex.
#[derive(Debug)]
pub struct Table<K, V> {
    rows: RwLock<HashMap<K, Arc<Mutex<V>>>>,
}

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Table<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a row, replacing any previous row stored under the same key.
    pub async fn insert(&self, key: K, value: V) {
        self.rows
            .write()
            .await
            .insert(key, Arc::new(Mutex::new(value)));
    }

    /// Locks the row stored under `key`, if any.
    pub async fn lock(&self, key: &K) -> Option<RowGuard<V>> {
        let row = self.rows.read().await.get(key).cloned()?;
        Some(row.lock_owned().await)
    }

    /// Locks the row stored under `key`, creating it with `init` first if it doesn't exist.
    pub async fn lock_or_insert_with<F>(&self, key: K, init: F) -> RowGuard<V>
    where
        F: FnOnce() -> V,
    {
        let existing = self.rows.read().await.get(&key).cloned();
        let row = match existing {
            Some(row) => row,
            None => self
                .rows
                .write()
                .await
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(init())))
                .clone(),
        };
        row.lock_owned().await
    }

    /// Returns whether a row is stored under `key`.
    #[cfg(test)]
    pub async fn contains(&self, key: &K) -> bool {
        self.rows.read().await.contains_key(key)
    }

    /// Returns the keys of all the rows.
    ///
    /// The rows themselves are not locked, so the result is a snapshot that may be stale by the
    /// time it is used.
    pub async fn keys(&self) -> Vec<K> {
        self.rows.read().await.keys().cloned().collect()
    }
}

impl<K, V> Table<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Returns a copy of the row stored under `key`.
    pub async fn get(&self, key: &K) -> Option<V> {
        let row = self.lock(key).await?;
        Some(row.clone())
    }
}
