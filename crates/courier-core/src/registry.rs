use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::models::{CoreError, CoreErrorKind, Session, SessionId, TaskId, TaskRecord};

pub type RegistryResult<T> = Result<T, CoreError>;

pub type SessionRegistry = Registry<SessionId, Session>;
pub type TaskRegistry = Registry<TaskId, TaskRecord>;

/// Concurrency-safe key-value store for session and task entities. All
/// shared mutation in the crate goes through these accessors; `snapshot`
/// hands out a point-in-time copy so iterating components never observe a
/// torn entry while another component mutates the map.
pub struct Registry<K, V> {
    inner: Arc<Mutex<HashMap<K, V>>>,
}

impl<K, V> Clone for Registry<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: K, value: V) -> RegistryResult<Option<V>> {
        Ok(self.lock_state()?.insert(key, value))
    }

    pub fn get(&self, key: &K) -> RegistryResult<Option<V>> {
        Ok(self.lock_state()?.get(key).cloned())
    }

    /// Map a value under the lock without cloning the whole entry.
    pub fn read<R>(&self, key: &K, reader: impl FnOnce(&V) -> R) -> RegistryResult<Option<R>> {
        Ok(self.lock_state()?.get(key).map(reader))
    }

    /// Mutate an entry in place; returns `None` when the key is absent.
    pub fn update<R>(
        &self,
        key: &K,
        updater: impl FnOnce(&mut V) -> R,
    ) -> RegistryResult<Option<R>> {
        Ok(self.lock_state()?.get_mut(key).map(updater))
    }

    pub fn remove(&self, key: &K) -> RegistryResult<Option<V>> {
        Ok(self.lock_state()?.remove(key))
    }

    pub fn contains(&self, key: &K) -> RegistryResult<bool> {
        Ok(self.lock_state()?.contains_key(key))
    }

    pub fn len(&self) -> RegistryResult<usize> {
        Ok(self.lock_state()?.len())
    }

    pub fn is_empty(&self) -> RegistryResult<bool> {
        Ok(self.lock_state()?.is_empty())
    }

    pub fn snapshot(&self) -> RegistryResult<Vec<V>> {
        Ok(self.lock_state()?.values().cloned().collect())
    }

    fn lock_state(&self) -> RegistryResult<MutexGuard<'_, HashMap<K, V>>> {
        self.inner.lock().map_err(|_| CoreError {
            session: None,
            task: None,
            kind: CoreErrorKind::Internal,
            message: "registry mutex poisoned".to_string(),
        })
    }
}
