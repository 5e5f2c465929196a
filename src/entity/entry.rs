use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::execution_context::{CommitDescription, CommitType};
use super::store::{EntityStore, StoreError};
use crate::types::EntityKey;

#[derive(Debug)]
struct EntityState<T> {
    current: Option<T>,
    persisted: bool,
}

/// One slot of the entity table: the key plus its lock-protected state
pub struct EntityEntry<K, T> {
    key: K,
    state: Mutex<EntityState<T>>,
}

impl<K, T> EntityEntry<K, T> {
    /// Entry for an entity that does not exist yet
    pub fn new(key: K) -> Self {
        Self {
            key,
            state: Mutex::new(EntityState {
                current: None,
                persisted: false,
            }),
        }
    }

    /// Entry holding an in-memory value that has not been persisted
    pub fn with_value(key: K, value: T) -> Self {
        Self {
            key,
            state: Mutex::new(EntityState {
                current: Some(value),
                persisted: false,
            }),
        }
    }

    fn recovered(key: K, value: T) -> Self {
        Self {
            key,
            state: Mutex::new(EntityState {
                current: Some(value),
                persisted: true,
            }),
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Acquire the entity lock. Released when the returned guard drops, including
    /// during unwinding.
    pub fn lock(&self) -> LockedEntity<'_, K, T> {
        LockedEntity {
            key: &self.key,
            guard: self.state.lock(),
        }
    }

    /// True when the entity is absent or has been deleted
    pub fn is_deleted(&self) -> bool {
        self.state.lock().current.is_none()
    }

    pub fn is_persisted(&self) -> bool {
        self.state.lock().persisted
    }
}

impl<K, T: Clone> EntityEntry<K, T> {
    /// Copy of the current value, taken under the lock
    pub fn snapshot(&self) -> Option<T> {
        self.state.lock().current.clone()
    }
}

impl<K: fmt::Debug, T> fmt::Debug for EntityEntry<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityEntry").field("key", &self.key).finish()
    }
}

/// Exclusive access to one entity for the duration of a job
pub struct LockedEntity<'a, K, T> {
    key: &'a K,
    guard: MutexGuard<'a, EntityState<T>>,
}

impl<K, T> LockedEntity<'_, K, T> {
    pub fn key(&self) -> &K {
        self.key
    }

    pub fn current(&self) -> Option<&T> {
        self.guard.current.as_ref()
    }

    pub fn is_persisted(&self) -> bool {
        self.guard.persisted
    }

    /// Apply a description whose store write (if any) has succeeded
    pub fn apply(&mut self, description: CommitDescription<T>) {
        match description.commit_type {
            CommitType::Insert | CommitType::Update => {
                self.guard.current = description.data;
                self.guard.persisted = true;
            }
            CommitType::Delete | CommitType::None => {
                self.guard.current = None;
                self.guard.persisted = false;
            }
        }
    }
}

/// Shared table of entities keyed by entity id.
///
/// Lookups hand out `Arc` references so a job can hold its entity after the map shard
/// lock is released; the per-entity mutex is the only path to the state.
pub struct EntityMap<K, T> {
    entries: DashMap<K, Arc<EntityEntry<K, T>>>,
}

impl<K: EntityKey, T> Default for EntityMap<K, T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<K: EntityKey, T> EntityMap<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, key: &K) -> Arc<EntityEntry<K, T>> {
        if let Some(existing) = self.entries.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(EntityEntry::new(key.clone())));
        Arc::clone(entry.value())
    }

    pub fn get(&self, key: &K) -> Option<Arc<EntityEntry<K, T>>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Load every persisted entity from the store. Existing in-memory entries are
    /// replaced. Returns the number of entities recovered.
    pub fn recover(&self, store: &dyn EntityStore<K, T>) -> Result<usize, StoreError> {
        let records = store.load_all()?;
        let count = records.len();
        for (key, value) in records {
            self.entries
                .insert(key.clone(), Arc::new(EntityEntry::recovered(key, value)));
        }

        info!(entities = count, "📦 ENTITY_MAP: Recovered entities from store");
        Ok(count)
    }

    /// Drop tombstoned entries that no job or caller still references.
    pub fn prune_deleted(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| Arc::strong_count(entry) > 1 || !entry.is_deleted());
        let pruned = before.saturating_sub(self.entries.len());

        if pruned > 0 {
            debug!(pruned = pruned, "🧹 ENTITY_MAP: Pruned deleted entities");
        }
        pruned
    }
}
