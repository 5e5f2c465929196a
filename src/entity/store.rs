use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

use super::execution_context::{CommitDescription, CommitType};
use crate::types::EntityKey;

/// Typed failures returned by the store collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Write conflict on {key}")]
    WriteConflict { key: String },

    #[error("Record not found: {key}")]
    RecordNotFound { key: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Replicated store seam.
///
/// `commit` is called while the entity lock is held and must not call back into the
/// entity table.
pub trait EntityStore<K, T>: Send + Sync {
    fn commit(&self, key: &K, description: &CommitDescription<T>) -> Result<(), StoreError>;

    fn load_all(&self) -> Result<Vec<(K, T)>, StoreError>;
}

/// Store that keeps JSON-serialized entities in memory
#[derive(Debug)]
pub struct InMemoryEntityStore<K> {
    records: Mutex<HashMap<K, serde_json::Value>>,
    injected_failure: Mutex<Option<StoreError>>,
}

impl<K: EntityKey> Default for InMemoryEntityStore<K> {
    fn default() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            injected_failure: Mutex::new(None),
        }
    }
}

impl<K: EntityKey> InMemoryEntityStore<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail with `error`
    pub fn fail_next_commit(&self, error: StoreError) {
        *self.injected_failure.lock() = Some(error);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.records.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &K) -> Result<Option<T>, StoreError> {
        self.records
            .lock()
            .get(key)
            .map(|value| serde_json::from_value(value.clone()).map_err(StoreError::from))
            .transpose()
    }
}

impl<K, T> EntityStore<K, T> for InMemoryEntityStore<K>
where
    K: EntityKey,
    T: Serialize + DeserializeOwned,
{
    fn commit(&self, key: &K, description: &CommitDescription<T>) -> Result<(), StoreError> {
        if let Some(error) = self.injected_failure.lock().take() {
            warn!(key = %key, error = %error, "💾 STORE: Injected commit failure");
            return Err(error);
        }

        let mut records = self.records.lock();
        match description.commit_type {
            CommitType::None => {}
            CommitType::Insert => {
                if records.contains_key(key) {
                    return Err(StoreError::WriteConflict {
                        key: key.to_string(),
                    });
                }
                records.insert(key.clone(), serialize(key, description)?);
            }
            CommitType::Update => {
                let value = serialize(key, description)?;
                match records.get_mut(key) {
                    Some(existing) => *existing = value,
                    None => {
                        return Err(StoreError::RecordNotFound {
                            key: key.to_string(),
                        })
                    }
                }
            }
            CommitType::Delete => {
                if records.remove(key).is_none() {
                    return Err(StoreError::RecordNotFound {
                        key: key.to_string(),
                    });
                }
            }
        }

        debug!(
            key = %key,
            commit_type = %description.commit_type,
            "💾 STORE: Commit applied"
        );
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<(K, T)>, StoreError> {
        self.records
            .lock()
            .iter()
            .map(|(key, value)| Ok((key.clone(), serde_json::from_value(value.clone())?)))
            .collect()
    }
}

fn serialize<K: EntityKey, T: Serialize>(
    key: &K,
    description: &CommitDescription<T>,
) -> Result<serde_json::Value, StoreError> {
    let data = description.data.as_ref().ok_or_else(|| {
        StoreError::Serialization(format!("{} commit for {key} carries no data", description.commit_type))
    })?;
    Ok(serde_json::to_value(data)?)
}
