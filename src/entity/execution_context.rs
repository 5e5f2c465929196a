use serde::{Deserialize, Serialize};
use std::fmt;

use super::entry::LockedEntity;
use crate::invariant;
use crate::state_machine::{StateMachineAction, StateMachineActionQueue};
use crate::types::ActivityId;

/// Store operation required to persist a processor's change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitType {
    /// Nothing to persist
    None,
    Insert,
    Update,
    Delete,
}

impl fmt::Display for CommitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Change staged by a processor
#[derive(Debug, Clone, PartialEq)]
pub enum EntityChange<T> {
    Upsert(T),
    Delete,
}

/// What must be written to the store, and the value the entity takes afterwards.
///
/// `data` is present for `Insert` and `Update`. A description with
/// `CommitType::None` that results from a staged change is a delete of an entity that
/// was never persisted: nothing is written but the in-memory entity is still
/// tombstoned.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitDescription<T> {
    pub commit_type: CommitType,
    pub data: Option<T>,
}

impl<T> CommitDescription<T> {
    pub fn none() -> Self {
        Self {
            commit_type: CommitType::None,
            data: None,
        }
    }

    /// Translate a staged change against the entity's persisted flag.
    pub fn from_change(change: EntityChange<T>, persisted: bool) -> Self {
        match (change, persisted) {
            (EntityChange::Upsert(data), true) => Self {
                commit_type: CommitType::Update,
                data: Some(data),
            },
            (EntityChange::Upsert(data), false) => Self {
                commit_type: CommitType::Insert,
                data: Some(data),
            },
            (EntityChange::Delete, true) => Self {
                commit_type: CommitType::Delete,
                data: None,
            },
            (EntityChange::Delete, false) => Self::none(),
        }
    }

    pub fn requires_store_write(&self) -> bool {
        self.commit_type != CommitType::None
    }
}

/// Mutation marker filled in by a processor.
///
/// Queried exactly once after the processor returns.
#[derive(Debug)]
pub struct UpdateContext<T> {
    change: Option<EntityChange<T>>,
    description_created: bool,
}

impl<T> Default for UpdateContext<T> {
    fn default() -> Self {
        Self {
            change: None,
            description_created: false,
        }
    }
}

impl<T> UpdateContext<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_updating(&self) -> bool {
        self.change.is_some()
    }

    pub fn change(&self) -> Option<&EntityChange<T>> {
        self.change.as_ref()
    }

    /// Commit type this change would need for an entity with the given persisted flag
    pub fn commit_type(&self, persisted: bool) -> CommitType {
        match (&self.change, persisted) {
            (None, _) => CommitType::None,
            (Some(EntityChange::Upsert(_)), true) => CommitType::Update,
            (Some(EntityChange::Upsert(_)), false) => CommitType::Insert,
            (Some(EntityChange::Delete), true) => CommitType::Delete,
            (Some(EntityChange::Delete), false) => CommitType::None,
        }
    }

    /// Take the staged change as a commit description. Callable once.
    pub fn create_commit_description(&mut self, persisted: bool) -> CommitDescription<T> {
        if !invariant!(
            !self.description_created,
            "commit description created twice for one update context"
        ) {
            return CommitDescription::none();
        }
        self.description_created = true;

        match self.change.take() {
            Some(change) => CommitDescription::from_change(change, persisted),
            None => CommitDescription::none(),
        }
    }

    fn stage(&mut self, change: EntityChange<T>) {
        self.change = Some(change);
    }
}

/// Unit of work bound to one locked entity.
///
/// Handed to a job's processor while the entity lock is held. The processor reads the
/// current value, stages at most one change, and enqueues the actions to run once the
/// lock is released.
pub struct EntityExecutionContext<'a, K, T> {
    activity_id: ActivityId,
    key: &'a K,
    current: Option<&'a T>,
    persisted: bool,
    action_queue: &'a mut StateMachineActionQueue,
    update_context: &'a mut UpdateContext<T>,
}

impl<'a, K, T> EntityExecutionContext<'a, K, T> {
    pub fn create(
        activity_id: ActivityId,
        action_queue: &'a mut StateMachineActionQueue,
        update_context: &'a mut UpdateContext<T>,
        locked_entity: &'a LockedEntity<'_, K, T>,
    ) -> Self {
        Self {
            activity_id,
            key: locked_entity.key(),
            current: locked_entity.current(),
            persisted: locked_entity.is_persisted(),
            action_queue,
            update_context,
        }
    }

    pub fn activity_id(&self) -> ActivityId {
        self.activity_id
    }

    pub fn key(&self) -> &'a K {
        self.key
    }

    /// Entity value as of lock acquisition; `None` if absent or deleted.
    ///
    /// The borrow lives as long as the lock, so it can be held while actions are
    /// enqueued or a change is staged.
    pub fn current(&self) -> Option<&'a T> {
        self.current
    }

    pub fn exists(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// Value the entity will have if this job commits
    pub fn staged(&self) -> Option<&T> {
        match self.update_context.change() {
            Some(EntityChange::Upsert(value)) => Some(value),
            Some(EntityChange::Delete) => None,
            None => self.current,
        }
    }

    /// Replace the entity value
    pub fn upsert(&mut self, value: T) {
        self.update_context.stage(EntityChange::Upsert(value));
    }

    /// Mark the entity deleted. Persisted entities are removed from the store.
    pub fn delete(&mut self) {
        self.update_context.stage(EntityChange::Delete);
    }

    pub fn is_updating(&self) -> bool {
        self.update_context.is_updating()
    }

    pub fn enqueue_action(&mut self, action: StateMachineAction) {
        self.action_queue.enqueue(action);
    }

    pub fn action_queue(&mut self) -> &mut StateMachineActionQueue {
        self.action_queue
    }
}

impl<K, T: Clone> EntityExecutionContext<'_, K, T> {
    /// Mutable access to the value this job will commit.
    ///
    /// The first call copies the current value into the update context. Returns
    /// `None` when there is nothing to edit (absent entity, or deleted by this job).
    pub fn staged_mut(&mut self) -> Option<&mut T> {
        if self.update_context.change.is_none() {
            let current = self.current?.clone();
            self.update_context.stage(EntityChange::Upsert(current));
        }
        match self.update_context.change.as_mut() {
            Some(EntityChange::Upsert(value)) => Some(value),
            _ => None,
        }
    }
}

impl<K: fmt::Debug, T> fmt::Debug for EntityExecutionContext<'_, K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityExecutionContext")
            .field("activity_id", &self.activity_id)
            .field("key", self.key)
            .field("exists", &self.current.is_some())
            .field("persisted", &self.persisted)
            .field("updating", &self.update_context.is_updating())
            .field("actions", &self.action_queue.len())
            .finish()
    }
}
