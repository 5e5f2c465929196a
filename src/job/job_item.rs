//! # Entity Job Items
//!
//! A job item names the entity it targets and carries the processor that runs against
//! that entity's [`EntityExecutionContext`]. The queue guarantees that at most one job
//! per key is processing at any time; the item itself owns the lock/commit/execute
//! sequence.

use crossbeam::channel::Receiver;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use super::queue::{JobQueueOwner, QueueLoad};
use crate::entity::{CommitType, EntityExecutionContext, UpdateContext};
use crate::error::ProcessingError;
use crate::state_machine::{ActionExecutor, StateMachineActionQueue};
use crate::types::{ActivityId, EntityKey, NodeInstance};

/// Logical kind of a job. Only jobs of the same kind can be coalesced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobKind(&'static str);

impl JobKind {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a job came from. Load-balancer work is subject to throttling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    /// Message from the failover manager or another node
    Federation,
    /// Placement or load balancing request
    LoadBalancer,
    /// Timer or other work raised by the agent itself
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOrigin {
    pub node: Option<NodeInstance>,
    pub source: JobSource,
}

impl JobOrigin {
    pub fn federation(node: NodeInstance) -> Self {
        Self {
            node: Some(node),
            source: JobSource::Federation,
        }
    }

    pub fn load_balancer(node: NodeInstance) -> Self {
        Self {
            node: Some(node),
            source: JobSource::LoadBalancer,
        }
    }

    pub fn local() -> Self {
        Self {
            node: None,
            source: JobSource::Local,
        }
    }

    pub fn is_load_balancer(&self) -> bool {
        self.source == JobSource::LoadBalancer
    }
}

/// Final result delivered to a job's completion callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCompletion {
    /// Processor succeeded; `commit` was persisted and `actions` were executed
    Completed { commit: CommitType, actions: usize },
    /// Processor or commit returned an error; actions were abandoned
    Failed(String),
    /// Processor panicked; the entity lock was released during unwinding
    Panicked(String),
    /// Coalesced into an earlier pending job for the same key
    Combined,
    /// Not admitted by the queue
    Rejected(String),
    /// Dropped or cancelled because the owner is closing
    Abandoned,
}

impl JobCompletion {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Failed(_) => "failed",
            Self::Panicked(_) => "panicked",
            Self::Combined => "combined",
            Self::Rejected(_) => "rejected",
            Self::Abandoned => "abandoned",
        }
    }
}

pub type JobProcessor<K, T> =
    Box<dyn FnOnce(&mut EntityExecutionContext<'_, K, T>) -> Result<(), ProcessingError> + Send>;

pub type CompletionCallback = Box<dyn FnOnce(JobCompletion) + Send>;

/// Unit of scheduled work against one entity
pub struct EntityJobItem<K, T> {
    key: K,
    activity_id: ActivityId,
    kind: JobKind,
    origin: JobOrigin,
    combinable: bool,
    processor: JobProcessor<K, T>,
    completion: Option<CompletionCallback>,
}

impl<K: EntityKey, T> EntityJobItem<K, T> {
    pub fn new<F>(key: K, kind: JobKind, origin: JobOrigin, processor: F) -> Self
    where
        F: FnOnce(&mut EntityExecutionContext<'_, K, T>) -> Result<(), ProcessingError>
            + Send
            + 'static,
    {
        Self {
            key,
            activity_id: ActivityId::new(),
            kind,
            origin,
            combinable: false,
            processor: Box::new(processor),
            completion: None,
        }
    }

    pub fn with_activity_id(mut self, activity_id: ActivityId) -> Self {
        self.activity_id = activity_id;
        self
    }

    /// Allow this job to absorb later pending jobs of the same kind
    pub fn combinable(mut self) -> Self {
        self.combinable = true;
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(JobCompletion) + Send + 'static,
    {
        self.completion = Some(Box::new(callback));
        self
    }

    /// Attach a channel that receives this job's completion
    pub fn with_completion_channel(self) -> (Self, Receiver<JobCompletion>) {
        let (sender, receiver) = crossbeam::channel::bounded(1);
        let job = self.on_complete(move |completion| {
            // The originator may have stopped waiting
            let _ = sender.send(completion);
        });
        (job, receiver)
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn activity_id(&self) -> ActivityId {
        self.activity_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn origin(&self) -> JobOrigin {
        self.origin
    }

    pub fn is_combinable(&self) -> bool {
        self.combinable
    }

    /// Two jobs combine only when both opt in and report the same kind
    pub fn can_combine(&self, other: &Self) -> bool {
        self.combinable && other.combinable && self.key == other.key && self.kind == other.kind
    }

    /// Absorb `other` into this job.
    ///
    /// Combinable jobs of one kind describe the same work, so nothing from `other` is
    /// applied. The caller completes `other` with [`JobCompletion::Combined`].
    pub fn append(&mut self, other: &Self) {
        debug!(
            entity = %self.key,
            kind = %self.kind,
            kept = %self.activity_id,
            discarded = %other.activity_id,
            "🔗 JOB_ITEM: Combined pending job"
        );
    }

    /// Owner policy deciding whether this job must wait before it is dispatched
    pub fn need_throttle<O>(&self, owner: &O, load: &QueueLoad) -> bool
    where
        O: JobQueueOwner<K, T> + ?Sized,
    {
        owner.need_throttle(self, load)
    }

    /// Queue-full notification routed to the owner
    pub fn on_queue_full<O>(&self, owner: &O, queue_name: &str, current_size: usize)
    where
        O: JobQueueOwner<K, T> + ?Sized,
    {
        owner.on_queue_full(queue_name, &self.key, current_size);
    }

    pub fn take_completion(&mut self) -> Option<CompletionCallback> {
        self.completion.take()
    }

    /// Deliver `completion` to the callback, if one is attached
    pub fn complete(mut self, completion: JobCompletion) {
        if let Some(callback) = self.completion.take() {
            callback(completion);
        }
    }

    /// Lock the entity, run the processor, commit, then execute or abandon the
    /// resulting actions after the lock is released.
    pub fn process_job<O>(self, owner: &O) -> JobCompletion
    where
        O: JobQueueOwner<K, T> + ?Sized,
    {
        let EntityJobItem {
            key,
            activity_id,
            kind,
            processor,
            ..
        } = self;

        let entry = owner.entity_map().get_or_create(&key);
        let executor = owner.action_executor();
        let mut pending = PendingActions {
            queue: StateMachineActionQueue::new(),
            entity: &key,
            executor,
        };

        let outcome = {
            let mut locked = entry.lock();
            let mut update_context = UpdateContext::new();

            let processed = {
                let mut context = EntityExecutionContext::create(
                    activity_id,
                    &mut pending.queue,
                    &mut update_context,
                    &locked,
                );
                processor(&mut context)
            };

            match processed {
                Err(error) => Err(error),
                Ok(()) if !update_context.is_updating() => Ok(CommitType::None),
                Ok(()) => {
                    let description =
                        update_context.create_commit_description(locked.is_persisted());
                    let commit_type = description.commit_type;
                    let committed = if description.requires_store_write() {
                        owner.store().commit(&key, &description)
                    } else {
                        Ok(())
                    };

                    match committed {
                        Ok(()) => {
                            debug!(
                                activity_id = %activity_id,
                                entity = %key,
                                commit_type = %commit_type,
                                "💾 JOB_ITEM: Commit applied"
                            );
                            locked.apply(description);
                            Ok(commit_type)
                        }
                        Err(error) => {
                            warn!(
                                activity_id = %activity_id,
                                entity = %key,
                                commit_type = %commit_type,
                                error = %error,
                                "💾 JOB_ITEM: Commit failed, entity left unchanged"
                            );
                            Err(ProcessingError::Commit(error))
                        }
                    }
                }
            }
        };

        match outcome {
            Ok(commit) if !owner.is_closing() => {
                let actions = pending
                    .queue
                    .execute_all_actions(activity_id, &key, executor);
                JobCompletion::Completed { commit, actions }
            }
            Ok(_) => {
                pending.queue.abandon_all_actions(&key, executor);
                JobCompletion::Abandoned
            }
            Err(error) => {
                debug!(
                    activity_id = %activity_id,
                    entity = %key,
                    kind = %kind,
                    error = %error,
                    "Processor failed, abandoning actions"
                );
                pending.queue.abandon_all_actions(&key, executor);
                JobCompletion::Failed(error.to_string())
            }
        }
    }
}

/// Actions staged by a processor. Whatever was not executed or abandoned by the time
/// this drops, including when the processor unwinds, is abandoned so executors can
/// release what the actions hold.
struct PendingActions<'a, K: EntityKey> {
    queue: StateMachineActionQueue,
    entity: &'a K,
    executor: &'a dyn ActionExecutor<K>,
}

impl<K: EntityKey> Drop for PendingActions<'_, K> {
    fn drop(&mut self) {
        if !self.queue.is_consumed() {
            self.queue.abandon_all_actions(self.entity, self.executor);
        }
    }
}

impl<K: fmt::Debug, T> fmt::Debug for EntityJobItem<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityJobItem")
            .field("key", &self.key)
            .field("activity_id", &self.activity_id)
            .field("kind", &self.kind)
            .field("origin", &self.origin)
            .field("combinable", &self.combinable)
            .finish_non_exhaustive()
    }
}
