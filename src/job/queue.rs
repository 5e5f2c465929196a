//! # Entity Job Queue
//!
//! Dispatches [`EntityJobItem`]s onto a fixed pool of tokio workers while guaranteeing
//! that no two jobs for the same entity key are processing at once.
//!
//! ## Scheduling
//!
//! Every key with pending work owns a slot holding its jobs in arrival order. A slot is
//! `Ready` (queued for a worker), `Throttled` (owner policy asked it to wait) or
//! `InFlight` (a worker is processing its front job). New jobs for an in-flight key
//! wait in the slot; they are never dropped. Throttled slots are re-evaluated whenever
//! any job completes and at least once per recheck interval.
//!
//! Job processing runs on the blocking pool and is isolated with `catch_unwind`, so a
//! panicking processor completes as [`JobCompletion::Panicked`] and the worker keeps
//! going.

use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job_item::{EntityJobItem, JobCompletion};
use super::metrics::{JobQueueMetrics, QueueCounters};
use crate::config::JobQueueConfig;
use crate::entity::{EntityMap, EntityStore};
use crate::logging::log_job_operation;
use crate::state_machine::ActionExecutor;
use crate::types::EntityKey;

/// Admission failures returned from [`EntityJobQueue::enqueue`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobQueueError {
    #[error("Job queue {queue} is full ({size} pending)")]
    QueueFull { queue: String, size: usize },

    #[error("Job queue {queue} is closed")]
    Closed { queue: String },
}

/// Outcome of a successful enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Coalesced into a pending job for the same key
    Combined,
}

/// Load snapshot handed to the owner's throttle policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueLoad {
    pub pending: usize,
    pub in_flight: usize,
    pub in_flight_load_balancer: usize,
}

/// Collaborators a queue needs to process jobs.
///
/// Implemented by the agent that owns the queue. The queue holds the owner in an
/// `Arc`, so the owner must not hold the queue itself.
pub trait JobQueueOwner<K: EntityKey, T>: Send + Sync + 'static {
    fn entity_map(&self) -> &EntityMap<K, T>;

    fn store(&self) -> &dyn EntityStore<K, T>;

    fn action_executor(&self) -> &dyn ActionExecutor<K>;

    /// When true, successful jobs abandon their actions instead of executing them
    fn is_closing(&self) -> bool {
        false
    }

    /// Whether `job` must wait before dispatch
    fn need_throttle(&self, job: &EntityJobItem<K, T>, load: &QueueLoad) -> bool {
        let _ = (job, load);
        false
    }

    /// Called when `entity`'s job was rejected for capacity. Must not panic.
    fn on_queue_full(&self, queue_name: &str, entity: &K, current_size: usize) {
        warn!(
            queue = %queue_name,
            entity = %entity,
            pending = current_size,
            "🚧 JOB_QUEUE: Queue full, job rejected"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotStatus {
    Ready,
    Throttled,
    InFlight,
}

struct KeySlot<K, T> {
    jobs: VecDeque<EntityJobItem<K, T>>,
    status: SlotStatus,
}

struct SchedulerState<K, T> {
    slots: HashMap<K, KeySlot<K, T>>,
    ready: VecDeque<K>,
    throttled: Vec<K>,
    pending: usize,
    in_flight: usize,
    in_flight_load_balancer: usize,
    closed: bool,
}

impl<K: EntityKey, T> SchedulerState<K, T> {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            ready: VecDeque::new(),
            throttled: Vec::new(),
            pending: 0,
            in_flight: 0,
            in_flight_load_balancer: 0,
            closed: false,
        }
    }

    fn load(&self) -> QueueLoad {
        QueueLoad {
            pending: self.pending,
            in_flight: self.in_flight,
            in_flight_load_balancer: self.in_flight_load_balancer,
        }
    }

    fn rearm_throttled(&mut self) -> usize {
        let count = self.throttled.len();
        for key in self.throttled.drain(..) {
            if let Some(slot) = self.slots.get_mut(&key) {
                slot.status = SlotStatus::Ready;
                self.ready.push_back(key);
            }
        }
        count
    }
}

enum Dispatch<K, T> {
    Job(EntityJobItem<K, T>),
    Wait,
    Closed,
}

struct QueueInner<K: EntityKey, T, O> {
    name: String,
    config: JobQueueConfig,
    owner: Arc<O>,
    state: Mutex<SchedulerState<K, T>>,
    wakeup: Notify,
    counters: QueueCounters,
}

/// Per-key exclusive job queue
pub struct EntityJobQueue<K: EntityKey, T, O> {
    inner: Arc<QueueInner<K, T, O>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<K, T, O> EntityJobQueue<K, T, O>
where
    K: EntityKey,
    T: Send + 'static,
    O: JobQueueOwner<K, T>,
{
    /// Create the queue and spawn its workers. Must be called inside a tokio runtime.
    pub fn new(name: impl Into<String>, config: JobQueueConfig, owner: Arc<O>) -> Self {
        let name = name.into();
        let worker_count = config.worker_count.max(1);
        info!(
            queue = %name,
            workers = worker_count,
            max_queue_size = config.max_queue_size,
            "🚀 JOB_QUEUE: Starting workers"
        );

        let inner = Arc::new(QueueInner {
            name,
            config,
            owner,
            state: Mutex::new(SchedulerState::new()),
            wakeup: Notify::new(),
            counters: QueueCounters::default(),
        });

        let workers = (0..worker_count)
            .map(|worker_id| tokio::spawn(Arc::clone(&inner).run_worker(worker_id)))
            .collect();

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn owner(&self) -> &Arc<O> {
        &self.inner.owner
    }

    /// Admit `job`, coalescing it with the key's last pending job when both allow it.
    ///
    /// Rejected jobs are completed with [`JobCompletion::Rejected`]; the queue never
    /// retries them.
    pub fn enqueue(&self, job: EntityJobItem<K, T>) -> Result<EnqueueOutcome, JobQueueError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        if state.closed {
            drop(state);
            let completion = JobCompletion::Rejected("queue closed".to_string());
            inner.counters.record(&completion);
            job.complete(completion);
            return Err(JobQueueError::Closed {
                queue: inner.name.clone(),
            });
        }

        let combined = match state
            .slots
            .get_mut(job.key())
            .and_then(|slot| slot.jobs.back_mut())
        {
            Some(last) if last.can_combine(&job) => {
                last.append(&job);
                true
            }
            _ => false,
        };
        if combined {
            drop(state);
            log_job_operation(
                "enqueue",
                &inner.name,
                &job.key().to_string(),
                "combined",
                Some(job.kind().name()),
            );
            inner.counters.record(&JobCompletion::Combined);
            job.complete(JobCompletion::Combined);
            return Ok(EnqueueOutcome::Combined);
        }

        if state.pending >= inner.config.max_queue_size {
            let size = state.pending;
            drop(state);
            job.on_queue_full(&*inner.owner, &inner.name, size);
            let completion = JobCompletion::Rejected("queue full".to_string());
            inner.counters.record(&completion);
            job.complete(completion);
            return Err(JobQueueError::QueueFull {
                queue: inner.name.clone(),
                size,
            });
        }

        let key = job.key().clone();
        let activity_id = job.activity_id();
        let kind = job.kind();
        let state = &mut *state;
        match state.slots.get_mut(&key) {
            Some(slot) => slot.jobs.push_back(job),
            None => {
                state.slots.insert(
                    key.clone(),
                    KeySlot {
                        jobs: VecDeque::from([job]),
                        status: SlotStatus::Ready,
                    },
                );
                state.ready.push_back(key.clone());
            }
        }
        state.pending += 1;
        let pending = state.pending;
        inner.counters.record_enqueued();

        debug!(
            queue = %inner.name,
            entity = %key,
            activity_id = %activity_id,
            kind = %kind,
            pending = pending,
            "📥 JOB_QUEUE: Job enqueued"
        );
        inner.wakeup.notify_one();
        Ok(EnqueueOutcome::Queued)
    }

    /// Stop admitting work and abandon every pending job. In-flight jobs finish.
    pub fn close(&self) {
        let abandoned: Vec<EntityJobItem<K, T>> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.ready.clear();
            state.throttled.clear();
            state.pending = 0;

            let mut drained = Vec::new();
            state.slots.retain(|_, slot| {
                drained.extend(slot.jobs.drain(..));
                slot.status == SlotStatus::InFlight
            });
            drained
        };

        info!(
            queue = %self.inner.name,
            abandoned = abandoned.len(),
            "🛑 JOB_QUEUE: Closed"
        );
        for job in abandoned {
            self.inner.counters.record(&JobCompletion::Abandoned);
            job.complete(JobCompletion::Abandoned);
        }
        self.inner.wakeup.notify_waiters();
    }

    /// Close the queue and wait for every worker to exit
    pub async fn shutdown(&self) {
        self.close();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(join_error) = worker.await {
                error!(queue = %self.inner.name, error = %join_error, "Worker exited abnormally");
            }
        }
        debug!(queue = %self.inner.name, "🛑 JOB_QUEUE: Workers stopped");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn load(&self) -> QueueLoad {
        self.inner.state.lock().load()
    }

    pub fn metrics(&self) -> JobQueueMetrics {
        let load = self.load();
        self.inner.counters.snapshot(load.pending, load.in_flight)
    }
}

impl<K: EntityKey, T, O> fmt::Debug for EntityJobQueue<K, T, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityJobQueue")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<K, T, O> QueueInner<K, T, O>
where
    K: EntityKey,
    T: Send + 'static,
    O: JobQueueOwner<K, T>,
{
    async fn run_worker(self: Arc<Self>, worker_id: usize) {
        let recheck = Duration::from_millis(self.config.throttle_recheck_interval_ms.max(1));
        debug!(queue = %self.name, worker_id = worker_id, "JOB_QUEUE: Worker started");

        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.next_job() {
                Dispatch::Job(job) => self.run_job(job).await,
                Dispatch::Closed => break,
                Dispatch::Wait => {
                    if tokio::time::timeout(recheck, notified).await.is_err() {
                        self.state.lock().rearm_throttled();
                    }
                }
            }
        }

        debug!(queue = %self.name, worker_id = worker_id, "JOB_QUEUE: Worker exiting");
    }

    /// Pop the next dispatchable job, moving throttled keys aside
    fn next_job(&self) -> Dispatch<K, T> {
        let mut state = self.state.lock();
        let state = &mut *state;

        while let Some(key) = state.ready.pop_front() {
            let load = state.load();
            let Some(slot) = state.slots.get_mut(&key) else {
                continue;
            };
            let Some(front) = slot.jobs.front() else {
                continue;
            };

            if front.need_throttle(&*self.owner, &load) {
                slot.status = SlotStatus::Throttled;
                debug!(
                    queue = %self.name,
                    entity = %key,
                    in_flight = load.in_flight,
                    "⏸️ JOB_QUEUE: Job throttled"
                );
                state.throttled.push(key);
                self.counters.record_throttle_deferral();
                continue;
            }

            let Some(job) = slot.jobs.pop_front() else {
                continue;
            };
            slot.status = SlotStatus::InFlight;
            state.pending -= 1;
            state.in_flight += 1;
            if job.origin().is_load_balancer() {
                state.in_flight_load_balancer += 1;
            }
            return Dispatch::Job(job);
        }

        if state.closed {
            Dispatch::Closed
        } else {
            Dispatch::Wait
        }
    }

    async fn run_job(&self, mut job: EntityJobItem<K, T>) {
        let key = job.key().clone();
        let activity_id = job.activity_id();
        let kind = job.kind();
        let load_balancer = job.origin().is_load_balancer();
        let callback = job.take_completion();
        let owner = Arc::clone(&self.owner);

        debug!(
            queue = %self.name,
            entity = %key,
            activity_id = %activity_id,
            kind = %kind,
            "📤 JOB_QUEUE: Job dispatched"
        );

        let joined = tokio::task::spawn_blocking(move || {
            std::panic::catch_unwind(AssertUnwindSafe(|| job.process_job(&*owner)))
        })
        .await;

        let completion = match joined {
            Ok(Ok(completion)) => completion,
            Ok(Err(payload)) => JobCompletion::Panicked(panic_message(&*payload)),
            Err(join_error) => JobCompletion::Panicked(join_error.to_string()),
        };

        match &completion {
            JobCompletion::Panicked(reason) => error!(
                queue = %self.name,
                entity = %key,
                activity_id = %activity_id,
                kind = %kind,
                reason = %reason,
                "💥 JOB_QUEUE: Job panicked, entity lock released"
            ),
            JobCompletion::Failed(reason) => warn!(
                queue = %self.name,
                entity = %key,
                activity_id = %activity_id,
                kind = %kind,
                reason = %reason,
                "❌ JOB_QUEUE: Job failed"
            ),
            _ => {}
        }
        log_job_operation(
            "process",
            &self.name,
            &key.to_string(),
            completion.status(),
            Some(kind.name()),
        );
        self.counters.record(&completion);

        self.finish(&key, load_balancer);
        if let Some(callback) = callback {
            callback(completion);
        }
    }

    /// Release the key's in-flight slot and re-arm throttled keys
    fn finish(&self, key: &K, load_balancer: bool) {
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            state.in_flight -= 1;
            if load_balancer {
                state.in_flight_load_balancer -= 1;
            }

            let has_more = match state.slots.get_mut(key) {
                Some(slot) if !slot.jobs.is_empty() => {
                    slot.status = SlotStatus::Ready;
                    true
                }
                _ => false,
            };
            if has_more {
                state.ready.push_back(key.clone());
            } else {
                state.slots.remove(key);
            }
            state.rearm_throttled();
        }
        self.wakeup.notify_waiters();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
