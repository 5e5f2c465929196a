//! # Reconfiguration Agent
//!
//! Owns the failover unit table, the failover unit job queue and the two staleness
//! gates. Inbound messages are checked against the staleness gates, wrapped in a
//! [`FailoverUnitJob`] and handed to the queue; all state changes happen inside job
//! processors under the failover unit lock.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ra_core::config::ReconfigurationAgentConfig;
//! use ra_core::entity::InMemoryEntityStore;
//! use ra_core::ra::ReconfigurationAgent;
//! use ra_core::state_machine::ChannelActionExecutor;
//! use ra_core::types::NodeInstance;
//!
//! # async fn example() -> ra_core::Result<()> {
//! let (executor, _actions) = ChannelActionExecutor::new();
//! let agent = ReconfigurationAgent::new(
//!     NodeInstance::new(1, 1),
//!     ReconfigurationAgentConfig::default(),
//!     Arc::new(InMemoryEntityStore::new()),
//!     Arc::new(executor),
//! )?;
//! agent.open()?;
//! agent.close().await;
//! # Ok(())
//! # }
//! ```

pub mod failover_unit;
pub mod messages;
pub mod processors;

pub use failover_unit::{
    FailoverUnit, FailoverUnitContext, FailoverUnitJob, FailoverUnitState, ReplicaDescription,
    ReplicaRole,
};
pub use messages::{
    FailoverUnitMessage, MessageBody, OperationResult, ServiceTypeNotification, DO_RECONFIGURATION,
    REPLICA_CLOSE, REPLICA_CLOSE_REPLY, REPLICA_OPEN, REPLICA_OPEN_REPLY, RETRY_TIMER,
    SERVICE_TYPE_REGISTERED,
};
pub use processors::AgentEnvironment;

use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReconfigurationAgentConfig;
use crate::entity::{EntityMap, EntityStore};
use crate::error::{ProcessingError, ReconfigurationError, Result};
use crate::job::{
    EnqueueOutcome, EntityJobItem, EntityJobQueue, JobCompletion, JobOrigin, JobQueueMetrics,
    JobQueueOwner, JobSource, QueueLoad, WarningThrottle,
};
use crate::logging::{log_error, log_staleness_rejection};
use crate::staleness::{
    PartitionStalenessChecker, SequenceAdvance, ServiceTypeUpdateStalenessChecker, StalenessChecker,
};
use crate::state_machine::{ActionExecutor, RetryTimer, RetryableErrorStateName};
use crate::types::{EntityKey, FailoverUnitId, NodeInstance};

pub type FailoverUnitJobQueue = EntityJobQueue<FailoverUnitId, FailoverUnit, AgentCore>;

/// Collaborators shared between the agent and its job queue
pub struct AgentCore {
    node: NodeInstance,
    entity_map: EntityMap<FailoverUnitId, FailoverUnit>,
    store: Arc<dyn EntityStore<FailoverUnitId, FailoverUnit>>,
    executor: Arc<dyn ActionExecutor<FailoverUnitId>>,
    environment: Arc<AgentEnvironment>,
    closing: AtomicBool,
    queue_full_warnings: WarningThrottle,
    max_parallel_load_balancer_jobs: usize,
}

impl AgentCore {
    pub fn node(&self) -> NodeInstance {
        self.node
    }

    pub fn environment(&self) -> &Arc<AgentEnvironment> {
        &self.environment
    }
}

impl JobQueueOwner<FailoverUnitId, FailoverUnit> for AgentCore {
    fn entity_map(&self) -> &EntityMap<FailoverUnitId, FailoverUnit> {
        &self.entity_map
    }

    fn store(&self) -> &dyn EntityStore<FailoverUnitId, FailoverUnit> {
        &*self.store
    }

    fn action_executor(&self) -> &dyn ActionExecutor<FailoverUnitId> {
        &*self.executor
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Load balancing work is capped so placement bursts cannot starve replies
    fn need_throttle(&self, job: &FailoverUnitJob, load: &QueueLoad) -> bool {
        job.origin().is_load_balancer()
            && load.in_flight_load_balancer >= self.max_parallel_load_balancer_jobs
    }

    fn on_queue_full(&self, queue_name: &str, entity: &FailoverUnitId, current_size: usize) {
        if let Some(suppressed) = self.queue_full_warnings.try_emit() {
            warn!(
                queue = %queue_name,
                entity = %entity,
                pending = current_size,
                suppressed = suppressed,
                "🚧 JOB_QUEUE: Queue full, job rejected"
            );
        }
    }
}

/// Node-local reconfiguration agent
pub struct ReconfigurationAgent {
    core: Arc<AgentCore>,
    job_queue: FailoverUnitJobQueue,
    partition_staleness: Arc<PartitionStalenessChecker>,
    service_type_staleness: Arc<ServiceTypeUpdateStalenessChecker>,
    cleanup_tasks: Mutex<Vec<JoinHandle<()>>>,
    open: AtomicBool,
}

impl ReconfigurationAgent {
    /// Build an agent. Must be called from within a tokio runtime; the job queue
    /// workers start immediately but no message is accepted until [`open`](Self::open).
    pub fn new(
        node: NodeInstance,
        config: ReconfigurationAgentConfig,
        store: Arc<dyn EntityStore<FailoverUnitId, FailoverUnit>>,
        executor: Arc<dyn ActionExecutor<FailoverUnitId>>,
    ) -> Result<Self> {
        config.validate()?;

        let keep = config.staleness.entry_keep_duration();
        let queue_config = config.job_queue.clone();
        let core = Arc::new(AgentCore {
            node,
            entity_map: EntityMap::new(),
            store,
            executor,
            queue_full_warnings: WarningThrottle::new(queue_config.queue_full_warning_interval()),
            max_parallel_load_balancer_jobs: queue_config.max_parallel_load_balancer_jobs,
            environment: Arc::new(AgentEnvironment::new(config)),
            closing: AtomicBool::new(false),
        });

        let job_queue = EntityJobQueue::new("failover_unit", queue_config, Arc::clone(&core));

        Ok(Self {
            core,
            job_queue,
            partition_staleness: Arc::new(PartitionStalenessChecker::new("partition", keep)),
            service_type_staleness: Arc::new(ServiceTypeUpdateStalenessChecker::new(
                "service_type_update",
                keep,
            )),
            cleanup_tasks: Mutex::new(Vec::new()),
            open: AtomicBool::new(false),
        })
    }

    /// Recover failover units from the store and start accepting messages.
    /// Returns the number of recovered units.
    pub fn open(&self) -> Result<usize> {
        if self.job_queue.is_closed() || self.core.is_closing() {
            return Err(ReconfigurationError::Closed);
        }
        if self.open.load(Ordering::Acquire) {
            return Ok(0);
        }

        let recovered = self
            .core
            .entity_map
            .recover(&*self.core.store)
            .map_err(|error| {
                log_error("reconfiguration_agent", "open", &error.to_string(), None);
                ReconfigurationError::from(error)
            })?;

        let interval = self.core.environment.config.staleness.cleanup_interval();
        {
            let mut tasks = self.cleanup_tasks.lock();
            tasks.push(self.partition_staleness.spawn_cleanup_task(interval));
            tasks.push(self.service_type_staleness.spawn_cleanup_task(interval));
        }

        self.open.store(true, Ordering::Release);
        info!(
            node = %self.core.node,
            recovered = recovered,
            "🚀 RECONFIGURATION_AGENT: Opened"
        );
        Ok(recovered)
    }

    /// Stop accepting messages, abandon pending jobs and wait for in-flight jobs.
    /// Actions of jobs finishing during close are abandoned.
    pub async fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.core.closing.store(true, Ordering::Release);
        self.job_queue.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.cleanup_tasks.lock());
        for task in tasks {
            task.abort();
        }
        info!(node = %self.core.node, "🛑 RECONFIGURATION_AGENT: Closed");
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Accept a failover unit message and schedule its processing.
    ///
    /// Messages carrying a sequence number pass the partition staleness gate first;
    /// duplicates and reordered messages are rejected with
    /// [`ReconfigurationError::Stale`] before any lock is taken.
    pub fn process_failover_unit_message(
        &self,
        from: NodeInstance,
        message: FailoverUnitMessage,
    ) -> Result<Receiver<JobCompletion>> {
        self.ensure_open()?;

        let FailoverUnitMessage {
            failover_unit_id,
            sequence_number,
            source,
            body,
        } = message;

        let advance = match sequence_number {
            Some(sequence_number) => Some(admit(
                &self.partition_staleness,
                &failover_unit_id,
                sequence_number,
            )?),
            None => None,
        };

        let kind = body.kind();
        let processor = message_processor(Arc::clone(&self.core.environment), body);

        let job = match source {
            JobSource::Federation => {
                FailoverUnitJob::from_federation(failover_unit_id, from, kind, processor)
            }
            JobSource::LoadBalancer => {
                FailoverUnitJob::from_load_balancer(failover_unit_id, from, kind, processor)
            }
            JobSource::Local => {
                EntityJobItem::new(failover_unit_id, kind, JobOrigin::local(), processor)
            }
        };

        let (job, receiver) = job.with_completion_channel();
        if let Err(error) = self.enqueue(job) {
            // Not admitted: the caller retries with the same sequence number
            if let Some(advance) = advance {
                self.partition_staleness.revert(&failover_unit_id, advance);
            }
            return Err(error);
        }
        Ok(receiver)
    }

    /// Apply a service type registration change.
    ///
    /// Failover units waiting for the registration get a combinable job that resumes
    /// their pending open or close. Returns the number of units scheduled.
    pub fn process_service_type_notification(
        &self,
        notification: ServiceTypeNotification,
    ) -> Result<usize> {
        self.ensure_open()?;

        let ServiceTypeNotification {
            service_type,
            sequence_number,
            registered,
        } = notification;

        let advance = admit(&self.service_type_staleness, &service_type, sequence_number)?;

        self.core
            .environment
            .set_registered(&service_type, registered);
        if !registered {
            debug!(service_type = %service_type, "Service type unregistered");
            return Ok(0);
        }

        let waiting: Vec<FailoverUnitId> = self
            .core
            .entity_map
            .keys()
            .into_iter()
            .filter(|id| {
                self.failover_unit(id).is_some_and(|unit| {
                    unit.service_type == service_type
                        && is_waiting_for_registration(unit.retry_state.current_state())
                })
            })
            .collect();

        for id in &waiting {
            let environment = Arc::clone(&self.core.environment);
            let job = EntityJobItem::new(
                *id,
                SERVICE_TYPE_REGISTERED,
                JobOrigin::local(),
                move |context: &mut FailoverUnitContext<'_>| {
                    processors::resume_pending_operation(context, &environment, Instant::now())
                },
            )
            .combinable();
            if let Err(error) = self.enqueue(job) {
                self.service_type_staleness.revert(&service_type, advance);
                return Err(error);
            }
        }

        info!(
            service_type = %service_type,
            scheduled = waiting.len(),
            "📣 RECONFIGURATION_AGENT: Service type registered"
        );
        Ok(waiting.len())
    }

    /// Retry timer expiry for one failover unit
    pub fn process_retry_timer(&self, id: FailoverUnitId, timer: RetryTimer) -> Result<EnqueueOutcome> {
        self.ensure_open()?;
        debug!(failover_unit = %id, timer = ?timer, "⏰ RECONFIGURATION_AGENT: Retry timer fired");

        let environment = Arc::clone(&self.core.environment);
        let job = EntityJobItem::new(
            id,
            RETRY_TIMER,
            JobOrigin::local(),
            move |context: &mut FailoverUnitContext<'_>| {
                processors::resume_pending_operation(context, &environment, Instant::now())
            },
        )
        .combinable();
        self.enqueue(job)
    }

    /// Schedule an arbitrary failover unit job
    pub fn enqueue(&self, job: FailoverUnitJob) -> Result<EnqueueOutcome> {
        self.ensure_open()?;
        Ok(self.job_queue.enqueue(job)?)
    }

    /// Copy of the current failover unit, if it exists and is not deleted
    pub fn failover_unit(&self, id: &FailoverUnitId) -> Option<FailoverUnit> {
        self.core
            .entity_map
            .get(id)
            .and_then(|entry| entry.snapshot())
    }

    pub fn failover_unit_count(&self) -> usize {
        self.core.entity_map.len()
    }

    pub fn metrics(&self) -> JobQueueMetrics {
        self.job_queue.metrics()
    }

    pub fn environment(&self) -> &Arc<AgentEnvironment> {
        self.core.environment()
    }

    pub fn partition_staleness(&self) -> &Arc<PartitionStalenessChecker> {
        &self.partition_staleness
    }

    pub fn service_type_staleness(&self) -> &Arc<ServiceTypeUpdateStalenessChecker> {
        &self.service_type_staleness
    }

    fn ensure_open(&self) -> Result<()> {
        if self.core.is_closing() {
            return Err(ReconfigurationError::Closed);
        }
        if !self.open.load(Ordering::Acquire) {
            return Err(ReconfigurationError::NotOpen);
        }
        Ok(())
    }
}

fn message_processor(
    environment: Arc<AgentEnvironment>,
    body: MessageBody,
) -> impl FnOnce(&mut FailoverUnitContext<'_>) -> std::result::Result<(), ProcessingError> + Send + 'static
{
    move |context| processors::process_message(context, &environment, body, Instant::now())
}

/// Pass `sequence_number` through a staleness gate, logging and rejecting stale input
fn admit<K: EntityKey>(
    checker: &StalenessChecker<K>,
    key: &K,
    sequence_number: u64,
) -> Result<SequenceAdvance> {
    if let Some(advance) = checker.try_advance(key, sequence_number, Instant::now()) {
        return Ok(advance);
    }
    let current = checker.current(key).unwrap_or(sequence_number);
    log_staleness_rejection(checker.name(), &key.to_string(), sequence_number, current);
    Err(ReconfigurationError::Stale {
        key: key.to_string(),
        sequence_number,
        current,
    })
}

fn is_waiting_for_registration(state: RetryableErrorStateName) -> bool {
    matches!(
        state,
        RetryableErrorStateName::FindServiceRegistrationAtOpen
            | RetryableErrorStateName::FindServiceRegistrationAtReopen
            | RetryableErrorStateName::FindServiceRegistrationAtDrop
    )
}

impl Drop for ReconfigurationAgent {
    fn drop(&mut self) {
        for task in self.cleanup_tasks.get_mut().drain(..) {
            task.abort();
        }
        self.job_queue.close();
    }
}
