use crossbeam::channel::Receiver;
use ra_core::config::JobQueueConfig;
use ra_core::entity::{EntityMap, EntityStore, InMemoryEntityStore};
use ra_core::job::{EntityJobItem, JobQueueOwner, QueueLoad};
use ra_core::state_machine::{
    ActionDisposition, ActionExecutor, ChannelActionExecutor, DispatchedAction,
};
use ra_core::types::EntityKey;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Queue owner backed by an in-memory store and a channel executor
pub struct TestOwner<K: EntityKey, T> {
    pub entity_map: EntityMap<K, T>,
    pub store: InMemoryEntityStore<K>,
    pub executor: ChannelActionExecutor<K>,
    pub closing: AtomicBool,
    pub throttle_load_balancer: AtomicBool,
    pub queue_full_events: AtomicUsize,
}

impl<K: EntityKey, T> TestOwner<K, T> {
    pub fn new() -> (Arc<Self>, Receiver<DispatchedAction<K>>) {
        let (executor, actions) = ChannelActionExecutor::new();
        let owner = Arc::new(Self {
            entity_map: EntityMap::new(),
            store: InMemoryEntityStore::new(),
            executor,
            closing: AtomicBool::new(false),
            throttle_load_balancer: AtomicBool::new(false),
            queue_full_events: AtomicUsize::new(0),
        });
        (owner, actions)
    }

    pub fn set_closing(&self, closing: bool) {
        self.closing.store(closing, Ordering::SeqCst);
    }

    pub fn set_throttle_load_balancer(&self, throttle: bool) {
        self.throttle_load_balancer.store(throttle, Ordering::SeqCst);
    }
}

impl<K, T> JobQueueOwner<K, T> for TestOwner<K, T>
where
    K: EntityKey,
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn entity_map(&self) -> &EntityMap<K, T> {
        &self.entity_map
    }

    fn store(&self) -> &dyn EntityStore<K, T> {
        &self.store
    }

    fn action_executor(&self) -> &dyn ActionExecutor<K> {
        &self.executor
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn need_throttle(&self, job: &EntityJobItem<K, T>, _load: &QueueLoad) -> bool {
        job.origin().is_load_balancer() && self.throttle_load_balancer.load(Ordering::SeqCst)
    }

    fn on_queue_full(&self, _queue_name: &str, _entity: &K, _current_size: usize) {
        self.queue_full_events.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn test_queue_config(worker_count: usize) -> JobQueueConfig {
    JobQueueConfig {
        worker_count,
        max_queue_size: 1_000,
        throttle_recheck_interval_ms: 20,
        ..JobQueueConfig::default()
    }
}

/// Drain every action dispatched so far
pub fn drain_actions<K>(receiver: &Receiver<DispatchedAction<K>>) -> Vec<DispatchedAction<K>> {
    receiver.try_iter().collect()
}

pub fn performed<K>(actions: &[DispatchedAction<K>]) -> usize {
    actions
        .iter()
        .filter(|action| action.disposition == ActionDisposition::Performed)
        .count()
}

pub fn cancelled<K>(actions: &[DispatchedAction<K>]) -> usize {
    actions
        .iter()
        .filter(|action| action.disposition == ActionDisposition::Cancelled)
        .count()
}
