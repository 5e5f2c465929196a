mod common;

use common::*;
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use ra_core::entity::{CommitType, EntityMap, EntityStore, InMemoryEntityStore, StoreError};
use ra_core::job::{
    EnqueueOutcome, EntityJobItem, EntityJobQueue, JobCompletion, JobKind, JobOrigin,
    JobQueueError, JobQueueOwner,
};
use ra_core::state_machine::{ActionExecutor, RetryTimer, StateMachineAction};
use ra_core::types::{ActivityId, NodeInstance};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const INCREMENT: JobKind = JobKind::new("increment");
const REFRESH: JobKind = JobKind::new("refresh");
const BLOCK: JobKind = JobKind::new("block");

type CounterOwner = TestOwner<String, u64>;
type CounterJob = EntityJobItem<String, u64>;

fn increment(key: &str) -> CounterJob {
    CounterJob::new(key.to_string(), INCREMENT, JobOrigin::local(), |context| {
        let next = context.current().copied().unwrap_or(0) + 1;
        context.upsert(next);
        context.enqueue_action(StateMachineAction::CancelRetryTimer {
            timer: RetryTimer::ReplicaProxyMessage,
        });
        Ok(())
    })
}

/// Job that signals when it starts and holds its key until `release` fires
fn blocker(key: &str) -> (CounterJob, Receiver<()>, Sender<()>) {
    let (started_tx, started_rx) = bounded(1);
    let (release_tx, release_rx) = bounded::<()>(1);
    let job = CounterJob::new(key.to_string(), BLOCK, JobOrigin::local(), move |_context| {
        let _ = started_tx.send(());
        let _ = release_rx.recv_timeout(COMPLETION_TIMEOUT);
        Ok(())
    });
    (job, started_rx, release_tx)
}

async fn wait_started(started: Receiver<()>) {
    tokio::task::spawn_blocking(move || started.recv_timeout(COMPLETION_TIMEOUT))
        .await
        .expect("waiter panicked")
        .expect("blocker never started");
}

fn counter_value(owner: &CounterOwner, key: &str) -> Option<u64> {
    owner
        .entity_map
        .get(&key.to_string())
        .and_then(|entry| entry.snapshot())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_jobs_for_same_key_never_overlap() {
    let (owner, _actions) = CounterOwner::new();
    let queue = EntityJobQueue::new("exclusivity", test_queue_config(8), Arc::clone(&owner));

    let keys = ["fu-a", "fu-b", "fu-c", "fu-d"];
    let active: HashMap<&str, Arc<AtomicUsize>> = keys
        .iter()
        .map(|key| (*key, Arc::new(AtomicUsize::new(0))))
        .collect();
    let overlap = Arc::new(AtomicBool::new(false));

    let mut receivers = Vec::new();
    for round in 0..25 {
        for key in keys {
            let active = Arc::clone(&active[key]);
            let overlap = Arc::clone(&overlap);
            let (job, receiver) = CounterJob::new(
                key.to_string(),
                INCREMENT,
                JobOrigin::local(),
                move |context| {
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlap.store(true, Ordering::SeqCst);
                    }
                    if round % 5 == 0 {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    let next = context.current().copied().unwrap_or(0) + 1;
                    context.upsert(next);
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .with_completion_channel();
            queue.enqueue(job).expect("enqueue");
            receivers.push(receiver);
        }
    }

    for receiver in receivers {
        assert!(wait_for(receiver).await.is_success());
    }

    assert!(!overlap.load(Ordering::SeqCst), "jobs for one key overlapped");
    for key in keys {
        assert_eq!(counter_value(&owner, key), Some(25));
    }
    assert_eq!(queue.metrics().completed, 100);
    queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_successful_job_commits_then_executes_actions() {
    let (owner, actions) = CounterOwner::new();
    let queue = EntityJobQueue::new("commit", test_queue_config(2), Arc::clone(&owner));

    let (job, receiver) = increment("fu-1").with_completion_channel();
    queue.enqueue(job).expect("enqueue");
    assert_eq!(
        wait_for(receiver).await,
        JobCompletion::Completed {
            commit: CommitType::Insert,
            actions: 1
        }
    );

    let (job, receiver) = increment("fu-1").with_completion_channel();
    queue.enqueue(job).expect("enqueue");
    assert_eq!(
        wait_for(receiver).await,
        JobCompletion::Completed {
            commit: CommitType::Update,
            actions: 1
        }
    );

    assert_eq!(owner.store.get::<u64>(&"fu-1".to_string()).unwrap(), Some(2));
    let dispatched = drain_actions(&actions);
    assert_eq!(performed(&dispatched), 2);
    assert_eq!(cancelled(&dispatched), 0);
    queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_commit_failure_leaves_entity_and_abandons_actions() {
    let (owner, actions) = CounterOwner::new();
    let queue = EntityJobQueue::new("commit_failure", test_queue_config(1), Arc::clone(&owner));
    owner
        .store
        .fail_next_commit(StoreError::Unavailable("disk offline".to_string()));

    let (job, receiver) = increment("fu-1").with_completion_channel();
    queue.enqueue(job).expect("enqueue");

    match wait_for(receiver).await {
        JobCompletion::Failed(reason) => assert!(reason.contains("disk offline")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(counter_value(&owner, "fu-1"), None);
    assert!(owner.store.is_empty());

    let dispatched = drain_actions(&actions);
    assert_eq!(performed(&dispatched), 0);
    assert_eq!(cancelled(&dispatched), 1);
    queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_of_unpersisted_entity_skips_store() {
    let (owner, _actions) = CounterOwner::new();
    let queue = EntityJobQueue::new("delete", test_queue_config(1), Arc::clone(&owner));

    let (job, receiver) = CounterJob::new(
        "fresh".to_string(),
        INCREMENT,
        JobOrigin::local(),
        |context| {
            context.delete();
            Ok(())
        },
    )
    .with_completion_channel();
    queue.enqueue(job).expect("enqueue");

    assert_eq!(
        wait_for(receiver).await,
        JobCompletion::Completed {
            commit: CommitType::None,
            actions: 0
        }
    );
    assert!(owner.store.is_empty());
    let entry = owner.entity_map.get(&"fresh".to_string()).expect("entry");
    assert!(entry.is_deleted());
    queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_combinable_job_coalesces_into_last_pending() {
    let (owner, _actions) = CounterOwner::new();
    let queue = EntityJobQueue::new("coalesce", test_queue_config(1), Arc::clone(&owner));

    let (block, started, release) = blocker("fu-1");
    queue.enqueue(block).expect("enqueue");
    wait_started(started).await;

    let refresh = || {
        CounterJob::new("fu-1".to_string(), REFRESH, JobOrigin::local(), |context| {
            let next = context.current().copied().unwrap_or(0) + 10;
            context.upsert(next);
            Ok(())
        })
        .combinable()
    };

    let (first, first_done) = refresh().with_completion_channel();
    let (second, second_done) = refresh().with_completion_channel();
    assert_eq!(queue.enqueue(first).unwrap(), EnqueueOutcome::Queued);
    assert_eq!(queue.enqueue(second).unwrap(), EnqueueOutcome::Combined);
    assert_eq!(wait_for(second_done).await, JobCompletion::Combined);

    // Different kind never coalesces
    let (other, other_done) = increment("fu-1").with_completion_channel();
    assert_eq!(queue.enqueue(other).unwrap(), EnqueueOutcome::Queued);

    release.send(()).unwrap();
    assert!(wait_for(first_done).await.is_success());
    assert!(wait_for(other_done).await.is_success());
    assert_eq!(counter_value(&owner, "fu-1"), Some(11));
    assert_eq!(queue.metrics().combined, 1);
    queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_full_rejects_and_notifies_owner() {
    let (owner, _actions) = CounterOwner::new();
    let mut config = test_queue_config(1);
    config.max_queue_size = 2;
    let queue = EntityJobQueue::new("bounded", config, Arc::clone(&owner));

    let (block, started, release) = blocker("fu-1");
    queue.enqueue(block).expect("enqueue");
    wait_started(started).await;

    queue.enqueue(increment("fu-1")).expect("first pending");
    queue.enqueue(increment("fu-2")).expect("second pending");

    let (overflow, overflow_done) = increment("fu-3").with_completion_channel();
    let error = queue.enqueue(overflow).unwrap_err();
    assert!(matches!(error, JobQueueError::QueueFull { size: 2, .. }));
    assert!(matches!(
        wait_for(overflow_done).await,
        JobCompletion::Rejected(_)
    ));
    assert_eq!(owner.queue_full_events.load(Ordering::SeqCst), 1);

    release.send(()).unwrap();
    queue.shutdown().await;
    assert_eq!(queue.metrics().rejected, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_abandons_pending_and_rejects_new_work() {
    let (owner, _actions) = CounterOwner::new();
    let queue = EntityJobQueue::new("closing", test_queue_config(1), Arc::clone(&owner));

    let (block, started, release) = blocker("fu-1");
    let (block, block_done) = block.with_completion_channel();
    queue.enqueue(block).expect("enqueue");
    wait_started(started).await;

    let (pending, pending_done) = increment("fu-2").with_completion_channel();
    queue.enqueue(pending).expect("enqueue");

    queue.close();
    assert_eq!(wait_for(pending_done).await, JobCompletion::Abandoned);
    assert!(matches!(
        queue.enqueue(increment("fu-3")),
        Err(JobQueueError::Closed { .. })
    ));

    release.send(()).unwrap();
    assert!(wait_for(block_done).await.is_success());
    queue.shutdown().await;
    assert_eq!(counter_value(&owner, "fu-2"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_closing_owner_commits_but_abandons_actions() {
    let (owner, actions) = CounterOwner::new();
    let queue = EntityJobQueue::new("owner_closing", test_queue_config(1), Arc::clone(&owner));
    owner.set_closing(true);

    let (job, receiver) = increment("fu-1").with_completion_channel();
    queue.enqueue(job).expect("enqueue");

    assert_eq!(wait_for(receiver).await, JobCompletion::Abandoned);
    assert_eq!(counter_value(&owner, "fu-1"), Some(1));
    let dispatched = drain_actions(&actions);
    assert_eq!(performed(&dispatched), 0);
    assert_eq!(cancelled(&dispatched), 1);
    queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_throttled_load_balancer_job_waits_for_release() {
    let (owner, _actions) = CounterOwner::new();
    let queue = EntityJobQueue::new("throttle", test_queue_config(2), Arc::clone(&owner));
    owner.set_throttle_load_balancer(true);

    let (balance, balance_done) = CounterJob::new(
        "fu-lb".to_string(),
        INCREMENT,
        JobOrigin::load_balancer(NodeInstance::new(9, 1)),
        |context| {
            context.upsert(1);
            Ok(())
        },
    )
    .with_completion_channel();
    queue.enqueue(balance).expect("enqueue");

    let (regular, regular_done) = increment("fu-other").with_completion_channel();
    queue.enqueue(regular).expect("enqueue");
    assert!(wait_for(regular_done).await.is_success());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(balance_done.try_recv().is_err(), "throttled job ran");
    assert!(queue.metrics().throttle_deferrals >= 1);

    owner.set_throttle_load_balancer(false);
    assert!(wait_for(balance_done).await.is_success());
    assert_eq!(counter_value(&owner, "fu-lb"), Some(1));
    queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_processor_releases_lock_and_other_keys_continue() {
    let (owner, _actions) = CounterOwner::new();
    let queue = EntityJobQueue::new("panics", test_queue_config(2), Arc::clone(&owner));

    let (seed, seed_done) = increment("fu-x").with_completion_channel();
    queue.enqueue(seed).expect("enqueue");
    assert!(wait_for(seed_done).await.is_success());

    let (explode, explode_done) = CounterJob::new(
        "fu-x".to_string(),
        INCREMENT,
        JobOrigin::local(),
        |context| {
            context.upsert(100);
            panic!("processor exploded");
        },
    )
    .with_completion_channel();
    let (other, other_done) = increment("fu-y").with_completion_channel();
    queue.enqueue(explode).expect("enqueue");
    queue.enqueue(other).expect("enqueue");

    match wait_for(explode_done).await {
        JobCompletion::Panicked(reason) => assert!(reason.contains("processor exploded")),
        completion => panic!("expected panic completion, got {completion:?}"),
    }
    assert!(wait_for(other_done).await.is_success());

    // The key is usable again and the staged value was discarded
    let (after, after_done) = increment("fu-x").with_completion_channel();
    queue.enqueue(after).expect("enqueue");
    assert!(wait_for(after_done).await.is_success());
    assert_eq!(counter_value(&owner, "fu-x"), Some(2));
    assert_eq!(counter_value(&owner, "fu-y"), Some(1));
    assert_eq!(queue.metrics().panicked, 1);
    queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_processor_cancels_staged_actions() {
    let (owner, actions) = CounterOwner::new();
    let queue = EntityJobQueue::new("panic-actions", test_queue_config(1), Arc::clone(&owner));

    let (job, receiver) = CounterJob::new(
        "fu-1".to_string(),
        INCREMENT,
        JobOrigin::local(),
        |context| {
            context.enqueue_action(StateMachineAction::ArmRetryTimer {
                timer: RetryTimer::ReplicaProxyMessage,
                interval: Duration::from_secs(5),
            });
            context.enqueue_action(StateMachineAction::CancelRetryTimer {
                timer: RetryTimer::ReplicaProxyMessage,
            });
            panic!("processor exploded after staging actions");
        },
    )
    .with_completion_channel();
    queue.enqueue(job).expect("enqueue");

    assert!(matches!(wait_for(receiver).await, JobCompletion::Panicked(_)));
    let dispatched = drain_actions(&actions);
    assert_eq!(performed(&dispatched), 0);
    assert_eq!(cancelled(&dispatched), 2);
    queue.shutdown().await;
}

/// Executor that reads the entity it is acting on through the entity map
struct SnapshotExecutor {
    entity_map: Arc<EntityMap<String, u64>>,
    observed: Mutex<Vec<Option<u64>>>,
}

impl ActionExecutor<String> for SnapshotExecutor {
    fn perform_action(&self, _activity_id: ActivityId, entity: &String, _action: StateMachineAction) {
        let value = self
            .entity_map
            .get(entity)
            .and_then(|entry| entry.snapshot());
        self.observed.lock().push(value);
    }
}

struct SnapshotOwner {
    entity_map: Arc<EntityMap<String, u64>>,
    store: InMemoryEntityStore<String>,
    executor: SnapshotExecutor,
}

impl JobQueueOwner<String, u64> for SnapshotOwner {
    fn entity_map(&self) -> &EntityMap<String, u64> {
        &self.entity_map
    }

    fn store(&self) -> &dyn EntityStore<String, u64> {
        &self.store
    }

    fn action_executor(&self) -> &dyn ActionExecutor<String> {
        &self.executor
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_actions_run_after_entity_lock_is_released() {
    let entity_map = Arc::new(EntityMap::new());
    let owner = Arc::new(SnapshotOwner {
        entity_map: Arc::clone(&entity_map),
        store: InMemoryEntityStore::new(),
        executor: SnapshotExecutor {
            entity_map,
            observed: Mutex::new(Vec::new()),
        },
    });
    let queue = EntityJobQueue::new("lock-order", test_queue_config(1), Arc::clone(&owner));

    for _ in 0..2 {
        let (job, receiver) = increment("fu-1").with_completion_channel();
        queue.enqueue(job).expect("enqueue");
        // Re-locking the entity from the executor would hang here if the lock were still held
        assert!(wait_for(receiver).await.is_success());
    }

    assert_eq!(*owner.executor.observed.lock(), vec![Some(1), Some(2)]);
    queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_processor_error_abandons_actions() {
    let (owner, actions) = CounterOwner::new();
    let queue = EntityJobQueue::new("errors", test_queue_config(1), Arc::clone(&owner));

    let (job, receiver) = CounterJob::new(
        "fu-1".to_string(),
        INCREMENT,
        JobOrigin::local(),
        |context| {
            context.enqueue_action(StateMachineAction::CancelRetryTimer {
                timer: RetryTimer::ReplicaProxyMessage,
            });
            context.upsert(5);
            Err(ra_core::ProcessingError::EntityNotFound {
                entity: context.key().clone(),
            })
        },
    )
    .with_completion_channel();
    queue.enqueue(job).expect("enqueue");

    assert!(matches!(wait_for(receiver).await, JobCompletion::Failed(_)));
    assert_eq!(counter_value(&owner, "fu-1"), None);
    assert_eq!(cancelled(&drain_actions(&actions)), 1);
    queue.shutdown().await;
}
