//! # State Machine Action Queue
//!
//! Ordered, single-use list of side effects produced while an entity lock is held.
//! The queue is consumed exactly once after the lock is released, either by
//! executing every action or by abandoning all of them.

use std::fmt;
use tracing::{debug, trace};

use super::actions::{ActionExecutor, StateMachineAction};
use crate::invariant;
use crate::types::ActivityId;

#[derive(Default)]
pub struct StateMachineActionQueue {
    actions: Vec<StateMachineAction>,
    consumed: bool,
}

impl StateMachineActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action. Enqueueing after consumption is a programming error.
    pub fn enqueue(&mut self, action: StateMachineAction) {
        if !invariant!(
            !self.consumed,
            "action {} enqueued after the queue was consumed",
            action.name()
        ) {
            return;
        }
        self.actions.push(action);
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Actions queued so far, in execution order
    pub fn actions(&self) -> &[StateMachineAction] {
        &self.actions
    }

    /// Perform every action in FIFO order and mark the queue consumed.
    ///
    /// Returns the number of actions performed.
    pub fn execute_all_actions<K>(
        &mut self,
        activity_id: ActivityId,
        entity: &K,
        executor: &dyn ActionExecutor<K>,
    ) -> usize
    where
        K: fmt::Display,
    {
        if !invariant!(
            !activity_id.is_empty(),
            "action queue for {entity} executed with an empty activity id"
        ) {
            return 0;
        }
        if !self.mark_consumed(entity) {
            return 0;
        }

        let count = self.actions.len();
        for action in self.actions.drain(..) {
            trace!(
                activity_id = %activity_id,
                entity = %entity,
                action = action.name(),
                "Performing action"
            );
            executor.perform_action(activity_id, entity, action);
        }

        if count > 0 {
            debug!(
                activity_id = %activity_id,
                entity = %entity,
                actions = count,
                "⚡ ACTION_QUEUE: Executed actions"
            );
        }
        count
    }

    /// Cancel every action in FIFO order and mark the queue consumed.
    ///
    /// Used when the owning operation is aborted, e.g. during shutdown or after a
    /// failed commit. Returns the number of actions cancelled.
    pub fn abandon_all_actions<K>(&mut self, entity: &K, executor: &dyn ActionExecutor<K>) -> usize
    where
        K: fmt::Display,
    {
        if !self.mark_consumed(entity) {
            return 0;
        }

        let count = self.actions.len();
        for action in self.actions.drain(..) {
            executor.cancel_action(entity, action);
        }

        if count > 0 {
            debug!(entity = %entity, actions = count, "🗑️ ACTION_QUEUE: Abandoned actions");
        }
        count
    }

    fn mark_consumed<K: fmt::Display>(&mut self, entity: &K) -> bool {
        if !invariant!(!self.consumed, "action queue for {entity} consumed twice") {
            return false;
        }
        self.consumed = true;
        true
    }
}

impl fmt::Debug for StateMachineActionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachineActionQueue")
            .field("actions", &self.actions.len())
            .field("consumed", &self.consumed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{HealthLevel, HealthReport};
    use crate::state_machine::actions::{MessageTarget, OutboundMessage};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        performed: Mutex<Vec<(ActivityId, String)>>,
        cancelled: Mutex<Vec<String>>,
    }

    impl ActionExecutor<String> for Recorder {
        fn perform_action(&self, activity_id: ActivityId, _entity: &String, action: StateMachineAction) {
            self.performed.lock().push((activity_id, describe(&action)));
        }

        fn cancel_action(&self, _entity: &String, action: StateMachineAction) {
            self.cancelled.lock().push(describe(&action));
        }
    }

    fn describe(action: &StateMachineAction) -> String {
        match action {
            StateMachineAction::SendMessage { message, .. } => message.action.clone(),
            StateMachineAction::ReportHealth(report) => report.property.clone(),
            other => other.name().to_string(),
        }
    }

    fn send(name: &str) -> StateMachineAction {
        StateMachineAction::send(
            MessageTarget::FailoverManager,
            OutboundMessage::new(name, serde_json::Value::Null),
        )
    }

    #[test]
    fn test_execute_runs_actions_in_fifo_order() {
        let recorder = Recorder::default();
        let mut queue = StateMachineActionQueue::new();
        queue.enqueue(send("first"));
        queue.enqueue(StateMachineAction::ReportHealth(HealthReport::new(
            "fu",
            "second",
            HealthLevel::Warning,
            "",
        )));
        queue.enqueue(send("third"));

        let activity_id = ActivityId::new();
        let count = queue.execute_all_actions(activity_id, &"fu".to_string(), &recorder);

        assert_eq!(count, 3);
        assert!(queue.is_consumed());
        let performed = recorder.performed.lock();
        let names: Vec<_> = performed.iter().map(|(_, name)| name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
        assert!(performed.iter().all(|(id, _)| *id == activity_id));
    }

    #[test]
    fn test_abandon_cancels_instead_of_performing() {
        let recorder = Recorder::default();
        let mut queue = StateMachineActionQueue::new();
        queue.enqueue(send("a"));
        queue.enqueue(send("b"));

        assert_eq!(queue.abandon_all_actions(&"fu".to_string(), &recorder), 2);
        assert!(recorder.performed.lock().is_empty());
        assert_eq!(*recorder.cancelled.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_empty_queue_can_be_consumed() {
        let recorder = Recorder::default();
        let mut queue = StateMachineActionQueue::new();
        assert_eq!(queue.execute_all_actions(ActivityId::new(), &"fu".to_string(), &recorder), 0);
        assert!(queue.is_consumed());
    }

    #[test]
    #[should_panic(expected = "consumed twice")]
    fn test_double_execute_is_fatal() {
        let recorder = Recorder::default();
        let mut queue = StateMachineActionQueue::new();
        let entity = "fu".to_string();
        queue.execute_all_actions(ActivityId::new(), &entity, &recorder);
        queue.execute_all_actions(ActivityId::new(), &entity, &recorder);
    }

    #[test]
    #[should_panic(expected = "empty activity id")]
    fn test_empty_activity_id_is_fatal() {
        let recorder = Recorder::default();
        let mut queue = StateMachineActionQueue::new();
        queue.execute_all_actions(ActivityId::empty(), &"fu".to_string(), &recorder);
    }

    #[test]
    #[should_panic(expected = "after the queue was consumed")]
    fn test_enqueue_after_consume_is_fatal() {
        let recorder = Recorder::default();
        let mut queue = StateMachineActionQueue::new();
        queue.abandon_all_actions(&"fu".to_string(), &recorder);
        queue.enqueue(send("late"));
    }
}
