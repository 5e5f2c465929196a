use crossbeam::channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::health::HealthReport;
use crate::types::{ActivityId, NodeInstance};

/// Destination of an outbound message action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageTarget {
    /// The failover manager owning the partition
    FailoverManager,
    /// The replica proxy hosting the local replica
    ReplicaProxy,
    /// A specific remote node
    Node(NodeInstance),
}

/// Message body handed to the transport collaborator. The core does not define wire
/// bytes; `body` is whatever the transport serializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub action: String,
    pub body: serde_json::Value,
}

impl OutboundMessage {
    pub fn new(action: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            action: action.into(),
            body,
        }
    }
}

/// Retry timers an entity can arm while its lock is held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryTimer {
    ReplicaProxyMessage,
}

/// Side effect captured under the entity lock and executed after release
#[derive(Debug, Clone, PartialEq)]
pub enum StateMachineAction {
    SendMessage {
        target: MessageTarget,
        message: OutboundMessage,
    },
    ReportHealth(HealthReport),
    ArmRetryTimer {
        timer: RetryTimer,
        interval: Duration,
    },
    CancelRetryTimer {
        timer: RetryTimer,
    },
}

impl StateMachineAction {
    pub fn send(target: MessageTarget, message: OutboundMessage) -> Self {
        Self::SendMessage { target, message }
    }

    /// Short name used in trace events
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::ReportHealth(_) => "report_health",
            Self::ArmRetryTimer { .. } => "arm_retry_timer",
            Self::CancelRetryTimer { .. } => "cancel_retry_timer",
        }
    }
}

/// Performs deferred actions on behalf of the queue's owner.
///
/// `perform_action` runs after the entity lock is released, in enqueue order.
/// `cancel_action` runs instead when the owning operation is abandoned.
pub trait ActionExecutor<K>: Send + Sync {
    fn perform_action(&self, activity_id: ActivityId, entity: &K, action: StateMachineAction);

    fn cancel_action(&self, entity: &K, action: StateMachineAction) {
        let _ = entity;
        debug!(action = action.name(), "Action cancelled without side effects");
    }
}

/// Whether a dispatched action was performed or cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionDisposition {
    Performed,
    Cancelled,
}

/// Action record forwarded by [`ChannelActionExecutor`]
#[derive(Debug, Clone)]
pub struct DispatchedAction<K> {
    pub activity_id: Option<ActivityId>,
    pub entity: K,
    pub action: StateMachineAction,
    pub disposition: ActionDisposition,
}

/// Executor that forwards every action to a channel drained by the transport and health
/// collaborators.
#[derive(Debug, Clone)]
pub struct ChannelActionExecutor<K> {
    sender: Sender<DispatchedAction<K>>,
}

impl<K> ChannelActionExecutor<K> {
    pub fn new() -> (Self, Receiver<DispatchedAction<K>>) {
        let (sender, receiver) = crossbeam::channel::unbounded();
        (Self { sender }, receiver)
    }

    fn forward(&self, record: DispatchedAction<K>) {
        if self.sender.send(record).is_err() {
            warn!("Action receiver dropped; discarding action");
        }
    }
}

impl<K> ActionExecutor<K> for ChannelActionExecutor<K>
where
    K: Clone + Send + Sync,
{
    fn perform_action(&self, activity_id: ActivityId, entity: &K, action: StateMachineAction) {
        self.forward(DispatchedAction {
            activity_id: Some(activity_id),
            entity: entity.clone(),
            action,
            disposition: ActionDisposition::Performed,
        });
    }

    fn cancel_action(&self, entity: &K, action: StateMachineAction) {
        self.forward(DispatchedAction {
            activity_id: None,
            entity: entity.clone(),
            action,
            disposition: ActionDisposition::Cancelled,
        });
    }
}
