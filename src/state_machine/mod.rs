// State machine support for the reconfiguration agent
//
// Deferred side effects captured under an entity lock, and the retry bookkeeping that
// decides when a failing replica operation should escalate.

pub mod action_queue;
pub mod actions;
pub mod retryable_error;

// Re-export main types for convenient access
pub use action_queue::StateMachineActionQueue;
pub use actions::{
    ActionDisposition, ActionExecutor, ChannelActionExecutor, DispatchedAction, MessageTarget,
    OutboundMessage, RetryTimer, StateMachineAction,
};
pub use retryable_error::{
    EscalationLevel, OperationFamily, OperationOutcome, RetryThresholds, RetryableErrorAction,
    RetryableErrorState, RetryableErrorStateName,
};
