//! # Retryable Error State
//!
//! Tracks consecutive failures of one asynchronous replica operation (open, reopen,
//! service registration lookup, change role, close, delete) and decides when the
//! failure should escalate to a health warning, a health error, a restart or a drop.
//!
//! The state itself has no side effects. Callers turn the returned
//! [`RetryableErrorAction`] into deferred actions on their action queue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::invariant;

/// Operation currently being retried for an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryableErrorStateName {
    #[default]
    None,
    ReplicaOpen,
    ReplicaReopen,
    FindServiceRegistrationAtOpen,
    FindServiceRegistrationAtReopen,
    FindServiceRegistrationAtDrop,
    ReplicaChangeRoleAtCatchup,
    ReplicaClose,
    ReplicaDelete,
}

/// Family an operation belongs to. Failures never move an entity across families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationFamily {
    Open,
    ChangeRole,
    Close,
}

impl RetryableErrorStateName {
    pub const ALL: [RetryableErrorStateName; 9] = [
        Self::None,
        Self::ReplicaOpen,
        Self::ReplicaReopen,
        Self::FindServiceRegistrationAtOpen,
        Self::FindServiceRegistrationAtReopen,
        Self::FindServiceRegistrationAtDrop,
        Self::ReplicaChangeRoleAtCatchup,
        Self::ReplicaClose,
        Self::ReplicaDelete,
    ];

    pub fn family(&self) -> Option<OperationFamily> {
        match self {
            Self::None => None,
            Self::ReplicaOpen
            | Self::ReplicaReopen
            | Self::FindServiceRegistrationAtOpen
            | Self::FindServiceRegistrationAtReopen => Some(OperationFamily::Open),
            Self::ReplicaChangeRoleAtCatchup => Some(OperationFamily::ChangeRole),
            Self::FindServiceRegistrationAtDrop | Self::ReplicaClose | Self::ReplicaDelete => {
                Some(OperationFamily::Close)
            }
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for RetryableErrorStateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::ReplicaOpen => "replica_open",
            Self::ReplicaReopen => "replica_reopen",
            Self::FindServiceRegistrationAtOpen => "find_service_registration_at_open",
            Self::FindServiceRegistrationAtReopen => "find_service_registration_at_reopen",
            Self::FindServiceRegistrationAtDrop => "find_service_registration_at_drop",
            Self::ReplicaChangeRoleAtCatchup => "replica_change_role_at_catchup",
            Self::ReplicaClose => "replica_close",
            Self::ReplicaDelete => "replica_delete",
        };
        write!(f, "{name}")
    }
}

/// Outcome of one attempt of the tracked operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationOutcome {
    Success,
    Failure,
}

/// Next state for `(current, outcome)`.
///
/// Success always returns to `None`; failure keeps the entity on the same operation.
pub fn transition(current: RetryableErrorStateName, outcome: OperationOutcome) -> RetryableErrorStateName {
    match outcome {
        OperationOutcome::Success => RetryableErrorStateName::None,
        OperationOutcome::Failure => current,
    }
}

/// How loudly a failing operation should be surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    #[default]
    Informational,
    Warning,
    Error,
}

/// What the caller must do after recording an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryableErrorAction {
    None,
    ReportHealthWarning,
    ReportHealthError,
    ClearHealthReport,
    Restart,
    Drop,
}

/// Escalation thresholds for one retryable operation.
///
/// Count thresholds are compared against the number of consecutive failures;
/// `u32::MAX` disables a threshold. The optional elapsed-time thresholds are measured
/// from the first failure of the current episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryThresholds {
    pub warning_report_threshold: u32,
    pub error_report_threshold: u32,
    pub restart_threshold: u32,
    pub drop_threshold: u32,
    pub warning_report_after_seconds: Option<u64>,
    pub error_report_after_seconds: Option<u64>,
}

impl RetryThresholds {
    pub const fn unbounded() -> Self {
        Self {
            warning_report_threshold: u32::MAX,
            error_report_threshold: u32::MAX,
            restart_threshold: u32::MAX,
            drop_threshold: u32::MAX,
            warning_report_after_seconds: None,
            error_report_after_seconds: None,
        }
    }

    pub const fn with_warning_and_drop(warning: u32, drop: u32) -> Self {
        let mut thresholds = Self::unbounded();
        thresholds.warning_report_threshold = warning;
        thresholds.drop_threshold = drop;
        thresholds
    }

    pub fn warning_report_after(&self) -> Option<Duration> {
        self.warning_report_after_seconds.map(Duration::from_secs)
    }

    pub fn error_report_after(&self) -> Option<Duration> {
        self.error_report_after_seconds.map(Duration::from_secs)
    }
}

impl Default for RetryThresholds {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Retry bookkeeping for one entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryableErrorState {
    current: RetryableErrorStateName,
    failure_count: u32,
    reported: EscalationLevel,
    /// Monotonic clock reading; not meaningful across restarts
    #[serde(skip)]
    first_failure_at: Option<Instant>,
}

impl RetryableErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_state(&self) -> RetryableErrorStateName {
        self.current
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn reported_level(&self) -> EscalationLevel {
        self.reported
    }

    /// Start tracking a new operation. Counters restart from zero.
    pub fn enter_state(&mut self, state: RetryableErrorStateName) {
        self.current = state;
        self.reset_counters();
    }

    /// Record a failed attempt of the current operation.
    pub fn on_failure(&mut self, now: Instant, thresholds: &RetryThresholds) -> RetryableErrorAction {
        if !invariant!(
            !self.current.is_none(),
            "failure recorded while no retryable operation is tracked"
        ) {
            return RetryableErrorAction::None;
        }

        self.current = transition(self.current, OperationOutcome::Failure);
        self.failure_count = self.failure_count.saturating_add(1);
        self.first_failure_at.get_or_insert(now);

        if self.failure_count >= thresholds.drop_threshold {
            return RetryableErrorAction::Drop;
        }
        if self.failure_count >= thresholds.restart_threshold {
            return RetryableErrorAction::Restart;
        }

        let level = self.escalation_level(now, thresholds);
        if level == EscalationLevel::Error && self.reported < EscalationLevel::Error {
            self.reported = EscalationLevel::Error;
            return RetryableErrorAction::ReportHealthError;
        }
        if level >= EscalationLevel::Warning && self.reported < EscalationLevel::Warning {
            self.reported = EscalationLevel::Warning;
            return RetryableErrorAction::ReportHealthWarning;
        }
        RetryableErrorAction::None
    }

    /// Record success of the current operation and move to `next`.
    ///
    /// `next` must be `None` or an operation of the same family.
    pub fn on_success_and_transition_to(&mut self, next: RetryableErrorStateName) -> RetryableErrorAction {
        invariant!(
            next.is_none() || next.family() == self.current.family(),
            "success of {} cannot continue with {}",
            self.current,
            next
        );

        let had_report = self.reported > EscalationLevel::Informational;
        self.current = match transition(self.current, OperationOutcome::Success) {
            RetryableErrorStateName::None if !next.is_none() => next,
            settled => settled,
        };
        self.reset_counters();

        if had_report {
            RetryableErrorAction::ClearHealthReport
        } else {
            RetryableErrorAction::None
        }
    }

    pub fn on_success(&mut self) -> RetryableErrorAction {
        self.on_success_and_transition_to(RetryableErrorStateName::None)
    }

    /// Escalation level implied by the failure count and the time since the first failure
    pub fn escalation_level(&self, now: Instant, thresholds: &RetryThresholds) -> EscalationLevel {
        let elapsed = self
            .first_failure_at
            .map(|first| now.saturating_duration_since(first));
        let crossed = |count: u32, after: Option<Duration>| {
            self.failure_count >= count
                || matches!((elapsed, after), (Some(e), Some(a)) if e >= a)
        };

        if self.failure_count == 0 {
            EscalationLevel::Informational
        } else if crossed(thresholds.error_report_threshold, thresholds.error_report_after()) {
            EscalationLevel::Error
        } else if crossed(thresholds.warning_report_threshold, thresholds.warning_report_after()) {
            EscalationLevel::Warning
        } else {
            EscalationLevel::Informational
        }
    }

    /// True when the next failure will produce [`RetryableErrorAction::Drop`]
    pub fn is_last_retry_before_drop(&self, thresholds: &RetryThresholds) -> bool {
        thresholds.drop_threshold != u32::MAX
            && self.failure_count.saturating_add(1) == thresholds.drop_threshold
    }

    fn reset_counters(&mut self) {
        self.failure_count = 0;
        self.reported = EscalationLevel::Informational;
        self.first_failure_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_state() -> RetryableErrorState {
        let mut state = RetryableErrorState::new();
        state.enter_state(RetryableErrorStateName::ReplicaOpen);
        state
    }

    #[test]
    fn test_warning_reported_once_at_threshold() {
        let thresholds = RetryThresholds::with_warning_and_drop(2, 5);
        let mut state = open_state();
        let now = Instant::now();

        assert_eq!(state.on_failure(now, &thresholds), RetryableErrorAction::None);
        assert_eq!(
            state.on_failure(now, &thresholds),
            RetryableErrorAction::ReportHealthWarning
        );
        assert_eq!(state.on_failure(now, &thresholds), RetryableErrorAction::None);
        assert_eq!(state.reported_level(), EscalationLevel::Warning);
    }

    #[test]
    fn test_drop_threshold_wins() {
        let thresholds = RetryThresholds::with_warning_and_drop(1, 3);
        let mut state = open_state();
        let now = Instant::now();

        state.on_failure(now, &thresholds);
        assert!(!state.is_last_retry_before_drop(&thresholds));
        state.on_failure(now, &thresholds);
        assert!(state.is_last_retry_before_drop(&thresholds));
        assert_eq!(state.on_failure(now, &thresholds), RetryableErrorAction::Drop);
        assert_eq!(state.current_state(), RetryableErrorStateName::ReplicaOpen);
    }

    #[test]
    fn test_restart_threshold() {
        let thresholds = RetryThresholds {
            restart_threshold: 2,
            ..RetryThresholds::unbounded()
        };
        let mut state = RetryableErrorState::new();
        state.enter_state(RetryableErrorStateName::ReplicaChangeRoleAtCatchup);
        let now = Instant::now();

        assert_eq!(state.on_failure(now, &thresholds), RetryableErrorAction::None);
        assert_eq!(state.on_failure(now, &thresholds), RetryableErrorAction::Restart);
    }

    #[test]
    fn test_error_after_elapsed_time() {
        let thresholds = RetryThresholds {
            error_report_after_seconds: Some(60),
            ..RetryThresholds::unbounded()
        };
        let mut state = open_state();
        let start = Instant::now();

        assert_eq!(state.on_failure(start, &thresholds), RetryableErrorAction::None);
        assert_eq!(
            state.on_failure(start + Duration::from_secs(61), &thresholds),
            RetryableErrorAction::ReportHealthError
        );
    }

    #[test]
    fn test_success_clears_only_after_report() {
        let thresholds = RetryThresholds::with_warning_and_drop(1, u32::MAX);
        let now = Instant::now();

        let mut quiet = open_state();
        assert_eq!(quiet.on_success(), RetryableErrorAction::None);
        assert!(quiet.current_state().is_none());

        let mut noisy = open_state();
        noisy.on_failure(now, &thresholds);
        assert_eq!(noisy.on_success(), RetryableErrorAction::ClearHealthReport);
        assert_eq!(noisy.failure_count(), 0);
        assert!(noisy.current_state().is_none());
    }

    #[test]
    fn test_success_can_continue_within_family() {
        let mut state = RetryableErrorState::new();
        state.enter_state(RetryableErrorStateName::FindServiceRegistrationAtOpen);
        state.on_success_and_transition_to(RetryableErrorStateName::ReplicaOpen);
        assert_eq!(state.current_state(), RetryableErrorStateName::ReplicaOpen);
    }

    #[test]
    #[should_panic(expected = "cannot continue with")]
    fn test_success_cannot_jump_family() {
        let mut state = open_state();
        state.on_success_and_transition_to(RetryableErrorStateName::ReplicaClose);
    }

    #[test]
    fn test_families() {
        assert_eq!(
            RetryableErrorStateName::FindServiceRegistrationAtReopen.family(),
            Some(OperationFamily::Open)
        );
        assert_eq!(
            RetryableErrorStateName::ReplicaDelete.family(),
            Some(OperationFamily::Close)
        );
        assert_eq!(RetryableErrorStateName::None.family(), None);
    }
}
