mod common;

use common::*;
use proptest::prelude::*;
use ra_core::staleness::StalenessChecker;
use ra_core::state_machine::retryable_error::transition;
use ra_core::state_machine::{
    ChannelActionExecutor, EscalationLevel, OperationOutcome, RetryThresholds,
    RetryableErrorAction, RetryableErrorState, RetryableErrorStateName, StateMachineAction,
    StateMachineActionQueue,
};
use ra_core::types::ActivityId;
use std::time::{Duration, Instant};

proptest! {
    /// Property: a sequence number at or below the recorded one is always rejected
    #[test]
    fn stale_sequence_numbers_never_replace_newer(
        key in staleness_key_strategy(),
        first in 0u64..10_000,
        delta in 0u64..10_000,
    ) {
        let checker = StalenessChecker::<String>::new("prop", Duration::from_secs(60));
        let second = first.saturating_sub(delta);

        prop_assert!(checker.try_update_sequence_number(&key, first));
        prop_assert!(!checker.try_update_sequence_number(&key, second));
        prop_assert_eq!(checker.current(&key), Some(first));
    }

    /// Property: the recorded value is the running maximum of accepted updates
    #[test]
    fn recorded_sequence_is_running_maximum(
        updates in proptest::collection::vec((staleness_key_strategy(), 0u64..50), 1..40),
    ) {
        let checker = StalenessChecker::<String>::new("prop", Duration::from_secs(60));
        let mut expected = std::collections::HashMap::new();

        for (key, sequence_number) in updates {
            let newer = expected.get(&key).map_or(true, |current| sequence_number > *current);
            prop_assert_eq!(checker.try_update_sequence_number(&key, sequence_number), newer);
            if newer {
                expected.insert(key, sequence_number);
            }
        }
        for (key, sequence_number) in expected {
            prop_assert_eq!(checker.current(&key), Some(sequence_number));
        }
    }

    /// Property: cleanup removes exactly the entries untouched for longer than the keep duration
    #[test]
    fn cleanup_respects_keep_duration(
        ages in proptest::collection::vec(0u64..200, 1..20),
        keep in 1u64..150,
    ) {
        let checker = StalenessChecker::<String>::new("prop", Duration::from_secs(keep));
        let start = Instant::now();
        let now = start + Duration::from_secs(200);

        for (index, age) in ages.iter().enumerate() {
            checker.try_update_sequence_number_at(
                &format!("key-{index}"),
                1,
                now - Duration::from_secs(*age),
            );
        }
        checker.perform_cleanup(now);

        for (index, age) in ages.iter().enumerate() {
            let present = checker.current(&format!("key-{index}")).is_some();
            prop_assert_eq!(present, *age <= keep, "age {} keep {}", age, keep);
        }
    }

    /// Property: every transition lands in the enumerated set and success always settles
    #[test]
    fn retry_transitions_stay_in_state_set(
        state in retryable_state_strategy(),
        outcome in outcome_strategy(),
    ) {
        let next = transition(state, outcome);
        prop_assert!(RetryableErrorStateName::ALL.contains(&next));
        match outcome {
            OperationOutcome::Success => prop_assert_eq!(next, RetryableErrorStateName::None),
            OperationOutcome::Failure => prop_assert_eq!(next, state),
        }
    }

    /// Property: warning and error reports are raised at most once per failure episode
    #[test]
    fn each_report_level_raised_once(
        failures in 1u32..60,
        warning in 1u32..20,
        error_offset in 1u32..20,
    ) {
        let thresholds = RetryThresholds {
            warning_report_threshold: warning,
            error_report_threshold: warning + error_offset,
            ..RetryThresholds::unbounded()
        };
        let mut state = RetryableErrorState::new();
        state.enter_state(RetryableErrorStateName::ReplicaClose);
        let now = Instant::now();

        let actions: Vec<RetryableErrorAction> =
            (0..failures).map(|_| state.on_failure(now, &thresholds)).collect();
        let warnings = actions.iter().filter(|a| **a == RetryableErrorAction::ReportHealthWarning).count();
        let errors = actions.iter().filter(|a| **a == RetryableErrorAction::ReportHealthError).count();

        prop_assert!(warnings <= 1);
        prop_assert!(errors <= 1);
        prop_assert_eq!(errors == 1, failures >= warning + error_offset);
        prop_assert_eq!(state.current_state(), RetryableErrorStateName::ReplicaClose);
    }
}

#[test]
fn test_open_escalates_to_warning_after_threshold_duration() {
    let thresholds = RetryThresholds {
        warning_report_after_seconds: Some(60),
        ..RetryThresholds::unbounded()
    };
    let mut state = RetryableErrorState::new();
    state.enter_state(RetryableErrorStateName::ReplicaOpen);
    let start = Instant::now();

    assert_eq!(state.on_failure(start, &thresholds), RetryableErrorAction::None);
    assert_eq!(
        state.on_failure(start + Duration::from_secs(30), &thresholds),
        RetryableErrorAction::None
    );
    assert_eq!(state.reported_level(), EscalationLevel::Informational);

    assert_eq!(
        state.on_failure(start + Duration::from_secs(61), &thresholds),
        RetryableErrorAction::ReportHealthWarning
    );
    assert_eq!(state.reported_level(), EscalationLevel::Warning);
    assert_eq!(state.failure_count(), 3);

    assert_eq!(state.on_success(), RetryableErrorAction::ClearHealthReport);
    assert_eq!(state.current_state(), RetryableErrorStateName::None);
    assert_eq!(state.failure_count(), 0);
    assert_eq!(state.reported_level(), EscalationLevel::Informational);
}

#[test]
#[should_panic(expected = "consumed twice")]
fn test_execute_after_abandon_is_fatal() {
    let (executor, _actions) = ChannelActionExecutor::<String>::new();
    let mut queue = StateMachineActionQueue::new();
    queue.enqueue(StateMachineAction::CancelRetryTimer {
        timer: ra_core::state_machine::RetryTimer::ReplicaProxyMessage,
    });

    let entity = "fu-1".to_string();
    queue.abandon_all_actions(&entity, &executor);
    queue.execute_all_actions(ActivityId::new(), &entity, &executor);
}
