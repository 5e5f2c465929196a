use proptest::prelude::*;
use ra_core::state_machine::{OperationOutcome, RetryableErrorStateName};

pub fn retryable_state_strategy() -> impl Strategy<Value = RetryableErrorStateName> {
    proptest::sample::select(RetryableErrorStateName::ALL.to_vec())
}

pub fn outcome_strategy() -> impl Strategy<Value = OperationOutcome> {
    prop_oneof![Just(OperationOutcome::Success), Just(OperationOutcome::Failure)]
}

/// Small key space so sequences revisit the same key
pub fn staleness_key_strategy() -> impl Strategy<Value = String> {
    prop_oneof![Just("a".to_string()), Just("b".to_string()), Just("c".to_string())]
}
