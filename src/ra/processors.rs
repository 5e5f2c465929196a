//! # Failover Unit Message Processors
//!
//! Business logic that runs under the failover unit lock. Each processor reads the
//! current unit, stages at most one new value and enqueues the sends, timer changes
//! and health reports that go with the transition. Nothing here performs I/O.

use dashmap::DashSet;
use serde_json::json;
use std::time::Instant;
use tracing::{debug, trace};

use super::failover_unit::{
    FailoverUnit, FailoverUnitContext, FailoverUnitState, ReplicaDescription, ReplicaRole,
};
use super::messages::{MessageBody, OperationResult};
use crate::config::ReconfigurationAgentConfig;
use crate::error::ProcessingError;
use crate::health::{HealthLevel, HealthReport};
use crate::state_machine::{
    EscalationLevel, MessageTarget, OperationFamily, OutboundMessage, RetryTimer,
    RetryableErrorAction, RetryableErrorStateName, StateMachineAction,
};
use crate::types::ServiceTypeKey;

/// Read-only inputs shared by every processor invocation
#[derive(Debug, Default)]
pub struct AgentEnvironment {
    pub config: ReconfigurationAgentConfig,
    registered_service_types: DashSet<ServiceTypeKey>,
}

impl AgentEnvironment {
    pub fn new(config: ReconfigurationAgentConfig) -> Self {
        Self {
            config,
            registered_service_types: DashSet::new(),
        }
    }

    pub fn is_registered(&self, service_type: &ServiceTypeKey) -> bool {
        self.registered_service_types.contains(service_type)
    }

    /// Record a registration change. Returns true when the set changed.
    pub fn set_registered(&self, service_type: &ServiceTypeKey, registered: bool) -> bool {
        if registered {
            self.registered_service_types.insert(service_type.clone())
        } else {
            self.registered_service_types.remove(service_type).is_some()
        }
    }

    fn health_property(&self, state: RetryableErrorStateName) -> &str {
        let health = &self.config.health;
        match state.family() {
            Some(OperationFamily::Close) => &health.replica_close_status_property,
            Some(OperationFamily::ChangeRole) => &health.replica_change_role_status_property,
            Some(OperationFamily::Open) | None => &health.replica_open_status_property,
        }
    }
}

/// Dispatch one decoded message to its processor
pub fn process_message(
    context: &mut FailoverUnitContext<'_>,
    env: &AgentEnvironment,
    body: MessageBody,
    now: Instant,
) -> Result<(), ProcessingError> {
    match body {
        MessageBody::ReplicaOpen {
            service_type,
            replica_id,
            role,
            epoch,
        } => replica_open(context, env, service_type, replica_id, role, epoch),
        MessageBody::ReplicaOpenReply { replica_id, result } => {
            replica_open_reply(context, env, replica_id, result, now)
        }
        MessageBody::ReplicaClose { replica_id, delete } => {
            replica_close(context, env, replica_id, delete)
        }
        MessageBody::ReplicaCloseReply { replica_id, result } => {
            replica_close_reply(context, env, replica_id, result, now)
        }
        MessageBody::DoReconfiguration { epoch, replicas } => {
            do_reconfiguration(context, epoch, replicas)
        }
    }
}

fn replica_open(
    context: &mut FailoverUnitContext<'_>,
    env: &AgentEnvironment,
    service_type: ServiceTypeKey,
    replica_id: u64,
    role: ReplicaRole,
    epoch: u64,
) -> Result<(), ProcessingError> {
    let mut local_sequence_number = 0;
    if let Some(existing) = context.current() {
        if replica_id < existing.local_replica_id {
            trace!(failover_unit = %existing.id, replica_id, "Ignoring open for an older replica");
            return Ok(());
        }
        if replica_id == existing.local_replica_id && !existing.is_closed() {
            if existing.state == FailoverUnitState::Open {
                send_to_failover_manager(context, "ReplicaOpenReply", open_reply_body(existing, true));
            }
            return Ok(());
        }
        local_sequence_number = existing.local_sequence_number;
    }

    let mut unit = FailoverUnit::new(*context.key(), service_type, replica_id, role, epoch);
    unit.local_sequence_number = local_sequence_number;

    if env.is_registered(&unit.service_type) {
        unit.retry_state
            .enter_state(RetryableErrorStateName::ReplicaOpen);
        send_to_replica_proxy(context, "ReplicaOpen", &unit);
    } else {
        debug!(
            failover_unit = %unit.id,
            service_type = %unit.service_type,
            "Service type not registered, waiting before open"
        );
        unit.retry_state
            .enter_state(RetryableErrorStateName::FindServiceRegistrationAtOpen);
    }
    arm_proxy_timer(context, env);
    commit(context, unit);
    Ok(())
}

fn replica_open_reply(
    context: &mut FailoverUnitContext<'_>,
    env: &AgentEnvironment,
    replica_id: u64,
    result: OperationResult,
    now: Instant,
) -> Result<(), ProcessingError> {
    let current = require_unit(context)?;
    if current.local_replica_id != replica_id || current.state != FailoverUnitState::Opening {
        trace!(failover_unit = %current.id, replica_id, "Ignoring stale open reply");
        return Ok(());
    }

    let mut unit = current.clone();
    let property = env.health_property(unit.retry_state.current_state()).to_string();

    match result {
        OperationResult::Success => {
            let action = unit.retry_state.on_success();
            report_escalation(context, &unit, action, &property);
            unit.state = FailoverUnitState::Open;
            context.enqueue_action(StateMachineAction::CancelRetryTimer {
                timer: RetryTimer::ReplicaProxyMessage,
            });
            send_to_failover_manager(context, "ReplicaOpenReply", open_reply_body(&unit, true));
        }
        OperationResult::Failed { reason } => {
            let thresholds = env
                .config
                .retryable_errors
                .thresholds_for(unit.retry_state.current_state());
            let action = unit.retry_state.on_failure(now, &thresholds);
            debug!(
                failover_unit = %unit.id,
                reason = %reason,
                failures = unit.retry_state.failure_count(),
                action = ?action,
                "Replica open failed"
            );

            match action {
                RetryableErrorAction::Restart => {
                    unit.retry_state
                        .enter_state(RetryableErrorStateName::ReplicaReopen);
                    send_to_replica_proxy(context, "ReplicaOpen", &unit);
                }
                RetryableErrorAction::Drop => drop_replica(context, &mut unit, &property),
                other => report_escalation(context, &unit, other, &property),
            }
        }
    }

    commit(context, unit);
    Ok(())
}

fn replica_close(
    context: &mut FailoverUnitContext<'_>,
    env: &AgentEnvironment,
    replica_id: u64,
    delete: bool,
) -> Result<(), ProcessingError> {
    let Some(current) = context.current() else {
        let body = json!({ "failover_unit_id": context.key(), "replica_id": replica_id });
        send_to_failover_manager(context, "ReplicaCloseReply", body);
        return Ok(());
    };

    if current.local_replica_id != replica_id {
        trace!(failover_unit = %current.id, replica_id, "Ignoring close for another replica");
        return Ok(());
    }

    match current.state {
        FailoverUnitState::Closed => {
            send_to_failover_manager(context, "ReplicaCloseReply", close_reply_body(current));
            Ok(())
        }
        FailoverUnitState::Closing => {
            if delete && !current.delete_on_close {
                let mut unit = current.clone();
                unit.delete_on_close = true;
                commit(context, unit);
            }
            Ok(())
        }
        FailoverUnitState::Opening | FailoverUnitState::Open => {
            let mut unit = current.clone();
            let open_property = env.health_property(unit.retry_state.current_state()).to_string();
            clear_outstanding_report(context, &unit, &open_property);

            unit.state = FailoverUnitState::Closing;
            unit.delete_on_close = delete;
            let registered = env.is_registered(&unit.service_type);
            unit.retry_state.enter_state(match (registered, delete) {
                (false, _) => RetryableErrorStateName::FindServiceRegistrationAtDrop,
                (true, true) => RetryableErrorStateName::ReplicaDelete,
                (true, false) => RetryableErrorStateName::ReplicaClose,
            });

            if registered {
                send_to_replica_proxy(context, "ReplicaClose", &unit);
            }
            arm_proxy_timer(context, env);
            commit(context, unit);
            Ok(())
        }
    }
}

fn replica_close_reply(
    context: &mut FailoverUnitContext<'_>,
    env: &AgentEnvironment,
    replica_id: u64,
    result: OperationResult,
    now: Instant,
) -> Result<(), ProcessingError> {
    let current = require_unit(context)?;
    if current.local_replica_id != replica_id || current.state != FailoverUnitState::Closing {
        trace!(failover_unit = %current.id, replica_id, "Ignoring stale close reply");
        return Ok(());
    }

    let mut unit = current.clone();
    let property = env.health_property(unit.retry_state.current_state()).to_string();

    match result {
        OperationResult::Success => {
            let action = unit.retry_state.on_success();
            report_escalation(context, &unit, action, &property);
            finish_close(context, unit);
        }
        OperationResult::Failed { reason } => {
            let thresholds = env
                .config
                .retryable_errors
                .thresholds_for(unit.retry_state.current_state());
            let action = unit.retry_state.on_failure(now, &thresholds);
            debug!(
                failover_unit = %unit.id,
                reason = %reason,
                failures = unit.retry_state.failure_count(),
                action = ?action,
                "Replica close failed"
            );

            match action {
                RetryableErrorAction::Drop => {
                    clear_outstanding_report(context, &unit, &property);
                    finish_close(context, unit);
                }
                RetryableErrorAction::Restart => {
                    // A restarted close escalates from scratch
                    clear_outstanding_report(context, &unit, &property);
                    let restarted = unit.retry_state.current_state();
                    unit.retry_state.enter_state(restarted);
                    send_to_replica_proxy(context, "ReplicaClose", &unit);
                    commit(context, unit);
                }
                other => {
                    report_escalation(context, &unit, other, &property);
                    commit(context, unit);
                }
            }
        }
    }
    Ok(())
}

fn do_reconfiguration(
    context: &mut FailoverUnitContext<'_>,
    epoch: u64,
    replicas: Vec<ReplicaDescription>,
) -> Result<(), ProcessingError> {
    let current = require_unit(context)?;
    if current.is_closed() {
        return Err(ProcessingError::EntityTerminal {
            entity: current.id.to_string(),
        });
    }
    if current.state != FailoverUnitState::Open {
        return Err(ProcessingError::invalid_message(
            current.id,
            format!("reconfiguration received while {}", current.state),
        ));
    }

    let reply = json!({ "failover_unit_id": current.id, "epoch": epoch });
    if epoch <= current.configuration_epoch {
        send_to_failover_manager(context, "DoReconfigurationReply", reply);
        return Ok(());
    }

    let mut unit = current.clone();
    unit.configuration_epoch = epoch;
    if let Some(local) = replicas
        .iter()
        .find(|replica| replica.replica_id == unit.local_replica_id)
    {
        unit.local_role = local.role;
    }
    unit.replicas = replicas;

    send_to_failover_manager(context, "DoReconfigurationReply", reply);
    commit(context, unit);
    Ok(())
}

/// Retry whatever operation the unit is waiting on.
///
/// Runs for retry timer expiries and for service type registration changes. Units
/// waiting on a registration proceed once the service type is registered and count a
/// failure otherwise.
pub fn resume_pending_operation(
    context: &mut FailoverUnitContext<'_>,
    env: &AgentEnvironment,
    now: Instant,
) -> Result<(), ProcessingError> {
    let Some(current) = context.current() else {
        return Ok(());
    };

    let state = current.retry_state.current_state();
    match (state, current.state) {
        (
            RetryableErrorStateName::FindServiceRegistrationAtOpen
            | RetryableErrorStateName::FindServiceRegistrationAtReopen
            | RetryableErrorStateName::FindServiceRegistrationAtDrop,
            _,
        ) => {
            let mut unit = current.clone();
            let property = env.health_property(state).to_string();
            let opening = state.family() == Some(OperationFamily::Open);

            if env.is_registered(&unit.service_type) {
                let next = match state {
                    RetryableErrorStateName::FindServiceRegistrationAtOpen => {
                        RetryableErrorStateName::ReplicaOpen
                    }
                    RetryableErrorStateName::FindServiceRegistrationAtReopen => {
                        RetryableErrorStateName::ReplicaReopen
                    }
                    _ if unit.delete_on_close => RetryableErrorStateName::ReplicaDelete,
                    _ => RetryableErrorStateName::ReplicaClose,
                };
                let action = unit.retry_state.on_success_and_transition_to(next);
                report_escalation(context, &unit, action, &property);
                let request = if opening { "ReplicaOpen" } else { "ReplicaClose" };
                send_to_replica_proxy(context, request, &unit);
                arm_proxy_timer(context, env);
                commit(context, unit);
                return Ok(());
            }

            let thresholds = env.config.retryable_errors.thresholds_for(state);
            match unit.retry_state.on_failure(now, &thresholds) {
                RetryableErrorAction::Drop if opening => {
                    drop_replica(context, &mut unit, &property);
                    commit(context, unit);
                }
                RetryableErrorAction::Drop => {
                    clear_outstanding_report(context, &unit, &property);
                    finish_close(context, unit);
                }
                action => {
                    report_escalation(context, &unit, action, &property);
                    arm_proxy_timer(context, env);
                    commit(context, unit);
                }
            }
        }
        (
            RetryableErrorStateName::ReplicaOpen | RetryableErrorStateName::ReplicaReopen,
            FailoverUnitState::Opening,
        ) => {
            send_to_replica_proxy(context, "ReplicaOpen", current);
            arm_proxy_timer(context, env);
        }
        (
            RetryableErrorStateName::ReplicaClose | RetryableErrorStateName::ReplicaDelete,
            FailoverUnitState::Closing,
        ) => {
            send_to_replica_proxy(context, "ReplicaClose", current);
            arm_proxy_timer(context, env);
        }
        _ => context.enqueue_action(StateMachineAction::CancelRetryTimer {
            timer: RetryTimer::ReplicaProxyMessage,
        }),
    }
    Ok(())
}

fn require_unit<'a>(context: &FailoverUnitContext<'a>) -> Result<&'a FailoverUnit, ProcessingError> {
    context.current().ok_or_else(|| ProcessingError::EntityNotFound {
        entity: context.key().to_string(),
    })
}

fn commit(context: &mut FailoverUnitContext<'_>, mut unit: FailoverUnit) {
    unit.local_sequence_number += 1;
    context.upsert(unit);
}

/// Give up on an open: the unit becomes terminal and the failover manager is told
fn drop_replica(context: &mut FailoverUnitContext<'_>, unit: &mut FailoverUnit, property: &str) {
    clear_outstanding_report(context, unit, property);
    unit.retry_state.enter_state(RetryableErrorStateName::None);
    unit.state = FailoverUnitState::Closed;
    context.enqueue_action(StateMachineAction::CancelRetryTimer {
        timer: RetryTimer::ReplicaProxyMessage,
    });
    send_to_failover_manager(context, "ReplicaDropped", close_reply_body(unit));
}

fn finish_close(context: &mut FailoverUnitContext<'_>, mut unit: FailoverUnit) {
    unit.retry_state.enter_state(RetryableErrorStateName::None);
    unit.state = FailoverUnitState::Closed;
    context.enqueue_action(StateMachineAction::CancelRetryTimer {
        timer: RetryTimer::ReplicaProxyMessage,
    });
    send_to_failover_manager(context, "ReplicaCloseReply", close_reply_body(&unit));

    if unit.delete_on_close {
        context.delete();
    } else {
        commit(context, unit);
    }
}

fn report_escalation(
    context: &mut FailoverUnitContext<'_>,
    unit: &FailoverUnit,
    action: RetryableErrorAction,
    property: &str,
) {
    let level = match action {
        RetryableErrorAction::ReportHealthWarning => HealthLevel::Warning,
        RetryableErrorAction::ReportHealthError => HealthLevel::Error,
        RetryableErrorAction::ClearHealthReport => {
            context.enqueue_action(StateMachineAction::ReportHealth(HealthReport::clear(
                unit.id, property,
            )));
            return;
        }
        RetryableErrorAction::None | RetryableErrorAction::Restart | RetryableErrorAction::Drop => {
            return
        }
    };

    let description = format!(
        "{} has failed {} times",
        unit.retry_state.current_state(),
        unit.retry_state.failure_count()
    );
    debug!(
        failover_unit = %unit.id,
        level = %level,
        description = %description,
        "🩺 RETRY: Escalating to health report"
    );
    context.enqueue_action(StateMachineAction::ReportHealth(HealthReport::new(
        unit.id,
        property,
        level,
        description,
    )));
}

fn clear_outstanding_report(context: &mut FailoverUnitContext<'_>, unit: &FailoverUnit, property: &str) {
    if unit.retry_state.reported_level() > EscalationLevel::Informational {
        report_escalation(context, unit, RetryableErrorAction::ClearHealthReport, property);
    }
}

fn arm_proxy_timer(context: &mut FailoverUnitContext<'_>, env: &AgentEnvironment) {
    context.enqueue_action(StateMachineAction::ArmRetryTimer {
        timer: RetryTimer::ReplicaProxyMessage,
        interval: env.config.timers.replica_proxy_retry_interval(),
    });
}

fn send_to_replica_proxy(context: &mut FailoverUnitContext<'_>, action: &str, unit: &FailoverUnit) {
    let body = json!({
        "failover_unit_id": unit.id,
        "service_type": unit.service_type,
        "replica_id": unit.local_replica_id,
        "role": unit.local_role,
        "epoch": unit.configuration_epoch,
    });
    context.enqueue_action(StateMachineAction::send(
        MessageTarget::ReplicaProxy,
        OutboundMessage::new(action, body),
    ));
}

fn send_to_failover_manager(
    context: &mut FailoverUnitContext<'_>,
    action: &str,
    body: serde_json::Value,
) {
    context.enqueue_action(StateMachineAction::send(
        MessageTarget::FailoverManager,
        OutboundMessage::new(action, body),
    ));
}

fn open_reply_body(unit: &FailoverUnit, success: bool) -> serde_json::Value {
    json!({
        "failover_unit_id": unit.id,
        "replica_id": unit.local_replica_id,
        "role": unit.local_role,
        "success": success,
    })
}

fn close_reply_body(unit: &FailoverUnit) -> serde_json::Value {
    json!({
        "failover_unit_id": unit.id,
        "replica_id": unit.local_replica_id,
        "deleted": unit.delete_on_close,
    })
}
