use serde::{Deserialize, Serialize};
use std::fmt;

use crate::entity::EntityExecutionContext;
use crate::error::ProcessingError;
use crate::job::{EntityJobItem, JobKind, JobOrigin};
use crate::state_machine::RetryableErrorState;
use crate::types::{FailoverUnitId, NodeInstance, ServiceTypeKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaRole {
    #[default]
    None,
    Idle,
    Secondary,
    Primary,
}

/// Lifecycle of the local replica. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverUnitState {
    Opening,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for FailoverUnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opening => write!(f, "opening"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescription {
    pub node: NodeInstance,
    pub replica_id: u64,
    pub role: ReplicaRole,
}

/// The local agent's view of one partition replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverUnit {
    pub id: FailoverUnitId,
    pub service_type: ServiceTypeKey,
    pub state: FailoverUnitState,
    pub local_replica_id: u64,
    pub local_role: ReplicaRole,
    pub configuration_epoch: u64,
    pub replicas: Vec<ReplicaDescription>,
    /// Incremented on every committed change
    pub local_sequence_number: u64,
    /// Delete the replica (not just close it) once the close completes
    pub delete_on_close: bool,
    pub retry_state: RetryableErrorState,
}

impl FailoverUnit {
    pub fn new(
        id: FailoverUnitId,
        service_type: ServiceTypeKey,
        local_replica_id: u64,
        local_role: ReplicaRole,
        configuration_epoch: u64,
    ) -> Self {
        Self {
            id,
            service_type,
            state: FailoverUnitState::Opening,
            local_replica_id,
            local_role,
            configuration_epoch,
            replicas: Vec::new(),
            local_sequence_number: 0,
            delete_on_close: false,
            retry_state: RetryableErrorState::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == FailoverUnitState::Closed
    }
}

pub type FailoverUnitJob = EntityJobItem<FailoverUnitId, FailoverUnit>;

pub type FailoverUnitContext<'a> = EntityExecutionContext<'a, FailoverUnitId, FailoverUnit>;

impl EntityJobItem<FailoverUnitId, FailoverUnit> {
    /// Job for a message received from the failover manager or another node
    pub fn from_federation<F>(id: FailoverUnitId, from: NodeInstance, kind: JobKind, processor: F) -> Self
    where
        F: FnOnce(&mut FailoverUnitContext<'_>) -> Result<(), ProcessingError> + Send + 'static,
    {
        EntityJobItem::new(id, kind, JobOrigin::federation(from), processor)
    }

    /// Job for a placement or load balancing request. Subject to throttling.
    pub fn from_load_balancer<F>(
        id: FailoverUnitId,
        from: NodeInstance,
        kind: JobKind,
        processor: F,
    ) -> Self
    where
        F: FnOnce(&mut FailoverUnitContext<'_>) -> Result<(), ProcessingError> + Send + 'static,
    {
        EntityJobItem::new(id, kind, JobOrigin::load_balancer(from), processor)
    }
}
