//! Inbound requests delivered by the message dispatch collaborator.
//!
//! Wire decoding happens before these types are built; the agent only sees the
//! decoded body and the sender.

use serde::{Deserialize, Serialize};

use super::failover_unit::{ReplicaDescription, ReplicaRole};
use crate::job::{JobKind, JobSource};
use crate::types::{FailoverUnitId, ServiceTypeKey};

pub const REPLICA_OPEN: JobKind = JobKind::new("replica_open");
pub const REPLICA_OPEN_REPLY: JobKind = JobKind::new("replica_open_reply");
pub const REPLICA_CLOSE: JobKind = JobKind::new("replica_close");
pub const REPLICA_CLOSE_REPLY: JobKind = JobKind::new("replica_close_reply");
pub const DO_RECONFIGURATION: JobKind = JobKind::new("do_reconfiguration");
pub const RETRY_TIMER: JobKind = JobKind::new("retry_timer");
pub const SERVICE_TYPE_REGISTERED: JobKind = JobKind::new("service_type_registered");

/// Result reported by the replica proxy for an open or close
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationResult {
    Success,
    Failed { reason: String },
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageBody {
    /// Failover manager asks this node to open a replica
    ReplicaOpen {
        service_type: ServiceTypeKey,
        replica_id: u64,
        role: ReplicaRole,
        epoch: u64,
    },
    /// Replica proxy finished an open attempt
    ReplicaOpenReply {
        replica_id: u64,
        result: OperationResult,
    },
    /// Failover manager asks this node to close (or delete) a replica
    ReplicaClose { replica_id: u64, delete: bool },
    /// Replica proxy finished a close attempt
    ReplicaCloseReply {
        replica_id: u64,
        result: OperationResult,
    },
    /// New configuration for the partition
    DoReconfiguration {
        epoch: u64,
        replicas: Vec<ReplicaDescription>,
    },
}

impl MessageBody {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::ReplicaOpen { .. } => REPLICA_OPEN,
            Self::ReplicaOpenReply { .. } => REPLICA_OPEN_REPLY,
            Self::ReplicaClose { .. } => REPLICA_CLOSE,
            Self::ReplicaCloseReply { .. } => REPLICA_CLOSE_REPLY,
            Self::DoReconfiguration { .. } => DO_RECONFIGURATION,
        }
    }
}

/// Message addressed to one failover unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverUnitMessage {
    pub failover_unit_id: FailoverUnitId,
    /// Sender's sequence number; messages without one bypass the staleness gate
    pub sequence_number: Option<u64>,
    pub source: JobSource,
    pub body: MessageBody,
}

impl FailoverUnitMessage {
    /// Message from the failover manager
    pub fn new(failover_unit_id: FailoverUnitId, sequence_number: u64, body: MessageBody) -> Self {
        Self {
            failover_unit_id,
            sequence_number: Some(sequence_number),
            source: JobSource::Federation,
            body,
        }
    }

    /// Reply from the local replica proxy
    pub fn local_reply(failover_unit_id: FailoverUnitId, body: MessageBody) -> Self {
        Self {
            failover_unit_id,
            sequence_number: None,
            source: JobSource::Local,
            body,
        }
    }

    pub fn from_load_balancer(mut self) -> Self {
        self.source = JobSource::LoadBalancer;
        self
    }
}

/// Service type registration change on this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTypeNotification {
    pub service_type: ServiceTypeKey,
    pub sequence_number: u64,
    pub registered: bool,
}
