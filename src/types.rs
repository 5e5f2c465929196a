//! # Core Identifier Types
//!
//! Identifiers shared across the entity, job and staleness layers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use uuid::Uuid;

/// Marker for types usable as an entity key in the entity table, job queue and
/// staleness maps.
pub trait EntityKey: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> EntityKey for T where T: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{}

/// Correlation id carried from the inbound message through every action it produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityId(Uuid);

impl ActivityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The nil activity id. Never valid for action execution.
    pub const fn empty() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ActivityId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ActivityId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one partition (and therefore of its local failover unit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FailoverUnitId(Uuid);

impl FailoverUnitId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FailoverUnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for FailoverUnitId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for FailoverUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node identity plus the incarnation of the process running on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInstance {
    pub node_id: u64,
    pub instance_id: u64,
}

impl NodeInstance {
    pub fn new(node_id: u64, instance_id: u64) -> Self {
        Self {
            node_id,
            instance_id,
        }
    }
}

impl fmt::Display for NodeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node_id, self.instance_id)
    }
}

/// Service type qualified by its application package
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceTypeKey {
    pub application_id: String,
    pub service_type_name: String,
}

impl ServiceTypeKey {
    pub fn new(application_id: impl Into<String>, service_type_name: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            service_type_name: service_type_name.into(),
        }
    }
}

impl fmt::Display for ServiceTypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application_id, self.service_type_name)
    }
}
