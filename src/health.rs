//! # Health Report Requests
//!
//! The core never talks to the health store directly. It produces `HealthReport`
//! requests as deferred actions and an external health client delivers them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity carried by a health report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Ok,
    Warning,
    Error,
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Request for the external health client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Entity the report is about, rendered by the entity key's `Display`
    pub entity: String,
    /// Health property, e.g. `ReplicaOpenStatus`
    pub property: String,
    pub level: HealthLevel,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(
        entity: impl ToString,
        property: impl Into<String>,
        level: HealthLevel,
        description: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.to_string(),
            property: property.into(),
            level,
            description: description.into(),
            created_at: Utc::now(),
        }
    }

    /// Report that clears an earlier warning or error on the same property
    pub fn clear(entity: impl ToString, property: impl Into<String>) -> Self {
        Self::new(entity, property, HealthLevel::Ok, "")
    }

    pub fn is_clear(&self) -> bool {
        self.level == HealthLevel::Ok
    }
}
