//! # Reconfiguration Agent Configuration
//!
//! Explicit configuration structs handed to the agent and its queues at construction.
//! There is no process-wide configuration singleton; tests build a
//! [`ReconfigurationAgentConfig`] directly and production code loads one through
//! [`ConfigManager`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ra_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load_from_file("config/reconfiguration_agent.yaml")?;
//!
//! let workers = manager.config().job_queue.worker_count;
//! let keep_for = manager.config().staleness.entry_keep_duration();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::state_machine::{RetryThresholds, RetryableErrorStateName};

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration for one reconfiguration agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconfigurationAgentConfig {
    pub job_queue: JobQueueConfig,
    pub staleness: StalenessConfig,
    pub retryable_errors: RetryableErrorConfig,
    pub health: HealthConfig,
    pub timers: RetryTimerConfig,
}

/// Failover unit job queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQueueConfig {
    /// Number of jobs that may process concurrently across different entities
    pub worker_count: usize,
    /// Pending jobs admitted before new work is rejected
    pub max_queue_size: usize,
    /// Minimum time between two queue-full warnings
    pub queue_full_warning_interval_seconds: u64,
    /// Upper bound on how long a throttled entity waits before re-evaluation
    pub throttle_recheck_interval_ms: u64,
    /// Load balancer jobs allowed in flight at once; further ones are throttled
    pub max_parallel_load_balancer_jobs: usize,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_queue_size: 10_000,
            queue_full_warning_interval_seconds: 10,
            throttle_recheck_interval_ms: 1_000,
            max_parallel_load_balancer_jobs: 32,
        }
    }
}

impl JobQueueConfig {
    pub fn queue_full_warning_interval(&self) -> Duration {
        Duration::from_secs(self.queue_full_warning_interval_seconds)
    }
}

/// Staleness map cleanup settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StalenessConfig {
    pub cleanup_interval_seconds: u64,
    /// Entries untouched for longer than this are purged by cleanup
    pub entry_keep_duration_seconds: u64,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_seconds: 3_600,
            entry_keep_duration_seconds: 600,
        }
    }
}

impl StalenessConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn entry_keep_duration(&self) -> Duration {
        Duration::from_secs(self.entry_keep_duration_seconds)
    }
}

/// Escalation thresholds for each retryable operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryableErrorConfig {
    pub replica_open: RetryThresholds,
    pub replica_reopen: RetryThresholds,
    pub find_service_registration_at_open: RetryThresholds,
    pub find_service_registration_at_reopen: RetryThresholds,
    pub find_service_registration_at_drop: RetryThresholds,
    pub replica_change_role_at_catchup: RetryThresholds,
    pub replica_close: RetryThresholds,
    pub replica_delete: RetryThresholds,
}

impl Default for RetryableErrorConfig {
    fn default() -> Self {
        Self {
            replica_open: RetryThresholds::with_warning_and_drop(10, 40),
            replica_reopen: RetryThresholds::with_warning_and_drop(10, 40_320),
            find_service_registration_at_open: RetryThresholds::unbounded(),
            find_service_registration_at_reopen: RetryThresholds::unbounded(),
            find_service_registration_at_drop: RetryThresholds::with_warning_and_drop(240, 1_920),
            replica_change_role_at_catchup: RetryThresholds {
                restart_threshold: 10,
                ..RetryThresholds::unbounded()
            },
            replica_close: RetryThresholds::with_warning_and_drop(10, 40_320),
            replica_delete: RetryThresholds::with_warning_and_drop(10, 40),
        }
    }
}

impl RetryableErrorConfig {
    pub fn thresholds_for(&self, state: RetryableErrorStateName) -> RetryThresholds {
        match state {
            RetryableErrorStateName::None => RetryThresholds::unbounded(),
            RetryableErrorStateName::ReplicaOpen => self.replica_open,
            RetryableErrorStateName::ReplicaReopen => self.replica_reopen,
            RetryableErrorStateName::FindServiceRegistrationAtOpen => {
                self.find_service_registration_at_open
            }
            RetryableErrorStateName::FindServiceRegistrationAtReopen => {
                self.find_service_registration_at_reopen
            }
            RetryableErrorStateName::FindServiceRegistrationAtDrop => {
                self.find_service_registration_at_drop
            }
            RetryableErrorStateName::ReplicaChangeRoleAtCatchup => {
                self.replica_change_role_at_catchup
            }
            RetryableErrorStateName::ReplicaClose => self.replica_close,
            RetryableErrorStateName::ReplicaDelete => self.replica_delete,
        }
    }

    fn named(&self) -> [(&'static str, RetryThresholds); 8] {
        [
            ("replica_open", self.replica_open),
            ("replica_reopen", self.replica_reopen),
            (
                "find_service_registration_at_open",
                self.find_service_registration_at_open,
            ),
            (
                "find_service_registration_at_reopen",
                self.find_service_registration_at_reopen,
            ),
            (
                "find_service_registration_at_drop",
                self.find_service_registration_at_drop,
            ),
            (
                "replica_change_role_at_catchup",
                self.replica_change_role_at_catchup,
            ),
            ("replica_close", self.replica_close),
            ("replica_delete", self.replica_delete),
        ]
    }
}

/// Health report property names used for escalations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub replica_open_status_property: String,
    pub replica_close_status_property: String,
    pub replica_change_role_status_property: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            replica_open_status_property: "ReplicaOpenStatus".to_string(),
            replica_close_status_property: "ReplicaCloseStatus".to_string(),
            replica_change_role_status_property: "ReplicaChangeRoleStatus".to_string(),
        }
    }
}

/// Interval for the retry timer armed by message processors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryTimerConfig {
    pub replica_proxy_retry_interval_ms: u64,
}

impl Default for RetryTimerConfig {
    fn default() -> Self {
        Self {
            replica_proxy_retry_interval_ms: 5_000,
        }
    }
}

impl RetryTimerConfig {
    pub fn replica_proxy_retry_interval(&self) -> Duration {
        Duration::from_millis(self.replica_proxy_retry_interval_ms)
    }
}

impl ReconfigurationAgentConfig {
    /// Reject values that would stall or misconfigure the agent
    pub fn validate(&self) -> ConfigResult<()> {
        if self.job_queue.worker_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "job_queue.worker_count",
                "0",
                "at least one worker is required",
            ));
        }

        if self.job_queue.max_queue_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "job_queue.max_queue_size",
                "0",
                "queue size must be greater than 0",
            ));
        }

        if self.job_queue.throttle_recheck_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "job_queue.throttle_recheck_interval_ms",
                "0",
                "recheck interval must be greater than 0",
            ));
        }

        if self.staleness.cleanup_interval_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "staleness.cleanup_interval_seconds",
                "0",
                "cleanup interval must be greater than 0",
            ));
        }

        for (name, thresholds) in self.retryable_errors.named() {
            for (field, value) in [
                ("warning_report_threshold", thresholds.warning_report_threshold),
                ("error_report_threshold", thresholds.error_report_threshold),
                ("restart_threshold", thresholds.restart_threshold),
                ("drop_threshold", thresholds.drop_threshold),
            ] {
                if value == 0 {
                    return Err(ConfigurationError::invalid_value(
                        format!("retryable_errors.{name}.{field}"),
                        "0",
                        "thresholds count failures and start at 1",
                    ));
                }
            }
        }

        for (field, value) in [
            (
                "health.replica_open_status_property",
                &self.health.replica_open_status_property,
            ),
            (
                "health.replica_close_status_property",
                &self.health.replica_close_status_property,
            ),
            (
                "health.replica_change_role_status_property",
                &self.health.replica_change_role_status_property,
            ),
        ] {
            if value.is_empty() {
                return Err(ConfigurationError::missing_required_field(
                    field,
                    "health configuration",
                ));
            }
        }

        Ok(())
    }
}
