#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Reconfiguration Agent Core
//!
//! Node-local state machine core for replica reconfiguration in a partitioned cluster.
//!
//! ## Overview
//!
//! Every partition hosted on a node is represented by a failover unit. Messages from
//! the failover manager, the local replica proxy and load balancing arrive
//! concurrently; the core serializes all work per failover unit, persists each change
//! before it becomes visible, and defers every side effect until the entity lock has
//! been released.
//!
//! ## Architecture
//!
//! - **Entity layer**: a shared table of locked entities plus a durable store
//! - **Job layer**: a keyed work queue that never runs two jobs for the same entity
//!   at once and coalesces redundant pending work
//! - **State machine layer**: deferred action queues and the retry / escalation
//!   policy for long-running replica operations
//! - **Staleness gates**: sequence-number filters in front of the queue
//!
//! ## Module Organization
//!
//! - [`entity`] - Entity table, execution context and store abstraction
//! - [`job`] - Entity job items and the per-key job queue
//! - [`state_machine`] - Deferred actions and retryable error state
//! - [`staleness`] - Sequence-number staleness checkers
//! - [`ra`] - The reconfiguration agent and its message processors
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ra_core::config::ConfigManager;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! ra_core::logging::init_structured_logging();
//! let manager = ConfigManager::load_from_file("config/reconfiguration_agent.yaml")?;
//! println!("workers: {}", manager.config().job_queue.worker_count);
//! # Ok(())
//! # }
//! ```

pub mod macros;

pub mod config;
pub mod entity;
pub mod error;
pub mod health;
pub mod job;
pub mod logging;
pub mod ra;
pub mod staleness;
pub mod state_machine;
pub mod types;

pub use config::{ConfigManager, ReconfigurationAgentConfig};
pub use entity::{EntityExecutionContext, EntityMap, EntityStore, InMemoryEntityStore};
pub use error::{ProcessingError, ReconfigurationError, Result};
pub use job::{EntityJobItem, EntityJobQueue, JobCompletion, JobQueueOwner};
pub use ra::{FailoverUnit, FailoverUnitJob, FailoverUnitJobQueue, ReconfigurationAgent};
pub use staleness::{SequenceAdvance, StalenessChecker};
pub use state_machine::{
    RetryableErrorState, StateMachineAction, StateMachineActionQueue,
};
pub use types::{ActivityId, FailoverUnitId, NodeInstance, ServiceTypeKey};
