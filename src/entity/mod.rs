//! # Entity Table
//!
//! In-memory authoritative state for every entity the agent manages, the per-entity
//! lock that serializes mutation, the execution context a processor runs against, and
//! the store seam used to persist committed changes.
//!
//! ## Lifecycle
//!
//! Entities are created on first reference and updated in place on every successful
//! commit. A delete leaves a tombstone behind; the entry itself is only dropped by
//! [`EntityMap::prune_deleted`] once nothing references it any more.

pub mod entry;
pub mod execution_context;
pub mod store;

pub use entry::{EntityEntry, EntityMap, LockedEntity};
pub use execution_context::{
    CommitDescription, CommitType, EntityChange, EntityExecutionContext, UpdateContext,
};
pub use store::{EntityStore, InMemoryEntityStore, StoreError};
