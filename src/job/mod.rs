//! # Entity Jobs
//!
//! Job items, the per-key exclusive queue that dispatches them, and the supporting
//! metrics and rate limiting.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ra_core::config::JobQueueConfig;
//! use ra_core::job::{EntityJobItem, EntityJobQueue, JobKind, JobOrigin, JobQueueOwner};
//! use std::sync::Arc;
//!
//! const TOUCH: JobKind = JobKind::new("touch");
//!
//! # async fn example<O: JobQueueOwner<String, u64>>(owner: Arc<O>) -> ra_core::Result<()> {
//! let queue = EntityJobQueue::new("example", JobQueueConfig::default(), owner);
//!
//! let (job, completion) = EntityJobItem::new(
//!     "partition-1".to_string(),
//!     TOUCH,
//!     JobOrigin::local(),
//!     |context| {
//!         let next = context.current().copied().unwrap_or(0) + 1;
//!         context.upsert(next);
//!         Ok(())
//!     },
//! )
//! .with_completion_channel();
//!
//! queue.enqueue(job)?;
//! let _ = tokio::task::spawn_blocking(move || completion.recv()).await;
//! queue.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod job_item;
pub mod metrics;
pub mod queue;
pub mod sequence_stream;
pub mod throttle;

pub use job_item::{
    CompletionCallback, EntityJobItem, JobCompletion, JobKind, JobOrigin, JobProcessor, JobSource,
};
pub use metrics::JobQueueMetrics;
pub use queue::{EnqueueOutcome, EntityJobQueue, JobQueueError, JobQueueOwner, QueueLoad};
pub use sequence_stream::{
    SequenceStreamItem, SequenceStreamJob, SequenceStreamState, StreamKey, SEQUENCE_STREAM,
};
pub use throttle::WarningThrottle;
