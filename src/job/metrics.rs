use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use super::job_item::JobCompletion;

/// Point-in-time view of a job queue's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobQueueMetrics {
    pub enqueued: u64,
    pub combined: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
    pub abandoned: u64,
    /// Times a ready job was held back by the throttle policy
    pub throttle_deferrals: u64,
    pub pending: usize,
    pub in_flight: usize,
}

impl JobQueueMetrics {
    /// Jobs that reached a terminal completion other than `Combined`
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.panicked + self.abandoned
    }
}

#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    enqueued: AtomicU64,
    combined: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    abandoned: AtomicU64,
    throttle_deferrals: AtomicU64,
}

impl QueueCounters {
    pub(crate) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_throttle_deferral(&self) {
        self.throttle_deferrals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, completion: &JobCompletion) {
        let counter = match completion {
            JobCompletion::Completed { .. } => &self.completed,
            JobCompletion::Failed(_) => &self.failed,
            JobCompletion::Panicked(_) => &self.panicked,
            JobCompletion::Combined => &self.combined,
            JobCompletion::Rejected(_) => &self.rejected,
            JobCompletion::Abandoned => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, pending: usize, in_flight: usize) -> JobQueueMetrics {
        JobQueueMetrics {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            combined: self.combined.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            throttle_deferrals: self.throttle_deferrals.load(Ordering::Relaxed),
            pending,
            in_flight,
        }
    }
}
