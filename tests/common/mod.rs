#![allow(dead_code)]

pub mod strategies;
pub mod test_owner;

pub use strategies::*;
pub use test_owner::*;

use crossbeam::channel::Receiver;
use ra_core::job::JobCompletion;
use std::time::Duration;

pub const COMPLETION_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait for a job completion without blocking the async runtime
pub async fn wait_for(receiver: Receiver<JobCompletion>) -> JobCompletion {
    tokio::task::spawn_blocking(move || receiver.recv_timeout(COMPLETION_TIMEOUT))
        .await
        .expect("completion waiter panicked")
        .expect("job did not complete in time")
}
