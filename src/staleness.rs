//! # Staleness Checker
//!
//! Sequence-number gate for notifications that can arrive out of order or more than
//! once. Each key remembers the highest sequence number accepted so far; anything at
//! or below it is rejected before an entity lock is ever taken.
//!
//! Entries are kept only for a bounded time. A periodic cleanup drops keys that have
//! not been updated within the configured keep duration.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::types::{EntityKey, FailoverUnitId, ServiceTypeKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessEntry {
    pub sequence_number: u64,
    pub last_updated: Instant,
}

/// An accepted update together with the entry it replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceAdvance {
    pub sequence_number: u64,
    pub previous: Option<StalenessEntry>,
}

#[derive(Debug)]
pub struct StalenessChecker<K: EntityKey> {
    name: &'static str,
    entries: DashMap<K, StalenessEntry>,
    keep_duration: Duration,
}

/// Gate for service type notifications
pub type ServiceTypeUpdateStalenessChecker = StalenessChecker<ServiceTypeKey>;

/// Gate for per-partition messages
pub type PartitionStalenessChecker = StalenessChecker<FailoverUnitId>;

impl<K: EntityKey> StalenessChecker<K> {
    pub fn new(name: &'static str, keep_duration: Duration) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            keep_duration,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn keep_duration(&self) -> Duration {
        self.keep_duration
    }

    /// Accept `sequence_number` if it is newer than the recorded one for `key`.
    pub fn try_update_sequence_number(&self, key: &K, sequence_number: u64) -> bool {
        self.try_update_sequence_number_at(key, sequence_number, Instant::now())
    }

    pub fn try_update_sequence_number_at(&self, key: &K, sequence_number: u64, now: Instant) -> bool {
        self.try_advance(key, sequence_number, now).is_some()
    }

    /// Accept `sequence_number` like [`try_update_sequence_number`](Self::try_update_sequence_number)
    /// and return the entry it replaced. A caller that fails to act on the accepted
    /// update hands it back to [`revert`](Self::revert) so a retry is not rejected.
    pub fn try_advance(&self, key: &K, sequence_number: u64, now: Instant) -> Option<SequenceAdvance> {
        let accepted = StalenessEntry {
            sequence_number,
            last_updated: now,
        };
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().sequence_number;
                if sequence_number <= current {
                    trace!(
                        checker = self.name,
                        key = %key,
                        sequence_number = sequence_number,
                        current = current,
                        "Stale sequence number rejected"
                    );
                    return None;
                }
                let previous = std::mem::replace(occupied.get_mut(), accepted);
                Some(SequenceAdvance {
                    sequence_number,
                    previous: Some(previous),
                })
            }
            Entry::Vacant(vacant) => {
                vacant.insert(accepted);
                Some(SequenceAdvance {
                    sequence_number,
                    previous: None,
                })
            }
        }
    }

    /// Undo an accepted update. Has no effect once a newer sequence number has been
    /// recorded for `key`. Returns whether the entry was restored.
    pub fn revert(&self, key: &K, advance: SequenceAdvance) -> bool {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().sequence_number != advance.sequence_number {
                    return false;
                }
                match advance.previous {
                    Some(previous) => {
                        *occupied.get_mut() = previous;
                    }
                    None => {
                        occupied.remove();
                    }
                }
                debug!(
                    checker = self.name,
                    key = %key,
                    sequence_number = advance.sequence_number,
                    "↩️ STALENESS: Accepted sequence number reverted"
                );
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Highest accepted sequence number for `key`
    pub fn current(&self, key: &K) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.sequence_number)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries last updated more than the keep duration before `now`.
    /// Returns the number of entries removed.
    pub fn perform_cleanup(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            now.saturating_duration_since(entry.last_updated) <= self.keep_duration
        });
        let removed = before.saturating_sub(self.entries.len());

        debug!(
            checker = self.name,
            removed = removed,
            remaining = self.entries.len(),
            "🧹 STALENESS: Cleanup completed"
        );
        removed
    }

    /// Run [`perform_cleanup`](Self::perform_cleanup) every `interval` until the
    /// returned handle is aborted.
    pub fn spawn_cleanup_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let checker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                checker.perform_cleanup(Instant::now());
            }
        })
    }
}
