//! Jobs over sequence-numbered report streams.
//!
//! A reporter sends batches of items tagged with increasing sequence numbers. Batches
//! can arrive late or twice, so the stream entity remembers the last applied sequence
//! and skips anything at or below it.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::job_item::{EntityJobItem, JobKind, JobOrigin};
use crate::entity::EntityExecutionContext;
use crate::error::ProcessingError;

pub const SEQUENCE_STREAM: JobKind = JobKind::new("process_sequence_stream");

/// Identity of one reporter's stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub source_id: String,
    pub stream: String,
}

impl StreamKey {
    pub fn new(source_id: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            stream: stream.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source_id, self.stream)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStreamItem {
    pub sequence_number: u64,
    pub payload: serde_json::Value,
}

impl SequenceStreamItem {
    pub fn new(sequence_number: u64, payload: serde_json::Value) -> Self {
        Self {
            sequence_number,
            payload,
        }
    }
}

/// Persisted progress of one stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceStreamState {
    pub last_applied_sequence: u64,
    pub applied_count: u64,
    pub latest_payload: Option<serde_json::Value>,
}

impl SequenceStreamState {
    /// Apply every item newer than the last applied sequence, in sequence order.
    /// Returns the number of items applied.
    pub fn apply(&mut self, mut items: Vec<SequenceStreamItem>) -> usize {
        items.sort_by_key(|item| item.sequence_number);

        let mut applied = 0;
        for item in items {
            if item.sequence_number <= self.last_applied_sequence {
                continue;
            }
            self.last_applied_sequence = item.sequence_number;
            self.latest_payload = Some(item.payload);
            self.applied_count += 1;
            applied += 1;
        }
        applied
    }
}

pub type SequenceStreamJob = EntityJobItem<StreamKey, SequenceStreamState>;

impl EntityJobItem<StreamKey, SequenceStreamState> {
    /// Job that folds `items` into the stream's state. Nothing is committed when every
    /// item is stale.
    pub fn process_sequence_stream(
        key: StreamKey,
        items: Vec<SequenceStreamItem>,
        origin: JobOrigin,
    ) -> Self {
        EntityJobItem::new(key, SEQUENCE_STREAM, origin, move |context| {
            apply_stream_items(context, items)
        })
    }
}

fn apply_stream_items(
    context: &mut EntityExecutionContext<'_, StreamKey, SequenceStreamState>,
    items: Vec<SequenceStreamItem>,
) -> Result<(), ProcessingError> {
    let mut state = context.current().cloned().unwrap_or_default();
    let applied = state.apply(items);

    if applied > 0 {
        tracing::trace!(
            stream = %context.key(),
            applied = applied,
            last_applied_sequence = state.last_applied_sequence,
            "Applied stream items"
        );
        context.upsert(state);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_skips_stale_and_duplicate_items() {
        let mut state = SequenceStreamState::default();
        let applied = state.apply(vec![
            SequenceStreamItem::new(3, json!("c")),
            SequenceStreamItem::new(1, json!("a")),
            SequenceStreamItem::new(3, json!("dup")),
        ]);
        assert_eq!(applied, 2);
        assert_eq!(state.last_applied_sequence, 3);
        assert_eq!(state.latest_payload, Some(json!("c")));

        assert_eq!(state.apply(vec![SequenceStreamItem::new(2, json!("late"))]), 0);
        assert_eq!(state.applied_count, 2);
    }
}
