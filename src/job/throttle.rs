use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Rate limiter for repetitive warnings such as queue-full traces.
///
/// At most one warning is let through per `min_interval`; suppressed occurrences are
/// counted and reported with the next one that gets through.
#[derive(Debug)]
pub struct WarningThrottle {
    min_interval: Duration,
    state: Mutex<ThrottleState>,
}

#[derive(Debug, Default)]
struct ThrottleState {
    last_emitted: Option<Instant>,
    suppressed: u64,
}

impl WarningThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Returns the number of suppressed warnings when a warning may be emitted now
    pub fn try_emit(&self) -> Option<u64> {
        self.try_emit_at(Instant::now())
    }

    pub fn try_emit_at(&self, now: Instant) -> Option<u64> {
        let mut state = self.state.lock();
        let allowed = match state.last_emitted {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
        };

        if allowed {
            state.last_emitted = Some(now);
            Some(std::mem::take(&mut state.suppressed))
        } else {
            state.suppressed += 1;
            None
        }
    }
}
