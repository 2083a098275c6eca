//! Exponential importance decay for long-term memories.
//!
//! ```text
//! current = importance * e^(-rate * age / max_age)
//! ```
//!
//! Decay is always computed from the importance the memory was promoted
//! with, so running it on every cycle never compounds. It produces a new
//! value; the stored event is replaced, never patched in place.

use crate::config::MemoryConfig;
use crate::event::MemoryEvent;
use crate::types::{Timestamp, hours_between};

/// Decayed importance after `age_hours`.
///
/// Non-increasing in age; equal to `importance` at age zero. Negative ages
/// are treated as zero.
#[must_use]
pub fn decayed_importance(importance: f64, age_hours: f64, max_age_hours: f64, rate: f64) -> f64 {
    if max_age_hours <= 0.0 {
        return importance;
    }
    importance * (-rate * age_hours.max(0.0) / max_age_hours).exp()
}

/// Return a copy of `event` with `current_importance` recomputed for `now`.
#[must_use]
pub fn decay_event(event: &MemoryEvent, now: Timestamp, config: &MemoryConfig) -> MemoryEvent {
    let age = hours_between(event.timestamp, now);
    MemoryEvent {
        current_importance: decayed_importance(event.importance, age, config.max_age_hours, config.decay_rate)
            .clamp(0.0, 100.0),
        ..event.clone()
    }
}

/// Result of one decay pass.
#[derive(Debug, Default)]
pub struct DecayOutcome {
    /// Memories still above the forget threshold, with refreshed importance.
    pub retained: Vec<MemoryEvent>,
    /// Memories that fell below the threshold.
    pub forgotten: Vec<MemoryEvent>,
}

/// Decay every memory and split off those below `config.forget_threshold`.
#[must_use]
pub fn apply_decay(memories: &[MemoryEvent], now: Timestamp, config: &MemoryConfig) -> DecayOutcome {
    let mut outcome = DecayOutcome::default();
    for memory in memories {
        let decayed = decay_event(memory, now, config);
        if decayed.current_importance < config.forget_threshold {
            outcome.forgotten.push(decayed);
        } else {
            outcome.retained.push(decayed);
        }
    }
    outcome
}
