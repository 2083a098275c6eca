//! Importance scoring for newly recorded events.
//!
//! Each participant scores an event from its own point of view:
//!
//! ```text
//! importance = base
//!            + type_weight(event) * type_scale
//!            + emotional * |impact|
//!            + min(per_participant * (n - 1), participant_cap)
//!            + relationship * |average trust toward the other participants|
//!            + recency * e^(-age_hours / recency_scale_hours)
//! ```
//!
//! and the result is clamped to `[0, 100]`.

use std::collections::HashMap;

use crate::config::ImportanceWeights;
use crate::event::EventType;
use crate::relationship::RelationshipRecord;
use crate::types::NpcId;

/// Inputs to the importance formula.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImportanceInputs {
    /// Event type (selects the type weight).
    pub event_type: EventType,
    /// Emotional impact in `[-1, 1]`.
    pub emotional_impact: f64,
    /// Number of distinct participants.
    pub participant_count: usize,
    /// Average trust from the scorer toward the other participants.
    pub average_trust: f64,
    /// Hours between the event and the moment it is scored.
    pub age_hours: f64,
}

/// Score an event. Always returns a value in `[0, 100]`; NaN inputs score 0.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn score(inputs: &ImportanceInputs, weights: &ImportanceWeights) -> f64 {
    let extra_participants = inputs.participant_count.saturating_sub(1) as f64;
    let participant_term = (weights.per_participant * extra_participants).min(weights.participant_cap);
    let recency_term = weights.recency * (-inputs.age_hours.max(0.0) / weights.recency_scale_hours).exp();

    let raw = weights.base
        + inputs.event_type.weight() * weights.type_scale
        + weights.emotional * inputs.emotional_impact.abs()
        + participant_term
        + weights.relationship * inputs.average_trust.abs()
        + recency_term;

    if raw.is_nan() { 0.0 } else { raw.clamp(0.0, 100.0) }
}

/// Average trust `owner` holds toward the other `participants`.
///
/// Participants without a record count as neutral (0). Returns 0 when the
/// owner is the only participant.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn average_trust(
    owner: NpcId,
    participants: &[NpcId],
    relationships: &HashMap<NpcId, RelationshipRecord>,
) -> f64 {
    let (sum, count) = participants
        .iter()
        .filter(|p| **p != owner)
        .fold((0.0, 0usize), |(sum, count), p| {
            let trust = relationships.get(p).map_or(0.0, |r| r.trust);
            (sum + trust, count + 1)
        });
    if count == 0 { 0.0 } else { sum / count as f64 }
}
