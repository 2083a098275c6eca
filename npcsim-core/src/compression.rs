//! Memory compression: short-term memories in, long-term candidates out.
//!
//! Short-term memories are grouped by `(event type, sorted participant set)`
//! and each group is reduced by size:
//!
//! | group size              | strategy    | output                                  |
//! |-------------------------|-------------|-----------------------------------------|
//! | `>= 2 * threshold`      | Summarize   | one synthetic event over the whole span |
//! | `>= threshold`          | Aggregate   | the strongest event, details merged     |
//! | `< threshold`           | Prune       | each event stripped to its essentials   |
//!
//! Every output at or above the importance threshold is significant and goes
//! to long-term memory. The rest are forgotten.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::MemoryConfig;
use crate::event::{EventType, MemoryEvent, MemoryOrigin};
use crate::types::{MemoryId, NpcId};

/// Compression strategy chosen for a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Replace the group with one synthetic event.
    Summarize,
    /// Keep the strongest event and fold the others into it.
    Aggregate,
    /// Keep each event, stripped of verbose detail.
    Prune,
}

/// Grouping key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    /// Shared event type.
    pub event_type: EventType,
    /// Shared sorted participant set.
    pub participants: Vec<NpcId>,
}

/// What happened to one group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupReport {
    /// The group.
    pub key: GroupKey,
    /// Strategy applied.
    pub strategy: Strategy,
    /// Input size.
    pub size: usize,
    /// Outputs produced.
    pub produced: usize,
}

/// Result of compressing one NPC's short-term memory.
#[derive(Debug, Default)]
pub struct CompressionOutcome {
    /// Promoted to long-term memory.
    pub significant: Vec<MemoryEvent>,
    /// Below the importance threshold.
    pub forgotten: Vec<MemoryEvent>,
    /// One report per group, in order of first appearance.
    pub groups: Vec<GroupReport>,
}

/// Pick the strategy for a group of `size` events.
#[must_use]
pub fn choose_strategy(size: usize, threshold: usize) -> Strategy {
    let threshold = threshold.max(1);
    if size >= threshold.saturating_mul(2) {
        Strategy::Summarize
    } else if size >= threshold {
        Strategy::Aggregate
    } else {
        Strategy::Prune
    }
}

/// Group memories by key, keeping first-appearance order of groups and
/// arrival order within each group.
#[must_use]
pub fn group(memories: Vec<MemoryEvent>) -> Vec<(GroupKey, Vec<MemoryEvent>)> {
    let mut groups: Vec<(GroupKey, Vec<MemoryEvent>)> = Vec::new();
    let mut slots: HashMap<GroupKey, usize> = HashMap::new();
    for memory in memories {
        let key = GroupKey {
            event_type: memory.event_type(),
            participants: memory.participant_set(),
        };
        if let Some(&slot) = slots.get(&key) {
            groups[slot].1.push(memory);
        } else {
            slots.insert(key.clone(), groups.len());
            groups.push((key, vec![memory]));
        }
    }
    groups
}

/// Compress a drained short-term memory.
#[must_use]
pub fn compress(short_term: Vec<MemoryEvent>, config: &MemoryConfig) -> CompressionOutcome {
    let mut outcome = CompressionOutcome::default();

    for (key, members) in group(short_term) {
        let size = members.len();
        let strategy = choose_strategy(size, config.compression_threshold);
        let produced: Vec<MemoryEvent> = match strategy {
            Strategy::Summarize => summarize(&members).into_iter().collect(),
            Strategy::Aggregate => aggregate(members).into_iter().collect(),
            Strategy::Prune => members
                .iter()
                .map(|m| prune(m, config.prune_detail_chars))
                .collect(),
        };

        outcome.groups.push(GroupReport {
            key,
            strategy,
            size,
            produced: produced.len(),
        });
        for event in produced {
            if event.importance >= config.importance_threshold {
                outcome.significant.push(event);
            } else {
                outcome.forgotten.push(event);
            }
        }
    }

    outcome
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// One synthetic event spanning the whole group, or `None` for an empty one.
///
/// Timestamp is the latest constituent's; the origin records the true first
/// and last times. Importance is the group maximum, emotional impact the
/// mean, participants and tags the unions.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn summarize(members: &[MemoryEvent]) -> Option<MemoryEvent> {
    let mut ordered: Vec<&MemoryEvent> = members.iter().collect();
    ordered.sort_by_key(|m| m.timestamp);
    let (earliest, latest) = (*ordered.first()?, *ordered.last()?);

    let mut details = earliest.details.clone();
    for m in ordered.iter().skip(1) {
        details.absorb(&m.details);
    }

    let importance = members.iter().map(|m| m.importance).fold(0.0, f64::max);
    let impact = members.iter().map(|m| m.emotional_impact).sum::<f64>() / members.len() as f64;

    Some(MemoryEvent {
        id: MemoryId::new(),
        timestamp: latest.timestamp,
        notes: Some(format!("summary of {} {} events", members.len(), details.event_type())),
        details,
        importance,
        current_importance: importance,
        participants: union_participants(members),
        location: latest.location,
        emotional_impact: impact.clamp(-1.0, 1.0),
        tags: union_tags(members),
        related_memories: members.iter().map(|m| m.id).collect(),
        origin: MemoryOrigin::Summarized {
            first: earliest.timestamp,
            last: latest.timestamp,
            count: members.len(),
        },
    })
}

/// The group's strongest event (latest wins ties) with the other events'
/// key details folded in, in chronological order. `None` for an empty group.
#[must_use]
pub fn aggregate(mut members: Vec<MemoryEvent>) -> Option<MemoryEvent> {
    let count = members.len();
    let participants = union_participants(&members);
    let tags = union_tags(&members);

    let rep_index = members
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.importance
                .total_cmp(&b.importance)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        })
        .map(|(i, _)| i)?;

    let mut representative = members.swap_remove(rep_index);
    members.sort_by_key(|m| m.timestamp);
    for other in &members {
        representative.details.absorb(&other.details);
        representative.related_memories.push(other.id);
    }
    representative.participants = participants;
    representative.tags = tags;
    representative.current_importance = representative.importance;
    representative.origin = MemoryOrigin::Aggregated { count };
    Some(representative)
}

/// The event with text fields truncated and notes dropped.
#[must_use]
pub fn prune(memory: &MemoryEvent, max_chars: usize) -> MemoryEvent {
    MemoryEvent {
        details: memory.details.essentials(max_chars),
        notes: None,
        origin: MemoryOrigin::Pruned,
        ..memory.clone()
    }
}

fn union_participants(members: &[MemoryEvent]) -> Vec<NpcId> {
    let mut seen = std::collections::HashSet::new();
    members
        .iter()
        .flat_map(|m| m.participants.iter().copied())
        .filter(|p| seen.insert(*p))
        .collect()
}

fn union_tags(members: &[MemoryEvent]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    members
        .iter()
        .flat_map(|m| m.tags.iter())
        .filter(|t| seen.insert(t.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventDetails;
    use crate::types::Timestamp;
    use chrono::{Duration, Utc};

    fn event(details: EventDetails, participants: &[NpcId], importance: f64, at: Timestamp) -> MemoryEvent {
        MemoryEvent {
            id: MemoryId::new(),
            timestamp: at,
            details,
            importance,
            current_importance: importance,
            participants: participants.to_vec(),
            location: None,
            emotional_impact: -0.6,
            tags: vec!["fight".into()],
            related_memories: Vec::new(),
            notes: Some("a long and winding account".into()),
            origin: MemoryOrigin::Observed,
        }
    }

    fn conflict(participants: &[NpcId], importance: f64, at: Timestamp) -> MemoryEvent {
        event(
            EventDetails::Conflict { damage: 5.0, outcome: "draw".into() },
            participants,
            importance,
            at,
        )
    }

    #[test]
    fn strategy_thresholds() {
        assert_eq!(choose_strategy(10, 5), Strategy::Summarize);
        assert_eq!(choose_strategy(9, 5), Strategy::Aggregate);
        assert_eq!(choose_strategy(5, 5), Strategy::Aggregate);
        assert_eq!(choose_strategy(4, 5), Strategy::Prune);
    }

    #[test]
    fn ten_conflicts_summarize_into_one() {
        let (a, b) = (NpcId::new(), NpcId::new());
        let start = Utc::now() - Duration::hours(10);
        let members: Vec<_> = (0..10)
            .map(|i| conflict(&[a, b], 70.0 + f64::from(i), start + Duration::minutes(i64::from(i) * 7)))
            .collect();
        let latest = members.iter().map(|m| m.timestamp).max().expect("non-empty");
        let earliest = members.iter().map(|m| m.timestamp).min().expect("non-empty");

        let outcome = compress(members, &MemoryConfig::default());
        assert_eq!(outcome.groups.len(), 1);
        assert_eq!(outcome.groups[0].strategy, Strategy::Summarize);
        assert_eq!(outcome.significant.len(), 1);

        let summary = &outcome.significant[0];
        assert_eq!(summary.timestamp, latest);
        assert_eq!(summary.participant_set().len(), 2);
        assert_eq!(summary.related_memories.len(), 10);
        assert!((summary.importance - 79.0).abs() < f64::EPSILON);
        assert!((summary.emotional_impact + 0.6).abs() < 1e-9);
        match summary.origin {
            MemoryOrigin::Summarized { first, last, count } => {
                assert_eq!(first, earliest);
                assert_eq!(last, latest);
                assert_eq!(count, 10);
            }
            other => panic!("unexpected origin {other:?}"),
        }
        match &summary.details {
            EventDetails::Conflict { damage, .. } => assert!((damage - 50.0).abs() < 1e-9),
            other => panic!("unexpected details {other:?}"),
        }
    }

    #[test]
    fn aggregate_keeps_strongest_representative() {
        let (a, b) = (NpcId::new(), NpcId::new());
        let now = Utc::now();
        let mut members: Vec<_> = (0..6).map(|i| conflict(&[a, b], 60.0, now + Duration::seconds(i))).collect();
        members[3].importance = 88.0;
        let strongest = members[3].id;

        let outcome = compress(members, &MemoryConfig::default());
        assert_eq!(outcome.groups[0].strategy, Strategy::Aggregate);
        let kept = &outcome.significant[0];
        assert_eq!(kept.id, strongest);
        assert_eq!(kept.related_memories.len(), 5);
        assert_eq!(kept.origin, MemoryOrigin::Aggregated { count: 6 });
    }

    #[test]
    fn participant_order_does_not_split_groups() {
        let (a, b) = (NpcId::new(), NpcId::new());
        let now = Utc::now();
        let members = vec![conflict(&[a, b], 70.0, now), conflict(&[b, a], 70.0, now)];
        assert_eq!(group(members).len(), 1);
    }

    #[test]
    fn small_groups_are_pruned_and_filtered() {
        let (a, b) = (NpcId::new(), NpcId::new());
        let now = Utc::now();
        let members = vec![
            conflict(&[a, b], 75.0, now),
            event(EventDetails::Observation { subject: "x".repeat(100) }, &[a], 30.0, now),
        ];
        let outcome = compress(members, &MemoryConfig::default());
        assert_eq!(outcome.groups.len(), 2);
        assert!(outcome.groups.iter().all(|g| g.strategy == Strategy::Prune));
        assert_eq!(outcome.significant.len(), 1);
        assert_eq!(outcome.forgotten.len(), 1);
        assert!(outcome.significant[0].notes.is_none());
        assert_eq!(outcome.significant[0].origin, MemoryOrigin::Pruned);
        match &outcome.forgotten[0].details {
            EventDetails::Observation { subject } => assert_eq!(subject.len(), 48),
            other => panic!("unexpected details {other:?}"),
        }
    }

    #[test]
    fn low_importance_summary_is_forgotten() {
        let (a, b) = (NpcId::new(), NpcId::new());
        let now = Utc::now();
        let members: Vec<_> = (0..10).map(|_| conflict(&[a, b], 40.0, now)).collect();
        let outcome = compress(members, &MemoryConfig::default());
        assert!(outcome.significant.is_empty());
        assert_eq!(outcome.forgotten.len(), 1);
    }
}
