//! Relationship tracking derived from significant shared memories.
//!
//! Records are directional. When an NPC promotes a shared memory it updates
//! its own records toward every other participant, and the store mirrors
//! the same change into each participant's record toward the owner. Each
//! record remembers which events it has already counted, so the peer's own
//! copy of the event never moves trust a second time.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::event::MemoryEvent;
use crate::types::{MemoryId, NpcId, Timestamp};

/// Lower trust bound.
pub const MIN_TRUST: f64 = -10.0;
/// Upper trust bound.
pub const MAX_TRUST: f64 = 10.0;

/// How one NPC regards another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    /// Trust in `[-10, 10]`.
    pub trust: f64,
    /// Time of the latest shared significant memory.
    pub last_interaction: Timestamp,
    /// Significant memories shared with the peer, oldest first.
    pub shared_memories: Vec<MemoryId>,
    /// Event ids already counted, including the constituents of summaries.
    #[serde(default)]
    pub accounted: HashSet<MemoryId>,
}

impl RelationshipRecord {
    /// A neutral record.
    #[must_use]
    pub fn new(at: Timestamp) -> Self {
        Self {
            trust: 0.0,
            last_interaction: at,
            shared_memories: Vec::new(),
            accounted: HashSet::new(),
        }
    }

    /// Builder: set the starting trust (clamped).
    #[must_use]
    pub fn with_trust(mut self, trust: f64) -> Self {
        self.trust = clamp_trust(trust);
        self
    }

    /// Apply a trust change from a shared memory. Returns the new trust.
    pub fn apply(&mut self, change: f64, memory: MemoryId, at: Timestamp) -> f64 {
        self.trust = clamp_trust(self.trust + change);
        self.accounted.insert(memory);
        if !self.shared_memories.contains(&memory) {
            self.shared_memories.push(memory);
        }
        if at > self.last_interaction {
            self.last_interaction = at;
        }
        self.trust
    }

    /// Whether `memory`, or any event it was compressed from, already
    /// moved this record.
    #[must_use]
    pub fn has_counted(&self, memory: &MemoryEvent) -> bool {
        self.accounted.contains(&memory.id) || memory.related_memories.iter().any(|id| self.accounted.contains(id))
    }

    /// Apply `memory` once. Returns `(old, new)` trust, or `None` when the
    /// event was already counted.
    pub fn apply_memory(&mut self, memory: &MemoryEvent, weight: f64) -> Option<(f64, f64)> {
        if self.has_counted(memory) {
            return None;
        }
        let old = self.trust;
        let new = self.apply(memory.emotional_impact * weight, memory.id, memory.timestamp);
        self.accounted.extend(memory.related_memories.iter().copied());
        Some((old, new))
    }
}

/// Clamp into `[MIN_TRUST, MAX_TRUST]`; NaN becomes neutral.
#[must_use]
pub fn clamp_trust(trust: f64) -> f64 {
    if trust.is_nan() { 0.0 } else { trust.clamp(MIN_TRUST, MAX_TRUST) }
}

/// Trust movement toward one peer over a processing batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipUpdate {
    /// Trust before the batch.
    pub old_trust: f64,
    /// Trust after the batch.
    pub new_trust: f64,
    /// The last memory that moved it.
    pub reason: String,
}

fn describe(memory: &MemoryEvent) -> String {
    format!(
        "{} memory {} (impact {:+.2})",
        memory.event_type(),
        memory.id,
        memory.emotional_impact
    )
}

/// Update `owner`'s records from the significant memories of one batch.
///
/// `trust_change = emotional_impact * weight`, clamped after each step.
/// Memories a record has already counted are skipped. Returns peer →
/// update for every peer whose trust moved.
pub fn update_relationships(
    owner: NpcId,
    relationships: &mut HashMap<NpcId, RelationshipRecord>,
    significant: &[MemoryEvent],
    weight: f64,
) -> BTreeMap<NpcId, RelationshipUpdate> {
    let mut updates: BTreeMap<NpcId, RelationshipUpdate> = BTreeMap::new();

    for memory in significant {
        let reason = describe(memory);
        for peer in memory.participant_set() {
            if peer == owner {
                continue;
            }
            let record = relationships
                .entry(peer)
                .or_insert_with(|| RelationshipRecord::new(memory.timestamp));
            let Some((old, new)) = record.apply_memory(memory, weight) else {
                continue;
            };
            updates
                .entry(peer)
                .and_modify(|u| {
                    u.new_trust = new;
                    u.reason.clone_from(&reason);
                })
                .or_insert_with(|| RelationshipUpdate {
                    old_trust: old,
                    new_trust: new,
                    reason: reason.clone(),
                });
        }
    }

    updates
}

/// Mirror a memory `promoter` promoted into the record held toward it.
///
/// Called on every other participant of the memory, so both sides of a
/// shared event move even when only one side found it significant.
pub fn mirror_update(
    promoter: NpcId,
    relationships: &mut HashMap<NpcId, RelationshipRecord>,
    memory: &MemoryEvent,
    weight: f64,
) -> Option<RelationshipUpdate> {
    let record = relationships
        .entry(promoter)
        .or_insert_with(|| RelationshipRecord::new(memory.timestamp));
    let (old_trust, new_trust) = record.apply_memory(memory, weight)?;
    Some(RelationshipUpdate {
        old_trust,
        new_trust,
        reason: describe(memory),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventDetails, MemoryOrigin};
    use chrono::Utc;

    fn shared(owner: NpcId, peer: NpcId, impact: f64) -> MemoryEvent {
        MemoryEvent {
            id: MemoryId::new(),
            timestamp: Utc::now(),
            details: EventDetails::RelationshipChange { description: "shared a meal".into() },
            importance: 70.0,
            current_importance: 70.0,
            participants: vec![owner, peer],
            location: None,
            emotional_impact: impact,
            tags: Vec::new(),
            related_memories: Vec::new(),
            notes: None,
            origin: MemoryOrigin::Observed,
        }
    }

    #[test]
    fn trust_moves_by_impact_times_weight() {
        let (a, b) = (NpcId::new(), NpcId::new());
        let mut rels = HashMap::new();
        let updates = update_relationships(a, &mut rels, &[shared(a, b, 0.5)], 0.2);
        assert!((rels[&b].trust - 0.1).abs() < 1e-12);
        assert!(updates[&b].old_trust.abs() < f64::EPSILON);
        assert!((updates[&b].new_trust - 0.1).abs() < 1e-12);
        assert!(!rels.contains_key(&a), "no self-relationship");
    }

    #[test]
    fn in_range_update_is_not_clamped() {
        let (a, b) = (NpcId::new(), NpcId::new());
        let mut rels = HashMap::new();
        rels.insert(b, RelationshipRecord::new(Utc::now()).with_trust(9.5));
        update_relationships(a, &mut rels, &[shared(a, b, 1.0)], 0.2);
        assert!((rels[&b].trust - 9.7).abs() < 1e-9);
    }

    #[test]
    fn overshoot_clamps_to_ten() {
        let (a, b) = (NpcId::new(), NpcId::new());
        let mut rels = HashMap::new();
        rels.insert(b, RelationshipRecord::new(Utc::now()).with_trust(9.9));
        let updates = update_relationships(a, &mut rels, &[shared(a, b, 1.0)], 0.5);
        assert!((rels[&b].trust - MAX_TRUST).abs() < f64::EPSILON);
        assert!((updates[&b].new_trust - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn shared_memory_is_recorded_once() {
        let (a, b) = (NpcId::new(), NpcId::new());
        let mut rels = HashMap::new();
        let memory = shared(a, b, -0.5);
        update_relationships(a, &mut rels, std::slice::from_ref(&memory), 0.2);
        let again = update_relationships(a, &mut rels, std::slice::from_ref(&memory), 0.2);
        assert_eq!(rels[&b].shared_memories, vec![memory.id]);
        assert!(again.is_empty());
        assert!((rels[&b].trust + 0.1).abs() < 1e-12, "trust moved once");
    }

    #[test]
    fn mirrored_event_is_not_counted_again_by_the_peer() {
        let (a, b) = (NpcId::new(), NpcId::new());
        let memory = shared(a, b, 1.0);
        let mut b_rels = HashMap::new();

        let mirrored = mirror_update(a, &mut b_rels, &memory, 0.2).expect("first mirror moves trust");
        assert!((mirrored.new_trust - 0.2).abs() < 1e-12);
        assert_eq!(b_rels[&a].shared_memories, vec![memory.id]);

        // B later promotes its own copy of the same event.
        let own = update_relationships(b, &mut b_rels, std::slice::from_ref(&memory), 0.2);
        assert!(own.is_empty());
        assert!((b_rels[&a].trust - 0.2).abs() < 1e-12);
        assert!(mirror_update(a, &mut b_rels, &memory, 0.2).is_none());
    }

    #[test]
    fn summary_of_counted_events_is_skipped() {
        let (a, b) = (NpcId::new(), NpcId::new());
        let original = shared(a, b, 1.0);
        let mut rels = HashMap::new();
        update_relationships(a, &mut rels, std::slice::from_ref(&original), 0.5);

        let mut summary = shared(a, b, 1.0);
        summary.related_memories = vec![original.id];
        assert!(rels[&b].has_counted(&summary));
        assert!(update_relationships(a, &mut rels, &[summary], 0.5).is_empty());
        assert!((rels[&b].trust - 0.5).abs() < 1e-12);
    }

    #[test]
    fn batch_reports_first_old_and_last_new() {
        let (a, b) = (NpcId::new(), NpcId::new());
        let mut rels = HashMap::new();
        let updates = update_relationships(
            a,
            &mut rels,
            &[shared(a, b, 1.0), shared(a, b, 1.0), shared(a, b, -0.5)],
            1.0,
        );
        assert!(updates[&b].old_trust.abs() < f64::EPSILON);
        assert!((updates[&b].new_trust - 1.5).abs() < 1e-12);
    }
}
