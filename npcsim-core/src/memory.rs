//! The per-NPC memory container.
//!
//! [`NpcMemory`] holds one NPC's short-term queue, long-term store,
//! relationship records and statistics. It is plain data plus the pure
//! processing step; locking, indexing and persistence live in
//! [`crate::store::MemoryStore`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};

use crate::compression::{GroupReport, compress};
use crate::config::MemoryConfig;
use crate::decay::apply_decay;
use crate::event::{MemoryCandidate, MemoryEvent, MemoryOrigin};
use crate::importance::{ImportanceInputs, average_trust, score};
use crate::notify::ForgetReason;
use crate::relationship::{RelationshipRecord, RelationshipUpdate, update_relationships};
use crate::types::{MemoryId, NpcId, Timestamp, hours_between};

/// Running counters for one NPC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Events ever recorded.
    pub total_count: u64,
    /// Events ever promoted to long-term memory.
    pub significant_count: u64,
    /// Events ever forgotten, for any reason.
    pub forgotten_count: u64,
    /// When processing last changed anything.
    pub last_processed: Option<Timestamp>,
}

/// One NPC's memories and relationships.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcMemory {
    /// Owner.
    pub npc_id: NpcId,
    /// Unprocessed events in arrival order.
    pub short_term: Vec<MemoryEvent>,
    /// Promoted events.
    pub long_term: Vec<MemoryEvent>,
    /// Peer → directional relationship record.
    pub relationships: HashMap<NpcId, RelationshipRecord>,
    /// Counters.
    pub stats: MemoryStats,
}

/// Everything one processing pass changed.
#[derive(Debug, Clone, Default)]
pub struct ProcessReport {
    /// Short-term events consumed.
    pub drained: Vec<MemoryId>,
    /// Events added to long-term memory.
    pub promoted: Vec<MemoryEvent>,
    /// Events dropped, with the reason.
    pub forgotten: Vec<(MemoryEvent, ForgetReason)>,
    /// Long-term events kept with a new decayed importance.
    pub decayed: Vec<(MemoryId, f64)>,
    /// Relationship changes keyed by peer.
    pub relationship_updates: BTreeMap<NpcId, RelationshipUpdate>,
    /// Compression decisions per group.
    pub groups: Vec<GroupReport>,
    /// Malformed short-term events that were set aside, with the error.
    pub quarantined: Vec<(MemoryEvent, String)>,
}

impl ProcessReport {
    /// Whether the pass changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.drained.is_empty() && self.forgotten.is_empty() && self.decayed.is_empty()
    }
}

impl NpcMemory {
    /// An empty container for `npc_id`.
    #[must_use]
    pub fn new(npc_id: NpcId) -> Self {
        Self {
            npc_id,
            short_term: Vec::new(),
            long_term: Vec::new(),
            relationships: HashMap::new(),
            stats: MemoryStats::default(),
        }
    }

    /// Short plus long-term count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.short_term.len() + self.long_term.len()
    }

    /// Whether the NPC holds no memories.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.short_term.is_empty() && self.long_term.is_empty()
    }

    /// Look up a memory in either store.
    #[must_use]
    pub fn get(&self, id: MemoryId) -> Option<&MemoryEvent> {
        self.short_term.iter().chain(&self.long_term).find(|m| m.id == id)
    }

    /// All memories, short-term first.
    pub fn iter(&self) -> impl Iterator<Item = &MemoryEvent> {
        self.short_term.iter().chain(&self.long_term)
    }

    /// Trust toward `peer`, 0 without a record.
    #[must_use]
    pub fn trust_toward(&self, peer: NpcId) -> f64 {
        self.relationships.get(&peer).map_or(0.0, |r| r.trust)
    }

    /// Score `candidate` from this NPC's point of view.
    #[must_use]
    pub fn score_candidate(&self, candidate: &MemoryCandidate, at: Timestamp, now: Timestamp, config: &MemoryConfig) -> f64 {
        let inputs = ImportanceInputs {
            event_type: candidate.details.event_type(),
            emotional_impact: candidate.emotional_impact,
            participant_count: candidate.participants.len(),
            average_trust: average_trust(self.npc_id, &candidate.participants, &self.relationships),
            age_hours: hours_between(at, now),
        };
        score(&inputs, &config.importance)
    }

    /// Append a scored event to short-term memory. Returns `true` once the
    /// short-term length has reached `capacity`.
    pub fn record(&mut self, event: MemoryEvent, capacity: usize) -> bool {
        self.short_term.push(event);
        self.stats.total_count += 1;
        self.short_term.len() >= capacity
    }

    /// Compress short-term memory into long-term memory.
    ///
    /// Malformed events are set aside without affecting the rest. Existing
    /// long-term memories are decayed first; newly promoted ones start at
    /// full importance. The long-term store is trimmed to
    /// `max_long_term_per_npc` by dropping the least important; a newly
    /// significant event that does not survive the trim is reported only as
    /// forgotten. Surviving promotions then update relationships. With an
    /// empty short-term queue this is a no-op.
    ///
    /// The short-term queue is taken up front, so a panic part-way through
    /// loses it. Callers that catch panics go through
    /// [`NpcMemory::rollback_on_panic`].
    pub fn process(&mut self, now: Timestamp, config: &MemoryConfig) -> ProcessReport {
        let mut report = ProcessReport::default();
        if self.short_term.is_empty() {
            return report;
        }

        let drained = std::mem::take(&mut self.short_term);
        report.drained = drained.iter().map(|m| m.id).collect();
        let mut valid = Vec::with_capacity(drained.len());
        for event in drained {
            match event.validate() {
                Ok(()) => valid.push(event),
                Err(e) => report.quarantined.push((event, e.to_string())),
            }
        }

        self.decay_into(now, config, &mut report);

        let outcome = compress(valid, config);
        report.groups = outcome.groups;
        report.forgotten.extend(
            outcome
                .forgotten
                .into_iter()
                .map(|m| (m, ForgetReason::BelowImportanceThreshold)),
        );

        let promoted: Vec<MemoryEvent> = outcome
            .significant
            .into_iter()
            .map(|m| MemoryEvent {
                current_importance: m.importance,
                ..m
            })
            .collect();
        self.long_term.extend(promoted.iter().cloned());
        report.promoted = promoted;
        self.spill_over_cap(config.max_long_term_per_npc, &mut report);

        report.relationship_updates =
            update_relationships(self.npc_id, &mut self.relationships, &report.promoted, config.trust_weight);
        self.stats.significant_count += report.promoted.len() as u64;
        self.stats.forgotten_count += report.forgotten.len() as u64;
        self.stats.last_processed = Some(now);
        report
    }

    /// Decay long-term memory without touching short-term memory.
    pub fn decay(&mut self, now: Timestamp, config: &MemoryConfig) -> ProcessReport {
        let mut report = ProcessReport::default();
        self.decay_into(now, config, &mut report);
        self.stats.forgotten_count += report.forgotten.len() as u64;
        if !report.is_noop() {
            self.stats.last_processed = Some(now);
        }
        report
    }

    fn decay_into(&mut self, now: Timestamp, config: &MemoryConfig, report: &mut ProcessReport) {
        if self.long_term.is_empty() {
            return;
        }
        let outcome = apply_decay(&self.long_term, now, config);
        let previous: HashMap<MemoryId, f64> =
            self.long_term.iter().map(|m| (m.id, m.current_importance)).collect();
        report.decayed.extend(
            outcome
                .retained
                .iter()
                .filter(|m| previous.get(&m.id).is_none_or(|p| (p - m.current_importance).abs() > f64::EPSILON))
                .map(|m| (m.id, m.current_importance)),
        );
        report
            .forgotten
            .extend(outcome.forgotten.into_iter().map(|m| (m, ForgetReason::Decayed)));
        self.long_term = outcome.retained;
    }

    fn spill_over_cap(&mut self, cap: usize, report: &mut ProcessReport) {
        if self.long_term.len() <= cap {
            return;
        }
        self.long_term.sort_by(|a, b| {
            b.current_importance
                .total_cmp(&a.current_importance)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        let spilled = self.long_term.split_off(cap);
        let gone: HashSet<MemoryId> = spilled.iter().map(|m| m.id).collect();
        report.promoted.retain(|m| !gone.contains(&m.id));
        report
            .forgotten
            .extend(spilled.into_iter().map(|m| (m, ForgetReason::CapacitySpill)));
    }

    /// Run `f`, restoring this container to its prior state if `f` panics.
    ///
    /// `parking_lot` mutexes are not poisoned, so without this a panic
    /// mid-processing would leave a half-drained NPC behind the lock.
    ///
    /// # Errors
    ///
    /// Returns the panic payload after the state has been restored.
    pub fn rollback_on_panic<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> std::thread::Result<R> {
        let before = self.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(self)));
        if outcome.is_err() {
            *self = before;
        }
        outcome
    }

    /// Summaries and aggregates currently in long-term memory.
    #[must_use]
    pub fn compressed_count(&self) -> usize {
        self.long_term
            .iter()
            .filter(|m| !matches!(m.origin, MemoryOrigin::Observed))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventDetails;
    use chrono::{Duration, TimeZone, Utc};

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().expect("valid")
    }

    fn event(owner: NpcId, peer: NpcId, details: EventDetails, importance: f64, impact: f64, at: Timestamp) -> MemoryEvent {
        MemoryEvent {
            id: MemoryId::new(),
            timestamp: at,
            details,
            importance,
            current_importance: importance,
            participants: vec![owner, peer],
            location: None,
            emotional_impact: impact,
            tags: Vec::new(),
            related_memories: Vec::new(),
            notes: None,
            origin: MemoryOrigin::Observed,
        }
    }

    fn conflict() -> EventDetails {
        EventDetails::Conflict {
            damage: 5.0,
            outcome: "draw".into(),
        }
    }

    #[test]
    fn record_signals_capacity() {
        let owner = NpcId::new();
        let mut mem = NpcMemory::new(owner);
        assert!(!mem.record(event(owner, NpcId::new(), conflict(), 80.0, 0.0, t0()), 2));
        assert!(mem.record(event(owner, NpcId::new(), conflict(), 80.0, 0.0, t0()), 2));
        assert_eq!(mem.stats.total_count, 2);
    }

    #[test]
    fn processing_empty_short_term_is_noop() {
        let owner = NpcId::new();
        let mut mem = NpcMemory::new(owner);
        mem.long_term.push(event(owner, NpcId::new(), conflict(), 80.0, 0.0, t0()));
        let before = mem.clone();
        let report = mem.process(t0() + Duration::hours(100), &MemoryConfig::default());
        assert!(report.is_noop());
        assert_eq!(mem, before);
    }

    #[test]
    fn ten_conflicts_become_one_summary() {
        let owner = NpcId::new();
        let peer = NpcId::new();
        let mut mem = NpcMemory::new(owner);
        for i in 0..10 {
            mem.record(event(owner, peer, conflict(), 75.0, -0.5, t0() + Duration::minutes(i)), 20);
        }
        let report = mem.process(t0() + Duration::hours(1), &MemoryConfig::default());
        assert_eq!(report.drained.len(), 10);
        assert_eq!(report.promoted.len(), 1);
        assert_eq!(mem.long_term.len(), 1);
        assert!(mem.short_term.is_empty());
        let summary = &mem.long_term[0];
        assert_eq!(summary.timestamp, t0() + Duration::minutes(9));
        assert_eq!(summary.participant_set().len(), 2);
        assert_eq!(mem.compressed_count(), 1);

        // Impact -0.5 * 0.2 from the single summary.
        assert!((mem.trust_toward(peer) + 0.1).abs() < 1e-9);
        assert!(!mem.relationships.contains_key(&owner));
    }

    #[test]
    fn low_importance_events_are_forgotten() {
        let owner = NpcId::new();
        let mut mem = NpcMemory::new(owner);
        let seen = EventDetails::Observation { subject: "bird".into() };
        mem.record(event(owner, NpcId::new(), seen, 30.0, 0.0, t0()), 20);
        let report = mem.process(t0(), &MemoryConfig::default());
        assert!(report.promoted.is_empty());
        assert_eq!(report.forgotten.len(), 1);
        assert_eq!(report.forgotten[0].1, ForgetReason::BelowImportanceThreshold);
        assert_eq!(mem.stats.forgotten_count, 1);
        assert!(mem.relationships.is_empty());
    }

    #[test]
    fn malformed_events_are_quarantined_alone() {
        let owner = NpcId::new();
        let mut mem = NpcMemory::new(owner);
        let broken = EventDetails::Trade {
            item: "salt".into(),
            quantity: 1,
            price: f64::NAN,
        };
        mem.record(event(owner, NpcId::new(), broken, 70.0, 0.0, t0()), 20);
        mem.record(event(owner, NpcId::new(), conflict(), 70.0, 0.0, t0()), 20);
        let report = mem.process(t0(), &MemoryConfig::default());
        assert_eq!(report.quarantined.len(), 1);
        assert_eq!(report.promoted.len(), 1);
    }

    #[test]
    fn old_long_term_memories_decay_away_on_processing() {
        let owner = NpcId::new();
        let mut mem = NpcMemory::new(owner);
        mem.long_term.push(event(owner, NpcId::new(), conflict(), 61.0, 0.0, t0()));
        mem.record(event(owner, NpcId::new(), conflict(), 90.0, 0.0, t0() + Duration::hours(600)), 20);

        let report = mem.process(t0() + Duration::hours(600), &MemoryConfig::default());
        // 61 * exp(-2 * 600 / 720) ≈ 11.5, below the forget threshold.
        assert!(report.forgotten.iter().any(|(_, r)| *r == ForgetReason::Decayed));
        assert_eq!(mem.long_term.len(), 1);
        assert!((mem.long_term[0].importance - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn long_term_cap_spills_least_important() {
        let owner = NpcId::new();
        let config = MemoryConfig {
            max_long_term_per_npc: 2,
            ..MemoryConfig::default()
        };
        let mut mem = NpcMemory::new(owner);
        for (i, importance) in [70.0, 95.0, 80.0].into_iter().enumerate() {
            let details = EventDetails::Achievement { title: format!("feat {i}") };
            mem.record(event(owner, NpcId::new(), details, importance, 0.0, t0()), 20);
        }
        let report = mem.process(t0(), &config);
        assert_eq!(mem.long_term.len(), 2);
        let spilled: Vec<_> = report
            .forgotten
            .iter()
            .filter(|(_, r)| *r == ForgetReason::CapacitySpill)
            .collect();
        assert_eq!(spilled.len(), 1);
        assert!((spilled[0].0.importance - 70.0).abs() < f64::EPSILON);
        assert_eq!(report.promoted.len(), 2);
        assert!(report.promoted.iter().all(|m| m.id != spilled[0].0.id));
        assert_eq!(mem.stats.significant_count, 2);
    }

    #[test]
    fn spilled_promotion_does_not_move_trust() {
        let owner = NpcId::new();
        let (strong, weak) = (NpcId::new(), NpcId::new());
        let config = MemoryConfig {
            max_long_term_per_npc: 1,
            ..MemoryConfig::default()
        };
        let mut mem = NpcMemory::new(owner);
        mem.record(event(owner, strong, conflict(), 95.0, -1.0, t0()), 20);
        mem.record(event(owner, weak, conflict(), 65.0, -1.0, t0()), 20);
        let report = mem.process(t0(), &config);
        assert_eq!(report.promoted.len(), 1);
        assert!(report.relationship_updates.contains_key(&strong));
        assert!(!mem.relationships.contains_key(&weak));
    }

    #[test]
    fn panic_mid_processing_restores_short_term() {
        let owner = NpcId::new();
        let mut mem = NpcMemory::new(owner);
        mem.record(event(owner, NpcId::new(), conflict(), 80.0, 0.0, t0()), 20);
        mem.record(event(owner, NpcId::new(), conflict(), 80.0, 0.0, t0()), 20);
        let before = mem.clone();

        let outcome = mem.rollback_on_panic(|m| {
            let drained = std::mem::take(&mut m.short_term);
            assert!(drained.is_empty(), "drained {} events", drained.len());
        });
        assert!(outcome.is_err());
        assert_eq!(mem, before);
        assert_eq!(mem.short_term.len(), 2);

        let report = mem.rollback_on_panic(|m| m.process(t0(), &MemoryConfig::default())).expect("no panic");
        assert_eq!(report.promoted.len(), 2);
        assert!(mem.short_term.is_empty());
    }

    #[test]
    fn score_uses_owner_trust() {
        let owner = NpcId::new();
        let friend = NpcId::new();
        let mut mem = NpcMemory::new(owner);
        let candidate = MemoryCandidate::new(
            EventDetails::Trade {
                item: "bread".into(),
                quantity: 1,
                price: 2.0,
            },
            [owner, friend],
        )
        .with_emotional_impact(0.5);
        let neutral = mem.score_candidate(&candidate, t0(), t0(), &MemoryConfig::default());
        assert!((neutral - 72.0).abs() < 1e-9);

        mem.relationships
            .insert(friend, RelationshipRecord::new(t0()).with_trust(6.0));
        let trusted = mem.score_candidate(&candidate, t0(), t0(), &MemoryConfig::default());
        assert!((trusted - 78.0).abs() < 1e-9);
    }
}
