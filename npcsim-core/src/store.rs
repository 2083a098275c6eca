//! The memory store: every resident NPC's memory behind its own lock.
//!
//! # Locking
//!
//! Each NPC's [`NpcMemory`] sits in an `Arc<Mutex<_>>` inside a `DashMap`.
//! Map guards are never held while an NPC mutex is taken. When both an NPC
//! mutex and the index lock are needed, the NPC mutex is taken first. Index
//! reads during a query happen before the NPC mutex is taken, so a query may
//! see ids a concurrent pass just removed; those are skipped.
//!
//! # Dirty tracking
//!
//! Every mutation marks the NPC dirty. A save clears the mark before taking
//! its snapshot and restores it on failure, so a failed save is never
//! mistaken for a durable one and a mutation racing a save is never lost.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::compression::GroupReport;
use crate::config::{MemoryConfig, into_result};
use crate::error::Result;
use crate::event::{EventType, MemoryCandidate, MemoryEvent, MemoryOrigin};
use crate::index::{MatchMode, MemoryIndex};
use crate::memory::{MemoryStats, NpcMemory, ProcessReport};
use crate::metrics::SimCounters;
use crate::notify::{ForgetReason, Notification, NotificationBus};
use crate::persistence::MemoryPersistence;
use crate::queue::{Enqueued, ProcessingQueue};
use crate::relationship::{RelationshipRecord, RelationshipUpdate, mirror_update};
use crate::types::{MemoryId, MemoryRef, NpcId, Timestamp};

type Slot = Arc<Mutex<NpcMemory>>;

// ---------------------------------------------------------------------------
// Queries & outcomes
// ---------------------------------------------------------------------------

/// Filters for [`MemoryStore::query_memories`]. All present filters must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryQuery {
    /// Only this event type.
    pub event_type: Option<EventType>,
    /// Participants to match.
    pub participants: Vec<NpcId>,
    /// How `participants` combine.
    pub participant_mode: MatchMode,
    /// Tags to match.
    pub tags: Vec<String>,
    /// How `tags` combine.
    pub tag_mode: MatchMode,
    /// Minimum current importance.
    pub min_importance: Option<f64>,
    /// Maximum results; the configured default when `None`.
    pub limit: Option<usize>,
}

impl MemoryQuery {
    /// Restrict to one event type.
    #[must_use]
    pub fn of_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    /// Restrict by participants.
    #[must_use]
    pub fn with_participants(mut self, participants: &[NpcId], mode: MatchMode) -> Self {
        self.participants = participants.to_vec();
        self.participant_mode = mode;
        self
    }

    /// Restrict by tags.
    #[must_use]
    pub fn with_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>, mode: MatchMode) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self.tag_mode = mode;
        self
    }

    /// Require at least this importance.
    #[must_use]
    pub const fn min_importance(mut self, importance: f64) -> Self {
        self.min_importance = Some(importance);
        self
    }

    /// Cap the result count.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn has_filter(&self) -> bool {
        self.event_type.is_some() || !self.participants.is_empty() || !self.tags.is_empty()
    }
}

/// Result of recording one gameplay event.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordReceipt {
    /// Id shared by every participant's copy.
    pub memory: MemoryId,
    /// Importance as scored for each participant.
    pub scores: Vec<(NpcId, f64)>,
    /// Participants that reached short-term capacity and were queued.
    pub queued: Vec<NpcId>,
}

/// Result of processing one NPC.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The NPC has no memory in this store.
    NotResident,
    /// Nothing to do; no state changed.
    NoOp,
    /// Short-term memory was compressed.
    Processed(ProcessSummary),
}

/// What one processing pass did, by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessSummary {
    /// Memories added to long-term storage.
    pub promoted: Vec<MemoryId>,
    /// Memories dropped.
    pub forgotten: Vec<(MemoryId, ForgetReason)>,
    /// Relationship changes keyed by peer.
    pub relationship_updates: BTreeMap<NpcId, RelationshipUpdate>,
    /// Compression decisions.
    pub groups: Vec<GroupReport>,
    /// Malformed events set aside, with the error.
    pub quarantined: Vec<(MemoryId, String)>,
}

/// Result of a dirty flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// NPCs durably saved.
    pub saved: usize,
    /// NPCs whose save failed; they stay dirty.
    pub failed: Vec<(NpcId, String)>,
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Owner of every resident NPC's memory.
pub struct MemoryStore {
    memories: DashMap<NpcId, Slot>,
    index: MemoryIndex,
    queue: ProcessingQueue,
    dirty: Mutex<BTreeSet<NpcId>>,
    persistence: Arc<dyn MemoryPersistence>,
    config: RwLock<Arc<MemoryConfig>>,
    bus: NotificationBus,
    counters: Arc<SimCounters>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("resident", &self.memories.len())
            .field("indexed", &self.index.len())
            .field("queued", &self.queue.len())
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Build a store.
    ///
    /// # Errors
    /// Returns `SimError::InvalidConfig` if `config` fails validation.
    pub fn new(
        config: MemoryConfig,
        persistence: Arc<dyn MemoryPersistence>,
        queue: ProcessingQueue,
        bus: NotificationBus,
        counters: Arc<SimCounters>,
    ) -> Result<Self> {
        into_result(config.validate())?;
        Ok(Self {
            memories: DashMap::new(),
            index: MemoryIndex::new(),
            queue,
            dirty: Mutex::new(BTreeSet::new()),
            persistence,
            config: RwLock::new(Arc::new(config)),
            bus,
            counters,
        })
    }

    /// Current memory configuration.
    #[must_use]
    pub fn config(&self) -> Arc<MemoryConfig> {
        Arc::clone(&self.config.read())
    }

    /// Swap in a new configuration; takes effect on the next operation.
    ///
    /// # Errors
    /// Returns `SimError::InvalidConfig` and keeps the old configuration.
    pub fn reload_config(&self, config: MemoryConfig) -> Result<()> {
        into_result(config.validate())?;
        *self.config.write() = Arc::new(config);
        Ok(())
    }

    /// The processing queue.
    #[must_use]
    pub const fn queue(&self) -> &ProcessingQueue {
        &self.queue
    }

    /// The index.
    #[must_use]
    pub const fn index(&self) -> &MemoryIndex {
        &self.index
    }

    fn slot(&self, npc: NpcId) -> Option<Slot> {
        self.memories.get(&npc).map(|s| Arc::clone(s.value()))
    }

    fn mark_dirty(&self, npc: NpcId) {
        self.dirty.lock().insert(npc);
    }

    fn install(&self, npc: NpcId, memory: NpcMemory) -> Slot {
        let mut installed = false;
        let slot = Arc::clone(
            self.memories
                .entry(npc)
                .or_insert_with(|| {
                    installed = true;
                    Arc::new(Mutex::new(memory))
                })
                .value(),
        );
        if installed {
            let memory = slot.lock();
            for event in memory.iter() {
                self.index.add(npc, event);
            }
        }
        slot
    }

    /// The single creation path for NPC memory: resident copy, else the
    /// persisted copy, else a fresh empty container.
    ///
    /// # Errors
    /// Propagates persistence load failures; nothing is created then.
    pub fn get_or_create(&self, npc: NpcId) -> Result<Arc<Mutex<NpcMemory>>> {
        if let Some(slot) = self.slot(npc) {
            return Ok(slot);
        }
        let loaded = self.persistence.load_npc_memory(npc)?;
        let fresh = loaded.is_none();
        let slot = self.install(npc, loaded.unwrap_or_else(|| NpcMemory::new(npc)));
        if fresh {
            debug!(npc = %npc, "Created NPC memory");
        }
        Ok(slot)
    }

    fn resident_or_load(&self, npc: NpcId) -> Result<Option<Slot>> {
        if let Some(slot) = self.slot(npc) {
            return Ok(Some(slot));
        }
        Ok(self
            .persistence
            .load_npc_memory(npc)?
            .map(|memory| self.install(npc, memory)))
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// Record a gameplay event for every participant.
    ///
    /// Each participant gets its own copy under a shared id, scored from its
    /// own relationships. Participants whose short-term memory reaches
    /// capacity are queued for processing; this never waits on processing.
    ///
    /// # Errors
    /// `SimError::InvalidEvent` for a malformed candidate, or a persistence
    /// load failure. No participant is modified in either case.
    pub fn add_memory_event(&self, candidate: MemoryCandidate, now: Timestamp) -> Result<RecordReceipt> {
        let candidate = match candidate.normalized() {
            Ok(c) => c,
            Err(e) => {
                SimCounters::add(&self.counters.events_rejected, 1);
                return Err(e);
            }
        };
        let slots = candidate
            .participants
            .iter()
            .map(|p| self.get_or_create(*p).map(|slot| (*p, slot)))
            .collect::<Result<Vec<_>>>()?;

        let config = self.config();
        let at = candidate.timestamp.unwrap_or(now);
        let id = MemoryId::new();
        let mut receipt = RecordReceipt {
            memory: id,
            scores: Vec::with_capacity(slots.len()),
            queued: Vec::new(),
        };

        for (npc, slot) in slots {
            let mut memory = slot.lock();
            let importance = memory.score_candidate(&candidate, at, now, &config);
            let event = MemoryEvent {
                id,
                timestamp: at,
                details: candidate.details.clone(),
                importance,
                current_importance: importance,
                participants: candidate.participants.clone(),
                location: candidate.location,
                emotional_impact: candidate.emotional_impact,
                tags: candidate.tags.clone(),
                related_memories: Vec::new(),
                notes: candidate.notes.clone(),
                origin: MemoryOrigin::Observed,
            };
            self.index.add(npc, &event);
            let full = memory.record(event, config.short_term_capacity);
            self.mark_dirty(npc);
            drop(memory);

            receipt.scores.push((npc, importance));
            if full {
                match self.queue.enqueue(npc) {
                    Enqueued::Queued => receipt.queued.push(npc),
                    Enqueued::AlreadyQueued => {}
                    Enqueued::Dropped => warn!(npc = %npc, "Processing queue full, NPC not queued"),
                }
            }
        }

        SimCounters::add(&self.counters.events_recorded, 1);
        debug!(
            memory = %id,
            event_type = %candidate.details.event_type(),
            participants = receipt.scores.len(),
            "Recorded memory event"
        );
        Ok(receipt)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Matching memories from short and long-term storage, newest first.
    ///
    /// With any type, participant or tag filter the index resolves the
    /// candidates; otherwise the newest memories above the configured
    /// importance floor are returned. An unknown NPC yields an empty list
    /// and is not created.
    ///
    /// # Errors
    /// Propagates a persistence load failure for a non-resident NPC.
    pub fn query_memories(&self, npc: NpcId, query: &MemoryQuery) -> Result<Vec<MemoryEvent>> {
        let Some(slot) = self.resident_or_load(npc)? else {
            return Ok(Vec::new());
        };
        let config = self.config();
        let limit = query.limit.unwrap_or(config.default_query_limit);

        let ids = if query.has_filter() {
            self.filtered_ids(npc, query)
        } else {
            let floor = query.min_importance.unwrap_or(config.recent_importance_floor);
            self.index.find_recent_memories(npc, limit, floor)
        };

        let min = query.min_importance.unwrap_or(f64::NEG_INFINITY);
        let memory = slot.lock();
        Ok(ids
            .into_iter()
            .filter_map(|id| memory.get(id))
            .filter(|m| m.current_importance >= min)
            .take(limit)
            .cloned()
            .collect())
    }

    fn filtered_ids(&self, npc: NpcId, query: &MemoryQuery) -> Vec<MemoryId> {
        let mut lists: Vec<Vec<MemoryId>> = Vec::new();
        if let Some(event_type) = query.event_type {
            lists.push(self.index.find_memories_by_type(npc, event_type));
        }
        if !query.participants.is_empty() {
            lists.push(
                self.index
                    .find_memories_by_participants(npc, &query.participants, query.participant_mode),
            );
        }
        if !query.tags.is_empty() {
            lists.push(self.index.find_memories_by_tags(npc, &query.tags, query.tag_mode));
        }
        let mut lists = lists.into_iter();
        let Some(first) = lists.next() else {
            return Vec::new();
        };
        let rest: Vec<HashSet<MemoryId>> = lists.map(|l| l.into_iter().collect()).collect();
        first
            .into_iter()
            .filter(|id| rest.iter().all(|set| set.contains(id)))
            .collect()
    }

    // ------------------------------------------------------------------
    // Processing
    // ------------------------------------------------------------------

    /// Compress `npc`'s short-term memory, keeping index, relationships and
    /// notifications in step. Reprocessing an NPC with empty short-term
    /// memory is a no-op.
    ///
    /// Every other participant of a promoted memory gets the mirrored trust
    /// change in its record toward `npc`. If processing panics, the NPC's
    /// memory is restored before the panic resumes, so its short-term events
    /// are retried on a later cycle.
    pub fn process_npc(&self, npc: NpcId, now: Timestamp) -> ProcessOutcome {
        let Some(slot) = self.slot(npc) else {
            return ProcessOutcome::NotResident;
        };
        let config = self.config();
        let mut memory = slot.lock();
        let report = match memory.rollback_on_panic(|m| m.process(now, &config)) {
            Ok(report) => report,
            Err(payload) => {
                drop(memory);
                std::panic::resume_unwind(payload);
            }
        };
        if report.is_noop() {
            return ProcessOutcome::NoOp;
        }
        self.apply_report(npc, &report);
        self.mark_dirty(npc);
        drop(memory);

        SimCounters::add(&self.counters.npcs_processed, 1);
        self.mirror_relationships(npc, &report.promoted, config.trust_weight);
        let summary = self.publish_report(npc, report);
        debug!(
            npc = %npc,
            promoted = summary.promoted.len(),
            forgotten = summary.forgotten.len(),
            relationships = summary.relationship_updates.len(),
            "Processed NPC memory"
        );
        ProcessOutcome::Processed(summary)
    }

    /// Decay `npc`'s long-term memory without processing short-term memory.
    /// Returns how many memories were forgotten.
    pub fn decay_npc(&self, npc: NpcId, now: Timestamp) -> usize {
        let Some(slot) = self.slot(npc) else { return 0 };
        let config = self.config();
        let mut memory = slot.lock();
        let report = memory.decay(now, &config);
        if report.is_noop() {
            return 0;
        }
        self.apply_report(npc, &report);
        self.mark_dirty(npc);
        drop(memory);
        self.publish_report(npc, report).forgotten.len()
    }

    // Caller holds the NPC's mutex. Forgotten ids go last so nothing that
    // left memory can be re-added.
    fn apply_report(&self, npc: NpcId, report: &ProcessReport) {
        for id in &report.drained {
            self.index.remove(MemoryRef { owner: npc, id: *id });
        }
        for event in &report.promoted {
            self.index.add(npc, event);
        }
        for (id, importance) in &report.decayed {
            self.index.update_importance(MemoryRef { owner: npc, id: *id }, *importance);
        }
        for (event, _) in &report.forgotten {
            self.index.remove(MemoryRef { owner: npc, id: event.id });
        }
    }

    // Caller must not hold `owner`'s mutex; each peer is locked on its own.
    fn mirror_relationships(&self, owner: NpcId, promoted: &[MemoryEvent], weight: f64) {
        for event in promoted {
            for peer in event.participant_set() {
                if peer == owner {
                    continue;
                }
                let slot = match self.get_or_create(peer) {
                    Ok(slot) => slot,
                    Err(e) => {
                        warn!(npc = %peer, peer = %owner, error = %e, "Could not mirror relationship update");
                        continue;
                    }
                };
                let mut memory = slot.lock();
                let update = mirror_update(owner, &mut memory.relationships, event, weight);
                drop(memory);
                let Some(update) = update else { continue };
                self.mark_dirty(peer);
                SimCounters::add(&self.counters.relationship_updates, 1);
                self.bus.publish(Notification::RelationshipUpdated {
                    npc: peer,
                    peer: owner,
                    old_trust: update.old_trust,
                    new_trust: update.new_trust,
                    reason: update.reason,
                });
            }
        }
    }

    fn publish_report(&self, npc: NpcId, report: ProcessReport) -> ProcessSummary {
        for event in &report.promoted {
            self.bus.publish(Notification::SignificantMemory {
                npc,
                memory: event.id,
                event_type: event.event_type(),
                importance: event.importance,
            });
        }
        for (event, reason) in &report.forgotten {
            self.bus.publish(Notification::MemoryForgotten {
                npc,
                memory: event.id,
                event_type: event.event_type(),
                importance: event.current_importance,
                reason: *reason,
            });
        }
        for (peer, update) in &report.relationship_updates {
            self.bus.publish(Notification::RelationshipUpdated {
                npc,
                peer: *peer,
                old_trust: update.old_trust,
                new_trust: update.new_trust,
                reason: update.reason.clone(),
            });
        }
        for (event, error) in &report.quarantined {
            warn!(npc = %npc, memory = %event.id, error = %error, "Quarantined malformed memory event");
            self.bus.publish(Notification::ProcessingFailed {
                npc,
                error: format!("memory {}: {error}", event.id),
            });
        }

        SimCounters::add(&self.counters.memories_promoted, report.promoted.len() as u64);
        SimCounters::add(&self.counters.memories_forgotten, report.forgotten.len() as u64);
        SimCounters::add(&self.counters.relationship_updates, report.relationship_updates.len() as u64);
        SimCounters::add(&self.counters.processing_failures, report.quarantined.len() as u64);

        ProcessSummary {
            promoted: report.promoted.iter().map(|m| m.id).collect(),
            forgotten: report.forgotten.iter().map(|(m, r)| (m.id, *r)).collect(),
            relationship_updates: report.relationship_updates,
            groups: report.groups,
            quarantined: report
                .quarantined
                .into_iter()
                .map(|(m, e)| (m.id, e))
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Save `npc` if resident.
    ///
    /// # Errors
    /// Propagates the persistence failure; the NPC stays dirty.
    pub fn save_npc(&self, npc: NpcId) -> Result<()> {
        let Some(slot) = self.slot(npc) else {
            return Ok(());
        };
        let snapshot = {
            let memory = slot.lock();
            self.dirty.lock().remove(&npc);
            memory.clone()
        };
        match self.persistence.save_npc_memory(npc, &snapshot) {
            Ok(()) => {
                SimCounters::add(&self.counters.saves_completed, 1);
                Ok(())
            }
            Err(e) => {
                self.mark_dirty(npc);
                SimCounters::add(&self.counters.save_failures, 1);
                warn!(npc = %npc, error = %e, "Saving NPC memory failed");
                Err(e)
            }
        }
    }

    /// Save every dirty NPC. Failures are collected, not fatal.
    pub fn flush_dirty(&self) -> FlushReport {
        let dirty: Vec<NpcId> = self.dirty.lock().iter().copied().collect();
        let mut report = FlushReport::default();
        for npc in dirty {
            match self.save_npc(npc) {
                Ok(()) => report.saved += 1,
                Err(e) => report.failed.push((npc, e.to_string())),
            }
        }
        if report.saved > 0 || !report.failed.is_empty() {
            info!(saved = report.saved, failed = report.failed.len(), "Flushed dirty NPC memories");
        }
        report
    }

    /// Whether `npc` has unsaved changes.
    #[must_use]
    pub fn is_dirty(&self, npc: NpcId) -> bool {
        self.dirty.lock().contains(&npc)
    }

    /// Number of NPCs with unsaved changes.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Resident NPC ids, sorted.
    #[must_use]
    pub fn npc_ids(&self) -> Vec<NpcId> {
        let mut ids: Vec<NpcId> = self.memories.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Number of resident NPCs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.memories.len()
    }

    /// Whether no NPC is resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    /// Copy of `npc`'s memory, if resident.
    #[must_use]
    pub fn snapshot(&self, npc: NpcId) -> Option<NpcMemory> {
        self.slot(npc).map(|s| s.lock().clone())
    }

    /// `npc`'s counters, if resident.
    #[must_use]
    pub fn stats(&self, npc: NpcId) -> Option<MemoryStats> {
        self.slot(npc).map(|s| s.lock().stats.clone())
    }

    /// `npc`'s record of `peer`, if any.
    #[must_use]
    pub fn relationship(&self, npc: NpcId, peer: NpcId) -> Option<RelationshipRecord> {
        self.slot(npc)
            .and_then(|s| s.lock().relationships.get(&peer).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventDetails;
    use crate::persistence::InMemoryPersistence;
    use chrono::{Duration, TimeZone, Utc};

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).single().expect("valid")
    }

    fn store_with(config: MemoryConfig) -> (MemoryStore, Arc<InMemoryPersistence>, NotificationBus) {
        let persistence = Arc::new(InMemoryPersistence::new());
        let bus = NotificationBus::new(256);
        let store = MemoryStore::new(
            config,
            Arc::clone(&persistence) as Arc<dyn MemoryPersistence>,
            ProcessingQueue::new(100),
            bus.clone(),
            Arc::new(SimCounters::new()),
        )
        .expect("valid config");
        (store, persistence, bus)
    }

    fn trade(a: NpcId, b: NpcId) -> MemoryCandidate {
        MemoryCandidate::new(
            EventDetails::Trade {
                item: "iron".into(),
                quantity: 3,
                price: 12.0,
            },
            [a, b],
        )
        .with_emotional_impact(0.5)
        .with_tags(["market"])
    }

    fn conflict(a: NpcId, b: NpcId) -> MemoryCandidate {
        MemoryCandidate::new(
            EventDetails::Conflict {
                damage: 4.0,
                outcome: "fled".into(),
            },
            [a, b],
        )
        .with_emotional_impact(-0.8)
    }

    #[test]
    fn trade_creates_memory_for_both_participants() {
        let (store, _, _) = store_with(MemoryConfig::default());
        let (a, b) = (NpcId::new(), NpcId::new());
        let receipt = store.add_memory_event(trade(a, b), t0()).expect("record");

        assert_eq!(store.len(), 2);
        assert_eq!(receipt.scores.len(), 2);
        for (_, score) in &receipt.scores {
            assert!(*score > 50.0);
        }
        for npc in [a, b] {
            let snap = store.snapshot(npc).expect("resident");
            assert_eq!(snap.short_term.len(), 1);
            assert_eq!(snap.short_term[0].id, receipt.memory);
            assert!(store.is_dirty(npc));
        }
    }

    #[test]
    fn invalid_candidate_touches_nobody() {
        let (store, _, _) = store_with(MemoryConfig::default());
        let empty = MemoryCandidate::new(EventDetails::Decision { choice: "wait".into() }, Vec::new());
        assert!(store.add_memory_event(empty, t0()).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn capacity_queues_npc_for_processing() {
        let config = MemoryConfig {
            short_term_capacity: 3,
            ..MemoryConfig::default()
        };
        let (store, _, _) = store_with(config);
        let (a, b) = (NpcId::new(), NpcId::new());
        for _ in 0..2 {
            let receipt = store.add_memory_event(trade(a, b), t0()).expect("record");
            assert!(receipt.queued.is_empty());
        }
        let receipt = store.add_memory_event(trade(a, b), t0()).expect("record");
        assert_eq!(receipt.queued.len(), 2);
        assert_eq!(store.queue().len(), 2);
    }

    #[test]
    fn query_by_type_and_participants_finds_fresh_event() {
        let (store, _, _) = store_with(MemoryConfig::default());
        let (a, b) = (NpcId::new(), NpcId::new());
        let receipt = store.add_memory_event(trade(a, b), t0()).expect("record");
        store.add_memory_event(conflict(a, NpcId::new()), t0()).expect("record");

        let query = MemoryQuery::default()
            .of_type(EventType::Trade)
            .with_participants(&[a, b], MatchMode::All);
        let found = store.query_memories(a, &query).expect("query");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, receipt.memory);

        let by_tag = store
            .query_memories(b, &MemoryQuery::default().with_tags(["market"], MatchMode::Any))
            .expect("query");
        assert_eq!(by_tag.len(), 1);
    }

    #[test]
    fn unfiltered_query_returns_recent_above_floor() {
        let (store, _, _) = store_with(MemoryConfig::default());
        let (a, b) = (NpcId::new(), NpcId::new());
        for i in 0..4 {
            store
                .add_memory_event(trade(a, b).happened_at(t0() + Duration::minutes(i)), t0() + Duration::minutes(i))
                .expect("record");
        }
        let found = store
            .query_memories(a, &MemoryQuery::default().limit(2))
            .expect("query");
        assert_eq!(found.len(), 2);
        assert!(found[0].timestamp > found[1].timestamp);
    }

    #[test]
    fn unknown_npc_query_is_empty_and_creates_nothing() {
        let (store, _, _) = store_with(MemoryConfig::default());
        let found = store
            .query_memories(NpcId::new(), &MemoryQuery::default())
            .expect("query");
        assert!(found.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn processing_promotes_and_notifies() {
        let (store, _, bus) = store_with(MemoryConfig::default());
        let mut rx = bus.subscribe();
        let (a, b) = (NpcId::new(), NpcId::new());
        store.add_memory_event(conflict(a, b), t0()).expect("record");

        let ProcessOutcome::Processed(summary) = store.process_npc(a, t0()) else {
            panic!("expected processing");
        };
        assert_eq!(summary.promoted.len(), 1);
        assert!(summary.relationship_updates.contains_key(&b));
        let trust = store.relationship(a, b).expect("record").trust;
        assert!(trust < 0.0);
        // b has not been processed yet but receives the mirrored change.
        let mirrored = store.relationship(b, a).expect("mirrored record");
        assert!((mirrored.trust - trust).abs() < 1e-12);
        assert!(store.is_dirty(b));

        // b's own copy of the same event does not move trust again.
        assert!(matches!(store.process_npc(b, t0()), ProcessOutcome::Processed(_)));
        assert!((store.relationship(b, a).expect("record").trust - trust).abs() < 1e-12);

        let mut kinds = Vec::new();
        while let Ok(n) = rx.try_recv() {
            kinds.push(n);
        }
        assert!(kinds.iter().any(|n| matches!(n, Notification::SignificantMemory { .. })));
        assert!(kinds.iter().any(|n| matches!(n, Notification::RelationshipUpdated { .. })));
    }

    #[test]
    fn spilled_promotion_leaves_index_and_is_only_forgotten() {
        let config = MemoryConfig {
            max_long_term_per_npc: 2,
            ..MemoryConfig::default()
        };
        let (store, _, bus) = store_with(config);
        let mut rx = bus.subscribe();
        let (a, b) = (NpcId::new(), NpcId::new());
        let mut ids = Vec::new();
        for (minute, impact) in [(0, -0.9), (1, -0.5), (2, -0.1)] {
            let at = t0() + Duration::minutes(minute);
            let receipt = store
                .add_memory_event(conflict(a, b).with_emotional_impact(impact).happened_at(at), at)
                .expect("record");
            ids.push(receipt.memory);
        }
        let weakest = ids[2];

        let ProcessOutcome::Processed(summary) = store.process_npc(a, t0() + Duration::minutes(2)) else {
            panic!("expected processing");
        };
        assert_eq!(summary.promoted.len(), 2);
        assert!(!summary.promoted.contains(&weakest));
        assert!(summary.forgotten.contains(&(weakest, ForgetReason::CapacitySpill)));

        let resident = store.snapshot(a).expect("resident").len();
        assert_eq!(resident, 2);
        assert_eq!(store.index().find_recent_memories(a, usize::MAX, 0.0).len(), resident);
        // a's two long-term memories plus b's three unprocessed copies.
        assert_eq!(store.index().len(), 5);
        let found = store
            .query_memories(a, &MemoryQuery::default().limit(2))
            .expect("query");
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|m| m.id != weakest));

        let mut significant = Vec::new();
        while let Ok(n) = rx.try_recv() {
            if let Notification::SignificantMemory { npc, memory, .. } = n {
                if npc == a {
                    significant.push(memory);
                }
            }
        }
        assert_eq!(significant.len(), 2);
        assert!(!significant.contains(&weakest));
    }

    #[test]
    fn one_sided_promotion_still_updates_both_records() {
        let (store, _, _) = store_with(MemoryConfig::default());
        let (a, b) = (NpcId::new(), NpcId::new());
        store
            .get_or_create(a)
            .expect("slot")
            .lock()
            .relationships
            .insert(b, RelationshipRecord::new(t0()).with_trust(-5.0));
        let seen = MemoryCandidate::new(EventDetails::Observation { subject: "a duel".into() }, [a, b]);
        let receipt = store.add_memory_event(seen, t0()).expect("record");
        let scores: BTreeMap<NpcId, f64> = receipt.scores.iter().copied().collect();
        assert!(scores[&a] >= 60.0, "a finds it significant: {}", scores[&a]);
        assert!(scores[&b] < 60.0, "b does not: {}", scores[&b]);

        // b processes first and forgets its copy.
        assert!(matches!(store.process_npc(b, t0()), ProcessOutcome::Processed(_)));
        assert!(store.relationship(b, a).is_none());

        let ProcessOutcome::Processed(summary) = store.process_npc(a, t0()) else {
            panic!("expected processing");
        };
        assert_eq!(summary.promoted, vec![receipt.memory]);
        assert!(store.relationship(a, b).expect("a's record").shared_memories.contains(&receipt.memory));
        assert!(store.relationship(b, a).expect("b's record").shared_memories.contains(&receipt.memory));
    }

    #[test]
    fn reprocessing_is_a_noop() {
        let (store, _, _) = store_with(MemoryConfig::default());
        let (a, b) = (NpcId::new(), NpcId::new());
        store.add_memory_event(conflict(a, b), t0()).expect("record");
        assert!(matches!(store.process_npc(a, t0()), ProcessOutcome::Processed(_)));
        let before = store.snapshot(a).expect("resident");
        assert_eq!(store.process_npc(a, t0() + Duration::hours(5)), ProcessOutcome::NoOp);
        assert_eq!(store.snapshot(a).expect("resident"), before);
        assert_eq!(store.process_npc(NpcId::new(), t0()), ProcessOutcome::NotResident);
    }

    #[test]
    fn forgotten_memories_leave_the_index() {
        let (store, _, _) = store_with(MemoryConfig::default());
        let a = NpcId::new();
        let seen = MemoryCandidate::new(EventDetails::Observation { subject: "crow".into() }, [a]);
        store.add_memory_event(seen, t0()).expect("record");
        assert_eq!(store.index().len(), 1);
        store.process_npc(a, t0());
        assert_eq!(store.index().len(), 0);
        let found = store
            .query_memories(a, &MemoryQuery::default().of_type(EventType::Observation))
            .expect("query");
        assert!(found.is_empty());
    }

    #[test]
    fn failed_save_keeps_npc_dirty() {
        let (store, persistence, _) = store_with(MemoryConfig::default());
        let (a, b) = (NpcId::new(), NpcId::new());
        store.add_memory_event(trade(a, b), t0()).expect("record");

        persistence.set_fail_saves(true);
        assert!(store.save_npc(a).is_err());
        assert!(store.is_dirty(a));
        let report = store.flush_dirty();
        assert_eq!(report.failed.len(), 2);
        assert_eq!(store.dirty_count(), 2);

        persistence.set_fail_saves(false);
        let report = store.flush_dirty();
        assert_eq!(report.saved, 2);
        assert_eq!(store.dirty_count(), 0);
        assert!(persistence.stored(a).is_some());
    }

    #[test]
    fn persisted_memory_is_loaded_before_first_use() {
        let (store, persistence, _) = store_with(MemoryConfig::default());
        let (a, b) = (NpcId::new(), NpcId::new());
        store.add_memory_event(conflict(a, b), t0()).expect("record");
        store.process_npc(a, t0());
        store.flush_dirty();

        let restarted = MemoryStore::new(
            MemoryConfig::default(),
            Arc::clone(&persistence) as Arc<dyn MemoryPersistence>,
            ProcessingQueue::new(100),
            NotificationBus::new(16),
            Arc::new(SimCounters::new()),
        )
        .expect("valid config");
        assert!(restarted.is_empty());
        let found = restarted
            .query_memories(a, &MemoryQuery::default().of_type(EventType::Conflict))
            .expect("query");
        assert_eq!(found.len(), 1);

        restarted.add_memory_event(trade(a, b), t0()).expect("record");
        let snap = restarted.snapshot(a).expect("resident");
        assert_eq!(snap.long_term.len(), 1);
        assert_eq!(snap.short_term.len(), 1);
    }

    #[test]
    fn reload_rejects_invalid_memory_config() {
        let (store, _, _) = store_with(MemoryConfig::default());
        let bad = MemoryConfig {
            short_term_capacity: 0,
            ..MemoryConfig::default()
        };
        assert!(store.reload_config(bad).is_err());
        assert_eq!(store.config().short_term_capacity, MemoryConfig::default().short_term_capacity);
    }
}
