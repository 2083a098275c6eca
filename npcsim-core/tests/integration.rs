//! Integration Tests: End-to-End Memory and Tier Flows
//!
//! These tests drive the public service API the way an orchestrator would:
//! record events, run cycles with an explicit clock, persist, restart.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use npcsim_core::compression::Strategy;
use npcsim_core::config::{PersistenceBackend, PersistenceConfig, SimConfig, TierConfig};
use npcsim_core::event::{EventDetails, EventType, MemoryCandidate, MemoryOrigin};
use npcsim_core::index::MatchMode;
use npcsim_core::notify::Notification;
use npcsim_core::persistence::{InMemoryPersistence, MemoryPersistence};
use npcsim_core::relationship::RelationshipRecord;
use npcsim_core::service::{CycleLimits, MemoryService};
use npcsim_core::store::{MemoryQuery, ProcessOutcome};
use npcsim_core::tier::{ActivationSignal, RejectReason, SimulationTier, TierOutcome};
use npcsim_core::types::{NpcId, PoiId, Timestamp, hours};
use npcsim_core::SimError;

fn t0() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).single().expect("valid date")
}

fn running(config: SimConfig) -> (MemoryService, Arc<InMemoryPersistence>) {
    let persistence = Arc::new(InMemoryPersistence::new());
    let service = MemoryService::new(config, Arc::clone(&persistence) as Arc<dyn MemoryPersistence>)
        .expect("valid config");
    service.start();
    (service, persistence)
}

fn trade(a: NpcId, b: NpcId) -> MemoryCandidate {
    MemoryCandidate::new(
        EventDetails::Trade {
            item: "iron ore".into(),
            quantity: 12,
            price: 30.0,
        },
        [a, b],
    )
    .with_emotional_impact(0.5)
}

fn fight(a: NpcId, b: NpcId, at: Timestamp) -> MemoryCandidate {
    let mut candidate = MemoryCandidate::new(
        EventDetails::Conflict {
            damage: 14.0,
            outcome: "stalemate".into(),
        },
        [a, b],
    )
    .with_emotional_impact(-0.6);
    candidate.timestamp = Some(at);
    candidate
}

fn limits() -> CycleLimits {
    CycleLimits {
        batch_size: 100,
        time_budget: Duration::from_secs(10),
    }
}

// ---------------------------------------------------------------------------
// Scenario: first trade creates both participants' memory
// ---------------------------------------------------------------------------

#[test]
fn first_trade_creates_memory_for_both_participants() {
    let (service, _) = running(SimConfig::default());
    let (a, b) = (NpcId::new(), NpcId::new());

    let receipt = service.add_memory_event(trade(a, b), t0()).expect("record");

    assert_eq!(receipt.scores.len(), 2);
    for npc in [a, b] {
        let memory = service.store().snapshot(npc).expect("created");
        assert_eq!(memory.short_term.len(), 1);
        assert!(memory.long_term.is_empty());
        let event = &memory.short_term[0];
        assert_eq!(event.id, receipt.memory);
        assert!(event.importance > 50.0, "importance {}", event.importance);
        assert!(event.importance <= 100.0);
    }
}

// ---------------------------------------------------------------------------
// Scenario: ten conflicts compress into one summary
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ten_conflicts_summarize_into_one_memory() {
    let mut config = SimConfig::default();
    config.memory.short_term_capacity = 10;
    config.memory.compression_threshold = 5;
    let (service, _) = running(config);
    let (a, b) = (NpcId::new(), NpcId::new());

    for i in 0..10 {
        let at = t0() + hours(f64::from(i) * 0.25);
        service.add_memory_event(fight(a, b, at), at).expect("record");
    }
    let latest = t0() + hours(2.25);
    assert!(service.store().queue().contains(a));

    let report = service.run_processing_cycle(latest, limits()).await.expect("cycle");
    assert_eq!(report.processed, 2);

    let memory = service.store().snapshot(a).expect("resident");
    assert!(memory.short_term.is_empty());
    assert_eq!(memory.long_term.len(), 1);
    let summary = &memory.long_term[0];
    assert_eq!(summary.timestamp, latest);
    assert_eq!(summary.participant_set().len(), 2);
    assert!(matches!(summary.origin, MemoryOrigin::Summarized { count: 10, .. }));
}

#[test]
fn summarize_strategy_is_reported() {
    let mut config = SimConfig::default();
    config.memory.short_term_capacity = 50;
    let (service, _) = running(config);
    let (a, b) = (NpcId::new(), NpcId::new());
    for i in 0..10 {
        let at = t0() + hours(f64::from(i));
        service.add_memory_event(fight(a, b, at), at).expect("record");
    }

    let ProcessOutcome::Processed(summary) = service.store().process_npc(a, t0() + hours(10.0)) else {
        panic!("expected processing");
    };
    assert_eq!(summary.groups.len(), 1);
    assert_eq!(summary.groups[0].strategy, Strategy::Summarize);
    assert_eq!(summary.groups[0].size, 10);
    assert_eq!(summary.groups[0].produced, 1);
}

// ---------------------------------------------------------------------------
// Scenario: idle tier 1 NPC is demoted
// ---------------------------------------------------------------------------

#[test]
fn idle_active_npc_demotes_to_background() {
    let (service, _) = running(SimConfig::default());
    let npc = NpcId::new();
    let outcome = service
        .signal(npc, ActivationSignal::DirectInteraction, t0())
        .expect("running");
    assert_eq!(outcome.tier(), SimulationTier::Active);

    let early = service.run_tier_cycle(t0() + hours(0.5), None).expect("cycle");
    assert!(early.demotions.is_empty());

    let report = service.run_tier_cycle(t0() + hours(1.5), None).expect("cycle");
    assert_eq!(report.demotions.len(), 1);
    assert_eq!(report.demotions[0].from, Some(SimulationTier::Active));
    assert_eq!(report.demotions[0].to, SimulationTier::Background);
    assert_eq!(service.tiers().tier_of(npc), Some(SimulationTier::Background));
}

#[test]
fn tier_cycle_honours_per_call_cap() {
    let (service, _) = running(SimConfig::default());
    for _ in 0..4 {
        service
            .signal(NpcId::new(), ActivationSignal::DirectInteraction, t0())
            .expect("running");
    }
    let capped = service.run_tier_cycle(t0() + hours(1.5), Some(1)).expect("cycle");
    assert_eq!(capped.demotions.len(), 1);
    assert_eq!(capped.deferred, 3);

    let rest = service.run_tier_cycle(t0() + hours(1.5), None).expect("cycle");
    assert_eq!(rest.demotions.len(), 3);
}

// ---------------------------------------------------------------------------
// Scenario: tier 1 at capacity rejects further promotions
// ---------------------------------------------------------------------------

#[test]
fn full_tier_one_rejects_promotion() {
    let mut config = SimConfig::default();
    config.tiers.max_tier_1_npcs = 1;
    let (service, _) = running(config);
    let mut events = service.subscribe();

    let (first, second) = (NpcId::new(), NpcId::new());
    let market = PoiId::new();
    service.register_npc(second, Some(market), t0());
    service.player_enters_poi(market, t0()).expect("running");
    assert_eq!(service.tiers().tier_of(second), Some(SimulationTier::Background));

    service
        .signal(first, ActivationSignal::DirectInteraction, t0())
        .expect("running");
    let outcome = service
        .signal(second, ActivationSignal::DirectInteraction, t0())
        .expect("running");

    assert_eq!(
        outcome,
        TierOutcome::Rejected {
            reason: RejectReason::Tier1Full,
            tier: SimulationTier::Background,
        }
    );
    assert_eq!(service.tiers().tier_of(second), Some(SimulationTier::Background));
    assert_eq!(service.tiers().counts()[&SimulationTier::Active], 1);

    let mut saw_rejection = false;
    while let Ok(notification) = events.try_recv() {
        if let Notification::PromotionRejected { npc, .. } = notification {
            saw_rejection |= npc == second;
        }
    }
    assert!(saw_rejection);
    assert_eq!(service.metrics().promotions_rejected, 1);
}

// ---------------------------------------------------------------------------
// Scenario: misordered tier durations are refused
// ---------------------------------------------------------------------------

#[test]
fn misordered_durations_refuse_to_start() {
    let tiers = TierConfig {
        tier_1_duration_hours: 20.0,
        tier_2_duration_hours: 11.0,
        ..TierConfig::default()
    };
    let issues = tiers.validate();
    assert!(issues.iter().any(|i| i.field == "tiers.tier_1_duration_hours"));

    let config = SimConfig {
        tiers,
        ..SimConfig::default()
    };
    let result = MemoryService::new(config, Arc::new(InMemoryPersistence::new()));
    match result {
        Err(SimError::InvalidConfig { issues }) => assert!(!issues.is_empty()),
        other => panic!("expected InvalidConfig, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Scenario: trust is clamped
// ---------------------------------------------------------------------------

#[test]
fn trust_clamps_at_upper_bound() {
    let memory = npcsim_core::MemoryId::new();
    let mut near = RelationshipRecord::new(t0()).with_trust(9.5);
    assert!((near.apply(0.2, memory, t0()) - 9.7).abs() < 1e-9);

    let mut edge = RelationshipRecord::new(t0()).with_trust(9.9);
    assert!((edge.apply(0.5, memory, t0()) - 10.0).abs() < f64::EPSILON);
}

// ---------------------------------------------------------------------------
// Processing properties
// ---------------------------------------------------------------------------

#[test]
fn reprocessing_an_empty_buffer_changes_nothing() {
    let (service, _) = running(SimConfig::default());
    let (a, b) = (NpcId::new(), NpcId::new());
    service.add_memory_event(fight(a, b, t0()), t0()).expect("record");

    assert!(matches!(
        service.store().process_npc(a, t0()),
        ProcessOutcome::Processed(_)
    ));
    let after_first = service.store().snapshot(a).expect("resident");

    assert_eq!(service.store().process_npc(a, t0() + hours(3.0)), ProcessOutcome::NoOp);
    let after_second = service.store().snapshot(a).expect("resident");
    assert_eq!(after_first, after_second);
}

#[test]
fn recorded_event_is_found_by_type_and_participants() {
    let (service, _) = running(SimConfig::default());
    let (a, b) = (NpcId::new(), NpcId::new());
    let receipt = service.add_memory_event(trade(a, b), t0()).expect("record");

    let query = MemoryQuery::default()
        .of_type(EventType::Trade)
        .with_participants(&[a, b], MatchMode::All);
    let found = service.query(b, &query).expect("query");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, receipt.memory);

    let unrelated = MemoryQuery::default().of_type(EventType::Quest);
    assert!(service.query(b, &unrelated).expect("query").is_empty());
}

#[test]
fn relationships_follow_significant_memories() {
    let (service, _) = running(SimConfig::default());
    let (a, b) = (NpcId::new(), NpcId::new());
    service.add_memory_event(fight(a, b, t0()), t0()).expect("record");
    service.store().process_npc(a, t0());
    service.store().process_npc(b, t0());

    let ab = service.store().relationship(a, b).expect("record");
    let ba = service.store().relationship(b, a).expect("record");
    assert!(ab.trust < 0.0);
    assert!((ab.trust - ba.trust).abs() < f64::EPSILON);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sqlite_state_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = SimConfig::default();
    config.persistence = PersistenceConfig {
        backend: PersistenceBackend::Sqlite,
        path: dir.path().join("npcsim.db"),
        ..PersistenceConfig::default()
    };
    config.memory.short_term_capacity = 2;
    let (a, b) = (NpcId::new(), NpcId::new());

    {
        let service = MemoryService::from_config(config.clone()).expect("open");
        service.start();
        service.add_memory_event(fight(a, b, t0()), t0()).expect("record");
        service.add_memory_event(trade(a, b), t0()).expect("record");
        service.run_processing_cycle(t0(), limits()).await.expect("cycle");
        let flush = service.stop();
        assert!(flush.failed.is_empty());
    }

    let service = MemoryService::from_config(config).expect("reopen");
    service.start();
    let memories = service.query(a, &MemoryQuery::default().limit(10)).expect("query");
    assert_eq!(memories.len(), 2);
    assert!(service.store().relationship(a, b).is_some());
}

#[test]
fn failed_save_keeps_npc_dirty_until_flushed() {
    let (service, persistence) = running(SimConfig::default());
    let (a, b) = (NpcId::new(), NpcId::new());
    service.add_memory_event(trade(a, b), t0()).expect("record");

    persistence.set_fail_saves(true);
    let flush = service.store().flush_dirty();
    assert_eq!(flush.failed.len(), 2);
    assert!(service.store().is_dirty(a));

    persistence.set_fail_saves(false);
    let flush = service.store().flush_dirty();
    assert_eq!(flush.saved, 2);
    assert!(!service.store().is_dirty(a));
    assert!(persistence.stored(a).is_some());
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_budget_requeues_unstarted_npcs() {
    let mut config = SimConfig::default();
    config.memory.short_term_capacity = 1;
    let (service, _) = running(config);
    let npcs: Vec<NpcId> = (0..4).map(|_| NpcId::new()).collect();
    for pair in npcs.chunks(2) {
        service.add_memory_event(trade(pair[0], pair[1]), t0()).expect("record");
    }
    assert_eq!(service.store().queue().len(), 4);

    let report = service
        .run_processing_cycle(
            t0(),
            CycleLimits {
                batch_size: 4,
                time_budget: Duration::ZERO,
            },
        )
        .await
        .expect("cycle");
    assert_eq!(report.requeued.len(), 4);
    assert_eq!(service.store().queue().len(), 4);

    let report = service.run_processing_cycle(t0(), limits()).await.expect("cycle");
    assert_eq!(report.processed, 4);
    assert!(service.store().queue().is_empty());
}

#[tokio::test]
async fn stopped_service_rejects_cycles() {
    let (service, _) = running(SimConfig::default());
    service.stop();
    assert!(matches!(
        service.run_processing_cycle(t0(), limits()).await,
        Err(SimError::NotRunning)
    ));
    assert!(matches!(service.run_tier_cycle(t0(), None), Err(SimError::NotRunning)));
}

#[test]
fn maintenance_forgets_decayed_memories() {
    let (service, _) = running(SimConfig::default());
    let (a, b) = (NpcId::new(), NpcId::new());
    service.add_memory_event(fight(a, b, t0()), t0()).expect("record");
    service.store().process_npc(a, t0());
    assert_eq!(service.store().snapshot(a).expect("resident").long_term.len(), 1);

    let report = service.run_maintenance(t0() + hours(2000.0)).expect("maintenance");
    assert!(report.decayed_away >= 1);
    assert!(service.store().snapshot(a).expect("resident").long_term.is_empty());
}
