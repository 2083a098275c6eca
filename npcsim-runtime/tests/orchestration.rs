//! Orchestration tests: game events in, scheduled cycles, hot reload.

use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{TimeZone, Utc};

use npcsim_core::config::SimConfig;
use npcsim_core::event::EventType;
use npcsim_core::persistence::InMemoryPersistence;
use npcsim_core::service::MemoryService;
use npcsim_core::store::MemoryQuery;
use npcsim_core::tier::SimulationTier;
use npcsim_core::types::{Location, NpcId, PoiId, Timestamp};
use npcsim_runtime::clock::{Clock, ManualClock};
use npcsim_runtime::events::CombatOutcome;
use npcsim_runtime::hooks::{self, EventRouter};
use npcsim_runtime::scheduler::Scheduler;

fn start() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 8, 20, 7, 0, 0).single().expect("valid date")
}

fn setup(config: SimConfig) -> (Arc<MemoryService>, EventRouter, Scheduler, ManualClock) {
    let clock = ManualClock::new(start());
    let service = MemoryService::new(config, Arc::new(InMemoryPersistence::new())).expect("valid config");
    service.start();
    let service = Arc::new(service);
    let router = EventRouter::new(Arc::clone(&service));
    let scheduler = Scheduler::new(Arc::clone(&service), Arc::new(clock.clone()));
    (service, router, scheduler, clock)
}

#[tokio::test]
async fn a_morning_in_the_market() {
    let mut config = SimConfig::default();
    config.memory.short_term_capacity = 3;
    config.memory.compression_threshold = 2;
    let (service, router, scheduler, clock) = setup(config);

    let player = NpcId::new();
    router.register_player(player);
    let market = PoiId::new();
    let (smith, baker, guard) = (NpcId::new(), NpcId::new(), NpcId::new());
    for npc in [smith, baker, guard] {
        service.register_npc(npc, Some(market), clock.now());
    }

    let lifted = router.player_enters_poi(market, clock.now()).expect("running");
    assert_eq!(lifted.len(), 3);
    assert_eq!(service.tiers().tier_of(baker), Some(SimulationTier::Background));

    let square = Location::new(10.0, 4.0, 0.0);
    for _ in 0..3 {
        let now = clock.advance_hours(0.1);
        router
            .ingest(
                &hooks::on_combat(smith, guard, CombatOutcome::DefenderWon, 6.0, vec![baker], square, now),
                now,
            )
            .expect("ingest");
    }
    let now = clock.advance_hours(0.1);
    let report = router
        .ingest(&hooks::on_trade(player, baker, "rye loaf".into(), 2, 4.0, 0.6, square, now), now)
        .expect("ingest");
    assert_eq!(report.signals.len(), 1);
    assert_eq!(service.tiers().tier_of(baker), Some(SimulationTier::Active));

    let processed = scheduler.processing_tick().await.expect("cycle");
    assert_eq!(processed.processed, 3);

    let fights = service
        .query(guard, &MemoryQuery::default().of_type(EventType::Conflict))
        .expect("query");
    assert_eq!(fights.len(), 1, "three fights compress into one memory");
    assert!(service.store().relationship(guard, smith).expect("met").trust < 0.0);

    clock.advance_hours(2.0);
    let tiers = scheduler.tier_tick().expect("cycle");
    assert!(tiers.demotions.iter().any(|t| t.npc == baker && t.to == SimulationTier::Background));
}

#[test]
fn edited_config_file_is_reloaded_between_cycles() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("npcsim.toml");
    std::fs::write(&path, "[memory]\nshort_term_capacity = 20\n").expect("write");

    let config = SimConfig::from_file(&path).expect("parse");
    let (service, _, scheduler, _) = setup(config);
    let scheduler = scheduler.with_config_file(&path);
    assert!(!scheduler.check_reload());

    let mut file = File::create(&path).expect("open");
    file.write_all(b"[memory]\nshort_term_capacity = 7\n").expect("write");
    file.set_modified(SystemTime::now() + Duration::from_secs(60))
        .expect("touch");
    drop(file);

    scheduler.tier_tick().expect("cycle");
    assert_eq!(service.store().config().short_term_capacity, 7);
}

#[test]
fn invalid_config_edit_keeps_running_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("npcsim.toml");
    std::fs::write(&path, "").expect("write");

    let (service, _, scheduler, _) = setup(SimConfig::default());
    let scheduler = scheduler.with_config_file(&path);

    let mut file = File::create(&path).expect("open");
    file.write_all(b"[tiers]\ntier_1_duration_hours = 20.0\ntier_2_duration_hours = 11.0\n")
        .expect("write");
    file.set_modified(SystemTime::now() + Duration::from_secs(60))
        .expect("touch");
    drop(file);

    assert!(!scheduler.check_reload());
    assert!((service.config().tiers.tier_1_duration_hours - 1.0).abs() < f64::EPSILON);
}
