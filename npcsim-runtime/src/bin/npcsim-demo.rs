//! npcsim demo driver
//!
//! Usage:
//!   npcsim-demo simulate   Run a simulated day in a small town
//!   npcsim-demo replay     Feed recorded game events through the service
//!   npcsim-demo run        Drive the scheduler on wall-clock time until Ctrl-C

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use npcsim_core::config::{PersistenceBackend, SimConfig};
use npcsim_core::persistence::{InMemoryPersistence, MemoryPersistence, open_persistence};
use npcsim_core::service::MemoryService;
use npcsim_core::store::MemoryQuery;
use npcsim_core::types::{Location, NpcId, PoiId};
use npcsim_runtime::clock::{Clock, ManualClock, SystemClock};
use npcsim_runtime::events::{CombatOutcome, GameEvent};
use npcsim_runtime::hooks::{self, EventRouter};
use npcsim_runtime::scheduler::Scheduler;
use npcsim_runtime::telemetry;

#[derive(Parser)]
#[command(name = "npcsim-demo")]
#[command(author, version, about = "Tiered NPC simulation and memory lifecycle demo")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a town with one player wandering between markets
    Simulate {
        /// Number of NPCs
        #[arg(long, default_value_t = 200)]
        npcs: usize,
        /// Simulated hours
        #[arg(long, default_value_t = 24)]
        hours: u32,
        /// Simulated minutes per step
        #[arg(long, default_value_t = 10)]
        step_minutes: u32,
    },

    /// Replay a JSON array of game events
    Replay {
        /// Event file
        events: PathBuf,
        /// Ids to treat as players
        #[arg(long)]
        player: Vec<String>,
    },

    /// Run the scheduler on wall-clock time
    Run,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SimConfig> {
    let config = match path {
        Some(path) => SimConfig::from_file(path).with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut config = SimConfig::default();
            config.persistence.backend = PersistenceBackend::Memory;
            config
        }
    };
    config.ensure_valid()?;
    Ok(config)
}

fn build_service(config: SimConfig) -> anyhow::Result<Arc<MemoryService>> {
    let persistence: Arc<dyn MemoryPersistence> = match config.persistence.backend {
        PersistenceBackend::Memory => Arc::new(InMemoryPersistence::new()),
        PersistenceBackend::Sqlite => open_persistence(&config.persistence)?,
    };
    let service = MemoryService::new(config, persistence)?;
    service.start();
    Ok(Arc::new(service))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    telemetry::init_tracing(&config)?;

    match cli.command {
        Commands::Simulate {
            npcs,
            hours,
            step_minutes,
        } => simulate(config, npcs, hours, step_minutes).await,
        Commands::Replay { events, player } => replay(config, &events, &player).await,
        Commands::Run => run(config, cli.config).await,
    }
}

// ---------------------------------------------------------------------------
// simulate
// ---------------------------------------------------------------------------

async fn simulate(config: SimConfig, npc_count: usize, hours: u32, step_minutes: u32) -> anyhow::Result<()> {
    let start = Utc
        .with_ymd_and_hms(2024, 4, 1, 6, 0, 0)
        .single()
        .context("demo start time")?;
    let clock = ManualClock::new(start);
    let service = build_service(config)?;
    let router = EventRouter::new(Arc::clone(&service));
    let scheduler = Scheduler::new(Arc::clone(&service), Arc::new(clock.clone()));

    let player = NpcId::new();
    router.register_player(player);
    let markets: Vec<PoiId> = (0..4).map(|_| PoiId::new()).collect();
    let npcs: Vec<NpcId> = (0..npc_count).map(|_| NpcId::new()).collect();
    for (i, npc) in npcs.iter().enumerate() {
        service.register_npc(*npc, Some(markets[i % markets.len()]), clock.now());
    }
    println!("Registered {npc_count} NPCs across {} markets", markets.len());

    let steps = hours * 60 / step_minutes.max(1);
    for step in 0..steps as usize {
        let now = clock.advance_hours(f64::from(step_minutes) / 60.0);
        let town = Location::new((step % 50) as f32, 0.0, 0.0);

        if step % 12 == 0 {
            router.player_enters_poi(markets[(step / 12) % markets.len()], now)?;
        }
        if npcs.len() >= 2 {
            let a = npcs[step % npcs.len()];
            let b = npcs[(step * 7 + 3) % npcs.len()];
            let event = match step % 4 {
                0 => hooks::on_dialogue(player, a, "the harvest".into(), town, now),
                1 => hooks::on_trade(a, b, "grain".into(), 5, 12.0, 0.2, town, now),
                2 => hooks::on_combat(a, b, CombatOutcome::Draw, 8.0, vec![player], town, now),
                _ => hooks::on_help(player, b, "carried water".into(), Vec::new(), town, now),
            };
            router.ingest(&event, now)?;
        }

        scheduler.processing_tick().await?;
        if step % 6 == 0 {
            scheduler.tier_tick()?;
        }
    }

    scheduler.maintenance_tick()?;
    let report = scheduler.optimization_tick()?;
    println!("\nTier population:");
    for (tier, count) in &report.tiers.counts {
        println!("  {:<22} {count}", tier.as_str());
    }
    println!(
        "CPU {:.1}/{:.1}  memory {:.1}/{:.1} MB",
        report.tiers.budgeted_cpu, report.tiers.cpu_limit, report.tiers.budgeted_memory_mb, report.tiers.memory_limit_mb
    );
    for line in &report.tiers.recommendations {
        println!("  advice: {line}");
    }

    let recalled = service.query(player, &MemoryQuery::default().limit(5))?;
    println!("\nThe player's {} most recent memories:", recalled.len());
    for memory in recalled {
        println!("  [{:>5.1}] {} {}", memory.current_importance, memory.event_type(), memory.timestamp);
    }
    println!("\n{}", service.render_prometheus());
    service.stop();
    Ok(())
}

// ---------------------------------------------------------------------------
// replay
// ---------------------------------------------------------------------------

async fn replay(config: SimConfig, path: &Path, players: &[String]) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut events: Vec<GameEvent> = serde_json::from_str(&raw).context("parsing game events")?;
    events.sort_by_key(GameEvent::timestamp);
    let Some(first) = events.first() else {
        println!("No events to replay");
        return Ok(());
    };

    let clock = ManualClock::new(first.timestamp());
    let service = build_service(config)?;
    let router = EventRouter::new(Arc::clone(&service));
    for id in players {
        let uuid = id.parse().with_context(|| format!("player id {id}"))?;
        router.register_player(NpcId(uuid));
    }
    let scheduler = Scheduler::new(Arc::clone(&service), Arc::new(clock.clone()));

    for event in &events {
        clock.set(event.timestamp());
        router.ingest(event, clock.now())?;
        scheduler.processing_tick().await?;
        scheduler.tier_tick()?;
    }
    let maintenance = scheduler.maintenance_tick()?;
    info!(saved = maintenance.flush.saved, "Replay flushed");
    println!("Replayed {} events into {} NPC memories", events.len(), service.store().len());
    println!("{:#?}", service.metrics());
    service.stop();
    Ok(())
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn run(config: SimConfig, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let service = build_service(config)?;
    let mut scheduler = Scheduler::new(Arc::clone(&service), Arc::new(SystemClock));
    if let Some(path) = config_path {
        scheduler = scheduler.with_config_file(path);
    }

    let (tx, rx) = watch::channel(false);
    let loop_handle = tokio::spawn(async move { scheduler.run(rx).await });
    println!("npcsim running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tx.send(true)?;
    let stats = loop_handle.await?;
    let flush = service.stop();
    println!("Stopped after {stats:?}; saved {} NPCs", flush.saved);
    Ok(())
}
