//! The constructible simulation service.
//!
//! [`MemoryService`] wires a [`MemoryStore`] and a [`TierManager`] to one
//! configuration, one persistence collaborator and one notification bus.
//! It never schedules itself: an orchestrator calls the cycle methods with
//! an explicit `now`, which keeps every cycle deterministic under test.
//!
//! ```text
//!  game events ──▶ add_memory_event ──▶ short-term ──(capacity)──▶ queue
//!                                                                    │
//!  orchestrator ──▶ run_processing_cycle ◀── drain(batch) ───────────┘
//!               ──▶ run_tier_cycle
//!               ──▶ run_maintenance / run_optimization
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::SimConfig;
use crate::error::{Result, SimError};
use crate::event::{MemoryCandidate, MemoryEvent};
use crate::metrics::{CounterSnapshot, CycleMonitor, CyclePercentiles, SimCounters, spans};
use crate::notify::{Notification, NotificationBus};
use crate::persistence::{MaintenanceReport, MemoryPersistence, open_persistence};
use crate::queue::{Enqueued, ProcessingQueue, QueueStats};
use crate::store::{FlushReport, MemoryQuery, MemoryStore, ProcessOutcome, RecordReceipt};
use crate::tier::{ActivationSignal, SimulationTier, TierCycleReport, TierManager, TierOutcome, TierStatus};
use crate::types::{NpcId, PoiId, Timestamp};

/// Bounds for one processing batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleLimits {
    /// Maximum NPCs drained from the queue.
    pub batch_size: usize,
    /// Wall-clock budget; NPCs not started in time are re-queued.
    pub time_budget: Duration,
}

impl CycleLimits {
    /// Limits taken from the scheduling configuration.
    #[must_use]
    pub const fn from_config(config: &SimConfig) -> Self {
        Self {
            batch_size: config.scheduling.processing_batch_size,
            time_budget: Duration::from_millis(config.scheduling.processing_time_budget_ms),
        }
    }
}

/// Result of one processing batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingCycleReport {
    /// NPCs taken from the queue.
    pub drained: usize,
    /// NPCs whose memory changed.
    pub processed: usize,
    /// NPCs with nothing to do (or no longer resident).
    pub unchanged: usize,
    /// NPCs whose processing failed, with the error. Other NPCs are unaffected.
    pub failed: Vec<(NpcId, String)>,
    /// NPCs put back on the queue because the batch ran out of time or was
    /// cancelled.
    pub requeued: Vec<NpcId>,
    /// Memories promoted across the batch.
    pub promoted: usize,
    /// Memories forgotten across the batch.
    pub forgotten: usize,
    /// Whether the batch stopped early because the service is stopping.
    pub cancelled: bool,
    /// Wall-clock time spent.
    pub elapsed: Duration,
}

/// Result of a maintenance cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceCycleReport {
    /// Memories forgotten by the decay sweep.
    pub decayed_away: usize,
    /// Dirty flush result.
    pub flush: FlushReport,
    /// Backend housekeeping; `None` when it failed (logged).
    pub persistence: Option<MaintenanceReport>,
    /// Empty index buckets removed.
    pub index_buckets_compacted: usize,
}

/// Result of an optimization cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationReport {
    /// Tier population and budget with recommendations.
    pub tiers: TierStatus,
    /// Processing queue counters.
    pub queue: QueueStats,
    /// NPCs with pending short-term memory queued for processing.
    pub enqueued_pending: usize,
    /// Processing cycle timings.
    pub processing_timings: CyclePercentiles,
}

/// Tiered NPC simulation and memory lifecycle service.
pub struct MemoryService {
    config: RwLock<Arc<SimConfig>>,
    store: Arc<MemoryStore>,
    tiers: Arc<TierManager>,
    persistence: Arc<dyn MemoryPersistence>,
    bus: NotificationBus,
    counters: Arc<SimCounters>,
    running: AtomicBool,
    cancel: Arc<AtomicBool>,
    processing_monitor: CycleMonitor,
}

impl std::fmt::Debug for MemoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryService")
            .field("running", &self.is_running())
            .field("store", &self.store)
            .field("tiers", &self.tiers)
            .finish_non_exhaustive()
    }
}

impl MemoryService {
    /// Build a stopped service.
    ///
    /// # Errors
    /// `SimError::InvalidConfig` listing every issue in every section; the
    /// service is not built.
    pub fn new(config: SimConfig, persistence: Arc<dyn MemoryPersistence>) -> Result<Self> {
        config.ensure_valid()?;
        let bus = NotificationBus::new(config.telemetry.notification_capacity);
        let counters = Arc::new(SimCounters::new());
        let queue = ProcessingQueue::new(config.scheduling.max_queue_size);
        let store = MemoryStore::new(
            config.memory.clone(),
            Arc::clone(&persistence),
            queue,
            bus.clone(),
            Arc::clone(&counters),
        )?;
        let tiers = TierManager::with_observers(config.tiers.clone(), bus.clone(), Arc::clone(&counters))?;
        let budget = Duration::from_millis(config.scheduling.processing_time_budget_ms);
        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            store: Arc::new(store),
            tiers: Arc::new(tiers),
            persistence,
            bus,
            counters,
            running: AtomicBool::new(false),
            cancel: Arc::new(AtomicBool::new(false)),
            processing_monitor: CycleMonitor::new(budget),
        })
    }

    /// Build a stopped service with the persistence backend named in `config`.
    ///
    /// # Errors
    /// Invalid configuration or a backend that cannot be opened.
    pub fn from_config(config: SimConfig) -> Result<Self> {
        config.ensure_valid()?;
        let persistence = open_persistence(&config.persistence)?;
        Self::new(config, persistence)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Accept events and cycles.
    pub fn start(&self) {
        self.cancel.store(false, Ordering::Release);
        if !self.running.swap(true, Ordering::AcqRel) {
            info!("NPC simulation service started");
        }
    }

    /// Refuse new work, cancel in-flight cycles at the next unit boundary and
    /// flush dirty memory.
    pub fn stop(&self) -> FlushReport {
        self.cancel.store(true, Ordering::Release);
        let was_running = self.running.swap(false, Ordering::AcqRel);
        let flush = self.store.flush_dirty();
        if was_running {
            info!(saved = flush.saved, failed = flush.failed.len(), "NPC simulation service stopped");
        }
        flush
    }

    /// Whether the service accepts work.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() { Ok(()) } else { Err(SimError::NotRunning) }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> Arc<SimConfig> {
        Arc::clone(&self.config.read())
    }

    /// The memory store.
    #[must_use]
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// The tier manager.
    #[must_use]
    pub fn tiers(&self) -> &Arc<TierManager> {
        &self.tiers
    }

    /// Subscribe to lifecycle notifications.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.bus.subscribe()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Counters plus queue and tier gauges in Prometheus text format.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let mut out = self.counters.snapshot().to_prometheus();
        let queue = self.store.queue().stats();
        out.push_str("# TYPE npcsim_queue_depth gauge\n");
        out.push_str(&format!("npcsim_queue_depth {}\n", queue.depth));
        out.push_str("# TYPE npcsim_dirty_npcs gauge\n");
        out.push_str(&format!("npcsim_dirty_npcs {}\n", self.store.dirty_count()));
        out.push_str("# TYPE npcsim_tier_npcs gauge\n");
        for (tier, count) in self.tiers.counts() {
            out.push_str(&format!("npcsim_tier_npcs{{tier=\"{tier}\"}} {count}\n"));
        }
        out
    }

    // ------------------------------------------------------------------
    // Inbound operations
    // ------------------------------------------------------------------

    /// Record a gameplay event for every participant.
    ///
    /// # Errors
    /// `SimError::NotRunning`, `SimError::InvalidEvent`, or a persistence
    /// load failure.
    pub fn add_memory_event(&self, candidate: MemoryCandidate, now: Timestamp) -> Result<RecordReceipt> {
        self.ensure_running()?;
        let span = info_span!(spans::RECORD_EVENT, event_type = %candidate.details.event_type());
        let _enter = span.enter();
        self.store.add_memory_event(candidate, now)
    }

    /// Query `npc`'s memories.
    ///
    /// # Errors
    /// Propagates a persistence load failure.
    pub fn query(&self, npc: NpcId, query: &MemoryQuery) -> Result<Vec<MemoryEvent>> {
        let span = info_span!(spans::QUERY, npc = %npc);
        let _enter = span.enter();
        self.store.query_memories(npc, query)
    }

    /// Forward a promotion signal to the tier manager.
    ///
    /// # Errors
    /// `SimError::NotRunning`.
    pub fn signal(&self, npc: NpcId, signal: ActivationSignal, now: Timestamp) -> Result<TierOutcome> {
        self.ensure_running()?;
        Ok(self.tiers.signal(npc, signal, now))
    }

    /// Register a population NPC at the statistical tier.
    pub fn register_npc(&self, npc: NpcId, poi: Option<PoiId>, now: Timestamp) -> SimulationTier {
        self.tiers.register_npc(npc, poi, now)
    }

    /// A player entered `poi`.
    ///
    /// # Errors
    /// `SimError::NotRunning`.
    pub fn player_enters_poi(&self, poi: PoiId, now: Timestamp) -> Result<Vec<(NpcId, TierOutcome)>> {
        self.ensure_running()?;
        Ok(self.tiers.player_enters_poi(poi, now))
    }

    // ------------------------------------------------------------------
    // Cycles
    // ------------------------------------------------------------------

    /// Drain up to `limits.batch_size` queued NPCs and process them on the
    /// blocking pool, several at a time, joining before returning.
    ///
    /// A failure (including a panic) in one NPC is reported and the batch
    /// continues. NPCs not yet started when the time budget runs out or the
    /// service stops are put back at the front of the queue; NPCs already
    /// started finish their unit of work.
    ///
    /// # Errors
    /// `SimError::NotRunning`.
    pub async fn run_processing_cycle(&self, now: Timestamp, limits: CycleLimits) -> Result<ProcessingCycleReport> {
        self.ensure_running()?;
        let span = info_span!(spans::PROCESSING_CYCLE, batch = limits.batch_size);
        self.processing_batch(now, limits).instrument(span).await
    }

    async fn processing_batch(&self, now: Timestamp, limits: CycleLimits) -> Result<ProcessingCycleReport> {
        let _timer = self.processing_monitor.begin();
        let started = Instant::now();
        let deadline = started + limits.time_budget;
        let batch = self.store.queue().drain(limits.batch_size);
        let mut report = ProcessingCycleReport {
            drained: batch.len(),
            ..ProcessingCycleReport::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        let parallelism = std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
        let mut pending = batch.into_iter();
        let mut in_flight: JoinSet<(NpcId, std::result::Result<ProcessOutcome, String>)> = JoinSet::new();

        loop {
            while in_flight.len() < parallelism {
                if self.cancel.load(Ordering::Acquire) {
                    report.cancelled = true;
                    break;
                }
                if Instant::now() >= deadline {
                    break;
                }
                let Some(npc) = pending.next() else { break };
                let store = Arc::clone(&self.store);
                in_flight.spawn_blocking(move || {
                    let span = info_span!(spans::PROCESS_NPC, npc = %npc);
                    let _enter = span.enter();
                    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| store.process_npc(npc, now)))
                        .map_err(|panic| panic_message(&*panic));
                    (npc, outcome)
                });
            }

            let Some(joined) = in_flight.join_next().await else { break };
            match joined {
                Ok((_, Ok(ProcessOutcome::Processed(summary)))) => {
                    report.processed += 1;
                    report.promoted += summary.promoted.len();
                    report.forgotten += summary.forgotten.len();
                }
                Ok((_, Ok(ProcessOutcome::NoOp | ProcessOutcome::NotResident))) => report.unchanged += 1,
                Ok((npc, Err(message))) => self.record_failure(npc, message, &mut report),
                Err(join_error) => {
                    error!(error = %join_error, "Processing task failed to join");
                    SimCounters::add(&self.counters.processing_failures, 1);
                }
            }
        }

        report.requeued = pending.collect();
        if !report.requeued.is_empty() {
            self.store.queue().requeue_front(&report.requeued);
            warn!(
                requeued = report.requeued.len(),
                cancelled = report.cancelled,
                "Processing batch stopped early"
            );
        }
        report.elapsed = started.elapsed();
        info!(
            drained = report.drained,
            processed = report.processed,
            failed = report.failed.len(),
            promoted = report.promoted,
            forgotten = report.forgotten,
            elapsed_ms = report.elapsed.as_millis(),
            "Processing cycle complete"
        );
        Ok(report)
    }

    // The store rolls back a panic inside memory processing before it reaches
    // here, so short-term memory is intact and the NPC is queued again.
    fn record_failure(&self, npc: NpcId, message: String, report: &mut ProcessingCycleReport) {
        error!(npc = %npc, error = %message, "Processing NPC failed");
        if self.store.queue().enqueue(npc) == Enqueued::Dropped {
            warn!(npc = %npc, "Processing queue full, failed NPC not re-queued");
        }
        SimCounters::add(&self.counters.processing_failures, 1);
        self.bus.publish(Notification::ProcessingFailed {
            npc,
            error: message.clone(),
        });
        report.failed.push((npc, message));
    }

    /// Demote idle NPCs, at most `max_transitions` this call when given
    /// (never more than the configured `transitions_per_cycle`). NPCs
    /// entering the compressed tier have their pending short-term memory
    /// processed and saved.
    ///
    /// # Errors
    /// `SimError::NotRunning`.
    pub fn run_tier_cycle(&self, now: Timestamp, max_transitions: Option<usize>) -> Result<TierCycleReport> {
        self.ensure_running()?;
        let span = info_span!(spans::TIER_CYCLE, max_transitions = ?max_transitions);
        let _enter = span.enter();
        let report = self.tiers.run_cycle_capped(now, max_transitions, Some(&*self.cancel));
        for transition in &report.demotions {
            if transition.to == SimulationTier::Compressed {
                self.store.process_npc(transition.npc, now);
                if let Err(e) = self.store.save_npc(transition.npc) {
                    warn!(npc = %transition.npc, error = %e, "Saving compressed NPC failed; will retry on flush");
                }
            }
        }
        Ok(report)
    }

    /// Decay sweep over resident NPCs, dirty flush, backend housekeeping
    /// and index compaction.
    ///
    /// # Errors
    /// `SimError::NotRunning`.
    pub fn run_maintenance(&self, now: Timestamp) -> Result<MaintenanceCycleReport> {
        self.ensure_running()?;
        let span = info_span!(spans::MAINTENANCE_CYCLE);
        let _enter = span.enter();

        let mut report = MaintenanceCycleReport::default();
        for npc in self.store.npc_ids() {
            if self.cancel.load(Ordering::Acquire) {
                break;
            }
            report.decayed_away += self.store.decay_npc(npc, now);
        }
        report.flush = self.store.flush_dirty();
        report.persistence = match self.persistence.maintain() {
            Ok(maintenance) => Some(maintenance),
            Err(e) => {
                warn!(error = %e, "Persistence maintenance failed");
                None
            }
        };
        report.index_buckets_compacted = self.store.index().compact();
        info!(
            decayed = report.decayed_away,
            saved = report.flush.saved,
            failed = report.flush.failed.len(),
            "Maintenance cycle complete"
        );
        Ok(report)
    }

    /// Queue NPCs in memory-processing tiers that hold pending short-term
    /// memory, and report tier budget status.
    ///
    /// # Errors
    /// `SimError::NotRunning`.
    pub fn run_optimization(&self) -> Result<OptimizationReport> {
        self.ensure_running()?;
        let span = info_span!(spans::OPTIMIZATION_CYCLE);
        let _enter = span.enter();

        let mut enqueued_pending = 0;
        for npc in self.store.npc_ids() {
            let processes = self
                .tiers
                .tier_of(npc)
                .is_none_or(|tier| tier.detail_level().processes_memory);
            let pending = self.store.snapshot(npc).is_some_and(|m| !m.short_term.is_empty());
            if processes && pending && self.store.queue().enqueue(npc) == Enqueued::Queued {
                enqueued_pending += 1;
            }
        }

        let tiers = self.tiers.status();
        for recommendation in &tiers.recommendations {
            warn!(recommendation = %recommendation, "Tier budget recommendation");
        }
        Ok(OptimizationReport {
            tiers,
            queue: self.store.queue().stats(),
            enqueued_pending,
            processing_timings: self.processing_monitor.percentiles(),
        })
    }

    /// Validate and swap in a new configuration between cycles. Persistence
    /// settings take effect on restart only.
    ///
    /// # Errors
    /// `SimError::InvalidConfig`; the old configuration stays in force.
    pub fn reload_config(&self, config: SimConfig) -> Result<()> {
        config.ensure_valid()?;
        self.store.reload_config(config.memory.clone())?;
        self.tiers.reload_config(config.tiers.clone())?;
        if config.persistence != self.config().persistence {
            warn!("Persistence settings changed; they apply after restart");
        }
        *self.config.write() = Arc::new(config);
        info!("Configuration reloaded");
        Ok(())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "processing panicked".to_string())
}
