//! Runtime counters and cycle timing.
//!
//! Counters are plain `AtomicU64`s bumped on the hot path and read on export.
//! Cycle timings keep a small ring buffer behind a `parking_lot::Mutex`,
//! read rarely (dashboards, the optimization cycle).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Counters (lock-free)
// ---------------------------------------------------------------------------

/// Atomic counters for high-frequency events.
#[derive(Debug)]
pub struct SimCounters {
    /// Memory events recorded (one per participant copy).
    pub events_recorded: AtomicU64,
    /// Candidates rejected as invalid input.
    pub events_rejected: AtomicU64,
    /// NPC processing passes completed.
    pub npcs_processed: AtomicU64,
    /// NPC processing passes that failed.
    pub processing_failures: AtomicU64,
    /// Memories promoted to long-term.
    pub memories_promoted: AtomicU64,
    /// Memories forgotten (any cause).
    pub memories_forgotten: AtomicU64,
    /// Relationship records changed.
    pub relationship_updates: AtomicU64,
    /// Tier promotions applied.
    pub tier_promotions: AtomicU64,
    /// Tier demotions applied.
    pub tier_demotions: AtomicU64,
    /// Promotions refused for capacity or budget.
    pub promotions_rejected: AtomicU64,
    /// Save operations completed.
    pub saves_completed: AtomicU64,
    /// Save operations that failed.
    pub save_failures: AtomicU64,
}

impl SimCounters {
    /// Create a new set of zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            events_recorded: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            npcs_processed: AtomicU64::new(0),
            processing_failures: AtomicU64::new(0),
            memories_promoted: AtomicU64::new(0),
            memories_forgotten: AtomicU64::new(0),
            relationship_updates: AtomicU64::new(0),
            tier_promotions: AtomicU64::new(0),
            tier_demotions: AtomicU64::new(0),
            promotions_rejected: AtomicU64::new(0),
            saves_completed: AtomicU64::new(0),
            save_failures: AtomicU64::new(0),
        }
    }

    /// Add `n` to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot all counters for export.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            events_recorded: load(&self.events_recorded),
            events_rejected: load(&self.events_rejected),
            npcs_processed: load(&self.npcs_processed),
            processing_failures: load(&self.processing_failures),
            memories_promoted: load(&self.memories_promoted),
            memories_forgotten: load(&self.memories_forgotten),
            relationship_updates: load(&self.relationship_updates),
            tier_promotions: load(&self.tier_promotions),
            tier_demotions: load(&self.tier_demotions),
            promotions_rejected: load(&self.promotions_rejected),
            saves_completed: load(&self.saves_completed),
            save_failures: load(&self.save_failures),
        }
    }
}

impl Default for SimCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of counter values at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    /// Memory events recorded.
    pub events_recorded: u64,
    /// Candidates rejected.
    pub events_rejected: u64,
    /// NPC processing passes completed.
    pub npcs_processed: u64,
    /// NPC processing failures.
    pub processing_failures: u64,
    /// Memories promoted.
    pub memories_promoted: u64,
    /// Memories forgotten.
    pub memories_forgotten: u64,
    /// Relationship records changed.
    pub relationship_updates: u64,
    /// Tier promotions.
    pub tier_promotions: u64,
    /// Tier demotions.
    pub tier_demotions: u64,
    /// Rejected promotions.
    pub promotions_rejected: u64,
    /// Completed saves.
    pub saves_completed: u64,
    /// Failed saves.
    pub save_failures: u64,
}

impl CounterSnapshot {
    /// Format as Prometheus-compatible text.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let rows: [(&str, &str, u64); 12] = [
            ("npcsim_events_recorded_total", "Memory events recorded", self.events_recorded),
            ("npcsim_events_rejected_total", "Memory candidates rejected as invalid", self.events_rejected),
            ("npcsim_npcs_processed_total", "NPC processing passes completed", self.npcs_processed),
            ("npcsim_processing_failures_total", "NPC processing passes failed", self.processing_failures),
            ("npcsim_memories_promoted_total", "Memories promoted to long-term", self.memories_promoted),
            ("npcsim_memories_forgotten_total", "Memories forgotten", self.memories_forgotten),
            ("npcsim_relationship_updates_total", "Relationship records changed", self.relationship_updates),
            ("npcsim_tier_promotions_total", "Tier promotions applied", self.tier_promotions),
            ("npcsim_tier_demotions_total", "Tier demotions applied", self.tier_demotions),
            ("npcsim_promotions_rejected_total", "Promotions refused for capacity", self.promotions_rejected),
            ("npcsim_saves_completed_total", "Save operations completed", self.saves_completed),
            ("npcsim_save_failures_total", "Save operations failed", self.save_failures),
        ];
        let mut out = String::new();
        for (name, help, value) in rows {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Cycle timing
// ---------------------------------------------------------------------------

const HISTORY: usize = 128;

/// Tracks how long a periodic cycle takes against its time budget.
#[derive(Debug)]
pub struct CycleMonitor {
    budget: Duration,
    history: Mutex<CycleHistory>,
}

#[derive(Debug)]
struct CycleHistory {
    timings_ms: Vec<f64>,
    write_idx: usize,
    count: u64,
    over_budget: u64,
}

/// Percentile statistics for cycle timings.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CyclePercentiles {
    /// Median in milliseconds.
    pub p50: f64,
    /// 95th percentile in milliseconds.
    pub p95: f64,
    /// Maximum in the window.
    pub max: f64,
    /// Fraction of all recorded cycles that exceeded the budget.
    pub over_budget_ratio: f64,
}

impl CycleMonitor {
    /// Create a monitor with a per-cycle budget.
    #[must_use]
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            history: Mutex::new(CycleHistory {
                timings_ms: Vec::with_capacity(HISTORY),
                write_idx: 0,
                count: 0,
                over_budget: 0,
            }),
        }
    }

    /// Begin timing a cycle. The guard records the elapsed time on drop.
    #[must_use]
    pub fn begin(&self) -> CycleGuard<'_> {
        CycleGuard {
            monitor: self,
            start: Instant::now(),
        }
    }

    /// Record a cycle duration.
    pub fn record(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let mut h = self.history.lock();
        if h.timings_ms.len() < HISTORY {
            h.timings_ms.push(ms);
        } else {
            let idx = h.write_idx;
            h.timings_ms[idx] = ms;
        }
        h.write_idx = (h.write_idx + 1) % HISTORY;
        h.count += 1;
        if elapsed > self.budget {
            h.over_budget += 1;
        }
    }

    /// Number of cycles recorded.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.history.lock().count
    }

    /// Percentiles over the recent window.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn percentiles(&self) -> CyclePercentiles {
        let h = self.history.lock();
        if h.timings_ms.is_empty() {
            return CyclePercentiles::default();
        }
        let mut sorted = h.timings_ms.clone();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        CyclePercentiles {
            p50: sorted[n / 2],
            p95: sorted[((n as f64 * 0.95) as usize).min(n - 1)],
            max: sorted[n - 1],
            over_budget_ratio: h.over_budget as f64 / h.count as f64,
        }
    }

    /// The configured budget.
    #[must_use]
    pub const fn budget(&self) -> Duration {
        self.budget
    }
}

/// RAII guard that records elapsed time when dropped.
pub struct CycleGuard<'a> {
    monitor: &'a CycleMonitor,
    start: Instant,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.monitor.record(self.start.elapsed());
    }
}

// ---------------------------------------------------------------------------
// Tracing span names
// ---------------------------------------------------------------------------

/// Span names used with `tracing` spans.
pub mod spans {
    /// Recording one event.
    pub const RECORD_EVENT: &str = "npcsim::memory::record";
    /// Query.
    pub const QUERY: &str = "npcsim::memory::query";
    /// One processing batch.
    pub const PROCESSING_CYCLE: &str = "npcsim::cycle::processing";
    /// One NPC inside a batch.
    pub const PROCESS_NPC: &str = "npcsim::memory::process";
    /// Tier-management cycle.
    pub const TIER_CYCLE: &str = "npcsim::cycle::tier";
    /// Maintenance cycle.
    pub const MAINTENANCE_CYCLE: &str = "npcsim::cycle::maintenance";
    /// Optimization cycle.
    pub const OPTIMIZATION_CYCLE: &str = "npcsim::cycle::optimization";
    /// Persistence save.
    pub const PERSIST_SAVE: &str = "npcsim::persist::save";
    /// Persistence load.
    pub const PERSIST_LOAD: &str = "npcsim::persist::load";
}
