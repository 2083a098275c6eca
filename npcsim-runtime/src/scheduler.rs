//! Periodic driver for the simulation service.
//!
//! The core never schedules itself. [`Scheduler::run`] owns four tokio
//! intervals (processing, tier, maintenance, optimization), reads "now"
//! from a [`Clock`], and stops when the shutdown channel flips. Each tick is
//! also callable directly, which is how the demo and tests drive simulated
//! time.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use npcsim_core::config::SimConfig;
use npcsim_core::service::{
    CycleLimits, MaintenanceCycleReport, MemoryService, OptimizationReport, ProcessingCycleReport,
};
use npcsim_core::tier::TierCycleReport;
use npcsim_core::{Result, SimError};

use crate::clock::Clock;

/// Cycles run by one [`Scheduler::run`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Processing batches run.
    pub processing_cycles: u64,
    /// Tier cycles run.
    pub tier_cycles: u64,
    /// Maintenance cycles run.
    pub maintenance_cycles: u64,
    /// Optimization cycles run.
    pub optimization_cycles: u64,
    /// Configuration reloads applied.
    pub reloads: u64,
}

/// Watches a config file's modification time.
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Watch `path`, treating its current state as already loaded.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_modified = modified(&path);
        Self { path, last_modified }
    }

    /// The watched file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The parsed file if it changed since the last poll. A file that fails
    /// to parse is reported once and skipped until it changes again.
    pub fn poll(&mut self) -> Option<SimConfig> {
        let current = modified(&self.path);
        if current.is_none() || current == self.last_modified {
            return None;
        }
        self.last_modified = current;
        match SimConfig::from_file(&self.path) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Config file changed but could not be parsed");
                None
            }
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Drives a [`MemoryService`]'s cycles.
#[derive(Debug)]
pub struct Scheduler {
    service: Arc<MemoryService>,
    clock: Arc<dyn Clock>,
    watcher: Option<Mutex<ConfigWatcher>>,
}

impl Scheduler {
    /// Schedule `service` against `clock`.
    #[must_use]
    pub fn new(service: Arc<MemoryService>, clock: Arc<dyn Clock>) -> Self {
        Self {
            service,
            clock,
            watcher: None,
        }
    }

    /// Reload configuration from `path` when it changes on disk (checked on
    /// each tier cycle, if `scheduling.hot_reload` is set).
    #[must_use]
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.watcher = Some(Mutex::new(ConfigWatcher::new(path)));
        self
    }

    /// The driven service.
    #[must_use]
    pub fn service(&self) -> &Arc<MemoryService> {
        &self.service
    }

    // ------------------------------------------------------------------
    // Single ticks
    // ------------------------------------------------------------------

    /// One processing batch with the configured limits.
    ///
    /// # Errors
    /// `SimError::NotRunning`.
    pub async fn processing_tick(&self) -> Result<ProcessingCycleReport> {
        let limits = CycleLimits::from_config(&self.service.config());
        self.service.run_processing_cycle(self.clock.now(), limits).await
    }

    /// Apply a pending config change, then run one tier cycle.
    ///
    /// # Errors
    /// `SimError::NotRunning`.
    pub fn tier_tick(&self) -> Result<TierCycleReport> {
        self.check_reload();
        self.service.run_tier_cycle(self.clock.now(), None)
    }

    /// One maintenance cycle.
    ///
    /// # Errors
    /// `SimError::NotRunning`.
    pub fn maintenance_tick(&self) -> Result<MaintenanceCycleReport> {
        self.service.run_maintenance(self.clock.now())
    }

    /// One optimization cycle.
    ///
    /// # Errors
    /// `SimError::NotRunning`.
    pub fn optimization_tick(&self) -> Result<OptimizationReport> {
        self.service.run_optimization()
    }

    /// Reload from the watched file if it changed. Returns whether a new
    /// configuration was applied.
    pub fn check_reload(&self) -> bool {
        let Some(watcher) = &self.watcher else {
            return false;
        };
        if !self.service.config().scheduling.hot_reload {
            return false;
        }
        let Some(config) = watcher.lock().poll() else {
            return false;
        };
        match self.service.reload_config(config) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Rejected reloaded configuration; keeping the current one");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------

    /// Run every cycle on its interval until `shutdown` becomes `true`, the
    /// sender is dropped, or the service stops. Intervals are read once at
    /// start; interval changes apply on the next run.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> SchedulerStats {
        let schedule = self.service.config().scheduling.clone();
        let mut processing = interval(schedule.processing_interval_secs);
        let mut tiers = interval(schedule.tier_interval_secs);
        let mut maintenance = interval(schedule.maintenance_interval_secs);
        let mut optimization = interval(schedule.optimization_interval_secs);
        let mut stats = SchedulerStats::default();
        info!(
            processing_secs = schedule.processing_interval_secs,
            tier_secs = schedule.tier_interval_secs,
            "Scheduler started"
        );

        loop {
            let outcome = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = processing.tick() => {
                    stats.processing_cycles += 1;
                    self.processing_tick().await.map(drop)
                }
                _ = tiers.tick() => {
                    stats.tier_cycles += 1;
                    let reloaded = self.check_reload();
                    stats.reloads += u64::from(reloaded);
                    self.service.run_tier_cycle(self.clock.now(), None).map(drop)
                }
                _ = maintenance.tick() => {
                    stats.maintenance_cycles += 1;
                    self.maintenance_tick().map(drop)
                }
                _ = optimization.tick() => {
                    stats.optimization_cycles += 1;
                    self.optimization_tick().map(drop)
                }
            };
            match outcome {
                Ok(()) => {}
                Err(SimError::NotRunning) => {
                    debug!("Service stopped; scheduler exiting");
                    break;
                }
                Err(e) => warn!(error = %e, "Scheduled cycle failed"),
            }
        }

        info!(?stats, "Scheduler stopped");
        stats
    }
}

fn interval(secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(secs.max(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}
