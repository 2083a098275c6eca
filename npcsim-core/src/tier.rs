//! Simulation tiers: which NPCs get full simulation and which fade into
//! background state.
//!
//! ```text
//! Tier1Active ──▶ Tier2Background ──▶ Tier3Dormant ──▶ Tier3_5Compressed ──▶ Tier4Statistical
//!      ▲                 ▲                                                        │
//!      └── interaction ──┴──────────── POI activation / restoration ◀─────────────┘
//! ```
//!
//! Promotion happens on an [`ActivationSignal`]; demotion happens in
//! [`TierManager::run_cycle`] once an NPC has gone longer than its tier's
//! duration without a signal and outside any grace period.
//!
//! Per-tier counts and the CPU/memory ledger are the only state shared across
//! NPCs. They are atomics updated by compare-and-swap, so concurrent
//! transitions on different NPCs never overshoot a cap. Each NPC's assignment
//! sits behind its own mutex. A reader/writer gate lets a config reload
//! recompute the ledger while no transition is in flight.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Tier1OverflowPolicy, Tier4RestorePolicy, TierConfig, TierCost, into_result};
use crate::error::Result;
use crate::metrics::SimCounters;
use crate::notify::{Notification, NotificationBus};
use crate::types::{NpcId, PoiId, Timestamp, hours, hours_between};

// ---------------------------------------------------------------------------
// Tiers
// ---------------------------------------------------------------------------

/// Simulation detail tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SimulationTier {
    /// Full simulation near the player.
    #[serde(rename = "tier_1_active")]
    Active,
    /// Simplified simulation, still individually tracked.
    #[serde(rename = "tier_2_background")]
    Background,
    /// State frozen, updated rarely.
    #[serde(rename = "tier_3_dormant")]
    Dormant,
    /// Memories and state compressed.
    #[serde(rename = "tier_3_5_compressed")]
    Compressed,
    /// Only population statistics remain.
    #[serde(rename = "tier_4_statistical")]
    Statistical,
}

impl SimulationTier {
    /// All tiers, most detailed first.
    pub const ALL: [Self; 5] = [
        Self::Active,
        Self::Background,
        Self::Dormant,
        Self::Compressed,
        Self::Statistical,
    ];

    const fn slot(self) -> usize {
        match self {
            Self::Active => 0,
            Self::Background => 1,
            Self::Dormant => 2,
            Self::Compressed => 3,
            Self::Statistical => 4,
        }
    }

    /// Next tier down, `None` for the statistical tier.
    #[must_use]
    pub const fn demoted(self) -> Option<Self> {
        match self {
            Self::Active => Some(Self::Background),
            Self::Background => Some(Self::Dormant),
            Self::Dormant => Some(Self::Compressed),
            Self::Compressed => Some(Self::Statistical),
            Self::Statistical => None,
        }
    }

    /// Whether the NPC counts toward the visible population.
    #[must_use]
    pub const fn is_visible(self) -> bool {
        matches!(self, Self::Active | Self::Background | Self::Dormant)
    }

    /// Whether the NPC draws from the CPU/memory budget.
    #[must_use]
    pub const fn is_budgeted(self) -> bool {
        matches!(self, Self::Active | Self::Background)
    }

    /// Stable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "tier_1_active",
            Self::Background => "tier_2_background",
            Self::Dormant => "tier_3_dormant",
            Self::Compressed => "tier_3_5_compressed",
            Self::Statistical => "tier_4_statistical",
        }
    }

    /// Per-NPC cost of this tier.
    #[must_use]
    pub const fn cost(self, config: &TierConfig) -> TierCost {
        match self {
            Self::Active => config.costs.tier_1,
            Self::Background => config.costs.tier_2,
            Self::Dormant => config.costs.tier_3,
            Self::Compressed => config.costs.tier_3_5,
            Self::Statistical => config.costs.tier_4,
        }
    }

    /// How much the rest of the simulation should compute for this NPC.
    #[must_use]
    pub const fn detail_level(self) -> DetailLevel {
        match self {
            Self::Active => DetailLevel {
                ai_updates_per_minute: 60,
                processes_memory: true,
                tracks_individual_state: true,
                renders_schedule: true,
            },
            Self::Background => DetailLevel {
                ai_updates_per_minute: 6,
                processes_memory: true,
                tracks_individual_state: true,
                renders_schedule: true,
            },
            Self::Dormant => DetailLevel {
                ai_updates_per_minute: 0,
                processes_memory: false,
                tracks_individual_state: true,
                renders_schedule: false,
            },
            Self::Compressed => DetailLevel {
                ai_updates_per_minute: 0,
                processes_memory: false,
                tracks_individual_state: true,
                renders_schedule: false,
            },
            Self::Statistical => DetailLevel {
                ai_updates_per_minute: 0,
                processes_memory: false,
                tracks_individual_state: false,
                renders_schedule: false,
            },
        }
    }

    fn duration_hours(self, config: &TierConfig) -> Option<f64> {
        match self {
            Self::Active => Some(config.tier_1_duration_hours),
            Self::Background => Some(config.tier_2_duration_hours),
            Self::Dormant => Some(config.tier_3_duration_hours),
            Self::Compressed => Some(config.tier_3_5_duration_hours),
            Self::Statistical => None,
        }
    }

    fn cap(self, config: &TierConfig) -> usize {
        match self {
            Self::Active => config.max_tier_1_npcs,
            Self::Background => config.max_tier_2_npcs,
            _ => usize::MAX,
        }
    }
}

impl fmt::Display for SimulationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the external simulation should compute for an NPC in a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailLevel {
    /// Decision-making updates per game minute.
    pub ai_updates_per_minute: u32,
    /// Whether the NPC's memory is processed.
    pub processes_memory: bool,
    /// Whether the NPC keeps individual state (inventory, position).
    pub tracks_individual_state: bool,
    /// Whether daily schedules are simulated.
    pub renders_schedule: bool,
}

// ---------------------------------------------------------------------------
// Assignments, signals, outcomes
// ---------------------------------------------------------------------------

/// One NPC's tier state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierAssignment {
    /// The NPC.
    pub npc_id: NpcId,
    /// Current tier.
    pub tier: SimulationTier,
    /// When the NPC entered the current tier.
    pub entered_at: Timestamp,
    /// Latest qualifying signal, if any.
    pub last_signal_at: Option<Timestamp>,
    /// Demotion is suppressed until this time.
    pub grace_until: Option<Timestamp>,
    /// Home point of interest.
    pub poi: Option<PoiId>,
    /// Whether the NPC has ever been in tier 1 or 2.
    pub ever_active: bool,
}

impl TierAssignment {
    fn in_grace(&self, now: Timestamp) -> bool {
        self.grace_until.is_some_and(|until| now < until)
    }

    /// The moment the current tier's demotion clock started.
    ///
    /// Tier 1 counts from entry or the latest signal. Tier 2 counts from the
    /// latest signal, so its duration includes the time spent in tier 1.
    /// Lower tiers count from entry.
    fn demotion_anchor(&self) -> Timestamp {
        match self.tier {
            SimulationTier::Active => self.last_signal_at.map_or(self.entered_at, |s| s.max(self.entered_at)),
            SimulationTier::Background => self.last_signal_at.unwrap_or(self.entered_at),
            _ => self.entered_at,
        }
    }

    fn refresh(&mut self, now: Timestamp, grace_minutes: f64) {
        self.last_signal_at = Some(now);
        let until = now + hours(grace_minutes / 60.0);
        self.grace_until = Some(self.grace_until.map_or(until, |g| g.max(until)));
    }
}

/// A qualifying promotion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationSignal {
    /// A player (or active NPC) interacted directly.
    DirectInteraction,
    /// The NPC was activated by proximity to a point of interest.
    PoiActivation {
        /// The activating POI.
        poi: PoiId,
    },
}

impl ActivationSignal {
    fn grace_minutes(self, config: &TierConfig) -> f64 {
        match self {
            Self::DirectInteraction => config.interaction_grace_minutes,
            Self::PoiActivation { .. } => config.poi_grace_minutes,
        }
    }

    const fn cause(self) -> TransitionCause {
        match self {
            Self::DirectInteraction => TransitionCause::Interaction,
            Self::PoiActivation { .. } => TransitionCause::PoiActivation,
        }
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// First registration.
    Registration,
    /// Direct interaction.
    Interaction,
    /// POI activation or player entering a POI.
    PoiActivation,
    /// Tier duration elapsed.
    Timeout,
    /// Displaced from tier 1 by a newer promotion.
    Eviction,
}

/// Why a promotion was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Tier 1 is at `max_tier_1_npcs`.
    Tier1Full,
    /// Tier 2 is at `max_tier_2_npcs`.
    Tier2Full,
    /// The visible population is at `max_visible_npcs`.
    VisibleFull,
    /// Not enough CPU budget outside the emergency reserve.
    CpuBudget,
    /// Not enough memory budget outside the emergency reserve.
    MemoryBudget,
    /// The restoration policy does not accept this signal for a tier-4 NPC.
    InsufficientSignal,
}

impl RejectReason {
    /// Whether retrying later may succeed once capacity frees up.
    #[must_use]
    pub const fn is_capacity(self) -> bool {
        !matches!(self, Self::InsufficientSignal)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Tier1Full => "tier 1 is full",
            Self::Tier2Full => "tier 2 is full",
            Self::VisibleFull => "visible population is full",
            Self::CpuBudget => "CPU budget exhausted",
            Self::MemoryBudget => "memory budget exhausted",
            Self::InsufficientSignal => "signal too weak to restore a statistical NPC",
        };
        f.write_str(s)
    }
}

/// A completed tier change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTransition {
    /// The NPC.
    pub npc: NpcId,
    /// Previous tier (`None` on registration).
    pub from: Option<SimulationTier>,
    /// New tier.
    pub to: SimulationTier,
    /// Why.
    pub cause: TransitionCause,
}

/// Result of a promotion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierOutcome {
    /// The NPC moved up.
    Promoted(TierTransition),
    /// Already at or above the target; grace clock reset.
    Refreshed {
        /// Current tier.
        tier: SimulationTier,
    },
    /// Refused; the NPC stays in `tier`.
    Rejected {
        /// Why.
        reason: RejectReason,
        /// Where the NPC is now.
        tier: SimulationTier,
    },
}

impl TierOutcome {
    /// Tier the NPC is in after the request.
    #[must_use]
    pub const fn tier(&self) -> SimulationTier {
        match self {
            Self::Promoted(t) => t.to,
            Self::Refreshed { tier } | Self::Rejected { tier, .. } => *tier,
        }
    }

    /// Whether the request was refused.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Summary of one tier-management cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierCycleReport {
    /// NPCs examined.
    pub examined: usize,
    /// Demotions applied, in order.
    pub demotions: Vec<TierTransition>,
    /// Overdue NPCs spared by a grace period.
    pub protected_by_grace: usize,
    /// Overdue NPCs left for the next cycle (transition cap or cancellation).
    pub deferred: usize,
    /// Whether the cycle stopped early on request.
    pub cancelled: bool,
}

/// Budget and population snapshot with scaling advice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierStatus {
    /// NPC count per tier.
    pub counts: BTreeMap<SimulationTier, usize>,
    /// All tracked NPCs.
    pub total_npcs: usize,
    /// NPCs in tiers 1 through 3.
    pub visible_npcs: usize,
    /// CPU units held by tiers 1 and 2.
    pub budgeted_cpu: f64,
    /// Usable CPU budget after the reserve.
    pub cpu_limit: f64,
    /// Memory (MB) held by tiers 1 and 2.
    pub budgeted_memory_mb: f64,
    /// Usable memory budget after the reserve.
    pub memory_limit_mb: f64,
    /// CPU units across all tiers.
    pub total_cpu_load: f64,
    /// Memory (MB) across all tiers.
    pub total_memory_mb: f64,
    /// `visible / total`, 0 when empty.
    pub visible_ratio: f64,
    /// Human-readable tuning advice.
    pub recommendations: Vec<String>,
}

// ---------------------------------------------------------------------------
// Shared counters
// ---------------------------------------------------------------------------

fn try_increment(counter: &AtomicUsize, cap: usize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < cap).then_some(n + 1))
        .is_ok()
}

fn decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_fixed(value: f64) -> u64 {
    (value.max(0.0) * 1000.0).round() as u64
}

#[allow(clippy::cast_precision_loss)]
fn from_fixed(value: u64) -> f64 {
    value as f64 / 1000.0
}

/// CPU and memory held by tier-1 and tier-2 NPCs, in thousandths.
#[derive(Debug, Default)]
struct BudgetLedger {
    cpu_used: AtomicU64,
    cpu_limit: AtomicU64,
    mem_used: AtomicU64,
    mem_limit: AtomicU64,
}

impl BudgetLedger {
    fn set_limits(&self, config: &TierConfig) {
        self.cpu_limit.store(to_fixed(config.usable_cpu_budget()), Ordering::Release);
        self.mem_limit.store(to_fixed(config.usable_memory_budget_mb()), Ordering::Release);
    }

    fn reserve(used: &AtomicU64, limit: u64, amount: u64) -> bool {
        amount == 0
            || used
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| {
                    u.checked_add(amount).filter(|n| *n <= limit)
                })
                .is_ok()
    }

    fn release(used: &AtomicU64, amount: u64) {
        let _ = used.fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| Some(u.saturating_sub(amount)));
    }

    /// Move from holding `from` to holding `to`. Increases must fit under the
    /// limits; decreases always succeed.
    fn adjust(&self, from: TierCost, to: TierCost) -> std::result::Result<(), RejectReason> {
        let (cpu_from, cpu_to) = (to_fixed(from.cpu_units), to_fixed(to.cpu_units));
        let (mem_from, mem_to) = (to_fixed(from.memory_mb), to_fixed(to.memory_mb));

        let cpu_up = cpu_to.saturating_sub(cpu_from);
        if !Self::reserve(&self.cpu_used, self.cpu_limit.load(Ordering::Acquire), cpu_up) {
            return Err(RejectReason::CpuBudget);
        }
        let mem_up = mem_to.saturating_sub(mem_from);
        if !Self::reserve(&self.mem_used, self.mem_limit.load(Ordering::Acquire), mem_up) {
            Self::release(&self.cpu_used, cpu_up);
            return Err(RejectReason::MemoryBudget);
        }
        Self::release(&self.cpu_used, cpu_from.saturating_sub(cpu_to));
        Self::release(&self.mem_used, mem_from.saturating_sub(mem_to));
        Ok(())
    }
}

const ZERO_COST: TierCost = TierCost {
    cpu_units: 0.0,
    memory_mb: 0.0,
};

fn budget_cost(tier: Option<SimulationTier>, config: &TierConfig) -> TierCost {
    tier.filter(|t| t.is_budgeted()).map_or(ZERO_COST, |t| t.cost(config))
}

// ---------------------------------------------------------------------------
// TierManager
// ---------------------------------------------------------------------------

/// Owns every NPC's tier assignment.
pub struct TierManager {
    config: RwLock<Arc<TierConfig>>,
    assignments: DashMap<NpcId, Arc<Mutex<TierAssignment>>>,
    poi_members: DashMap<PoiId, Vec<NpcId>>,
    counts: [AtomicUsize; 5],
    visible: AtomicUsize,
    ledger: BudgetLedger,
    gate: RwLock<()>,
    bus: NotificationBus,
    counters: Arc<SimCounters>,
}

impl fmt::Debug for TierManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TierManager")
            .field("npcs", &self.assignments.len())
            .field("counts", &self.counts())
            .finish_non_exhaustive()
    }
}

impl TierManager {
    /// Build a manager. Refuses to start on an invalid configuration.
    ///
    /// # Errors
    /// Returns `SimError::InvalidConfig` listing every issue.
    pub fn new(config: TierConfig) -> Result<Self> {
        Self::with_observers(config, NotificationBus::new(256), Arc::new(SimCounters::new()))
    }

    /// Build a manager that publishes to `bus` and counts into `counters`.
    ///
    /// # Errors
    /// Returns `SimError::InvalidConfig` listing every issue.
    pub fn with_observers(config: TierConfig, bus: NotificationBus, counters: Arc<SimCounters>) -> Result<Self> {
        into_result(config.validate())?;
        let ledger = BudgetLedger::default();
        ledger.set_limits(&config);
        info!(
            max_tier_1 = config.max_tier_1_npcs,
            max_tier_2 = config.max_tier_2_npcs,
            cpu_budget = config.usable_cpu_budget(),
            "Tier manager started"
        );
        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            assignments: DashMap::new(),
            poi_members: DashMap::new(),
            counts: Default::default(),
            visible: AtomicUsize::new(0),
            ledger,
            gate: RwLock::new(()),
            bus,
            counters,
        })
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> Arc<TierConfig> {
        Arc::clone(&self.config.read())
    }

    /// Current tier of `npc`.
    #[must_use]
    pub fn tier_of(&self, npc: NpcId) -> Option<SimulationTier> {
        self.slot(npc).map(|a| a.lock().tier)
    }

    /// Copy of `npc`'s assignment.
    #[must_use]
    pub fn assignment(&self, npc: NpcId) -> Option<TierAssignment> {
        self.slot(npc).map(|a| a.lock().clone())
    }

    // Map guards are dropped before any assignment is locked, so a thread
    // holding an assignment never waits on a map shard held by a thread
    // waiting on that assignment.
    fn slot(&self, npc: NpcId) -> Option<Arc<Mutex<TierAssignment>>> {
        self.assignments.get(&npc).map(|a| Arc::clone(a.value()))
    }

    fn slots(&self) -> Vec<Arc<Mutex<TierAssignment>>> {
        self.assignments.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// NPC count per tier.
    #[must_use]
    pub fn counts(&self) -> BTreeMap<SimulationTier, usize> {
        SimulationTier::ALL
            .iter()
            .map(|t| (*t, self.counts[t.slot()].load(Ordering::Acquire)))
            .collect()
    }

    /// Number of tracked NPCs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    /// Whether no NPC is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a population NPC at the statistical tier, optionally tied to
    /// a POI. Already-known NPCs keep their tier.
    pub fn register_npc(&self, npc: NpcId, poi: Option<PoiId>, now: Timestamp) -> SimulationTier {
        let _gate = self.gate.read();
        let mut created = false;
        let entry = Arc::clone(
            self.assignments
                .entry(npc)
                .or_insert_with(|| {
                    created = true;
                    Arc::new(Mutex::new(TierAssignment {
                        npc_id: npc,
                        tier: SimulationTier::Statistical,
                        entered_at: now,
                        last_signal_at: None,
                        grace_until: None,
                        poi,
                        ever_active: false,
                    }))
                })
                .value(),
        );
        let tier = entry.lock().tier;
        if created {
            self.counts[SimulationTier::Statistical.slot()].fetch_add(1, Ordering::AcqRel);
            if let Some(poi) = poi {
                self.poi_members.entry(poi).or_default().push(npc);
            }
            self.publish(TierTransition {
                npc,
                from: None,
                to: SimulationTier::Statistical,
                cause: TransitionCause::Registration,
            });
        }
        tier
    }

    /// Stop tracking `npc`, releasing its tier slot and budget.
    pub fn remove_npc(&self, npc: NpcId) -> Option<SimulationTier> {
        let _gate = self.gate.read();
        let (_, slot) = self.assignments.remove(&npc)?;
        let assignment = slot.lock();
        let config = self.config();
        decrement(&self.counts[assignment.tier.slot()]);
        if assignment.tier.is_visible() {
            decrement(&self.visible);
        }
        let _ = self.ledger.adjust(budget_cost(Some(assignment.tier), &config), ZERO_COST);
        if let Some(mut members) = assignment.poi.and_then(|poi| self.poi_members.get_mut(&poi)) {
            members.retain(|m| *m != npc);
        }
        Some(assignment.tier)
    }

    /// NPCs registered at `poi`, optionally filtered by tier.
    #[must_use]
    pub fn npcs_at_poi(&self, poi: PoiId, tier: Option<SimulationTier>) -> Vec<NpcId> {
        let members = self.poi_members.get(&poi).map(|m| m.clone()).unwrap_or_default();
        members
            .into_iter()
            .filter(|npc| tier.is_none_or(|t| self.tier_of(*npc) == Some(t)))
            .collect()
    }

    // ------------------------------------------------------------------
    // Promotion
    // ------------------------------------------------------------------

    /// Apply a qualifying signal: move `npc` to tier 1 (or refresh its grace
    /// period if already there). Unknown NPCs enter directly; if that is
    /// refused they are placed in tier 3 (tier 4 when the visible population
    /// is full) and the rejection is returned.
    pub fn signal(&self, npc: NpcId, signal: ActivationSignal, now: Timestamp) -> TierOutcome {
        self.promote_to(npc, SimulationTier::Active, signal, now)
    }

    /// A player entered `poi`: every NPC registered there below tier 2 is
    /// lifted to tier 2, and NPCs already in tier 1 or 2 get a fresh POI
    /// grace period. Returns each NPC's outcome.
    pub fn player_enters_poi(&self, poi: PoiId, now: Timestamp) -> Vec<(NpcId, TierOutcome)> {
        let members = self.npcs_at_poi(poi, None);
        let outcomes: Vec<(NpcId, TierOutcome)> = members
            .into_iter()
            .map(|npc| {
                let outcome = self.promote_to(npc, SimulationTier::Background, ActivationSignal::PoiActivation { poi }, now);
                (npc, outcome)
            })
            .collect();
        let lifted = outcomes.iter().filter(|(_, o)| matches!(o, TierOutcome::Promoted(_))).count();
        info!(poi = %poi, npcs = outcomes.len(), lifted, "Player entered POI");
        outcomes
    }

    fn promote_to(&self, npc: NpcId, target: SimulationTier, signal: ActivationSignal, now: Timestamp) -> TierOutcome {
        let _gate = self.gate.read();
        let config = self.config();

        let Some(slot) = self.slot(npc) else {
            return self.admit_new(npc, target, signal, now, &config);
        };
        let mut assignment = slot.lock();
        let current = assignment.tier;

        if current <= target {
            assignment.refresh(now, signal.grace_minutes(&config));
            return TierOutcome::Refreshed { tier: current };
        }

        if current == SimulationTier::Statistical && assignment.ever_active {
            let allowed = match config.restore_policy {
                Tier4RestorePolicy::Never => false,
                Tier4RestorePolicy::DirectInteraction => signal == ActivationSignal::DirectInteraction,
                Tier4RestorePolicy::AnySignal => true,
            };
            if !allowed {
                return self.reject(npc, RejectReason::InsufficientSignal, current);
            }
        }

        let mut result = self.try_move(&config, Some(current), target);
        if result == Err(RejectReason::Tier1Full)
            && config.overflow_policy == Tier1OverflowPolicy::EvictLeastRecentlyInteracted
            && self.evict_one(npc, now, &config)
        {
            result = self.try_move(&config, Some(current), target);
        }

        match result {
            Ok(()) => {
                assignment.tier = target;
                assignment.entered_at = now;
                assignment.ever_active = true;
                assignment.refresh(now, signal.grace_minutes(&config));
                let transition = TierTransition {
                    npc,
                    from: Some(current),
                    to: target,
                    cause: signal.cause(),
                };
                SimCounters::add(&self.counters.tier_promotions, 1);
                self.publish(transition);
                TierOutcome::Promoted(transition)
            }
            Err(reason) => self.reject(npc, reason, current),
        }
    }

    fn admit_new(
        &self,
        npc: NpcId,
        target: SimulationTier,
        signal: ActivationSignal,
        now: Timestamp,
        config: &TierConfig,
    ) -> TierOutcome {
        let mut result = self.try_move(config, None, target);
        if result == Err(RejectReason::Tier1Full)
            && config.overflow_policy == Tier1OverflowPolicy::EvictLeastRecentlyInteracted
            && self.evict_one(npc, now, config)
        {
            result = self.try_move(config, None, target);
        }

        let (tier, rejection) = match result {
            Ok(()) => (target, None),
            Err(reason) => {
                let fallback = if self.try_move(config, None, SimulationTier::Dormant).is_ok() {
                    SimulationTier::Dormant
                } else {
                    self.counts[SimulationTier::Statistical.slot()].fetch_add(1, Ordering::AcqRel);
                    SimulationTier::Statistical
                };
                (fallback, Some(reason))
            }
        };

        let mut assignment = TierAssignment {
            npc_id: npc,
            tier,
            entered_at: now,
            last_signal_at: None,
            grace_until: None,
            poi: match signal {
                ActivationSignal::PoiActivation { poi } => Some(poi),
                ActivationSignal::DirectInteraction => None,
            },
            ever_active: tier.is_budgeted(),
        };
        assignment.refresh(now, signal.grace_minutes(config));

        // Lost a race with a concurrent first signal for the same NPC: undo
        // our reservation and treat it as a refresh of theirs.
        let mut inserted = false;
        self.assignments.entry(npc).or_insert_with(|| {
            inserted = true;
            Arc::new(Mutex::new(assignment.clone()))
        });
        if !inserted {
            self.release_slot(tier, config);
            let current = self.tier_of(npc).unwrap_or(tier);
            return TierOutcome::Refreshed { tier: current };
        }

        if let Some(poi) = assignment.poi {
            self.poi_members.entry(poi).or_default().push(npc);
        }
        let transition = TierTransition {
            npc,
            from: None,
            to: tier,
            cause: signal.cause(),
        };
        self.publish(transition);
        match rejection {
            None => {
                SimCounters::add(&self.counters.tier_promotions, 1);
                TierOutcome::Promoted(transition)
            }
            Some(reason) => self.reject(npc, reason, tier),
        }
    }

    fn reject(&self, npc: NpcId, reason: RejectReason, tier: SimulationTier) -> TierOutcome {
        SimCounters::add(&self.counters.promotions_rejected, 1);
        debug!(npc = %npc, reason = %reason, tier = %tier, "Promotion rejected");
        self.bus.publish(Notification::PromotionRejected { npc, reason, tier });
        TierOutcome::Rejected { reason, tier }
    }

    /// Demote the least recently signalled tier-1 NPC outside its grace
    /// period (ties: earliest entry, then id). Busy NPCs are skipped.
    fn evict_one(&self, requester: NpcId, now: Timestamp, config: &TierConfig) -> bool {
        let mut candidates: Vec<(Timestamp, Timestamp, NpcId, Arc<Mutex<TierAssignment>>)> = self
            .slots()
            .into_iter()
            .filter_map(|slot| {
                let key = {
                    let a = slot.try_lock()?;
                    (a.npc_id != requester && a.tier == SimulationTier::Active && !a.in_grace(now))
                        .then(|| (a.last_signal_at.unwrap_or(a.entered_at), a.entered_at, a.npc_id))?
                };
                Some((key.0, key.1, key.2, slot))
            })
            .collect();
        candidates.sort_by(|x, y| (x.0, x.1, x.2).cmp(&(y.0, y.1, y.2)));

        for (_, _, victim, slot) in candidates {
            let Some(mut a) = slot.try_lock() else { continue };
            if a.tier != SimulationTier::Active || a.in_grace(now) {
                continue;
            }
            if let Some(to) = self.demote_locked(&mut a, now, config, TransitionCause::Eviction) {
                info!(victim = %victim, to = %to, for_npc = %requester, "Evicted tier 1 NPC");
                return true;
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Demotion cycle
    // ------------------------------------------------------------------

    /// Demote every NPC whose tier duration has elapsed without a signal and
    /// outside grace, one step each, up to `transitions_per_cycle`. The most
    /// overdue go first. Setting `cancel` stops the cycle between NPCs.
    pub fn run_cycle(&self, now: Timestamp, cancel: Option<&AtomicBool>) -> TierCycleReport {
        self.run_cycle_capped(now, None, cancel)
    }

    /// [`TierManager::run_cycle`] with a per-call transition cap. The
    /// effective cap is the smaller of `max_transitions` and
    /// `transitions_per_cycle`.
    pub fn run_cycle_capped(
        &self,
        now: Timestamp,
        max_transitions: Option<usize>,
        cancel: Option<&AtomicBool>,
    ) -> TierCycleReport {
        let _gate = self.gate.read();
        let config = self.config();
        let cap = max_transitions.map_or(config.transitions_per_cycle, |m| m.min(config.transitions_per_cycle));
        let mut report = TierCycleReport::default();

        let mut overdue: Vec<(f64, NpcId, Arc<Mutex<TierAssignment>>)> = Vec::new();
        for slot in self.slots() {
            report.examined += 1;
            let a = slot.lock();
            let Some(limit) = a.tier.duration_hours(&config) else { continue };
            let over = hours_between(a.demotion_anchor(), now) - limit;
            if over <= 0.0 {
                continue;
            }
            if a.in_grace(now) {
                report.protected_by_grace += 1;
                continue;
            }
            let npc = a.npc_id;
            drop(a);
            overdue.push((over, npc, slot));
        }
        overdue.sort_by(|x, y| y.0.total_cmp(&x.0).then_with(|| x.1.cmp(&y.1)));

        let total = overdue.len();
        for (done, (_, npc, slot)) in overdue.into_iter().enumerate() {
            if report.demotions.len() >= cap {
                report.deferred = total - done;
                break;
            }
            if cancel.is_some_and(|c| c.load(Ordering::Acquire)) {
                report.cancelled = true;
                report.deferred = total - done;
                break;
            }
            let mut a = slot.lock();
            // Re-check under the lock: a signal may have landed meanwhile.
            let still_due = a
                .tier
                .duration_hours(&config)
                .is_some_and(|limit| hours_between(a.demotion_anchor(), now) > limit && !a.in_grace(now));
            if !still_due {
                continue;
            }
            let from = a.tier;
            if let Some(to) = self.demote_locked(&mut a, now, &config, TransitionCause::Timeout) {
                report.demotions.push(TierTransition {
                    npc,
                    from: Some(from),
                    to,
                    cause: TransitionCause::Timeout,
                });
            }
        }

        if !report.demotions.is_empty() || report.deferred > 0 {
            info!(
                examined = report.examined,
                demoted = report.demotions.len(),
                deferred = report.deferred,
                grace = report.protected_by_grace,
                "Tier cycle complete"
            );
        }
        report
    }

    /// Move a locked assignment one step down. Tier 1 falls through to tier 3
    /// when tier 2 is full.
    fn demote_locked(
        &self,
        a: &mut TierAssignment,
        now: Timestamp,
        config: &TierConfig,
        cause: TransitionCause,
    ) -> Option<SimulationTier> {
        let from = a.tier;
        let mut to = from.demoted()?;
        if self.try_move(config, Some(from), to).is_err() {
            to = to.demoted()?;
            if let Err(reason) = self.try_move(config, Some(from), to) {
                warn!(npc = %a.npc_id, from = %from, reason = %reason, "Demotion blocked");
                return None;
            }
        }
        a.tier = to;
        a.entered_at = now;
        if cause == TransitionCause::Eviction {
            a.grace_until = None;
        }
        SimCounters::add(&self.counters.tier_demotions, 1);
        self.publish(TierTransition {
            npc: a.npc_id,
            from: Some(from),
            to,
            cause,
        });
        Some(to)
    }

    // ------------------------------------------------------------------
    // Capacity accounting
    // ------------------------------------------------------------------

    /// Reserve `to`'s slot and budget, then release `from`'s. All or nothing.
    fn try_move(
        &self,
        config: &TierConfig,
        from: Option<SimulationTier>,
        to: SimulationTier,
    ) -> std::result::Result<(), RejectReason> {
        if !try_increment(&self.counts[to.slot()], to.cap(config)) {
            return Err(match to {
                SimulationTier::Active => RejectReason::Tier1Full,
                _ => RejectReason::Tier2Full,
            });
        }
        let gains_visibility = to.is_visible() && !from.is_some_and(SimulationTier::is_visible);
        if gains_visibility && !try_increment(&self.visible, config.max_visible_npcs) {
            decrement(&self.counts[to.slot()]);
            return Err(RejectReason::VisibleFull);
        }
        if let Err(reason) = self.ledger.adjust(budget_cost(from, config), budget_cost(Some(to), config)) {
            decrement(&self.counts[to.slot()]);
            if gains_visibility {
                decrement(&self.visible);
            }
            return Err(reason);
        }
        if let Some(from) = from {
            decrement(&self.counts[from.slot()]);
            if from.is_visible() && !to.is_visible() {
                decrement(&self.visible);
            }
        }
        Ok(())
    }

    fn release_slot(&self, tier: SimulationTier, config: &TierConfig) {
        decrement(&self.counts[tier.slot()]);
        if tier.is_visible() {
            decrement(&self.visible);
        }
        let _ = self.ledger.adjust(budget_cost(Some(tier), config), ZERO_COST);
    }

    fn publish(&self, transition: TierTransition) {
        debug!(
            npc = %transition.npc,
            from = ?transition.from,
            to = %transition.to,
            cause = ?transition.cause,
            "Tier transition"
        );
        self.bus.publish(Notification::TierTransition(transition));
    }

    // ------------------------------------------------------------------
    // Configuration & status
    // ------------------------------------------------------------------

    /// Swap in a new configuration between cycles.
    ///
    /// The new configuration is validated first; on failure the old one stays
    /// in force. Budget usage is recomputed from current assignments so that
    /// changed tier costs take effect immediately. NPCs above a lowered cap
    /// stay where they are; new promotions wait until the population drops.
    ///
    /// # Errors
    /// Returns `SimError::InvalidConfig` listing every issue.
    pub fn reload_config(&self, config: TierConfig) -> Result<()> {
        into_result(config.validate())?;
        let _gate = self.gate.write();

        let (mut cpu, mut mem) = (0u64, 0u64);
        for slot in self.slots() {
            let cost = budget_cost(Some(slot.lock().tier), &config);
            cpu += to_fixed(cost.cpu_units);
            mem += to_fixed(cost.memory_mb);
        }
        self.ledger.cpu_used.store(cpu, Ordering::Release);
        self.ledger.mem_used.store(mem, Ordering::Release);
        self.ledger.set_limits(&config);
        info!(
            max_tier_1 = config.max_tier_1_npcs,
            max_tier_2 = config.max_tier_2_npcs,
            cpu_budget = config.usable_cpu_budget(),
            cpu_used = from_fixed(cpu),
            "Tier configuration reloaded"
        );
        *self.config.write() = Arc::new(config);
        Ok(())
    }

    /// Population and budget snapshot with scaling recommendations.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn status(&self) -> TierStatus {
        let config = self.config();
        let counts = self.counts();
        let total_npcs: usize = counts.values().sum();
        let visible_npcs = self.visible.load(Ordering::Acquire);
        let (total_cpu_load, total_memory_mb) = counts.iter().fold((0.0, 0.0), |(cpu, mem), (tier, n)| {
            let cost = tier.cost(&config);
            (cpu + cost.cpu_units * *n as f64, mem + cost.memory_mb * *n as f64)
        });
        let budgeted_cpu = from_fixed(self.ledger.cpu_used.load(Ordering::Acquire));
        let budgeted_memory_mb = from_fixed(self.ledger.mem_used.load(Ordering::Acquire));
        let cpu_limit = config.usable_cpu_budget();
        let memory_limit_mb = config.usable_memory_budget_mb();
        let visible_ratio = if total_npcs == 0 {
            0.0
        } else {
            visible_npcs as f64 / total_npcs as f64
        };

        let mut recommendations = Vec::new();
        let tier_1 = counts.get(&SimulationTier::Active).copied().unwrap_or(0);
        if tier_1 as f64 >= 0.9 * config.max_tier_1_npcs as f64 {
            recommendations.push(format!(
                "tier 1 at {tier_1}/{}: shorten tier_1_duration_hours or raise max_tier_1_npcs",
                config.max_tier_1_npcs
            ));
        }
        if budgeted_cpu >= 0.9 * cpu_limit {
            recommendations.push(format!(
                "CPU budget {budgeted_cpu:.1}/{cpu_limit:.1} units: demote background NPCs sooner or raise total_cpu_budget"
            ));
        }
        if budgeted_memory_mb >= 0.9 * memory_limit_mb {
            recommendations.push(format!(
                "memory budget {budgeted_memory_mb:.1}/{memory_limit_mb:.1} MB: compress dormant NPCs sooner"
            ));
        }
        if visible_npcs as f64 >= 0.9 * config.max_visible_npcs as f64 {
            recommendations.push(format!(
                "visible population {visible_npcs}/{}: shorten tier_3_duration_hours",
                config.max_visible_npcs
            ));
        }

        TierStatus {
            counts,
            total_npcs,
            visible_npcs,
            budgeted_cpu,
            cpu_limit,
            budgeted_memory_mb,
            memory_limit_mb,
            total_cpu_load,
            total_memory_mb,
            visible_ratio,
            recommendations,
        }
    }
}
