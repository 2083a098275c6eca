//! Configuration for the npcsim core.
//!
//! Maps directly to `npcsim.toml`. Every field has a default, so a partial
//! file (or an empty one) is valid input. Loading and validation are separate
//! steps: [`SimConfig::validate`] collects every issue, and components refuse
//! to start or reload while any remain.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};

/// Top-level configuration, loadable from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,
    /// Per-NPC memory limits, thresholds and importance weights.
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Simulation tier durations, caps and budgets.
    #[serde(default)]
    pub tiers: TierConfig,
    /// Cycle intervals and batch sizes.
    #[serde(default)]
    pub scheduling: ScheduleConfig,
    /// Persistence / save settings.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Telemetry & observability.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl SimConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `SimError::Config` if the TOML is invalid.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| SimError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Collect every validation issue across all sections.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = self.memory.validate();
        issues.extend(self.tiers.validate());
        issues.extend(self.scheduling.validate());
        issues
    }

    /// Validate and turn a non-empty issue list into [`SimError::InvalidConfig`].
    ///
    /// # Errors
    /// Returns `SimError::InvalidConfig` carrying every issue found.
    pub fn ensure_valid(&self) -> Result<()> {
        into_result(self.validate())
    }
}

pub(crate) fn into_result(issues: Vec<ConfigIssue>) -> Result<()> {
    if issues.is_empty() {
        Ok(())
    } else {
        Err(SimError::InvalidConfig { issues })
    }
}

// ---------------------------------------------------------------------------
// Validation issues
// ---------------------------------------------------------------------------

/// Category of a configuration problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Two related values are in the wrong order.
    Ordering,
    /// A value is outside its allowed range.
    OutOfRange,
    /// A value is NaN or infinite.
    NotFinite,
}

/// One configuration problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigIssue {
    /// Dotted path of the offending field, e.g. `tiers.max_tier_1_npcs`.
    pub field: String,
    /// Problem category.
    pub kind: IssueKind,
    /// Human-readable description.
    pub message: String,
}

impl ConfigIssue {
    /// Build an issue.
    #[must_use]
    pub fn new(field: impl Into<String>, kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Default)]
struct IssueSink(Vec<ConfigIssue>);

impl IssueSink {
    fn finite(&mut self, field: &str, value: f64) -> bool {
        if value.is_finite() {
            true
        } else {
            self.0.push(ConfigIssue::new(field, IssueKind::NotFinite, format!("{value} is not a finite number")));
            false
        }
    }

    fn positive(&mut self, field: &str, value: f64) {
        if self.finite(field, value) && value <= 0.0 {
            self.0.push(ConfigIssue::new(field, IssueKind::OutOfRange, format!("must be positive, got {value}")));
        }
    }

    fn non_negative(&mut self, field: &str, value: f64) {
        if self.finite(field, value) && value < 0.0 {
            self.0.push(ConfigIssue::new(field, IssueKind::OutOfRange, format!("must not be negative, got {value}")));
        }
    }

    fn within(&mut self, field: &str, value: f64, lo: f64, hi: f64) {
        if self.finite(field, value) && !(lo..=hi).contains(&value) {
            self.0.push(ConfigIssue::new(field, IssueKind::OutOfRange, format!("must be within [{lo}, {hi}], got {value}")));
        }
    }

    fn nonzero(&mut self, field: &str, value: u64) {
        if value == 0 {
            self.0.push(ConfigIssue::new(field, IssueKind::OutOfRange, "must be greater than zero"));
        }
    }

    fn ordered(&mut self, field: &str, ok: bool, message: String) {
        if !ok {
            self.0.push(ConfigIssue::new(field, IssueKind::Ordering, message));
        }
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// General system settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Whether the simulation is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: default_log_level(),
        }
    }
}

/// Per-NPC memory capacity, compression and decay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Short-term length at which an NPC is queued for processing.
    #[serde(default = "default_short_term_capacity")]
    pub short_term_capacity: usize,
    /// Minimum group size for the aggregate strategy (summarize at twice this).
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    /// Minimum importance for promotion into long-term memory.
    #[serde(default = "default_importance_threshold")]
    pub importance_threshold: f64,
    /// Long-term memories whose decayed importance falls below this are forgotten.
    #[serde(default = "default_forget_threshold")]
    pub forget_threshold: f64,
    /// Decay steepness; importance is multiplied by `exp(-rate * age / max_age)`.
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
    /// Age (hours) that normalises the decay exponent.
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: f64,
    /// Trust change per unit of emotional impact.
    #[serde(default = "default_trust_weight")]
    pub trust_weight: f64,
    /// Result limit when a query does not set one.
    #[serde(default = "default_query_limit")]
    pub default_query_limit: usize,
    /// Importance floor for unfiltered "most recent" queries.
    #[serde(default = "default_recent_floor")]
    pub recent_importance_floor: f64,
    /// Hard cap on long-term memories per NPC; the weakest spill first.
    #[serde(default = "default_max_long_term")]
    pub max_long_term_per_npc: usize,
    /// Maximum characters kept in any text field of a pruned event.
    #[serde(default = "default_prune_chars")]
    pub prune_detail_chars: usize,
    /// Importance scoring weights.
    #[serde(default)]
    pub importance: ImportanceWeights,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_capacity: default_short_term_capacity(),
            compression_threshold: default_compression_threshold(),
            importance_threshold: default_importance_threshold(),
            forget_threshold: default_forget_threshold(),
            decay_rate: default_decay_rate(),
            max_age_hours: default_max_age_hours(),
            trust_weight: default_trust_weight(),
            default_query_limit: default_query_limit(),
            recent_importance_floor: default_recent_floor(),
            max_long_term_per_npc: default_max_long_term(),
            prune_detail_chars: default_prune_chars(),
            importance: ImportanceWeights::default(),
        }
    }
}

impl MemoryConfig {
    /// Collect memory-section issues.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut sink = IssueSink::default();
        sink.nonzero("memory.short_term_capacity", self.short_term_capacity as u64);
        sink.nonzero("memory.compression_threshold", self.compression_threshold as u64);
        sink.nonzero("memory.max_long_term_per_npc", self.max_long_term_per_npc as u64);
        sink.within("memory.importance_threshold", self.importance_threshold, 0.0, 100.0);
        sink.within("memory.forget_threshold", self.forget_threshold, 0.0, 100.0);
        sink.ordered(
            "memory.forget_threshold",
            self.forget_threshold <= self.importance_threshold,
            format!(
                "forget threshold ({}) must not exceed importance threshold ({})",
                self.forget_threshold, self.importance_threshold
            ),
        );
        sink.non_negative("memory.decay_rate", self.decay_rate);
        sink.positive("memory.max_age_hours", self.max_age_hours);
        sink.finite("memory.trust_weight", self.trust_weight);
        sink.within("memory.recent_importance_floor", self.recent_importance_floor, 0.0, 100.0);
        self.importance.check(&mut sink);
        sink.0
    }
}

/// Weights of the importance formula.
///
/// `base + type_weight * type_scale + emotional * |impact|
///  + min(per_participant * (n - 1), participant_cap)
///  + relationship * |avg trust toward the others|
///  + recency * exp(-age_hours / recency_scale_hours)`, clamped to `[0, 100]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportanceWeights {
    /// Starting score for every event.
    #[serde(default = "default_base_importance")]
    pub base: f64,
    /// Multiplier applied to the per-type weight table.
    #[serde(default = "default_one")]
    pub type_scale: f64,
    /// Points per unit of absolute emotional impact.
    #[serde(default = "default_emotional_weight")]
    pub emotional: f64,
    /// Points per additional participant.
    #[serde(default = "default_per_participant")]
    pub per_participant: f64,
    /// Cap on the participant contribution.
    #[serde(default = "default_participant_cap")]
    pub participant_cap: f64,
    /// Points per unit of average trust strength.
    #[serde(default = "default_one")]
    pub relationship: f64,
    /// Points for a brand-new event.
    #[serde(default = "default_recency_weight")]
    pub recency: f64,
    /// Hours over which the recency bonus falls by a factor of e.
    #[serde(default = "default_recency_scale")]
    pub recency_scale_hours: f64,
}

impl Default for ImportanceWeights {
    fn default() -> Self {
        Self {
            base: default_base_importance(),
            type_scale: 1.0,
            emotional: default_emotional_weight(),
            per_participant: default_per_participant(),
            participant_cap: default_participant_cap(),
            relationship: 1.0,
            recency: default_recency_weight(),
            recency_scale_hours: default_recency_scale(),
        }
    }
}

impl ImportanceWeights {
    fn check(&self, sink: &mut IssueSink) {
        sink.finite("memory.importance.base", self.base);
        sink.non_negative("memory.importance.type_scale", self.type_scale);
        sink.non_negative("memory.importance.emotional", self.emotional);
        sink.non_negative("memory.importance.per_participant", self.per_participant);
        sink.non_negative("memory.importance.participant_cap", self.participant_cap);
        sink.non_negative("memory.importance.relationship", self.relationship);
        sink.non_negative("memory.importance.recency", self.recency);
        sink.positive("memory.importance.recency_scale_hours", self.recency_scale_hours);
    }
}

/// What happens when a promotion to tier 1 arrives while tier 1 is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier1OverflowPolicy {
    /// Refuse the newcomer; it stays where it is.
    #[default]
    Reject,
    /// Demote the tier-1 NPC with the oldest interaction (outside its grace
    /// period) to tier 2 and admit the newcomer.
    EvictLeastRecentlyInteracted,
}

/// Which signals may lift an NPC out of the statistical tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier4RestorePolicy {
    /// Tier 4 is permanent.
    Never,
    /// Only a direct interaction restores the NPC.
    #[default]
    DirectInteraction,
    /// Direct interaction or POI activation.
    AnySignal,
}

/// CPU and memory cost of one NPC in a tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierCost {
    /// Abstract CPU units per NPC.
    pub cpu_units: f64,
    /// Resident memory per NPC in megabytes.
    pub memory_mb: f64,
}

/// Per-tier costs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierCostTable {
    /// Tier 1 (active).
    #[serde(default = "default_cost_tier_1")]
    pub tier_1: TierCost,
    /// Tier 2 (background).
    #[serde(default = "default_cost_tier_2")]
    pub tier_2: TierCost,
    /// Tier 3 (dormant).
    #[serde(default = "default_cost_tier_3")]
    pub tier_3: TierCost,
    /// Tier 3.5 (compressed).
    #[serde(default = "default_cost_tier_3_5")]
    pub tier_3_5: TierCost,
    /// Tier 4 (statistical).
    #[serde(default = "default_cost_tier_4")]
    pub tier_4: TierCost,
}

impl Default for TierCostTable {
    fn default() -> Self {
        Self {
            tier_1: default_cost_tier_1(),
            tier_2: default_cost_tier_2(),
            tier_3: default_cost_tier_3(),
            tier_3_5: default_cost_tier_3_5(),
            tier_4: default_cost_tier_4(),
        }
    }
}

/// Simulation tier configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Hours in tier 1 without a signal before demotion to tier 2.
    #[serde(default = "default_tier_1_hours")]
    pub tier_1_duration_hours: f64,
    /// Hours since the last signal before a tier-2 NPC drops to tier 3.
    /// Cumulative: the clock keeps running from the last signal, not from
    /// entry into tier 2.
    #[serde(default = "default_tier_2_hours")]
    pub tier_2_duration_hours: f64,
    /// Hours in tier 3 before compression.
    #[serde(default = "default_tier_3_hours")]
    pub tier_3_duration_hours: f64,
    /// Hours in tier 3.5 before the NPC becomes statistical.
    #[serde(default = "default_tier_3_5_hours")]
    pub tier_3_5_duration_hours: f64,
    /// System-wide tier-1 cap.
    #[serde(default = "default_max_tier_1")]
    pub max_tier_1_npcs: usize,
    /// System-wide tier-2 cap.
    #[serde(default = "default_max_tier_2")]
    pub max_tier_2_npcs: usize,
    /// Cap on visible NPCs (tiers 1 through 3).
    #[serde(default = "default_max_visible")]
    pub max_visible_npcs: usize,
    /// Total CPU units available to tier-1 and tier-2 NPCs.
    #[serde(default = "default_cpu_budget")]
    pub total_cpu_budget: f64,
    /// Total memory (MB) available to tier-1 and tier-2 NPCs.
    #[serde(default = "default_memory_budget")]
    pub total_memory_budget_mb: f64,
    /// Fraction of both budgets held back as an emergency reserve.
    #[serde(default = "default_reserve")]
    pub emergency_reserve_ratio: f64,
    /// Demotion protection after a direct interaction (minutes).
    #[serde(default = "default_interaction_grace")]
    pub interaction_grace_minutes: f64,
    /// Demotion protection after a POI activation (minutes).
    #[serde(default = "default_poi_grace")]
    pub poi_grace_minutes: f64,
    /// Upper bound on demotions per tier cycle.
    #[serde(default = "default_transitions_per_cycle")]
    pub transitions_per_cycle: usize,
    /// Tier-1 overflow handling.
    #[serde(default)]
    pub overflow_policy: Tier1OverflowPolicy,
    /// Tier-4 restoration handling.
    #[serde(default)]
    pub restore_policy: Tier4RestorePolicy,
    /// Per-tier costs.
    #[serde(default)]
    pub costs: TierCostTable,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            tier_1_duration_hours: default_tier_1_hours(),
            tier_2_duration_hours: default_tier_2_hours(),
            tier_3_duration_hours: default_tier_3_hours(),
            tier_3_5_duration_hours: default_tier_3_5_hours(),
            max_tier_1_npcs: default_max_tier_1(),
            max_tier_2_npcs: default_max_tier_2(),
            max_visible_npcs: default_max_visible(),
            total_cpu_budget: default_cpu_budget(),
            total_memory_budget_mb: default_memory_budget(),
            emergency_reserve_ratio: default_reserve(),
            interaction_grace_minutes: default_interaction_grace(),
            poi_grace_minutes: default_poi_grace(),
            transitions_per_cycle: default_transitions_per_cycle(),
            overflow_policy: Tier1OverflowPolicy::default(),
            restore_policy: Tier4RestorePolicy::default(),
            costs: TierCostTable::default(),
        }
    }
}

impl TierConfig {
    /// Collect tier-section issues. An empty list means the tier manager may start.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut sink = IssueSink::default();

        sink.positive("tiers.tier_1_duration_hours", self.tier_1_duration_hours);
        sink.positive("tiers.tier_2_duration_hours", self.tier_2_duration_hours);
        sink.positive("tiers.tier_3_duration_hours", self.tier_3_duration_hours);
        sink.positive("tiers.tier_3_5_duration_hours", self.tier_3_5_duration_hours);
        sink.ordered(
            "tiers.tier_1_duration_hours",
            self.tier_1_duration_hours < self.tier_2_duration_hours,
            format!(
                "tier 1 duration ({}h) must be shorter than tier 2 duration ({}h)",
                self.tier_1_duration_hours, self.tier_2_duration_hours
            ),
        );
        sink.ordered(
            "tiers.tier_2_duration_hours",
            self.tier_2_duration_hours < self.tier_3_duration_hours,
            format!(
                "tier 2 duration ({}h) must be shorter than tier 3 duration ({}h)",
                self.tier_2_duration_hours, self.tier_3_duration_hours
            ),
        );
        sink.ordered(
            "tiers.tier_3_duration_hours",
            self.tier_3_duration_hours < self.tier_3_5_duration_hours,
            format!(
                "tier 3 duration ({}h) must be shorter than tier 3.5 duration ({}h)",
                self.tier_3_duration_hours, self.tier_3_5_duration_hours
            ),
        );

        sink.nonzero("tiers.max_tier_1_npcs", self.max_tier_1_npcs as u64);
        sink.ordered(
            "tiers.max_tier_1_npcs",
            self.max_tier_1_npcs <= self.max_tier_2_npcs,
            format!(
                "max tier 1 NPCs ({}) must not exceed max tier 2 NPCs ({})",
                self.max_tier_1_npcs, self.max_tier_2_npcs
            ),
        );
        sink.ordered(
            "tiers.max_tier_2_npcs",
            self.max_tier_2_npcs <= self.max_visible_npcs,
            format!(
                "max tier 2 NPCs ({}) must not exceed max visible NPCs ({})",
                self.max_tier_2_npcs, self.max_visible_npcs
            ),
        );

        sink.positive("tiers.total_cpu_budget", self.total_cpu_budget);
        sink.positive("tiers.total_memory_budget_mb", self.total_memory_budget_mb);
        if sink.finite("tiers.emergency_reserve_ratio", self.emergency_reserve_ratio)
            && !(0.0..1.0).contains(&self.emergency_reserve_ratio)
        {
            sink.0.push(ConfigIssue::new(
                "tiers.emergency_reserve_ratio",
                IssueKind::OutOfRange,
                format!("must be within [0, 1), got {}", self.emergency_reserve_ratio),
            ));
        }
        sink.non_negative("tiers.interaction_grace_minutes", self.interaction_grace_minutes);
        sink.non_negative("tiers.poi_grace_minutes", self.poi_grace_minutes);
        sink.nonzero("tiers.transitions_per_cycle", self.transitions_per_cycle as u64);

        for (name, cost) in [
            ("tier_1", self.costs.tier_1),
            ("tier_2", self.costs.tier_2),
            ("tier_3", self.costs.tier_3),
            ("tier_3_5", self.costs.tier_3_5),
            ("tier_4", self.costs.tier_4),
        ] {
            sink.non_negative(&format!("tiers.costs.{name}.cpu_units"), cost.cpu_units);
            sink.non_negative(&format!("tiers.costs.{name}.memory_mb"), cost.memory_mb);
        }

        sink.0
    }

    /// CPU units usable by promotions once the reserve is held back.
    #[must_use]
    pub fn usable_cpu_budget(&self) -> f64 {
        self.total_cpu_budget * (1.0 - self.emergency_reserve_ratio)
    }

    /// Memory (MB) usable by promotions once the reserve is held back.
    #[must_use]
    pub fn usable_memory_budget_mb(&self) -> f64 {
        self.total_memory_budget_mb * (1.0 - self.emergency_reserve_ratio)
    }
}

/// Cycle intervals for the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between memory-processing batches.
    #[serde(default = "default_processing_interval")]
    pub processing_interval_secs: u64,
    /// NPCs drained from the processing queue per batch.
    #[serde(default = "default_batch_size")]
    pub processing_batch_size: usize,
    /// Upper bound on NPCs waiting in the processing queue.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Wall-clock budget for one processing batch (milliseconds).
    #[serde(default = "default_batch_time_budget")]
    pub processing_time_budget_ms: u64,
    /// Seconds between tier-management cycles.
    #[serde(default = "default_tier_interval")]
    pub tier_interval_secs: u64,
    /// Seconds between maintenance cycles (flush, backups).
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
    /// Seconds between optimization cycles (budget review).
    #[serde(default = "default_optimization_interval")]
    pub optimization_interval_secs: u64,
    /// Re-read the config file when it changes on disk.
    #[serde(default = "default_true")]
    pub hot_reload: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            processing_interval_secs: default_processing_interval(),
            processing_batch_size: default_batch_size(),
            max_queue_size: default_max_queue_size(),
            processing_time_budget_ms: default_batch_time_budget(),
            tier_interval_secs: default_tier_interval(),
            maintenance_interval_secs: default_maintenance_interval(),
            optimization_interval_secs: default_optimization_interval(),
            hot_reload: true,
        }
    }
}

impl ScheduleConfig {
    /// Collect scheduling-section issues.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut sink = IssueSink::default();
        sink.nonzero("scheduling.processing_interval_secs", self.processing_interval_secs);
        sink.nonzero("scheduling.processing_batch_size", self.processing_batch_size as u64);
        sink.nonzero("scheduling.max_queue_size", self.max_queue_size as u64);
        sink.nonzero("scheduling.processing_time_budget_ms", self.processing_time_budget_ms);
        sink.nonzero("scheduling.tier_interval_secs", self.tier_interval_secs);
        sink.nonzero("scheduling.maintenance_interval_secs", self.maintenance_interval_secs);
        sink.nonzero("scheduling.optimization_interval_secs", self.optimization_interval_secs);
        sink.0
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    /// SQLite database file.
    #[default]
    Sqlite,
    /// Process memory only (tests, demos).
    Memory,
}

/// On-disk encoding of an NPC memory blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobEncoding {
    /// Human-readable JSON.
    #[default]
    Json,
    /// Compact bincode.
    Bincode,
}

/// Persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Which backend to open.
    #[serde(default)]
    pub backend: PersistenceBackend,
    /// Database path for the SQLite backend.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Use WAL mode for concurrent reads.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
    /// Blob encoding.
    #[serde(default)]
    pub encoding: BlobEncoding,
    /// Number of rotating backups kept by maintenance.
    #[serde(default = "default_3")]
    pub backup_count: u32,
    /// Detect save corruption via checksums.
    #[serde(default = "default_true")]
    pub checksum_enabled: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::default(),
            path: default_db_path(),
            wal_mode: true,
            encoding: BlobEncoding::default(),
            backup_count: 3,
            checksum_enabled: true,
        }
    }
}

/// Telemetry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub json_logs: bool,
    /// Keep and expose the in-process counters.
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    /// Capacity of the notification broadcast channel.
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json_logs: false,
            metrics_enabled: true,
            notification_capacity: default_notification_capacity(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default value helpers (for serde)
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_one() -> f64 {
    1.0
}
fn default_3() -> u32 {
    3
}
fn default_short_term_capacity() -> usize {
    20
}
fn default_compression_threshold() -> usize {
    5
}
fn default_importance_threshold() -> f64 {
    60.0
}
fn default_forget_threshold() -> f64 {
    20.0
}
fn default_decay_rate() -> f64 {
    2.0
}
fn default_max_age_hours() -> f64 {
    720.0
}
fn default_trust_weight() -> f64 {
    0.2
}
fn default_query_limit() -> usize {
    10
}
fn default_recent_floor() -> f64 {
    10.0
}
fn default_max_long_term() -> usize {
    500
}
fn default_prune_chars() -> usize {
    48
}
fn default_base_importance() -> f64 {
    50.0
}
fn default_emotional_weight() -> f64 {
    20.0
}
fn default_per_participant() -> f64 {
    2.0
}
fn default_participant_cap() -> f64 {
    10.0
}
fn default_recency_weight() -> f64 {
    5.0
}
fn default_recency_scale() -> f64 {
    24.0
}
fn default_tier_1_hours() -> f64 {
    1.0
}
fn default_tier_2_hours() -> f64 {
    11.0
}
fn default_tier_3_hours() -> f64 {
    168.0
}
fn default_tier_3_5_hours() -> f64 {
    720.0
}
fn default_max_tier_1() -> usize {
    100
}
fn default_max_tier_2() -> usize {
    1000
}
fn default_max_visible() -> usize {
    100_000
}
fn default_cpu_budget() -> f64 {
    3500.0
}
fn default_memory_budget() -> f64 {
    2048.0
}
fn default_reserve() -> f64 {
    0.1
}
fn default_interaction_grace() -> f64 {
    15.0
}
fn default_poi_grace() -> f64 {
    30.0
}
fn default_transitions_per_cycle() -> usize {
    1000
}
fn default_cost_tier_1() -> TierCost {
    TierCost { cpu_units: 10.0, memory_mb: 2.5 }
}
fn default_cost_tier_2() -> TierCost {
    TierCost { cpu_units: 2.0, memory_mb: 1.0 }
}
fn default_cost_tier_3() -> TierCost {
    TierCost { cpu_units: 0.1, memory_mb: 0.2 }
}
fn default_cost_tier_3_5() -> TierCost {
    TierCost { cpu_units: 0.02, memory_mb: 0.05 }
}
fn default_cost_tier_4() -> TierCost {
    TierCost { cpu_units: 0.0, memory_mb: 0.0 }
}
fn default_processing_interval() -> u64 {
    5
}
fn default_batch_size() -> usize {
    50
}
fn default_max_queue_size() -> usize {
    10_000
}
fn default_batch_time_budget() -> u64 {
    2_000
}
fn default_tier_interval() -> u64 {
    180
}
fn default_maintenance_interval() -> u64 {
    3600
}
fn default_optimization_interval() -> u64 {
    7200
}
fn default_db_path() -> PathBuf {
    PathBuf::from("npcsim.db")
}
fn default_notification_capacity() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SimConfig::default();
        assert!(config.validate().is_empty(), "{:?}", config.validate());
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = SimConfig::from_toml("").expect("parse");
        assert_eq!(config, SimConfig::default());
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config = SimConfig::from_toml(
            r#"
            [memory]
            compression_threshold = 3

            [tiers]
            max_tier_1_npcs = 4
            overflow_policy = "evict_least_recently_interacted"

            [tiers.costs.tier_1]
            cpu_units = 12.0
            memory_mb = 3.0
            "#,
        )
        .expect("parse");
        assert_eq!(config.memory.compression_threshold, 3);
        assert_eq!(config.memory.short_term_capacity, 20);
        assert_eq!(config.tiers.max_tier_1_npcs, 4);
        assert_eq!(config.tiers.overflow_policy, Tier1OverflowPolicy::EvictLeastRecentlyInteracted);
        assert!((config.tiers.costs.tier_1.cpu_units - 12.0).abs() < f64::EPSILON);
        assert!((config.tiers.costs.tier_2.cpu_units - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = SimConfig::from_toml("[tiers\nmax_tier_1_npcs = ").expect_err("must fail");
        assert!(matches!(err, SimError::Config(_)));
    }

    #[test]
    fn duration_ordering_violation_is_reported() {
        let tiers = TierConfig {
            tier_1_duration_hours: 20.0,
            tier_2_duration_hours: 11.0,
            ..TierConfig::default()
        };
        let issues = tiers.validate();
        assert!(!issues.is_empty());
        assert!(issues
            .iter()
            .any(|i| i.field == "tiers.tier_1_duration_hours" && i.kind == IssueKind::Ordering));
    }

    #[test]
    fn capacity_ordering_violation_is_reported() {
        let tiers = TierConfig {
            max_tier_1_npcs: 2000,
            ..TierConfig::default()
        };
        let issues = tiers.validate();
        assert!(issues.iter().any(|i| i.field == "tiers.max_tier_1_npcs"));
    }

    #[test]
    fn reserve_ratio_of_one_is_rejected() {
        let tiers = TierConfig {
            emergency_reserve_ratio: 1.0,
            ..TierConfig::default()
        };
        let issues = tiers.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::OutOfRange);
    }

    #[test]
    fn nan_values_are_not_finite() {
        let memory = MemoryConfig {
            decay_rate: f64::NAN,
            ..MemoryConfig::default()
        };
        let issues = memory.validate();
        assert!(issues.iter().any(|i| i.kind == IssueKind::NotFinite));
    }

    #[test]
    fn ensure_valid_aggregates_sections() {
        let mut config = SimConfig::default();
        config.memory.compression_threshold = 0;
        config.scheduling.processing_batch_size = 0;
        match config.ensure_valid() {
            Err(SimError::InvalidConfig { issues }) => assert_eq!(issues.len(), 2),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn usable_budget_holds_back_reserve() {
        let tiers = TierConfig::default();
        assert!((tiers.usable_cpu_budget() - 3150.0).abs() < 1e-9);
    }
}
