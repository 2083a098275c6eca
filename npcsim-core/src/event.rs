//! Memory events: the typed payload, the shared envelope, and the candidate
//! that callers hand to [`crate::store::MemoryStore::add_memory_event`].
//!
//! Each [`EventDetails`] variant carries only the fields its event type
//! needs. The envelope ([`MemoryEvent`]) carries what every event shares.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::types::{Location, MemoryId, NpcId, Timestamp};

// ---------------------------------------------------------------------------
// Event type
// ---------------------------------------------------------------------------

/// Category of a memory event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Fights, threats, ambushes.
    Conflict,
    /// Quest progress.
    Quest,
    /// Personal accomplishments.
    Achievement,
    /// An explicit shift in how two actors regard each other.
    RelationshipChange,
    /// Standing changes with a faction.
    FactionEvent,
    /// Buying, selling, bartering.
    Trade,
    /// Conversation and casual contact.
    Interaction,
    /// A choice the NPC made.
    Decision,
    /// Something the NPC merely saw.
    Observation,
    /// World-scale happenings (storms, invasions, festivals).
    WorldEvent,
}

impl EventType {
    /// All event types, highest weight first.
    pub const ALL: [Self; 10] = [
        Self::Conflict,
        Self::Quest,
        Self::Achievement,
        Self::FactionEvent,
        Self::RelationshipChange,
        Self::WorldEvent,
        Self::Decision,
        Self::Trade,
        Self::Interaction,
        Self::Observation,
    ];

    /// Importance points contributed by the event type.
    #[must_use]
    pub const fn weight(self) -> f64 {
        match self {
            Self::Conflict | Self::Quest => 20.0,
            Self::Achievement => 15.0,
            Self::FactionEvent => 12.0,
            Self::RelationshipChange | Self::WorldEvent => 10.0,
            Self::Decision => 8.0,
            Self::Trade => 5.0,
            Self::Interaction => 3.0,
            Self::Observation => 1.0,
        }
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::Quest => "quest",
            Self::Achievement => "achievement",
            Self::RelationshipChange => "relationship_change",
            Self::FactionEvent => "faction_event",
            Self::Trade => "trade",
            Self::Interaction => "interaction",
            Self::Decision => "decision",
            Self::Observation => "observation",
            Self::WorldEvent => "world_event",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Typed payload
// ---------------------------------------------------------------------------

/// Per-type event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDetails {
    /// A fight.
    Conflict {
        /// Damage dealt over the encounter.
        damage: f64,
        /// How it ended ("fled", "victory", "stalemate").
        outcome: String,
    },
    /// Quest progress.
    Quest {
        /// Quest name.
        quest: String,
        /// Stage reached ("accepted", "completed").
        stage: String,
    },
    /// A personal accomplishment.
    Achievement {
        /// Short title.
        title: String,
    },
    /// A relationship shift.
    RelationshipChange {
        /// What changed.
        description: String,
    },
    /// A faction standing change.
    FactionEvent {
        /// Faction name.
        faction: String,
        /// Signed standing change.
        standing_change: f64,
    },
    /// A trade.
    Trade {
        /// Goods exchanged.
        item: String,
        /// Units exchanged.
        quantity: u32,
        /// Total price paid.
        price: f64,
    },
    /// A conversation or casual contact.
    Interaction {
        /// What it was about.
        topic: String,
    },
    /// A decision.
    Decision {
        /// What was chosen.
        choice: String,
    },
    /// Something seen.
    Observation {
        /// What was seen.
        subject: String,
    },
    /// A world-scale happening.
    WorldEvent {
        /// What happened.
        description: String,
    },
}

impl EventDetails {
    /// The event type this payload belongs to.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::Conflict { .. } => EventType::Conflict,
            Self::Quest { .. } => EventType::Quest,
            Self::Achievement { .. } => EventType::Achievement,
            Self::RelationshipChange { .. } => EventType::RelationshipChange,
            Self::FactionEvent { .. } => EventType::FactionEvent,
            Self::Trade { .. } => EventType::Trade,
            Self::Interaction { .. } => EventType::Interaction,
            Self::Decision { .. } => EventType::Decision,
            Self::Observation { .. } => EventType::Observation,
            Self::WorldEvent { .. } => EventType::WorldEvent,
        }
    }

    /// Whether every numeric field is finite.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        match self {
            Self::Conflict { damage, .. } => damage.is_finite(),
            Self::FactionEvent { standing_change, .. } => standing_change.is_finite(),
            Self::Trade { price, .. } => price.is_finite(),
            _ => true,
        }
    }

    /// Fold the key details of `other` (same type, later in time) into `self`.
    ///
    /// Quantities accumulate; descriptive fields keep the latest value.
    /// Payloads of a different type are ignored.
    pub fn absorb(&mut self, other: &Self) {
        match (self, other) {
            (
                Self::Conflict { damage, outcome },
                Self::Conflict { damage: d, outcome: o },
            ) => {
                *damage += d;
                outcome.clone_from(o);
            }
            (Self::Quest { stage, .. }, Self::Quest { stage: s, .. }) => stage.clone_from(s),
            (
                Self::FactionEvent { standing_change, .. },
                Self::FactionEvent { standing_change: c, .. },
            ) => *standing_change += c,
            (
                Self::Trade { item, quantity, price },
                Self::Trade { item: i, quantity: q, price: p },
            ) => {
                if !item.split(", ").any(|known| known == i.as_str()) {
                    item.push_str(", ");
                    item.push_str(i);
                }
                *quantity = quantity.saturating_add(*q);
                *price += p;
            }
            (Self::Interaction { topic }, Self::Interaction { topic: t })
                if !topic.split(", ").any(|known| known == t.as_str()) =>
            {
                topic.push_str(", ");
                topic.push_str(t);
            }
            _ => {}
        }
    }

    /// A copy with every text field cut to at most `max_chars` characters.
    #[must_use]
    pub fn essentials(&self, max_chars: usize) -> Self {
        let cut = |s: &str| -> String { s.chars().take(max_chars).collect() };
        match self {
            Self::Conflict { damage, outcome } => Self::Conflict { damage: *damage, outcome: cut(outcome) },
            Self::Quest { quest, stage } => Self::Quest { quest: cut(quest), stage: cut(stage) },
            Self::Achievement { title } => Self::Achievement { title: cut(title) },
            Self::RelationshipChange { description } => Self::RelationshipChange { description: cut(description) },
            Self::FactionEvent { faction, standing_change } => Self::FactionEvent {
                faction: cut(faction),
                standing_change: *standing_change,
            },
            Self::Trade { item, quantity, price } => Self::Trade {
                item: cut(item),
                quantity: *quantity,
                price: *price,
            },
            Self::Interaction { topic } => Self::Interaction { topic: cut(topic) },
            Self::Decision { choice } => Self::Decision { choice: cut(choice) },
            Self::Observation { subject } => Self::Observation { subject: cut(subject) },
            Self::WorldEvent { description } => Self::WorldEvent { description: cut(description) },
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// How a memory came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOrigin {
    /// Recorded directly from a gameplay event.
    #[default]
    Observed,
    /// Synthesised from a large group of similar events.
    Summarized {
        /// Timestamp of the earliest constituent.
        first: Timestamp,
        /// Timestamp of the latest constituent.
        last: Timestamp,
        /// Number of constituents.
        count: usize,
    },
    /// A representative event with details merged from its group.
    Aggregated {
        /// Number of constituents, representative included.
        count: usize,
    },
    /// Stripped down to essential fields.
    Pruned,
}

/// A scored memory event as held by one NPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// Identifier, unique per owning NPC.
    pub id: MemoryId,
    /// When the event happened (latest constituent for summaries).
    pub timestamp: Timestamp,
    /// Typed payload.
    pub details: EventDetails,
    /// Importance as scored for the owner, in `[0, 100]`.
    pub importance: f64,
    /// Importance after decay; equals `importance` until decay runs.
    pub current_importance: f64,
    /// Everyone involved, owner included. Never empty.
    pub participants: Vec<NpcId>,
    /// Where it happened, if known.
    pub location: Option<Location>,
    /// Emotional impact in `[-1, 1]`.
    pub emotional_impact: f64,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Related memories (constituents of a summary or aggregate).
    pub related_memories: Vec<MemoryId>,
    /// Optional free text.
    pub notes: Option<String>,
    /// How the memory was produced.
    pub origin: MemoryOrigin,
}

impl MemoryEvent {
    /// Shorthand for `self.details.event_type()`.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.details.event_type()
    }

    /// Participants in sorted order without duplicates.
    #[must_use]
    pub fn participant_set(&self) -> Vec<NpcId> {
        let mut set = self.participants.clone();
        set.sort_unstable();
        set.dedup();
        set
    }

    /// Check the envelope invariants.
    ///
    /// # Errors
    /// Returns `SimError::InvalidEvent` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.participants.is_empty() {
            return Err(invalid("event has no participants"));
        }
        if !(0.0..=100.0).contains(&self.importance) || !(0.0..=100.0).contains(&self.current_importance) {
            return Err(invalid(format!("importance {} outside [0, 100]", self.importance)));
        }
        if !(-1.0..=1.0).contains(&self.emotional_impact) {
            return Err(invalid(format!("emotional impact {} outside [-1, 1]", self.emotional_impact)));
        }
        if !self.details.is_well_formed() {
            return Err(invalid(format!("{} payload has a non-finite field", self.event_type())));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> SimError {
    SimError::InvalidEvent { reason: reason.into() }
}

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// A gameplay event before it has an id or an importance score.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryCandidate {
    /// Typed payload.
    pub details: EventDetails,
    /// Everyone involved. Duplicates are dropped during validation.
    pub participants: Vec<NpcId>,
    /// Where it happened.
    pub location: Option<Location>,
    /// Emotional impact; clamped into `[-1, 1]`.
    pub emotional_impact: f64,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Optional free text.
    pub notes: Option<String>,
    /// When it happened; defaults to the `now` passed at recording time.
    pub timestamp: Option<Timestamp>,
}

impl MemoryCandidate {
    /// Start a candidate for `details` involving `participants`.
    #[must_use]
    pub fn new(details: EventDetails, participants: impl IntoIterator<Item = NpcId>) -> Self {
        Self {
            details,
            participants: participants.into_iter().collect(),
            location: None,
            emotional_impact: 0.0,
            tags: Vec::new(),
            notes: None,
            timestamp: None,
        }
    }

    /// Set the location.
    #[must_use]
    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Set the emotional impact.
    #[must_use]
    pub fn with_emotional_impact(mut self, impact: f64) -> Self {
        self.emotional_impact = impact;
        self
    }

    /// Add tags.
    #[must_use]
    pub fn with_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Attach free text.
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Pin the event time instead of using the recording time.
    #[must_use]
    pub fn happened_at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Validate and normalise: dedup participants (first occurrence wins),
    /// clamp the emotional impact, dedup tags.
    ///
    /// # Errors
    /// Returns `SimError::InvalidEvent` for an empty participant list or a
    /// non-finite number.
    pub fn normalized(mut self) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        self.participants.retain(|p| seen.insert(*p));
        if self.participants.is_empty() {
            return Err(invalid("participants list is empty"));
        }
        if !self.emotional_impact.is_finite() {
            return Err(invalid("emotional impact is not a finite number"));
        }
        if !self.details.is_well_formed() {
            return Err(invalid(format!(
                "{} payload has a non-finite field",
                self.details.event_type()
            )));
        }
        self.emotional_impact = self.emotional_impact.clamp(-1.0, 1.0);
        let mut seen_tags = std::collections::HashSet::new();
        self.tags.retain(|t| seen_tags.insert(t.clone()));
        Ok(self)
    }
}
