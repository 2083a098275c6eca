//! Game events that feed the memory store.
//!
//! A [`GameEvent`] is what the host game reports; [`GameEvent::to_candidate`]
//! turns it into a typed [`MemoryCandidate`] for every participant and
//! witness, and [`GameEvent::direct_participants`] names who actually took
//! part (witnesses only remember).

use serde::{Deserialize, Serialize};

use npcsim_core::event::{EventDetails, MemoryCandidate};
use npcsim_core::types::{Location, NpcId, Timestamp};

/// A game event that can create memories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GameEvent {
    /// One entity spoke to another.
    Dialogue {
        /// Who spoke.
        speaker: NpcId,
        /// Who listened.
        listener: NpcId,
        /// What it was about.
        topic: String,
        /// Where.
        location: Location,
        /// When.
        timestamp: Timestamp,
    },

    /// A fight.
    Combat {
        /// Who started it.
        attacker: NpcId,
        /// Who was attacked.
        defender: NpcId,
        /// How it ended.
        outcome: CombatOutcome,
        /// Damage dealt over the encounter.
        damage: f64,
        /// Bystanders.
        witnesses: Vec<NpcId>,
        /// Where.
        location: Location,
        /// When.
        timestamp: Timestamp,
    },

    /// Goods changed hands.
    Trade {
        /// Who paid.
        buyer: NpcId,
        /// Who sold.
        seller: NpcId,
        /// What was sold.
        item: String,
        /// How many.
        quantity: u32,
        /// Total price.
        price: f64,
        /// -1.0 (rip-off) to 1.0 (generous).
        perceived_fairness: f64,
        /// Where.
        location: Location,
        /// When.
        timestamp: Timestamp,
    },

    /// Someone helped someone.
    Helped {
        /// Who helped.
        helper: NpcId,
        /// Who was helped.
        helped: NpcId,
        /// What was done.
        action: String,
        /// Bystanders.
        witnesses: Vec<NpcId>,
        /// Where.
        location: Location,
        /// When.
        timestamp: Timestamp,
    },

    /// Theft, vandalism and the like.
    Harmed {
        /// Who did it.
        perpetrator: NpcId,
        /// Who suffered.
        victim: NpcId,
        /// What was done.
        action: String,
        /// Bystanders.
        witnesses: Vec<NpcId>,
        /// Where.
        location: Location,
        /// When.
        timestamp: Timestamp,
    },

    /// Quest progress.
    Quest {
        /// Who progressed.
        entity: NpcId,
        /// Quest name.
        quest: String,
        /// Stage reached.
        stage: String,
        /// Quest giver and other involved NPCs.
        involved: Vec<NpcId>,
        /// Where.
        location: Location,
        /// When.
        timestamp: Timestamp,
    },

    /// Faction standing moved for a group of members.
    Faction {
        /// Faction name.
        faction: String,
        /// Members affected.
        members: Vec<NpcId>,
        /// Signed standing change.
        standing_change: f64,
        /// Where.
        location: Location,
        /// When.
        timestamp: Timestamp,
    },

    /// Something large happened nearby.
    World {
        /// What happened.
        description: String,
        /// Who noticed.
        observers: Vec<NpcId>,
        /// How it felt, -1.0 to 1.0.
        emotional_impact: f64,
        /// Where.
        location: Location,
        /// When.
        timestamp: Timestamp,
    },
}

/// Outcome of a combat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombatOutcome {
    /// The attacker won.
    AttackerWon,
    /// The defender won.
    DefenderWon,
    /// Nobody won.
    Draw,
    /// One side ran.
    Fled,
}

impl CombatOutcome {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AttackerWon => "attacker_won",
            Self::DefenderWon => "defender_won",
            Self::Draw => "draw",
            Self::Fled => "fled",
        }
    }
}

impl GameEvent {
    /// When the event happened.
    #[must_use]
    pub const fn timestamp(&self) -> Timestamp {
        match self {
            Self::Dialogue { timestamp, .. }
            | Self::Combat { timestamp, .. }
            | Self::Trade { timestamp, .. }
            | Self::Helped { timestamp, .. }
            | Self::Harmed { timestamp, .. }
            | Self::Quest { timestamp, .. }
            | Self::Faction { timestamp, .. }
            | Self::World { timestamp, .. } => *timestamp,
        }
    }

    /// Where the event happened.
    #[must_use]
    pub const fn location(&self) -> Location {
        match self {
            Self::Dialogue { location, .. }
            | Self::Combat { location, .. }
            | Self::Trade { location, .. }
            | Self::Helped { location, .. }
            | Self::Harmed { location, .. }
            | Self::Quest { location, .. }
            | Self::Faction { location, .. }
            | Self::World { location, .. } => *location,
        }
    }

    /// Entities that acted in the event, excluding bystanders.
    #[must_use]
    pub fn direct_participants(&self) -> Vec<NpcId> {
        match self {
            Self::Dialogue { speaker, listener, .. } => vec![*speaker, *listener],
            Self::Combat { attacker, defender, .. } => vec![*attacker, *defender],
            Self::Trade { buyer, seller, .. } => vec![*buyer, *seller],
            Self::Helped { helper, helped, .. } => vec![*helper, *helped],
            Self::Harmed { perpetrator, victim, .. } => vec![*perpetrator, *victim],
            Self::Quest { entity, involved, .. } => {
                let mut entities = vec![*entity];
                entities.extend(involved);
                entities
            }
            Self::Faction { .. } | Self::World { .. } => Vec::new(),
        }
    }

    /// Everyone who will remember the event.
    #[must_use]
    pub fn all_entities(&self) -> Vec<NpcId> {
        let mut entities = self.direct_participants();
        match self {
            Self::Combat { witnesses, .. } | Self::Helped { witnesses, .. } | Self::Harmed { witnesses, .. } => {
                entities.extend(witnesses);
            }
            Self::Faction { members, .. } => entities.extend(members),
            Self::World { observers, .. } => entities.extend(observers),
            Self::Dialogue { .. } | Self::Trade { .. } | Self::Quest { .. } => {}
        }
        entities
    }

    /// Emotional impact in `[-1, 1]`.
    #[must_use]
    pub fn emotional_impact(&self) -> f64 {
        let impact = match self {
            Self::Dialogue { .. } => 0.1,
            Self::Combat { .. } => -0.6,
            Self::Trade { perceived_fairness, .. } => perceived_fairness * 0.5,
            Self::Helped { .. } => 0.7,
            Self::Harmed { .. } => -0.7,
            Self::Quest { .. } => 0.5,
            Self::Faction { standing_change, .. } => *standing_change,
            Self::World { emotional_impact, .. } => *emotional_impact,
        };
        impact.clamp(-1.0, 1.0)
    }

    /// Build the memory candidate recorded for every entity involved.
    #[must_use]
    pub fn to_candidate(&self) -> MemoryCandidate {
        let details = match self {
            Self::Dialogue { topic, .. } => EventDetails::Interaction { topic: topic.clone() },
            Self::Combat { outcome, damage, .. } => EventDetails::Conflict {
                damage: *damage,
                outcome: outcome.as_str().to_string(),
            },
            Self::Trade {
                item, quantity, price, ..
            } => EventDetails::Trade {
                item: item.clone(),
                quantity: *quantity,
                price: *price,
            },
            Self::Helped { action, .. } | Self::Harmed { action, .. } => EventDetails::RelationshipChange {
                description: action.clone(),
            },
            Self::Quest { quest, stage, .. } => EventDetails::Quest {
                quest: quest.clone(),
                stage: stage.clone(),
            },
            Self::Faction {
                faction, standing_change, ..
            } => EventDetails::FactionEvent {
                faction: faction.clone(),
                standing_change: *standing_change,
            },
            Self::World { description, .. } => EventDetails::WorldEvent {
                description: description.clone(),
            },
        };

        let mut candidate = MemoryCandidate::new(details, self.all_entities())
            .at(self.location())
            .with_emotional_impact(self.emotional_impact())
            .with_tags(self.tags());
        candidate.timestamp = Some(self.timestamp());
        candidate
    }

    fn tags(&self) -> Vec<&'static str> {
        match self {
            Self::Dialogue { .. } => vec!["dialogue"],
            Self::Combat { .. } => vec!["combat"],
            Self::Trade { .. } => vec!["trade"],
            Self::Helped { .. } => vec!["help"],
            Self::Harmed { .. } => vec!["harm"],
            Self::Quest { .. } => vec!["quest"],
            Self::Faction { .. } => vec!["faction"],
            Self::World { .. } => vec!["world"],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use npcsim_core::event::EventType;

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("valid")
    }

    #[test]
    fn combat_includes_witnesses_but_signals_fighters() {
        let (a, d, w) = (NpcId::new(), NpcId::new(), NpcId::new());
        let event = GameEvent::Combat {
            attacker: a,
            defender: d,
            outcome: CombatOutcome::Fled,
            damage: 12.0,
            witnesses: vec![w],
            location: Location::default(),
            timestamp: now(),
        };
        assert_eq!(event.direct_participants(), vec![a, d]);

        let candidate = event.to_candidate();
        assert_eq!(candidate.participants, vec![a, d, w]);
        assert_eq!(candidate.details.event_type(), EventType::Conflict);
        assert_eq!(candidate.timestamp, Some(now()));
        assert!(candidate.emotional_impact < 0.0);
    }

    #[test]
    fn trade_fairness_sets_impact() {
        let event = GameEvent::Trade {
            buyer: NpcId::new(),
            seller: NpcId::new(),
            item: "bread".into(),
            quantity: 3,
            price: 6.0,
            perceived_fairness: 0.8,
            location: Location::default(),
            timestamp: now(),
        };
        assert!((event.emotional_impact() - 0.4).abs() < 1e-9);
        assert_eq!(event.to_candidate().tags, vec!["trade".to_string()]);
    }

    #[test]
    fn events_deserialize_from_json() {
        let speaker = NpcId::new();
        let listener = NpcId::new();
        let json = format!(
            r#"{{"kind":"dialogue","speaker":"{}","listener":"{}","topic":"weather","location":{{"x":1.0,"y":2.0,"z":0.0}},"timestamp":"2024-05-01T12:00:00Z"}}"#,
            speaker.0, listener.0
        );
        let event: GameEvent = serde_json::from_str(&json).expect("parse");
        assert_eq!(event.direct_participants(), vec![speaker, listener]);
        assert_eq!(event.timestamp(), now());
    }
}
