//! Integration hooks between the host game and the simulation service.
//!
//! The `on_*` helpers build [`GameEvent`]s from the host's callbacks;
//! [`EventRouter::ingest`] records the memory and turns player contact into
//! tier promotion signals.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use npcsim_core::service::MemoryService;
use npcsim_core::store::RecordReceipt;
use npcsim_core::tier::{ActivationSignal, TierOutcome};
use npcsim_core::types::{Location, NpcId, PoiId, Timestamp};

use crate::events::{CombatOutcome, GameEvent};

/// Create a dialogue event from the chat system.
#[must_use]
pub fn on_dialogue(speaker: NpcId, listener: NpcId, topic: String, location: Location, timestamp: Timestamp) -> GameEvent {
    GameEvent::Dialogue {
        speaker,
        listener,
        topic,
        location,
        timestamp,
    }
}

/// Create a combat event from the combat system.
#[must_use]
pub fn on_combat(
    attacker: NpcId,
    defender: NpcId,
    outcome: CombatOutcome,
    damage: f64,
    witnesses: Vec<NpcId>,
    location: Location,
    timestamp: Timestamp,
) -> GameEvent {
    GameEvent::Combat {
        attacker,
        defender,
        outcome,
        damage,
        witnesses,
        location,
        timestamp,
    }
}

/// Create a trade event from the trading system.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn on_trade(
    buyer: NpcId,
    seller: NpcId,
    item: String,
    quantity: u32,
    price: f64,
    perceived_fairness: f64,
    location: Location,
    timestamp: Timestamp,
) -> GameEvent {
    GameEvent::Trade {
        buyer,
        seller,
        item,
        quantity,
        price,
        perceived_fairness,
        location,
        timestamp,
    }
}

/// Create a help event (e.g. the player defended an NPC).
#[must_use]
pub fn on_help(
    helper: NpcId,
    helped: NpcId,
    action: String,
    witnesses: Vec<NpcId>,
    location: Location,
    timestamp: Timestamp,
) -> GameEvent {
    GameEvent::Helped {
        helper,
        helped,
        action,
        witnesses,
        location,
        timestamp,
    }
}

/// Create a harm event (theft, property destruction).
#[must_use]
pub fn on_harm(
    perpetrator: NpcId,
    victim: NpcId,
    action: String,
    witnesses: Vec<NpcId>,
    location: Location,
    timestamp: Timestamp,
) -> GameEvent {
    GameEvent::Harmed {
        perpetrator,
        victim,
        action,
        witnesses,
        location,
        timestamp,
    }
}

/// What ingesting one event did.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    /// Memory recording result.
    pub receipt: RecordReceipt,
    /// Tier outcome for each NPC a player interacted with directly.
    pub signals: Vec<(NpcId, TierOutcome)>,
}

/// Routes game events into a [`MemoryService`].
#[derive(Debug)]
pub struct EventRouter {
    service: Arc<MemoryService>,
    players: RwLock<HashSet<NpcId>>,
}

impl EventRouter {
    /// Route into `service`.
    #[must_use]
    pub fn new(service: Arc<MemoryService>) -> Self {
        Self {
            service,
            players: RwLock::new(HashSet::new()),
        }
    }

    /// Mark `id` as a player. Players take part in memories but never get a
    /// tier of their own.
    pub fn register_player(&self, id: NpcId) {
        self.players.write().insert(id);
    }

    /// Forget a player.
    pub fn unregister_player(&self, id: NpcId) {
        self.players.write().remove(&id);
    }

    /// Whether `id` is a registered player.
    #[must_use]
    pub fn is_player(&self, id: NpcId) -> bool {
        self.players.read().contains(&id)
    }

    /// Record `event` for everyone involved. When a player is among the
    /// direct participants, every other direct participant receives a
    /// direct-interaction signal.
    ///
    /// # Errors
    /// Propagates the service's recording error; no signals are sent then.
    pub fn ingest(&self, event: &GameEvent, now: Timestamp) -> npcsim_core::Result<IngestReport> {
        let receipt = self.service.add_memory_event(event.to_candidate(), now)?;

        let direct = event.direct_participants();
        let signals = if direct.iter().any(|id| self.is_player(*id)) {
            direct
                .into_iter()
                .filter(|id| !self.is_player(*id))
                .map(|npc| {
                    self.service
                        .signal(npc, ActivationSignal::DirectInteraction, now)
                        .map(|outcome| (npc, outcome))
                })
                .collect::<npcsim_core::Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        debug!(memory = %receipt.memory, signals = signals.len(), "Ingested game event");
        Ok(IngestReport { receipt, signals })
    }

    /// A player walked into `poi`.
    ///
    /// # Errors
    /// `SimError::NotRunning`.
    pub fn player_enters_poi(&self, poi: PoiId, now: Timestamp) -> npcsim_core::Result<Vec<(NpcId, TierOutcome)>> {
        self.service.player_enters_poi(poi, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use npcsim_core::config::SimConfig;
    use npcsim_core::persistence::InMemoryPersistence;
    use npcsim_core::tier::SimulationTier;

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("valid")
    }

    fn router() -> EventRouter {
        let service = MemoryService::new(SimConfig::default(), Arc::new(InMemoryPersistence::new())).expect("valid");
        service.start();
        EventRouter::new(Arc::new(service))
    }

    #[test]
    fn player_dialogue_activates_npc() {
        let router = router();
        let (player, npc) = (NpcId::new(), NpcId::new());
        router.register_player(player);

        let report = router
            .ingest(&on_dialogue(player, npc, "rumours".into(), Location::default(), now()), now())
            .expect("ingest");

        assert_eq!(report.signals.len(), 1);
        assert_eq!(report.signals[0].0, npc);
        assert_eq!(report.signals[0].1.tier(), SimulationTier::Active);
        assert_eq!(report.receipt.scores.len(), 2);
    }

    #[test]
    fn npc_only_events_send_no_signals() {
        let router = router();
        let event = on_harm(
            NpcId::new(),
            NpcId::new(),
            "stole a goat".into(),
            vec![NpcId::new()],
            Location::default(),
            now(),
        );
        let report = router.ingest(&event, now()).expect("ingest");
        assert!(report.signals.is_empty());
        assert_eq!(report.receipt.scores.len(), 3);
    }
}
