//! Lifecycle notifications.
//!
//! Significant memories, forgotten memories, relationship changes and tier
//! transitions are published on a broadcast channel. Subscribers that fall
//! behind lose the oldest notifications rather than stalling the publisher.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::event::EventType;
use crate::tier::{RejectReason, SimulationTier, TierTransition};
use crate::types::{MemoryId, NpcId};

/// Why a memory was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForgetReason {
    /// Scored under the importance threshold at processing time.
    BelowImportanceThreshold,
    /// Decayed under the forget threshold.
    Decayed,
    /// Least important long-term memory dropped to stay under the per-NPC cap.
    CapacitySpill,
}

/// Something observers may care about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// A memory entered long-term storage.
    SignificantMemory {
        /// Owner.
        npc: NpcId,
        /// Memory.
        memory: MemoryId,
        /// Category.
        event_type: EventType,
        /// Score at promotion.
        importance: f64,
    },
    /// A memory was dropped.
    MemoryForgotten {
        /// Owner.
        npc: NpcId,
        /// Memory.
        memory: MemoryId,
        /// Category.
        event_type: EventType,
        /// Score when dropped.
        importance: f64,
        /// Why.
        reason: ForgetReason,
    },
    /// An NPC's trust toward a peer changed.
    RelationshipUpdated {
        /// Owner of the relationship record.
        npc: NpcId,
        /// The peer.
        peer: NpcId,
        /// Trust before.
        old_trust: f64,
        /// Trust after.
        new_trust: f64,
        /// What caused it.
        reason: String,
    },
    /// An NPC changed tier.
    TierTransition(TierTransition),
    /// A promotion request was refused.
    PromotionRejected {
        /// The NPC.
        npc: NpcId,
        /// Why.
        reason: RejectReason,
        /// Where the NPC remains.
        tier: SimulationTier,
    },
    /// Processing one NPC failed; its short-term memory was kept.
    ProcessingFailed {
        /// The NPC.
        npc: NpcId,
        /// Error text.
        error: String,
    },
}

/// Broadcast fan-out for [`Notification`]s. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<Notification>,
}

impl NotificationBus {
    /// Create a bus that buffers up to `capacity` notifications per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to everything published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, notification: Notification) {
        let _ = self.sender.send(notification);
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
