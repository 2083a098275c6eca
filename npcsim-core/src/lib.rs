//! # npcsim Core Library
//!
//! Engine-agnostic NPC memory lifecycle and simulation-tier management.
//!
//! Every NPC gets an [`NpcMemory`]: a bounded short-term buffer of recent
//! [`MemoryEvent`]s that is periodically compressed into long-term memory,
//! plus directional trust toward the NPCs it has met. Independently, every
//! NPC sits in one [`SimulationTier`] that sets how much simulation detail
//! (and CPU/memory budget) it receives:
//!
//! - **Tier 1 (Active)**: full AI, per-event memory processing
//! - **Tier 2 (Background)**: reduced AI, memory still processed
//! - **Tier 3 (Dormant)**: schedule only
//! - **Tier 3.5 (Compressed)**: summaries only
//! - **Tier 4 (Statistical)**: part of a population count
//!
//! [`MemoryService`] ties both together behind an explicit lifecycle; the
//! caller owns the clock and the schedule.
//!
//! ## Performance Contract
//!
//! - Recording an event: < 50μs per participant
//! - Processing one NPC's full short-term buffer: < 1ms
//! - Tier cycle over 1 000 assignments: < 5ms

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod compression;
pub mod config;
pub mod decay;
pub mod error;
pub mod event;
pub mod importance;
pub mod index;
pub mod memory;
pub mod metrics;
pub mod notify;
pub mod persistence;
pub mod queue;
pub mod relationship;
pub mod service;
pub mod store;
pub mod tier;
pub mod types;

pub use config::{MemoryConfig, SimConfig, TierConfig};
pub use error::{Result, SimError};
pub use event::{EventDetails, EventType, MemoryCandidate, MemoryEvent};
pub use memory::NpcMemory;
pub use notify::{Notification, NotificationBus};
pub use persistence::{InMemoryPersistence, MemoryPersistence, SqlitePersistence};
pub use service::{CycleLimits, MemoryService};
pub use store::{MemoryQuery, MemoryStore};
pub use tier::{ActivationSignal, SimulationTier, TierManager, TierOutcome};
pub use types::*;
