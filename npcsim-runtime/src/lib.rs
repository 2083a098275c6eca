//! # npcsim-runtime: Orchestration for the npcsim core
//!
//! The core library is passive: it never reads the clock and never spawns
//! timers. This crate supplies the pieces a host game needs around it.
//!
//! ```text
//! ┌──────────────── host game ─────────────────┐
//! │  callbacks ──▶ hooks::on_* ──▶ GameEvent   │
//! │                      │                     │
//! │                      ▼                     │
//! │              hooks::EventRouter            │
//! └──────────────────────┼─────────────────────┘
//!                        ▼
//!             npcsim_core::MemoryService ◀── scheduler::Scheduler ◀── clock::Clock
//! ```
//!
//! ## Modules
//!
//! - `clock`: wall-clock and manually advanced time sources
//! - `events`: game events and their memory candidates
//! - `hooks`: event constructors and the event router
//! - `scheduler`: interval loop with shutdown and config hot reload
//! - `telemetry`: tracing subscriber setup

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod events;
pub mod hooks;
pub mod scheduler;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use events::GameEvent;
pub use hooks::EventRouter;
pub use scheduler::Scheduler;
