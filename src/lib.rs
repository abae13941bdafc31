//! Client-side reconciliation engine for a polled, round-based crash game.
//!
//! The engine rebuilds the current round from periodic snapshots, validates
//! bets and cash-outs against the freshest phase, settles every slip exactly
//! once, and resynchronizes itself whenever its view appears stuck.

pub mod animator;
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod http_client;
pub mod ledger;
pub mod money;
pub mod reconciler;
pub mod scheduler;
pub mod snapshot;
pub mod timer;
pub mod watchdog;

pub use engine::{
    Engine,
    EngineHandle,
    EngineView,
};
pub use error::CommandError;
