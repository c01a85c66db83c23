// ===============================
// src/lib.rs
// ===============================
//! One-to-many trade signal distribution over line-oriented TCP.
//!
//! A single producer submits directives (`LONG|MES|2`); the server keeps a
//! per-symbol net target, relays each directive verbatim to every connected
//! client, re-broadcasts the whole target book on a timer so late or lagging
//! clients converge, evicts silent clients via heartbeats, and aggregates
//! per-account PnL from the fills clients report back.

pub mod config;
pub mod domain;
pub mod error;
pub mod heartbeat;
pub mod metrics;
pub mod parser;
pub mod positions;
pub mod registry;
pub mod server;
pub mod status;
pub mod sync;
pub mod target;

pub use config::{ServerConfig, Settings};
pub use domain::{Action, ConnectionId, InstrumentSpec, PositionEntry, Signal};
pub use error::{ConfigError, RegistryError, ServerError};
pub use positions::PositionTracker;
pub use server::SignalServer;
pub use target::TargetBook;
