// ===============================
// src/domain.rs
// ===============================
use std::fmt;

use serde::{Deserialize, Serialize};

/// Field separator of every line on the wire.
pub const FIELD_SEP: char = '|';

pub const SYNC_TAG: &str = "SYNC_TARGET";
pub const HEARTBEAT_TAG: &str = "HEARTBEAT";
pub const ACK_TAG: &str = "ACK";
pub const FILL_TAG: &str = "FILL";
pub const PRICE_TAG: &str = "PRICE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Action { Long, Short, Close, Modify, Unknown }

impl Action {
    /// Case-insensitive match against the four known actions.
    pub fn from_token(s: &str) -> Action {
        match s.trim().to_ascii_uppercase().as_str() {
            "LONG" => Action::Long,
            "SHORT" => Action::Short,
            "CLOSE" => Action::Close,
            "MODIFY" => Action::Modify,
            _ => Action::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Long => "LONG",
            Action::Short => "SHORT",
            Action::Close => "CLOSE",
            Action::Modify => "MODIFY",
            Action::Unknown => "UNKNOWN",
        }
    }
}

/// A decoded directive. `raw` keeps the submitted text so it can be relayed verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal { pub action: Action, pub symbol: String, pub quantity: f64, pub raw: String, pub valid: bool }

impl Signal {
    pub fn rejected(raw: &str, action: Action) -> Self {
        Self { action, symbol: String::new(), quantity: 0.0, raw: raw.to_string(), valid: false }
    }
}

/// Registry-assigned connection identity; clients never choose it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "conn-{}", self.0) }
}

/// One client -> server line after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ack(Option<u64>),
    Fill { symbol: String, quantity: f64, price: f64, account: Option<String> },
    Mark { symbol: String, price: f64 },
}

/// A complete line read from a connection, tagged with its origin.
#[derive(Debug, Clone)]
pub struct InboundLine { pub conn_id: ConnectionId, pub text: String }

/// Contract scaling used to turn price distance into currency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec { pub tick_size: f64, pub tick_value: f64, pub commission_per_contract: f64 }

impl InstrumentSpec {
    /// Currency value of a one-point move for one contract.
    pub fn multiplier(&self) -> f64 {
        if self.tick_size > 0.0 { self.tick_value / self.tick_size } else { 1.0 }
    }
}

impl Default for InstrumentSpec {
    fn default() -> Self { Self { tick_size: 1.0, tick_value: 1.0, commission_per_contract: 0.0 } }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionEntry {
    pub account: String,
    pub symbol: String,
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub last_price: f64,
    pub unrealized_pnl: f64,
    pub commission: f64,
}

/// `SYNC_TARGET|<SYMBOL>|<NET>`
pub fn sync_line(symbol: &str, net: f64) -> String {
    format!("{SYNC_TAG}{FIELD_SEP}{symbol}{FIELD_SEP}{net}")
}

/// `HEARTBEAT|<TOKEN>`
pub fn heartbeat_line(token: u64) -> String {
    format!("{HEARTBEAT_TAG}{FIELD_SEP}{token}")
}

/// Collapse float noise and negative zero so a flat quantity prints as `0`.
pub fn normalize_qty(q: f64) -> f64 {
    if q.abs() < 1e-9 { 0.0 } else { q }
}
