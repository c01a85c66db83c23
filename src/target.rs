// ===============================
// src/target.rs
// ===============================
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;

use crate::domain::{normalize_qty, Action, Signal};

/// Net signed target per symbol. A symbol that was never touched is implicitly 0.
///
/// Symbols that return to flat stay in the map so sync snapshots keep telling
/// lagging clients to be flat.
#[derive(Debug, Default)]
pub struct TargetBook {
    nets: Mutex<HashMap<String, f64>>,
}

impl TargetBook {
    pub fn new() -> Self { Self::default() }

    /// Apply a directive and return the symbol's new net. Invalid signals are ignored.
    pub fn apply(&self, signal: &Signal) -> f64 {
        let mut nets = self.nets.lock();
        let current = nets.get(&signal.symbol).copied().unwrap_or(0.0);
        if !signal.valid {
            return current;
        }

        let next = normalize_qty(next_net(current, signal.action, signal.quantity));
        if next != current || nets.contains_key(&signal.symbol) {
            nets.insert(signal.symbol.clone(), next);
        }
        next
    }

    pub fn net(&self, symbol: &str) -> f64 {
        self.nets.lock().get(symbol).copied().unwrap_or(0.0)
    }

    /// Consistent copy of every tracked symbol, ordered by symbol.
    pub fn snapshot(&self) -> Vec<(String, f64)> {
        let mut out: Vec<(String, f64)> = self
            .nets
            .lock()
            .iter()
            .map(|(s, q)| (s.clone(), *q))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize { self.nets.lock().len() }

    pub fn is_empty(&self) -> bool { self.nets.lock().is_empty() }
}

fn next_net(current: f64, action: Action, qty: f64) -> f64 {
    match action {
        Action::Long => current + qty,
        Action::Short => current - qty,
        // move toward flat, never through it
        Action::Close if current > 0.0 => (current - qty).max(0.0),
        Action::Close if current < 0.0 => (current + qty).min(0.0),
        Action::Close => current,
        // magnitude only; flat has no side to keep
        Action::Modify if current > 0.0 => qty,
        Action::Modify if current < 0.0 => -qty,
        Action::Modify => current,
        Action::Unknown => current,
    }
}
