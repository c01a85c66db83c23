// ===============================
// src/positions.rs (per-account position & PnL tracker)
// ===============================
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;

use crate::domain::{normalize_qty, InstrumentSpec, PositionEntry};

type Key = (String, String);

/// Positions keyed by (account, symbol), fed by client fill reports.
///
/// Average price is a running weighted average while a position grows;
/// reducing fills only change quantity. Entries are never removed, a flat
/// position keeps its last average price with zero PnL.
#[derive(Debug, Default)]
pub struct PositionTracker {
    instruments: HashMap<String, InstrumentSpec>,
    positions: RwLock<HashMap<Key, PositionEntry>>,
}

impl PositionTracker {
    pub fn new(instruments: HashMap<String, InstrumentSpec>) -> Self {
        Self { instruments, positions: RwLock::new(HashMap::new()) }
    }

    pub fn instrument(&self, symbol: &str) -> InstrumentSpec {
        self.instruments.get(symbol).copied().unwrap_or_default()
    }

    /// Apply a signed fill and return the updated entry.
    pub fn record_fill(&self, account: &str, symbol: &str, delta: f64, price: f64) -> Option<PositionEntry> {
        if !delta.is_finite() || !price.is_finite() || delta == 0.0 {
            return None;
        }
        let spec = self.instrument(symbol);

        let mut positions = self.positions.write();
        let entry = positions
            .entry((account.to_string(), symbol.to_string()))
            .or_insert_with(|| PositionEntry {
                account: account.to_string(),
                symbol: symbol.to_string(),
                ..Default::default()
            });

        let prev = entry.quantity;
        let next = normalize_qty(prev + delta);
        if prev == 0.0 || prev.signum() == delta.signum() {
            // opening or adding in the same direction
            let (held, added) = (prev.abs(), delta.abs());
            entry.avg_entry_price = (entry.avg_entry_price * held + price * added) / (held + added);
        } else if next != 0.0 && next.signum() != prev.signum() {
            // reversed through flat: what is left was opened at this fill
            entry.avg_entry_price = price;
        }

        entry.quantity = next;
        entry.commission += spec.commission_per_contract * delta.abs();
        entry.last_price = price;
        entry.unrealized_pnl = unrealized(entry, &spec);
        Some(entry.clone())
    }

    /// Re-mark every entry on `symbol` at `price`.
    pub fn update_mark(&self, symbol: &str, price: f64) -> usize {
        if !price.is_finite() {
            return 0;
        }
        let spec = self.instrument(symbol);
        let mut touched = 0;
        for entry in self.positions.write().values_mut().filter(|e| e.symbol == symbol) {
            entry.last_price = price;
            entry.unrealized_pnl = unrealized(entry, &spec);
            touched += 1;
        }
        touched
    }

    pub fn position(&self, account: &str, symbol: &str) -> Option<PositionEntry> {
        self.positions.read().get(&(account.to_string(), symbol.to_string())).cloned()
    }

    pub fn positions(&self) -> Vec<PositionEntry> {
        let mut out: Vec<PositionEntry> = self.positions.read().values().cloned().collect();
        out.sort_by(|a, b| (&a.account, &a.symbol).cmp(&(&b.account, &b.symbol)));
        out
    }

    pub fn total_pnl(&self) -> f64 {
        self.positions.read().values().map(|e| e.unrealized_pnl).sum()
    }

    pub fn profitable_account_count(&self) -> usize {
        self.account_totals().values().filter(|pnl| **pnl > 0.0).count()
    }

    /// Accounts ordered by summed PnL, best first.
    pub fn account_rankings(&self) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self.account_totals().into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }

    fn account_totals(&self) -> HashMap<String, f64> {
        let mut totals: HashMap<String, f64> = HashMap::new();
        for e in self.positions.read().values() {
            *totals.entry(e.account.clone()).or_insert(0.0) += e.unrealized_pnl;
        }
        totals
    }
}

fn unrealized(e: &PositionEntry, spec: &InstrumentSpec) -> f64 {
    if e.quantity == 0.0 {
        return 0.0;
    }
    (e.last_price - e.avg_entry_price) * e.quantity * spec.multiplier()
}
