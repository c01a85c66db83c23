// ===============================
// src/status.rs
// ===============================
//
// Aggregate status for an external dashboard:
// - connection count, total / per-account PnL, current targets
// - optionally written as a JSON file every interval (temp file + rename so
//   a poller never sees a half-written document)
//
// Only aggregates are written. Directive history is never persisted.
//
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    fs,
    sync::watch,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, error, info};

use crate::heartbeat::MIN_PERIOD;
use crate::positions::PositionTracker;
use crate::registry::{ConnectionInfo, ConnectionRegistry};
use crate::target::TargetBook;

#[derive(Debug, Clone, Serialize)]
pub struct TargetEntry { pub symbol: String, pub net: f64 }

#[derive(Debug, Clone, Serialize)]
pub struct AccountPnl { pub account: String, pub pnl: f64 }

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub ts: DateTime<Utc>,
    pub connections: usize,
    pub max_connections: usize,
    pub total_pnl: f64,
    pub profitable_accounts: usize,
    pub accounts: Vec<AccountPnl>,
    pub targets: Vec<TargetEntry>,
    pub clients: Vec<ConnectionInfo>,
}

/// Read-only handles to the three tables a status document is built from.
#[derive(Clone)]
pub struct StatusSource {
    pub registry: Arc<ConnectionRegistry>,
    pub targets: Arc<TargetBook>,
    pub tracker: Arc<PositionTracker>,
}

impl StatusSource {
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            ts: Utc::now(),
            connections: self.registry.len(),
            max_connections: self.registry.capacity(),
            total_pnl: self.tracker.total_pnl(),
            profitable_accounts: self.tracker.profitable_account_count(),
            accounts: self
                .tracker
                .account_rankings()
                .into_iter()
                .map(|(account, pnl)| AccountPnl { account, pnl })
                .collect(),
            targets: self
                .targets
                .snapshot()
                .into_iter()
                .map(|(symbol, net)| TargetEntry { symbol, net })
                .collect(),
            clients: self.registry.infos(),
        }
    }
}

/// Replace `path` with the JSON form of `snap`, creating the parent directory if needed.
pub async fn write_snapshot(path: &Path, snap: &StatusSnapshot) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let body = serde_json::to_vec_pretty(snap)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, body).await?;
    fs::rename(&tmp, path).await
}

pub async fn run(source: StatusSource, path: PathBuf, period: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(path = %path.display(), "status writer: started");
    let mut tick = interval(period.max(MIN_PERIOD));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                let snap = source.snapshot();
                if let Err(e) = write_snapshot(&path, &snap).await {
                    error!(?e, path = %path.display(), "status writer: write failed");
                }
            }
        }
    }

    // one last document so the dashboard sees the final state
    if let Err(e) = write_snapshot(&path, &source.snapshot()).await {
        error!(?e, path = %path.display(), "status writer: final write failed");
    }
    debug!("status writer: stopped");
}
