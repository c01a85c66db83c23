// ===============================
// src/sync.rs (periodic full-state sync)
// ===============================
use std::sync::Arc;

use tokio::{
    sync::watch,
    time::{interval_at, Duration, Instant, MissedTickBehavior},
};
use tracing::debug;

use crate::domain::{sync_line, ConnectionId};
use crate::heartbeat::MIN_PERIOD;
use crate::registry::ConnectionRegistry;
use crate::target::TargetBook;

/// The whole target book as one `SYNC_TARGET` line per symbol, `None` when empty.
pub fn snapshot_message(targets: &TargetBook) -> Option<String> {
    let lines: Vec<String> = targets
        .snapshot()
        .into_iter()
        .map(|(symbol, net)| sync_line(&symbol, net))
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Push the current snapshot to every connection; returns connections reached.
///
/// The book is read inside the registry's write section, never ahead of it.
pub async fn broadcast_snapshot(targets: &TargetBook, registry: &ConnectionRegistry) -> usize {
    registry.broadcast_with(|| snapshot_message(targets)).await
}

/// Welcome sync for one freshly admitted connection.
pub async fn send_snapshot(targets: &TargetBook, registry: &ConnectionRegistry, id: ConnectionId) -> bool {
    registry.send_to_with(id, || snapshot_message(targets)).await
}

pub async fn run(
    targets: Arc<TargetBook>,
    registry: Arc<ConnectionRegistry>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = period.max(MIN_PERIOD);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let reached = broadcast_snapshot(&targets, &registry).await;
                debug!(symbols = targets.len(), reached, "sync broadcast");
            }
        }
    }
    debug!("sync broadcaster stopped");
}
