// ===============================
// src/heartbeat.rs
// ===============================
use std::sync::Arc;

use tokio::{
    sync::watch,
    time::{interval_at, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::domain::heartbeat_line;
use crate::registry::{ConnectionRegistry, EvictReason};

/// Shortest period accepted by the periodic tasks; tokio intervals panic on zero.
pub(crate) const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatTick { pub evicted: usize, pub pinged: usize }

/// One monitor pass: evict silent connections, ping the rest.
pub async fn tick(registry: &ConnectionRegistry, timeout: Duration, token: u64) -> HeartbeatTick {
    let mut evicted = 0;
    for id in registry.stale(timeout) {
        if registry.remove(id, EvictReason::Timeout) {
            info!(conn_id = %id, timeout_ms = timeout.as_millis() as u64, "heartbeat timeout");
            evicted += 1;
        }
    }
    let pinged = registry.broadcast(&heartbeat_line(token)).await;
    HeartbeatTick { evicted, pinged }
}

pub async fn run(
    registry: Arc<ConnectionRegistry>,
    period: Duration,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = period.max(MIN_PERIOD);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut token: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                token += 1;
                let t = tick(&registry, timeout, token).await;
                debug!(token, evicted = t.evicted, pinged = t.pinged, "heartbeat");
            }
        }
    }
    debug!("heartbeat monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn silent_connection_is_evicted_and_active_one_pinged() {
        let (tx, mut rx) = mpsc::channel(16);
        let registry = Arc::new(ConnectionRegistry::new(4, Duration::from_secs(1), tx));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _silent = TcpStream::connect(addr).await.unwrap();
        registry.add(listener.accept().await.unwrap().0).unwrap();
        let mut active = TcpStream::connect(addr).await.unwrap();
        registry.add(listener.accept().await.unwrap().0).unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        active.write_all(b"ACK|0\n").await.unwrap();
        rx.recv().await.unwrap();

        let t = tick(&registry, Duration::from_millis(100), 7).await;
        assert_eq!(t, HeartbeatTick { evicted: 1, pinged: 1 });
        assert_eq!(registry.len(), 1);

        let mut line = String::new();
        BufReader::new(active).read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), "HEARTBEAT|7");
    }
}
