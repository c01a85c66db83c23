// ===============================
// src/server.rs (signal distribution server)
// ===============================
//
// Wiring:
//   submit_signal -> parser -> TargetBook + registry.broadcast(raw), one write section
//   accept loop   -> registry.add -> welcome sync to the new client
//   inbound bus   -> ACK (liveness only) / FILL -> PositionTracker / PRICE -> marks
//   heartbeat + sync (+ status) tasks, each owning Arc handles and a shutdown watch
//
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, Duration},
};
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::domain::{Inbound, InboundLine, PositionEntry};
use crate::error::{RegistryError, ServerError};
use crate::metrics::{FILLS, PNL_UNREALIZED, SIGNALS, SIGNALS_REJECTED, TARGET_NET};
use crate::parser::{parse_inbound, parse_signal};
use crate::positions::PositionTracker;
use crate::registry::ConnectionRegistry;
use crate::status::{StatusSnapshot, StatusSource};
use crate::target::TargetBook;
use crate::{heartbeat, status, sync};

const INBOUND_BUS: usize = 4096;

pub struct SignalServer {
    config: ServerConfig,
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    targets: Arc<TargetBook>,
    tracker: Arc<PositionTracker>,
    listener: Mutex<Option<TcpListener>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundLine>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalServer {
    /// Bind the listening socket. Nothing runs until [`SignalServer::start`].
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let addr = config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let (inbound_tx, inbound_rx) = mpsc::channel::<InboundLine>(INBOUND_BUS);
        let registry = Arc::new(ConnectionRegistry::new(
            config.max_connections,
            config.write_timeout,
            inbound_tx,
        ));
        let tracker = Arc::new(PositionTracker::new(config.instruments.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            local_addr,
            registry,
            targets: Arc::new(TargetBook::new()),
            tracker,
            listener: Mutex::new(Some(listener)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the accept loop, inbound dispatcher and periodic tasks.
    pub fn start(&self) -> Result<(), ServerError> {
        let (Some(listener), Some(inbound_rx)) = (self.listener.lock().take(), self.inbound_rx.lock().take()) else {
            return Err(ServerError::AlreadyStarted);
        };
        let cfg = &self.config;
        let mut tasks = self.tasks.lock();

        tasks.push(tokio::spawn(accept_loop(
            listener,
            self.registry.clone(),
            self.targets.clone(),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(dispatch_loop(
            inbound_rx,
            self.tracker.clone(),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(heartbeat::run(
            self.registry.clone(),
            cfg.heartbeat_interval,
            cfg.heartbeat_timeout,
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(sync::run(
            self.targets.clone(),
            self.registry.clone(),
            cfg.sync_interval,
            self.shutdown_tx.subscribe(),
        )));
        if let Some(path) = cfg.status_file.clone() {
            tasks.push(tokio::spawn(status::run(
                self.status_source(),
                path,
                cfg.status_interval,
                self.shutdown_tx.subscribe(),
            )));
        }

        info!(
            addr = %self.local_addr,
            max_connections = cfg.max_connections,
            heartbeat_ms = cfg.heartbeat_interval.as_millis() as u64,
            timeout_ms = cfg.heartbeat_timeout.as_millis() as u64,
            sync_ms = cfg.sync_interval.as_millis() as u64,
            "signal server started"
        );
        Ok(())
    }

    /// Validate, apply to the target book, then relay the text verbatim.
    ///
    /// Returns the symbol's new net target.
    pub async fn submit_signal(&self, raw: &str) -> Result<f64, ServerError> {
        let signal = parse_signal(raw);
        if !signal.valid {
            SIGNALS_REJECTED.inc();
            warn!(raw = %raw.trim(), "rejected malformed signal");
            return Err(ServerError::InvalidSignal(raw.trim().to_string()));
        }

        // the book moves inside the write section, so a sync snapshot is either
        // sent before this directive or already contains it
        let mut net = 0.0;
        let reached = self
            .registry
            .broadcast_with(|| {
                net = self.targets.apply(&signal);
                Some(signal.raw.clone())
            })
            .await;
        SIGNALS.with_label_values(&[signal.action.as_str()]).inc();
        TARGET_NET.with_label_values(&[&signal.symbol]).set(net);
        info!(action = signal.action.as_str(), symbol = %signal.symbol, qty = signal.quantity, net, reached, "signal relayed");
        Ok(net)
    }

    /// In-process fill intake for execution layers that do not go through a socket.
    pub fn record_fill(&self, account: &str, symbol: &str, quantity: f64, price: f64) -> Option<PositionEntry> {
        apply_fill(&self.tracker, account, &symbol.to_ascii_uppercase(), quantity, price)
    }

    pub fn status(&self) -> StatusSnapshot { self.status_source().snapshot() }

    fn status_source(&self) -> StatusSource {
        StatusSource {
            registry: self.registry.clone(),
            targets: self.targets.clone(),
            tracker: self.tracker.clone(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    pub fn connection_count(&self) -> usize { self.registry.len() }

    pub fn target(&self, symbol: &str) -> f64 { self.targets.net(&symbol.to_ascii_uppercase()) }

    pub fn tracker(&self) -> &PositionTracker { &self.tracker }

    /// Stop periodic tasks and the accept loop, then drop every client.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "server task ended abnormally");
            }
        }
        let closed = self.registry.close_all();
        info!(closed, "signal server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    targets: Arc<TargetBook>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => match res {
                Ok((stream, peer)) => match registry.add(stream) {
                    Ok(id) => {
                        // late joiners converge immediately instead of waiting a sync tick
                        let (registry, targets) = (registry.clone(), targets.clone());
                        tokio::spawn(async move { sync::send_snapshot(&targets, &registry, id).await; });
                    }
                    Err(RegistryError::Capacity { limit }) => {
                        warn!(%peer, limit, "connection refused: at capacity");
                    }
                    Err(e) => warn!(%peer, error = %e, "connection setup failed"),
                },
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    debug!("accept loop stopped");
}

async fn dispatch_loop(
    mut rx: mpsc::Receiver<InboundLine>,
    tracker: Arc<PositionTracker>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            msg = rx.recv() => match msg {
                Some(line) => handle_inbound(&tracker, line),
                None => break,
            },
        }
    }
    debug!("inbound dispatcher stopped");
}

fn handle_inbound(tracker: &PositionTracker, line: InboundLine) {
    match parse_inbound(&line.text) {
        Some(Inbound::Ack(token)) => trace!(conn_id = %line.conn_id, ?token, "heartbeat ack"),
        Some(Inbound::Fill { symbol, quantity, price, account }) => {
            let account = account.unwrap_or_else(|| line.conn_id.to_string());
            apply_fill(tracker, &account, &symbol, quantity, price);
        }
        Some(Inbound::Mark { symbol, price }) => {
            let touched = tracker.update_mark(&symbol, price);
            PNL_UNREALIZED.set(tracker.total_pnl());
            trace!(%symbol, price, touched, "mark price");
        }
        None => debug!(conn_id = %line.conn_id, text = %line.text, "dropping malformed client message"),
    }
}

fn apply_fill(tracker: &PositionTracker, account: &str, symbol: &str, quantity: f64, price: f64) -> Option<PositionEntry> {
    let entry = tracker.record_fill(account, symbol, quantity, price)?;
    FILLS.inc();
    PNL_UNREALIZED.set(tracker.total_pnl());
    info!(
        %account, %symbol, qty = quantity, price,
        position = entry.quantity, avg = entry.avg_entry_price, pnl = entry.unrealized_pnl,
        "fill recorded"
    );
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ConnectionId;

    fn local_config() -> ServerConfig {
        ServerConfig { listen_addr: "127.0.0.1:0".parse().unwrap(), ..Default::default() }
    }

    #[tokio::test]
    async fn submit_updates_book_and_rejects_garbage() {
        let server = SignalServer::bind(local_config()).await.unwrap();
        assert_eq!(server.submit_signal("LONG|MES|2").await.unwrap(), 2.0);
        assert_eq!(server.submit_signal("long|mes|1").await.unwrap(), 3.0);
        assert!(matches!(server.submit_signal("GARBAGE").await, Err(ServerError::InvalidSignal(_))));
        assert_eq!(server.target("mes"), 3.0);
    }

    #[tokio::test]
    async fn start_twice_is_refused() {
        let server = SignalServer::bind(local_config()).await.unwrap();
        server.start().unwrap();
        assert!(matches!(server.start(), Err(ServerError::AlreadyStarted)));
        server.stop().await;
    }

    #[test]
    fn inbound_fill_defaults_account_to_connection() {
        let tracker = PositionTracker::default();
        handle_inbound(&tracker, InboundLine { conn_id: ConnectionId(4), text: "FILL|MES|2|5000".into() });
        handle_inbound(&tracker, InboundLine { conn_id: ConnectionId(4), text: "FILL|MES|1|5000|Sim7".into() });
        handle_inbound(&tracker, InboundLine { conn_id: ConnectionId(4), text: "FILL|MES|oops|5000".into() });
        assert_eq!(tracker.position("conn-4", "MES").unwrap().quantity, 2.0);
        assert_eq!(tracker.position("Sim7", "MES").unwrap().quantity, 1.0);
        assert_eq!(tracker.positions().len(), 2);
    }
}
