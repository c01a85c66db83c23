// ===============================
// src/registry.rs (connection registry)
// ===============================
//
// Owns every live client socket:
// - admission with a hard ceiling (excess sockets are dropped, not queued)
// - one reader task per connection, newline framing over arbitrary reads
// - broadcast with per-connection eviction on write failure / timeout
//
// Inbound lines are forwarded on an mpsc bus; the registry never interprets them.
//
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, Mutex as AsyncMutex},
    task::AbortHandle,
    time::{timeout, Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::domain::{ConnectionId, InboundLine};
use crate::error::RegistryError;
use crate::metrics::{
    BROADCAST_LINES, CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED, CONNECTIONS_TOTAL, EVICTIONS,
};

const READ_CHUNK: usize = 4096;
/// Longest unterminated line tolerated before the peer is dropped.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason { Closed, ReadError, WriteFailed, Timeout, Oversized, Shutdown }

impl EvictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictReason::Closed => "closed",
            EvictReason::ReadError => "read_error",
            EvictReason::WriteFailed => "write_failed",
            EvictReason::Timeout => "heartbeat_timeout",
            EvictReason::Oversized => "oversized_line",
            EvictReason::Shutdown => "shutdown",
        }
    }
}

pub struct Connection {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    connected: AtomicBool,
    last_activity: Mutex<Instant>,
    // reconnects arrive as fresh connections, so this never moves server-side
    reconnect_attempts: u32,
    writer: AsyncMutex<OwnedWriteHalf>,
    reader: Mutex<Option<AbortHandle>>,
}

impl Connection {
    fn new(id: ConnectionId, peer: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            id,
            peer,
            connected: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
            reconnect_attempts: 0,
            writer: AsyncMutex::new(writer),
            reader: Mutex::new(None),
        }
    }

    fn touch(&self) { *self.last_activity.lock() = Instant::now(); }

    pub fn idle(&self) -> Duration { self.last_activity.lock().elapsed() }

    pub fn is_connected(&self) -> bool { self.connected.load(Ordering::Acquire) }

    fn close(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.to_string(),
            peer: self.peer.to_string(),
            idle_ms: self.idle().as_millis() as u64,
            reconnect_attempts: self.reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo { pub id: String, pub peer: String, pub idle_ms: u64, pub reconnect_attempts: u32 }

pub struct ConnectionRegistry {
    conns: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    max_connections: usize,
    write_timeout: Duration,
    next_id: AtomicU64,
    inbound_tx: mpsc::Sender<InboundLine>,
    // one outbound writer section at a time keeps per-connection order = call order
    write_gate: AsyncMutex<()>,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize, write_timeout: Duration, inbound_tx: mpsc::Sender<InboundLine>) -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            max_connections,
            write_timeout,
            next_id: AtomicU64::new(0),
            inbound_tx,
            write_gate: AsyncMutex::new(()),
        }
    }

    /// Register an accepted socket and start its reader task.
    ///
    /// At capacity the socket is dropped (closing it) and `Capacity` is returned.
    pub fn add(self: &Arc<Self>, stream: TcpStream) -> Result<ConnectionId, RegistryError> {
        let peer = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "set_nodelay failed");
        }
        let (read_half, write_half) = stream.into_split();

        let conn = {
            let mut conns = self.conns.write();
            if conns.len() >= self.max_connections {
                CONNECTIONS_REJECTED.inc();
                return Err(RegistryError::Capacity { limit: self.max_connections });
            }
            let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
            let conn = Arc::new(Connection::new(id, peer, write_half));
            conns.insert(id, conn.clone());
            CONNECTIONS_ACTIVE.set(conns.len() as i64);
            conn
        };
        CONNECTIONS_TOTAL.inc();

        let task = tokio::spawn(Arc::clone(self).read_loop(conn.clone(), read_half));
        *conn.reader.lock() = Some(task.abort_handle());
        info!(conn_id = %conn.id, %peer, "client connected");
        Ok(conn.id)
    }

    async fn read_loop(self: Arc<Self>, conn: Arc<Connection>, mut reader: OwnedReadHalf) {
        let mut chunk = [0u8; READ_CHUNK];
        let mut pending: Vec<u8> = Vec::new();

        let reason = 'read: loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => break 'read EvictReason::Closed,
                Ok(n) => n,
                Err(e) => {
                    debug!(conn_id = %conn.id, error = %e, "read failed");
                    break 'read EvictReason::ReadError;
                }
            };
            conn.touch();
            pending.extend_from_slice(&chunk[..n]);

            for text in drain_lines(&mut pending) {
                let line = InboundLine { conn_id: conn.id, text };
                if self.inbound_tx.send(line).await.is_err() {
                    break 'read EvictReason::Shutdown;
                }
            }
            if pending.len() > MAX_LINE_BYTES {
                warn!(conn_id = %conn.id, bytes = pending.len(), "unterminated line too long");
                break 'read EvictReason::Oversized;
            }
        };

        self.remove(conn.id, reason);
    }

    /// Drop a connection. Returns false if it was already gone.
    pub fn remove(&self, id: ConnectionId, reason: EvictReason) -> bool {
        let removed = {
            let mut conns = self.conns.write();
            let removed = conns.remove(&id);
            CONNECTIONS_ACTIVE.set(conns.len() as i64);
            removed
        };
        match removed {
            Some(conn) => {
                conn.close();
                EVICTIONS.with_label_values(&[reason.as_str()]).inc();
                info!(conn_id = %id, peer = %conn.peer, reason = reason.as_str(), "client removed");
                true
            }
            None => false,
        }
    }

    /// Write `message` plus a line terminator to every live connection.
    ///
    /// A failed or timed-out write evicts only that connection. Returns the
    /// number of connections the message reached.
    pub async fn broadcast(&self, message: &str) -> usize {
        self.broadcast_with(|| Some(message.to_string())).await
    }

    /// Like [`broadcast`](Self::broadcast), but `build` runs inside the write
    /// section, so the message reflects state as of the moment it goes out
    /// and cannot overtake anything written after it. `None` sends nothing.
    pub async fn broadcast_with<F>(&self, build: F) -> usize
    where
        F: FnOnce() -> Option<String>,
    {
        let _gate = self.write_gate.lock().await;
        let Some(message) = build() else { return 0 };
        let line = frame(&message);

        let targets: Vec<Arc<Connection>> = self.live();
        let results = join_all(targets.iter().map(|c| self.write_line(c, &line))).await;

        let mut delivered = 0usize;
        for (conn, res) in targets.iter().zip(results) {
            match res {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(conn_id = %conn.id, error = %e, "broadcast write failed, evicting");
                    self.remove(conn.id, EvictReason::WriteFailed);
                }
            }
        }
        BROADCAST_LINES.inc_by((delivered * line.lines().count()) as u64);
        delivered
    }

    /// Write to a single connection, evicting it on failure.
    pub async fn send_to(&self, id: ConnectionId, message: &str) -> bool {
        self.send_to_with(id, || Some(message.to_string())).await
    }

    /// Single-connection counterpart of [`broadcast_with`](Self::broadcast_with).
    pub async fn send_to_with<F>(&self, id: ConnectionId, build: F) -> bool
    where
        F: FnOnce() -> Option<String>,
    {
        let _gate = self.write_gate.lock().await;
        let Some(conn) = self.get(id) else { return false };
        let Some(message) = build() else { return false };
        let line = frame(&message);

        match self.write_line(&conn, &line).await {
            Ok(()) => {
                BROADCAST_LINES.inc_by(line.lines().count() as u64);
                true
            }
            Err(e) => {
                warn!(conn_id = %id, error = %e, "write failed, evicting");
                self.remove(id, EvictReason::WriteFailed);
                false
            }
        }
    }

    async fn write_line(&self, conn: &Connection, line: &str) -> io::Result<()> {
        let write = async {
            let mut w = conn.writer.lock().await;
            w.write_all(line.as_bytes()).await?;
            w.flush().await
        };
        match timeout(self.write_timeout, write).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
        }
    }

    /// Connections silent for longer than `limit`.
    pub fn stale(&self, limit: Duration) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .conns
            .read()
            .values()
            .filter(|c| c.idle() > limit)
            .map(|c| c.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.conns.read().get(&id).cloned()
    }

    pub fn infos(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<(ConnectionId, ConnectionInfo)> =
            self.conns.read().values().map(|c| (c.id, c.info())).collect();
        infos.sort_by_key(|(id, _)| *id);
        infos.into_iter().map(|(_, i)| i).collect()
    }

    pub fn len(&self) -> usize { self.conns.read().len() }

    pub fn is_empty(&self) -> bool { self.conns.read().is_empty() }

    pub fn capacity(&self) -> usize { self.max_connections }

    /// Close every connection; used on server stop.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<Connection>> = {
            let mut conns = self.conns.write();
            let drained = conns.drain().map(|(_, c)| c).collect();
            CONNECTIONS_ACTIVE.set(0);
            drained
        };
        for conn in &drained {
            conn.close();
            EVICTIONS.with_label_values(&[EvictReason::Shutdown.as_str()]).inc();
        }
        drained.len()
    }

    fn live(&self) -> Vec<Arc<Connection>> {
        let mut live: Vec<Arc<Connection>> =
            self.conns.read().values().filter(|c| c.is_connected()).cloned().collect();
        live.sort_by_key(|c| c.id);
        live
    }
}

fn frame(message: &str) -> String {
    let mut line = message.trim_end_matches(&['\r', '\n'][..]).to_string();
    line.push('\n');
    line
}

/// Split every complete line off `pending`, leaving any partial tail in place.
fn drain_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
        let raw: Vec<u8> = pending.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&raw);
        let text = text.trim();
        if !text.is_empty() {
            lines.push(text.to_string());
        }
    }
    lines
}
