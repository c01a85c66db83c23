// ===============================
// src/error.rs
// ===============================
use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection limit reached ({limit})")]
    Capacity { limit: usize },
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind {addr} failed: {source}")]
    Bind { addr: SocketAddr, source: std::io::Error },
    #[error("invalid signal: {0:?}")]
    InvalidSignal(String),
    #[error("server already started")]
    AlreadyStarted,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid instrument entry {0:?} (want SYMBOL:TICK_SIZE:TICK_VALUE[:COMMISSION])")]
    InvalidInstrument(String),
    #[error("invalid bind address {0:?}")]
    InvalidBindAddr(String),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}
