// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : signal_relay — one-to-many trade signal distribution over TCP
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Relays directives from one signal source to many executing
          clients, keeps a per-symbol target book that is re-synced to
          every client periodically, supervises client liveness with
          heartbeats, and aggregates per-account PnL from reported fills.
=============================================================================
*/
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use ahash::AHashMap as HashMap;
use clap::Parser;
use dotenvy::dotenv;
use tokio::time::Duration;

use crate::domain::InstrumentSpec;
use crate::error::ConfigError;

/// Command line, with every flag also readable from env (and `.env`).
#[derive(Parser, Debug, Clone)]
#[command(name = "signal_relay", version, about = "Trade signal distribution server")]
pub struct Args {
    /// TCP port clients connect to
    #[arg(long, env = "LISTEN_PORT", default_value_t = 5000)]
    pub port: u16,

    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(long, env = "MAX_CONNECTIONS", default_value_t = 20)]
    pub max_connections: usize,

    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value_t = 5_000)]
    pub heartbeat_interval_ms: u64,

    /// Silence longer than this evicts a client
    #[arg(long, env = "HEARTBEAT_TIMEOUT_MS", default_value_t = 10_000)]
    pub heartbeat_timeout_ms: u64,

    #[arg(long, env = "SYNC_INTERVAL_MS", default_value_t = 5_000)]
    pub sync_interval_ms: u64,

    #[arg(long, env = "WRITE_TIMEOUT_MS", default_value_t = 2_000)]
    pub write_timeout_ms: u64,

    /// SYMBOL:TICK_SIZE:TICK_VALUE[:COMMISSION], comma separated
    #[arg(long, env = "INSTRUMENTS", default_value = "MES:0.25:1.25:0,ES:0.25:12.5:0")]
    pub instruments: String,

    /// Prometheus port, 0 disables
    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,

    /// JSON status snapshot path for dashboards
    #[arg(long, env = "STATUS_FILE")]
    pub status_file: Option<PathBuf>,

    #[arg(long, env = "STATUS_INTERVAL_MS", default_value_t = 5_000)]
    pub status_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub sync_interval: Duration,
    pub write_timeout: Duration,
    pub instruments: HashMap<String, InstrumentSpec>,
    pub status_file: Option<PathBuf>,
    pub status_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            max_connections: 20,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(10),
            sync_interval: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            instruments: HashMap::new(),
            status_file: None,
            status_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub metrics_port: u16,
}

impl Args {
    pub fn into_settings(self) -> Result<Settings, ConfigError> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddr(self.bind.clone()))?;

        let server = ServerConfig {
            listen_addr: SocketAddr::new(ip, self.port),
            max_connections: self.max_connections,
            heartbeat_interval: non_zero_ms("heartbeat interval", self.heartbeat_interval_ms)?,
            heartbeat_timeout: non_zero_ms("heartbeat timeout", self.heartbeat_timeout_ms)?,
            sync_interval: non_zero_ms("sync interval", self.sync_interval_ms)?,
            write_timeout: non_zero_ms("write timeout", self.write_timeout_ms)?,
            instruments: parse_instruments(&self.instruments)?,
            status_file: self.status_file,
            status_interval: non_zero_ms("status interval", self.status_interval_ms)?,
        };
        Ok(Settings { server, metrics_port: self.metrics_port })
    }
}

fn non_zero_ms(name: &'static str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::ZeroDuration(name));
    }
    Ok(Duration::from_millis(ms))
}

/// `MES:0.25:1.25:0.35,ES:0.25:12.5` -> per-symbol specs (symbols upper-cased).
pub fn parse_instruments(s: &str) -> Result<HashMap<String, InstrumentSpec>, ConfigError> {
    let mut out = HashMap::new();
    for item in s.split(',').map(str::trim).filter(|x| !x.is_empty()) {
        let bad = || ConfigError::InvalidInstrument(item.to_string());
        let parts: Vec<&str> = item.split(':').map(str::trim).collect();
        if !(3..=4).contains(&parts.len()) || parts[0].is_empty() {
            return Err(bad());
        }
        let num = |x: &str| x.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0);
        let tick_size = num(parts[1]).filter(|v| *v > 0.0).ok_or_else(bad)?;
        let tick_value = num(parts[2]).ok_or_else(bad)?;
        let commission_per_contract = match parts.get(3) {
            Some(c) => num(*c).ok_or_else(bad)?,
            None => 0.0,
        };
        out.insert(
            parts[0].to_ascii_uppercase(),
            InstrumentSpec { tick_size, tick_value, commission_per_contract },
        );
    }
    Ok(out)
}

/// Read `.env`, then flags/env.
pub fn load() -> Result<Settings, ConfigError> {
    let _ = dotenv();
    Args::parse().into_settings()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_behaviour() {
        let settings = Args::parse_from(["signal_relay"]).into_settings().unwrap();
        let cfg = settings.server;
        assert_eq!(cfg.listen_addr.port(), 5000);
        assert_eq!(cfg.max_connections, 20);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(cfg.sync_interval, Duration::from_secs(5));
        assert!((cfg.instruments["MES"].multiplier() - 5.0).abs() < 1e-12);
        assert_eq!(settings.metrics_port, 9898);
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "signal_relay", "--port", "6000", "--bind", "127.0.0.1", "--max-connections", "3",
            "--instruments", "nq:0.25:5:2.1",
        ]);
        let cfg = args.into_settings().unwrap().server;
        assert_eq!(cfg.listen_addr, "127.0.0.1:6000".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.max_connections, 3);
        assert_eq!(cfg.instruments["NQ"].commission_per_contract, 2.1);
    }

    #[test]
    fn rejects_bad_instruments_and_zero_periods() {
        for bad in ["MES", "MES:0:1.25", "MES:x:1", ":0.25:1", "MES:0.25:1:2:3"] {
            assert!(parse_instruments(bad).is_err(), "{bad:?} should fail");
        }
        let args = Args::parse_from(["signal_relay", "--sync-interval-ms", "0"]);
        assert!(matches!(args.into_settings(), Err(ConfigError::ZeroDuration(_))));
    }
}
