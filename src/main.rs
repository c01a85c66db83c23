// ===============================
// src/main.rs
// ===============================
/*
 # run with short timers and a status file for the dashboard
 SYNC_INTERVAL_MS=2000 STATUS_FILE=./status/relay.json cargo run --release

 # directives are read from stdin, one per line
 echo "LONG|MES|2" | nc localhost 5000   # (client side: watch the relay)

 curl -s localhost:9898/metrics | egrep '^(connections_active|signals_total|pnl_unrealized_total)'
*/
/*
=============================================================================
Project : signal_relay — one-to-many trade signal distribution over TCP
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Relays directives from one signal source to many executing
          clients, keeps a per-symbol target book that is re-synced to
          every client periodically, supervises client liveness with
          heartbeats, and aggregates per-account PnL from reported fills.
=============================================================================
*/
use anyhow::Context;
use signal_relay::{config, metrics, SignalServer};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let settings = config::load().context("invalid configuration")?;
    info!(
        listen = %settings.server.listen_addr,
        instruments = ?settings.server.instruments.keys().collect::<Vec<_>>(),
        status_file = ?settings.server.status_file,
        metrics_port = settings.metrics_port,
        "startup config"
    );

    // ---- Metrics ----
    metrics::init();
    if settings.metrics_port != 0 {
        let port = settings.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = metrics::serve_metrics(port).await {
                error!(error = %e, port, "metrics server failed");
            }
        });
    }

    // ---- Server ----
    let server = SignalServer::bind(settings.server).await?;
    server.start()?;

    // ---- Directive intake (stdin) ----
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, shutting down");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(raw)) if raw.trim().is_empty() => continue,
                Ok(Some(raw)) => {
                    if let Err(e) = server.submit_signal(&raw).await {
                        warn!(error = %e, "signal not relayed");
                    }
                }
                Ok(None) => {
                    info!("signal input closed, relay keeps running until ctrl-c");
                    stdin_open = false;
                }
                Err(e) => {
                    error!(error = %e, "stdin read failed, signal input disabled");
                    stdin_open = false;
                }
            },
        }
    }

    let status = server.status();
    info!(
        connections = status.connections,
        total_pnl = status.total_pnl,
        profitable_accounts = status.profitable_accounts,
        "final status"
    );
    server.stop().await;
    Ok(())
}
