// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::info;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Connections --------
pub static CONNECTIONS_ACTIVE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("connections_active", "live client connections").unwrap());

pub static CONNECTIONS_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("connections_total", "accepted client connections").unwrap());

pub static CONNECTIONS_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("connections_rejected_total", "connections refused at capacity").unwrap()
});

pub static EVICTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("evictions_total", "connections dropped (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

// -------- Signals & sync --------
pub static SIGNALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("signals_total", "accepted directives (label: action)"),
        &["action"],
    )
    .unwrap()
});

pub static SIGNALS_REJECTED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("signals_rejected_total", "malformed directives").unwrap());

pub static BROADCAST_LINES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("broadcast_lines_total", "lines delivered across all connections").unwrap()
});

pub static TARGET_NET: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("target_net", "net target per symbol"), &["symbol"]).unwrap()
});

// -------- Fills & PnL --------
pub static FILLS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("fills_total", "fill reports from clients").unwrap());

pub static PNL_UNREALIZED: Lazy<Gauge> = Lazy::new(|| {
    Gauge::new("pnl_unrealized_total", "summed unrealized PnL across accounts").unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry; repeat calls are harmless
    for m in [
        REGISTRY.register(Box::new(CONNECTIONS_ACTIVE.clone())),
        REGISTRY.register(Box::new(CONNECTIONS_TOTAL.clone())),
        REGISTRY.register(Box::new(CONNECTIONS_REJECTED.clone())),
        REGISTRY.register(Box::new(EVICTIONS.clone())),
        REGISTRY.register(Box::new(SIGNALS.clone())),
        REGISTRY.register(Box::new(SIGNALS_REJECTED.clone())),
        REGISTRY.register(Box::new(BROADCAST_LINES.clone())),
        REGISTRY.register(Box::new(TARGET_NET.clone())),
        REGISTRY.register(Box::new(FILLS.clone())),
        REGISTRY.register(Box::new(PNL_UNREALIZED.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let resp = Response::builder()
        .header(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
        .body(Body::from(encode_metrics()))
        .unwrap_or_else(|_| Response::new(Body::empty()));
    Ok(resp)
}

/// Serve every path with the metrics text until the server fails.
pub async fn serve_metrics(port: u16) -> Result<(), hyper::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!(%addr, "metrics listening on /metrics");
    server.await
}
