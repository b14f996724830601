// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Fill pipeline --------
pub static FILLS_ADMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fills_admitted_total", "fills admitted by the dedup store"),
        &["verified"],
    )
    .unwrap()
});

pub static FILLS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fills_rejected_total", "fills rejected as duplicate/stale/undecidable"),
        &["reason"],
    )
    .unwrap()
});

pub static TOPUPS_COMPUTED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("topups_computed_total", "top-up intents created").unwrap());

pub static TOPUPS_SKIPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("topups_skipped_total", "sizing skips"), &["reason"]).unwrap()
});

// -------- Order submission --------
pub static ORDERS_SUBMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_submitted_total", "order submissions (label: kind)"),
        &["kind"],
    )
    .unwrap()
});

pub static ORDER_RESULTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("order_results_total", "terminal order results (label: status)"),
        &["status"],
    )
    .unwrap()
});

pub static ORDER_FALLBACKS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("order_fallbacks_total", "limit-IOC to market fallback submissions").unwrap()
});

pub static ORDER_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("order_transport_retries_total", "transport-level submission retries")
        .unwrap()
});

// -------- Session health --------
pub static SESSION_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("session_state", "1 for the current session state (label: state)"),
        &["state"],
    )
    .unwrap()
});

pub static WS_RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ws_reconnects_total", "websocket reconnect attempts").unwrap());

pub static WS_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ws_messages_total", "inbound stream frames (label: channel)"),
        &["channel"],
    )
    .unwrap()
});

// -------- Caps & sink --------
pub static CAP_USED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("symbol_cap_used", "top-up contracts committed per symbol"),
        &["symbol"],
    )
    .unwrap()
});

pub static RECORD_DROPS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("record_drops_total", "structured records dropped by the sink").unwrap()
});

// ---- Config visibility ----
pub static CONFIG_MULTIPLIER: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("config_multiplier", "configured user multiplier").unwrap());

pub static CONFIG_DRY_RUN: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_dry_run", "1 if dry-run mode is active (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(FILLS_ADMITTED.clone())),
        REGISTRY.register(Box::new(FILLS_REJECTED.clone())),
        REGISTRY.register(Box::new(TOPUPS_COMPUTED.clone())),
        REGISTRY.register(Box::new(TOPUPS_SKIPPED.clone())),
        REGISTRY.register(Box::new(ORDERS_SUBMITTED.clone())),
        REGISTRY.register(Box::new(ORDER_RESULTS.clone())),
        REGISTRY.register(Box::new(ORDER_FALLBACKS.clone())),
        REGISTRY.register(Box::new(ORDER_RETRIES.clone())),
        REGISTRY.register(Box::new(SESSION_STATE.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(WS_MESSAGES.clone())),
        REGISTRY.register(Box::new(CAP_USED.clone())),
        REGISTRY.register(Box::new(RECORD_DROPS.clone())),
        REGISTRY.register(Box::new(CONFIG_MULTIPLIER.clone())),
        REGISTRY.register(Box::new(CONFIG_DRY_RUN.clone())),
    ] {
        let _ = m;
    }
}

pub fn set_session_state(state: crate::domain::SessionState) {
    use crate::domain::SessionState::*;
    for s in [Disconnected, Connecting, Authenticating, Subscribed, Degraded, Reconnecting, ShuttingDown]
    {
        SESSION_STATE
            .with_label_values(&[s.as_str()])
            .set(if s == state { 1 } else { 0 });
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .unwrap_or_else(|e| panic!("metrics bind {} failed: {}", addr, e));
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {}", e),
            }
        }
    });
}
