// ===============================
// src/main.rs
// ===============================
//
// delta_mirror_bot — mirrors the account's own fills on Delta Exchange
// with scaled top-up orders (multiplier x), over a reconnecting
// authenticated websocket session, with per-trade/per-symbol caps,
// dedup-safe fill handling, Prometheus metrics, and a JSONL audit trail.
//
mod config;
mod dedup;
mod delta;
mod domain;
mod executor;
mod metrics;
mod orchestrator;
mod recorder;
mod session;
mod sizing;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::executor::{ExecCfg, Executor, RestApi};
use crate::orchestrator::PipelineCfg;
use crate::recorder::EventSink;
use crate::session::SessionCfg;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ---- Load config & credentials ----
    let (cfg, creds) = config::load();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(cfg.metrics_port));

    info!(
        multiplier = cfg.multiplier,
        dry_run = cfg.dry_run,
        order_type = cfg.order_kind.as_str(),
        time_in_force = %cfg.time_in_force,
        max_per_trade = cfg.max_topup_per_trade,
        max_per_symbol = cfg.max_topup_per_symbol,
        allow_symbols = ?cfg.allow_symbols,
        ws = %cfg.ws_url,
        rest = %cfg.api_base,
        "startup config"
    );
    metrics::CONFIG_MULTIPLIER.set(cfg.multiplier);
    metrics::CONFIG_DRY_RUN
        .with_label_values(&[if cfg.dry_run { "dry_run" } else { "live" }])
        .set(1);

    // ---- Structured event sink (JSONL) ----
    let record_path = cfg.record_file.clone().unwrap_or_else(|| {
        format!(
            "{}/delta_ws_events_{}.jsonl",
            cfg.log_dir.trim_end_matches('/'),
            chrono::Utc::now().date_naive()
        )
    });
    let (rec_tx, rec_rx) = mpsc::channel(8192);
    let recorder_handle = tokio::spawn(recorder::run(rec_rx, record_path));
    let sink = EventSink::new(rec_tx);

    // ---- Buses ----
    let (fill_tx, fill_rx) = mpsc::channel(4096);
    let (stop_tx, stop_rx) = watch::channel(false);

    // ---- Execution engine ----
    let api = RestApi::new(&cfg, &creds);
    let exec = Arc::new(Executor::new(api, ExecCfg::from_config(&cfg), sink.clone()));

    // ---- Session (ws) + orchestrator (pipeline) ----
    let session_handle = tokio::spawn(session::run(
        SessionCfg::from_config(&cfg),
        creds,
        fill_tx,
        sink.clone(),
        stop_rx.clone(),
    ));
    let orchestrator_handle = tokio::spawn(orchestrator::run(
        fill_rx,
        exec,
        PipelineCfg::from_config(&cfg),
        sink.clone(),
        stop_rx,
    ));

    // ---- Wait for the external stop signal ----
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("stop signal received, shutting down"),
        Err(e) => error!(?e, "signal handler failed, shutting down"),
    }
    let _ = stop_tx.send(true);

    // Session stops producing first; the orchestrator drains in-flight
    // submissions within its own grace period.
    let _ = session_handle.await;
    let _ = orchestrator_handle.await;

    // closing the sink lets the recorder flush its buffer and exit
    drop(sink);
    let _ = recorder_handle.await;
    info!("shutdown complete");
}
