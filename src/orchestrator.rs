// ===============================
// src/orchestrator.rs
// ===============================
//
// Wires the stream into the decision pipeline: dedup admission -> top-up
// sizing -> cap reservation -> submission. Admission and cap state are
// mutated only on this task, so processing per order id is serialized by
// construction; submissions fan out to one worker per symbol so a slow
// exchange on one symbol never stalls the others.
//
// Budget is reserved when the intent is created, before submission, so the
// engine's transport retries and dry runs account against the symbol cap
// exactly once.
//
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::Config;
use crate::dedup::{Admission, DedupStore, RejectReason};
use crate::domain::{FillEvent, TopUpIntent};
use crate::executor::{Executor, OrderApi};
use crate::metrics::{CAP_USED, FILLS_ADMITTED, FILLS_REJECTED, TOPUPS_COMPUTED, TOPUPS_SKIPPED};
use crate::recorder::EventSink;
use crate::sizing::{size_topup, AllowList, SizingCfg, Skip, SymbolCaps};

#[derive(Clone, Debug)]
pub struct PipelineCfg {
    pub sizing: SizingCfg,
    pub allow: AllowList,
    pub self_tag_prefix: String,
    pub shutdown_grace: Duration,
}

impl PipelineCfg {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            sizing: SizingCfg {
                multiplier: cfg.multiplier,
                max_per_trade: cfg.max_topup_per_trade,
                max_per_symbol: cfg.max_topup_per_symbol,
            },
            allow: AllowList::parse(&cfg.allow_symbols),
            self_tag_prefix: cfg.self_tag_prefix.clone(),
            shutdown_grace: cfg.shutdown_grace,
        }
    }
}

struct Pipeline<A: OrderApi> {
    cfg: PipelineCfg,
    dedup: DedupStore,
    caps: SymbolCaps,
    workers: AHashMap<String, mpsc::Sender<TopUpIntent>>,
    tasks: JoinSet<()>,
    executor: Arc<Executor<A>>,
    sink: EventSink,
    seq: u64,
}

impl<A: OrderApi> Pipeline<A> {
    fn looks_like_ours(&self, fill: &FillEvent) -> bool {
        let prefix = &self.cfg.self_tag_prefix;
        let tagged = |s: &Option<String>| s.as_deref().is_some_and(|v| v.starts_with(prefix.as_str()));
        !prefix.is_empty() && (tagged(&fill.client_order_id) || tagged(&fill.text))
    }

    fn audit_id(&mut self, fill: &FillEvent) -> String {
        self.seq += 1;
        fill.trade_id
            .clone()
            .or_else(|| fill.fill_id.clone())
            .or_else(|| fill.order_id.as_ref().map(|o| format!("ord_{o}")))
            .unwrap_or_else(|| format!("ev_{}", self.seq))
    }

    async fn on_fill(&mut self, fill: FillEvent) {
        let audit_id = self.audit_id(&fill);

        // Loop guard: our own top-ups come back on the stream too. Skip
        // before the dedup store mutates anything on their behalf.
        if self.looks_like_ours(&fill) {
            TOPUPS_SKIPPED.with_label_values(&["own_fill"]).inc();
            self.sink.emit(
                "topup_skipped:own_fill",
                json!({ "audit_id": audit_id, "client_order_id": fill.client_order_id }),
            );
            return;
        }

        let (qty_delta, verified) = match self.dedup.admit(&fill) {
            Admission::Accepted { qty_delta, verified } => (qty_delta, verified),
            Admission::Rejected(RejectReason::Undecidable) => {
                FILLS_REJECTED.with_label_values(&["no_usable_identity"]).inc();
                self.sink.emit(
                    "topup_skipped:no_usable_identity",
                    json!({ "audit_id": audit_id, "symbol": fill.symbol }),
                );
                return;
            }
            Admission::Rejected(reason) => {
                FILLS_REJECTED.with_label_values(&[reason.as_str()]).inc();
                self.sink.emit(
                    "fill_rejected_duplicate",
                    json!({ "audit_id": audit_id, "reason": reason.as_str() }),
                );
                return;
            }
        };

        self.sink.emit(
            "fill_admitted",
            json!({
                "audit_id": audit_id,
                "symbol": fill.symbol,
                "qty_delta": qty_delta,
                "verified": verified,
                "order_closed": fill.order_closed,
            }),
        );
        FILLS_ADMITTED
            .with_label_values(&[if verified { "true" } else { "false" }])
            .inc();

        let Some(side) = fill.side else {
            TOPUPS_SKIPPED.with_label_values(&["missing_side"]).inc();
            self.sink
                .emit("topup_skipped:missing_side", json!({ "audit_id": audit_id }));
            return;
        };

        let sized = match size_topup(
            fill.symbol.as_deref(),
            qty_delta,
            &self.cfg.sizing,
            &self.cfg.allow,
            &self.caps,
        ) {
            Ok(s) => s,
            Err(skip) => {
                TOPUPS_SKIPPED.with_label_values(&[skip.as_str()]).inc();
                let kind = match skip {
                    Skip::CapExhausted => "cap_exhausted".to_string(),
                    other => format!("topup_skipped:{}", other.as_str()),
                };
                self.sink.emit(
                    &kind,
                    json!({ "audit_id": audit_id, "symbol": fill.symbol, "qty_delta": qty_delta }),
                );
                return;
            }
        };

        if let Some(sym) = fill.symbol.as_deref() {
            self.caps.reserve(sym, sized.size);
            CAP_USED.with_label_values(&[sym]).set(self.caps.used(sym));
        }
        TOPUPS_COMPUTED.inc();

        let intent = TopUpIntent {
            audit_id: audit_id.clone(),
            symbol: fill.symbol.clone().unwrap_or_default(),
            product_id: fill.product_id,
            side,
            size: sized.size,
            ref_price: fill.price,
        };
        self.sink.emit(
            "topup_computed",
            json!({
                "audit_id": audit_id,
                "symbol": intent.symbol,
                "side": side.as_str(),
                "qty_delta": qty_delta,
                "size": intent.size,
                "clipped_by_trade_cap": sized.clipped_by_trade_cap,
                "clipped_by_symbol_cap": sized.clipped_by_symbol_cap,
            }),
        );

        self.dispatch(intent);
    }

    /// One submission worker per symbol, spawned on first use. Intents for
    /// a symbol are processed in order; symbols proceed independently. A
    /// full queue drops the intent rather than stalling admission for other
    /// symbols; the cap reservation stands.
    fn dispatch(&mut self, intent: TopUpIntent) {
        let key = intent.symbol.clone();
        let tx = match self.workers.get(&key) {
            Some(tx) => tx.clone(),
            None => {
                let (tx, mut rx) = mpsc::channel::<TopUpIntent>(256);
                let exec = self.executor.clone();
                self.tasks.spawn(async move {
                    while let Some(intent) = rx.recv().await {
                        let _ = exec.execute(&intent).await;
                    }
                });
                self.workers.insert(key.clone(), tx.clone());
                tx
            }
        };
        if let Err(e) = tx.try_send(intent) {
            let intent = e.into_inner();
            TOPUPS_SKIPPED.with_label_values(&["queue_full"]).inc();
            self.sink.emit(
                "topup_dropped",
                json!({
                    "audit_id": intent.audit_id,
                    "symbol": key,
                    "size": intent.size,
                    "reason": "queue_full",
                }),
            );
            warn!(symbol = %key, audit_id = %intent.audit_id, "submission queue unavailable, intent dropped");
        }
    }
}

pub async fn run<A: OrderApi>(
    mut fill_rx: mpsc::Receiver<FillEvent>,
    executor: Arc<Executor<A>>,
    cfg: PipelineCfg,
    sink: EventSink,
    mut stop_rx: watch::Receiver<bool>,
) {
    let shutdown_grace = cfg.shutdown_grace;
    let mut pipe = Pipeline {
        cfg,
        dedup: DedupStore::new(),
        caps: SymbolCaps::new(),
        workers: AHashMap::new(),
        tasks: JoinSet::new(),
        executor,
        sink: sink.clone(),
        seq: 0,
    };

    loop {
        tokio::select! {
            res = stop_rx.changed() => {
                if res.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            maybe = fill_rx.recv() => {
                match maybe {
                    Some(fill) => pipe.on_fill(fill).await,
                    None => break,
                }
            }
        }
    }

    // Stop admitting, let already-admitted intents finish their
    // submission/fallback cycle within the grace period.
    drop(fill_rx);
    pipe.workers.clear();
    info!(in_flight = pipe.tasks.len(), "orchestrator draining submissions");
    let drain = async {
        while pipe.tasks.join_next().await.is_some() {}
    };
    if timeout(shutdown_grace, drain).await.is_err() {
        warn!(
            abandoned = pipe.tasks.len(),
            "shutdown grace elapsed, abandoning in-flight submissions"
        );
        sink.emit("shutdown", json!({ "abandoned_submissions": pipe.tasks.len() }));
    } else {
        sink.emit("shutdown", json!({ "abandoned_submissions": 0 }));
    }
    info!("orchestrator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderKind, Side};
    use crate::executor::tests::MockApi;
    use crate::executor::{ExecCfg, SubmitOutcome, TransportError};

    fn pipeline_cfg(multiplier: f64, max_per_trade: i64, max_per_symbol: i64) -> PipelineCfg {
        PipelineCfg {
            sizing: SizingCfg { multiplier, max_per_trade, max_per_symbol },
            allow: AllowList::All,
            self_tag_prefix: "BOTMULT_".to_string(),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    fn exec_cfg() -> ExecCfg {
        ExecCfg {
            kind: OrderKind::Market,
            time_in_force: "ioc".to_string(),
            limit_slippage_bps: 0.0,
            fallback_market: false,
            dry_run: false,
            http_retries: 3,
            self_tag_prefix: "BOTMULT_".to_string(),
        }
    }

    fn user_trade(fill_id: &str, symbol: &str, qty: i64) -> FillEvent {
        FillEvent {
            fill_id: Some(fill_id.to_string()),
            symbol: Some(symbol.to_string()),
            side: Some(Side::Buy),
            filled_qty: Some(qty),
            price: Some(100.0),
            ..FillEvent::default()
        }
    }

    fn order_update(order_id: &str, symbol: &str, cum: i64) -> FillEvent {
        FillEvent {
            order_id: Some(order_id.to_string()),
            symbol: Some(symbol.to_string()),
            side: Some(Side::Sell),
            cumulative_qty: Some(cum),
            price: Some(100.0),
            ..FillEvent::default()
        }
    }

    async fn drive(api: MockApi, cfg: PipelineCfg, fills: Vec<FillEvent>) {
        let exec = Arc::new(Executor::new(api, exec_cfg(), EventSink::disabled()));
        let (fill_tx, fill_rx) = mpsc::channel(64);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(fill_rx, exec, cfg, EventSink::disabled(), stop_rx));
        for f in fills {
            fill_tx.send(f).await.unwrap();
        }
        drop(fill_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn redelivered_fill_is_mirrored_at_most_once() {
        let api = MockApi::default();
        drive(
            api.clone(),
            pipeline_cfg(2.0, 1_000_000, 10_000_000),
            vec![
                user_trade("f1", "BTCUSDT", 600),
                user_trade("f1", "BTCUSDT", 600), // redelivery after reconnect
            ],
        )
        .await;
        let reqs = api.requests.lock().unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].size, 600);
        assert_eq!(reqs[0].side, Side::Buy);
    }

    #[tokio::test]
    async fn cumulative_redelivery_yields_increase_only() {
        let api = MockApi::default();
        drive(
            api.clone(),
            pipeline_cfg(2.0, 1_000_000, 10_000_000),
            vec![
                order_update("o1", "ETHUSDT", 100),
                order_update("o1", "ETHUSDT", 100), // same total again: stale
                order_update("o1", "ETHUSDT", 250),
            ],
        )
        .await;
        let reqs = api.requests.lock().unwrap();
        let sizes: Vec<i64> = reqs.iter().map(|r| r.size).collect();
        assert_eq!(sizes, vec![100, 150]);
    }

    #[tokio::test]
    async fn symbol_cap_clips_and_then_exhausts() {
        // multiplier 2.0, per-trade 1000, per-symbol 1500
        let api = MockApi::default();
        drive(
            api.clone(),
            pipeline_cfg(2.0, 1000, 1500),
            vec![
                user_trade("f1", "BTCUSDT", 600),  // -> 600
                user_trade("f2", "BTCUSDT", 1200), // raw 1200 -> 1000 -> remainder 900
                user_trade("f3", "BTCUSDT", 50),   // budget is 0 now
            ],
        )
        .await;
        let reqs = api.requests.lock().unwrap();
        let sizes: Vec<i64> = reqs.iter().map(|r| r.size).collect();
        assert_eq!(sizes, vec![600, 900]);
    }

    #[tokio::test]
    async fn own_fills_never_loop() {
        let api = MockApi::default();
        let mut own = user_trade("f1", "BTCUSDT", 600);
        own.client_order_id = Some("BOTMULT_deadbeef".to_string());
        drive(api.clone(), pipeline_cfg(2.0, 1_000_000, 10_000_000), vec![own]).await;
        assert!(api.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn multiplier_at_one_submits_nothing() {
        let api = MockApi::default();
        drive(
            api.clone(),
            pipeline_cfg(1.0, 1_000_000, 10_000_000),
            vec![user_trade("f1", "BTCUSDT", 600)],
        )
        .await;
        assert!(api.requests.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn engine_retries_do_not_double_count_the_cap() {
        // First submission needs a transport retry; the cap must still see
        // one logical top-up of 600 against a budget of 600.
        let api = MockApi::scripted(vec![
            Ok(SubmitOutcome::Accepted { filled_qty: 600 }),
            Err(TransportError::Status(503)),
        ]);
        drive(
            api.clone(),
            pipeline_cfg(2.0, 1000, 600),
            vec![
                user_trade("f1", "BTCUSDT", 600),
                user_trade("f2", "BTCUSDT", 100), // cap exhausted, no submission
            ],
        )
        .await;
        let reqs = api.requests.lock().unwrap();
        // two transport attempts, both for the single 600 intent
        assert_eq!(reqs.len(), 2);
        assert!(reqs.iter().all(|r| r.size == 600));
    }

    #[tokio::test]
    async fn full_submission_queue_never_blocks_other_symbols() {
        let api = MockApi::default();
        let exec = Arc::new(Executor::new(api.clone(), exec_cfg(), EventSink::disabled()));
        let mut pipe = Pipeline {
            cfg: pipeline_cfg(2.0, 1_000_000, 10_000_000),
            dedup: DedupStore::new(),
            caps: SymbolCaps::new(),
            workers: AHashMap::new(),
            tasks: JoinSet::new(),
            executor: exec,
            sink: EventSink::disabled(),
            seq: 0,
        };

        // a stalled worker for BTCUSDT: capacity 1, already full, receiver
        // parked so nothing drains
        let (tx, _parked_rx) = mpsc::channel(1);
        tx.try_send(TopUpIntent {
            audit_id: "parked".to_string(),
            symbol: "BTCUSDT".to_string(),
            product_id: None,
            side: Side::Buy,
            size: 1,
            ref_price: None,
        })
        .unwrap();
        pipe.workers.insert("BTCUSDT".to_string(), tx);

        // processing the stalled symbol returns immediately, dropping the
        // intent; an unrelated symbol still gets its submission
        pipe.on_fill(user_trade("f1", "BTCUSDT", 600)).await;
        pipe.on_fill(user_trade("f2", "ETHUSDT", 100)).await;

        pipe.workers.clear();
        while pipe.tasks.join_next().await.is_some() {}
        let reqs = api.requests.lock().unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].symbol, "ETHUSDT");
        assert_eq!(reqs[0].size, 100);
    }

    #[tokio::test]
    async fn undecidable_fills_are_skipped_without_crashing_the_stream() {
        let api = MockApi::default();
        drive(
            api.clone(),
            pipeline_cfg(2.0, 1_000_000, 10_000_000),
            vec![
                FillEvent::default(), // no identity at all
                user_trade("f1", "BTCUSDT", 100),
            ],
        )
        .await;
        // the anomaly is skipped, the next fill still processes
        assert_eq!(api.requests.lock().unwrap().len(), 1);
    }
}
