// ===============================
// src/executor.rs
// ===============================
//
// Order submission state machine: primary attempt -> optional market
// fallback -> terminal result. Transport failures are retried inside an
// attempt budget; business rejections are terminal. The exchange transport
// sits behind the OrderApi trait so the pipeline runs against scripted
// responses in tests and against Delta REST in production.
//
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::{Config, Credentials};
use crate::delta;
use crate::domain::{OrderKind, OrderRequest, OrderResult, Side, TopUpIntent};
use crate::metrics::{ORDERS_SUBMITTED, ORDER_FALLBACKS, ORDER_RESULTS, ORDER_RETRIES};
use crate::recorder::EventSink;

/// Cancellation reason Delta reports when an IOC limit could not be matched
/// against available book depth.
pub const CANCEL_NO_DEPTH: &str = "order_size_not_available_in_orderbook";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http status {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Request(String),
}

/// Exchange-level outcome of a single submission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Accepted { filled_qty: i64 },
    Cancelled { reason: String, unfilled: i64 },
    /// Business-logic rejection (margin, risk, invalid symbol). Terminal.
    Rejected { reason: String },
}

pub trait OrderApi: Send + Sync + 'static {
    fn submit(
        &self,
        req: &OrderRequest,
    ) -> impl std::future::Future<Output = Result<SubmitOutcome, TransportError>> + Send;
}

#[derive(Clone, Debug)]
pub struct ExecCfg {
    pub kind: OrderKind,
    pub time_in_force: String,
    pub limit_slippage_bps: f64,
    pub fallback_market: bool,
    pub dry_run: bool,
    pub http_retries: u32,
    pub self_tag_prefix: String,
}

impl ExecCfg {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            kind: cfg.order_kind,
            time_in_force: cfg.time_in_force.clone(),
            limit_slippage_bps: cfg.limit_slippage_bps,
            fallback_market: cfg.limit_ioc_fallback_market,
            dry_run: cfg.dry_run,
            http_retries: cfg.http_retries.max(1),
            self_tag_prefix: cfg.self_tag_prefix.clone(),
        }
    }
}

/// Slippage-adjusted limit price, in the adverse direction for the side so
/// the IOC is more likely to fill.
fn adjust_limit(side: Side, base_price: f64, slippage_bps: f64) -> String {
    let slip = slippage_bps / 10_000.0;
    let p = if slip > 0.0 {
        match side {
            Side::Buy => base_price * (1.0 + slip),
            Side::Sell => base_price * (1.0 - slip),
        }
    } else {
        base_price
    };
    // keep plenty of precision; the exchange rounds to tick size
    let s = format!("{p:.8}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn retry_delay(attempt: u32) -> Duration {
    let base = 0.5_f64 * 2.0_f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = 1.0 + rand::thread_rng().gen::<f64>() * 0.25;
    Duration::from_secs_f64(base.min(4.0) * jitter)
}

pub struct Executor<A> {
    api: A,
    cfg: ExecCfg,
    sink: EventSink,
}

impl<A: OrderApi> Executor<A> {
    pub fn new(api: A, cfg: ExecCfg, sink: EventSink) -> Self {
        Self { api, cfg, sink }
    }

    /// Drive one intent to a terminal result: at most one primary
    /// submission plus one market fallback, each with its own transport
    /// retry budget.
    pub async fn execute(&self, intent: &TopUpIntent) -> OrderResult {
        let req = match self.build_request(intent, self.cfg.kind, intent.size) {
            Ok(r) => r,
            Err(result) => {
                self.record_result(intent, &result, false);
                return result;
            }
        };

        let outcome = self.submit(intent, &req, false).await;

        if let SubmitOutcome::Cancelled { reason, unfilled } = &outcome {
            let depth_cancel = self.cfg.kind == OrderKind::LimitIoc
                && reason == CANCEL_NO_DEPTH
                && *unfilled > 0;
            if depth_cancel && self.cfg.fallback_market {
                ORDER_FALLBACKS.inc();
                self.sink.emit(
                    "order_fallback",
                    json!({
                        "audit_id": intent.audit_id,
                        "symbol": intent.symbol,
                        "side": intent.side.as_str(),
                        "remainder": unfilled,
                        "limit_price": req.limit_price,
                    }),
                );
                warn!(audit_id = %intent.audit_id, remainder = unfilled, "IOC cancelled for depth, falling back to market");

                // second and last attempt, for the unfilled remainder only
                let fb_req = match self.build_request(intent, OrderKind::Market, *unfilled) {
                    Ok(r) => r,
                    Err(result) => {
                        self.record_result(intent, &result, true);
                        return result;
                    }
                };
                let fb_outcome = self.submit(intent, &fb_req, true).await;
                let filled_before = intent.size - unfilled;
                let result = Self::to_result(fb_outcome, &fb_req, filled_before);
                self.record_result(intent, &result, true);
                return result;
            }
        }

        let result = Self::to_result(outcome, &req, 0);
        self.record_result(intent, &result, false);
        result
    }

    fn build_request(
        &self,
        intent: &TopUpIntent,
        kind: OrderKind,
        size: i64,
    ) -> Result<OrderRequest, OrderResult> {
        let limit_price = match kind {
            OrderKind::Market => None,
            OrderKind::LimitIoc => match intent.ref_price {
                Some(p) if p > 0.0 => {
                    Some(adjust_limit(intent.side, p, self.cfg.limit_slippage_bps))
                }
                _ => {
                    return Err(OrderResult::Rejected {
                        reason: "missing_limit_price".to_string(),
                    })
                }
            },
        };
        Ok(OrderRequest {
            symbol: intent.symbol.clone(),
            product_id: intent.product_id,
            side: intent.side,
            size,
            kind,
            limit_price,
            time_in_force: self.cfg.time_in_force.clone(),
            client_order_id: delta::build_client_order_id(&self.cfg.self_tag_prefix),
        })
    }

    /// One submission with the transport retry budget. Exhaustion maps to a
    /// terminal rejection; business rejections come back untouched.
    async fn submit(&self, intent: &TopUpIntent, req: &OrderRequest, fallback: bool) -> SubmitOutcome {
        ORDERS_SUBMITTED.with_label_values(&[req.kind.as_str()]).inc();
        self.sink.emit(
            "order_submitted",
            json!({
                "audit_id": intent.audit_id,
                "req": req,
                "fallback": fallback,
                "dry_run": self.cfg.dry_run,
            }),
        );

        if self.cfg.dry_run {
            info!(audit_id = %intent.audit_id, symbol = %req.symbol, side = %req.side.as_str(),
                  size = req.size, kind = %req.kind.as_str(), "dry-run: order not sent");
            return SubmitOutcome::Accepted { filled_qty: req.size };
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.api.submit(req).await {
                Ok(outcome) => return outcome,
                Err(e) if attempt < self.cfg.http_retries => {
                    ORDER_RETRIES.inc();
                    let delay = retry_delay(attempt);
                    warn!(audit_id = %intent.audit_id, %e, attempt, delay_ms = delay.as_millis() as u64,
                          "transport error, retrying submission");
                    sleep(delay).await;
                }
                Err(e) => {
                    return SubmitOutcome::Rejected { reason: format!("transport: {e}") };
                }
            }
        }
    }

    fn to_result(outcome: SubmitOutcome, req: &OrderRequest, filled_before: i64) -> OrderResult {
        match outcome {
            SubmitOutcome::Accepted { filled_qty } => {
                let total = filled_before + filled_qty;
                if total < req.size + filled_before && total > 0 {
                    OrderResult::PartiallyFilled { filled_qty: total }
                } else {
                    OrderResult::Accepted { filled_qty: total }
                }
            }
            SubmitOutcome::Cancelled { reason, unfilled } => {
                let filled = filled_before + (req.size - unfilled).max(0);
                if filled > 0 {
                    OrderResult::PartiallyFilled { filled_qty: filled }
                } else {
                    OrderResult::Cancelled { reason }
                }
            }
            SubmitOutcome::Rejected { reason } => {
                if filled_before > 0 {
                    OrderResult::PartiallyFilled { filled_qty: filled_before }
                } else {
                    OrderResult::Rejected { reason }
                }
            }
        }
    }

    fn record_result(&self, intent: &TopUpIntent, result: &OrderResult, after_fallback: bool) {
        ORDER_RESULTS.with_label_values(&[result.label()]).inc();
        self.sink.emit(
            "order_result",
            json!({
                "audit_id": intent.audit_id,
                "symbol": intent.symbol,
                "status": result.label(),
                "detail": format!("{result:?}"),
                "after_fallback": after_fallback,
            }),
        );
    }
}

// ---- Delta REST transport ----

pub struct RestApi {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    api_secret: String,
    user_agent: String,
}

impl RestApi {
    pub fn new(cfg: &Config, creds: &Credentials) -> Self {
        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout)
            .connect_timeout(cfg.http_conn_timeout)
            .build()
            .expect("reqwest client");
        Self {
            http,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            api_key: creds.api_key.clone(),
            api_secret: creds.api_secret.clone(),
            user_agent: creds.user_agent.clone(),
        }
    }
}

impl OrderApi for RestApi {
    async fn submit(&self, req: &OrderRequest) -> Result<SubmitOutcome, TransportError> {
        let path = "/v2/orders";
        let mut body = json!({
            "side": req.side.as_str(),
            "order_type": req.kind.as_str(),
            "time_in_force": req.time_in_force,
            "size": req.size,
            "reduce_only": false,
            "client_order_id": req.client_order_id,
        });
        if let Some(pid) = req.product_id {
            body["product_id"] = json!(pid);
        }
        if let Some(lp) = &req.limit_price {
            body["limit_price"] = json!(lp);
        }
        let body_s = body.to_string();

        let ts = delta::timestamp_secs().to_string();
        let sig = delta::sign(&self.api_secret, "POST", &ts, path, &body_s);

        let rsp = self
            .http
            .post(format!("{}{}", self.api_base, path))
            .header("api-key", &self.api_key)
            .header("timestamp", &ts)
            .header("signature", sig)
            .header("User-Agent", &self.user_agent)
            .header("Content-Type", "application/json")
            .body(body_s)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = rsp.status().as_u16();
        if status == 429 || (500..600).contains(&status) {
            return Err(TransportError::Status(status));
        }

        let v: serde_json::Value = rsp.json().await.unwrap_or_else(|_| json!({}));
        if !(200..300).contains(&status) {
            let reason = v
                .get("error")
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("status {status}"));
            return Ok(SubmitOutcome::Rejected { reason });
        }

        let result = v.get("result").cloned().unwrap_or_else(|| json!({}));
        let state = result.get("state").and_then(|s| s.as_str()).unwrap_or("");
        if state == "cancelled" {
            let reason = result
                .get("cancellation_reason")
                .and_then(|s| s.as_str())
                .unwrap_or("cancelled")
                .to_string();
            let unfilled = result
                .get("unfilled_size")
                .and_then(|x| x.as_i64())
                .unwrap_or(req.size);
            Ok(SubmitOutcome::Cancelled { reason, unfilled })
        } else {
            let unfilled = result
                .get("unfilled_size")
                .and_then(|x| x.as_i64())
                .unwrap_or(0);
            Ok(SubmitOutcome::Accepted { filled_qty: (req.size - unfilled).max(0) })
        }
    }
}
