// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// One exchange-reported execution, normalized from either the
/// `user_trades` channel (per-fill increments with fill/trade ids) or the
/// `orders` channel (order-level cumulative totals). Fields the exchange
/// omits stay `None`; the dedup store decides what is usable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FillEvent {
    pub fill_id: Option<String>,
    pub trade_id: Option<String>,
    pub order_id: Option<String>,
    pub symbol: Option<String>,
    pub product_id: Option<i64>,
    pub side: Option<Side>,
    /// This increment, not cumulative.
    pub filled_qty: Option<i64>,
    /// Order-level running total, when the channel reports one.
    pub cumulative_qty: Option<i64>,
    pub price: Option<f64>,
    pub client_order_id: Option<String>,
    pub text: Option<String>,
    /// Order reported closed / fully filled (audit data only).
    pub order_closed: bool,
    pub ts_ns: i128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Market,
    LimitIoc,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Market => "market_order",
            OrderKind::LimitIoc => "limit_order",
        }
    }
}

impl Serialize for OrderKind {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

/// A sizing decision: mirror `size` contracts on `side` of the fill's
/// symbol. Consumed immediately by the execution engine, never persisted.
#[derive(Debug, Clone)]
pub struct TopUpIntent {
    pub audit_id: String,
    pub symbol: String,
    pub product_id: Option<i64>,
    pub side: Side,
    pub size: i64,
    /// Reference price from the fill; basis for the limit-IOC price.
    pub ref_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub product_id: Option<i64>,
    pub side: Side,
    pub size: i64,
    pub kind: OrderKind,
    pub limit_price: Option<String>,
    pub time_in_force: String,
    pub client_order_id: String,
}

/// Terminal outcome of one intent (primary submission, or primary plus a
/// single market fallback).
#[derive(Debug, Clone, PartialEq)]
pub enum OrderResult {
    Accepted { filled_qty: i64 },
    PartiallyFilled { filled_qty: i64 },
    Cancelled { reason: String },
    Rejected { reason: String },
}

impl OrderResult {
    pub fn label(&self) -> &'static str {
        match self {
            OrderResult::Accepted { .. } => "accepted",
            OrderResult::PartiallyFilled { .. } => "partially_filled",
            OrderResult::Cancelled { .. } => "cancelled",
            OrderResult::Rejected { .. } => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribed,
    Degraded,
    Reconnecting,
    ShuttingDown,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Subscribed => "subscribed",
            SessionState::Degraded => "degraded",
            SessionState::Reconnecting => "reconnecting",
            SessionState::ShuttingDown => "shutting_down",
        }
    }
}
