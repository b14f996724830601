// ===============================
// src/delta.rs
// ===============================
//
// Delta Exchange protocol helpers: HMAC-SHA256 request/socket signing,
// websocket frame builders, and tolerant field extraction from the loosely
// shaped payloads the orders / user_trades channels deliver.
//
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rand::Rng;
use serde_json::{json, Value};
use sha2::Sha256;

use crate::domain::{FillEvent, Side};

pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn now_ns() -> i128 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0) as i128
}

/// Delta signs `method + timestamp + path + body` (body only for JSON
/// POST/DELETE) with HMAC-SHA256, hex-encoded.
pub fn sign(secret: &str, method: &str, timestamp: &str, path: &str, body: &str) -> String {
    let msg = format!("{method}{timestamp}{path}{body}");
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(msg.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Socket auth frame: signature over `GET + ts + /live`.
pub fn auth_frame(api_key: &str, api_secret: &str) -> (String, String) {
    let ts = timestamp_secs().to_string();
    let sig = sign(api_secret, "GET", &ts, "/live", "");
    let frame = json!({
        "type": "auth",
        "payload": { "api-key": api_key, "signature": sig, "timestamp": ts }
    });
    (frame.to_string(), ts)
}

pub fn subscribe_frame(channel: &str, symbols: &[&str]) -> String {
    json!({
        "type": "subscribe",
        "payload": { "channels": [ { "name": channel, "symbols": symbols } ] }
    })
    .to_string()
}

pub fn enable_heartbeat_frame() -> String {
    json!({ "type": "enable_heartbeat" }).to_string()
}

/// Client order id carrying the self-tag prefix so our own fills are
/// recognizable on the stream and never mirrored again.
pub fn build_client_order_id(prefix: &str) -> String {
    let suffix: u64 = rand::thread_rng().gen();
    format!("{prefix}{suffix:010x}")
}

// ---- tolerant payload extraction ----

fn get_str(ev: &Value, keys: &[&str]) -> Option<String> {
    for k in keys {
        match ev.get(*k) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn get_qty(ev: &Value, keys: &[&str]) -> Option<i64> {
    for k in keys {
        match ev.get(*k) {
            Some(Value::Number(n)) => return n.as_i64(),
            Some(Value::String(s)) => {
                if let Ok(v) = s.parse::<i64>() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

fn get_price(ev: &Value, keys: &[&str]) -> Option<f64> {
    for k in keys {
        match ev.get(*k) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => {
                if let Ok(v) = s.parse::<f64>() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn extract_symbol(ev: &Value) -> Option<String> {
    get_str(ev, &["symbol", "product_symbol", "product_symbol_name"])
        .map(|s| s.to_ascii_uppercase())
}

pub fn extract_product_id(ev: &Value) -> Option<i64> {
    get_qty(ev, &["product_id", "instrument_id"])
}

pub fn extract_side(ev: &Value) -> Option<Side> {
    let s = get_str(ev, &["side", "order_side"])?;
    match s.to_ascii_lowercase().chars().next() {
        Some('b') => Some(Side::Buy),
        Some('s') => Some(Side::Sell),
        _ => None,
    }
}

/// Normalize one `user_trades` entry: per-fill increment plus fill/trade ids.
pub fn parse_user_trade(ev: &Value) -> FillEvent {
    FillEvent {
        fill_id: get_str(ev, &["fill_id"]),
        trade_id: get_str(ev, &["id", "trade_id"]),
        order_id: get_str(ev, &["order_id"]),
        symbol: extract_symbol(ev),
        product_id: extract_product_id(ev),
        side: extract_side(ev),
        filled_qty: get_qty(ev, &["size", "fill_size", "quantity", "filled_quantity"]),
        cumulative_qty: None,
        price: get_price(ev, &["price"]),
        client_order_id: get_str(ev, &["client_order_id", "client_id"]),
        text: get_str(ev, &["text"]),
        order_closed: false,
        ts_ns: now_ns(),
    }
}

/// Normalize one `orders` entry: order-level cumulative filled size.
pub fn parse_order_update(ev: &Value) -> FillEvent {
    let state = get_str(ev, &["state"]).unwrap_or_default().to_ascii_lowercase();
    let unfilled = get_qty(ev, &["unfilled_size"]);
    FillEvent {
        fill_id: get_str(ev, &["fill_id"]),
        trade_id: None,
        order_id: get_str(ev, &["id", "order_id"]),
        symbol: extract_symbol(ev),
        product_id: extract_product_id(ev),
        side: extract_side(ev),
        filled_qty: None,
        cumulative_qty: get_qty(ev, &["filled_size", "total_filled", "cumulative_qty"]),
        price: get_price(ev, &["average_fill_price", "price"]),
        client_order_id: get_str(ev, &["client_order_id", "client_id"]),
        text: get_str(ev, &["text"]),
        order_closed: state == "closed" || unfilled == Some(0),
        ts_ns: now_ns(),
    }
}

/// Channels wrap events as a single object or a list under various keys.
pub fn payload_events<'a>(msg: &'a Value, keys: &[&str]) -> Vec<&'a Value> {
    for k in keys {
        if let Some(p) = msg.get(*k) {
            return match p {
                Value::Array(items) => items.iter().collect(),
                Value::Object(_) => vec![p],
                _ => vec![],
            };
        }
    }
    // some frames inline the event fields at the top level
    if msg.is_object() {
        vec![msg]
    } else {
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_stable_hex() {
        let a = sign("secret", "GET", "1700000000", "/live", "");
        let b = sign("secret", "GET", "1700000000", "/live", "");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        // body participates in the signature
        let c = sign("secret", "POST", "1700000000", "/v2/orders", "{}");
        assert_ne!(a, c);
    }

    #[test]
    fn user_trade_extraction_tolerates_shapes() {
        let ev = serde_json::json!({
            "fill_id": "f-1",
            "id": 42,
            "order_id": "o-9",
            "product_symbol": "btcusdt",
            "product_id": "27",
            "side": "BUY",
            "fill_size": "600",
            "price": "65000.5",
            "client_order_id": "BOTMULT_abc"
        });
        let f = parse_user_trade(&ev);
        assert_eq!(f.fill_id.as_deref(), Some("f-1"));
        assert_eq!(f.trade_id.as_deref(), Some("42"));
        assert_eq!(f.symbol.as_deref(), Some("BTCUSDT"));
        assert_eq!(f.product_id, Some(27));
        assert_eq!(f.side, Some(Side::Buy));
        assert_eq!(f.filled_qty, Some(600));
        assert_eq!(f.price, Some(65000.5));
        assert!(f.cumulative_qty.is_none());
    }

    #[test]
    fn order_update_reports_cumulative_and_closed() {
        let ev = serde_json::json!({
            "id": "o-1",
            "symbol": "ETHUSDT",
            "side": "sell",
            "filled_size": 150,
            "unfilled_size": 0,
            "state": "closed",
            "average_fill_price": "3200"
        });
        let f = parse_order_update(&ev);
        assert_eq!(f.order_id.as_deref(), Some("o-1"));
        assert_eq!(f.cumulative_qty, Some(150));
        assert_eq!(f.side, Some(Side::Sell));
        assert!(f.order_closed);
        assert_eq!(f.price, Some(3200.0));
    }

    #[test]
    fn payload_events_handles_list_object_and_inline() {
        let list = serde_json::json!({ "payload": [ {"a": 1}, {"a": 2} ] });
        assert_eq!(payload_events(&list, &["payload", "data"]).len(), 2);
        let obj = serde_json::json!({ "data": {"a": 1} });
        assert_eq!(payload_events(&obj, &["payload", "data"]).len(), 1);
        let inline = serde_json::json!({ "type": "orders", "id": "x" });
        assert_eq!(payload_events(&inline, &["payload"]).len(), 1);
    }

    #[test]
    fn client_order_id_carries_prefix() {
        let id = build_client_order_id("BOTMULT_");
        assert!(id.starts_with("BOTMULT_"));
        assert!(id.len() > "BOTMULT_".len());
    }
}
