// ===============================
// src/config.rs
// ===============================
//
// Env-based configuration. The core consumes the resulting structs; the
// loading itself (dotenv, parsing, defaults) is deliberately kept out of
// the trading path.
//
use std::env;
use std::time::Duration;

use dotenvy::dotenv;

use crate::domain::OrderKind;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|s| s.to_ascii_lowercase() == "true")
        .unwrap_or(default)
}

impl OrderKind {
    pub fn from_env(key: &str, default_kind: OrderKind) -> OrderKind {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "market_order" => OrderKind::Market,
            "limit_order" => OrderKind::LimitIoc,
            _ => default_kind,
        }
    }
}

/// Exchange endpoints & credentials.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub user_agent: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub ws_url: String,
    pub api_base: String,

    // Business logic
    pub multiplier: f64,
    pub dry_run: bool,
    pub max_topup_per_trade: i64,
    pub max_topup_per_symbol: i64,
    pub allow_symbols: Vec<String>, // "ALL" or explicit uppercase symbols
    pub self_tag_prefix: String,

    // Order policy
    pub order_kind: OrderKind,
    pub time_in_force: String,
    pub limit_slippage_bps: f64,
    pub limit_ioc_fallback_market: bool,

    // Session reliability
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub backoff_base: f64,
    pub backoff_max: f64,
    pub backoff_jitter: f64,

    // HTTP hardening
    pub http_retries: u32,
    pub http_timeout: Duration,
    pub http_conn_timeout: Duration,

    // Observability & lifecycle
    pub record_file: Option<String>,
    pub log_dir: String,
    pub metrics_port: u16,
    pub shutdown_grace: Duration,
}

pub fn load() -> (Config, Credentials) {
    let _ = dotenv();

    let ws_url = env::var("DELTA_WS_URL")
        .unwrap_or_else(|_| "wss://socket.india.delta.exchange".to_string());
    let api_base = env::var("DELTA_API_BASE")
        .unwrap_or_else(|_| "https://api.india.delta.exchange".to_string());

    let api_key = env::var("DELTA_API_KEY").expect("DELTA_API_KEY missing");
    let api_secret = env::var("DELTA_API_SECRET").expect("DELTA_API_SECRET missing");
    let user_agent =
        env::var("USER_AGENT").unwrap_or_else(|_| "rust-rest-client".to_string());

    let allow_symbols: Vec<String> = env::var("ALLOW_SYMBOLS")
        .unwrap_or_else(|_| "ALL".to_string())
        .split(',')
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    let cfg = Config {
        ws_url,
        api_base,

        multiplier: env_parse("USER_MULTIPLIER", 2.0),
        dry_run: env_bool("DRY_RUN", false),
        max_topup_per_trade: env_parse("MAX_TOPUP_PER_TRADE", 1_000_000),
        max_topup_per_symbol: env_parse("MAX_TOPUP_PER_SYMBOL", 10_000_000),
        allow_symbols,
        self_tag_prefix: env::var("SELF_TAG_PREFIX")
            .unwrap_or_else(|_| "BOTMULT_".to_string()),

        order_kind: OrderKind::from_env("ORDER_TYPE", OrderKind::Market),
        time_in_force: env::var("TIME_IN_FORCE")
            .unwrap_or_else(|_| "ioc".to_string())
            .to_ascii_lowercase(),
        limit_slippage_bps: env_parse("LIMIT_SLIPPAGE_BPS", 0.0),
        limit_ioc_fallback_market: env_bool("LIMIT_IOC_FALLBACK_MARKET", true),

        ping_interval: Duration::from_secs(env_parse("PING_INTERVAL", 30u64)),
        ping_timeout: Duration::from_secs(env_parse("PING_TIMEOUT", 5u64)),
        backoff_base: env_parse("BACKOFF_BASE", 1.0),
        backoff_max: env_parse("BACKOFF_MAX", 60.0),
        backoff_jitter: env_parse("BACKOFF_JITTER", 0.4),

        http_retries: env_parse("HTTP_RETRIES", 3u32),
        http_timeout: Duration::from_secs_f64(env_parse("HTTP_TIMEOUT", 10.0)),
        http_conn_timeout: Duration::from_secs_f64(env_parse("HTTP_CONN_TIMEOUT", 3.05)),

        record_file: env::var("RECORD_FILE").ok(),
        log_dir: env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string()),
        metrics_port: env_parse("METRICS_PORT", 9898u16),
        shutdown_grace: Duration::from_secs(env_parse("SHUTDOWN_GRACE_SECS", 5u64)),
    };

    let creds = Credentials { api_key, api_secret, user_agent };
    (cfg, creds)
}
