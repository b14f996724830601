// ===============================
// src/session.rs
// ===============================
//
// Authenticated Delta websocket session. Hides transient connectivity loss
// from the rest of the pipeline: connect -> auth -> subscribe -> heartbeat,
// and on any transport/protocol failure, reconnect with exponential
// backoff. The backoff resets to its base only after the previous session
// proved healthy (liveness observed while subscribed), so a flapping link
// keeps the long delay.
//
// Only the external stop signal ends the task; everything else reconnects.
//
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};
use url::Url;

use crate::config::{Config, Credentials};
use crate::delta;
use crate::domain::{FillEvent, SessionState};
use crate::metrics::{self, WS_MESSAGES, WS_RECONNECTS};
use crate::recorder::EventSink;

#[derive(Clone, Debug)]
pub struct SessionCfg {
    pub ws_url: String,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub backoff_base: f64,
    pub backoff_max: f64,
    pub backoff_jitter: f64,
}

impl SessionCfg {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            ws_url: cfg.ws_url.clone(),
            ping_interval: cfg.ping_interval,
            ping_timeout: cfg.ping_timeout,
            backoff_base: cfg.backoff_base,
            backoff_max: cfg.backoff_max,
            backoff_jitter: cfg.backoff_jitter,
        }
    }
}

/// Backoff resets to base only after a healthy session; otherwise doubles
/// up to the cap.
pub fn next_backoff(current: f64, had_health: bool, base: f64, max: f64) -> f64 {
    if had_health {
        base
    } else {
        (current * 2.0).min(max)
    }
}

pub fn jittered(secs: f64, jitter_frac: f64) -> Duration {
    let j = if jitter_frac > 0.0 {
        1.0 + rand::thread_rng().gen_range(0.0..jitter_frac)
    } else {
        1.0
    };
    Duration::from_secs_f64(secs * j)
}

struct StateTracker {
    state: SessionState,
    sink: EventSink,
}

impl StateTracker {
    fn new(sink: EventSink) -> Self {
        metrics::set_session_state(SessionState::Disconnected);
        Self { state: SessionState::Disconnected, sink }
    }

    fn set(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        info!(from = self.state.as_str(), to = next.as_str(), "session state");
        metrics::set_session_state(next);
        self.sink
            .emit("session_state", json!({ "from": self.state.as_str(), "to": next.as_str() }));
        self.state = next;
    }

    fn is(&self, s: SessionState) -> bool {
        self.state == s
    }
}

fn stopped(stop_rx: &watch::Receiver<bool>) -> bool {
    *stop_rx.borrow()
}

pub async fn run(
    cfg: SessionCfg,
    creds: Credentials,
    fill_tx: mpsc::Sender<FillEvent>,
    sink: EventSink,
    mut stop_rx: watch::Receiver<bool>,
) {
    if let Err(e) = Url::parse(&cfg.ws_url) {
        error!(?e, ws_url = %cfg.ws_url, "bad ws url");
        return;
    }

    let mut st = StateTracker::new(sink.clone());
    let mut backoff = cfg.backoff_base;

    loop {
        if stopped(&stop_rx) {
            break;
        }
        st.set(SessionState::Connecting);

        let had_health = match connect_async(cfg.ws_url.as_str()).await {
            Ok((mut ws, _resp)) => {
                info!(ws_url = %cfg.ws_url, "socket opened, authenticating");
                let h = run_connection(&mut ws, &cfg, &creds, &fill_tx, &sink, &mut st, &mut stop_rx)
                    .await;
                let _ = ws.close(None).await;
                h
            }
            Err(e) => {
                error!(?e, "connect failed");
                false
            }
        };

        if stopped(&stop_rx) {
            break;
        }

        st.set(SessionState::Reconnecting);
        WS_RECONNECTS.inc();
        backoff = next_backoff(backoff, had_health, cfg.backoff_base, cfg.backoff_max);
        let wait = jittered(backoff, cfg.backoff_jitter);
        info!(seconds = wait.as_secs_f64(), had_health, "reconnect backoff");
        tokio::select! {
            _ = sleep(wait) => {}
            _ = stop_rx.changed() => {}
        }
    }

    st.set(SessionState::ShuttingDown);
    st.set(SessionState::Disconnected);
    info!("session stopped");
}

/// Pending forever while no ping is outstanding.
async fn liveness_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Drives one connection until it fails, goes stale, or the stop signal
/// fires. Returns whether the session proved healthy (liveness evidence
/// while subscribed) for the backoff-reset rule.
///
/// Generic over the transport so the state machine runs against a scripted
/// stream in tests.
async fn run_connection<S, E>(
    ws: &mut S,
    cfg: &SessionCfg,
    creds: &Credentials,
    fill_tx: &mpsc::Sender<FillEvent>,
    sink: &EventSink,
    st: &mut StateTracker,
    stop_rx: &mut watch::Receiver<bool>,
) -> bool
where
    S: Stream<Item = Result<Message, E>> + Sink<Message> + Unpin,
    E: std::fmt::Debug,
    <S as Sink<Message>>::Error: std::fmt::Debug,
{
    st.set(SessionState::Authenticating);
    let (auth, ts) = delta::auth_frame(&creds.api_key, &creds.api_secret);
    sink.emit("auth_sent", json!({ "timestamp": ts }));
    if let Err(e) = ws.send(Message::Text(auth)).await {
        error!(?e, "auth send failed");
        return false;
    }

    let mut had_health = false;
    // armed when a ping goes out, cleared by any liveness frame
    let mut ping_deadline: Option<Instant> = None;
    let mut ping = interval(cfg.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            res = stop_rx.changed() => {
                if res.is_err() || stopped(stop_rx) {
                    return had_health;
                }
            }

            _ = ping.tick() => {
                if let Err(e) = ws.send(Message::Ping(Vec::new())).await {
                    error!(?e, "ping send failed");
                    return had_health;
                }
                if ping_deadline.is_none() {
                    ping_deadline = Some(Instant::now() + cfg.ping_timeout);
                }
            }

            _ = liveness_deadline(ping_deadline) => {
                warn!(timeout = ?cfg.ping_timeout, "no liveness within ping timeout after ping");
                st.set(SessionState::Degraded);
                return had_health;
            }

            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Text(txt))) => {
                        ping_deadline = None;
                        if st.is(SessionState::Subscribed) {
                            had_health = true;
                        }
                        if handle_text(&txt, ws, fill_tx, sink, st).await == FrameAction::Disconnect {
                            return had_health;
                        }
                    }
                    Some(Ok(Message::Ping(p))) => {
                        ping_deadline = None;
                        let _ = ws.send(Message::Pong(p)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        ping_deadline = None;
                        if st.is(SessionState::Subscribed) {
                            had_health = true;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        warn!(?frame, "close frame received");
                        return had_health;
                    }
                    Some(Ok(_)) => {
                        // binary/raw frames are not part of the protocol
                    }
                    Some(Err(e)) => {
                        error!(?e, "ws read error");
                        return had_health;
                    }
                    None => {
                        warn!("stream ended");
                        return had_health;
                    }
                }
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum FrameAction {
    Continue,
    Disconnect,
}

async fn handle_text<S>(
    txt: &str,
    ws: &mut S,
    fill_tx: &mpsc::Sender<FillEvent>,
    sink: &EventSink,
    st: &mut StateTracker,
) -> FrameAction
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    let msg: Value = match serde_json::from_str(txt) {
        Ok(v) => v,
        Err(_) => {
            sink.emit("parse_error", json!({ "raw": txt }));
            return FrameAction::Continue;
        }
    };

    let t = msg.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match t {
        "success" if msg.get("message").and_then(|m| m.as_str()) == Some("Authenticated") => {
            st.set(SessionState::Subscribed);
            for channel in ["orders", "positions", "user_trades"] {
                let frame = delta::subscribe_frame(channel, &["all"]);
                if let Err(e) = ws.send(Message::Text(frame)).await {
                    error!(?e, channel, "subscribe send failed");
                    return FrameAction::Disconnect;
                }
            }
            let _ = ws.send(Message::Text(delta::enable_heartbeat_frame())).await;
            sink.emit("subscribed", json!({ "channels": ["orders", "positions", "user_trades"] }));
            info!("authenticated and subscribed to orders/positions/user_trades");
            FrameAction::Continue
        }
        "heartbeat" => {
            WS_MESSAGES.with_label_values(&["heartbeat"]).inc();
            FrameAction::Continue
        }
        "user_trades" | "usertrades" => {
            WS_MESSAGES.with_label_values(&["user_trades"]).inc();
            for ev in delta::payload_events(&msg, &["payload", "data", "trades", "usertrades"]) {
                if ev.is_object() {
                    let fill = delta::parse_user_trade(ev);
                    if fill_tx.send(fill).await.is_err() {
                        return FrameAction::Disconnect;
                    }
                }
            }
            FrameAction::Continue
        }
        "orders" => {
            WS_MESSAGES.with_label_values(&["orders"]).inc();
            for ev in delta::payload_events(&msg, &["payload", "data", "orders"]) {
                if ev.is_object() {
                    let fill = delta::parse_order_update(ev);
                    if fill_tx.send(fill).await.is_err() {
                        return FrameAction::Disconnect;
                    }
                }
            }
            FrameAction::Continue
        }
        "positions" => {
            // useful for the audit log; never a mirror trigger (loop-safe)
            WS_MESSAGES.with_label_values(&["positions"]).inc();
            FrameAction::Continue
        }
        "error" => {
            WS_MESSAGES.with_label_values(&["error"]).inc();
            sink.emit("parse_error", json!({ "frame": msg }));
            if st.is(SessionState::Authenticating) {
                // auth rejection is recoverable: reconnect, never fatal
                warn!("authentication rejected");
                return FrameAction::Disconnect;
            }
            warn!(frame = %msg, "error frame");
            FrameAction::Continue
        }
        _ => {
            WS_MESSAGES.with_label_values(&["other"]).inc();
            FrameAction::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Transport that delivers its scripted frames, answers the first
    /// `pongs_left` pings with pongs, and is otherwise silent.
    struct SilentAfter {
        inbound: VecDeque<Message>,
        sent: Vec<Message>,
        pongs_left: usize,
    }

    impl SilentAfter {
        fn scripted(frames: Vec<Message>, pongs_left: usize) -> Self {
            Self { inbound: frames.into(), sent: Vec::new(), pongs_left }
        }
    }

    impl Stream for SilentAfter {
        type Item = Result<Message, Infallible>;
        fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            match self.get_mut().inbound.pop_front() {
                Some(m) => Poll::Ready(Some(Ok(m))),
                None => Poll::Pending,
            }
        }
    }

    impl Sink<Message> for SilentAfter {
        type Error = Infallible;
        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }
        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Infallible> {
            let this = self.get_mut();
            if matches!(item, Message::Ping(_)) && this.pongs_left > 0 {
                this.pongs_left -= 1;
                this.inbound.push_back(Message::Pong(Vec::new()));
            }
            this.sent.push(item);
            Ok(())
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }
    }

    fn session_cfg(ping_interval: f64, ping_timeout: f64) -> SessionCfg {
        SessionCfg {
            ws_url: "wss://example.invalid/live".to_string(),
            ping_interval: Duration::from_secs_f64(ping_interval),
            ping_timeout: Duration::from_secs_f64(ping_timeout),
            backoff_base: 1.0,
            backoff_max: 60.0,
            backoff_jitter: 0.0,
        }
    }

    fn test_creds() -> Credentials {
        Credentials {
            api_key: "k".to_string(),
            api_secret: "s".to_string(),
            user_agent: "test".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_link_degrades_one_ping_timeout_after_the_ping() {
        let mut ws = SilentAfter::scripted(
            vec![Message::Text(r#"{"type":"success","message":"Authenticated"}"#.to_string())],
            0,
        );
        let cfg = session_cfg(1.0, 0.2);
        let (fill_tx, _fill_rx) = mpsc::channel(16);
        let (_stop_tx, mut stop_rx) = watch::channel(false);
        let mut st = StateTracker::new(EventSink::disabled());

        let started = Instant::now();
        let had_health = run_connection(
            &mut ws,
            &cfg,
            &test_creds(),
            &fill_tx,
            &EventSink::disabled(),
            &mut st,
            &mut stop_rx,
        )
        .await;

        // ack arrived while authenticating, so the session never proved healthy
        assert!(!had_health);
        assert!(st.is(SessionState::Degraded));
        // detection fires ping_timeout after the unanswered ping, not at the
        // next ping tick
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs_f64(1.2), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs_f64(1.9), "elapsed {elapsed:?}");
        // auth went out first, and at least one ping was attempted
        assert!(matches!(&ws.sent[0], Message::Text(t) if t.contains("auth")));
        assert!(ws.sent.iter().any(|m| matches!(m, Message::Ping(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn pong_clears_the_ping_deadline() {
        // the transport answers the first ping (t=2s) with a pong, so its
        // 0.2s deadline never fires; the stop signal at t=3s ends the
        // session before the second ping
        let mut ws = SilentAfter::scripted(
            vec![Message::Text(r#"{"type":"success","message":"Authenticated"}"#.to_string())],
            1,
        );
        let cfg = session_cfg(2.0, 0.2);
        let (fill_tx, _fill_rx) = mpsc::channel(16);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let mut st = StateTracker::new(EventSink::disabled());

        tokio::spawn(async move {
            sleep(Duration::from_secs(3)).await;
            let _ = stop_tx.send(true);
        });

        let had_health = run_connection(
            &mut ws,
            &cfg,
            &test_creds(),
            &fill_tx,
            &EventSink::disabled(),
            &mut st,
            &mut stop_rx,
        )
        .await;

        assert!(!st.is(SessionState::Degraded));
        // the pong landed while subscribed: the session counts as healthy
        assert!(had_health);
    }

    #[test]
    fn backoff_doubles_and_caps_while_unhealthy() {
        let base = 1.0;
        let max = 60.0;
        let mut b = base;
        let mut seen = Vec::new();
        for _ in 0..8 {
            b = next_backoff(b, false, base, max);
            seen.push(b);
        }
        assert_eq!(seen, vec![2.0, 4.0, 8.0, 16.0, 32.0, 60.0, 60.0, 60.0]);
    }

    #[test]
    fn backoff_resets_only_after_health() {
        let base = 1.0;
        let max = 60.0;
        let mut b = base;
        for _ in 0..5 {
            b = next_backoff(b, false, base, max);
        }
        assert_eq!(b, 32.0);
        // reconnect success alone is not health; the caller only passes
        // had_health=true after liveness while subscribed
        b = next_backoff(b, false, base, max);
        assert_eq!(b, 60.0);
        b = next_backoff(b, true, base, max);
        assert_eq!(b, base);
    }

    #[test]
    fn jitter_stays_within_the_configured_fraction() {
        for _ in 0..100 {
            let d = jittered(10.0, 0.4);
            assert!(d >= Duration::from_secs_f64(10.0));
            assert!(d < Duration::from_secs_f64(14.0));
        }
        assert_eq!(jittered(10.0, 0.0), Duration::from_secs_f64(10.0));
    }
}
