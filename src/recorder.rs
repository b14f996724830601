// ===============================
// src/recorder.rs
// ===============================
//
// JSONL structured-event sink:
// - Every core decision point emits one record {ts, type, data}.
// - Producers go through EventSink::emit (try_send) so a slow or dead sink
//   never blocks a trading decision.
// - BufWriter + periodic flush; reopen the file and continue on write
//   failure.
//
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::metrics::RECORD_DROPS;

#[derive(Debug, Clone, Serialize)]
pub struct Record {
    pub ts: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl Record {
    pub fn new(kind: &str, data: Value) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            kind: kind.to_string(),
            data,
        }
    }
}

/// Fire-and-forget handle handed to every component.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<Record>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<Record>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Sink without a backing file (and for tests).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, kind: &str, data: Value) {
        if let Some(tx) = &self.tx {
            if tx.try_send(Record::new(kind, data)).is_err() {
                RECORD_DROPS.inc();
            }
        }
    }
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<tokio::fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "recorder: create_dir_all failed");
            }
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

pub async fn run(mut rx: mpsc::Receiver<Record>, path: String) {
    info!(%path, "recorder: started");
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            // degrade to dropping records rather than taking the bot down
            error!(?e, %path, "recorder: open failed, records will be dropped");
            while rx.recv().await.is_some() {
                RECORD_DROPS.inc();
            }
            return;
        }
    };

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut since_last_flush: u32 = 0;
    const FLUSH_EVERY_N_EVENTS: u32 = 1000;

    loop {
        tokio::select! {
            maybe_rec = rx.recv() => {
                match maybe_rec {
                    Some(rec) => {
                        let mut line = match serde_json::to_string(&rec) {
                            Ok(s) => s,
                            Err(e) => {
                                error!(?e, "recorder: serialize error, skip record");
                                continue;
                            }
                        };
                        line.push('\n');

                        if let Err(e) = writer.write_all(line.as_bytes()).await {
                            warn!(?e, "recorder: write failed, attempting reopen");
                            match open_writer(&path).await {
                                Ok(w) => writer = w,
                                Err(e2) => {
                                    error!(?e2, "recorder: reopen failed, drop record");
                                    RECORD_DROPS.inc();
                                    continue;
                                }
                            }
                            if let Err(e2) = writer.write_all(line.as_bytes()).await {
                                error!(?e2, "recorder: write failed again, drop record");
                                RECORD_DROPS.inc();
                                continue;
                            }
                        }

                        since_last_flush += 1;
                        if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                            let _ = writer.flush().await;
                            since_last_flush = 0;
                        }
                    }
                    None => {
                        let _ = writer.flush().await;
                        info!("recorder: channel closed, stopped");
                        break;
                    }
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}
