// ===============================
// src/dedup.rs
// ===============================
//
// Fill admission. Guarantees each real execution is mirrored at most once:
// fill/trade ids are the primary identity; when only an order id plus a
// cumulative filled total is available, only the increase since the last
// seen total justifies a mirror. All records are retained for the process
// lifetime; redelivery of an old update must stay rejectable for the whole
// run.
//
// Not internally synchronized: the orchestrator serializes calls.
//
use ahash::{AHashMap, AHashSet};

use crate::domain::FillEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    DuplicateFillId,
    DuplicateTradeId,
    /// Cumulative total did not increase: stale redelivery.
    StaleCumulative { cumulative: i64, last_seen: i64 },
    /// No usable identity at all; logged and skipped, never guessed.
    Undecidable,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::DuplicateFillId => "dup_fill_id",
            RejectReason::DuplicateTradeId => "dup_trade_id",
            RejectReason::StaleCumulative { .. } => "no_new_fill_delta",
            RejectReason::Undecidable => "no_usable_identity",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted {
        qty_delta: i64,
        /// False only on the identifier-less, non-cumulative path, where a
        /// redelivery cannot be told apart from a new identical fill.
        verified: bool,
    },
    Rejected(RejectReason),
}

#[derive(Debug, Default)]
pub struct DedupStore {
    seen_fill_ids: AHashSet<String>,
    seen_trade_ids: AHashSet<String>,
    order_fill_cum: AHashMap<String, i64>,
}

impl DedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, fill: &FillEvent) -> Admission {
        if let Some(fid) = &fill.fill_id {
            if self.seen_fill_ids.contains(fid) {
                return Admission::Rejected(RejectReason::DuplicateFillId);
            }
        }
        if let Some(tid) = &fill.trade_id {
            if self.seen_trade_ids.contains(tid) {
                return Admission::Rejected(RejectReason::DuplicateTradeId);
            }
        }
        let had_id = fill.fill_id.is_some() || fill.trade_id.is_some();

        // Decide admissibility before recording identity: an id on a
        // rejected event must not burn a later, usable redelivery.
        let admission = if let (Some(oid), Some(cum)) = (&fill.order_id, fill.cumulative_qty) {
            // Cumulative path: only the increase since the last seen total.
            let prev = self.order_fill_cum.get(oid).copied().unwrap_or(0);
            if cum <= prev {
                return Admission::Rejected(RejectReason::StaleCumulative {
                    cumulative: cum,
                    last_seen: prev,
                });
            }
            self.order_fill_cum.insert(oid.clone(), cum);
            Admission::Accepted { qty_delta: cum - prev, verified: true }
        } else if let Some(qty) = fill.filled_qty {
            Admission::Accepted { qty_delta: qty, verified: had_id }
        } else {
            return Admission::Rejected(RejectReason::Undecidable);
        };

        if let Some(fid) = &fill.fill_id {
            self.seen_fill_ids.insert(fid.clone());
        }
        if let Some(tid) = &fill.trade_id {
            self.seen_trade_ids.insert(tid.clone());
        }
        admission
    }

    #[cfg(test)]
    pub fn last_seen_cumulative(&self, order_id: &str) -> Option<i64> {
        self.order_fill_cum.get(order_id).copied()
    }
}
