// ===============================
// src/sizing.rs
// ===============================
//
// Pure top-up sizing: admitted fill delta -> intent size, under the
// configured multiplier and the per-trade / per-symbol caps. Clipping order
// matters: per-trade first, then the symbol's remaining budget (which was
// itself built from already per-trade-clipped prior fills).
//
use ahash::AHashMap;

#[derive(Debug, Clone)]
pub struct SizingCfg {
    pub multiplier: f64,
    pub max_per_trade: i64,
    pub max_per_symbol: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    MultiplierDisabled,
    SymbolNotAllowed,
    ZeroSize,
    CapExhausted,
}

impl Skip {
    pub fn as_str(&self) -> &'static str {
        match self {
            Skip::MultiplierDisabled => "multiplier_disabled",
            Skip::SymbolNotAllowed => "symbol_not_allowed",
            Skip::ZeroSize => "zero_topup",
            Skip::CapExhausted => "cap_exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedTopUp {
    pub size: i64,
    pub clipped_by_trade_cap: bool,
    pub clipped_by_symbol_cap: bool,
}

/// Symbol allow-list: "ALL" wildcard or an explicit uppercase set.
#[derive(Debug, Clone)]
pub enum AllowList {
    All,
    Listed(ahash::AHashSet<String>),
}

impl AllowList {
    pub fn parse(symbols: &[String]) -> Self {
        if symbols.iter().any(|s| s == "ALL") {
            AllowList::All
        } else {
            AllowList::Listed(symbols.iter().cloned().collect())
        }
    }

    /// Fills with no symbol are only admissible under the wildcard.
    pub fn allows(&self, symbol: Option<&str>) -> bool {
        match (self, symbol) {
            (AllowList::All, _) => true,
            (AllowList::Listed(_), None) => false,
            (AllowList::Listed(set), Some(s)) => set.contains(&s.to_ascii_uppercase()),
        }
    }
}

/// Running per-symbol top-up totals for this process lifetime. Monotone
/// non-decreasing; reserved when an intent is created so engine retries and
/// dry runs account identically.
#[derive(Debug, Default)]
pub struct SymbolCaps {
    used: AHashMap<String, i64>,
}

impl SymbolCaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn used(&self, symbol: &str) -> i64 {
        self.used.get(symbol).copied().unwrap_or(0)
    }

    pub fn reserve(&mut self, symbol: &str, size: i64) {
        *self.used.entry(symbol.to_string()).or_insert(0) += size;
    }
}

/// `(multiplier - 1) * qty_delta`, clipped to the per-trade cap and then to
/// the symbol's remaining budget. The final fill that would cross the
/// symbol cap is clipped to the exact remainder, not rejected.
pub fn size_topup(
    symbol: Option<&str>,
    qty_delta: i64,
    cfg: &SizingCfg,
    allow: &AllowList,
    caps: &SymbolCaps,
) -> Result<SizedTopUp, Skip> {
    if cfg.multiplier <= 1.0 {
        return Err(Skip::MultiplierDisabled);
    }
    if !allow.allows(symbol) {
        return Err(Skip::SymbolNotAllowed);
    }

    let raw = ((cfg.multiplier - 1.0) * qty_delta as f64).round() as i64;
    if raw <= 0 {
        return Err(Skip::ZeroSize);
    }

    let per_trade = raw.min(cfg.max_per_trade);

    // Symbol caps only bind fills that carry a symbol.
    let (size, clipped_by_symbol_cap) = match symbol {
        Some(sym) => {
            let remaining = cfg.max_per_symbol - caps.used(sym);
            if remaining <= 0 {
                return Err(Skip::CapExhausted);
            }
            (per_trade.min(remaining), per_trade > remaining)
        }
        None => (per_trade, false),
    };

    if size <= 0 {
        return Err(Skip::ZeroSize);
    }
    Ok(SizedTopUp {
        size,
        clipped_by_trade_cap: raw > cfg.max_per_trade,
        clipped_by_symbol_cap,
    })
}
