// =============================================================================
// Instrument master — symbol/token resolution, lot and freeze quantities
// =============================================================================
//
// Loaded once at startup: from the `instrument_master` table when present,
// otherwise fetched from the broker's scrip master and persisted. Immutable
// for the rest of the trading day. Every token seen on the feed or in an
// order must resolve here.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::EngineError;

/// Freeze quantity assumed when the master has no value for an instrument.
pub const DEFAULT_FREEZE_QTY: u64 = 1800;

/// A single tradeable instrument, immutable per day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub token: u32,
    /// Broker trading symbol, e.g. `RELIANCE-EQ`.
    pub trading_symbol: String,
    /// Plain symbol, e.g. `RELIANCE`.
    pub symbol: String,
    /// Minimum tradeable multiple; always >= 1.
    pub lot_size: u64,
    pub tick_size: f64,
    /// Exchange-imposed maximum quantity per single order.
    pub freeze_qty: u64,
    pub segment: String,
    /// Power of ten dividing raw broker price integers.
    pub price_precision: u32,
}

impl Instrument {
    /// Convert a raw broker price integer to a decimal price.
    pub fn scale_price(&self, raw: i64) -> f64 {
        raw as f64 / 10f64.powi(self.price_precision as i32)
    }
}

/// In-memory symbol/token index over the instrument master.
pub struct InstrumentCache {
    by_token: HashMap<u32, Instrument>,
    by_trading_symbol: HashMap<String, u32>,
}

impl InstrumentCache {
    pub fn new(instruments: Vec<Instrument>) -> Self {
        let mut by_token = HashMap::with_capacity(instruments.len());
        let mut by_trading_symbol = HashMap::with_capacity(instruments.len());
        for inst in instruments {
            if inst.lot_size == 0 {
                warn!(token = inst.token, symbol = %inst.trading_symbol, "lot size 0 in master, coercing to 1");
            }
            by_trading_symbol.insert(inst.trading_symbol.clone(), inst.token);
            by_token.insert(
                inst.token,
                Instrument {
                    lot_size: inst.lot_size.max(1),
                    ..inst
                },
            );
        }
        info!(count = by_token.len(), "instrument cache built");
        Self {
            by_token,
            by_trading_symbol,
        }
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    pub fn by_token(&self, token: u32) -> Option<&Instrument> {
        self.by_token.get(&token)
    }

    pub fn by_trading_symbol(&self, symbol: &str) -> Option<&Instrument> {
        self.by_trading_symbol
            .get(symbol)
            .and_then(|t| self.by_token.get(t))
    }

    /// Freeze quantity for a token; unknown tokens use the exchange default.
    pub fn freeze_qty(&self, token: u32) -> u64 {
        self.by_token
            .get(&token)
            .map(|i| i.freeze_qty)
            .unwrap_or(DEFAULT_FREEZE_QTY)
    }

    /// Resolve configured symbols to `(trading_symbol, token)` pairs.
    /// Any unknown symbol rejects the whole configuration.
    pub fn resolve_symbols(
        &self,
        symbols: &[String],
    ) -> Result<Vec<(String, u32)>, EngineError> {
        let mut out = Vec::with_capacity(symbols.len());
        for sym in symbols {
            match self.by_trading_symbol(sym) {
                Some(inst) => out.push((inst.trading_symbol.clone(), inst.token)),
                None => {
                    return Err(EngineError::Configuration(format!(
                        "unknown symbol '{sym}' — not in instrument master"
                    )))
                }
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for InstrumentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentCache")
            .field("instruments", &self.by_token.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_instrument(token: u32, trading_symbol: &str) -> Instrument {
    Instrument {
        token,
        trading_symbol: trading_symbol.to_string(),
        symbol: trading_symbol.trim_end_matches("-EQ").to_string(),
        lot_size: 1,
        tick_size: 0.05,
        freeze_qty: DEFAULT_FREEZE_QTY,
        segment: "nse_cm".to_string(),
        price_precision: 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_token_and_symbol() {
        let cache = InstrumentCache::new(vec![
            test_instrument(101, "RELIANCE-EQ"),
            test_instrument(102, "TCS-EQ"),
        ]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.by_token(101).unwrap().trading_symbol, "RELIANCE-EQ");
        assert_eq!(cache.by_trading_symbol("TCS-EQ").unwrap().token, 102);
        assert!(cache.by_token(999).is_none());
    }

    #[test]
    fn freeze_qty_falls_back_to_default() {
        let mut inst = test_instrument(101, "RELIANCE-EQ");
        inst.freeze_qty = 500;
        let cache = InstrumentCache::new(vec![inst]);
        assert_eq!(cache.freeze_qty(101), 500);
        assert_eq!(cache.freeze_qty(999), DEFAULT_FREEZE_QTY);
    }

    #[test]
    fn resolve_rejects_unknown_symbol() {
        let cache = InstrumentCache::new(vec![test_instrument(101, "RELIANCE-EQ")]);
        let ok = cache.resolve_symbols(&["RELIANCE-EQ".to_string()]).unwrap();
        assert_eq!(ok, vec![("RELIANCE-EQ".to_string(), 101)]);

        let err = cache
            .resolve_symbols(&["RELIANCE-EQ".to_string(), "NOPE-EQ".to_string()])
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn zero_lot_size_is_coerced() {
        let mut inst = test_instrument(101, "RELIANCE-EQ");
        inst.lot_size = 0;
        let cache = InstrumentCache::new(vec![inst]);
        assert_eq!(cache.by_token(101).unwrap().lot_size, 1);
    }

    #[test]
    fn price_scaling_uses_precision() {
        let mut inst = test_instrument(101, "RELIANCE-EQ");
        inst.price_precision = 2;
        assert!((inst.scale_price(123_456) - 1234.56).abs() < 1e-9);
    }
}
