// =============================================================================
// Engine configuration — persisted trading intent
// =============================================================================
//
// Supplied by POST /engine/start, validated, persisted atomically to the
// `system_config` table (key `current_state`) and read back at boot so a
// crash never loses the operator's intent.
//
// Every field carries a serde default so older persisted rows keep loading
// after new fields are added.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

fn default_capital() -> f64 {
    100_000.0
}

fn default_leverage() -> f64 {
    5.0
}

fn default_strategy() -> String {
    "MOMENTUM_TREND".to_string()
}

fn default_max_daily_loss() -> f64 {
    1_000.0
}

fn default_max_concurrent_trades() -> u32 {
    3
}

fn default_sizing_method() -> SizingMethod {
    SizingMethod::SlotRisk
}

fn default_risk_fraction() -> f64 {
    0.01
}

/// How the position sizer derives quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizingMethod {
    /// min(slot-capital qty, fixed-risk qty) — the default.
    SlotRisk,
    /// Fixed-risk only (no slot cap).
    FixedRisk,
}

/// Persisted engine configuration. Updated atomically on /engine/start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Total trading capital the sizer may allocate.
    #[serde(default = "default_capital")]
    pub capital: f64,

    /// Intraday leverage multiplier, 1..=5.
    #[serde(default = "default_leverage")]
    pub leverage: f64,

    /// Key into the strategy factory map.
    #[serde(default = "default_strategy")]
    pub strategy_name: String,

    /// Trading symbols; each must resolve in the instrument master.
    #[serde(default)]
    pub symbols: Vec<String>,

    /// Opaque per-strategy parameters, passed through to the factory.
    #[serde(default)]
    pub strategy_params: serde_json::Value,

    /// Kill switch trips when net PnL reaches minus this amount.
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,

    /// Concurrency cap: also the slot count for sizing.
    #[serde(default = "default_max_concurrent_trades")]
    pub max_concurrent_trades: u32,

    #[serde(default = "default_sizing_method")]
    pub sizing_method: SizingMethod,

    /// Fraction of capital risked per trade, (0, 0.10].
    #[serde(default = "default_risk_fraction")]
    pub risk_per_trade_fraction: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capital: default_capital(),
            leverage: default_leverage(),
            strategy_name: default_strategy(),
            symbols: Vec::new(),
            strategy_params: serde_json::Value::Null,
            max_daily_loss: default_max_daily_loss(),
            max_concurrent_trades: default_max_concurrent_trades(),
            sizing_method: default_sizing_method(),
            risk_per_trade_fraction: default_risk_fraction(),
        }
    }
}

impl EngineConfig {
    /// Range-check every bound the risk model depends on.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.capital <= 0.0 {
            return Err(EngineError::Configuration("capital must be positive".into()));
        }
        if !(1.0..=5.0).contains(&self.leverage) {
            return Err(EngineError::Configuration(format!(
                "leverage {} outside [1, 5]",
                self.leverage
            )));
        }
        if self.max_daily_loss <= 0.0 {
            return Err(EngineError::Configuration(
                "max_daily_loss must be positive".into(),
            ));
        }
        if self.max_concurrent_trades < 1 {
            return Err(EngineError::Configuration(
                "max_concurrent_trades must be at least 1".into(),
            ));
        }
        if !(self.risk_per_trade_fraction > 0.0 && self.risk_per_trade_fraction <= 0.10) {
            return Err(EngineError::Configuration(format!(
                "risk_per_trade_fraction {} outside (0, 0.10]",
                self.risk_per_trade_fraction
            )));
        }
        if self.symbols.is_empty() {
            return Err(EngineError::Configuration("no symbols configured".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> EngineConfig {
        EngineConfig {
            symbols: vec!["RELIANCE-EQ".into()],
            ..EngineConfig::default()
        }
    }

    #[test]
    fn default_config_validates_once_symbols_present() {
        assert!(valid().validate().is_ok());
        assert!(EngineConfig::default().validate().is_err()); // no symbols
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{ "symbols": ["TCS-EQ"], "capital": 250000 }"#).unwrap();
        assert_eq!(cfg.symbols, vec!["TCS-EQ"]);
        assert!((cfg.capital - 250_000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.strategy_name, "MOMENTUM_TREND");
        assert_eq!(cfg.max_concurrent_trades, 3);
        assert_eq!(cfg.sizing_method, SizingMethod::SlotRisk);
    }

    #[test]
    fn validation_bounds() {
        let mut cfg = valid();
        cfg.leverage = 6.0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.risk_per_trade_fraction = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.risk_per_trade_fraction = 0.11;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.max_daily_loss = -5.0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.max_concurrent_trades = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = valid();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.symbols, cfg.symbols);
        assert_eq!(back.max_concurrent_trades, cfg.max_concurrent_trades);
        assert_eq!(back.sizing_method, cfg.sizing_method);
    }
}
