// =============================================================================
// Strategy contract — decision functions over closed bars
// =============================================================================
//
// A strategy is a pure decision function: given the bar history and a view
// of its runtime state it returns at most one intent per bar close. The
// runtime (runtime.rs) owns the position state machine, risk classification
// and execution; formulas stay free of those concerns.
// =============================================================================

pub mod indicators;
pub mod momentum;
pub mod runtime;

use serde_json::Value;

use crate::error::EngineError;
use crate::types::{Bar, Side};

/// A trading intent emitted by a decision function.
#[derive(Debug, Clone)]
pub struct Intent {
    pub side: Side,
    /// 0.0 sends a market order.
    pub price: f64,
    pub stop_loss: Option<f64>,
    /// Conviction in [0.5, 2.0]; scales the position size for entries.
    pub confidence: f64,
    pub tag: String,
}

/// Read-only view of runtime state handed to the decision function.
#[derive(Debug, Clone, Copy)]
pub struct StrategyView {
    /// Signed net quantity: positive long, negative short, zero flat.
    pub position: i64,
    /// Undefined (0.0) while flat.
    pub avg_price: f64,
    pub last_price: f64,
}

pub trait Strategy: Send + std::fmt::Debug {
    fn name(&self) -> &'static str;
    /// Bars required before the first decision.
    fn warmup_bars(&self) -> usize;
    /// Called once per closed bar, newest last in `bars`.
    fn on_bar_close(&mut self, bars: &[Bar], view: &StrategyView) -> Option<Intent>;
}

/// Build a strategy by its configured name. Unknown names reject the
/// configuration at /engine/start.
pub fn build_strategy(name: &str, params: &Value) -> Result<Box<dyn Strategy>, EngineError> {
    match name {
        "MOMENTUM_TREND" => Ok(Box::new(momentum::MomentumStrategy::from_params(params))),
        other => Err(EngineError::Configuration(format!(
            "unknown strategy '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_knows_momentum_and_rejects_unknown() {
        assert!(build_strategy("MOMENTUM_TREND", &Value::Null).is_ok());
        let err = build_strategy("GRID_SCALPER", &Value::Null).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }
}
