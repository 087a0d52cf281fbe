// =============================================================================
// Engine context — the thin capability surface handed to strategies
// =============================================================================
//
// Breaks the strategy <-> execution <-> risk reference cycle: each runtime
// gets exactly the capabilities it needs and no back-reference to the
// engine.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{EngineConfig, SizingMethod};
use crate::data::instruments::InstrumentCache;
use crate::execution::pipeline::ExecutionPipeline;
use crate::risk::sentinel::RiskSentinel;

/// Capital and sizing parameters, refreshed on configure and reconcile.
#[derive(Debug, Clone, Copy)]
pub struct SizingContext {
    pub method: SizingMethod,
    pub total_capital: f64,
    pub available_capital: f64,
    pub max_slots: u32,
    pub risk_per_trade_fraction: f64,
    pub leverage: f64,
}

impl SizingContext {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            method: config.sizing_method,
            total_capital: config.capital,
            available_capital: config.capital,
            max_slots: config.max_concurrent_trades,
            risk_per_trade_fraction: config.risk_per_trade_fraction,
            leverage: config.leverage,
        }
    }
}

pub struct EngineContext {
    pub pipeline: Arc<ExecutionPipeline>,
    pub sentinel: Arc<RiskSentinel>,
    pub instruments: Arc<InstrumentCache>,
    pub sizing: RwLock<SizingContext>,
}

impl EngineContext {
    pub fn new(
        pipeline: Arc<ExecutionPipeline>,
        sentinel: Arc<RiskSentinel>,
        instruments: Arc<InstrumentCache>,
        sizing: SizingContext,
    ) -> Self {
        Self {
            pipeline,
            sentinel,
            instruments,
            sizing: RwLock::new(sizing),
        }
    }

    pub fn set_available_capital(&self, available: f64) {
        self.sizing.write().available_capital = available;
    }
}
