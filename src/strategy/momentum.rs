// =============================================================================
// Momentum trend strategy
// =============================================================================
//
// LONG  when close > EMA(50) and RSI(14) > 60 and close > VWAP.
// SHORT when close < EMA(50) and RSI(14) < 40 and close < VWAP.
// Exits at +0.9 % take-profit or -0.3 % stop-loss, at market.
//
// Cooldown after an exit is enforced by the runtime, not here.
// =============================================================================

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::strategy::{indicators, Intent, Strategy, StrategyView};
use crate::types::{Bar, Side};

fn default_ema_period() -> usize {
    50
}
fn default_rsi_period() -> usize {
    14
}
fn default_stop_loss_pct() -> f64 {
    0.0030
}
fn default_take_profit_pct() -> f64 {
    0.0090
}
fn default_rsi_long() -> f64 {
    60.0
}
fn default_rsi_short() -> f64 {
    40.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct MomentumParams {
    #[serde(default = "default_ema_period")]
    pub ema_period: usize,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
    #[serde(default = "default_rsi_long")]
    pub rsi_long_threshold: f64,
    #[serde(default = "default_rsi_short")]
    pub rsi_short_threshold: f64,
}

impl Default for MomentumParams {
    fn default() -> Self {
        Self {
            ema_period: default_ema_period(),
            rsi_period: default_rsi_period(),
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            rsi_long_threshold: default_rsi_long(),
            rsi_short_threshold: default_rsi_short(),
        }
    }
}

#[derive(Debug)]
pub struct MomentumStrategy {
    params: MomentumParams,
}

impl MomentumStrategy {
    pub fn new(params: MomentumParams) -> Self {
        Self { params }
    }

    /// Lenient construction from the configured JSON blob; missing or null
    /// params fall back to defaults.
    pub fn from_params(raw: &Value) -> Self {
        let params = if raw.is_null() {
            MomentumParams::default()
        } else {
            serde_json::from_value(raw.clone()).unwrap_or_default()
        };
        Self::new(params)
    }

    fn entry_signal(&self, bars: &[Bar]) -> Option<Intent> {
        let close = bars.last()?.close;
        let ema = indicators::ema(bars, self.params.ema_period)?;
        let rsi = indicators::rsi(bars, self.params.rsi_period)?;
        let vwap = indicators::vwap(bars)?;

        if close > ema && rsi > self.params.rsi_long_threshold && close > vwap {
            debug!(close, ema, rsi, vwap, "long entry signal");
            return Some(Intent {
                side: Side::Buy,
                price: close,
                stop_loss: Some(close * (1.0 - self.params.stop_loss_pct)),
                confidence: 1.0,
                tag: "SIGNAL".to_string(),
            });
        }
        if close < ema && rsi < self.params.rsi_short_threshold && close < vwap {
            debug!(close, ema, rsi, vwap, "short entry signal");
            return Some(Intent {
                side: Side::Sell,
                price: close,
                stop_loss: Some(close * (1.0 + self.params.stop_loss_pct)),
                confidence: 1.0,
                tag: "SIGNAL".to_string(),
            });
        }
        None
    }

    fn exit_signal(&self, close: f64, view: &StrategyView) -> Option<Intent> {
        if view.avg_price <= 0.0 {
            return None;
        }
        let pnl_pct = if view.position > 0 {
            (close - view.avg_price) / view.avg_price
        } else {
            (view.avg_price - close) / view.avg_price
        };
        let side = if view.position > 0 {
            Side::Sell
        } else {
            Side::Buy
        };

        if pnl_pct >= self.params.take_profit_pct {
            return Some(Intent {
                side,
                price: 0.0, // market
                stop_loss: None,
                confidence: 1.0,
                tag: "TAKE_PROFIT".to_string(),
            });
        }
        if pnl_pct <= -self.params.stop_loss_pct {
            return Some(Intent {
                side,
                price: 0.0,
                stop_loss: None,
                confidence: 1.0,
                tag: "STOP_LOSS".to_string(),
            });
        }
        None
    }
}

impl Strategy for MomentumStrategy {
    fn name(&self) -> &'static str {
        "MOMENTUM_TREND"
    }

    fn warmup_bars(&self) -> usize {
        self.params.ema_period.max(self.params.rsi_period + 1)
    }

    fn on_bar_close(&mut self, bars: &[Bar], view: &StrategyView) -> Option<Intent> {
        if bars.len() < self.warmup_bars() {
            return None;
        }
        if view.position == 0 {
            self.entry_signal(bars)
        } else {
            self.exit_signal(bars.last()?.close, view)
        }
    }
}
