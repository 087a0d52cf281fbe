// =============================================================================
// Risk sentinel — pre-trade gate, broker-sourced reconciliation, kill switch
// =============================================================================
//
// One mutex guards every mutation: check_pre_trade, on_execution_failure,
// on_trade_close and the sync fold are serialised. The pre-trade check is
// an optimistic reservation — the slot is taken before the broker call and
// must be released by on_execution_failure if the broker rejects.
//
// The kill switch latches: once net PnL breaches -max_daily_loss it stays
// on until the explicit daily reset. The daily reset deliberately does NOT
// zero open_trades — carried-over positions are re-derived from the broker
// by the next sync.
// =============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::broker::{BrokerAdapter, PositionRow};
use crate::core::breaker::CircuitBreaker;
use crate::core::offload::ThreadOffload;
use crate::error::{EngineError, Result};

/// Blended intraday charge estimate per unit of turnover. Approximates the
/// sum of STT (0.025 % sell-side), exchange transaction charges
/// (0.00325 %), GST on those, SEBI fees and stamp duty for a round trip.
pub const CHARGE_FACTOR: f64 = 0.000_35;

#[derive(Debug, Clone, Copy)]
pub struct RiskConfig {
    pub max_daily_loss: f64,
    pub max_concurrent_trades: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss: 1_000.0,
            max_concurrent_trades: 3,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    gross_pnl: f64,
    turnover: f64,
    est_charges: f64,
    net_pnl: f64,
    open_trades: u32,
    trades_today: u32,
    peak_equity: f64,
    kill_switch: bool,
}

/// Serialisable snapshot for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub gross_pnl: f64,
    pub est_charges: f64,
    pub net_pnl: f64,
    pub open_trades: u32,
    pub trades_today: u32,
    pub peak_equity: f64,
    pub kill_switch: bool,
    pub max_daily_loss: f64,
    pub max_concurrent_trades: u32,
    pub status: &'static str,
}

pub struct RiskSentinel {
    config: Mutex<RiskConfig>,
    state: Mutex<State>,
}

impl RiskSentinel {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config: Mutex::new(config),
            state: Mutex::new(State::default()),
        }
    }

    pub fn update_config(&self, config: RiskConfig) {
        *self.config.lock() = config;
        info!(
            max_daily_loss = config.max_daily_loss,
            max_concurrent_trades = config.max_concurrent_trades,
            "risk config updated"
        );
    }

    pub fn config(&self) -> RiskConfig {
        *self.config.lock()
    }

    // ── Reconciliation ──────────────────────────────────────────────────

    /// Broker-sourced truth: fetch the position book (offloaded, behind the
    /// positions breaker) and fold it into the day's risk state.
    pub async fn sync_state(
        &self,
        broker: Arc<dyn BrokerAdapter>,
        offload: &ThreadOffload,
        positions_cb: &CircuitBreaker,
    ) -> Result<()> {
        let rows = positions_cb
            .call_blocking(offload, move || broker.get_positions())
            .await?;
        self.sync_from_rows(&rows);
        Ok(())
    }

    /// Pure fold of broker rows into risk state. Idempotent: the same rows
    /// produce the same state.
    pub fn sync_from_rows(&self, rows: &[PositionRow]) {
        let config = self.config();
        let mut state = self.state.lock();

        let mut gross = 0.0;
        let mut turnover = 0.0;
        let mut open = 0u32;
        for row in rows {
            gross += row.realized_pnl;
            turnover += row.buy_amount.abs() + row.sell_amount.abs();
            if row.net_qty != 0 {
                open += 1;
            }
        }

        state.gross_pnl = gross;
        state.turnover = turnover;
        state.est_charges = turnover * CHARGE_FACTOR;
        state.net_pnl = gross - state.est_charges;
        state.open_trades = open;
        if state.net_pnl > state.peak_equity {
            state.peak_equity = state.net_pnl;
        }

        if state.net_pnl <= -config.max_daily_loss && !state.kill_switch {
            state.kill_switch = true;
            warn!(
                net_pnl = state.net_pnl,
                limit = config.max_daily_loss,
                "daily loss limit breached during sync, kill switch ON"
            );
        }

        info!(
            gross_pnl = state.gross_pnl,
            net_pnl = state.net_pnl,
            open_trades = state.open_trades,
            kill_switch = state.kill_switch,
            "risk state reconciled from broker"
        );
    }

    // ── Pre-trade gate ──────────────────────────────────────────────────

    /// The gatekeeper for entries. On success the slot is reserved
    /// optimistically; a broker rejection must release it via
    /// `on_execution_failure`. Exits do not come through here (they only
    /// honour the kill switch).
    pub fn check_pre_trade(
        &self,
        symbol: &str,
        quantity: u64,
        notional_value: f64,
    ) -> Result<()> {
        let config = self.config();
        let mut state = self.state.lock();

        if state.kill_switch {
            warn!(symbol, "trade rejected: kill switch active");
            return Err(EngineError::KillSwitch);
        }
        if state.net_pnl <= -config.max_daily_loss {
            state.kill_switch = true;
            warn!(symbol, net_pnl = state.net_pnl, "trade rejected: daily loss limit");
            return Err(EngineError::KillSwitch);
        }
        if state.open_trades >= config.max_concurrent_trades {
            warn!(
                symbol,
                open_trades = state.open_trades,
                limit = config.max_concurrent_trades,
                "trade rejected: concurrency limit"
            );
            return Err(EngineError::RiskDenied("max concurrent trades reached"));
        }

        state.open_trades += 1;
        state.trades_today += 1;
        info!(
            symbol,
            quantity,
            notional_value,
            open_trades = state.open_trades,
            "trade slot reserved"
        );
        Ok(())
    }

    /// Whether the latching kill switch is on. Exits check only this.
    pub fn kill_switch_active(&self) -> bool {
        self.state.lock().kill_switch
    }

    /// Release an optimistically reserved slot after a broker rejection.
    pub fn on_execution_failure(&self) {
        let mut state = self.state.lock();
        state.open_trades = state.open_trades.saturating_sub(1);
        state.trades_today = state.trades_today.saturating_sub(1);
        info!(open_trades = state.open_trades, "risk slot rolled back");
    }

    // ── Post-trade ──────────────────────────────────────────────────────

    /// A round trip closed: fold its PnL, free the slot, re-check the kill
    /// condition.
    pub fn on_trade_close(&self, pnl: f64) {
        let config = self.config();
        let mut state = self.state.lock();

        state.gross_pnl += pnl;
        state.net_pnl += pnl;
        state.open_trades = state.open_trades.saturating_sub(1);
        if state.net_pnl > state.peak_equity {
            state.peak_equity = state.net_pnl;
        }

        info!(
            pnl,
            net_pnl = state.net_pnl,
            open_trades = state.open_trades,
            "trade closed"
        );

        if state.net_pnl <= -config.max_daily_loss && !state.kill_switch {
            state.kill_switch = true;
            warn!(net_pnl = state.net_pnl, "daily loss limit breached, kill switch ON");
        }
    }

    /// Day-boundary reset. `open_trades` is intentionally untouched: it is
    /// re-derived from the broker so carried positions are not forgotten.
    pub fn daily_reset(&self) {
        let mut state = self.state.lock();
        state.gross_pnl = 0.0;
        state.turnover = 0.0;
        state.est_charges = 0.0;
        state.net_pnl = 0.0;
        state.trades_today = 0;
        state.peak_equity = 0.0;
        state.kill_switch = false;
        info!(open_trades = state.open_trades, "risk state reset for new trading day");
    }

    pub fn status(&self) -> RiskStatus {
        let config = self.config();
        let state = self.state.lock();
        RiskStatus {
            gross_pnl: state.gross_pnl,
            est_charges: state.est_charges,
            net_pnl: state.net_pnl,
            open_trades: state.open_trades,
            trades_today: state.trades_today,
            peak_equity: state.peak_equity,
            kill_switch: state.kill_switch,
            max_daily_loss: config.max_daily_loss,
            max_concurrent_trades: config.max_concurrent_trades,
            status: if state.kill_switch { "HALTED" } else { "ACTIVE" },
        }
    }
}

impl std::fmt::Debug for RiskSentinel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status();
        f.debug_struct("RiskSentinel")
            .field("net_pnl", &status.net_pnl)
            .field("open_trades", &status.open_trades)
            .field("kill_switch", &status.kill_switch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentinel() -> RiskSentinel {
        RiskSentinel::new(RiskConfig {
            max_daily_loss: 1_000.0,
            max_concurrent_trades: 3,
        })
    }

    fn row(net_qty: i64, realized_pnl: f64, buy: f64, sell: f64) -> PositionRow {
        PositionRow {
            token: 2885,
            trading_symbol: "RELIANCE-EQ".to_string(),
            net_qty,
            avg_price: 100.0,
            realized_pnl,
            buy_amount: buy,
            sell_amount: sell,
        }
    }

    #[test]
    fn sync_folds_pnl_turnover_and_open_trades() {
        let s = sentinel();
        s.sync_from_rows(&[
            row(25, 150.0, 10_000.0, 0.0),
            row(0, -40.0, 5_000.0, 4_960.0),
        ]);
        let status = s.status();
        assert!((status.gross_pnl - 110.0).abs() < 1e-9);
        let turnover = 10_000.0 + 5_000.0 + 4_960.0;
        assert!((status.est_charges - turnover * CHARGE_FACTOR).abs() < 1e-9);
        assert!((status.net_pnl - (110.0 - turnover * CHARGE_FACTOR)).abs() < 1e-9);
        assert_eq!(status.open_trades, 1);
        assert!(!status.kill_switch);
    }

    #[test]
    fn sync_is_idempotent() {
        let s = sentinel();
        let rows = vec![row(10, 75.0, 2_000.0, 0.0)];
        s.sync_from_rows(&rows);
        let first = s.status();
        s.sync_from_rows(&rows);
        let second = s.status();
        assert_eq!(first.open_trades, second.open_trades);
        assert!((first.net_pnl - second.net_pnl).abs() < 1e-12);
        assert_eq!(first.kill_switch, second.kill_switch);
    }

    #[test]
    fn kill_switch_latches_through_sync_and_reset_restores() {
        let s = sentinel();
        // Preloaded broker book: realized -1010, no turnover.
        s.sync_from_rows(&[row(0, -1_010.0, 0.0, 0.0)]);
        assert!(s.kill_switch_active());

        // All subsequent entries are refused.
        let err = s.check_pre_trade("RELIANCE-EQ", 10, 1_000.0).unwrap_err();
        assert!(matches!(err, EngineError::KillSwitch));

        // A profitable close does not clear the latch.
        s.on_trade_close(2_000.0);
        assert!(s.kill_switch_active());
        assert!(s.check_pre_trade("RELIANCE-EQ", 10, 1_000.0).is_err());

        // Manual daily reset clears the latch but keeps open_trades.
        s.sync_from_rows(&[row(25, -1_010.0, 0.0, 0.0)]);
        s.daily_reset();
        assert!(!s.kill_switch_active());
        assert_eq!(s.status().open_trades, 1);
        assert_eq!(s.status().trades_today, 0);
    }

    #[test]
    fn pre_trade_reserves_and_rollback_releases() {
        let s = sentinel();
        assert!(s.check_pre_trade("A", 10, 1_000.0).is_ok());
        assert!(s.check_pre_trade("B", 10, 1_000.0).is_ok());
        assert_eq!(s.status().open_trades, 2);
        assert_eq!(s.status().trades_today, 2);

        s.on_execution_failure();
        assert_eq!(s.status().open_trades, 1);
        assert_eq!(s.status().trades_today, 1);
    }

    #[test]
    fn concurrency_limit_denies_the_fourth_entry() {
        let s = sentinel();
        for _ in 0..3 {
            assert!(s.check_pre_trade("A", 1, 100.0).is_ok());
        }
        let err = s.check_pre_trade("A", 1, 100.0).unwrap_err();
        assert!(matches!(err, EngineError::RiskDenied(_)));
        assert_eq!(s.status().open_trades, 3);
    }

    #[test]
    fn trade_close_frees_slot_and_can_trip_the_switch() {
        let s = sentinel();
        assert!(s.check_pre_trade("A", 1, 100.0).is_ok());
        s.on_trade_close(-1_200.0);
        let status = s.status();
        assert_eq!(status.open_trades, 0);
        assert!(status.kill_switch);
    }

    #[test]
    fn open_trades_never_underflows() {
        let s = sentinel();
        s.on_trade_close(10.0);
        s.on_execution_failure();
        assert_eq!(s.status().open_trades, 0);
    }
}
