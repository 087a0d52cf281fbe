// =============================================================================
// Strategy runtime — per-instrument state machine around a decision function
// =============================================================================
//
// States over the signed position: FLAT, LONG, SHORT, COOLING (flat inside
// the post-exit cooldown window) and DISABLED (repeated decision errors).
//
// Intent classification: an order that reduces |position| is an EXIT and
// skips the concurrency gate; one that increases it is an ENTRY and is
// fully gated and sized. The decision function runs inside an error
// boundary — a panicking strategy is counted, and disabled after five
// consecutive failures, without taking the engine down.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::clock;
use crate::context::EngineContext;
use crate::execution::pipeline::{OrderResponse, TradeKind};
use crate::risk::sizer::{position_size, SizingInputs};
use crate::strategy::{Intent, Strategy, StrategyView};
use crate::types::{Bar, OrderStatus, OrderUpdate, Side, Tick};

/// Bars retained for indicator computation.
const BAR_RING_CAPACITY: usize = 100;
/// Consecutive decision failures before the strategy is disabled.
const MAX_ERRORS_BEFORE_STOP: u32 = 5;
/// Minimum spacing between orders from one strategy.
const TRADE_DEBOUNCE: Duration = Duration::from_secs(1);
/// Default post-exit cooldown.
const DEFAULT_COOLDOWN_MINUTES: i64 = 10;

/// Lifecycle of one of our orders as seen by the update handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppliedState {
    /// Position applied from the optimistic placement response.
    Optimistic,
    /// A broker fill confirmed (and possibly refined) the optimistic apply.
    Confirmed,
    /// The broker reversed an accepted order; position awaits re-sync.
    Reversed,
}

struct RuntimeState {
    position: i64,
    avg_price: f64,
    last_price: f64,
    bars: VecDeque<Bar>,
    last_exit: Option<DateTime<FixedOffset>>,
    last_trade: Option<Instant>,
    error_count: u32,
    active: bool,
    /// Per-exchange-id lifecycle; makes order updates idempotent.
    applied: HashMap<String, AppliedState>,
}

/// Per-strategy snapshot for the /status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StrategySnapshot {
    pub symbol: String,
    pub strategy: String,
    pub state: &'static str,
    pub position: i64,
    pub avg_price: f64,
    pub last_price: f64,
    pub unrealized_pnl: f64,
    pub active: bool,
}

pub struct StrategyRuntime {
    pub symbol: String,
    pub token: u32,
    strategy_name: String,
    ctx: Arc<EngineContext>,
    strategy: Mutex<Box<dyn Strategy>>,
    state: Mutex<RuntimeState>,
    cooldown: chrono::Duration,
}

impl StrategyRuntime {
    pub fn new(
        symbol: String,
        token: u32,
        strategy: Box<dyn Strategy>,
        ctx: Arc<EngineContext>,
    ) -> Self {
        let strategy_name = strategy.name().to_string();
        Self {
            symbol,
            token,
            strategy_name,
            ctx,
            strategy: Mutex::new(strategy),
            state: Mutex::new(RuntimeState {
                position: 0,
                avg_price: 0.0,
                last_price: 0.0,
                bars: VecDeque::with_capacity(BAR_RING_CAPACITY),
                last_exit: None,
                last_trade: None,
                error_count: 0,
                active: true,
                applied: HashMap::new(),
            }),
            cooldown: chrono::Duration::minutes(DEFAULT_COOLDOWN_MINUTES),
        }
    }

    #[cfg(test)]
    pub fn with_cooldown(mut self, cooldown: chrono::Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn position(&self) -> i64 {
        self.state.lock().position
    }

    /// Restore position from the broker book (boot reconciliation).
    pub fn sync_position(&self, net_qty: i64, avg_price: f64) {
        let mut state = self.state.lock();
        if net_qty != 0 {
            warn!(
                symbol = %self.symbol,
                net_qty,
                avg_price,
                "reconciled existing broker position"
            );
        }
        state.position = net_qty;
        state.avg_price = if net_qty == 0 { 0.0 } else { avg_price };
    }

    // ── Event hooks ─────────────────────────────────────────────────────

    pub fn on_tick(&self, tick: &Tick) {
        let mut state = self.state.lock();
        state.last_price = tick.ltp;
    }

    /// Run the decision function for a closed bar and act on its intent.
    pub async fn on_bar_close(&self, bar: Bar) {
        let intent = self.decide(bar);
        if let Some(intent) = intent {
            self.act(intent, None).await;
        }
    }

    fn decide(&self, bar: Bar) -> Option<Intent> {
        let (bars, view, cooling) = {
            let mut state = self.state.lock();
            if !state.active {
                return None;
            }
            state.last_price = bar.close;
            state.bars.push_back(bar);
            while state.bars.len() > BAR_RING_CAPACITY {
                state.bars.pop_front();
            }

            let cooling = state.position == 0 && self.in_cooldown(&state);
            let view = StrategyView {
                position: state.position,
                avg_price: state.avg_price,
                last_price: state.last_price,
            };
            let bars: Vec<Bar> = state.bars.iter().cloned().collect();
            (bars, view, cooling)
        };

        if cooling {
            return None;
        }

        // Error boundary: one bad formula must not take the engine down.
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.strategy.lock().on_bar_close(&bars, &view)
        }));

        let mut state = self.state.lock();
        match outcome {
            Ok(intent) => {
                state.error_count = 0;
                intent
            }
            Err(panic) => {
                state.error_count += 1;
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                error!(
                    symbol = %self.symbol,
                    strategy = %self.strategy_name,
                    errors = state.error_count,
                    panic = %msg,
                    "strategy logic error"
                );
                if state.error_count >= MAX_ERRORS_BEFORE_STOP {
                    state.active = false;
                    error!(
                        symbol = %self.symbol,
                        strategy = %self.strategy_name,
                        "too many consecutive errors, strategy disabled"
                    );
                }
                None
            }
        }
    }

    /// Idempotent fill/reject handler for broker-pushed updates. Position
    /// changes are applied optimistically at execution time; updates refine
    /// the entry price and flag post-acceptance rejections (the next broker
    /// sync re-trues the position).
    pub fn on_order_update(&self, update: &OrderUpdate) {
        let mut state = self.state.lock();
        let previous = state.applied.get(&update.exchange_id).copied();

        match (previous, update.status) {
            // Duplicate deliveries are no-ops.
            (Some(AppliedState::Confirmed), OrderStatus::Complete)
            | (Some(AppliedState::Reversed), OrderStatus::Rejected)
            | (Some(AppliedState::Reversed), OrderStatus::Cancelled) => {}

            // First confirmation of an optimistic apply: take the broker's
            // fill price over the placement price.
            (Some(AppliedState::Optimistic), OrderStatus::Complete) => {
                if update.avg_price > 0.0
                    && state.position != 0
                    && state.position.unsigned_abs() == update.filled_qty
                {
                    state.avg_price = update.avg_price;
                }
                state
                    .applied
                    .insert(update.exchange_id.clone(), AppliedState::Confirmed);
            }

            // The broker reversed an order we already applied. The next
            // broker sync re-trues the position.
            (Some(_), OrderStatus::Rejected) | (Some(_), OrderStatus::Cancelled) => {
                warn!(
                    symbol = %self.symbol,
                    exchange_id = %update.exchange_id,
                    status = %update.status,
                    "broker reversed an accepted order; awaiting position re-sync"
                );
                state
                    .applied
                    .insert(update.exchange_id.clone(), AppliedState::Reversed);
            }

            // Updates for orders we never applied (or non-terminal echoes)
            // carry no position information.
            _ => {}
        }
    }

    /// External (webhook) signal entry point.
    pub async fn on_external_signal(&self, side: Side, price: f64, qty: Option<u64>) -> bool {
        let reference = if price > 0.0 {
            price
        } else {
            self.state.lock().last_price
        };
        let stop_loss = match side {
            Side::Buy => Some(reference * 0.99),
            Side::Sell => None,
        };
        let intent = Intent {
            side,
            price,
            stop_loss,
            confidence: 2.0,
            tag: "WEBHOOK".to_string(),
        };
        self.act(intent, qty).await
    }

    /// Flatten any open position at market (square-off / panic path).
    pub async fn force_flat(&self) {
        let (side, qty) = {
            let state = self.state.lock();
            if state.position == 0 {
                return;
            }
            let side = if state.position > 0 {
                Side::Sell
            } else {
                Side::Buy
            };
            (side, state.position.unsigned_abs())
        };
        info!(symbol = %self.symbol, %side, qty, "square-off");
        let response = self
            .ctx
            .pipeline
            .execute_order(
                &self.symbol,
                self.token,
                side,
                qty,
                0.0,
                "SQUARE_OFF",
                TradeKind::ForceExit,
            )
            .await;
        if let Some(response) = response {
            self.apply_execution(side, &response, 0.0);
        }
    }

    // ── Order flow ──────────────────────────────────────────────────────

    async fn act(&self, intent: Intent, qty_override: Option<u64>) -> bool {
        let side = intent.side;
        let (kind, qty) = {
            let state = self.state.lock();
            if !state.active {
                return false;
            }
            // Debounce: at most one order per second per strategy.
            if let Some(last) = state.last_trade {
                if last.elapsed() < TRADE_DEBOUNCE {
                    return false;
                }
            }

            let reduces = match side {
                Side::Buy => state.position < 0,
                Side::Sell => state.position > 0,
            };
            if reduces {
                let qty = qty_override
                    .unwrap_or(state.position.unsigned_abs())
                    .min(state.position.unsigned_abs());
                (TradeKind::Exit, qty)
            } else {
                let qty = qty_override.unwrap_or_else(|| self.entry_quantity(&intent, &state));
                (TradeKind::Entry, qty)
            }
        };

        if qty == 0 {
            return false;
        }

        info!(
            symbol = %self.symbol,
            %side,
            qty,
            price = intent.price,
            tag = %intent.tag,
            kind = ?kind,
            "intent accepted"
        );

        let response = self
            .ctx
            .pipeline
            .execute_order(
                &self.symbol,
                self.token,
                side,
                qty,
                intent.price,
                &intent.tag,
                kind,
            )
            .await;

        match response {
            Some(response) => {
                self.apply_execution(side, &response, intent.price);
                true
            }
            None => false,
        }
    }

    fn entry_quantity(&self, intent: &Intent, state: &RuntimeState) -> u64 {
        let entry = if intent.price > 0.0 {
            intent.price
        } else {
            state.last_price
        };
        if entry <= 0.0 {
            return 0;
        }
        let sizing = *self.ctx.sizing.read();
        let open_trades = self.ctx.sentinel.status().open_trades;
        let lot_size = self
            .ctx
            .instruments
            .by_token(self.token)
            .map(|i| i.lot_size)
            .unwrap_or(1);

        position_size(
            sizing.method,
            &SizingInputs {
                total_capital: sizing.total_capital,
                available_capital: sizing.available_capital,
                max_slots: sizing.max_slots,
                open_slots: sizing.max_slots.saturating_sub(open_trades),
                entry,
                stop_loss: intent.stop_loss.unwrap_or(0.0),
                lot_size,
                confidence: intent.confidence,
                risk_per_trade_fraction: sizing.risk_per_trade_fraction,
                leverage: sizing.leverage,
            },
        )
    }

    /// Fold a successful execution into the position state machine.
    fn apply_execution(&self, side: Side, response: &OrderResponse, intent_price: f64) {
        let mut state = self.state.lock();
        let fill_price = if response.avg_price > 0.0 {
            response.avg_price
        } else if intent_price > 0.0 {
            intent_price
        } else {
            state.last_price
        };

        let signed = response.filled_qty as i64 * side.sign();
        let prev = state.position;
        let next = prev + signed;

        // Realize PnL on the closed portion and free the risk slot. With
        // no usable price (square-off before any tick) the slot is still
        // freed; the PnL comes from the next broker sync.
        let mut closed_pnl = None;
        if prev != 0 && prev.signum() != signed.signum() {
            let closing = prev.abs().min(signed.abs());
            if fill_price > 0.0 && state.avg_price > 0.0 {
                closed_pnl =
                    Some(prev.signum() as f64 * closing as f64 * (fill_price - state.avg_price));
            } else {
                closed_pnl = Some(0.0);
            }
        }

        if next == 0 {
            state.avg_price = 0.0;
            state.last_exit = Some(clock::now_exchange());
        } else if prev == 0 || prev.signum() != next.signum() {
            state.avg_price = fill_price;
        } else if prev.signum() == signed.signum() {
            let total = prev.abs() + signed.abs();
            state.avg_price = (prev.abs() as f64 * state.avg_price
                + signed.abs() as f64 * fill_price)
                / total as f64;
        }

        state.position = next;
        state.last_trade = Some(Instant::now());
        for leg_id in response.order_id.split(',').filter(|s| !s.is_empty()) {
            state
                .applied
                .insert(leg_id.to_string(), AppliedState::Optimistic);
        }

        info!(
            symbol = %self.symbol,
            position = state.position,
            avg_price = state.avg_price,
            "position updated"
        );
        drop(state);

        if let Some(pnl) = closed_pnl {
            self.ctx.sentinel.on_trade_close(pnl);
        }
    }

    // ── Introspection ───────────────────────────────────────────────────

    fn in_cooldown(&self, state: &RuntimeState) -> bool {
        state
            .last_exit
            .map(|exit| clock::now_exchange() - exit < self.cooldown)
            .unwrap_or(false)
    }

    pub fn state_label(&self) -> &'static str {
        let state = self.state.lock();
        if !state.active {
            return "DISABLED";
        }
        if state.position > 0 {
            "LONG"
        } else if state.position < 0 {
            "SHORT"
        } else if self.in_cooldown(&state) {
            "COOLING"
        } else {
            "FLAT"
        }
    }

    pub fn snapshot(&self) -> StrategySnapshot {
        let label = self.state_label();
        let state = self.state.lock();
        let unrealized = if state.position != 0 && state.last_price > 0.0 {
            state.position as f64 * (state.last_price - state.avg_price)
        } else {
            0.0
        };
        StrategySnapshot {
            symbol: self.symbol.clone(),
            strategy: self.strategy_name.clone(),
            state: label,
            position: state.position,
            avg_price: state.avg_price,
            last_price: state.last_price,
            unrealized_pnl: unrealized,
            active: state.active,
        }
    }
}

impl std::fmt::Debug for StrategyRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRuntime")
            .field("symbol", &self.symbol)
            .field("token", &self.token)
            .field("state", &self.state_label())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperBroker;
    use crate::config::SizingMethod;
    use crate::context::SizingContext;
    use crate::core::offload::ThreadOffload;
    use crate::data::instruments::{test_instrument, InstrumentCache};
    use crate::execution::pipeline::ExecutionPipeline;
    use crate::risk::sentinel::{RiskConfig, RiskSentinel};
    use crate::store::memory_store;
    use chrono::TimeZone;

    #[derive(Debug)]
    struct ScriptedStrategy {
        intents: Mutex<VecDeque<Option<Intent>>>,
    }

    impl ScriptedStrategy {
        fn new(intents: Vec<Option<Intent>>) -> Box<Self> {
            Box::new(Self {
                intents: Mutex::new(intents.into()),
            })
        }
    }

    impl Strategy for ScriptedStrategy {
        fn name(&self) -> &'static str {
            "SCRIPTED"
        }
        fn warmup_bars(&self) -> usize {
            0
        }
        fn on_bar_close(&mut self, _bars: &[Bar], _view: &StrategyView) -> Option<Intent> {
            self.intents.lock().pop_front().flatten()
        }
    }

    #[derive(Debug)]
    struct PanickingStrategy;

    impl Strategy for PanickingStrategy {
        fn name(&self) -> &'static str {
            "PANICS"
        }
        fn warmup_bars(&self) -> usize {
            0
        }
        fn on_bar_close(&mut self, _bars: &[Bar], _view: &StrategyView) -> Option<Intent> {
            panic!("formula divided by zero")
        }
    }

    fn buy_intent(price: f64, sl: f64) -> Option<Intent> {
        Some(Intent {
            side: Side::Buy,
            price,
            stop_loss: Some(sl),
            confidence: 1.0,
            tag: "SIGNAL".to_string(),
        })
    }

    fn sell_exit() -> Option<Intent> {
        Some(Intent {
            side: Side::Sell,
            price: 0.0,
            stop_loss: None,
            confidence: 1.0,
            tag: "STOP_LOSS".to_string(),
        })
    }

    fn bar_at(minute: u32, close: f64) -> Bar {
        Bar {
            token: 2885,
            start_time: clock::exchange_tz()
                .with_ymd_and_hms(2025, 3, 4, 9, 15 + minute, 0)
                .single()
                .unwrap(),
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 100,
        }
    }

    async fn make_ctx(sentinel: Arc<RiskSentinel>) -> Arc<EngineContext> {
        let instruments = Arc::new(InstrumentCache::new(vec![test_instrument(
            2885,
            "RELIANCE-EQ",
        )]));
        let pipeline = Arc::new(ExecutionPipeline::new(
            Arc::new(PaperBroker::new()),
            Arc::new(ThreadOffload::new(4)),
            memory_store().await,
            sentinel.clone(),
            instruments.clone(),
        ));
        Arc::new(EngineContext::new(
            pipeline,
            sentinel,
            instruments,
            SizingContext {
                method: SizingMethod::SlotRisk,
                total_capital: 100_000.0,
                available_capital: 100_000.0,
                max_slots: 4,
                risk_per_trade_fraction: 0.01,
                leverage: 1.0,
            },
        ))
    }

    fn runtime(strategy: Box<dyn Strategy>, ctx: Arc<EngineContext>) -> StrategyRuntime {
        StrategyRuntime::new("RELIANCE-EQ".to_string(), 2885, strategy, ctx)
    }

    #[tokio::test]
    async fn long_entry_sizes_gates_and_updates_position() {
        let sentinel = Arc::new(RiskSentinel::new(RiskConfig::default()));
        let ctx = make_ctx(sentinel.clone()).await;
        let rt = runtime(ScriptedStrategy::new(vec![buy_intent(100.0, 99.0)]), ctx);

        rt.on_bar_close(bar_at(0, 100.0)).await;

        // Slot capital 25 000 at entry 100 and risk 1000/1 -> 250 shares.
        assert_eq!(rt.position(), 250);
        let snap = rt.snapshot();
        assert!((snap.avg_price - 100.0).abs() < f64::EPSILON);
        assert_eq!(snap.state, "LONG");
        assert_eq!(sentinel.status().open_trades, 1);
        assert_eq!(sentinel.status().trades_today, 1);
    }

    #[tokio::test]
    async fn exit_bypasses_saturated_slots_and_realizes_pnl() {
        let sentinel = Arc::new(RiskSentinel::new(RiskConfig {
            max_daily_loss: 10_000.0,
            max_concurrent_trades: 3,
        }));
        for _ in 0..3 {
            sentinel.check_pre_trade("X", 1, 100.0).unwrap();
        }
        let ctx = make_ctx(sentinel.clone()).await;
        let rt = runtime(ScriptedStrategy::new(vec![sell_exit()]), ctx)
            .with_cooldown(chrono::Duration::zero());
        rt.sync_position(50, 100.0);

        rt.on_bar_close(bar_at(0, 102.0)).await;

        assert_eq!(rt.position(), 0);
        assert_eq!(rt.snapshot().state, "FLAT");
        // Exit went through despite 3/3 slots, and the close freed one.
        assert_eq!(sentinel.status().open_trades, 2);
        // 50 shares closed at the bar close 102 against entry 100.
        assert!((sentinel.status().net_pnl - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cooldown_suppresses_reentry_until_it_expires() {
        let sentinel = Arc::new(RiskSentinel::new(RiskConfig::default()));
        let ctx = make_ctx(sentinel.clone()).await;
        let rt = runtime(
            ScriptedStrategy::new(vec![sell_exit(), buy_intent(100.0, 99.0)]),
            ctx,
        )
        .with_cooldown(chrono::Duration::minutes(10));
        rt.sync_position(10, 100.0);

        rt.on_bar_close(bar_at(0, 101.0)).await;
        assert_eq!(rt.position(), 0);
        assert_eq!(rt.snapshot().state, "COOLING");

        // Next bar's entry intent is suppressed: the decision function is
        // not even consulted, so the scripted BUY stays queued.
        rt.on_bar_close(bar_at(1, 101.0)).await;
        assert_eq!(rt.position(), 0);
    }

    #[tokio::test]
    async fn five_consecutive_panics_disable_the_strategy() {
        let sentinel = Arc::new(RiskSentinel::new(RiskConfig::default()));
        let ctx = make_ctx(sentinel).await;
        let rt = runtime(Box::new(PanickingStrategy), ctx);

        for i in 0..5 {
            assert!(rt.is_active());
            rt.on_bar_close(bar_at(i, 100.0)).await;
        }
        assert!(!rt.is_active());
        assert_eq!(rt.snapshot().state, "DISABLED");

        // Further bars are ignored without panicking the caller.
        rt.on_bar_close(bar_at(6, 100.0)).await;
    }

    #[tokio::test]
    async fn debounce_swallows_back_to_back_intents() {
        let sentinel = Arc::new(RiskSentinel::new(RiskConfig {
            max_daily_loss: 10_000.0,
            max_concurrent_trades: 10,
        }));
        let ctx = make_ctx(sentinel.clone()).await;
        let rt = runtime(
            ScriptedStrategy::new(vec![buy_intent(100.0, 99.0), buy_intent(100.0, 99.0)]),
            ctx,
        );

        rt.on_bar_close(bar_at(0, 100.0)).await;
        let after_first = rt.position();
        rt.on_bar_close(bar_at(1, 100.0)).await; // within 1s of the first
        assert_eq!(rt.position(), after_first);
        assert_eq!(sentinel.status().trades_today, 1);
    }

    #[tokio::test]
    async fn order_updates_are_idempotent_and_refine_the_entry() {
        let sentinel = Arc::new(RiskSentinel::new(RiskConfig::default()));
        let ctx = make_ctx(sentinel).await;
        let rt = runtime(ScriptedStrategy::new(vec![buy_intent(100.0, 99.0)]), ctx);
        rt.on_bar_close(bar_at(0, 100.0)).await;
        let exchange_id = {
            let state = rt.state.lock();
            state.applied.keys().next().unwrap().clone()
        };

        let update = OrderUpdate {
            exchange_id: exchange_id.clone(),
            token: 2885,
            status: OrderStatus::Complete,
            filled_qty: 250,
            avg_price: 100.05,
            reason: None,
        };
        rt.on_order_update(&update);
        assert!((rt.snapshot().avg_price - 100.05).abs() < 1e-9);
        let position = rt.position();

        // Re-delivery changes nothing.
        rt.on_order_update(&update);
        assert_eq!(rt.position(), position);
        assert!((rt.snapshot().avg_price - 100.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn webhook_buy_enters_with_double_confidence() {
        let sentinel = Arc::new(RiskSentinel::new(RiskConfig::default()));
        let ctx = make_ctx(sentinel.clone()).await;
        let rt = runtime(ScriptedStrategy::new(vec![]), ctx);
        rt.on_tick(&Tick {
            token: 2885,
            ltp: 100.0,
            cum_volume: 0,
            ltt: clock::now_exchange(),
        });

        assert!(rt.on_external_signal(Side::Buy, 100.0, None).await);
        // Slot 25 000 * 2.0 confidence at entry 100 = 500, below the
        // risk-derived 1000 from the 1 % synthetic stop.
        assert_eq!(rt.position(), 500);
        assert_eq!(sentinel.status().open_trades, 1);

        // A webhook SELL with no quantity flattens (past the debounce).
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        assert!(rt.on_external_signal(Side::Sell, 0.0, None).await);
        assert_eq!(rt.position(), 0);
    }
}
