// =============================================================================
// Execution pipeline — risk gate, iceberg slicing, ledger, broker call
// =============================================================================
//
// Single entry point for every order in the engine. The middleware order is
// fixed: risk gate -> ledger row -> rate limiter -> circuit breaker ->
// offloaded broker call -> ledger finalise.
//
// Quantities above the instrument's freeze quantity are sliced into
// sequential iceberg legs with a small delay between them (per-second
// exchange order caps). The chain stops at the first failing leg:
// continuing after a failure risks correlated rejections and "same order"
// limits.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerAdapter, OrderParams};
use crate::core::breaker::CircuitBreaker;
use crate::core::limiter::TokenBucket;
use crate::core::offload::ThreadOffload;
use crate::data::instruments::InstrumentCache;
use crate::error::EngineError;
use crate::risk::sentinel::RiskSentinel;
use crate::store::Store;
use crate::types::{OrderStatus, Side};

/// Pause between iceberg legs.
const LEG_DELAY: Duration = Duration::from_millis(200);

/// How an order changes exposure. Entries are fully gated; exits skip the
/// concurrency/exposure checks but honour the kill switch; forced exits
/// (square-off, panic) bypass the gate entirely so positions can always be
/// flattened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeKind {
    Entry,
    Exit,
    ForceExit,
}

/// Aggregate outcome of a (possibly multi-leg) execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecStatus {
    Complete,
    Partial,
}

/// What the strategy gets back. `order_id` is the comma-joined exchange ids
/// of the successful legs.
#[derive(Debug, Clone, Serialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub status: ExecStatus,
    pub filled_qty: u64,
    pub avg_price: f64,
}

pub struct ExecutionPipeline {
    broker: Arc<dyn BrokerAdapter>,
    offload: Arc<ThreadOffload>,
    store: Store,
    sentinel: Arc<RiskSentinel>,
    instruments: Arc<InstrumentCache>,
    order_limiter: TokenBucket,
    broker_cb: CircuitBreaker,
    leg_delay: Duration,
}

impl ExecutionPipeline {
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        offload: Arc<ThreadOffload>,
        store: Store,
        sentinel: Arc<RiskSentinel>,
        instruments: Arc<InstrumentCache>,
    ) -> Self {
        Self {
            broker,
            offload,
            store,
            sentinel,
            instruments,
            order_limiter: TokenBucket::with_defaults("orders"),
            broker_cb: CircuitBreaker::for_broker(),
            leg_delay: LEG_DELAY,
        }
    }

    #[cfg(test)]
    pub fn with_leg_delay(mut self, delay: Duration) -> Self {
        self.leg_delay = delay;
        self
    }

    /// Unified order entry point. Returns `None` when the order was denied
    /// or fully rejected — the strategy treats that as a no-op.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_order(
        &self,
        symbol: &str,
        token: u32,
        side: Side,
        quantity: u64,
        price: f64,
        tag: &str,
        kind: TradeKind,
    ) -> Option<OrderResponse> {
        if quantity == 0 {
            return None;
        }

        // 1. Risk gate.
        match kind {
            TradeKind::Entry => {
                let notional = quantity as f64 * if price > 0.0 { price } else { 0.0 };
                if let Err(e) = self.sentinel.check_pre_trade(symbol, quantity, notional) {
                    warn!(symbol, %side, quantity, error = %e, "order blocked by risk sentinel");
                    return None;
                }
            }
            TradeKind::Exit => {
                if self.sentinel.kill_switch_active() {
                    warn!(symbol, %side, "exit blocked: kill switch active (use square-off)");
                    return None;
                }
            }
            TradeKind::ForceExit => {}
        }

        // 2. Freeze quantity and slicing plan.
        let freeze_qty = self.instruments.freeze_qty(token);
        let parent_id = if quantity > freeze_qty {
            Some(Uuid::new_v4())
        } else {
            None
        };

        if let Some(parent) = parent_id {
            let legs = quantity.div_ceil(freeze_qty);
            info!(symbol, quantity, freeze_qty, legs, parent = %parent, "iceberg slicing activated");
        }

        // 3. Execute legs sequentially; stop the chain on the first failure.
        let mut remaining = quantity;
        let mut filled: u64 = 0;
        let mut leg_ids: Vec<String> = Vec::new();
        let mut avg_price = 0.0;
        let mut first_leg = true;

        while remaining > 0 {
            let leg_qty = remaining.min(freeze_qty);
            if !first_leg {
                tokio::time::sleep(self.leg_delay).await;
            }
            first_leg = false;

            match self
                .send_single(symbol, token, side, leg_qty, price, tag, parent_id, kind)
                .await
            {
                Ok(leg) => {
                    filled += leg_qty;
                    avg_price = leg.avg_price.max(avg_price);
                    leg_ids.push(leg.order_id);
                    remaining -= leg_qty;
                }
                Err(e) => {
                    error!(symbol, %side, leg_qty, error = %e, "leg failed, stopping chain");
                    break;
                }
            }
        }

        // 4. Aggregate.
        if filled == 0 {
            return None;
        }
        let status = if filled == quantity {
            ExecStatus::Complete
        } else {
            ExecStatus::Partial
        };
        Some(OrderResponse {
            order_id: leg_ids.join(","),
            status,
            filled_qty: filled,
            avg_price,
        })
    }

    /// One leg: ledger row, limiter, breaker, broker, finalise.
    #[allow(clippy::too_many_arguments)]
    async fn send_single(
        &self,
        symbol: &str,
        token: u32,
        side: Side,
        quantity: u64,
        price: f64,
        tag: &str,
        parent_id: Option<Uuid>,
        kind: TradeKind,
    ) -> Result<OrderResponse, EngineError> {
        let internal_id = Uuid::new_v4();
        let params = OrderParams::intraday(symbol, token, side, quantity, price);
        let raw_request = serde_json::to_value(&params).unwrap_or_default();

        // Persist before the broker call so a crash can never lose intent.
        self.store
            .ledger_insert_pending(
                internal_id,
                token,
                side,
                params.order_type,
                quantity,
                price,
                tag,
                parent_id,
                &raw_request,
            )
            .await?;

        self.order_limiter.acquire().await;

        let broker = self.broker.clone();
        let call_params = params.clone();
        let outcome = self
            .broker_cb
            .call_blocking(&self.offload, move || broker.place_order(call_params))
            .await;

        match outcome {
            Ok(reply) if reply.accepted() => {
                let exchange_id = reply.order_id.clone().unwrap_or_default();
                info!(
                    symbol,
                    %side,
                    quantity,
                    exchange_id = %exchange_id,
                    tag,
                    "order accepted by broker"
                );
                // Optimistic COMPLETE on acceptance; the true fill arrives
                // on the order queue and refines the row. Ledger writes
                // never block the strategy loop.
                self.finalize_async(
                    internal_id,
                    Some(exchange_id.clone()),
                    OrderStatus::Complete,
                    None,
                    reply.raw.clone(),
                );
                Ok(OrderResponse {
                    order_id: exchange_id,
                    status: ExecStatus::Complete,
                    filled_qty: quantity,
                    avg_price: price,
                })
            }
            Ok(reply) => {
                let reason = reply
                    .err_msg
                    .clone()
                    .unwrap_or_else(|| "broker rejected".to_string());
                warn!(symbol, %side, quantity, reason = %reason, "order rejected");
                if kind == TradeKind::Entry {
                    self.sentinel.on_execution_failure();
                }
                self.finalize_async(
                    internal_id,
                    None,
                    OrderStatus::Rejected,
                    Some(reason.clone()),
                    reply.raw.clone(),
                );
                Err(EngineError::OrderRejected(reason))
            }
            Err(e) => {
                error!(symbol, %side, quantity, error = %e, "order placement failed");
                if kind == TradeKind::Entry {
                    self.sentinel.on_execution_failure();
                }
                self.finalize_async(
                    internal_id,
                    None,
                    OrderStatus::Failed,
                    Some(e.to_string()),
                    serde_json::Value::Null,
                );
                Err(e)
            }
        }
    }

    /// Fire-and-forget ledger finalise.
    fn finalize_async(
        &self,
        internal_id: Uuid,
        exchange_id: Option<String>,
        status: OrderStatus,
        reason: Option<String>,
        raw: serde_json::Value,
    ) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store
                .ledger_finalize(
                    internal_id,
                    exchange_id.as_deref(),
                    status,
                    reason.as_deref(),
                    &raw,
                )
                .await
            {
                error!(internal_id = %internal_id, error = %e, "ledger finalise failed");
            }
        });
    }

    /// Apply a broker-pushed order update to the ledger (order loop path).
    pub async fn apply_order_update(&self, update: &crate::types::OrderUpdate) {
        if update.exchange_id.is_empty() {
            return;
        }
        match self
            .store
            .ledger_apply_update(
                &update.exchange_id,
                update.status,
                update.filled_qty,
                update.avg_price,
                update.reason.as_deref(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(exchange_id = %update.exchange_id, "order update for unknown ledger row");
            }
            Err(e) => error!(exchange_id = %update.exchange_id, error = %e, "ledger update failed"),
        }
    }
}

impl std::fmt::Debug for ExecutionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPipeline").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperBroker;
    use crate::broker::{BrokerReply, FeedCallbacks, PositionRow};
    use crate::data::instruments::{test_instrument, InstrumentCache};
    use crate::error::Result;
    use crate::risk::sentinel::{RiskConfig, RiskSentinel};
    use crate::store::memory_store;
    use crate::types::EngineMode;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cache_with_freeze(freeze: u64) -> Arc<InstrumentCache> {
        let mut inst = test_instrument(2885, "RELIANCE-EQ");
        inst.freeze_qty = freeze;
        Arc::new(InstrumentCache::new(vec![inst]))
    }

    async fn pipeline_with(
        broker: Arc<dyn BrokerAdapter>,
        sentinel: Arc<RiskSentinel>,
        freeze: u64,
    ) -> ExecutionPipeline {
        ExecutionPipeline::new(
            broker,
            Arc::new(ThreadOffload::new(4)),
            memory_store().await,
            sentinel,
            cache_with_freeze(freeze),
        )
        .with_leg_delay(Duration::from_millis(1))
    }

    fn sentinel() -> Arc<RiskSentinel> {
        Arc::new(RiskSentinel::new(RiskConfig {
            max_daily_loss: 1_000.0,
            max_concurrent_trades: 3,
        }))
    }

    /// Accepts the first `accept_legs` orders, rejects the rest.
    struct FlakyBroker {
        accept_legs: u32,
        placed: AtomicU32,
    }

    impl FlakyBroker {
        fn new(accept_legs: u32) -> Self {
            Self {
                accept_legs,
                placed: AtomicU32::new(0),
            }
        }
    }

    impl BrokerAdapter for FlakyBroker {
        fn mode(&self) -> EngineMode {
            EngineMode::Paper
        }
        fn login(&self) -> Result<()> {
            Ok(())
        }
        fn is_logged_in(&self) -> bool {
            true
        }
        fn place_order(&self, _params: OrderParams) -> Result<BrokerReply> {
            let n = self.placed.fetch_add(1, Ordering::SeqCst);
            if n < self.accept_legs {
                Ok(BrokerReply::ok(
                    format!("LEG{n}"),
                    serde_json::json!({ "stat": "Ok" }),
                ))
            } else {
                Ok(BrokerReply::not_ok("freeze limit breach"))
            }
        }
        fn cancel_order(&self, _id: String) -> Result<BrokerReply> {
            Ok(BrokerReply::not_ok("n/a"))
        }
        fn modify_order(&self, _id: String, _p: f64, _q: u64) -> Result<BrokerReply> {
            Ok(BrokerReply::not_ok("n/a"))
        }
        fn get_positions(&self) -> Result<Vec<PositionRow>> {
            Ok(Vec::new())
        }
        fn get_limits(&self) -> Result<f64> {
            Ok(0.0)
        }
        fn subscribe(&self, _tokens: Vec<u32>) -> Result<()> {
            Ok(())
        }
        fn fetch_instruments(&self) -> Result<Vec<crate::data::instruments::Instrument>> {
            Ok(Vec::new())
        }
        fn start_feed(&self, _callbacks: FeedCallbacks) -> Result<()> {
            Ok(())
        }
        fn stop_feed(&self) {}
    }

    #[tokio::test]
    async fn single_order_accepted_and_ledgered() {
        let s = sentinel();
        let pipeline =
            pipeline_with(Arc::new(PaperBroker::new()), s.clone(), 1800).await;

        let resp = pipeline
            .execute_order("RELIANCE-EQ", 2885, Side::Buy, 25, 0.0, "TEST", TradeKind::Entry)
            .await
            .unwrap();
        assert_eq!(resp.status, ExecStatus::Complete);
        assert_eq!(resp.filled_qty, 25);
        assert!(!resp.order_id.is_empty());
        assert_eq!(s.status().open_trades, 1);
    }

    #[tokio::test]
    async fn risk_denial_returns_none_without_ledger_row() {
        let s = Arc::new(RiskSentinel::new(RiskConfig {
            max_daily_loss: 1_000.0,
            max_concurrent_trades: 1,
        }));
        s.check_pre_trade("OTHER", 1, 100.0).unwrap(); // occupy the slot
        let pipeline = pipeline_with(Arc::new(PaperBroker::new()), s.clone(), 1800).await;

        let resp = pipeline
            .execute_order("RELIANCE-EQ", 2885, Side::Buy, 25, 0.0, "TEST", TradeKind::Entry)
            .await;
        assert!(resp.is_none());
        assert_eq!(s.status().open_trades, 1); // untouched
    }

    #[tokio::test]
    async fn exit_bypasses_slot_saturation() {
        let s = Arc::new(RiskSentinel::new(RiskConfig {
            max_daily_loss: 1_000.0,
            max_concurrent_trades: 3,
        }));
        for _ in 0..3 {
            s.check_pre_trade("X", 1, 100.0).unwrap();
        }
        let pipeline = pipeline_with(Arc::new(PaperBroker::new()), s.clone(), 1800).await;

        // Slots saturated, but an exit must still go through.
        let resp = pipeline
            .execute_order("RELIANCE-EQ", 2885, Side::Sell, 50, 0.0, "EXIT", TradeKind::Exit)
            .await;
        assert!(resp.is_some());
    }

    #[tokio::test]
    async fn kill_switch_blocks_exits_but_not_forced_square_off() {
        let s = sentinel();
        s.on_trade_close(-2_000.0); // trips the switch
        assert!(s.kill_switch_active());
        let pipeline = pipeline_with(Arc::new(PaperBroker::new()), s.clone(), 1800).await;

        let exit = pipeline
            .execute_order("RELIANCE-EQ", 2885, Side::Sell, 10, 0.0, "EXIT", TradeKind::Exit)
            .await;
        assert!(exit.is_none());

        let forced = pipeline
            .execute_order(
                "RELIANCE-EQ",
                2885,
                Side::Sell,
                10,
                0.0,
                "SQUARE_OFF",
                TradeKind::ForceExit,
            )
            .await;
        assert!(forced.is_some());
    }

    #[tokio::test]
    async fn rejection_rolls_back_the_reserved_slot() {
        let s = sentinel();
        let pipeline = pipeline_with(Arc::new(FlakyBroker::new(0)), s.clone(), 1800).await;

        let resp = pipeline
            .execute_order("RELIANCE-EQ", 2885, Side::Buy, 25, 0.0, "TEST", TradeKind::Entry)
            .await;
        assert!(resp.is_none());
        assert_eq!(s.status().open_trades, 0);
        assert_eq!(s.status().trades_today, 0);
    }

    #[tokio::test]
    async fn iceberg_slices_and_completes() {
        let s = sentinel();
        let pipeline = pipeline_with(Arc::new(FlakyBroker::new(10)), s.clone(), 100).await;

        let resp = pipeline
            .execute_order("RELIANCE-EQ", 2885, Side::Buy, 300, 0.0, "TEST", TradeKind::Entry)
            .await
            .unwrap();
        assert_eq!(resp.status, ExecStatus::Complete);
        assert_eq!(resp.filled_qty, 300);
        assert_eq!(resp.order_id.split(',').count(), 3);
    }

    #[tokio::test]
    async fn iceberg_partial_failure_stops_the_chain() {
        let s = sentinel();
        let broker = Arc::new(FlakyBroker::new(2));
        let pipeline = pipeline_with(broker.clone(), s.clone(), 100).await;

        let resp = pipeline
            .execute_order("RELIANCE-EQ", 2885, Side::Buy, 300, 0.0, "TEST", TradeKind::Entry)
            .await
            .unwrap();
        assert_eq!(resp.status, ExecStatus::Partial);
        assert_eq!(resp.filled_qty, 200);
        assert_eq!(resp.order_id, "LEG0,LEG1");

        // The chain stopped at leg 3: no fourth placement attempt.
        assert_eq!(broker.placed.load(Ordering::SeqCst), 3);
        // Exactly one rollback for the whole chain; the true open count is
        // re-derived by the next broker sync.
        assert_eq!(s.status().open_trades, 0);
        assert_eq!(s.status().trades_today, 0);
    }

    #[tokio::test]
    async fn iceberg_legs_share_a_parent_in_the_ledger() {
        let s = sentinel();
        let store = memory_store().await;
        let pipeline = ExecutionPipeline::new(
            Arc::new(FlakyBroker::new(2)),
            Arc::new(ThreadOffload::new(4)),
            store.clone(),
            s,
            cache_with_freeze(100),
        )
        .with_leg_delay(Duration::from_millis(1));

        pipeline
            .execute_order("RELIANCE-EQ", 2885, Side::Buy, 300, 0.0, "TEST", TradeKind::Entry)
            .await;

        // Ledger finalisation is fire-and-forget; give it a beat.
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Three rows share one parent: two COMPLETE, one REJECTED, and at
        // most zero non-terminal rows remain after the chain settles.
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT status FROM order_ledger WHERE parent_id IS NOT NULL ORDER BY created_at",
        )
        .fetch_all(store.pool())
        .await
        .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows.iter().filter(|s| s.as_str() == "COMPLETE").count(), 2);
        assert_eq!(rows.iter().filter(|s| s.as_str() == "REJECTED").count(), 1);
    }
}
