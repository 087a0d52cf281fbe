// =============================================================================
// Paper broker — in-memory simulator with clock-driven matching
// =============================================================================
//
// Mimics the vendor API shape exactly (same reply JSON, same position book)
// so the execution pipeline cannot tell the difference. Matching is driven
// by closed one-minute bars:
//
//   MKT        fills at the next bar's open.
//   LIMIT BUY  fills when bar.low <= limit, at min(limit, bar.open).
//   LIMIT SELL fills when bar.high >= limit, at max(limit, bar.open).
//
// Positions track average entry and realized PnL; the fill ledger is
// trimmed to the most recent 1000 rows.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::broker::{BrokerAdapter, BrokerReply, FeedCallbacks, OrderParams, PositionRow};
use crate::data::instruments::Instrument;
use crate::error::Result;
use crate::types::{Bar, EngineMode, OrderStatus, OrderType, OrderUpdate, Side};

/// Maximum retained fill rows.
const LEDGER_MAX: usize = 1000;
/// Virtual starting balance.
const INITIAL_BALANCE: f64 = 1_000_000.0;

#[derive(Debug, Clone)]
struct SimOrder {
    id: String,
    token: u32,
    side: Side,
    order_type: OrderType,
    price: f64,
    qty: u64,
    open: bool,
}

#[derive(Debug, Clone, Default)]
struct SimPosition {
    qty: i64,
    avg_entry: f64,
    realized_pnl: f64,
    buy_amount: f64,
    sell_amount: f64,
    last_price: f64,
}

impl SimPosition {
    /// Apply a signed fill, returning the realized PnL of any closed part.
    fn apply_fill(&mut self, signed_qty: i64, price: f64) -> f64 {
        let mut realized = 0.0;
        let prev = self.qty;
        let next = prev + signed_qty;

        if prev != 0 && prev.signum() != signed_qty.signum() {
            let closing = prev.abs().min(signed_qty.abs());
            realized = prev.signum() as f64 * closing as f64 * (price - self.avg_entry);
            self.realized_pnl += realized;
        }

        if next == 0 {
            self.avg_entry = 0.0;
        } else if prev == 0 || prev.signum() != next.signum() {
            // Opening flat, or flipping through zero: fresh entry price.
            self.avg_entry = price;
        } else if prev.signum() == signed_qty.signum() {
            // Scaling in: volume-weighted entry.
            let total = prev.abs() + signed_qty.abs();
            self.avg_entry = (prev.abs() as f64 * self.avg_entry
                + signed_qty.abs() as f64 * price)
                / total as f64;
        }
        // Partial close keeps the entry price.

        self.qty = next;
        self.last_price = price;
        realized
    }
}

/// A completed simulated fill, for the trimmed ledger.
#[derive(Debug, Clone, Serialize)]
pub struct SimFill {
    pub order_id: String,
    pub token: u32,
    pub side: Side,
    pub qty: u64,
    pub price: f64,
    pub realized_pnl: f64,
}

pub struct PaperBroker {
    orders: Mutex<HashMap<String, SimOrder>>,
    positions: Mutex<HashMap<u32, SimPosition>>,
    fills: Mutex<Vec<SimFill>>,
    balance: Mutex<f64>,
    seq: AtomicU64,
    callbacks: Mutex<Option<FeedCallbacks>>,
    instruments: Vec<Instrument>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
            fills: Mutex::new(Vec::new()),
            balance: Mutex::new(INITIAL_BALANCE),
            seq: AtomicU64::new(1),
            callbacks: Mutex::new(None),
            instruments: default_master(),
        }
    }

    /// Seed a position directly. Test/boot helper for reconciliation paths.
    pub fn seed_position(&self, token: u32, qty: i64, avg_entry: f64, realized_pnl: f64) {
        let mut positions = self.positions.lock();
        let pos = positions.entry(token).or_default();
        pos.qty = qty;
        pos.avg_entry = avg_entry;
        pos.realized_pnl = realized_pnl;
        pos.last_price = avg_entry;
    }

    /// Feed a raw socket-shaped payload through the registered callbacks,
    /// exactly as the vendor SDK thread would.
    pub fn inject_message(&self, payload: serde_json::Value) {
        if let Some(cbs) = self.callbacks.lock().as_ref() {
            (cbs.on_message)(payload);
        }
    }

    /// Simulate one closed bar: attempt to fill every open order on that
    /// token. Returns the fills as order updates for the order queue.
    pub fn process_bar(&self, bar: &Bar) -> Vec<OrderUpdate> {
        let mut updates = Vec::new();
        let mut orders = self.orders.lock();

        for order in orders.values_mut().filter(|o| o.open && o.token == bar.token) {
            let fill_price = match (order.order_type, order.side) {
                (OrderType::Market, _) => Some(bar.open),
                (OrderType::Limit, Side::Buy) if bar.low <= order.price => {
                    Some(order.price.min(bar.open))
                }
                (OrderType::Limit, Side::Sell) if bar.high >= order.price => {
                    Some(order.price.max(bar.open))
                }
                _ => None,
            };

            let Some(price) = fill_price else { continue };
            order.open = false;

            let signed = order.qty as i64 * order.side.sign();
            let realized = {
                let mut positions = self.positions.lock();
                let pos = positions.entry(order.token).or_default();
                let realized = pos.apply_fill(signed, price);
                match order.side {
                    Side::Buy => pos.buy_amount += order.qty as f64 * price,
                    Side::Sell => pos.sell_amount += order.qty as f64 * price,
                }
                realized
            };

            *self.balance.lock() += match order.side {
                Side::Buy => -(order.qty as f64 * price),
                Side::Sell => order.qty as f64 * price,
            };

            {
                let mut fills = self.fills.lock();
                fills.push(SimFill {
                    order_id: order.id.clone(),
                    token: order.token,
                    side: order.side,
                    qty: order.qty,
                    price,
                    realized_pnl: realized,
                });
                if fills.len() > LEDGER_MAX {
                    let excess = fills.len() - LEDGER_MAX;
                    fills.drain(..excess);
                }
            }

            info!(
                order_id = %order.id,
                side = %order.side,
                qty = order.qty,
                price,
                realized,
                "virtual fill"
            );

            updates.push(OrderUpdate {
                exchange_id: order.id.clone(),
                token: order.token,
                status: OrderStatus::Complete,
                filled_qty: order.qty,
                avg_price: price,
                reason: None,
            });
        }

        orders.retain(|_, o| o.open);
        updates
    }

    pub fn realized_pnl(&self) -> f64 {
        self.positions.lock().values().map(|p| p.realized_pnl).sum()
    }

    pub fn fills(&self) -> Vec<SimFill> {
        self.fills.lock().clone()
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerAdapter for PaperBroker {
    fn mode(&self) -> EngineMode {
        EngineMode::Paper
    }

    fn login(&self) -> Result<()> {
        Ok(())
    }

    fn is_logged_in(&self) -> bool {
        true
    }

    fn place_order(&self, params: OrderParams) -> Result<BrokerReply> {
        if params.quantity == 0 {
            return Ok(BrokerReply::not_ok("Invalid order parameters"));
        }

        let id = format!("P{:012}", self.seq.fetch_add(1, Ordering::Relaxed));
        let order = SimOrder {
            id: id.clone(),
            token: params.instrument_token,
            side: params.side,
            order_type: params.order_type,
            price: params.price,
            qty: params.quantity,
            open: true,
        };
        debug!(
            order_id = %id,
            side = %params.side,
            qty = params.quantity,
            price = params.price,
            "paper order accepted"
        );
        self.orders.lock().insert(id.clone(), order);

        Ok(BrokerReply::ok(
            id.clone(),
            serde_json::json!({ "stat": "Ok", "nOrdNo": id, "stCode": 200 }),
        ))
    }

    fn cancel_order(&self, order_id: String) -> Result<BrokerReply> {
        let mut orders = self.orders.lock();
        let cancellable = matches!(orders.get(&order_id), Some(order) if order.open);
        if !cancellable {
            return Ok(BrokerReply::not_ok("Order not found or not open"));
        }
        orders.remove(&order_id);
        Ok(BrokerReply::ok(
            order_id,
            serde_json::json!({ "stat": "Ok", "result": "Order Cancelled" }),
        ))
    }

    fn modify_order(&self, order_id: String, price: f64, quantity: u64) -> Result<BrokerReply> {
        let mut orders = self.orders.lock();
        match orders.get_mut(&order_id) {
            Some(order) if order.open => {
                order.price = price;
                order.qty = quantity;
                order.order_type = if price > 0.0 {
                    OrderType::Limit
                } else {
                    OrderType::Market
                };
                Ok(BrokerReply::ok(
                    order_id,
                    serde_json::json!({ "stat": "Ok", "result": "Order Modified" }),
                ))
            }
            _ => Ok(BrokerReply::not_ok("Order not open")),
        }
    }

    fn get_positions(&self) -> Result<Vec<PositionRow>> {
        let positions = self.positions.lock();
        let rows = positions
            .iter()
            .filter(|(_, p)| p.qty != 0 || p.realized_pnl != 0.0)
            .map(|(token, p)| PositionRow {
                token: *token,
                trading_symbol: self
                    .instruments
                    .iter()
                    .find(|i| i.token == *token)
                    .map(|i| i.trading_symbol.clone())
                    .unwrap_or_default(),
                net_qty: p.qty,
                avg_price: p.avg_entry,
                realized_pnl: p.realized_pnl,
                buy_amount: p.buy_amount,
                sell_amount: p.sell_amount,
            })
            .collect();
        Ok(rows)
    }

    fn get_limits(&self) -> Result<f64> {
        Ok(*self.balance.lock())
    }

    fn subscribe(&self, _tokens: Vec<u32>) -> Result<()> {
        Ok(())
    }

    fn fetch_instruments(&self) -> Result<Vec<Instrument>> {
        Ok(self.instruments.clone())
    }

    fn start_feed(&self, callbacks: FeedCallbacks) -> Result<()> {
        *self.callbacks.lock() = Some(callbacks);
        Ok(())
    }

    fn stop_feed(&self) {
        *self.callbacks.lock() = None;
    }
}

/// A small cash-segment master so paper mode works with no broker session.
fn default_master() -> Vec<Instrument> {
    let mk = |token: u32, trading_symbol: &str, freeze_qty: u64| Instrument {
        token,
        trading_symbol: trading_symbol.to_string(),
        symbol: trading_symbol.trim_end_matches("-EQ").to_string(),
        lot_size: 1,
        tick_size: 0.05,
        freeze_qty,
        segment: "nse_cm".to_string(),
        price_precision: 2,
    };
    vec![
        mk(2885, "RELIANCE-EQ", 1800),
        mk(11536, "TCS-EQ", 1800),
        mk(1594, "INFY-EQ", 1800),
        mk(1333, "HDFCBANK-EQ", 1800),
        mk(3045, "SBIN-EQ", 1800),
    ]
}
