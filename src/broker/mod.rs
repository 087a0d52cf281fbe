// =============================================================================
// Broker adapter — uniform synchronous capability set, live + paper
// =============================================================================
//
// Every method models a blocking vendor-SDK call and therefore MUST be
// invoked through ThreadOffload (usually behind a circuit breaker). The
// market socket is the one exception: `start_feed` hands callbacks to the
// SDK's background thread, and those callbacks bridge into the async core
// at exactly one place (data/feed.rs).
//
// Wire conventions are the vendor's: side "B"/"S", type "MKT"/"L", product
// "MIS", validity "DAY", numeric fields stringified, success indicated by
// `stat == "Ok"` or the presence of `nOrdNo`.
// =============================================================================

pub mod live;
pub mod paper;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::instruments::Instrument;
use crate::error::Result;
use crate::types::{EngineMode, OrderType, Side};

/// Parameters for a single broker order, one leg of an iceberg included.
#[derive(Debug, Clone, Serialize)]
pub struct OrderParams {
    pub exchange_segment: String,
    pub trading_symbol: String,
    pub instrument_token: u32,
    pub side: Side,
    pub quantity: u64,
    /// 0.0 means market.
    pub price: f64,
    pub order_type: OrderType,
    pub product: String,
    pub validity: String,
}

impl OrderParams {
    pub fn intraday(
        trading_symbol: &str,
        token: u32,
        side: Side,
        quantity: u64,
        price: f64,
    ) -> Self {
        Self {
            exchange_segment: "nse_cm".to_string(),
            trading_symbol: trading_symbol.to_string(),
            instrument_token: token,
            side,
            quantity,
            price,
            order_type: if price > 0.0 {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            product: "MIS".to_string(),
            validity: "DAY".to_string(),
        }
    }
}

/// The broker's reply to a write call, with the raw payload retained for
/// the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerReply {
    pub stat: String,
    /// `nOrdNo` when present.
    pub order_id: Option<String>,
    pub err_msg: Option<String>,
    pub raw: Value,
}

impl BrokerReply {
    /// Acceptance per the vendor convention.
    pub fn accepted(&self) -> bool {
        self.stat == "Ok" || self.order_id.is_some()
    }

    pub fn ok(order_id: String, raw: Value) -> Self {
        Self {
            stat: "Ok".to_string(),
            order_id: Some(order_id),
            err_msg: None,
            raw,
        }
    }

    pub fn not_ok(err_msg: &str) -> Self {
        Self {
            stat: "Not_Ok".to_string(),
            order_id: None,
            err_msg: Some(err_msg.to_string()),
            raw: serde_json::json!({ "stat": "Not_Ok", "errMsg": err_msg }),
        }
    }
}

/// One row of the broker's position book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRow {
    pub token: u32,
    pub trading_symbol: String,
    pub net_qty: i64,
    pub avg_price: f64,
    pub realized_pnl: f64,
    pub buy_amount: f64,
    pub sell_amount: f64,
}

/// Callbacks the broker invokes from its socket thread. They must not touch
/// scheduler-owned structures; MarketFeed builds them so that each one only
/// schedules work on a captured runtime handle.
pub struct FeedCallbacks {
    pub on_open: Box<dyn Fn() + Send + Sync>,
    pub on_message: Box<dyn Fn(Value) + Send + Sync>,
    pub on_error: Box<dyn Fn(String) + Send + Sync>,
    pub on_close: Box<dyn Fn(String) + Send + Sync>,
}

/// Uniform broker capability set. Implementations: `live::LiveBroker`
/// (vendor SDK) and `paper::PaperBroker` (in-memory simulator). Selected
/// once at boot by the `PAPER_TRADING` flag.
pub trait BrokerAdapter: Send + Sync {
    fn mode(&self) -> EngineMode;

    /// Establish (or refresh) the broker session. Blocking.
    fn login(&self) -> Result<()>;
    fn is_logged_in(&self) -> bool;

    /// Place one order. Blocking; returns the vendor-shaped reply.
    fn place_order(&self, params: OrderParams) -> Result<BrokerReply>;
    fn cancel_order(&self, order_id: String) -> Result<BrokerReply>;
    fn modify_order(&self, order_id: String, price: f64, quantity: u64) -> Result<BrokerReply>;

    /// Open position book. Blocking.
    fn get_positions(&self) -> Result<Vec<PositionRow>>;
    /// Available margin/cash. Blocking.
    fn get_limits(&self) -> Result<f64>;

    /// Issue (or re-issue) the socket subscription for `tokens`. Blocking.
    fn subscribe(&self, tokens: Vec<u32>) -> Result<()>;

    /// Download the instrument master. Blocking.
    fn fetch_instruments(&self) -> Result<Vec<Instrument>>;

    /// Attach the socket callbacks and start the SDK's background thread.
    fn start_feed(&self, callbacks: FeedCallbacks) -> Result<()>;
    fn stop_feed(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptance_follows_the_vendor_convention() {
        let ok = BrokerReply::ok("240101000001".into(), serde_json::json!({"stat": "Ok"}));
        assert!(ok.accepted());

        // Some gateways omit `stat` but return an exchange id.
        let id_only = BrokerReply {
            stat: String::new(),
            order_id: Some("77".into()),
            err_msg: None,
            raw: Value::Null,
        };
        assert!(id_only.accepted());

        let rejected = BrokerReply::not_ok("RMS: margin shortfall");
        assert!(!rejected.accepted());
        assert_eq!(rejected.err_msg.as_deref(), Some("RMS: margin shortfall"));
    }

    #[test]
    fn market_vs_limit_derived_from_price() {
        let mkt = OrderParams::intraday("RELIANCE-EQ", 101, Side::Buy, 10, 0.0);
        assert_eq!(mkt.order_type, OrderType::Market);
        let lim = OrderParams::intraday("RELIANCE-EQ", 101, Side::Sell, 10, 1499.5);
        assert_eq!(lim.order_type, OrderType::Limit);
        assert_eq!(lim.product, "MIS");
        assert_eq!(lim.validity, "DAY");
    }
}
