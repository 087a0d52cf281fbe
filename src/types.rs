// =============================================================================
// Shared types used across the Meridian intraday engine
// =============================================================================

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Order side. Serialised to the broker wire as `"B"` / `"S"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The wire symbol the broker expects in `transaction_type`.
    pub fn wire(&self) -> &'static str {
        match self {
            Self::Buy => "B",
            Self::Sell => "S",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1 for Buy, -1 for Sell. Used for signed position arithmetic.
    pub fn sign(&self) -> i64 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type. Wire symbols: `"MKT"` / `"L"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn wire(&self) -> &'static str {
        match self {
            Self::Market => "MKT",
            Self::Limit => "L",
        }
    }
}

/// Whether the engine trades against the simulator or real funds.
/// Selected once at boot by the `PAPER_TRADING` flag; never per-order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineMode {
    Paper,
    Live,
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "PAPER"),
            Self::Live => write!(f, "LIVE"),
        }
    }
}

/// A single market tick as delivered by the feed. Transient; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    /// Instrument token the tick belongs to.
    pub token: u32,
    /// Last traded price.
    pub ltp: f64,
    /// Cumulative day volume as reported by the broker.
    pub cum_volume: u64,
    /// Last trade time (exchange timezone).
    pub ltt: DateTime<FixedOffset>,
}

/// A completed one-minute OHLCV bar.
///
/// Invariants: `low <= open, close <= high`; `start_time` is minute-aligned
/// and equals the minute containing every contributing tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub token: u32,
    pub start_time: DateTime<FixedOffset>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Ledger status of an internal order. Terminal statuses are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    PendingBroker,
    Placed,
    Complete,
    Rejected,
    Cancelled,
    Failed,
}

impl OrderStatus {
    /// Terminal statuses are reached at most once and never left.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Rejected | Self::Cancelled | Self::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingBroker => "PENDING_BROKER",
            Self::Placed => "PLACED",
            Self::Complete => "COMPLETE",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING_BROKER" => Some(Self::PendingBroker),
            "PLACED" => Some(Self::Placed),
            "COMPLETE" => Some(Self::Complete),
            "REJECTED" => Some(Self::Rejected),
            "CANCELLED" => Some(Self::Cancelled),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An order update pushed by the broker on the order queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    /// Broker-assigned order id.
    pub exchange_id: String,
    pub token: u32,
    pub status: OrderStatus,
    #[serde(default)]
    pub filled_qty: u64,
    #[serde(default)]
    pub avg_price: f64,
    #[serde(default)]
    pub reason: Option<String>,
}
