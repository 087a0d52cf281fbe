// =============================================================================
// Error taxonomy — every boundary returns a tagged variant
// =============================================================================
//
// Recoverable kinds (TransientBroker, RateLimited handled internally,
// FeedStarved, StrategyDisabled) are absorbed locally. Irrecoverable kinds
// (Auth, Store on boot) prevent the Run phase. KillSwitch is the only
// latching condition the engine cannot self-clear.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown strategy, unknown symbol, bad parameters. Surfaced from /start.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Broker login / TOTP / PIN failure. Fatal for the engine.
    #[error("broker auth failure: {0}")]
    Auth(String),

    /// 5xx, timeout, socket close. Counted by the breaker, retried.
    #[error("transient broker error: {0}")]
    TransientBroker(String),

    /// Breaker is OPEN or a half-open probe is already in flight.
    #[error("circuit '{name}' open: {detail}")]
    CircuitOpen { name: &'static str, detail: String },

    /// Broker returned Not_Ok for an order.
    #[error("order rejected: {0}")]
    OrderRejected(String),

    /// Pre-trade gate refused the entry.
    #[error("risk denied: {0}")]
    RiskDenied(&'static str),

    /// Daily loss limit breached; latches until day reset.
    #[error("kill switch active")]
    KillSwitch,

    /// Watchdog crossed the silence threshold.
    #[error("feed starved: no packets for {silent_secs}s")]
    FeedStarved { silent_secs: u64 },

    /// The offload pool (or the engine) is shutting down.
    #[error("shutting down")]
    Shutdown,

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl EngineError {
    /// Kinds the breaker should count as failures. CircuitOpen and
    /// RiskDenied are control-flow outcomes, not service failures.
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(
            self,
            Self::TransientBroker(_) | Self::Auth(_) | Self::OrderRejected(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
