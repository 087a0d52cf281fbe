// =============================================================================
// Boot settings — read once from the environment
// =============================================================================
//
// Every tunable the process needs before the database is reachable lives
// here. Persisted engine configuration (capital, symbols, risk limits) is a
// separate concern and lives in the `system_config` table.
// =============================================================================

use anyhow::{Context, Result};
use chrono::NaiveTime;

use crate::clock;

/// Process-wide settings, sourced from the environment at boot.
#[derive(Debug, Clone)]
pub struct Settings {
    // ── Broker session ──────────────────────────────────────────────────
    pub broker_consumer_key: String,
    pub broker_environment: String,
    pub broker_ucc: String,
    pub broker_mobile: String,
    pub broker_pin: String,
    pub broker_totp_seed: String,
    pub broker_api_base: String,
    pub broker_ws_url: String,

    // ── Mode & persistence ──────────────────────────────────────────────
    /// True = in-memory simulator, false = real funds. Read once at boot.
    pub paper_trading: bool,
    pub database_url: String,

    // ── Control surface ─────────────────────────────────────────────────
    pub bind_addr: String,
    pub webhook_passphrase: String,

    // ── Session timing ──────────────────────────────────────────────────
    /// Positions are flattened at this exchange-timezone wall time.
    pub square_off_time: NaiveTime,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Settings {
    /// Load settings from the environment. Broker credentials may be empty
    /// in paper mode; live mode validates them at login.
    pub fn from_env() -> Result<Self> {
        let paper_trading = env_or("PAPER_TRADING", "true")
            .parse::<bool>()
            .context("PAPER_TRADING must be 'true' or 'false'")?;

        let cutoff_raw = env_or("SQUARE_OFF_TIME", "15:10");
        let square_off_time = clock::parse_cutoff(&cutoff_raw)
            .with_context(|| format!("SQUARE_OFF_TIME '{cutoff_raw}' is not HH:MM"))?;

        Ok(Self {
            broker_consumer_key: env_or("BROKER_CONSUMER_KEY", ""),
            broker_environment: env_or("BROKER_ENVIRONMENT", "prod"),
            broker_ucc: env_or("BROKER_UCC", ""),
            broker_mobile: env_or("BROKER_MOBILE", ""),
            broker_pin: env_or("BROKER_PIN", ""),
            broker_totp_seed: env_or("BROKER_TOTP_SEED", ""),
            broker_api_base: env_or("BROKER_API_BASE", "https://gw-napi.neobroker.in/api/v2"),
            broker_ws_url: env_or("BROKER_WS_URL", "wss://stream.neobroker.in/feed"),
            paper_trading,
            database_url: env_or("DATABASE_URL", "sqlite://data/meridian.db"),
            bind_addr: env_or("MERIDIAN_BIND_ADDR", "0.0.0.0:8000"),
            webhook_passphrase: env_or("WEBHOOK_PASSPHRASE", ""),
            square_off_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test to avoid
    // interleaving with parallel test threads.
    #[test]
    fn defaults_and_overrides() {
        std::env::remove_var("PAPER_TRADING");
        std::env::remove_var("SQUARE_OFF_TIME");
        let s = Settings::from_env().unwrap();
        assert!(s.paper_trading);
        assert_eq!(s.square_off_time, NaiveTime::from_hms_opt(15, 10, 0).unwrap());
        assert_eq!(s.bind_addr, "0.0.0.0:8000");

        std::env::set_var("SQUARE_OFF_TIME", "15:25");
        let s = Settings::from_env().unwrap();
        assert_eq!(s.square_off_time, NaiveTime::from_hms_opt(15, 25, 0).unwrap());

        std::env::set_var("SQUARE_OFF_TIME", "nonsense");
        assert!(Settings::from_env().is_err());
        std::env::remove_var("SQUARE_OFF_TIME");
    }
}
