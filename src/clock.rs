// =============================================================================
// Exchange clock — wall time in the exchange timezone, minute alignment,
// trading-day predicate and the square-off cutoff
// =============================================================================
//
// The exchange runs on IST (+05:30) with no daylight saving, so a fixed
// offset is exact and no tz database is needed.
// =============================================================================

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, TimeZone, Timelike, Utc, Weekday};

/// IST offset in seconds east of UTC (+05:30).
const IST_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

/// The exchange timezone as a chrono offset.
pub fn exchange_tz() -> FixedOffset {
    FixedOffset::east_opt(IST_OFFSET_SECS).expect("static offset is valid")
}

/// Current wall time in the exchange timezone.
pub fn now_exchange() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&exchange_tz())
}

/// Floor a timestamp to the start of its minute.
pub fn floor_to_minute(ts: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .expect("clearing sub-minute fields cannot overflow")
}

/// Whether the exchange is open on this date. Weekends are closed; exchange
/// holidays are handled operationally (the engine is simply not started).
pub fn is_trading_day(ts: DateTime<FixedOffset>) -> bool {
    !matches!(ts.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Parse an `HH:MM` square-off cutoff (exchange timezone).
pub fn parse_cutoff(s: &str) -> Option<NaiveTime> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    NaiveTime::from_hms_opt(h, m, 0)
}

/// True once the exchange-timezone wall clock has reached `cutoff` today.
pub fn past_cutoff(now: DateTime<FixedOffset>, cutoff: NaiveTime) -> bool {
    now.time() >= cutoff
}

/// Interpret a broker epoch-seconds trade time in the exchange timezone.
pub fn from_epoch_secs(secs: i64) -> DateTime<FixedOffset> {
    exchange_tz()
        .timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(|| now_exchange())
}
