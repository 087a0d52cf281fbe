// =============================================================================
// Candle aggregator — per-token one-minute OHLCV builders
// =============================================================================
//
// A bar is created on the first tick of a minute, mutated only by ticks of
// that minute, and frozen when either a later-minute tick arrives or the
// heartbeat observes the wall clock crossing the minute boundary
// (time-forced close, which does NOT start a fresh bar — the next tick
// does).
//
// Volume policy: this feed reports cumulative day volume on every tick.
// Each builder keeps the last cumulative value and folds the non-negative
// delta into the bar; a negative delta (day rollover or feed restart)
// contributes zero and re-bases the counter.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset};
use tracing::debug;

use crate::clock;
use crate::types::{Bar, Tick};

/// OHLCV accumulator for a single token.
struct CandleBuilder {
    token: u32,
    current_minute: Option<DateTime<FixedOffset>>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
    last_cum_volume: Option<u64>,
    dirty: bool,
}

impl CandleBuilder {
    fn new(token: u32) -> Self {
        Self {
            token,
            current_minute: None,
            open: 0.0,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            volume: 0,
            last_cum_volume: None,
            dirty: false,
        }
    }

    /// Non-negative volume delta since the previous tick.
    fn volume_delta(&mut self, cum: u64) -> u64 {
        let delta = match self.last_cum_volume {
            Some(prev) if cum >= prev => cum - prev,
            // First tick of the session, or the counter went backwards
            // (rollover / reconnect): re-base without fabricating volume.
            _ => 0,
        };
        self.last_cum_volume = Some(cum);
        delta
    }

    fn freeze(&mut self) -> Bar {
        self.dirty = false;
        Bar {
            token: self.token,
            start_time: self.current_minute.expect("freeze requires an open bar"),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }

    fn reset(&mut self, minute: DateTime<FixedOffset>, ltp: f64, volume: u64) {
        self.current_minute = Some(minute);
        self.open = ltp;
        self.high = ltp;
        self.low = ltp;
        self.close = ltp;
        self.volume = volume;
        self.dirty = true;
    }

    fn update(&mut self, tick: &Tick) -> Option<Bar> {
        let minute = clock::floor_to_minute(tick.ltt);
        let delta = self.volume_delta(tick.cum_volume);

        let mut completed = None;
        match self.current_minute {
            Some(current) if minute > current => {
                if self.dirty {
                    completed = Some(self.freeze());
                }
                self.reset(minute, tick.ltp, delta);
                return completed;
            }
            Some(_) => {}
            None => {
                self.reset(minute, tick.ltp, delta);
                return None;
            }
        }

        self.high = self.high.max(tick.ltp);
        self.low = self.low.min(tick.ltp);
        self.close = tick.ltp;
        self.volume += delta;
        self.dirty = true;
        None
    }

    /// Close the bar if the wall clock has moved past its minute and no
    /// newer tick has arrived. The next bar starts on the next tick.
    fn force_close(&mut self, now: DateTime<FixedOffset>) -> Option<Bar> {
        let current = self.current_minute?;
        if !self.dirty || clock::floor_to_minute(now) <= current {
            return None;
        }
        let bar = self.freeze();
        self.current_minute = None;
        Some(bar)
    }
}

/// All per-token builders. Owned by the engine; the tick loop feeds ticks,
/// the heartbeat drives time-forced closes.
pub struct CandleAggregator {
    builders: HashMap<u32, CandleBuilder>,
}

impl CandleAggregator {
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Fold a tick into its token's builder; returns the completed bar if
    /// this tick rolled the minute over.
    pub fn update(&mut self, tick: &Tick) -> Option<Bar> {
        let builder = self
            .builders
            .entry(tick.token)
            .or_insert_with(|| CandleBuilder::new(tick.token));
        let bar = builder.update(tick);
        if let Some(ref b) = bar {
            debug!(token = b.token, start = %b.start_time, close = b.close, volume = b.volume, "bar closed");
        }
        bar
    }

    /// Heartbeat hook: force-close every stale bar.
    pub fn force_close(&mut self, now: DateTime<FixedOffset>) -> Vec<Bar> {
        self.builders
            .values_mut()
            .filter_map(|b| b.force_close(now))
            .collect()
    }
}

impl Default for CandleAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32, s: u32) -> DateTime<FixedOffset> {
        clock::exchange_tz()
            .with_ymd_and_hms(2025, 3, 4, h, m, s)
            .single()
            .unwrap()
    }

    fn tick(token: u32, ltp: f64, cum: u64, at: DateTime<FixedOffset>) -> Tick {
        Tick {
            token,
            ltp,
            cum_volume: cum,
            ltt: at,
        }
    }

    #[test]
    fn first_tick_opens_a_bar_without_emitting() {
        let mut agg = CandleAggregator::new();
        assert!(agg.update(&tick(1, 100.0, 500, ts(9, 15, 0))).is_none());
    }

    #[test]
    fn minute_rollover_emits_the_previous_bar() {
        let mut agg = CandleAggregator::new();
        agg.update(&tick(1, 100.0, 1000, ts(9, 15, 1)));
        agg.update(&tick(1, 101.5, 1100, ts(9, 15, 30)));
        agg.update(&tick(1, 99.0, 1150, ts(9, 15, 59)));

        let bar = agg.update(&tick(1, 99.5, 1200, ts(9, 16, 2))).unwrap();
        assert_eq!(bar.start_time, ts(9, 15, 0));
        assert!((bar.open - 100.0).abs() < f64::EPSILON);
        assert!((bar.high - 101.5).abs() < f64::EPSILON);
        assert!((bar.low - 99.0).abs() < f64::EPSILON);
        assert!((bar.close - 99.0).abs() < f64::EPSILON);
        // First tick contributes 0 (no baseline); then 100 + 50.
        assert_eq!(bar.volume, 150);
        assert!(bar.low <= bar.open && bar.open <= bar.high);
        assert!(bar.low <= bar.close && bar.close <= bar.high);
    }

    #[test]
    fn rollover_bar_carries_volume_delta_across_the_boundary() {
        let mut agg = CandleAggregator::new();
        agg.update(&tick(1, 100.0, 1000, ts(9, 15, 0)));
        let _ = agg.update(&tick(1, 100.5, 1200, ts(9, 16, 0)));
        // The 9:16 bar opened with the 200 delta of its first tick.
        let bar = agg.update(&tick(1, 100.5, 1250, ts(9, 17, 0))).unwrap();
        assert_eq!(bar.start_time, ts(9, 16, 0));
        assert_eq!(bar.volume, 200);
    }

    #[test]
    fn cumulative_counter_going_backwards_rebases() {
        let mut agg = CandleAggregator::new();
        agg.update(&tick(1, 100.0, 5000, ts(9, 15, 0)));
        agg.update(&tick(1, 100.0, 100, ts(9, 15, 10))); // feed restart
        agg.update(&tick(1, 100.0, 160, ts(9, 15, 20)));
        let bar = agg.update(&tick(1, 100.0, 200, ts(9, 16, 0))).unwrap();
        // 0 (first) + 0 (rebase) + 60.
        assert_eq!(bar.volume, 60);
    }

    #[test]
    fn time_forced_close_emits_single_tick_bar() {
        let mut agg = CandleAggregator::new();
        agg.update(&tick(1, 100.0, 10, ts(9, 15, 5)));

        // Heartbeat fires at 09:16:01 — the 09:15 bar must close as a
        // single-tick bar, and no fresh bar may start.
        let bars = agg.force_close(ts(9, 16, 1));
        assert_eq!(bars.len(), 1);
        let bar = &bars[0];
        assert_eq!(bar.start_time, ts(9, 15, 0));
        assert!((bar.open - 100.0).abs() < f64::EPSILON);
        assert!((bar.high - 100.0).abs() < f64::EPSILON);
        assert!((bar.low - 100.0).abs() < f64::EPSILON);
        assert!((bar.close - 100.0).abs() < f64::EPSILON);

        // A second heartbeat finds nothing to close.
        assert!(agg.force_close(ts(9, 16, 30)).is_empty());

        // The next tick opens a fresh bar without emitting.
        assert!(agg.update(&tick(1, 101.0, 20, ts(9, 16, 40))).is_none());
    }

    #[test]
    fn force_close_within_the_same_minute_is_a_noop() {
        let mut agg = CandleAggregator::new();
        agg.update(&tick(1, 100.0, 10, ts(9, 15, 5)));
        assert!(agg.force_close(ts(9, 15, 59)).is_empty());
    }

    #[test]
    fn tokens_aggregate_independently() {
        let mut agg = CandleAggregator::new();
        agg.update(&tick(1, 100.0, 10, ts(9, 15, 0)));
        agg.update(&tick(2, 50.0, 10, ts(9, 15, 1)));

        let bar = agg.update(&tick(1, 101.0, 20, ts(9, 16, 0))).unwrap();
        assert_eq!(bar.token, 1);
        // Token 2's bar is still open.
        let bars = agg.force_close(ts(9, 16, 1));
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].token, 2);
    }

    #[test]
    fn bar_bounds_contain_every_contributing_tick() {
        let mut agg = CandleAggregator::new();
        let prices = [100.0, 103.2, 97.5, 101.1, 99.9, 102.0];
        for (i, p) in prices.iter().enumerate() {
            agg.update(&tick(1, *p, 100 * i as u64, ts(9, 15, i as u32 * 5)));
        }
        let bar = agg.update(&tick(1, 100.0, 1000, ts(9, 16, 0))).unwrap();
        let min = prices.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert!(bar.low <= min && max <= bar.high);
    }
}
