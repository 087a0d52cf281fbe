// =============================================================================
// Indicator helpers — EMA, RSI (Wilder), session VWAP
// =============================================================================
//
// All helpers operate on the runtime's bar ring (oldest first) and return
// `None` until enough data exists. They are plain functions so decision
// code stays testable without any runtime scaffolding.
// =============================================================================

use crate::types::Bar;

/// Exponential moving average of closes over `period`, seeded with the SMA
/// of the first `period` values.
pub fn ema(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period {
        return None;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed: f64 = bars[..period].iter().map(|b| b.close).sum::<f64>() / period as f64;
    Some(
        bars[period..]
            .iter()
            .fold(seed, |acc, bar| bar.close * k + acc * (1.0 - k)),
    )
}

/// Relative strength index over `period` closes with Wilder smoothing.
pub fn rsi(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let mut gain = 0.0;
    let mut loss = 0.0;
    for w in closes.windows(2).take(period) {
        let change = w[1] - w[0];
        if change >= 0.0 {
            gain += change;
        } else {
            loss -= change;
        }
    }
    let mut avg_gain = gain / period as f64;
    let mut avg_loss = loss / period as f64;

    for w in closes.windows(2).skip(period) {
        let change = w[1] - w[0];
        let (g, l) = if change >= 0.0 {
            (change, 0.0)
        } else {
            (0.0, -change)
        };
        avg_gain = (avg_gain * (period as f64 - 1.0) + g) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + l) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Volume-weighted average price of the session's bars (typical price
/// weighting). Falls back to the close average when no volume was traded.
pub fn vwap(bars: &[Bar]) -> Option<f64> {
    if bars.is_empty() {
        return None;
    }
    let mut pv = 0.0;
    let mut vol = 0.0;
    for bar in bars {
        let typical = (bar.high + bar.low + bar.close) / 3.0;
        pv += typical * bar.volume as f64;
        vol += bar.volume as f64;
    }
    if vol > 0.0 {
        Some(pv / vol)
    } else {
        Some(bars.iter().map(|b| b.close).sum::<f64>() / bars.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use chrono::TimeZone;

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Bar {
                token: 1,
                start_time: clock::exchange_tz()
                    .with_ymd_and_hms(2025, 3, 4, 9, 15 + (i as u32 % 45), 0)
                    .single()
                    .unwrap(),
                open: *c,
                high: *c + 0.5,
                low: *c - 0.5,
                close: *c,
                volume: 100,
            })
            .collect()
    }

    #[test]
    fn ema_needs_warmup_then_tracks_closes() {
        let bars = bars_from_closes(&[10.0, 11.0, 12.0]);
        assert!(ema(&bars, 4).is_none());

        let flat = bars_from_closes(&[50.0; 20]);
        let value = ema(&flat, 10).unwrap();
        assert!((value - 50.0).abs() < 1e-9);

        // Rising closes: EMA lags below the last close.
        let rising = bars_from_closes(&(1..=30).map(|i| i as f64).collect::<Vec<_>>());
        let value = ema(&rising, 10).unwrap();
        assert!(value < 30.0);
        assert!(value > 20.0);
    }

    #[test]
    fn rsi_extremes_and_midpoint() {
        let up = bars_from_closes(&(1..=20).map(|i| 100.0 + i as f64).collect::<Vec<_>>());
        assert!((rsi(&up, 14).unwrap() - 100.0).abs() < 1e-9);

        let down = bars_from_closes(&(1..=20).map(|i| 100.0 - i as f64).collect::<Vec<_>>());
        assert!(rsi(&down, 14).unwrap() < 1.0);

        // Alternating equal up/down moves hover near 50.
        let closes: Vec<f64> = (0..30)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        let mid = rsi(&bars_from_closes(&closes), 14).unwrap();
        assert!(mid > 35.0 && mid < 65.0);

        assert!(rsi(&bars_from_closes(&[1.0, 2.0]), 14).is_none());
    }

    #[test]
    fn vwap_weights_by_volume() {
        let mut bars = bars_from_closes(&[100.0, 200.0]);
        bars[0].volume = 300;
        bars[1].volume = 100;
        let value = vwap(&bars).unwrap();
        // Heavier volume at 100 pulls the VWAP below the midpoint.
        assert!(value < 150.0);

        bars[0].volume = 0;
        bars[1].volume = 0;
        let fallback = vwap(&bars).unwrap();
        assert!((fallback - 150.0).abs() < 1e-9);

        assert!(vwap(&[]).is_none());
    }
}
