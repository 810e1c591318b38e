// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// ATR measures market volatility by decomposing the entire range of a bar.
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is then the smoothed average of TR using Wilder's method:
//   ATR_0   = SMA of first `period` TR values
//   ATR_t   = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// Default period: 14
// =============================================================================

use crate::market_data::ohlc::OhlcBar;

/// Compute the most recent ATR value from a slice of OHLC bars using
/// Wilder's smoothing method.
///
/// # Arguments
/// - `bars`   — slice of bars (oldest first).
/// - `period` — look-back window for the ATR calculation.
///
/// # Returns
/// `None` when:
/// - `period` is zero.
/// - There are fewer than `period + 1` bars (we need `period` TR values,
///   each requiring a previous bar for the True Range calculation).
/// - Any intermediate value is non-finite.
pub fn calculate_atr(bars: &[OhlcBar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    // --- Step 1: Compute True Range for each consecutive pair ----------------
    let mut tr_values: Vec<f64> = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let high = bars[i].h;
        let low = bars[i].l;
        let prev_close = bars[i - 1].c;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();

        tr_values.push(hl.max(hc).max(lc));
    }

    if tr_values.len() < period {
        return None;
    }

    // --- Step 2: Seed ATR with SMA of first `period` TR values ---------------
    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    // --- Step 3: Wilder's smoothing for remaining TR values ------------------
    let period_f = period as f64;
    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    if atr.is_finite() {
        Some(atr)
    } else {
        None
    }
}

/// Convenience function: compute ATR with the standard 14-period default.
pub fn calculate(bars: &[OhlcBar]) -> Option<f64> {
    calculate_atr(bars, 14)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Build a test bar with the given OHLC values.
    fn bar(o: f64, h: f64, l: f64, c: f64) -> OhlcBar {
        OhlcBar {
            open_ts: 0,
            o,
            h,
            l,
            c,
            volume_ticks: 50,
        }
    }

    #[test]
    fn atr_period_zero() {
        let bars = vec![bar(100.0, 105.0, 95.0, 102.0); 20];
        assert!(calculate_atr(&bars, 0).is_none());
    }

    #[test]
    fn atr_insufficient_data() {
        // Need period + 1 = 15 bars for period=14, only have 10.
        let bars = vec![bar(100.0, 105.0, 95.0, 102.0); 10];
        assert!(calculate_atr(&bars, 14).is_none());
    }

    #[test]
    fn atr_exact_minimum_data() {
        // period=3, need 4 bars to get 3 TR values.
        let bars = vec![
            bar(100.0, 102.0, 98.0, 101.0),
            bar(101.0, 104.0, 99.0, 103.0),
            bar(103.0, 106.0, 100.0, 105.0),
            bar(105.0, 108.0, 102.0, 107.0),
        ];
        let atr = calculate_atr(&bars, 3);
        assert!(atr.is_some());
        let val = atr.unwrap();
        assert!(val > 0.0);
        assert!(val.is_finite());
    }

    #[test]
    fn atr_constant_range() {
        // All bars have the same range (H-L=10), close at midpoint.
        // TR should be constant and ATR should converge to 10.
        let mut bars = Vec::new();
        for i in 0..30 {
            let base = 100.0 + i as f64 * 0.1; // slight drift
            bars.push(bar(base, base + 5.0, base - 5.0, base));
        }
        let atr = calculate_atr(&bars, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10.0, got {atr}");
    }

    #[test]
    fn atr_true_range_uses_prev_close() {
        // Gap scenario: |H - prevClose| > H - L
        let bars = vec![
            bar(100.0, 105.0, 95.0, 95.0),   // close at low
            bar(110.0, 115.0, 108.0, 112.0), // gap up: |115-95|=20 > 115-108=7
            bar(112.0, 118.0, 110.0, 115.0),
            bar(115.0, 120.0, 113.0, 118.0),
        ];
        let atr = calculate_atr(&bars, 3).unwrap();
        // First TR = 20 (|115-95|), so ATR should reflect this gap.
        assert!(atr > 7.0, "ATR should reflect the gap, got {atr}");
    }

    #[test]
    fn atr_nan_returns_none() {
        let bars = vec![
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, f64::NAN, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
        ];
        assert!(calculate_atr(&bars, 3).is_none());
    }

    #[test]
    fn atr_convenience_function() {
        let bars: Vec<OhlcBar> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(base, base + 3.0, base - 3.0, base + 1.0)
            })
            .collect();
        assert_eq!(calculate_atr(&bars, 14), calculate(&bars));
    }
}
