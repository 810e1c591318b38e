// =============================================================================
// OHLCCache — fixed-timeframe bar rollups derived from the tick stream
// =============================================================================
//
// For each (symbol, timeframe) the cache keeps a ring of the last K finalized
// bars plus the current in-progress bar. The price input is always the mid
// price (bid+ask)/2. Bar keys are aligned: open_ts = floor(ts/tf)*tf.
//
// Empty intervals between ticks are filled with flat bars at the previous
// close so a series is contiguous once a later bar has materialized.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::market_data::Tick;

/// Supported bar timeframes in seconds.
pub const TIMEFRAMES: [u32; 6] = [60, 300, 900, 3600, 14_400, 86_400];

/// Parse an API timeframe label (`1m|5m|15m|1h|4h|1d`) into seconds.
pub fn timeframe_seconds(label: &str) -> Option<u32> {
    match label {
        "1m" => Some(60),
        "5m" => Some(300),
        "15m" => Some(900),
        "1h" => Some(3600),
        "4h" => Some(14_400),
        "1d" => Some(86_400),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Bar
// ---------------------------------------------------------------------------

/// One OHLC bar. `open_ts` is in seconds, aligned to the timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OhlcBar {
    pub open_ts: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub volume_ticks: u64,
}

impl OhlcBar {
    fn start(open_ts: i64, price: f64) -> Self {
        Self {
            open_ts,
            o: price,
            h: price,
            l: price,
            c: price,
            volume_ticks: 1,
        }
    }

    /// Flat filler for an interval that saw no ticks.
    fn flat(open_ts: i64, price: f64) -> Self {
        Self {
            open_ts,
            o: price,
            h: price,
            l: price,
            c: price,
            volume_ticks: 0,
        }
    }

    fn apply(&mut self, price: f64) {
        self.h = self.h.max(price);
        self.l = self.l.min(price);
        self.c = price;
        self.volume_ticks += 1;
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Series {
    bars: VecDeque<OhlcBar>,
    current: Option<OhlcBar>,
}

pub struct OhlcCache {
    capacity: usize,
    inner: RwLock<HashMap<(String, u32), Series>>,
}

impl OhlcCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Fold an accepted tick into every timeframe's series for its symbol.
    ///
    /// Returns the bars finalized by this tick as `(timeframe, bar)` pairs
    /// so bar-close consumers (ATR trailing) can react without polling.
    pub fn update(&self, tick: &Tick) -> Vec<(u32, OhlcBar)> {
        let mid = tick.mid();
        let ts_s = tick.timestamp_ms / 1000;
        let mut closed = Vec::new();

        let mut inner = self.inner.write();
        for &tf in &TIMEFRAMES {
            let bucket = ts_s / i64::from(tf) * i64::from(tf);
            let series = inner
                .entry((tick.symbol.clone(), tf))
                .or_default();

            match series.current {
                None => {
                    series.current = Some(OhlcBar::start(bucket, mid));
                }
                Some(ref mut current) if bucket == current.open_ts => {
                    current.apply(mid);
                }
                Some(current) if bucket > current.open_ts => {
                    // Finalize the live bar, fill any empty intervals, then
                    // open the new one.
                    series.bars.push_back(current);
                    closed.push((tf, current));

                    let mut next = current.open_ts + i64::from(tf);
                    while next < bucket {
                        let filler = OhlcBar::flat(next, current.c);
                        series.bars.push_back(filler);
                        closed.push((tf, filler));
                        next += i64::from(tf);
                    }
                    while series.bars.len() > self.capacity {
                        series.bars.pop_front();
                    }
                    series.current = Some(OhlcBar::start(bucket, mid));
                }
                Some(_) => {
                    // Tick older than the live bar; the hub's ordering rule
                    // makes this rare, drop it here too.
                    debug!(symbol = %tick.symbol, tf, "stale tick ignored by ohlc");
                }
            }
        }
        closed
    }

    /// Last `limit` finalized bars plus the in-progress bar as the final
    /// element, oldest first.
    pub fn history(&self, symbol: &str, timeframe_s: u32, limit: usize) -> Vec<OhlcBar> {
        let inner = self.inner.read();
        let Some(series) = inner.get(&(symbol.to_string(), timeframe_s)) else {
            return Vec::new();
        };

        let start = series.bars.len().saturating_sub(limit);
        let mut out: Vec<OhlcBar> = series.bars.iter().skip(start).copied().collect();
        if let Some(current) = series.current {
            out.push(current);
        }
        out
    }

    /// Persist every series' finalized bars to
    /// `{dir}/{SYMBOL}/{TF}.json` (tmp + rename per file).
    pub fn flush(&self, dir: &Path) {
        let snapshots: Vec<((String, u32), Vec<OhlcBar>)> = {
            let inner = self.inner.read();
            inner
                .iter()
                .map(|(key, series)| (key.clone(), series.bars.iter().copied().collect()))
                .collect()
        };

        for ((symbol, tf), bars) in snapshots {
            if bars.is_empty() {
                continue;
            }
            if let Err(e) = write_series(dir, &symbol, tf, &bars) {
                warn!(symbol = %symbol, tf, error = %e, "ohlc flush failed");
            }
        }
    }
}

fn write_series(dir: &Path, symbol: &str, tf: u32, bars: &[OhlcBar]) -> Result<()> {
    let sym_dir = dir.join(symbol);
    std::fs::create_dir_all(&sym_dir)
        .with_context(|| format!("failed to create {}", sym_dir.display()))?;
    let path = sym_dir.join(format!("{tf}.json"));
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string(bars).context("failed to serialise ohlc series")?;
    std::fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, &path)
        .with_context(|| format!("failed to rename {}", tmp.display()))?;
    Ok(())
}

impl std::fmt::Debug for OhlcCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OhlcCache")
            .field("capacity", &self.capacity)
            .field("series", &self.inner.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tick(ts_ms: i64, bid: f64, ask: f64) -> Tick {
        Tick {
            symbol: "EURUSD".into(),
            bid,
            ask,
            timestamp_ms: ts_ms,
            lp_id: "lpa".into(),
        }
    }

    #[test]
    fn timeframe_labels() {
        assert_eq!(timeframe_seconds("1m"), Some(60));
        assert_eq!(timeframe_seconds("4h"), Some(14_400));
        assert_eq!(timeframe_seconds("2m"), None);
    }

    #[test]
    fn bars_align_to_timeframe() {
        let cache = OhlcCache::new(500);
        cache.update(&tick(90_500, 1.0, 1.0)); // 90.5 s -> bucket 60
        let bars = cache.history("EURUSD", 60, 10);
        assert_eq!(bars.len(), 1); // in-progress only
        assert_eq!(bars[0].open_ts, 60);
        assert_eq!(bars[0].open_ts % 60, 0);
    }

    #[test]
    fn mid_price_drives_ohlc() {
        let cache = OhlcCache::new(500);
        cache.update(&tick(0, 1.0, 2.0)); // mid 1.5
        cache.update(&tick(1_000, 2.0, 4.0)); // mid 3.0
        cache.update(&tick(2_000, 0.5, 1.5)); // mid 1.0

        let bars = cache.history("EURUSD", 60, 10);
        let bar = bars.last().unwrap();
        assert_eq!(bar.o, 1.5);
        assert_eq!(bar.h, 3.0);
        assert_eq!(bar.l, 1.0);
        assert_eq!(bar.c, 1.0);
        assert_eq!(bar.volume_ticks, 3);
    }

    #[test]
    fn bar_finalizes_on_advance() {
        let cache = OhlcCache::new(500);
        cache.update(&tick(10_000, 1.0, 1.0));
        let closed = cache.update(&tick(70_000, 2.0, 2.0));

        let closed_1m: Vec<_> = closed.iter().filter(|(tf, _)| *tf == 60).collect();
        assert_eq!(closed_1m.len(), 1);
        assert_eq!(closed_1m[0].1.open_ts, 0);
        assert_eq!(closed_1m[0].1.c, 1.0);

        let bars = cache.history("EURUSD", 60, 10);
        assert_eq!(bars.len(), 2); // one finalized + in-progress
        assert_eq!(bars[1].open_ts, 60);
    }

    #[test]
    fn gaps_are_filled_flat() {
        let cache = OhlcCache::new(500);
        cache.update(&tick(0, 1.0, 1.0));
        cache.update(&tick(200_000, 2.0, 2.0)); // 200 s -> skips bars 60 & 120

        let bars = cache.history("EURUSD", 60, 10);
        let finalized = &bars[..bars.len() - 1];
        assert_eq!(finalized.len(), 3);
        // Contiguous open_ts.
        assert_eq!(finalized[0].open_ts, 0);
        assert_eq!(finalized[1].open_ts, 60);
        assert_eq!(finalized[2].open_ts, 120);
        // Fillers carry the previous close with zero tick volume.
        assert_eq!(finalized[1].c, 1.0);
        assert_eq!(finalized[1].volume_ticks, 0);
    }

    #[test]
    fn invariant_low_high_bounds() {
        let cache = OhlcCache::new(500);
        for i in 0..50 {
            let mid = 1.0 + ((i as f64) * 0.7).sin() * 0.1;
            cache.update(&tick(i * 3_000, mid, mid));
        }
        for bar in cache.history("EURUSD", 60, 100) {
            assert!(bar.l <= bar.o.min(bar.c));
            assert!(bar.h >= bar.o.max(bar.c));
            assert_eq!(bar.open_ts % 60, 0);
        }
    }

    #[test]
    fn capacity_trims_oldest() {
        let cache = OhlcCache::new(3);
        for i in 0..10 {
            cache.update(&tick(i * 60_000, 1.0, 1.0));
        }
        let bars = cache.history("EURUSD", 60, 100);
        // 3 finalized + 1 in-progress.
        assert_eq!(bars.len(), 4);
        assert_eq!(bars[0].open_ts, 360);
    }

    #[test]
    fn flush_writes_series_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = OhlcCache::new(500);
        cache.update(&tick(0, 1.0, 1.0));
        cache.update(&tick(61_000, 1.1, 1.1));
        cache.flush(dir.path());

        let path = dir.path().join("EURUSD").join("60.json");
        let content = std::fs::read_to_string(path).unwrap();
        let bars: Vec<OhlcBar> = serde_json::from_str(&content).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].open_ts, 0);
    }
}
