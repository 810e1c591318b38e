// =============================================================================
// TickStore — append-only per-symbol tick log with daily rotation
// =============================================================================
//
// Live ticks land in a per-symbol in-memory ring (newest N) plus a pending
// buffer. A persistence task calls `flush` on a timer; pending ticks are then
// appended to `data/ticks/{SYMBOL}/{YYYY-MM-DD}.json`, one file per UTC day.
//
// Failure model: file-write errors are logged and the affected ticks are
// re-queued for the next flush; the ring is never rolled back. Corrupt day
// files are renamed with a `.bad` suffix and excluded from queries.
//
// File I/O never happens while the ring lock is held.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::CoreResult;
use crate::market_data::{validate_symbol, Tick};

// ---------------------------------------------------------------------------
// Per-symbol state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SymbolBuffers {
    /// Newest ticks, oldest first. Capped at the ring capacity.
    ring: VecDeque<Tick>,
    /// Ticks accepted since the last successful flush.
    pending: Vec<Tick>,
    /// Last accepted timestamp per LP, for the out-of-order drop rule.
    last_accepted: HashMap<String, i64>,
}

// ---------------------------------------------------------------------------
// TickStore
// ---------------------------------------------------------------------------

pub struct TickStore {
    dir: PathBuf,
    ring_capacity: usize,
    inner: RwLock<HashMap<String, SymbolBuffers>>,
    out_of_order_dropped: AtomicU64,
    flush_failures: AtomicU64,
}

/// Dedup key for merge operations. Prices are compared by bit pattern; the
/// dedup rule is exact-duplicate elision, not tolerance matching.
fn dedup_key(t: &Tick) -> (i64, String, u64, u64) {
    (t.timestamp_ms, t.lp_id.clone(), t.bid.to_bits(), t.ask.to_bits())
}

fn day_of(ts_ms: i64) -> NaiveDate {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .unwrap_or_default()
        .date_naive()
}

impl TickStore {
    pub fn new(dir: impl Into<PathBuf>, ring_capacity: usize) -> Self {
        Self {
            dir: dir.into(),
            ring_capacity,
            inner: RwLock::new(HashMap::new()),
            out_of_order_dropped: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
        }
    }

    fn symbol_dir(&self, symbol: &str) -> PathBuf {
        self.dir.join(symbol)
    }

    fn day_file(&self, symbol: &str, date: NaiveDate) -> PathBuf {
        self.symbol_dir(symbol)
            .join(format!("{}.json", date.format("%Y-%m-%d")))
    }

    // -------------------------------------------------------------------------
    // Append
    // -------------------------------------------------------------------------

    /// Accept a live tick into the ring and the pending buffer.
    ///
    /// Returns `Ok(true)` when accepted, `Ok(false)` when dropped as
    /// out-of-order for its `(symbol, lp)` pair. O(1) amortized; no
    /// deduplication on the live path.
    pub fn append(&self, tick: Tick) -> CoreResult<bool> {
        validate_symbol(&tick.symbol)?;

        let mut inner = self.inner.write();
        let buffers = inner.entry(tick.symbol.clone()).or_default();

        if let Some(&last) = buffers.last_accepted.get(&tick.lp_id) {
            if tick.timestamp_ms < last {
                drop(inner);
                self.out_of_order_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(symbol = %tick.symbol, lp = %tick.lp_id, ts = tick.timestamp_ms, "out-of-order tick dropped");
                return Ok(false);
            }
        }
        buffers
            .last_accepted
            .insert(tick.lp_id.clone(), tick.timestamp_ms);

        buffers.ring.push_back(tick.clone());
        while buffers.ring.len() > self.ring_capacity {
            buffers.ring.pop_front();
        }
        buffers.pending.push(tick);
        Ok(true)
    }

    /// Out-of-order ticks dropped since startup.
    pub fn out_of_order_dropped(&self) -> u64 {
        self.out_of_order_dropped.load(Ordering::Relaxed)
    }

    /// Flush attempts that hit an I/O error since startup.
    pub fn flush_failures(&self) -> u64 {
        self.flush_failures.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Flush
    // -------------------------------------------------------------------------

    /// Drain every symbol's pending buffer into its day files.
    ///
    /// Ticks whose write fails are re-queued and retried on the next flush.
    pub fn flush(&self) {
        // Take the pending buffers under the lock, do I/O outside it.
        let drained: Vec<(String, Vec<Tick>)> = {
            let mut inner = self.inner.write();
            inner
                .iter_mut()
                .filter(|(_, b)| !b.pending.is_empty())
                .map(|(symbol, b)| (symbol.clone(), std::mem::take(&mut b.pending)))
                .collect()
        };

        for (symbol, ticks) in drained {
            // Partition by UTC day so each rotation unit is written once.
            let mut by_day: HashMap<NaiveDate, Vec<Tick>> = HashMap::new();
            for t in ticks {
                by_day.entry(day_of(t.timestamp_ms)).or_default().push(t);
            }

            for (date, day_ticks) in by_day {
                if let Err(e) = self.append_day_file(&symbol, date, &day_ticks, false) {
                    self.flush_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(symbol = %symbol, date = %date, error = %e, "tick flush failed, re-queueing");
                    let mut inner = self.inner.write();
                    inner
                        .entry(symbol.clone())
                        .or_default()
                        .pending
                        .extend(day_ticks);
                }
            }
        }
    }

    /// Read a day file, tolerating absence; a corrupt file is quarantined
    /// with a `.bad` suffix and treated as absent from then on.
    fn read_day_file(&self, symbol: &str, date: NaiveDate) -> Vec<Tick> {
        let path = self.day_file(symbol, date);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str::<Vec<Tick>>(&content) {
            Ok(ticks) => ticks,
            Err(e) => {
                let bad = path.with_extension("json.bad");
                warn!(path = %path.display(), error = %e, "corrupt day file quarantined");
                if let Err(rename_err) = std::fs::rename(&path, &bad) {
                    warn!(path = %path.display(), error = %rename_err, "failed to quarantine day file");
                }
                Vec::new()
            }
        }
    }

    /// Append `ticks` to the `(symbol, date)` day file, optionally eliding
    /// exact duplicates (merge mode). Write is tmp + rename.
    fn append_day_file(
        &self,
        symbol: &str,
        date: NaiveDate,
        ticks: &[Tick],
        dedup: bool,
    ) -> Result<usize> {
        let dir = self.symbol_dir(symbol);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let mut existing = self.read_day_file(symbol, date);
        let inserted = if dedup {
            let seen: HashSet<_> = existing.iter().map(dedup_key).collect();
            let fresh: Vec<Tick> = ticks
                .iter()
                .filter(|t| !seen.contains(&dedup_key(t)))
                .cloned()
                .collect();
            let n = fresh.len();
            existing.extend(fresh);
            n
        } else {
            existing.extend_from_slice(ticks);
            ticks.len()
        };

        existing.sort_by(|a, b| {
            (a.timestamp_ms, &a.lp_id).cmp(&(b.timestamp_ms, &b.lp_id))
        });

        let path = self.day_file(symbol, date);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string(&existing).context("failed to serialise day file")?;
        std::fs::write(&tmp, body)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename {}", tmp.display()))?;

        debug!(symbol, date = %date, count = existing.len(), "day file written");
        Ok(inserted)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Last `limit` ticks for `symbol`, oldest first. Served from the ring;
    /// when the ring holds fewer, day files are read backwards until the
    /// request is satisfied or history is exhausted.
    pub fn history(&self, symbol: &str, limit: usize) -> CoreResult<Vec<Tick>> {
        validate_symbol(symbol)?;

        let mut out: VecDeque<Tick> = {
            let inner = self.inner.read();
            match inner.get(symbol) {
                Some(b) => {
                    let start = b.ring.len().saturating_sub(limit);
                    b.ring.iter().skip(start).cloned().collect()
                }
                None => VecDeque::new(),
            }
        };

        if out.len() >= limit {
            return Ok(out.into());
        }

        // Walk day files newest-first, prepending ticks older than what we
        // already hold.
        let mut seen: HashSet<_> = out.iter().map(dedup_key).collect();
        let dates = self.available_dates(symbol)?;
        for date in dates.iter().rev() {
            if out.len() >= limit {
                break;
            }
            let mut day = self.read_day_file(symbol, *date);
            day.retain(|t| !seen.contains(&dedup_key(t)));
            for t in day.into_iter().rev() {
                if out.len() >= limit {
                    break;
                }
                seen.insert(dedup_key(&t));
                out.push_front(t);
            }
        }

        Ok(out.into())
    }

    /// Ticks within `[from_ts, to_ts]` (inclusive), stably sorted by
    /// `(timestamp, lp)`, paginated deterministically. `page` is zero-based.
    pub fn range(
        &self,
        symbol: &str,
        from_ts: i64,
        to_ts: i64,
        page: usize,
        page_size: usize,
    ) -> CoreResult<Vec<Tick>> {
        validate_symbol(symbol)?;

        let mut ticks: Vec<Tick> = Vec::new();
        let mut seen: HashSet<(i64, String, u64, u64)> = HashSet::new();

        let from_day = day_of(from_ts);
        let to_day = day_of(to_ts);
        for date in self.available_dates(symbol)? {
            if date < from_day || date > to_day {
                continue;
            }
            for t in self.read_day_file(symbol, date) {
                if t.timestamp_ms >= from_ts
                    && t.timestamp_ms <= to_ts
                    && seen.insert(dedup_key(&t))
                {
                    ticks.push(t);
                }
            }
        }

        // Ring and pending may hold ticks not yet flushed.
        {
            let inner = self.inner.read();
            if let Some(b) = inner.get(symbol) {
                for t in b.ring.iter().chain(b.pending.iter()) {
                    if t.timestamp_ms >= from_ts
                        && t.timestamp_ms <= to_ts
                        && seen.insert(dedup_key(t))
                    {
                        ticks.push(t.clone());
                    }
                }
            }
        }

        ticks.sort_by(|a, b| (a.timestamp_ms, &a.lp_id).cmp(&(b.timestamp_ms, &b.lp_id)));

        let start = page.saturating_mul(page_size).min(ticks.len());
        let end = start.saturating_add(page_size).min(ticks.len());
        Ok(ticks[start..end].to_vec())
    }

    /// Idempotent bulk insert used by backfill. Exact duplicates by
    /// `(ts, bid, ask, lp)` are elided. Returns the number inserted.
    pub fn merge_historical(&self, symbol: &str, ticks: &[Tick]) -> CoreResult<usize> {
        validate_symbol(symbol)?;

        let mut by_day: HashMap<NaiveDate, Vec<Tick>> = HashMap::new();
        for t in ticks {
            by_day
                .entry(day_of(t.timestamp_ms))
                .or_default()
                .push(t.clone());
        }

        let mut inserted = 0;
        for (date, day_ticks) in by_day {
            inserted += self
                .append_day_file(symbol, date, &day_ticks, true)
                .map_err(|e| crate::error::CoreError::Retryable(e.to_string()))?;
        }
        info!(symbol, inserted, "historical merge complete");
        Ok(inserted)
    }

    /// Dates with a (non-quarantined) day file for `symbol`, ascending.
    pub fn available_dates(&self, symbol: &str) -> CoreResult<Vec<NaiveDate>> {
        validate_symbol(symbol)?;

        let dir = self.symbol_dir(symbol);
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => return Ok(Vec::new()),
        };

        let mut dates: Vec<NaiveDate> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                let stem = name.strip_suffix(".json")?;
                NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
            })
            .collect();
        dates.sort();
        Ok(dates)
    }

    /// All symbols with a directory on disk or live data in memory.
    pub fn known_symbols(&self) -> Vec<String> {
        let mut symbols: HashSet<String> = self.inner.read().keys().cloned().collect();
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for e in entries.filter_map(|e| e.ok()) {
                if e.path().is_dir() {
                    symbols.insert(e.file_name().to_string_lossy().into_owned());
                }
            }
        }
        let mut out: Vec<String> = symbols.into_iter().collect();
        out.sort();
        out
    }

    /// Delete day files strictly older than `older_than_days`. 0 retains
    /// forever. Returns the number of files removed.
    pub fn cleanup(&self, older_than_days: u32) -> usize {
        if older_than_days == 0 {
            return 0;
        }
        let cutoff = chrono::Utc::now().date_naive()
            - chrono::Duration::days(i64::from(older_than_days));

        let mut removed = 0;
        for symbol in self.known_symbols() {
            let dates = match self.available_dates(&symbol) {
                Ok(d) => d,
                Err(_) => continue,
            };
            for date in dates {
                if date < cutoff {
                    let path = self.day_file(&symbol, date);
                    match std::fs::remove_file(&path) {
                        Ok(()) => {
                            removed += 1;
                            info!(path = %path.display(), "expired day file removed");
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "cleanup failed")
                        }
                    }
                }
            }
        }
        removed
    }
}

impl std::fmt::Debug for TickStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickStore")
            .field("dir", &self.dir)
            .field("ring_capacity", &self.ring_capacity)
            .field("symbols", &self.inner.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tick(ts: i64, bid: f64, lp: &str) -> Tick {
        Tick {
            symbol: "EURUSD".into(),
            bid,
            ask: bid + 0.0002,
            timestamp_ms: ts,
            lp_id: lp.into(),
        }
    }

    fn store(dir: &Path) -> TickStore {
        TickStore::new(dir, 1000)
    }

    #[test]
    fn append_rejects_bad_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let mut t = tick(1, 1.1, "lpa");
        t.symbol = "eur/usd".into();
        assert!(s.append(t).is_err());
    }

    #[test]
    fn out_of_order_per_lp_is_dropped_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert!(s.append(tick(100, 1.1, "lpa")).unwrap());
        assert!(!s.append(tick(99, 1.1, "lpa")).unwrap());
        // Equal timestamps are accepted (non-decreasing, not strictly increasing).
        assert!(s.append(tick(100, 1.1001, "lpa")).unwrap());
        // A different LP has its own watermark.
        assert!(s.append(tick(50, 1.1, "lpb")).unwrap());
        assert_eq!(s.out_of_order_dropped(), 1);
    }

    #[test]
    fn history_from_ring_is_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        for i in 0..10 {
            s.append(tick(i, 1.1, "lpa")).unwrap();
        }
        let h = s.history("EURUSD", 5).unwrap();
        assert_eq!(h.len(), 5);
        assert_eq!(h.first().unwrap().timestamp_ms, 5);
        assert_eq!(h.last().unwrap().timestamp_ms, 9);
        assert!(h.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));
    }

    #[test]
    fn history_falls_back_to_day_files() {
        let dir = tempfile::tempdir().unwrap();
        let s = TickStore::new(dir.path(), 3); // tiny ring
        let base = 1_700_000_000_000_i64;
        for i in 0..10 {
            s.append(tick(base + i, 1.1, "lpa")).unwrap();
        }
        s.flush();
        // Ring holds 3; ask for 8 so 5 come from the file.
        let h = s.history("EURUSD", 8).unwrap();
        assert_eq!(h.len(), 8);
        assert_eq!(h.first().unwrap().timestamp_ms, base + 2);
        assert_eq!(h.last().unwrap().timestamp_ms, base + 9);
    }

    #[test]
    fn flush_writes_day_file_and_range_reads_it() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let base = 1_700_000_000_000_i64;
        for i in 0..5 {
            s.append(tick(base + i * 1000, 1.1 + i as f64 * 0.0001, "lpa"))
                .unwrap();
        }
        s.flush();
        assert_eq!(s.available_dates("EURUSD").unwrap().len(), 1);

        let page = s.range("EURUSD", base, base + 10_000, 0, 3).unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].timestamp_ms, base);
        let page2 = s.range("EURUSD", base, base + 10_000, 1, 3).unwrap();
        assert_eq!(page2.len(), 2);
        assert_eq!(page2[0].timestamp_ms, base + 3000);
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let base = 1_700_000_000_000_i64;
        for i in 0..3 {
            s.append(tick(base + i, 1.1, "lpa")).unwrap();
        }
        let hits = s.range("EURUSD", base, base + 2, 0, 100).unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn merge_historical_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let base = 1_700_000_000_000_i64;
        let batch: Vec<Tick> = (0..4).map(|i| tick(base + i, 1.2, "hist")).collect();

        let first = s.merge_historical("EURUSD", &batch).unwrap();
        assert_eq!(first, 4);
        let second = s.merge_historical("EURUSD", &batch).unwrap();
        assert_eq!(second, 0);

        let all = s.range("EURUSD", base, base + 10, 0, 100).unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn corrupt_day_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let base = 1_700_000_000_000_i64;
        s.append(tick(base, 1.1, "lpa")).unwrap();
        s.flush();

        let date = day_of(base);
        let path = s.day_file("EURUSD", date);
        std::fs::write(&path, "{not json").unwrap();

        // The read path quarantines and reports nothing for the file.
        let got = s.read_day_file("EURUSD", date);
        assert!(got.is_empty());
        assert!(path.with_extension("json.bad").exists());
        assert!(!path.exists());
    }

    #[test]
    fn cleanup_zero_keeps_forever() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.append(tick(1_000, 1.1, "lpa")).unwrap(); // 1970
        s.flush();
        assert_eq!(s.cleanup(0), 0);
        assert_eq!(s.available_dates("EURUSD").unwrap().len(), 1);
        // Anything dated 1970 is long past any positive cutoff.
        assert_eq!(s.cleanup(30), 1);
        assert!(s.available_dates("EURUSD").unwrap().is_empty());
    }
}
