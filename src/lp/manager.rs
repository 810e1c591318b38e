// =============================================================================
// LPManager — adapter registry and quote aggregation
// =============================================================================
//
// Adapters push quotes onto one merged channel (buffer 1000); an aggregation
// task applies the priority selection and forwards survivors to the hub as
// canonical ticks.
//
// Selection per symbol: forward a quote only when no higher-priority,
// currently-connected adapter has published that symbol within the
// staleness window. Ties break by registration order.
//
// `enable` never performs the connect itself: it flips the registry bit and
// enqueues a start command; a worker loop connects without holding the
// registry lock.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::hub::HubHandle;
use crate::lp::adapter::LpAdapter;
use crate::market_data::Quote;

/// Merge channel capacity.
const MERGE_CAPACITY: usize = 1000;

struct LpEntry {
    adapter: Arc<dyn LpAdapter>,
    priority: i32,
    enabled: bool,
    /// Registration order, the tie-breaker between equal priorities.
    order: usize,
}

enum LpCommand {
    Start(String),
    Stop(String),
}

/// Serialisable registry state for the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LpConfigEntry {
    pub lp_id: String,
    pub priority: i32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LpConfigFile {
    pub entries: Vec<LpConfigEntry>,
}

/// Dashboard/status view of one adapter.
#[derive(Debug, Clone, Serialize)]
pub struct LpStatus {
    pub lp_id: String,
    pub priority: i32,
    pub enabled: bool,
    pub connected: bool,
}

pub struct LpManager {
    entries: RwLock<HashMap<String, LpEntry>>,
    registration_counter: Mutex<usize>,
    quote_tx: mpsc::Sender<Quote>,
    quote_rx: Mutex<Option<mpsc::Receiver<Quote>>>,
    commands_tx: mpsc::UnboundedSender<LpCommand>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<LpCommand>>>,
    /// Receipt time of the last quote per (lp, symbol).
    last_seen: RwLock<HashMap<(String, String), i64>>,
    symbols: RwLock<Vec<String>>,
    staleness_ms: i64,
    clock: Arc<Clock>,
    hub: HubHandle,
    pub forwarded: AtomicU64,
    pub shadowed: AtomicU64,
}

impl LpManager {
    pub fn new(hub: HubHandle, clock: Arc<Clock>, staleness_ms: i64) -> Self {
        let (quote_tx, quote_rx) = mpsc::channel(MERGE_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            entries: RwLock::new(HashMap::new()),
            registration_counter: Mutex::new(0),
            quote_tx,
            quote_rx: Mutex::new(Some(quote_rx)),
            commands_tx,
            commands_rx: Mutex::new(Some(commands_rx)),
            last_seen: RwLock::new(HashMap::new()),
            symbols: RwLock::new(Vec::new()),
            staleness_ms,
            clock,
            hub,
            forwarded: AtomicU64::new(0),
            shadowed: AtomicU64::new(0),
        }
    }

    /// Sender adapters use to reach the merge channel.
    pub fn quote_sender(&self) -> mpsc::Sender<Quote> {
        self.quote_tx.clone()
    }

    // -------------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------------

    pub fn register(
        &self,
        adapter: Arc<dyn LpAdapter>,
        priority: i32,
        initial_enabled: bool,
    ) -> CoreResult<()> {
        let lp_id = adapter.lp_id().to_string();
        let mut entries = self.entries.write();
        if entries.contains_key(&lp_id) {
            return Err(CoreError::Conflict(format!("lp {lp_id} already registered")));
        }
        let order = {
            let mut counter = self.registration_counter.lock();
            *counter += 1;
            *counter
        };
        info!(lp = %lp_id, priority, enabled = initial_enabled, "lp registered");
        entries.insert(
            lp_id.clone(),
            LpEntry {
                adapter,
                priority,
                enabled: initial_enabled,
                order,
            },
        );
        drop(entries);

        if initial_enabled {
            let _ = self.commands_tx.send(LpCommand::Start(lp_id));
        }
        Ok(())
    }

    /// Flip the bit under a brief lock and enqueue the connect; the worker
    /// performs it without the registry lock held.
    pub fn enable(&self, lp_id: &str) -> CoreResult<()> {
        {
            let mut entries = self.entries.write();
            let entry = entries.get_mut(lp_id).ok_or(CoreError::NotFound {
                entity: "lp",
                id: lp_id.to_string(),
            })?;
            if entry.enabled {
                return Ok(());
            }
            entry.enabled = true;
        }
        let _ = self.commands_tx.send(LpCommand::Start(lp_id.to_string()));
        Ok(())
    }

    pub fn disable(&self, lp_id: &str) -> CoreResult<()> {
        {
            let mut entries = self.entries.write();
            let entry = entries.get_mut(lp_id).ok_or(CoreError::NotFound {
                entity: "lp",
                id: lp_id.to_string(),
            })?;
            if !entry.enabled {
                return Ok(());
            }
            entry.enabled = false;
        }
        let _ = self.commands_tx.send(LpCommand::Stop(lp_id.to_string()));
        Ok(())
    }

    pub fn status(&self) -> Vec<LpStatus> {
        let entries = self.entries.read();
        let mut out: Vec<LpStatus> = entries
            .iter()
            .map(|(id, e)| LpStatus {
                lp_id: id.clone(),
                priority: e.priority,
                enabled: e.enabled,
                connected: e.adapter.is_connected(),
            })
            .collect();
        out.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.lp_id.cmp(&b.lp_id)));
        out
    }

    // -------------------------------------------------------------------------
    // Config persistence
    // -------------------------------------------------------------------------

    pub fn save_config(&self, path: impl AsRef<Path>) -> Result<()> {
        let entries = self.entries.read();
        let mut file = LpConfigFile::default();
        for (id, e) in entries.iter() {
            file.entries.push(LpConfigEntry {
                lp_id: id.clone(),
                priority: e.priority,
                enabled: e.enabled,
            });
        }
        file.entries.sort_by(|a, b| a.lp_id.cmp(&b.lp_id));
        drop(entries);

        let path = path.as_ref();
        let body = serde_json::to_string_pretty(&file).context("failed to serialise lp config")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename {}", tmp.display()))?;
        Ok(())
    }

    /// Apply persisted priorities/enabled bits to already-registered
    /// adapters. A load failure is reported; the caller keeps defaults.
    pub fn load_config(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read lp config from {}", path.display()))?;
        let file: LpConfigFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse lp config from {}", path.display()))?;

        let mut entries = self.entries.write();
        for persisted in file.entries {
            if let Some(entry) = entries.get_mut(&persisted.lp_id) {
                entry.priority = persisted.priority;
                entry.enabled = persisted.enabled;
            }
        }
        info!(path = %path.display(), "lp config applied");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Selection
    // -------------------------------------------------------------------------

    /// Whether a quote survives priority selection at time `now`.
    pub(crate) fn should_forward(&self, quote: &Quote, now: i64) -> bool {
        let entries = self.entries.read();
        let Some(source) = entries.get(&quote.lp_id) else {
            return false;
        };
        if !source.enabled {
            return false;
        }

        let last_seen = self.last_seen.read();
        for (id, entry) in entries.iter() {
            if id == &quote.lp_id || !entry.enabled || !entry.adapter.is_connected() {
                continue;
            }
            let outranks = entry.priority < source.priority
                || (entry.priority == source.priority && entry.order < source.order);
            if !outranks {
                continue;
            }
            if let Some(&seen) = last_seen.get(&(id.clone(), quote.symbol.clone())) {
                if now - seen <= self.staleness_ms {
                    return false;
                }
            }
        }
        true
    }

    fn record_seen(&self, quote: &Quote, now: i64) {
        self.last_seen
            .write()
            .insert((quote.lp_id.clone(), quote.symbol.clone()), now);
    }

    // -------------------------------------------------------------------------
    // Tasks
    // -------------------------------------------------------------------------

    /// Spawn the command worker and the aggregation loop. `symbols` is the
    /// streaming universe handed to adapters as they start.
    pub fn start_aggregation(
        self: &Arc<Self>,
        symbols: Vec<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        *self.symbols.write() = symbols;

        // Command worker: connects/stops adapters outside the registry lock.
        let manager = self.clone();
        let mut worker_shutdown = shutdown.clone();
        let mut commands_rx = self
            .commands_rx
            .lock()
            .take()
            .expect("start_aggregation called twice");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_command = commands_rx.recv() => {
                        let Some(command) = maybe_command else { break };
                        match command {
                            LpCommand::Start(lp_id) => manager.run_start(&lp_id).await,
                            LpCommand::Stop(lp_id) => manager.run_stop(&lp_id).await,
                        }
                    }
                    changed = worker_shutdown.changed() => {
                        if changed.is_err() || *worker_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        // Aggregation loop: merge channel -> selection -> hub.
        let manager = self.clone();
        let mut quote_rx = self
            .quote_rx
            .lock()
            .take()
            .expect("start_aggregation called twice");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_quote = quote_rx.recv() => {
                        let Some(quote) = maybe_quote else { break };
                        let now = manager.clock.now_ms();
                        let forward = manager.should_forward(&quote, now);
                        manager.record_seen(&quote, now);
                        if forward {
                            manager.forwarded.fetch_add(1, Ordering::Relaxed);
                            manager.hub.publish_tick(quote.into_tick());
                        } else {
                            manager.shadowed.fetch_add(1, Ordering::Relaxed);
                            debug!("quote shadowed by higher-priority lp");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("lp aggregation stopped");
        });
    }

    async fn run_start(&self, lp_id: &str) {
        // Snapshot what we need; never await with the registry lock held.
        let (adapter, still_enabled) = {
            let entries = self.entries.read();
            match entries.get(lp_id) {
                Some(e) => (e.adapter.clone(), e.enabled),
                None => return,
            }
        };
        if !still_enabled {
            return;
        }
        let symbols = self.symbols.read().clone();

        if let Err(e) = adapter.connect().await {
            warn!(lp = %lp_id, error = %e, "lp connect failed");
            return;
        }
        if let Err(e) = adapter.start_streaming(&symbols).await {
            warn!(lp = %lp_id, error = %e, "lp streaming start failed");
        }
    }

    async fn run_stop(&self, lp_id: &str) {
        let adapter = {
            let entries = self.entries.read();
            match entries.get(lp_id) {
                Some(e) => e.adapter.clone(),
                None => return,
            }
        };
        let symbols = self.symbols.read().clone();
        let _ = adapter.stop_streaming(&symbols).await;
        adapter.disconnect().await;
    }

    /// Stop every adapter and close the registry. Used on shutdown.
    pub async fn shutdown(&self) {
        let adapters: Vec<Arc<dyn LpAdapter>> = {
            let entries = self.entries.read();
            entries.values().map(|e| e.adapter.clone()).collect()
        };
        for adapter in adapters {
            adapter.disconnect().await;
        }
        info!("lp manager shut down");
    }
}

impl std::fmt::Debug for LpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LpManager")
            .field("adapters", &self.entries.read().len())
            .field("forwarded", &self.forwarded.load(Ordering::Relaxed))
            .field("shadowed", &self.shadowed.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::hub;
    use crate::market_data::ohlc::OhlcCache;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct MockAdapter {
        lp_id: String,
        connected: AtomicBool,
    }

    impl MockAdapter {
        fn new(lp_id: &str, connected: bool) -> Arc<Self> {
            Arc::new(Self {
                lp_id: lp_id.into(),
                connected: AtomicBool::new(connected),
            })
        }
    }

    #[async_trait]
    impl LpAdapter for MockAdapter {
        fn lp_id(&self) -> &str {
            &self.lp_id
        }
        async fn connect(&self) -> CoreResult<()> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        async fn start_streaming(&self, _symbols: &[String]) -> CoreResult<()> {
            Ok(())
        }
        async fn stop_streaming(&self, _symbols: &[String]) -> CoreResult<()> {
            Ok(())
        }
    }

    fn manager() -> (Arc<LpManager>, Arc<MockAdapter>, Arc<MockAdapter>) {
        let clock = Arc::new(Clock::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (persist_tx, _persist_rx) = mpsc::channel(64);
        let (handle, _runloop) = hub(
            Arc::new(OhlcCache::new(10)),
            persist_tx,
            40,
            true,
            clock.clone(),
            shutdown_rx,
        );
        let manager = Arc::new(LpManager::new(handle, clock, 2_000));
        let a = MockAdapter::new("lp-a", true);
        let b = MockAdapter::new("lp-b", true);
        manager.register(a.clone(), 1, true).unwrap();
        manager.register(b.clone(), 2, true).unwrap();
        (manager, a, b)
    }

    fn quote(lp: &str, symbol: &str, ts: i64) -> Quote {
        Quote {
            lp_id: lp.into(),
            symbol: symbol.into(),
            bid: 1.1,
            ask: 1.1002,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let (m, a, _) = manager();
        assert!(m.register(a, 3, false).is_err());
    }

    #[test]
    fn priority_shadowing() {
        // E5 shape: A (priority 1) publishes at t=0, B (priority 2) at t=1.
        let (m, _a, _b) = manager();

        let qa = quote("lp-a", "EURUSD", 0);
        assert!(m.should_forward(&qa, 0));
        m.record_seen(&qa, 0);

        let qb = quote("lp-b", "EURUSD", 1);
        assert!(!m.should_forward(&qb, 1), "B is shadowed by fresh A");
        m.record_seen(&qb, 1);
    }

    #[test]
    fn shadow_lifts_when_higher_priority_disconnects() {
        let (m, a, _b) = manager();
        let qa = quote("lp-a", "EURUSD", 0);
        m.record_seen(&qa, 0);

        a.connected.store(false, Ordering::SeqCst);
        let qb = quote("lp-b", "EURUSD", 10);
        assert!(m.should_forward(&qb, 10));
    }

    #[test]
    fn shadow_lifts_after_staleness_window() {
        let (m, _a, _b) = manager();
        let qa = quote("lp-a", "EURUSD", 0);
        m.record_seen(&qa, 0);

        let qb = quote("lp-b", "EURUSD", 2_500);
        assert!(m.should_forward(&qb, 2_500), "A's quote is stale after 2s");
    }

    #[test]
    fn disabled_source_never_forwards() {
        let (m, _a, _b) = manager();
        m.disable("lp-a").unwrap();
        assert!(!m.should_forward(&quote("lp-a", "EURUSD", 0), 0));
    }

    #[test]
    fn shadowing_is_per_symbol() {
        let (m, _a, _b) = manager();
        m.record_seen(&quote("lp-a", "EURUSD", 0), 0);
        // B's GBPUSD is not shadowed by A's EURUSD.
        assert!(m.should_forward(&quote("lp-b", "GBPUSD", 1), 1));
    }

    #[test]
    fn tie_breaks_by_registration_order() {
        let clock = Arc::new(Clock::new());
        let (_sd_tx, sd_rx) = watch::channel(false);
        let (persist_tx, _persist_rx) = mpsc::channel(64);
        let (handle, _runloop) = hub(
            Arc::new(OhlcCache::new(10)),
            persist_tx,
            40,
            true,
            clock.clone(),
            sd_rx,
        );
        let m = Arc::new(LpManager::new(handle, clock, 2_000));
        m.register(MockAdapter::new("first", true), 5, true).unwrap();
        m.register(MockAdapter::new("second", true), 5, true).unwrap();

        m.record_seen(&quote("first", "EURUSD", 0), 0);
        assert!(!m.should_forward(&quote("second", "EURUSD", 1), 1));
        // And the earlier-registered adapter is never shadowed by the later.
        m.record_seen(&quote("second", "EURUSD", 1), 1);
        assert!(m.should_forward(&quote("first", "EURUSD", 2), 2));
    }

    #[test]
    fn enable_disable_roundtrip_restores_state() {
        let (m, _a, _b) = manager();
        let before: Vec<(String, bool)> = m
            .status()
            .into_iter()
            .map(|s| (s.lp_id, s.enabled))
            .collect();
        m.disable("lp-b").unwrap();
        m.enable("lp-b").unwrap();
        let after: Vec<(String, bool)> = m
            .status()
            .into_iter()
            .map(|s| (s.lp_id, s.enabled))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn config_roundtrip() {
        let (m, _a, _b) = manager();
        m.disable("lp-b").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lp.json");
        m.save_config(&path).unwrap();

        // A fresh registry with defaults picks the persisted bits back up.
        let (m2, _a2, _b2) = manager();
        m2.load_config(&path).unwrap();
        let status: HashMap<String, bool> = m2
            .status()
            .into_iter()
            .map(|s| (s.lp_id, s.enabled))
            .collect();
        assert!(!status["lp-b"]);
        assert!(status["lp-a"]);
    }

    #[test]
    fn load_missing_config_reports_error() {
        let (m, _a, _b) = manager();
        assert!(m.load_config("/nonexistent/lp.json").is_err());
    }
}
