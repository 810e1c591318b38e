// =============================================================================
// Central Application State — Meridian FX Engine
// =============================================================================
//
// The single source of truth wiring every subsystem together for the API
// surface. Subsystems own their state behind Arc; AppState ties them
// together and builds the unified snapshot for the dashboard REST endpoint
// and the WebSocket feed.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for the mutable shared collections.
//   - Arc wrappers for subsystem engines that manage their own interior
//     mutability.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::clock::{Clock, IdGen};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::fix::session::FixSessionHandle;
use crate::hub::HubHandle;
use crate::ledger::Ledger;
use crate::lp::{LpManager, LpStatus};
use crate::market_data::ohlc::OhlcCache;
use crate::market_data::tick_store::TickStore;
use crate::router::Router;
use crate::scheduler::OrderScheduler;

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

// =============================================================================
// AppState
// =============================================================================

pub struct AppState {
    /// Monotonically increasing version counter, incremented on every
    /// meaningful state mutation. The WebSocket feed uses it to detect
    /// changes.
    pub state_version: AtomicU64,

    pub config: EngineConfig,
    pub clock: Arc<Clock>,
    pub ids: Arc<IdGen>,

    pub hub: HubHandle,
    pub tick_store: Arc<TickStore>,
    pub ohlc: Arc<OhlcCache>,
    pub ledger: Arc<Ledger>,
    pub engine: Arc<Engine>,
    pub scheduler: Arc<OrderScheduler>,
    pub router: Arc<Router>,
    pub lp_manager: Arc<LpManager>,
    /// FIX sessions by lp_id.
    pub fix_sessions: RwLock<HashMap<String, FixSessionHandle>>,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        clock: Arc<Clock>,
        ids: Arc<IdGen>,
        hub: HubHandle,
        tick_store: Arc<TickStore>,
        ohlc: Arc<OhlcCache>,
        ledger: Arc<Ledger>,
        engine: Arc<Engine>,
        scheduler: Arc<OrderScheduler>,
        router: Arc<Router>,
        lp_manager: Arc<LpManager>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            config,
            clock,
            ids,
            hub,
            tick_store,
            ohlc,
            ledger,
            engine,
            scheduler,
            router,
            lp_manager,
            fix_sessions: RwLock::new(HashMap::new()),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error logging ───────────────────────────────────────────────────

    /// Record an error. The ring is capped at [`MAX_RECENT_ERRORS`]; oldest
    /// entries are evicted.
    pub fn push_error(&self, message: String, code: Option<String>) {
        let record = ErrorRecord {
            message,
            code,
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    // ── Snapshot builder ────────────────────────────────────────────────

    /// Build the full serialisable snapshot for `GET /api/v1/state` and the
    /// WebSocket push feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let hub_stats = &self.hub.stats;
        let hub = HubSnapshot {
            accepted: hub_stats.accepted.load(Ordering::Relaxed),
            ingress_dropped: hub_stats.ingress_dropped.load(Ordering::Relaxed),
            persist_dropped: hub_stats.persist_dropped.load(Ordering::Relaxed),
            event_dropped: hub_stats.event_dropped.load(Ordering::Relaxed),
            rejected_invalid: hub_stats.rejected_invalid.load(Ordering::Relaxed),
            rejected_out_of_order: hub_stats.rejected_out_of_order.load(Ordering::Relaxed),
            egress_dropped: hub_stats.egress_drops(),
        };

        let tick_store = TickStoreSnapshot {
            out_of_order_dropped: self.tick_store.out_of_order_dropped(),
            flush_failures: self.tick_store.flush_failures(),
        };

        let fix = self
            .fix_sessions
            .read()
            .iter()
            .map(|(lp_id, handle)| {
                let (out_seq, in_seq) = handle.sequences();
                FixSnapshot {
                    lp_id: lp_id.clone(),
                    session_id: handle.session_id.clone(),
                    state: handle.state().to_string(),
                    out_seq,
                    in_seq,
                }
            })
            .collect();

        let accounts = self
            .engine
            .account_ids()
            .into_iter()
            .filter_map(|id| self.engine.account_snapshot(id).ok())
            .collect();

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_s: self.start_time.elapsed().as_secs(),
            execution_mode: self.router.default_mode().to_string(),
            mt5_mode: self.hub.mt5_mode.load(Ordering::Relaxed),
            symbols: self.engine.symbol_specs().len(),
            accounts,
            open_positions: self.engine.open_positions(None).len(),
            pending_orders: self.engine.pending_orders().len(),
            latest_prices: self.hub.prices.all().len(),
            hub,
            tick_store,
            lps: self.lp_manager.status(),
            lp_forwarded: self.lp_manager.forwarded.load(Ordering::Relaxed),
            lp_shadowed: self.lp_manager.shadowed.load(Ordering::Relaxed),
            fix,
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_s: u64,
    pub execution_mode: String,
    pub mt5_mode: bool,
    pub symbols: usize,
    pub accounts: Vec<crate::engine::AccountSnapshot>,
    pub open_positions: usize,
    pub pending_orders: usize,
    pub latest_prices: usize,
    pub hub: HubSnapshot,
    pub tick_store: TickStoreSnapshot,
    pub lps: Vec<LpStatus>,
    pub lp_forwarded: u64,
    pub lp_shadowed: u64,
    pub fix: Vec<FixSnapshot>,
    pub recent_errors: Vec<ErrorRecord>,
}

/// Hub throughput and drop counters. The drop rates are the observable
/// cost of the non-blocking hot path.
#[derive(Debug, Clone, Serialize)]
pub struct HubSnapshot {
    pub accepted: u64,
    pub ingress_dropped: u64,
    pub persist_dropped: u64,
    pub event_dropped: u64,
    pub rejected_invalid: u64,
    pub rejected_out_of_order: u64,
    pub egress_dropped: HashMap<u64, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickStoreSnapshot {
    pub out_of_order_dropped: u64,
    pub flush_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixSnapshot {
    pub lp_id: String,
    pub session_id: String,
    pub state: String,
    pub out_seq: u64,
    pub in_seq: u64,
}
