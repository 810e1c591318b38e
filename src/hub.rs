// =============================================================================
// Hub — single-producer-many-consumer fanout of ticks and engine events
// =============================================================================
//
// A dedicated runloop owns the latest-price table and the subscriber set.
// Producers enqueue ticks onto a bounded ingress channel; each subscriber
// owns a bounded egress channel. Per accepted tick the runloop:
//
//   1. validates (`ask >= bid`, finite values),
//   2. drops out-of-order ticks per (symbol, lp),
//   3. updates the latest-price table,
//   4. invokes tick listeners (engine, order scheduler),
//   5. folds the tick into the OHLC cache (bar closes also reach listeners),
//   6. submits to the tick-store writer (non-blocking, drop-and-count),
//   7. fans out to subscribers (non-blocking send, drop-and-count).
//
// Broadcast is thinned to one tick per symbol per throttle interval per
// subscriber unless MT5 mode is on. Engine events (position/account) are
// never throttled.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::market_data::ohlc::{OhlcBar, OhlcCache};
use crate::market_data::tick_store::TickStore;
use crate::market_data::Tick;

/// Ingress channel capacity (ticks from the LP aggregation bridge).
const INGRESS_CAPACITY: usize = 2048;
/// Egress channel capacity per subscriber.
const EGRESS_CAPACITY: usize = 1024;
/// Engine-event channel capacity.
const EVENT_CAPACITY: usize = 1024;
/// Tick-store writer queue capacity.
const PERSIST_CAPACITY: usize = 8192;

// =============================================================================
// Events
// =============================================================================

/// Payload of a position event pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct PositionEvent {
    pub kind: &'static str,
    pub position: crate::engine::position::Position,
}

/// Payload of an account event pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct AccountEvent {
    pub kind: &'static str,
    pub account_id: u64,
    pub balance: f64,
    pub equity: f64,
    pub margin_used: f64,
}

/// Everything a subscriber can receive.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HubEvent {
    Tick(Tick),
    Position(PositionEvent),
    Account(AccountEvent),
}

// =============================================================================
// Listener seam
// =============================================================================

/// Components invoked by the runloop for every accepted tick.
///
/// Implementations must not block: anything slow belongs on its own task
/// behind a channel.
pub trait TickListener: Send + Sync {
    fn on_tick(&self, tick: &Tick);

    /// Called when a bar finalizes for `(symbol, timeframe)`.
    fn on_bar_close(&self, _symbol: &str, _timeframe_s: u32, _bar: &OhlcBar) {}
}

// =============================================================================
// Price board
// =============================================================================

/// Per-symbol last accepted tick. Written only by the hub runloop; everyone
/// else reads value copies.
#[derive(Default)]
pub struct PriceBoard {
    inner: RwLock<HashMap<String, Tick>>,
}

impl PriceBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<Tick> {
        self.inner.read().get(symbol).cloned()
    }

    pub fn all(&self) -> HashMap<String, Tick> {
        self.inner.read().clone()
    }

    pub(crate) fn set(&self, tick: &Tick) {
        self.inner.write().insert(tick.symbol.clone(), tick.clone());
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Drop counters exported for the state snapshot.
#[derive(Default)]
pub struct HubStats {
    pub ingress_dropped: AtomicU64,
    pub event_dropped: AtomicU64,
    pub persist_dropped: AtomicU64,
    pub accepted: AtomicU64,
    pub rejected_invalid: AtomicU64,
    pub rejected_out_of_order: AtomicU64,
    egress_dropped: RwLock<HashMap<u64, Arc<AtomicU64>>>,
}

impl HubStats {
    /// Per-subscriber egress drop counts.
    pub fn egress_drops(&self) -> HashMap<u64, u64> {
        self.egress_dropped
            .read()
            .iter()
            .map(|(id, c)| (*id, c.load(Ordering::Relaxed)))
            .collect()
    }
}

// =============================================================================
// Wiring
// =============================================================================

enum HubControl {
    Subscribe {
        id: u64,
        tx: mpsc::Sender<HubEvent>,
        dropped: Arc<AtomicU64>,
    },
    Unsubscribe {
        id: u64,
    },
}

/// Cloneable producer-side handle to the hub.
#[derive(Clone)]
pub struct HubHandle {
    tick_tx: mpsc::Sender<Tick>,
    event_tx: mpsc::Sender<HubEvent>,
    control_tx: mpsc::UnboundedSender<HubControl>,
    next_subscriber: Arc<AtomicU64>,
    pub prices: Arc<PriceBoard>,
    pub stats: Arc<HubStats>,
    pub mt5_mode: Arc<AtomicBool>,
}

impl HubHandle {
    /// Non-blocking tick ingress. Overflow increments a counter and drops.
    pub fn publish_tick(&self, tick: Tick) -> bool {
        match self.tick_tx.try_send(tick) {
            Ok(()) => true,
            Err(_) => {
                self.stats.ingress_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Non-blocking event ingress for position/account events.
    pub fn publish_event(&self, event: HubEvent) {
        if self.event_tx.try_send(event).is_err() {
            self.stats.event_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Register a new subscriber and return its egress receiver.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(EGRESS_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));
        self.stats
            .egress_dropped
            .write()
            .insert(id, dropped.clone());
        // An unbounded control channel: subscribe/unsubscribe must never be
        // lost to backpressure.
        let _ = self.control_tx.send(HubControl::Subscribe { id, tx, dropped });
        Subscription {
            id,
            rx,
            control_tx: self.control_tx.clone(),
        }
    }
}

/// A live subscription. Unsubscribes on drop; the egress channel is closed
/// exactly once, by the runloop removing the sender.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<HubEvent>,
    control_tx: mpsc::UnboundedSender<HubControl>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.control_tx.send(HubControl::Unsubscribe { id: self.id });
    }
}

// =============================================================================
// Runloop
// =============================================================================

struct SubscriberState {
    tx: mpsc::Sender<HubEvent>,
    dropped: Arc<AtomicU64>,
    /// Per-symbol last broadcast time for throttling.
    last_emit: HashMap<String, i64>,
}

pub struct HubRunloop {
    tick_rx: mpsc::Receiver<Tick>,
    event_rx: mpsc::Receiver<HubEvent>,
    control_rx: mpsc::UnboundedReceiver<HubControl>,
    listeners: Vec<Arc<dyn TickListener>>,
    ohlc: Arc<OhlcCache>,
    persist_tx: mpsc::Sender<Tick>,
    prices: Arc<PriceBoard>,
    stats: Arc<HubStats>,
    mt5_mode: Arc<AtomicBool>,
    throttle_ms: i64,
    clock: Arc<Clock>,
    subscribers: HashMap<u64, SubscriberState>,
    /// Acceptance watermark per (symbol, lp).
    last_accepted: HashMap<(String, String), i64>,
    shutdown: watch::Receiver<bool>,
}

/// Build the hub: returns the producer handle and the (not yet spawned)
/// runloop. Listeners are attached before `run` is spawned.
pub fn hub(
    ohlc: Arc<OhlcCache>,
    persist_tx: mpsc::Sender<Tick>,
    throttle_ms: u64,
    mt5_mode: bool,
    clock: Arc<Clock>,
    shutdown: watch::Receiver<bool>,
) -> (HubHandle, HubRunloop) {
    let (tick_tx, tick_rx) = mpsc::channel(INGRESS_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    let prices = Arc::new(PriceBoard::new());
    let stats = Arc::new(HubStats::default());
    let mt5 = Arc::new(AtomicBool::new(mt5_mode));

    let handle = HubHandle {
        tick_tx,
        event_tx,
        control_tx,
        next_subscriber: Arc::new(AtomicU64::new(1)),
        prices: prices.clone(),
        stats: stats.clone(),
        mt5_mode: mt5.clone(),
    };

    let runloop = HubRunloop {
        tick_rx,
        event_rx,
        control_rx,
        listeners: Vec::new(),
        ohlc,
        persist_tx,
        prices,
        stats,
        mt5_mode: mt5,
        throttle_ms: throttle_ms as i64,
        clock,
        subscribers: HashMap::new(),
        last_accepted: HashMap::new(),
        shutdown,
    };

    (handle, runloop)
}

impl HubRunloop {
    pub fn add_listener(&mut self, listener: Arc<dyn TickListener>) {
        self.listeners.push(listener);
    }

    pub async fn run(mut self) {
        info!("hub runloop started");
        loop {
            tokio::select! {
                // Control first: an unsubscribe is honored before any
                // further send to that subscriber.
                biased;

                Some(control) = self.control_rx.recv() => {
                    self.handle_control(control);
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                Some(event) = self.event_rx.recv() => {
                    self.fan_out_event(event);
                }
                maybe_tick = self.tick_rx.recv() => {
                    match maybe_tick {
                        Some(tick) => self.handle_tick(tick),
                        None => break,
                    }
                }
            }
        }

        // Drain whatever producers managed to enqueue before the signal.
        while let Ok(tick) = self.tick_rx.try_recv() {
            self.handle_tick(tick);
        }
        self.subscribers.clear();
        info!("hub runloop stopped");
    }

    fn handle_control(&mut self, control: HubControl) {
        match control {
            HubControl::Subscribe { id, tx, dropped } => {
                debug!(subscriber = id, "hub subscriber added");
                self.subscribers.insert(
                    id,
                    SubscriberState {
                        tx,
                        dropped,
                        last_emit: HashMap::new(),
                    },
                );
            }
            HubControl::Unsubscribe { id } => {
                debug!(subscriber = id, "hub subscriber removed");
                self.subscribers.remove(&id);
                self.stats.egress_dropped.write().remove(&id);
            }
        }
    }

    fn handle_tick(&mut self, tick: Tick) {
        // Validity: crossed or non-finite ticks are rejected before any
        // side effect.
        if !tick.is_valid() {
            self.stats.rejected_invalid.fetch_add(1, Ordering::Relaxed);
            warn!(symbol = %tick.symbol, bid = tick.bid, ask = tick.ask, "invalid tick rejected");
            return;
        }

        // Out-of-order drop per (symbol, lp).
        let key = (tick.symbol.clone(), tick.lp_id.clone());
        if let Some(&last) = self.last_accepted.get(&key) {
            if tick.timestamp_ms < last {
                self.stats
                    .rejected_out_of_order
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.last_accepted.insert(key, tick.timestamp_ms);
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);

        self.prices.set(&tick);

        for listener in &self.listeners {
            listener.on_tick(&tick);
        }

        for (tf, bar) in self.ohlc.update(&tick) {
            for listener in &self.listeners {
                listener.on_bar_close(&tick.symbol, tf, &bar);
            }
        }

        if self.persist_tx.try_send(tick.clone()).is_err() {
            self.stats.persist_dropped.fetch_add(1, Ordering::Relaxed);
        }

        self.fan_out_tick(tick);
    }

    fn fan_out_tick(&mut self, tick: Tick) {
        let throttled = !self.mt5_mode.load(Ordering::Relaxed);
        let now = self.clock.now_ms();

        for state in self.subscribers.values_mut() {
            if throttled {
                if let Some(&last) = state.last_emit.get(&tick.symbol) {
                    if now - last < self.throttle_ms {
                        continue;
                    }
                }
            }
            match state.tx.try_send(HubEvent::Tick(tick.clone())) {
                Ok(()) => {
                    state.last_emit.insert(tick.symbol.clone(), now);
                }
                Err(_) => {
                    state.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn fan_out_event(&mut self, event: HubEvent) {
        for state in self.subscribers.values_mut() {
            if state.tx.try_send(event.clone()).is_err() {
                state.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

// =============================================================================
// Tick-store writer
// =============================================================================

/// Create the bounded queue feeding the tick-store writer task. The hub
/// submits with `try_send`; this task is the only live-path caller of
/// `TickStore::append`.
pub fn spawn_tick_persister(
    store: Arc<TickStore>,
    mut shutdown: watch::Receiver<bool>,
) -> mpsc::Sender<Tick> {
    let (tx, mut rx) = mpsc::channel::<Tick>(PERSIST_CAPACITY);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe_tick = rx.recv() => {
                    match maybe_tick {
                        Some(tick) => {
                            if let Err(e) = store.append(tick) {
                                warn!(error = %e, "tick persist append failed");
                            }
                        }
                        None => break,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        // Final drain + flush so shutdown loses nothing buffered.
        while let Ok(tick) = rx.try_recv() {
            let _ = store.append(tick);
        }
        store.flush();
    });
    tx
}
