// =============================================================================
// End-to-end scenarios across the full tick pipeline
// =============================================================================
//
// These drive the hub runloop with live channels: LP quotes enter through
// the ingress, the engine and scheduler react as tick listeners, and the
// ledger records the money movements.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use meridian_engine::clock::{Clock, IdGen};
use meridian_engine::engine::{Engine, OrderStatus, PositionStatus};
use meridian_engine::error::CoreResult;
use meridian_engine::hub::{hub, spawn_tick_persister, HubEvent, HubHandle};
use meridian_engine::ledger::Ledger;
use meridian_engine::lp::{LpAdapter, LpManager};
use meridian_engine::market_data::ohlc::OhlcCache;
use meridian_engine::market_data::tick_store::TickStore;
use meridian_engine::market_data::{Quote, SymbolSpec, Tick};
use meridian_engine::scheduler::OrderScheduler;
use meridian_engine::types::{OrderType, PositionMode, Side, TimeInForce};

struct Stack {
    hub: HubHandle,
    engine: Arc<Engine>,
    tick_store: Arc<TickStore>,
    shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

fn eurusd() -> SymbolSpec {
    SymbolSpec {
        symbol: "EURUSD".into(),
        contract_size: 100_000.0,
        digits: 5,
        min_volume: 0.01,
        max_volume: 100.0,
        volume_step: 0.01,
        margin_rate: 0.01,
        swap_long: 0.0,
        swap_short: 0.0,
        commission_per_lot: 0.0,
        base_currency: "EUR".into(),
        quote_currency: "USD".into(),
        enabled: true,
    }
}

/// Boot the pipeline: tick persister, hub runloop, engine + scheduler as
/// listeners. MT5 mode is on so every tick reaches subscribers.
async fn boot() -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(Clock::new());
    let ids = Arc::new(IdGen::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tick_store = Arc::new(TickStore::new(dir.path().join("ticks"), 50_000));
    let ohlc = Arc::new(OhlcCache::new(500));
    let persist_tx = spawn_tick_persister(tick_store.clone(), shutdown_rx.clone());

    let (handle, mut runloop) = hub(
        ohlc.clone(),
        persist_tx,
        40,
        true,
        clock.clone(),
        shutdown_rx,
    );

    let ledger = Arc::new(Ledger::new(
        dir.path().join("ledger.jsonl"),
        ids.clone(),
        clock.clone(),
    ));
    let engine = Arc::new(Engine::new(ledger, handle.clone(), ids, clock, 0.50));
    engine.register_symbol(eurusd()).unwrap();

    let scheduler = Arc::new(OrderScheduler::new(engine.clone(), ohlc));
    runloop.add_listener(engine.clone());
    runloop.add_listener(scheduler);
    tokio::spawn(runloop.run());

    Stack {
        hub: handle,
        engine,
        tick_store,
        shutdown: shutdown_tx,
        _dir: dir,
    }
}

async fn funded_account(stack: &Stack, balance: f64) -> u64 {
    let snap = stack
        .engine
        .create_account("trader", &"ab".repeat(32), 100, false, PositionMode::Hedging, "")
        .unwrap();
    stack
        .engine
        .deposit(snap.id, balance, "wire", "", "", "admin")
        .unwrap();
    snap.id
}

fn tick(bid: f64, ask: f64, ts: i64) -> Tick {
    Tick {
        symbol: "EURUSD".into(),
        bid,
        ask,
        timestamp_ms: ts,
        lp_id: "lpa".into(),
    }
}

/// Publish through the hub ingress and give the runloop time to process.
async fn feed(stack: &Stack, t: Tick) {
    assert!(stack.hub.publish_tick(t));
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
}

// =============================================================================
// Open and close a profitable BUY
// =============================================================================

#[tokio::test]
async fn open_close_profit_through_pipeline() {
    let stack = boot().await;
    let account = funded_account(&stack, 10_000.0).await;

    feed(&stack, tick(1.10000, 1.10020, 1_000)).await;

    let (order, position) = stack
        .engine
        .execute_market(account, "EURUSD", Side::Buy, 0.10, None, None, None)
        .unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(position.open_price, 1.10020);

    let snap = stack.engine.account_snapshot(account).unwrap();
    assert!((snap.margin_used - 110.02).abs() < 1e-9);

    feed(&stack, tick(1.10100, 1.10120, 2_000)).await;

    let closed = stack
        .engine
        .close_position(position.id, None, "Manual")
        .unwrap();
    assert!((closed.realized_pnl - 8.0).abs() < 1e-9);

    let snap = stack.engine.account_snapshot(account).unwrap();
    assert!((snap.balance - 10_008.0).abs() < 1e-9);
    assert_eq!(snap.margin_used, 0.0);

    // Ledger invariant: entry sum equals the cached balance.
    let total: f64 = stack
        .engine
        .ledger()
        .entries(account, 100)
        .iter()
        .map(|e| e.amount_signed)
        .sum();
    assert!((total - snap.balance).abs() < 1e-9);

    stack.shutdown.send(true).unwrap();
}

// =============================================================================
// Stop loss triggered by the tick stream
// =============================================================================

#[tokio::test]
async fn stop_loss_triggers_from_stream() {
    let stack = boot().await;
    let account = funded_account(&stack, 10_000.0).await;

    feed(&stack, tick(1.10000, 1.10020, 1_000)).await;
    let (_, position) = stack
        .engine
        .execute_market(account, "EURUSD", Side::Buy, 0.10, Some(1.09970), None, None)
        .unwrap();

    feed(&stack, tick(1.09965, 1.09985, 2_000)).await;

    let closed = stack.engine.position(position.id).unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.close_price, Some(1.09965));
    assert!((closed.realized_pnl - (-5.50)).abs() < 1e-9);

    let snap = stack.engine.account_snapshot(account).unwrap();
    assert!((snap.balance - 9_994.50).abs() < 1e-9);
    assert_eq!(snap.margin_used, 0.0);

    stack.shutdown.send(true).unwrap();
}

// =============================================================================
// Pending limit activation at the touch
// =============================================================================

#[tokio::test]
async fn limit_order_activates_at_touch() {
    let stack = boot().await;
    let account = funded_account(&stack, 10_000.0).await;

    feed(&stack, tick(1.10000, 1.10020, 1_000)).await;
    let order = stack
        .engine
        .submit_pending(
            account,
            "EURUSD",
            Side::Buy,
            OrderType::Limit,
            0.10,
            Some(1.09500),
            None,
            None,
            None,
            TimeInForce::Gtc,
            None,
        )
        .unwrap();

    // Market well above the limit: still pending.
    feed(&stack, tick(1.09700, 1.09720, 2_000)).await;
    assert_eq!(
        stack.engine.order(order.id).unwrap().status,
        OrderStatus::Pending
    );

    // ask == limit: activated and filled at the limit price.
    feed(&stack, tick(1.09490, 1.09500, 3_000)).await;
    let order = stack.engine.order(order.id).unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.fill_price, Some(1.09500));

    let positions = stack.engine.open_positions(Some(account));
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].open_price, 1.09500);

    stack.shutdown.send(true).unwrap();
}

// =============================================================================
// Subscriber ordering and tick persistence
// =============================================================================

#[tokio::test]
async fn subscriber_sees_acceptance_order_and_store_persists() {
    let stack = boot().await;
    let mut sub = stack.hub.subscribe();

    for i in 0..5 {
        assert!(stack.hub.publish_tick(tick(1.1, 1.1002, 1_000 + i)));
    }
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut seen = Vec::new();
    while let Ok(event) = sub.rx.try_recv() {
        if let HubEvent::Tick(t) = event {
            seen.push(t.timestamp_ms);
        }
    }
    assert_eq!(seen, vec![1_000, 1_001, 1_002, 1_003, 1_004]);

    // The persister fed the store through its queue.
    let history = stack.tick_store.history("EURUSD", 10).unwrap();
    assert_eq!(history.len(), 5);
    assert!(history
        .windows(2)
        .all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));

    stack.shutdown.send(true).unwrap();
}

// =============================================================================
// LP priority selection through the aggregation pipeline
// =============================================================================

struct ScriptedAdapter {
    lp_id: String,
    connected: AtomicBool,
}

impl ScriptedAdapter {
    fn new(lp_id: &str) -> Arc<Self> {
        Arc::new(Self {
            lp_id: lp_id.into(),
            connected: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl LpAdapter for ScriptedAdapter {
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

#[tokio::test]
async fn lp_priority_selection_feeds_hub() {
    let stack = boot().await;
    let clock = Arc::new(Clock::new());
    let (lp_shutdown_tx, lp_shutdown_rx) = watch::channel(false);

    let manager = Arc::new(LpManager::new(stack.hub.clone(), clock, 2_000));
    let a = ScriptedAdapter::new("lp-a");
    let b = ScriptedAdapter::new("lp-b");
    manager.register(a.clone(), 1, true).unwrap();
    manager.register(b.clone(), 2, true).unwrap();
    manager.start_aggregation(vec!["EURUSD".into()], lp_shutdown_rx);

    let mut sub = stack.hub.subscribe();
    let quotes = manager.quote_sender();

    let quote = |lp: &str, bid: f64, ts: i64| Quote {
        lp_id: lp.into(),
        symbol: "EURUSD".into(),
        bid,
        ask: bid + 0.001,
        timestamp_ms: ts,
    };

    // A (priority 1) publishes, then B (priority 2) right after: only A's
    // tick reaches the hub.
    quotes.send(quote("lp-a", 1.1000, 0)).await.unwrap();
    quotes.send(quote("lp-b", 1.1005, 1)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;

    let mut delivered = Vec::new();
    while let Ok(event) = sub.rx.try_recv() {
        if let HubEvent::Tick(t) = event {
            delivered.push(t.lp_id.clone());
        }
    }
    assert_eq!(delivered, vec!["lp-a"]);

    // A disconnects: B's next quote is forwarded.
    a.disconnect().await;
    quotes.send(quote("lp-b", 1.1006, 2)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;

    let mut delivered = Vec::new();
    while let Ok(event) = sub.rx.try_recv() {
        if let HubEvent::Tick(t) = event {
            delivered.push(t.lp_id.clone());
        }
    }
    assert_eq!(delivered, vec!["lp-b"]);

    lp_shutdown_tx.send(true).unwrap();
    stack.shutdown.send(true).unwrap();
}

// =============================================================================
// Margin boundary through the pipeline
// =============================================================================

#[tokio::test]
async fn volume_boundaries_and_margin_rejection() {
    let stack = boot().await;
    let account = funded_account(&stack, 200.0).await;

    feed(&stack, tick(1.10000, 1.10020, 1_000)).await;

    // Exact minimum volume is accepted.
    let (_, position) = stack
        .engine
        .execute_market(account, "EURUSD", Side::Buy, 0.01, None, None, None)
        .unwrap();
    assert!((position.volume - 0.01).abs() < 1e-12);

    // One step below the minimum is rejected.
    let err = stack
        .engine
        .execute_market(account, "EURUSD", Side::Buy, 0.009, None, None, None)
        .unwrap_err();
    assert_eq!(err.code(), "volume_out_of_range");

    // More margin than the balance supports is rejected.
    let err = stack
        .engine
        .execute_market(account, "EURUSD", Side::Buy, 1.0, None, None, None)
        .unwrap_err();
    assert_eq!(err.code(), "insufficient_margin");

    stack.shutdown.send(true).unwrap();
}
