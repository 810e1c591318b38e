// =============================================================================
// Meridian FX Engine — Main Entry Point
// =============================================================================
//
// Wires the subsystems together and supervises their tasks:
//
//   LP adapters -> LPManager -> Hub runloop -> { TickStore, OHLC, Engine,
//   OrderScheduler, subscribers } ; Router -> { Engine | FIX -> Engine }
//
// Shutdown ordering: hub first, then scheduler/engine (tick callbacks stop
// with the hub), persistence flush, FIX logout (bounded wait), adapters
// last.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meridian_engine::api;
use meridian_engine::app_state::AppState;
use meridian_engine::clock::{Clock, IdGen};
use meridian_engine::config::EngineConfig;
use meridian_engine::engine::{Engine, LpExecution, LpExecutionOutcome};
use meridian_engine::fix::message::*;
use meridian_engine::fix::session::{spawn_session, AppMessage, SessionConfig};
use meridian_engine::fix::store::SessionStore;
use meridian_engine::hub::{hub, spawn_tick_persister};
use meridian_engine::ledger::Ledger;
use meridian_engine::lp::fix_backed::FixBackedAdapter;
use meridian_engine::lp::rest_poll::RestPollAdapter;
use meridian_engine::lp::websocket::WsStreamAdapter;
use meridian_engine::lp::LpManager;
use meridian_engine::market_data::ohlc::OhlcCache;
use meridian_engine::market_data::tick_store::TickStore;
use meridian_engine::market_data::SymbolSpec;
use meridian_engine::router::Router;
use meridian_engine::scheduler::OrderScheduler;
use meridian_engine::shutdown::Shutdown;
use meridian_engine::supervisor::spawn_supervised;

/// Instruments registered at startup.
fn default_symbol_specs() -> Vec<SymbolSpec> {
    let fx = |symbol: &str, digits: u32| SymbolSpec {
        symbol: symbol.into(),
        contract_size: 100_000.0,
        digits,
        min_volume: 0.01,
        max_volume: 100.0,
        volume_step: 0.01,
        margin_rate: 0.01,
        swap_long: -0.5,
        swap_short: 0.1,
        commission_per_lot: 0.0,
        base_currency: symbol[..3].into(),
        quote_currency: symbol[3..].into(),
        enabled: true,
    };
    vec![
        fx("EURUSD", 5),
        fx("GBPUSD", 5),
        fx("USDJPY", 3),
        fx("AUDUSD", 5),
        SymbolSpec {
            symbol: "XAUUSD".into(),
            contract_size: 100.0,
            digits: 2,
            min_volume: 0.01,
            max_volume: 50.0,
            volume_step: 0.01,
            margin_rate: 0.01,
            swap_long: -1.2,
            swap_short: 0.4,
            commission_per_lot: 0.0,
            base_currency: "XAU".into(),
            quote_currency: "USD".into(),
            enabled: true,
        },
        SymbolSpec {
            symbol: "BTCUSD".into(),
            contract_size: 1.0,
            digits: 2,
            min_volume: 0.01,
            max_volume: 10.0,
            volume_step: 0.01,
            margin_rate: 0.10,
            swap_long: -5.0,
            swap_short: -5.0,
            commission_per_lot: 0.0,
            base_currency: "BTC".into(),
            quote_currency: "USD".into(),
            enabled: true,
        },
    ]
}

/// Map an inbound ExecutionReport / OrderCancelReject to the engine's
/// application-level report.
fn lp_execution_from(msg: &AppMessage) -> Option<LpExecution> {
    let client_ref = msg.get(TAG_CL_ORD_ID)?.to_string();
    let lp_order_id = msg.get(TAG_ORDER_ID).unwrap_or_default().to_string();
    match msg.msg_type {
        MsgType::ExecutionReport => match msg.get(TAG_EXEC_TYPE)? {
            // F = Trade.
            "F" => Some(LpExecution {
                client_ref,
                lp_order_id,
                outcome: LpExecutionOutcome::Fill {
                    price: msg.get_f64(TAG_LAST_PX).or_else(|| msg.get_f64(TAG_AVG_PX))?,
                    volume: msg.get_f64(TAG_LAST_QTY)?,
                },
            }),
            // 8 = Rejected.
            "8" => Some(LpExecution {
                client_ref,
                lp_order_id,
                outcome: LpExecutionOutcome::Reject {
                    reason: msg.get(TAG_TEXT).unwrap_or("lp rejected").to_string(),
                },
            }),
            _ => None,
        },
        MsgType::OrderCancelReject | MsgType::BusinessReject => Some(LpExecution {
            client_ref,
            lp_order_id,
            outcome: LpExecutionOutcome::Reject {
                reason: msg.get(TAG_TEXT).unwrap_or("lp rejected").to_string(),
            },
        }),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           Meridian FX Engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load("engine_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });
    config.apply_env_overrides();
    info!(
        tickstore = %config.tickstore_dir,
        fixstore = %config.fixstore_dir,
        mt5_mode = config.mt5_mode,
        "configuration resolved"
    );

    // ── 2. Core plumbing ─────────────────────────────────────────────────
    let shutdown = Arc::new(Shutdown::new());
    let clock = Arc::new(Clock::new());
    let ids = Arc::new(IdGen::new());

    let tick_store = Arc::new(TickStore::new(
        config.tickstore_dir.clone(),
        config.tick_ring_capacity,
    ));
    let ohlc = Arc::new(OhlcCache::new(config.ohlc_bar_capacity));
    let persist_tx = spawn_tick_persister(tick_store.clone(), shutdown.subscribe());

    let (hub_handle, mut hub_runloop) = hub(
        ohlc.clone(),
        persist_tx,
        config.hub_throttle_ms,
        config.mt5_mode,
        clock.clone(),
        shutdown.subscribe(),
    );

    // ── 3. Ledger & engine ───────────────────────────────────────────────
    let ledger = Arc::new(Ledger::new(
        config.ledger_journal.clone(),
        ids.clone(),
        clock.clone(),
    ));
    match ledger.load() {
        Ok(count) => info!(entries = count, "ledger replayed"),
        Err(e) => {
            error!(error = %e, "ledger journal replay failed");
            return Err(anyhow::anyhow!("unusable ledger journal: {e}"));
        }
    }

    let engine = Arc::new(Engine::new(
        ledger.clone(),
        hub_handle.clone(),
        ids.clone(),
        clock.clone(),
        config.stop_out_level,
    ));
    for spec in default_symbol_specs() {
        if let Err(e) = engine.register_symbol(spec) {
            warn!(error = %e, "symbol registration failed");
        }
    }

    let scheduler = Arc::new(OrderScheduler::new(engine.clone(), ohlc.clone()));
    hub_runloop.add_listener(engine.clone());
    hub_runloop.add_listener(scheduler.clone());
    tokio::spawn(hub_runloop.run());

    // ── 4. Routing & liquidity ───────────────────────────────────────────
    let router = Arc::new(Router::new());
    let lp_manager = Arc::new(LpManager::new(
        hub_handle.clone(),
        clock.clone(),
        config.lp_staleness_ms,
    ));

    let symbols: Vec<String> = engine
        .symbol_specs()
        .into_iter()
        .map(|s| s.symbol)
        .collect();

    // REST-poll adapter (currency broker style).
    if let Ok(base_url) = std::env::var("LP_REST_URL") {
        let adapter = Arc::new(RestPollAdapter::new(
            "rest-primary",
            base_url,
            std::env::var("LP_REST_KEY").unwrap_or_default(),
            std::env::var("LP_REST_SECRET").unwrap_or_default(),
            std::time::Duration::from_millis(500),
            lp_manager.quote_sender(),
            clock.clone(),
        ));
        lp_manager.register(adapter, 2, true)?;
    }

    // WebSocket adapter (crypto exchange style).
    if let Ok(url) = std::env::var("LP_WS_URL") {
        let adapter = Arc::new(WsStreamAdapter::new(
            "ws-crypto",
            url,
            lp_manager.quote_sender(),
            clock.clone(),
        ));
        lp_manager.register(adapter, 3, true)?;
    }

    // ── 5. FIX session + FIX-backed adapter ──────────────────────────────
    let mut fix_sessions: HashMap<String, _> = HashMap::new();
    if let Ok(host) = std::env::var("FIX_HOST") {
        let session_config = SessionConfig {
            session_id: std::env::var("FIX_SESSION_ID").unwrap_or_else(|_| "lp-fix".into()),
            host,
            port: std::env::var("FIX_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(9878),
            sender_comp_id: std::env::var("FIX_SENDER").unwrap_or_else(|_| "MERIDIAN".into()),
            target_comp_id: std::env::var("FIX_TARGET").unwrap_or_else(|_| "LPBANK".into()),
            heartbeat_s: config.fix_heartbeat_s,
            gap_grace_ms: config.fix_gap_grace_ms,
            recovery_timeout_ms: 30_000,
            logon_timeout_ms: 10_000,
            message_ttl_days: config.fix_message_ttl_days,
        };
        let store = SessionStore::new(&config.fixstore_dir, &session_config.session_id);
        let (app_tx, mut app_rx) = tokio::sync::mpsc::channel::<AppMessage>(1024);
        let handle = spawn_session(
            session_config,
            store,
            clock.clone(),
            app_tx,
            shutdown.subscribe(),
        );

        let fix_adapter = Arc::new(FixBackedAdapter::new(
            "lp-fix",
            handle.clone(),
            lp_manager.quote_sender(),
            clock.clone(),
        ));
        lp_manager.register(fix_adapter.clone(), 1, true)?;
        fix_sessions.insert("lp-fix".to_string(), handle);

        // Application dispatcher: execution reports to the engine, market
        // data to the FIX-backed adapter.
        let dispatch_engine = engine.clone();
        let mut dispatch_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_msg = app_rx.recv() => {
                        let Some(msg) = maybe_msg else { break };
                        match msg.msg_type {
                            MsgType::MarketDataSnapshot | MsgType::MarketDataIncremental => {
                                fix_adapter.handle_app_message(&msg);
                            }
                            _ => {
                                if let Some(report) = lp_execution_from(&msg) {
                                    if let Err(e) = dispatch_engine.apply_execution_report(report) {
                                        warn!(error = %e, "execution report not applied");
                                    }
                                }
                            }
                        }
                    }
                    changed = dispatch_shutdown.changed() => {
                        if changed.is_err() || *dispatch_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    // Persisted priorities/enabled bits override the registration defaults.
    if let Err(e) = lp_manager.load_config("lp_config.json") {
        warn!(error = %e, "lp config not loaded, using registration defaults");
    }
    lp_manager.start_aggregation(symbols, shutdown.subscribe());

    // ── 6. Application state & API server ────────────────────────────────
    let state = Arc::new(AppState::new(
        config.clone(),
        clock.clone(),
        ids.clone(),
        hub_handle.clone(),
        tick_store.clone(),
        ohlc.clone(),
        ledger.clone(),
        engine.clone(),
        scheduler.clone(),
        router.clone(),
        lp_manager.clone(),
    ));
    for (lp_id, handle) in fix_sessions {
        state.fix_sessions.write().insert(lp_id, handle);
    }

    let bind_addr = config.bind_addr.clone();
    let api_state = state.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .expect("API server failed");
    });

    // ── 7. Persistence & housekeeping loops ──────────────────────────────
    {
        let store = tick_store.clone();
        let ohlc = ohlc.clone();
        let ohlc_dir = std::path::PathBuf::from(config.ohlc_dir.clone());
        let flush_interval = std::time::Duration::from_secs(config.flush_interval_s);
        spawn_supervised("persistence-flush", shutdown.subscribe(), move || {
            let store = store.clone();
            let ohlc = ohlc.clone();
            let ohlc_dir = ohlc_dir.clone();
            async move {
                let mut ticker = tokio::time::interval(flush_interval);
                loop {
                    ticker.tick().await;
                    store.flush();
                    ohlc.flush(&ohlc_dir);
                }
            }
        });
    }
    {
        let store = tick_store.clone();
        let swap_engine = engine.clone();
        let max_days = config.tickstore_max_days;
        spawn_supervised("daily-housekeeping", shutdown.subscribe(), move || {
            let store = store.clone();
            let swap_engine = swap_engine.clone();
            async move {
                let mut ticker =
                    tokio::time::interval(std::time::Duration::from_secs(86_400));
                ticker.tick().await; // the first tick fires immediately
                loop {
                    ticker.tick().await;
                    let removed = store.cleanup(max_days);
                    let charged = swap_engine.apply_daily_swap();
                    info!(removed, charged, "daily housekeeping complete");
                }
            }
        });
    }

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    // Hub, scheduler and engine stop with the shared signal; FIX sessions
    // send Logout and get a bounded window to flush it.
    shutdown.trigger();
    tokio::time::sleep(std::time::Duration::from_secs(6)).await;

    lp_manager.shutdown().await;
    tick_store.flush();
    ohlc.flush(std::path::Path::new(&config.ohlc_dir));
    if let Err(e) = lp_manager.save_config("lp_config.json") {
        warn!(error = %e, "failed to save lp config on shutdown");
    }

    info!("Meridian FX Engine shut down complete.");
    Ok(())
}
