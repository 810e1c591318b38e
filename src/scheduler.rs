// =============================================================================
// OrderScheduler — pending-order activation and trailing-stop updates
// =============================================================================
//
// Consumes the hub tick stream. Activation rules:
//
//   LIMIT BUY   when ask <= limit_price      (fills at the limit price)
//   LIMIT SELL  when bid >= limit_price
//   STOP BUY    when ask >= trigger_price    (fills at the market)
//   STOP SELL   when bid <= trigger_price
//   STOP_LIMIT  stop trigger converts it to a LIMIT at limit_price
//
// Engine rejections at fill time (margin etc.) leave the order REJECTED with
// the reason recorded. DAY orders expire at the UTC day boundary.
//
// Trailing stops track the best favourable close price per position and move
// the SL only in the favourable direction — never retreating. The ATR
// variant recomputes its distance on each bar close.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::engine::{Engine, PositionStatus, TrailingConfig};
use crate::indicators::atr::calculate_atr;
use crate::market_data::ohlc::{OhlcBar, OhlcCache};
use crate::market_data::Tick;
use crate::types::{OrderType, Side, TimeInForce};

struct TrailState {
    /// Best favourable close price seen since tracking began.
    best: f64,
}

pub struct OrderScheduler {
    engine: Arc<Engine>,
    ohlc: Arc<OhlcCache>,
    trails: RwLock<HashMap<u64, TrailState>>,
    /// Latest ATR per (symbol, timeframe, window), refreshed on bar close.
    atr_cache: RwLock<HashMap<(String, u32, usize), f64>>,
}

impl OrderScheduler {
    pub fn new(engine: Arc<Engine>, ohlc: Arc<OhlcCache>) -> Self {
        Self {
            engine,
            ohlc,
            trails: RwLock::new(HashMap::new()),
            atr_cache: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Pending activation
    // -------------------------------------------------------------------------

    fn evaluate_pending(&self, tick: &Tick) {
        let mut pending = self.engine.pending_orders();
        pending.sort_by_key(|o| o.id);
        let tick_day = tick.timestamp_ms / 86_400_000;

        for order in pending {
            if order.symbol != tick.symbol {
                continue;
            }

            if order.tif == TimeInForce::Day && order.placed_at / 86_400_000 < tick_day {
                debug!(order = order.id, "day order expired");
                let _ = self.engine.reject_order(order.id, "day order expired");
                continue;
            }

            match order.effective_type() {
                OrderType::Limit => {
                    let Some(limit) = order.price else { continue };
                    let hit = match order.side {
                        Side::Buy => tick.ask <= limit,
                        Side::Sell => tick.bid >= limit,
                    };
                    if hit {
                        // A limit never fills worse than its price.
                        if let Err(e) = self.engine.fill_pending_order(order.id, limit) {
                            warn!(order = order.id, error = %e, "limit activation rejected");
                        }
                    }
                }
                OrderType::Stop => {
                    let Some(trigger) = order.trigger_price else { continue };
                    let (hit, fill) = match order.side {
                        Side::Buy => (tick.ask >= trigger, tick.ask),
                        Side::Sell => (tick.bid <= trigger, tick.bid),
                    };
                    if hit {
                        if let Err(e) = self.engine.fill_pending_order(order.id, fill) {
                            warn!(order = order.id, error = %e, "stop activation rejected");
                        }
                    }
                }
                OrderType::StopLimit => {
                    // Still waiting on the stop leg.
                    let Some(trigger) = order.trigger_price else { continue };
                    let stop_hit = match order.side {
                        Side::Buy => tick.ask >= trigger,
                        Side::Sell => tick.bid <= trigger,
                    };
                    if stop_hit {
                        if let Err(e) = self.engine.mark_order_activated(order.id) {
                            warn!(order = order.id, error = %e, "stop-limit activation failed");
                            continue;
                        }
                        // The limit leg may already be satisfied on this tick.
                        let Some(limit) = order.price else { continue };
                        let limit_hit = match order.side {
                            Side::Buy => tick.ask <= limit,
                            Side::Sell => tick.bid >= limit,
                        };
                        if limit_hit {
                            if let Err(e) = self.engine.fill_pending_order(order.id, limit) {
                                warn!(order = order.id, error = %e, "stop-limit fill rejected");
                            }
                        }
                    }
                }
                OrderType::Market => {}
            }
        }
    }

    // -------------------------------------------------------------------------
    // Trailing stops
    // -------------------------------------------------------------------------

    fn trailing_distance(&self, symbol: &str, config: &TrailingConfig) -> Option<f64> {
        match *config {
            TrailingConfig::Fixed { distance } => Some(distance),
            TrailingConfig::Step { distance, .. } => Some(distance),
            TrailingConfig::Atr { k, window, timeframe_s } => self
                .atr_cache
                .read()
                .get(&(symbol.to_string(), timeframe_s, window))
                .map(|atr| k * atr),
        }
    }

    fn evaluate_trailing(&self, tick: &Tick) {
        let positions = self.engine.open_positions(None);
        let mut trails = self.trails.write();

        // Drop state for positions that no longer exist or closed.
        trails.retain(|id, _| {
            positions
                .iter()
                .any(|p| p.id == *id && p.status == PositionStatus::Open)
        });

        for position in positions {
            if position.symbol != tick.symbol {
                continue;
            }
            let Some(config) = position.trailing else { continue };
            let Some(distance) = self.trailing_distance(&position.symbol, &config) else {
                continue;
            };

            // The favourable mark is the side a close would fill at.
            let mark = position.close_side_price(tick.bid, tick.ask);
            let state = trails.entry(position.id).or_insert(TrailState { best: mark });
            match position.side {
                Side::Buy => state.best = state.best.max(mark),
                Side::Sell => state.best = state.best.min(mark),
            }

            let candidate = match position.side {
                Side::Buy => state.best - distance,
                Side::Sell => state.best + distance,
            };

            let improves = match (position.side, position.sl) {
                (Side::Buy, Some(sl)) => candidate > sl,
                (Side::Sell, Some(sl)) => candidate < sl,
                (_, None) => true,
            };
            if !improves {
                continue;
            }

            if let TrailingConfig::Step { step_size, .. } = config {
                let moved_enough = match (position.side, position.sl) {
                    (Side::Buy, Some(sl)) => candidate - sl >= step_size,
                    (Side::Sell, Some(sl)) => sl - candidate >= step_size,
                    (_, None) => true,
                };
                if !moved_enough {
                    continue;
                }
            }

            debug!(
                position = position.id,
                sl = candidate,
                best = state.best,
                "trailing stop advanced"
            );
            if let Err(e) = self.engine.trail_stop_loss(position.id, candidate) {
                warn!(position = position.id, error = %e, "trailing stop update failed");
            }
        }
    }

    fn refresh_atr(&self, symbol: &str, timeframe_s: u32) {
        // Only recompute windows some open position actually uses.
        let windows: Vec<usize> = self
            .engine
            .open_positions(None)
            .iter()
            .filter(|p| p.symbol == symbol)
            .filter_map(|p| match p.trailing {
                Some(TrailingConfig::Atr { window, timeframe_s: tf, .. }) if tf == timeframe_s => {
                    Some(window)
                }
                _ => None,
            })
            .collect();

        for window in windows {
            let mut bars: Vec<OhlcBar> = self.ohlc.history(symbol, timeframe_s, window + 1);
            // The final element is the in-progress bar; ATR uses closed bars.
            bars.pop();
            if let Some(atr) = calculate_atr(&bars, window) {
                self.atr_cache
                    .write()
                    .insert((symbol.to_string(), timeframe_s, window), atr);
            }
        }
    }
}

impl crate::hub::TickListener for OrderScheduler {
    fn on_tick(&self, tick: &Tick) {
        self.evaluate_pending(tick);
        self.evaluate_trailing(tick);
    }

    fn on_bar_close(&self, symbol: &str, timeframe_s: u32, _bar: &OhlcBar) {
        self.refresh_atr(symbol, timeframe_s);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, IdGen};
    use crate::engine::OrderStatus;
    use crate::hub::{hub, HubHandle, TickListener};
    use crate::ledger::Ledger;
    use crate::market_data::SymbolSpec;
    use crate::types::PositionMode;
    use tokio::sync::{mpsc, watch};

    struct Fixture {
        engine: Arc<Engine>,
        scheduler: OrderScheduler,
        hub: HubHandle,
        ohlc: Arc<OhlcCache>,
        account: u64,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ids = Arc::new(IdGen::new());
        let clock = Arc::new(Clock::new());
        let ledger = Arc::new(Ledger::new(
            dir.path().join("ledger.jsonl"),
            ids.clone(),
            clock.clone(),
        ));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (persist_tx, _persist_rx) = mpsc::channel(64);
        let ohlc = Arc::new(OhlcCache::new(500));
        let (handle, _runloop) = hub(
            ohlc.clone(),
            persist_tx,
            40,
            true,
            clock.clone(),
            shutdown_rx,
        );
        let engine = Arc::new(Engine::new(ledger, handle.clone(), ids, clock, 0.50));
        engine
            .register_symbol(SymbolSpec {
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
            })
            .unwrap();
        let account = engine
            .create_account("trader", &"ab".repeat(32), 100, false, PositionMode::Hedging, "")
            .unwrap()
            .id;
        engine
            .deposit(account, 10_000.0, "wire", "", "", "admin")
            .unwrap();
        let scheduler = OrderScheduler::new(engine.clone(), ohlc.clone());
        Fixture {
            engine,
            scheduler,
            hub: handle,
            ohlc,
            account,
            _dir: dir,
        }
    }

    fn tick(bid: f64, ask: f64, ts: i64) -> Tick {
        Tick {
            symbol: "EURUSD".into(),
            bid,
            ask,
            timestamp_ms: ts,
            lp_id: "test".into(),
        }
    }

    fn feed(f: &Fixture, t: &Tick) {
        f.hub.prices.set(t);
        f.scheduler.on_tick(t);
    }

    #[test]
    fn limit_buy_activates_when_ask_touches() {
        // BUY LIMIT 0.10 at 1.09500 while the market sits at
        // 1.10000/1.10020, then a tick with ask == limit.
        let f = fixture();
        f.hub.prices.set(&tick(1.10000, 1.10020, 0));
        let order = f
            .engine
            .submit_pending(
                f.account,
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

        // Not yet.
        feed(&f, &tick(1.09600, 1.09620, 1));
        assert_eq!(
            f.engine.order(order.id).unwrap().status,
            OrderStatus::Pending
        );

        // ask == limit triggers and fills at the limit price.
        feed(&f, &tick(1.09490, 1.09500, 2));
        let order = f.engine.order(order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.fill_price, Some(1.09500));
    }

    #[test]
    fn stop_sell_triggers_on_bid() {
        let f = fixture();
        f.hub.prices.set(&tick(1.10000, 1.10020, 0));
        let order = f
            .engine
            .submit_pending(
                f.account,
                "EURUSD",
                Side::Sell,
                OrderType::Stop,
                0.10,
                None,
                Some(1.09800),
                None,
                None,
                TimeInForce::Gtc,
                None,
            )
            .unwrap();

        feed(&f, &tick(1.09850, 1.09870, 1));
        assert_eq!(
            f.engine.order(order.id).unwrap().status,
            OrderStatus::Pending
        );

        feed(&f, &tick(1.09790, 1.09810, 2));
        let order = f.engine.order(order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.fill_price, Some(1.09790));
    }

    #[test]
    fn stop_limit_converts_then_fills() {
        let f = fixture();
        f.hub.prices.set(&tick(1.10000, 1.10020, 0));
        // BUY stop at 1.10100 with limit 1.10150.
        let order = f
            .engine
            .submit_pending(
                f.account,
                "EURUSD",
                Side::Buy,
                OrderType::StopLimit,
                0.10,
                Some(1.10150),
                Some(1.10100),
                None,
                None,
                TimeInForce::Gtc,
                None,
            )
            .unwrap();

        // Stop fires; ask 1.10120 <= limit 1.10150 so the limit leg fills
        // on the same tick.
        feed(&f, &tick(1.10100, 1.10120, 1));
        let order = f.engine.order(order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.fill_price, Some(1.10150));
    }

    #[test]
    fn day_order_expires_at_utc_boundary() {
        let f = fixture();
        f.hub.prices.set(&tick(1.10000, 1.10020, 0));
        let order = f
            .engine
            .submit_pending(
                f.account,
                "EURUSD",
                Side::Buy,
                OrderType::Limit,
                0.10,
                Some(1.09500),
                None,
                None,
                None,
                TimeInForce::Day,
                None,
            )
            .unwrap();

        // A tick from the next UTC day (placed_at is wall-clock "now").
        let next_day = f.engine.order(order.id).unwrap().placed_at + 86_400_000;
        feed(&f, &tick(1.09900, 1.09920, next_day));
        let order = f.engine.order(order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert!(order.reject_reason.unwrap().contains("expired"));
    }

    #[test]
    fn margin_rejection_records_reason() {
        let f = fixture();
        f.hub.prices.set(&tick(1.10000, 1.10020, 0));
        let order = f
            .engine
            .submit_pending(
                f.account,
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
        // Drain the balance so the fill cannot margin.
        f.engine
            .withdraw(f.account, 10_000.0, "", "", "admin")
            .unwrap();

        feed(&f, &tick(1.09490, 1.09500, 1));
        let order = f.engine.order(order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert!(order.reject_reason.unwrap().contains("insufficient margin"));
    }

    #[test]
    fn fixed_trailing_never_retreats() {
        let f = fixture();
        f.hub.prices.set(&tick(1.10000, 1.10020, 0));
        let (_, position) = f
            .engine
            .execute_market(f.account, "EURUSD", Side::Buy, 0.10, None, None, None)
            .unwrap();
        f.engine
            .set_trailing(position.id, Some(TrailingConfig::Fixed { distance: 0.00050 }))
            .unwrap();

        // Favourable move: bid 1.10100 -> SL 1.10050.
        feed(&f, &tick(1.10100, 1.10120, 1));
        let p = f.engine.position(position.id).unwrap();
        assert_eq!(p.sl, Some(1.10100 - 0.00050));

        // Retreat: bid 1.10050 — SL must not move back.
        feed(&f, &tick(1.10050, 1.10070, 2));
        let p = f.engine.position(position.id).unwrap();
        assert_eq!(p.sl, Some(1.10050));

        // New high advances it again.
        feed(&f, &tick(1.10200, 1.10220, 3));
        let p = f.engine.position(position.id).unwrap();
        assert_eq!(p.sl, Some(1.10150));
    }

    #[test]
    fn step_trailing_moves_in_steps() {
        let f = fixture();
        f.hub.prices.set(&tick(1.10000, 1.10020, 0));
        let (_, position) = f
            .engine
            .execute_market(f.account, "EURUSD", Side::Buy, 0.10, None, None, None)
            .unwrap();
        f.engine
            .set_trailing(
                position.id,
                Some(TrailingConfig::Step {
                    distance: 0.00050,
                    step_size: 0.00030,
                }),
            )
            .unwrap();

        feed(&f, &tick(1.10100, 1.10120, 1));
        let sl_after_first = f.engine.position(position.id).unwrap().sl.unwrap();
        assert!((sl_after_first - 1.10050).abs() < 1e-9);

        // +0.00010 improvement: below the step, SL holds.
        feed(&f, &tick(1.10110, 1.10130, 2));
        assert_eq!(f.engine.position(position.id).unwrap().sl, Some(sl_after_first));

        // +0.00040 improvement: exceeds the step, SL advances.
        feed(&f, &tick(1.10140, 1.10160, 3));
        let p = f.engine.position(position.id).unwrap();
        assert!((p.sl.unwrap() - 1.10090).abs() < 1e-9);
    }

    #[test]
    fn atr_trailing_uses_bar_close_distance() {
        let f = fixture();
        f.hub.prices.set(&tick(1.10000, 1.10020, 0));
        let (_, position) = f
            .engine
            .execute_market(f.account, "EURUSD", Side::Buy, 0.10, None, None, None)
            .unwrap();
        f.engine
            .set_trailing(
                position.id,
                Some(TrailingConfig::Atr {
                    k: 2.0,
                    window: 3,
                    timeframe_s: 60,
                }),
            )
            .unwrap();

        // Build 1m bars with a constant 0.001 range so ATR ~= 0.001.
        for i in 0..6 {
            let base = 1.10000;
            let ts = i * 60_000;
            f.ohlc.update(&tick(base - 0.0005, base - 0.0005, ts));
            f.ohlc.update(&tick(base + 0.0005, base + 0.0005, ts + 1_000));
            f.ohlc.update(&tick(base, base, ts + 2_000));
        }
        f.scheduler.refresh_atr("EURUSD", 60);

        // No ATR entry for unused windows.
        assert!(f
            .scheduler
            .atr_cache
            .read()
            .get(&("EURUSD".to_string(), 60, 3))
            .is_some());

        feed(&f, &tick(1.10500, 1.10520, 400_000));
        let p = f.engine.position(position.id).unwrap();
        let sl = p.sl.unwrap();
        // distance = 2 * ATR ~= 0.002
        assert!((sl - (1.10500 - 0.002)).abs() < 5e-4, "sl was {sl}");
    }
}
