// =============================================================================
// Engine — B-Book execution against the internal ledger
// =============================================================================
//
// The engine exclusively owns accounts, positions, orders, and symbol specs.
// Fills use the hub's latest-price board: BUY at ask, SELL at bid. The whole
// of a market execution runs under the per-account lock; the only suspension
// inside the critical section is the ledger journal append, which is part of
// the transaction. Failures after the position exists are unwound in LIFO
// order.
//
// Lock order is always account mutex -> positions/orders write lock.
// =============================================================================

pub mod account;
pub mod order;
pub mod position;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::{Clock, IdGen};
use crate::error::{BusinessRule, CoreError, CoreResult};
use crate::hub::{AccountEvent, HubEvent, HubHandle, PositionEvent, TickListener};
use crate::ledger::Ledger;
use crate::market_data::{validate_symbol, SymbolSpec, Tick};
use crate::types::{OrderType, PositionMode, Side, TimeInForce};

pub use account::{Account, AccountSnapshot, AccountStatus};
pub use order::{Order, OrderStatus};
pub use position::{Position, PositionStatus, TrailingConfig};

/// Close reasons recorded on positions.
pub const REASON_MANUAL: &str = "Manual";
pub const REASON_STOP_LOSS: &str = "StopLoss";
pub const REASON_TAKE_PROFIT: &str = "TakeProfit";
pub const REASON_STOP_OUT: &str = "StopOut";

/// Outcome of an LP execution report applied to a routed order.
#[derive(Debug, Clone)]
pub enum LpExecutionOutcome {
    Fill { price: f64, volume: f64 },
    Reject { reason: String },
}

/// Application-level view of a FIX ExecutionReport (35=8) or
/// OrderCancelReject (35=9).
#[derive(Debug, Clone)]
pub struct LpExecution {
    pub client_ref: String,
    pub lp_order_id: String,
    pub outcome: LpExecutionOutcome,
}

// =============================================================================
// Engine
// =============================================================================

pub struct Engine {
    specs: RwLock<HashMap<String, SymbolSpec>>,
    accounts: RwLock<HashMap<u64, Arc<Mutex<Account>>>>,
    owners: RwLock<HashMap<String, u64>>,
    positions: RwLock<BTreeMap<u64, Position>>,
    orders: RwLock<BTreeMap<u64, Order>>,
    client_refs: Mutex<HashSet<String>>,
    ledger: Arc<Ledger>,
    hub: HubHandle,
    ids: Arc<IdGen>,
    clock: Arc<Clock>,
    stop_out_level: f64,
}

impl Engine {
    pub fn new(
        ledger: Arc<Ledger>,
        hub: HubHandle,
        ids: Arc<IdGen>,
        clock: Arc<Clock>,
        stop_out_level: f64,
    ) -> Self {
        Self {
            specs: RwLock::new(HashMap::new()),
            accounts: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
            positions: RwLock::new(BTreeMap::new()),
            orders: RwLock::new(BTreeMap::new()),
            client_refs: Mutex::new(HashSet::new()),
            ledger,
            hub,
            ids,
            clock,
            stop_out_level,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    // -------------------------------------------------------------------------
    // Symbols
    // -------------------------------------------------------------------------

    /// Register a symbol spec. Idempotent for identical specs;
    /// re-registration with a different spec is rejected.
    pub fn register_symbol(&self, spec: SymbolSpec) -> CoreResult<()> {
        validate_symbol(&spec.symbol)?;
        let mut specs = self.specs.write();
        if let Some(existing) = specs.get(&spec.symbol) {
            if *existing != spec {
                return Err(CoreError::Conflict(format!(
                    "symbol {} already registered with a different spec",
                    spec.symbol
                )));
            }
            return Ok(());
        }
        info!(symbol = %spec.symbol, "symbol registered");
        specs.insert(spec.symbol.clone(), spec);
        Ok(())
    }

    pub fn symbol_spec(&self, symbol: &str) -> Option<SymbolSpec> {
        self.specs.read().get(symbol).cloned()
    }

    pub fn symbol_specs(&self) -> Vec<SymbolSpec> {
        let mut specs: Vec<SymbolSpec> = self.specs.read().values().cloned().collect();
        specs.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        specs
    }

    // -------------------------------------------------------------------------
    // Accounts
    // -------------------------------------------------------------------------

    /// Create an account. `credential_hash` is an opaque hex SHA-256 blob —
    /// the core never sees a plaintext credential.
    pub fn create_account(
        &self,
        owner: &str,
        credential_hash: &str,
        leverage: u32,
        is_demo: bool,
        mode: PositionMode,
        group: &str,
    ) -> CoreResult<AccountSnapshot> {
        if owner.is_empty() {
            return Err(CoreError::InvalidInput("owner must not be empty".into()));
        }
        if credential_hash.len() != 64 || !credential_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CoreError::InvalidInput(
                "credential must be a 64-char hex digest".into(),
            ));
        }
        if leverage == 0 {
            return Err(CoreError::InvalidInput("leverage must be >= 1".into()));
        }

        let mut owners = self.owners.write();
        if owners.contains_key(owner) {
            return Err(CoreError::Conflict(format!("owner {owner} already exists")));
        }

        let account = Account {
            id: self.ids.next_account(),
            owner: owner.to_string(),
            leverage,
            margin_used: 0.0,
            status: AccountStatus::Active,
            is_demo,
            mode,
            mode_frozen: false,
            group: group.to_string(),
            credential_hash: credential_hash.to_lowercase(),
            created_at: self.clock.now_ms(),
        };
        let snapshot = AccountSnapshot::derive(&account, 0.0, 0.0);

        owners.insert(owner.to_string(), account.id);
        self.accounts
            .write()
            .insert(account.id, Arc::new(Mutex::new(account)));
        info!(owner, id = snapshot.id, "account created");
        Ok(snapshot)
    }

    fn account_arc(&self, account_id: u64) -> CoreResult<Arc<Mutex<Account>>> {
        self.accounts
            .read()
            .get(&account_id)
            .cloned()
            .ok_or(CoreError::NotFound {
                entity: "account",
                id: account_id.to_string(),
            })
    }

    /// Lookup for the login flow: `(account_id, credential_hash)` by owner.
    pub fn credentials_for(&self, owner: &str) -> Option<(u64, String)> {
        let id = *self.owners.read().get(owner)?;
        let arc = self.accounts.read().get(&id)?.clone();
        let hash = arc.lock().credential_hash.clone();
        Some((id, hash))
    }

    /// Change the account's netting/hedging mode. Refused once the first
    /// position has been opened.
    pub fn set_position_mode(&self, account_id: u64, mode: PositionMode) -> CoreResult<()> {
        let arc = self.account_arc(account_id)?;
        let mut account = arc.lock();
        if account.mode_frozen && account.mode != mode {
            return Err(CoreError::Conflict(format!(
                "account {account_id} position mode is frozen at {}",
                account.mode
            )));
        }
        account.mode = mode;
        Ok(())
    }

    pub fn set_account_status(&self, account_id: u64, status: AccountStatus) -> CoreResult<()> {
        let arc = self.account_arc(account_id)?;
        arc.lock().status = status;
        info!(account = account_id, status = %status, "account status changed");
        Ok(())
    }

    /// Unrealised PnL summed across the account's open positions, from the
    /// per-position marks maintained by the tick callback.
    fn account_unrealized(&self, account_id: u64) -> f64 {
        self.positions
            .read()
            .values()
            .filter(|p| p.account_id == account_id && p.status == PositionStatus::Open)
            .map(|p| p.unrealized_pnl)
            .sum()
    }

    pub fn account_snapshot(&self, account_id: u64) -> CoreResult<AccountSnapshot> {
        let arc = self.account_arc(account_id)?;
        let account = arc.lock().clone();
        let balance = self.ledger.balance(account_id);
        let unrealized = self.account_unrealized(account_id);
        Ok(AccountSnapshot::derive(&account, balance, unrealized))
    }

    /// The account's routing group, matched by routing rules.
    pub fn account_group(&self, account_id: u64) -> CoreResult<String> {
        let arc = self.account_arc(account_id)?;
        let group = arc.lock().group.clone();
        Ok(group)
    }

    pub fn account_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.accounts.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    // -------------------------------------------------------------------------
    // Money movement
    // -------------------------------------------------------------------------

    pub fn deposit(
        &self,
        account_id: u64,
        amount: f64,
        method: &str,
        reference: &str,
        note: &str,
        actor: &str,
    ) -> CoreResult<AccountSnapshot> {
        self.account_arc(account_id)?;
        self.ledger
            .deposit(account_id, amount, method, reference, note, actor)?;
        let snap = self.account_snapshot(account_id)?;
        self.publish_account_event("deposit", &snap);
        Ok(snap)
    }

    /// Withdraw under the account lock so the free-margin check and the
    /// ledger debit cannot interleave with an execution.
    pub fn withdraw(
        &self,
        account_id: u64,
        amount: f64,
        reference: &str,
        note: &str,
        actor: &str,
    ) -> CoreResult<AccountSnapshot> {
        let arc = self.account_arc(account_id)?;
        let account = arc.lock();

        let balance = self.ledger.balance(account_id);
        let equity = balance + self.account_unrealized(account_id);
        let free = equity - account.margin_used;
        if free < amount {
            return Err(BusinessRule::InsufficientMargin {
                required: amount,
                free,
            }
            .into());
        }
        self.ledger
            .withdraw(account_id, amount, reference, note, actor)?;
        drop(account);

        let snap = self.account_snapshot(account_id)?;
        self.publish_account_event("withdrawal", &snap);
        Ok(snap)
    }

    pub fn adjust(
        &self,
        account_id: u64,
        amount_signed: f64,
        reason: &str,
        actor: &str,
    ) -> CoreResult<AccountSnapshot> {
        self.account_arc(account_id)?;
        self.ledger.adjust(account_id, amount_signed, reason, actor)?;
        let snap = self.account_snapshot(account_id)?;
        self.publish_account_event("adjustment", &snap);
        Ok(snap)
    }

    pub fn bonus(
        &self,
        account_id: u64,
        amount: f64,
        reason: &str,
        actor: &str,
    ) -> CoreResult<AccountSnapshot> {
        self.account_arc(account_id)?;
        self.ledger.bonus(account_id, amount, reason, actor)?;
        let snap = self.account_snapshot(account_id)?;
        self.publish_account_event("bonus", &snap);
        Ok(snap)
    }

    // -------------------------------------------------------------------------
    // Margin arithmetic
    // -------------------------------------------------------------------------

    /// Required margin in account currency for USD-denominated accounts.
    /// `margin_rate` is the effective fraction of contract value
    /// (0.01 == 100:1); when a spec carries no rate the account leverage
    /// supplies it.
    fn margin_for(spec: &SymbolSpec, volume: f64, price: f64, leverage: u32) -> f64 {
        let rate = if spec.margin_rate > 0.0 {
            spec.margin_rate
        } else {
            1.0 / f64::from(leverage.max(1))
        };
        volume * spec.contract_size * price * rate
    }

    fn validate_stops(
        side: Side,
        price: f64,
        sl: Option<f64>,
        tp: Option<f64>,
    ) -> CoreResult<()> {
        if let Some(sl) = sl {
            let ok = match side {
                Side::Buy => sl < price,
                Side::Sell => sl > price,
            };
            if !ok {
                return Err(BusinessRule::InvalidStopLoss { sl, price }.into());
            }
        }
        if let Some(tp) = tp {
            let ok = match side {
                Side::Buy => tp > price,
                Side::Sell => tp < price,
            };
            if !ok {
                return Err(BusinessRule::InvalidTakeProfit { tp, price }.into());
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Market execution
    // -------------------------------------------------------------------------

    /// Execute a market order at the hub's current book.
    pub fn execute_market(
        &self,
        account_id: u64,
        symbol: &str,
        side: Side,
        volume: f64,
        sl: Option<f64>,
        tp: Option<f64>,
        client_ref: Option<String>,
    ) -> CoreResult<(Order, Position)> {
        let tick = self
            .hub
            .prices
            .get(symbol)
            .ok_or_else(|| BusinessRule::NoPrice(symbol.to_string()))?;
        let fill_price = match side {
            Side::Buy => tick.ask,
            Side::Sell => tick.bid,
        };
        self.open_position_at(
            account_id,
            symbol,
            side,
            volume,
            fill_price,
            sl,
            tp,
            client_ref,
            OrderType::Market,
            None,
            true,
        )
    }

    /// Shared open path for market fills, pending activations and LP fills.
    /// Runs entirely under the account lock. `record_order` is false when
    /// the caller already owns an order record it will update itself.
    #[allow(clippy::too_many_arguments)]
    fn open_position_at(
        &self,
        account_id: u64,
        symbol: &str,
        side: Side,
        volume: f64,
        fill_price: f64,
        sl: Option<f64>,
        tp: Option<f64>,
        client_ref: Option<String>,
        order_type: OrderType,
        lp_order_id: Option<String>,
        record_order: bool,
    ) -> CoreResult<(Order, Position)> {
        let spec = self
            .symbol_spec(symbol)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown symbol {symbol}")))?;
        if !spec.enabled {
            return Err(BusinessRule::SymbolDisabled(symbol.to_string()).into());
        }
        spec.validate_volume(volume)?;
        Self::validate_stops(side, fill_price, sl, tp)?;

        let arc = self.account_arc(account_id)?;
        let mut account = arc.lock();
        match account.status {
            AccountStatus::Active => {}
            _ => return Err(BusinessRule::AccountSuspended(account_id).into()),
        }

        let required = Self::margin_for(&spec, volume, fill_price, account.leverage);
        let balance = self.ledger.balance(account_id);
        let equity = balance + self.account_unrealized(account_id);
        let free = equity - account.margin_used;
        if free < required {
            return Err(BusinessRule::InsufficientMargin { required, free }.into());
        }

        // Reserve the client reference before any mutation so a duplicate
        // fails cleanly.
        let client_ref = client_ref.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        {
            let mut refs = self.client_refs.lock();
            if !refs.insert(client_ref.clone()) {
                return Err(CoreError::Conflict(format!(
                    "duplicate client reference {client_ref}"
                )));
            }
        }

        let now = self.clock.now_ms();
        let order_id = self.ids.next_order();
        let commission = spec.commission_per_lot * volume;

        // Netting merges into an existing open position on the same symbol
        // and side; hedging always opens a fresh one. Remember enough to
        // unwind in LIFO order if the commission debit fails.
        enum Applied {
            New(u64),
            Merged { id: u64, prior: Position },
        }

        let applied: Applied;
        let position_snapshot: Position;
        {
            let mut positions = self.positions.write();
            let merge_target = if account.mode == PositionMode::Netting {
                positions
                    .values()
                    .find(|p| {
                        p.account_id == account_id
                            && p.symbol == symbol
                            && p.side == side
                            && p.status == PositionStatus::Open
                    })
                    .map(|p| p.id)
            } else {
                None
            };

            match merge_target {
                Some(id) => {
                    let existing = positions.get_mut(&id).unwrap();
                    let prior = existing.clone();
                    let total = existing.volume + volume;
                    existing.open_price =
                        (existing.open_price * existing.volume + fill_price * volume) / total;
                    existing.volume = total;
                    existing.margin += required;
                    existing.commission += commission;
                    if sl.is_some() {
                        existing.sl = sl;
                    }
                    if tp.is_some() {
                        existing.tp = tp;
                    }
                    position_snapshot = existing.clone();
                    applied = Applied::Merged { id, prior };
                }
                None => {
                    let position = Position {
                        id: self.ids.next_position(),
                        account_id,
                        symbol: symbol.to_string(),
                        side,
                        volume,
                        open_price: fill_price,
                        current_price: fill_price,
                        unrealized_pnl: 0.0,
                        sl,
                        tp,
                        trailing: None,
                        swap: 0.0,
                        commission,
                        margin: required,
                        opened_at: now,
                        status: PositionStatus::Open,
                        close_price: None,
                        closed_at: None,
                        close_reason: None,
                        realized_pnl: 0.0,
                    };
                    let id = position.id;
                    position_snapshot = position.clone();
                    positions.insert(id, position);
                    applied = Applied::New(id);
                }
            }
        }

        // Commission debit is the only fallible step after the position
        // exists; unwind everything above it on failure.
        if commission > 0.0 {
            if let Err(e) = self
                .ledger
                .commission(account_id, commission, position_snapshot.id)
            {
                let mut positions = self.positions.write();
                match applied {
                    Applied::New(id) => {
                        positions.remove(&id);
                    }
                    Applied::Merged { id, prior } => {
                        positions.insert(id, prior);
                    }
                }
                drop(positions);
                self.client_refs.lock().remove(&client_ref);
                warn!(account = account_id, error = %e, "execution unwound: commission debit failed");
                return Err(e);
            }
        }

        account.margin_used += required;
        account.mode_frozen = true;
        drop(account);

        let order = Order {
            id: order_id,
            account_id,
            symbol: symbol.to_string(),
            side,
            order_type,
            volume,
            price: None,
            trigger_price: None,
            sl,
            tp,
            tif: TimeInForce::Gtc,
            status: OrderStatus::Filled,
            placed_at: now,
            fill_price: Some(fill_price),
            filled_at: Some(now),
            client_ref,
            lp_order_id,
            reject_reason: None,
        };
        if record_order {
            self.orders.write().insert(order.id, order.clone());
        }

        debug!(
            account = account_id,
            symbol,
            side = %side,
            volume,
            fill_price,
            margin = required,
            "position opened"
        );
        self.publish_position_event("opened", &position_snapshot);
        if let Ok(snap) = self.account_snapshot(account_id) {
            self.publish_account_event("margin", &snap);
        }

        Ok((order, position_snapshot))
    }

    // -------------------------------------------------------------------------
    // Closing
    // -------------------------------------------------------------------------

    /// Close a position fully or partially at the current book. Returns the
    /// closed position (the archived child for a hedging partial close).
    pub fn close_position(
        &self,
        position_id: u64,
        volume: Option<f64>,
        reason: &str,
    ) -> CoreResult<Position> {
        let (account_id, symbol) = {
            let positions = self.positions.read();
            let p = positions.get(&position_id).ok_or(CoreError::NotFound {
                entity: "position",
                id: position_id.to_string(),
            })?;
            (p.account_id, p.symbol.clone())
        };

        let spec = self
            .symbol_spec(&symbol)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown symbol {symbol}")))?;
        let tick = self
            .hub
            .prices
            .get(&symbol)
            .ok_or_else(|| BusinessRule::NoPrice(symbol.clone()))?;

        let arc = self.account_arc(account_id)?;
        let mut account = arc.lock();

        // Re-read under the account lock; a concurrent close may have won.
        let current = {
            let positions = self.positions.read();
            positions.get(&position_id).cloned()
        }
        .ok_or(CoreError::NotFound {
            entity: "position",
            id: position_id.to_string(),
        })?;
        if current.status != PositionStatus::Open {
            return Err(CoreError::Conflict(format!(
                "position {position_id} is already closed"
            )));
        }

        let close_volume = volume.unwrap_or(current.volume);
        if close_volume <= 0.0 || close_volume > current.volume + 1e-9 {
            return Err(CoreError::InvalidInput(format!(
                "close volume {close_volume} exceeds open volume {}",
                current.volume
            )));
        }
        let partial = close_volume < current.volume - 1e-9;

        let close_price = current.close_side_price(tick.bid, tick.ask);
        let pnl = match current.side {
            Side::Buy => (close_price - current.open_price) * close_volume * spec.contract_size,
            Side::Sell => (current.open_price - close_price) * close_volume * spec.contract_size,
        };

        // Journal first; memory mutation below cannot fail.
        self.ledger.realized_pnl(account_id, pnl, position_id)?;

        let released = current.margin * close_volume / current.volume;
        let now = self.clock.now_ms();
        let mode = account.mode;

        let closed_snapshot;
        {
            let mut positions = self.positions.write();
            let original = positions.get_mut(&position_id).unwrap();
            if !partial {
                original.status = PositionStatus::Closed;
                original.close_price = Some(close_price);
                original.closed_at = Some(now);
                original.close_reason = Some(reason.to_string());
                original.realized_pnl += pnl;
                original.current_price = close_price;
                original.unrealized_pnl = 0.0;
                closed_snapshot = original.clone();
            } else if mode == PositionMode::Hedging {
                original.volume -= close_volume;
                original.margin -= released;
                let child = Position {
                    id: self.ids.next_position(),
                    volume: close_volume,
                    margin: 0.0,
                    status: PositionStatus::Closed,
                    close_price: Some(close_price),
                    closed_at: Some(now),
                    close_reason: Some(reason.to_string()),
                    realized_pnl: pnl,
                    unrealized_pnl: 0.0,
                    current_price: close_price,
                    ..original.clone()
                };
                closed_snapshot = child.clone();
                positions.insert(child.id, child);
            } else {
                original.volume -= close_volume;
                original.margin -= released;
                original.realized_pnl += pnl;
                closed_snapshot = original.clone();
            }
        }

        account.margin_used = (account.margin_used - released).max(0.0);
        drop(account);

        info!(
            position = position_id,
            account = account_id,
            reason,
            close_price,
            pnl,
            partial,
            "position closed"
        );
        self.publish_position_event("closed", &closed_snapshot);
        if let Ok(snap) = self.account_snapshot(account_id) {
            self.publish_account_event("pnl", &snap);
        }
        Ok(closed_snapshot)
    }

    // -------------------------------------------------------------------------
    // Modification
    // -------------------------------------------------------------------------

    /// Update SL/TP. A value of 0 clears the stop; `None` leaves it alone.
    pub fn modify_position(
        &self,
        position_id: u64,
        sl: Option<f64>,
        tp: Option<f64>,
    ) -> CoreResult<Position> {
        let symbol = {
            let positions = self.positions.read();
            let p = positions.get(&position_id).ok_or(CoreError::NotFound {
                entity: "position",
                id: position_id.to_string(),
            })?;
            if p.status != PositionStatus::Open {
                return Err(CoreError::Conflict(format!(
                    "position {position_id} is closed"
                )));
            }
            p.symbol.clone()
        };
        let tick = self
            .hub
            .prices
            .get(&symbol)
            .ok_or_else(|| BusinessRule::NoPrice(symbol.clone()))?;

        let mut positions = self.positions.write();
        let p = positions.get_mut(&position_id).ok_or(CoreError::NotFound {
            entity: "position",
            id: position_id.to_string(),
        })?;

        let new_sl = match sl {
            Some(v) if v == 0.0 => None,
            Some(v) => Some(v),
            None => p.sl,
        };
        let new_tp = match tp {
            Some(v) if v == 0.0 => None,
            Some(v) => Some(v),
            None => p.tp,
        };
        let mark = p.close_side_price(tick.bid, tick.ask);
        Self::validate_stops(p.side, mark, new_sl, new_tp)?;

        p.sl = new_sl;
        p.tp = new_tp;
        let snapshot = p.clone();
        drop(positions);

        self.publish_position_event("modified", &snapshot);
        Ok(snapshot)
    }

    /// Attach or clear a trailing-stop config. The scheduler reads it and
    /// drives SL updates from the tick stream.
    pub fn set_trailing(
        &self,
        position_id: u64,
        trailing: Option<TrailingConfig>,
    ) -> CoreResult<Position> {
        let mut positions = self.positions.write();
        let p = positions.get_mut(&position_id).ok_or(CoreError::NotFound {
            entity: "position",
            id: position_id.to_string(),
        })?;
        if p.status != PositionStatus::Open {
            return Err(CoreError::Conflict(format!(
                "position {position_id} is closed"
            )));
        }
        p.trailing = trailing;
        Ok(p.clone())
    }

    /// Trailing-only SL move used by the scheduler; skips the side check
    /// against the live book because the trail never retreats by
    /// construction.
    pub(crate) fn trail_stop_loss(&self, position_id: u64, sl: f64) -> CoreResult<()> {
        let mut positions = self.positions.write();
        let p = positions.get_mut(&position_id).ok_or(CoreError::NotFound {
            entity: "position",
            id: position_id.to_string(),
        })?;
        if p.status != PositionStatus::Open {
            return Err(CoreError::Conflict(format!(
                "position {position_id} is closed"
            )));
        }
        p.sl = Some(sl);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Pending orders
    // -------------------------------------------------------------------------

    /// Place a LIMIT / STOP / STOP_LIMIT order. Market orders never persist
    /// as pending.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_pending(
        &self,
        account_id: u64,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        volume: f64,
        price: Option<f64>,
        trigger_price: Option<f64>,
        sl: Option<f64>,
        tp: Option<f64>,
        tif: TimeInForce,
        client_ref: Option<String>,
    ) -> CoreResult<Order> {
        if order_type == OrderType::Market {
            return Err(CoreError::InvalidInput(
                "market orders execute immediately; use the market endpoint".into(),
            ));
        }
        let spec = self
            .symbol_spec(symbol)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown symbol {symbol}")))?;
        if !spec.enabled {
            return Err(BusinessRule::SymbolDisabled(symbol.to_string()).into());
        }
        spec.validate_volume(volume)?;

        match order_type {
            OrderType::Limit if price.is_none() => {
                return Err(CoreError::InvalidInput("limit order requires price".into()))
            }
            OrderType::Stop if trigger_price.is_none() => {
                return Err(CoreError::InvalidInput(
                    "stop order requires trigger_price".into(),
                ))
            }
            OrderType::StopLimit if price.is_none() || trigger_price.is_none() => {
                return Err(CoreError::InvalidInput(
                    "stop-limit order requires price and trigger_price".into(),
                ))
            }
            _ => {}
        }

        let arc = self.account_arc(account_id)?;
        {
            let account = arc.lock();
            match account.status {
                AccountStatus::Active => {}
                _ => return Err(BusinessRule::AccountSuspended(account_id).into()),
            }
        }

        let client_ref = client_ref.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        {
            let mut refs = self.client_refs.lock();
            if !refs.insert(client_ref.clone()) {
                return Err(CoreError::Conflict(format!(
                    "duplicate client reference {client_ref}"
                )));
            }
        }

        let order = Order {
            id: self.ids.next_order(),
            account_id,
            symbol: symbol.to_string(),
            side,
            order_type,
            volume,
            price,
            trigger_price,
            sl,
            tp,
            tif,
            status: OrderStatus::Pending,
            placed_at: self.clock.now_ms(),
            fill_price: None,
            filled_at: None,
            client_ref,
            lp_order_id: None,
            reject_reason: None,
        };
        self.orders.write().insert(order.id, order.clone());
        info!(order = order.id, symbol, side = %side, order_type = %order_type, "pending order placed");
        Ok(order)
    }

    /// Record an order that has been routed to an external LP. It sits in
    /// ACTIVATED until the LP's execution report fills or rejects it.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_routed(
        &self,
        account_id: u64,
        symbol: &str,
        side: Side,
        volume: f64,
        sl: Option<f64>,
        tp: Option<f64>,
        client_ref: Option<String>,
    ) -> CoreResult<Order> {
        let spec = self
            .symbol_spec(symbol)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown symbol {symbol}")))?;
        if !spec.enabled {
            return Err(BusinessRule::SymbolDisabled(symbol.to_string()).into());
        }
        spec.validate_volume(volume)?;

        let arc = self.account_arc(account_id)?;
        {
            let account = arc.lock();
            match account.status {
                AccountStatus::Active => {}
                _ => return Err(BusinessRule::AccountSuspended(account_id).into()),
            }
        }

        let client_ref = client_ref.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        {
            let mut refs = self.client_refs.lock();
            if !refs.insert(client_ref.clone()) {
                return Err(CoreError::Conflict(format!(
                    "duplicate client reference {client_ref}"
                )));
            }
        }

        let order = Order {
            id: self.ids.next_order(),
            account_id,
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            volume,
            price: None,
            trigger_price: None,
            sl,
            tp,
            tif: TimeInForce::Fok,
            status: OrderStatus::Activated,
            placed_at: self.clock.now_ms(),
            fill_price: None,
            filled_at: None,
            client_ref,
            lp_order_id: None,
            reject_reason: None,
        };
        self.orders.write().insert(order.id, order.clone());
        info!(order = order.id, symbol, "order routed to lp");
        Ok(order)
    }

    /// Replace the account's opaque credential blob (admin reset flow).
    pub fn set_credential_hash(&self, account_id: u64, credential_hash: &str) -> CoreResult<()> {
        if credential_hash.len() != 64 || !credential_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CoreError::InvalidInput(
                "credential must be a 64-char hex digest".into(),
            ));
        }
        let arc = self.account_arc(account_id)?;
        arc.lock().credential_hash = credential_hash.to_lowercase();
        info!(account = account_id, "credential replaced");
        Ok(())
    }

    pub fn cancel_order(&self, order_id: u64) -> CoreResult<Order> {
        let mut orders = self.orders.write();
        let order = orders.get_mut(&order_id).ok_or(CoreError::NotFound {
            entity: "order",
            id: order_id.to_string(),
        })?;
        if !order.status.can_transition(OrderStatus::Canceled) {
            return Err(CoreError::Conflict(format!(
                "order {order_id} in status {} cannot be canceled",
                order.status
            )));
        }
        order.status = OrderStatus::Canceled;
        info!(order = order_id, "order canceled");
        Ok(order.clone())
    }

    /// Mark the stop leg of a STOP_LIMIT as fired; the order then behaves
    /// as a LIMIT.
    pub fn mark_order_activated(&self, order_id: u64) -> CoreResult<()> {
        let mut orders = self.orders.write();
        let order = orders.get_mut(&order_id).ok_or(CoreError::NotFound {
            entity: "order",
            id: order_id.to_string(),
        })?;
        if !order.status.can_transition(OrderStatus::Activated) {
            return Err(CoreError::Conflict(format!(
                "order {order_id} in status {} cannot activate",
                order.status
            )));
        }
        order.status = OrderStatus::Activated;
        Ok(())
    }

    /// Fill a pending order at `fill_price`. On a business rejection the
    /// order transitions to REJECTED with the reason recorded.
    pub fn fill_pending_order(&self, order_id: u64, fill_price: f64) -> CoreResult<Position> {
        let order = {
            let orders = self.orders.read();
            orders.get(&order_id).cloned().ok_or(CoreError::NotFound {
                entity: "order",
                id: order_id.to_string(),
            })?
        };
        if order.status != OrderStatus::Pending && order.status != OrderStatus::Activated {
            return Err(CoreError::Conflict(format!(
                "order {order_id} in status {} cannot fill",
                order.status
            )));
        }

        let result = self.open_position_at(
            order.account_id,
            &order.symbol,
            order.side,
            order.volume,
            fill_price,
            order.sl,
            order.tp,
            Some(format!("{}:fill", order.client_ref)),
            order.order_type,
            None,
            false,
        );

        let mut orders = self.orders.write();
        let stored = orders.get_mut(&order_id).unwrap();
        match result {
            Ok((_, position)) => {
                if stored.status == OrderStatus::Pending {
                    stored.status = OrderStatus::Activated;
                }
                stored.status = OrderStatus::Filled;
                stored.fill_price = Some(fill_price);
                stored.filled_at = Some(self.clock.now_ms());
                info!(order = order_id, fill_price, "pending order filled");
                Ok(position)
            }
            Err(e) => {
                stored.status = OrderStatus::Rejected;
                stored.reject_reason = Some(e.to_string());
                warn!(order = order_id, error = %e, "pending order rejected at fill");
                Err(e)
            }
        }
    }

    /// Reject a pending order outright (expiry, scheduler decision).
    pub fn reject_order(&self, order_id: u64, reason: &str) -> CoreResult<()> {
        let mut orders = self.orders.write();
        let order = orders.get_mut(&order_id).ok_or(CoreError::NotFound {
            entity: "order",
            id: order_id.to_string(),
        })?;
        if !order.status.can_transition(OrderStatus::Rejected) {
            return Err(CoreError::Conflict(format!(
                "order {order_id} in status {} cannot reject",
                order.status
            )));
        }
        order.status = OrderStatus::Rejected;
        order.reject_reason = Some(reason.to_string());
        Ok(())
    }

    // -------------------------------------------------------------------------
    // LP execution reports (A-Book)
    // -------------------------------------------------------------------------

    /// Apply an LP execution report to the order it references. Fills open
    /// a mirrored internal position at the LP price.
    pub fn apply_execution_report(&self, report: LpExecution) -> CoreResult<()> {
        let order = {
            let orders = self.orders.read();
            orders
                .values()
                .find(|o| o.client_ref == report.client_ref)
                .cloned()
        }
        .ok_or(CoreError::NotFound {
            entity: "order",
            id: report.client_ref.clone(),
        })?;

        match report.outcome {
            LpExecutionOutcome::Fill { price, volume } => {
                self.open_position_at(
                    order.account_id,
                    &order.symbol,
                    order.side,
                    volume,
                    price,
                    order.sl,
                    order.tp,
                    Some(format!("{}:lp", order.client_ref)),
                    order.order_type,
                    Some(report.lp_order_id.clone()),
                    false,
                )?;
                let mut orders = self.orders.write();
                let stored = orders.get_mut(&order.id).unwrap();
                stored.lp_order_id = Some(report.lp_order_id);
                if stored.status == OrderStatus::Pending {
                    stored.status = OrderStatus::Activated;
                }
                if (volume - stored.volume).abs() < 1e-9 {
                    stored.status = OrderStatus::Filled;
                } else {
                    stored.status = OrderStatus::Partial;
                }
                stored.fill_price = Some(price);
                stored.filled_at = Some(self.clock.now_ms());
                info!(order = stored.id, price, volume, "lp fill applied");
                Ok(())
            }
            LpExecutionOutcome::Reject { reason } => {
                let mut orders = self.orders.write();
                let stored = orders.get_mut(&order.id).unwrap();
                if stored.status.can_transition(OrderStatus::Rejected) {
                    stored.status = OrderStatus::Rejected;
                    stored.reject_reason = Some(reason.clone());
                }
                warn!(order = stored.id, reason = %reason, "lp rejected order");
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Swaps
    // -------------------------------------------------------------------------

    /// Apply overnight financing to every open position. Returns the number
    /// of positions charged.
    pub fn apply_daily_swap(&self) -> usize {
        let open: Vec<(u64, u64, Side, f64, String)> = {
            let positions = self.positions.read();
            positions
                .values()
                .filter(|p| p.status == PositionStatus::Open)
                .map(|p| (p.id, p.account_id, p.side, p.volume, p.symbol.clone()))
                .collect()
        };

        let mut charged = 0;
        for (id, account_id, side, volume, symbol) in open {
            let Some(spec) = self.symbol_spec(&symbol) else {
                continue;
            };
            let amount = match side {
                Side::Buy => spec.swap_long,
                Side::Sell => spec.swap_short,
            } * volume;
            if amount == 0.0 {
                continue;
            }
            match self.ledger.swap(account_id, amount, id) {
                Ok(_) => {
                    if let Some(p) = self.positions.write().get_mut(&id) {
                        p.swap += amount;
                    }
                    charged += 1;
                }
                Err(e) => warn!(position = id, error = %e, "swap charge failed"),
            }
        }
        charged
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn position(&self, position_id: u64) -> CoreResult<Position> {
        self.positions
            .read()
            .get(&position_id)
            .cloned()
            .ok_or(CoreError::NotFound {
                entity: "position",
                id: position_id.to_string(),
            })
    }

    pub fn open_positions(&self, account_id: Option<u64>) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .filter(|p| {
                p.status == PositionStatus::Open
                    && account_id.map_or(true, |id| p.account_id == id)
            })
            .cloned()
            .collect()
    }

    pub fn closed_positions(&self, limit: usize) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .rev()
            .filter(|p| p.status == PositionStatus::Closed)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn order(&self, order_id: u64) -> CoreResult<Order> {
        self.orders
            .read()
            .get(&order_id)
            .cloned()
            .ok_or(CoreError::NotFound {
                entity: "order",
                id: order_id.to_string(),
            })
    }

    /// Orders still awaiting activation or fill, ascending by id.
    pub fn pending_orders(&self) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| matches!(o.status, OrderStatus::Pending | OrderStatus::Activated))
            .cloned()
            .collect()
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    fn publish_position_event(&self, kind: &'static str, position: &Position) {
        self.hub.publish_event(HubEvent::Position(PositionEvent {
            kind,
            position: position.clone(),
        }));
    }

    fn publish_account_event(&self, kind: &'static str, snap: &AccountSnapshot) {
        self.hub.publish_event(HubEvent::Account(AccountEvent {
            kind,
            account_id: snap.id,
            balance: snap.balance,
            equity: snap.equity,
            margin_used: snap.margin_used,
        }));
    }

    // -------------------------------------------------------------------------
    // Tick callback
    // -------------------------------------------------------------------------

    /// Recompute marks, evaluate SL/TP (ascending position id, ties
    /// trigger), then run the stop-out check for affected accounts.
    fn evaluate_tick(&self, tick: &Tick) {
        let Some(spec) = self.symbol_spec(&tick.symbol) else {
            return;
        };

        let mut triggers: Vec<(u64, &'static str)> = Vec::new();
        let mut touched_accounts: Vec<u64> = Vec::new();
        {
            let mut positions = self.positions.write();
            for p in positions.values_mut() {
                if p.symbol != tick.symbol || p.status != PositionStatus::Open {
                    continue;
                }
                p.current_price = p.close_side_price(tick.bid, tick.ask);
                p.unrealized_pnl = p.unrealized(tick.bid, tick.ask, spec.contract_size);
                if !touched_accounts.contains(&p.account_id) {
                    touched_accounts.push(p.account_id);
                }
                if p.sl_hit(tick.bid, tick.ask) {
                    triggers.push((p.id, REASON_STOP_LOSS));
                } else if p.tp_hit(tick.bid, tick.ask) {
                    triggers.push((p.id, REASON_TAKE_PROFIT));
                }
            }
        }

        for (id, reason) in triggers {
            if let Err(e) = self.close_position(id, None, reason) {
                warn!(position = id, reason, error = %e, "stop close failed");
            }
        }

        for account_id in touched_accounts {
            self.check_stop_out(account_id);
        }
    }

    /// Forced liquidation: while margin level is below the stop-out
    /// threshold, close positions in descending unrealised-loss order.
    fn check_stop_out(&self, account_id: u64) {
        loop {
            let Ok(arc) = self.account_arc(account_id) else {
                return;
            };
            let margin_used = arc.lock().margin_used;
            if margin_used <= 0.0 {
                return;
            }
            let balance = self.ledger.balance(account_id);
            let equity = balance + self.account_unrealized(account_id);
            let level = equity / margin_used;
            if level >= self.stop_out_level {
                return;
            }

            let worst = {
                let positions = self.positions.read();
                positions
                    .values()
                    .filter(|p| p.account_id == account_id && p.status == PositionStatus::Open)
                    .min_by(|a, b| {
                        a.unrealized_pnl
                            .partial_cmp(&b.unrealized_pnl)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|p| p.id)
            };
            let Some(position_id) = worst else {
                return;
            };

            warn!(
                account = account_id,
                margin_level = level,
                position = position_id,
                "stop out: forced liquidation"
            );
            if self
                .close_position(position_id, None, REASON_STOP_OUT)
                .is_err()
            {
                return;
            }
        }
    }
}

impl TickListener for Engine {
    fn on_tick(&self, tick: &Tick) {
        self.evaluate_tick(tick);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("symbols", &self.specs.read().len())
            .field("accounts", &self.accounts.read().len())
            .field("positions", &self.positions.read().len())
            .field("orders", &self.orders.read().len())
            .finish()
    }
}
