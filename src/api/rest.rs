// =============================================================================
// REST API Endpoints — Axum
// =============================================================================
//
// The collaborator-facing HTTP surface. Handlers parse transport inputs,
// call the core, and map typed `CoreError`s onto HTTP statuses with
// `{error, code}` JSON bodies. History endpoints sit behind a per-IP token
// bucket and are gzip-compressed when the client accepts it.
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Json, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::{
    constant_time_eq, mint_user_token, sha256_hex, AuthAdmin, AuthUser,
};
use crate::api::rate_limit::RateLimiter;
use crate::app_state::AppState;
use crate::engine::TrailingConfig;
use crate::error::CoreError;
use crate::market_data::ohlc::timeframe_seconds;
use crate::market_data::{validate_symbol, Tick};
use crate::router::RoutingRule;
use crate::types::{ExecutionMode, OrderType, Side, TimeInForce};

/// Session tokens live for eight hours.
const TOKEN_TTL_MS: i64 = 8 * 3600 * 1000;

// =============================================================================
// Error mapping
// =============================================================================

pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::InvalidInput(_) | CoreError::InvalidSymbol(_) => StatusCode::BAD_REQUEST,
            CoreError::Unauthorized => StatusCode::UNAUTHORIZED,
            CoreError::Forbidden => StatusCode::FORBIDDEN,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::BusinessRule(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            CoreError::Upstream(_) => StatusCode::BAD_GATEWAY,
            CoreError::Retryable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "code": self.0.code(),
        });
        let mut response = (status, Json(body)).into_response();
        if let CoreError::RateLimited { retry_after_s } = self.0 {
            if let Ok(value) = retry_after_s.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

type ApiResult<T> = Result<T, ApiError>;

// =============================================================================
// Router construction
// =============================================================================

#[derive(Clone)]
pub struct ApiContext {
    pub state: Arc<AppState>,
    pub history_limiter: Arc<RateLimiter>,
}

/// Build the full REST router with CORS and compression layers.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let context = ApiContext {
        history_limiter: Arc::new(RateLimiter::new(state.clock.clone())),
        state,
    };

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/login", post(login))
        // ── Trading ─────────────────────────────────────────────────
        .route("/order", post(place_market_order))
        .route("/order/limit", post(place_limit_order))
        .route("/order/stop", post(place_stop_order))
        .route("/order/stop-limit", post(place_stop_limit_order))
        .route("/orders/pending", get(pending_orders))
        .route("/order/cancel", post(cancel_order))
        .route("/position/close", post(close_position))
        .route("/position/modify", post(modify_position))
        .route("/position/trailing-stop", post(set_trailing_stop))
        .route("/positions", get(open_positions))
        // ── Market data ─────────────────────────────────────────────
        .route("/ticks", get(recent_ticks))
        .route("/ohlc", get(ohlc_history))
        .route("/api/history/ticks/{symbol}", get(history_range))
        .route("/api/history/ticks/bulk", post(history_bulk))
        .route("/api/history/available", get(history_available))
        .route("/api/history/symbols", get(history_symbols))
        .route("/api/history/info", get(history_info))
        // ── Admin ───────────────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/admin/account", post(create_account))
        .route("/admin/deposit", post(admin_deposit))
        .route("/admin/withdraw", post(admin_withdraw))
        .route("/admin/adjust", post(admin_adjust))
        .route("/admin/bonus", post(admin_bonus))
        .route("/admin/reset-password", post(admin_reset_password))
        .route("/admin/history/backfill", post(admin_backfill))
        .route("/admin/lps", get(lp_list))
        .route("/admin/lp/enable", post(lp_enable))
        .route("/admin/lp/disable", post(lp_disable))
        .route("/admin/routing", get(routing_rules).post(set_routing_rules))
        .route(
            "/admin/execution-mode",
            get(execution_mode).post(set_execution_mode),
        )
        // ── WebSocket ───────────────────────────────────────────────
        .route("/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .layer(CompressionLayer::new())
        .with_state(context)
}

/// The account a trading request operates on: the token's account, or an
/// explicit id when the admin token is used.
fn resolve_account(auth: &AuthUser, requested: Option<u64>) -> Result<u64, ApiError> {
    match (auth.0, requested) {
        (Some(id), None) => Ok(id),
        (Some(id), Some(req)) if id == req => Ok(id),
        (Some(_), Some(_)) => Err(CoreError::Forbidden.into()),
        (None, Some(id)) => Ok(id),
        (None, None) => Err(CoreError::InvalidInput("accountId is required".into()).into()),
    }
}

// =============================================================================
// Health & login
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: ctx.state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    user: LoginUser,
}

#[derive(Serialize)]
struct LoginUser {
    account_id: u64,
    username: String,
}

async fn login(
    State(ctx): State<ApiContext>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let Some((account_id, stored_hash)) = ctx.state.engine.credentials_for(&req.username) else {
        warn!(user = %req.username, "login failed: unknown user");
        return Err(CoreError::Unauthorized.into());
    };
    let presented = sha256_hex(&req.password);
    if !constant_time_eq(presented.as_bytes(), stored_hash.as_bytes()) {
        warn!(user = %req.username, "login failed: bad credential");
        return Err(CoreError::Unauthorized.into());
    }

    let expiry = chrono::Utc::now().timestamp_millis() + TOKEN_TTL_MS;
    info!(user = %req.username, account = account_id, "login ok");
    Ok(Json(LoginResponse {
        token: mint_user_token(account_id, expiry),
        user: LoginUser {
            account_id,
            username: req.username,
        },
    }))
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketOrderRequest {
    account_id: Option<u64>,
    symbol: String,
    side: String,
    volume: f64,
    #[serde(default)]
    sl: Option<f64>,
    #[serde(default)]
    tp: Option<f64>,
    #[serde(default)]
    client_ref: Option<String>,
}

async fn place_market_order(
    auth: AuthUser,
    State(ctx): State<ApiContext>,
    Json(req): Json<MarketOrderRequest>,
) -> ApiResult<Response> {
    let account_id = resolve_account(&auth, req.account_id)?;
    let side: Side = req.side.parse().map_err(CoreError::InvalidInput)?;
    let group = ctx.state.engine.account_group(account_id)?;

    let decision = ctx.state.router.decide(&req.symbol, &group, req.volume);
    match decision {
        ExecutionMode::Internal => {
            let (order, position) = ctx.state.engine.execute_market(
                account_id,
                &req.symbol,
                side,
                req.volume,
                req.sl,
                req.tp,
                req.client_ref,
            )?;
            ctx.state.increment_version();
            Ok(Json(serde_json::json!({ "order": order, "position": position })).into_response())
        }
        ExecutionMode::Lp(lp_id) => {
            let order = ctx.state.engine.submit_routed(
                account_id,
                &req.symbol,
                side,
                req.volume,
                req.sl,
                req.tp,
                req.client_ref,
            )?;
            let maybe_session = {
                let sessions = ctx.state.fix_sessions.read();
                sessions.get(&lp_id).cloned()
            };
            let Some(session) = maybe_session else {
                ctx.state.engine.reject_order(order.id, "lp session unavailable")?;
                return Err(CoreError::Upstream(format!("no fix session for lp {lp_id}")).into());
            };

            let builder = crate::fix::message::MessageBuilder::new(
                crate::fix::message::MsgType::NewOrderSingle,
            )
            .field(crate::fix::message::TAG_CL_ORD_ID, &order.client_ref)
            .field(crate::fix::message::TAG_SYMBOL, &order.symbol)
            .field(
                crate::fix::message::TAG_SIDE,
                match side {
                    Side::Buy => "1",
                    Side::Sell => "2",
                },
            )
            .field(crate::fix::message::TAG_ORDER_QTY, order.volume)
            .field(crate::fix::message::TAG_ORD_TYPE, "1"); // market
            if !session
                .send_app(builder, crate::fix::message::MsgType::NewOrderSingle)
                .await
            {
                ctx.state.engine.reject_order(order.id, "lp session closed")?;
                return Err(CoreError::Upstream(format!("fix session {lp_id} closed")).into());
            }
            ctx.state.increment_version();
            Ok(Json(serde_json::json!({ "order": order, "routed_to": lp_id })).into_response())
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingOrderRequest {
    account_id: Option<u64>,
    symbol: String,
    side: String,
    volume: f64,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    trigger_price: Option<f64>,
    #[serde(default)]
    sl: Option<f64>,
    #[serde(default)]
    tp: Option<f64>,
    #[serde(default)]
    tif: Option<TimeInForce>,
    #[serde(default)]
    client_ref: Option<String>,
}

async fn place_pending(
    auth: AuthUser,
    ctx: ApiContext,
    req: PendingOrderRequest,
    order_type: OrderType,
) -> ApiResult<Response> {
    let account_id = resolve_account(&auth, req.account_id)?;
    let side: Side = req.side.parse().map_err(CoreError::InvalidInput)?;
    let order = ctx.state.engine.submit_pending(
        account_id,
        &req.symbol,
        side,
        order_type,
        req.volume,
        req.price,
        req.trigger_price,
        req.sl,
        req.tp,
        req.tif.unwrap_or_default(),
        req.client_ref,
    )?;
    ctx.state.increment_version();
    Ok(Json(order).into_response())
}

async fn place_limit_order(
    auth: AuthUser,
    State(ctx): State<ApiContext>,
    Json(req): Json<PendingOrderRequest>,
) -> ApiResult<Response> {
    place_pending(auth, ctx, req, OrderType::Limit).await
}

async fn place_stop_order(
    auth: AuthUser,
    State(ctx): State<ApiContext>,
    Json(req): Json<PendingOrderRequest>,
) -> ApiResult<Response> {
    place_pending(auth, ctx, req, OrderType::Stop).await
}

async fn place_stop_limit_order(
    auth: AuthUser,
    State(ctx): State<ApiContext>,
    Json(req): Json<PendingOrderRequest>,
) -> ApiResult<Response> {
    place_pending(auth, ctx, req, OrderType::StopLimit).await
}

async fn pending_orders(_auth: AuthUser, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.engine.pending_orders())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    order_id: u64,
}

async fn cancel_order(
    _auth: AuthUser,
    State(ctx): State<ApiContext>,
    Json(req): Json<CancelRequest>,
) -> ApiResult<Response> {
    let order = ctx.state.engine.cancel_order(req.order_id)?;
    ctx.state.increment_version();
    Ok(Json(serde_json::json!({ "success": true, "order": order })).into_response())
}

// =============================================================================
// Positions
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClosePositionRequest {
    trade_id: u64,
    #[serde(default)]
    volume: Option<f64>,
}

async fn close_position(
    _auth: AuthUser,
    State(ctx): State<ApiContext>,
    Json(req): Json<ClosePositionRequest>,
) -> ApiResult<Response> {
    let position = ctx
        .state
        .engine
        .close_position(req.trade_id, req.volume, crate::engine::REASON_MANUAL)?;
    ctx.state.increment_version();
    Ok(Json(position).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModifyPositionRequest {
    trade_id: u64,
    #[serde(default)]
    sl: Option<f64>,
    #[serde(default)]
    tp: Option<f64>,
}

async fn modify_position(
    _auth: AuthUser,
    State(ctx): State<ApiContext>,
    Json(req): Json<ModifyPositionRequest>,
) -> ApiResult<Response> {
    let position = ctx.state.engine.modify_position(req.trade_id, req.sl, req.tp)?;
    ctx.state.increment_version();
    Ok(Json(position).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrailingStopRequest {
    trade_id: u64,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    distance: Option<f64>,
    #[serde(default)]
    step_size: Option<f64>,
    #[serde(default)]
    k: Option<f64>,
    #[serde(default)]
    window: Option<usize>,
    #[serde(default)]
    timeframe: Option<String>,
}

fn default_true() -> bool {
    true
}

async fn set_trailing_stop(
    _auth: AuthUser,
    State(ctx): State<ApiContext>,
    Json(req): Json<TrailingStopRequest>,
) -> ApiResult<Response> {
    let config = if !req.enabled {
        None
    } else {
        let mode = req.mode.as_deref().unwrap_or("fixed");
        let config = match mode {
            "fixed" => TrailingConfig::Fixed {
                distance: req.distance.ok_or_else(|| {
                    CoreError::InvalidInput("fixed trailing requires distance".into())
                })?,
            },
            "step" => TrailingConfig::Step {
                distance: req.distance.ok_or_else(|| {
                    CoreError::InvalidInput("step trailing requires distance".into())
                })?,
                step_size: req.step_size.ok_or_else(|| {
                    CoreError::InvalidInput("step trailing requires stepSize".into())
                })?,
            },
            "atr" => TrailingConfig::Atr {
                k: req.k.unwrap_or(2.0),
                window: req.window.unwrap_or(14),
                timeframe_s: req
                    .timeframe
                    .as_deref()
                    .map(|label| {
                        timeframe_seconds(label).ok_or_else(|| {
                            CoreError::InvalidInput(format!("unknown timeframe {label}"))
                        })
                    })
                    .transpose()?
                    .unwrap_or(60),
            },
            other => {
                return Err(
                    CoreError::InvalidInput(format!("unknown trailing mode {other}")).into(),
                )
            }
        };
        Some(config)
    };

    let position = ctx.state.engine.set_trailing(req.trade_id, config)?;
    ctx.state.increment_version();
    Ok(Json(position).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionsQuery {
    #[serde(default)]
    account_id: Option<u64>,
}

async fn open_positions(
    auth: AuthUser,
    State(ctx): State<ApiContext>,
    Query(query): Query<PositionsQuery>,
) -> ApiResult<Response> {
    let filter = match auth.0 {
        Some(id) => Some(id),
        None => query.account_id,
    };
    Ok(Json(ctx.state.engine.open_positions(filter)).into_response())
}

// =============================================================================
// Market data
// =============================================================================

#[derive(Deserialize)]
struct TicksQuery {
    symbol: String,
    #[serde(default = "default_tick_limit")]
    limit: usize,
}

fn default_tick_limit() -> usize {
    100
}

async fn recent_ticks(
    State(ctx): State<ApiContext>,
    Query(query): Query<TicksQuery>,
) -> ApiResult<Response> {
    validate_symbol(&query.symbol)?;
    let ticks = ctx.state.tick_store.history(&query.symbol, query.limit.min(10_000))?;
    Ok(Json(ticks).into_response())
}

#[derive(Deserialize)]
struct OhlcQuery {
    symbol: String,
    timeframe: String,
    #[serde(default = "default_bar_limit")]
    limit: usize,
}

fn default_bar_limit() -> usize {
    100
}

async fn ohlc_history(
    State(ctx): State<ApiContext>,
    Query(query): Query<OhlcQuery>,
) -> ApiResult<Response> {
    validate_symbol(&query.symbol)?;
    let tf = timeframe_seconds(&query.timeframe).ok_or_else(|| {
        CoreError::InvalidInput(format!("unknown timeframe {}", query.timeframe))
    })?;
    let bars = ctx.state.ohlc.history(&query.symbol, tf, query.limit.min(1_000));
    Ok(Json(bars).into_response())
}

#[derive(Deserialize)]
struct RangeQuery {
    from: i64,
    to: i64,
    #[serde(default)]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
    #[serde(default)]
    format: Option<String>,
}

fn default_page_size() -> usize {
    1_000
}

fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string())
}

fn ticks_to_csv(ticks: &[Tick]) -> String {
    let mut out = String::from("ts,bid,ask,lp\n");
    for t in ticks {
        out.push_str(&format!("{},{},{},{}\n", t.timestamp_ms, t.bid, t.ask, t.lp_id));
    }
    out
}

/// Packed little-endian records: i64 ts, f64 bid, f64 ask (24 bytes each).
fn ticks_to_binary(ticks: &[Tick]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ticks.len() * 24);
    for t in ticks {
        out.extend_from_slice(&t.timestamp_ms.to_le_bytes());
        out.extend_from_slice(&t.bid.to_le_bytes());
        out.extend_from_slice(&t.ask.to_le_bytes());
    }
    out
}

async fn history_range(
    State(ctx): State<ApiContext>,
    Path(symbol): Path<String>,
    Query(query): Query<RangeQuery>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> ApiResult<Response> {
    ctx.history_limiter.check(&client_ip(&headers, &addr))?;
    validate_symbol(&symbol)?;
    if query.to < query.from {
        return Err(CoreError::InvalidInput("to must be >= from".into()).into());
    }

    let page_size = query.page_size.clamp(1, 10_000);
    let ticks = ctx
        .state
        .tick_store
        .range(&symbol, query.from, query.to, query.page, page_size)?;

    match query.format.as_deref() {
        None | Some("json") => Ok(Json(serde_json::json!({
            "symbol": symbol,
            "page": query.page,
            "page_size": page_size,
            "count": ticks.len(),
            "ticks": ticks,
        }))
        .into_response()),
        Some("csv") => Ok((
            [(header::CONTENT_TYPE, "text/csv")],
            ticks_to_csv(&ticks),
        )
            .into_response()),
        Some("binary") => Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            ticks_to_binary(&ticks),
        )
            .into_response()),
        Some(other) => {
            Err(CoreError::InvalidInput(format!("unknown format {other}")).into())
        }
    }
}

#[derive(Deserialize)]
struct BulkRequest {
    symbols: Vec<String>,
    from: i64,
    to: i64,
}

async fn history_bulk(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<BulkRequest>,
) -> ApiResult<Response> {
    ctx.history_limiter.check(&client_ip(&headers, &addr))?;
    if req.symbols.is_empty() || req.symbols.len() > 50 {
        return Err(CoreError::InvalidInput("symbols must contain 1..=50 entries".into()).into());
    }

    let mut payload: HashMap<String, Vec<Tick>> = HashMap::new();
    for symbol in &req.symbols {
        validate_symbol(symbol)?;
        let ticks = ctx.state.tick_store.range(symbol, req.from, req.to, 0, 100_000)?;
        payload.insert(symbol.clone(), ticks);
    }
    Ok(Json(payload).into_response())
}

#[derive(Deserialize)]
struct SymbolQuery {
    symbol: String,
}

async fn history_available(
    State(ctx): State<ApiContext>,
    Query(query): Query<SymbolQuery>,
) -> ApiResult<Response> {
    validate_symbol(&query.symbol)?;
    let dates: Vec<String> = ctx
        .state
        .tick_store
        .available_dates(&query.symbol)?
        .into_iter()
        .map(|d| d.to_string())
        .collect();
    Ok(Json(dates).into_response())
}

async fn history_symbols(State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.tick_store.known_symbols())
}

async fn history_info(State(ctx): State<ApiContext>) -> ApiResult<Response> {
    let mut info: HashMap<String, serde_json::Value> = HashMap::new();
    for symbol in ctx.state.tick_store.known_symbols() {
        let dates = ctx.state.tick_store.available_dates(&symbol)?;
        info.insert(
            symbol,
            serde_json::json!({
                "days": dates.len(),
                "first": dates.first().map(|d| d.to_string()),
                "last": dates.last().map(|d| d.to_string()),
            }),
        );
    }
    Ok(Json(info).into_response())
}

// =============================================================================
// Admin
// =============================================================================

async fn full_state(_auth: AuthAdmin, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.build_snapshot())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAccountRequest {
    owner: String,
    /// Opaque hex SHA-256 credential blob; plaintext is never accepted.
    credential_hash: String,
    #[serde(default = "default_leverage")]
    leverage: u32,
    #[serde(default)]
    is_demo: bool,
    #[serde(default)]
    mode: Option<crate::types::PositionMode>,
    #[serde(default)]
    group: String,
}

fn default_leverage() -> u32 {
    100
}

async fn create_account(
    _auth: AuthAdmin,
    State(ctx): State<ApiContext>,
    Json(req): Json<CreateAccountRequest>,
) -> ApiResult<Response> {
    let snapshot = ctx.state.engine.create_account(
        &req.owner,
        &req.credential_hash,
        req.leverage,
        req.is_demo,
        req.mode.unwrap_or_default(),
        &req.group,
    )?;
    ctx.state.increment_version();
    Ok(Json(snapshot).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoneyRequest {
    account_id: u64,
    amount: f64,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    note: Option<String>,
}

async fn admin_deposit(
    _auth: AuthAdmin,
    State(ctx): State<ApiContext>,
    Json(req): Json<MoneyRequest>,
) -> ApiResult<Response> {
    let snapshot = ctx.state.engine.deposit(
        req.account_id,
        req.amount,
        req.method.as_deref().unwrap_or("manual"),
        req.reference.as_deref().unwrap_or(""),
        req.note.as_deref().unwrap_or(""),
        "admin",
    )?;
    ctx.state.increment_version();
    Ok(Json(snapshot).into_response())
}

async fn admin_withdraw(
    _auth: AuthAdmin,
    State(ctx): State<ApiContext>,
    Json(req): Json<MoneyRequest>,
) -> ApiResult<Response> {
    let snapshot = ctx.state.engine.withdraw(
        req.account_id,
        req.amount,
        req.reference.as_deref().unwrap_or(""),
        req.note.as_deref().unwrap_or(""),
        "admin",
    )?;
    ctx.state.increment_version();
    Ok(Json(snapshot).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdjustRequest {
    account_id: u64,
    amount: f64,
    reason: String,
}

async fn admin_adjust(
    _auth: AuthAdmin,
    State(ctx): State<ApiContext>,
    Json(req): Json<AdjustRequest>,
) -> ApiResult<Response> {
    let snapshot = ctx
        .state
        .engine
        .adjust(req.account_id, req.amount, &req.reason, "admin")?;
    ctx.state.increment_version();
    Ok(Json(snapshot).into_response())
}

async fn admin_bonus(
    _auth: AuthAdmin,
    State(ctx): State<ApiContext>,
    Json(req): Json<AdjustRequest>,
) -> ApiResult<Response> {
    let snapshot = ctx
        .state
        .engine
        .bonus(req.account_id, req.amount, &req.reason, "admin")?;
    ctx.state.increment_version();
    Ok(Json(snapshot).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResetPasswordRequest {
    account_id: u64,
    credential_hash: String,
}

async fn admin_reset_password(
    _auth: AuthAdmin,
    State(ctx): State<ApiContext>,
    Json(req): Json<ResetPasswordRequest>,
) -> ApiResult<Response> {
    ctx.state
        .engine
        .set_credential_hash(req.account_id, &req.credential_hash)?;
    Ok(Json(serde_json::json!({ "success": true })).into_response())
}

#[derive(Deserialize)]
struct BackfillRequest {
    symbol: String,
    ticks: Vec<BackfillTick>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Deserialize)]
struct BackfillTick {
    ts: i64,
    bid: f64,
    ask: f64,
    #[serde(default)]
    lp: Option<String>,
}

async fn admin_backfill(
    _auth: AuthAdmin,
    State(ctx): State<ApiContext>,
    Json(req): Json<BackfillRequest>,
) -> ApiResult<Response> {
    validate_symbol(&req.symbol)?;
    let source = req.source.unwrap_or_else(|| "backfill".to_string());
    let ticks: Vec<Tick> = req
        .ticks
        .into_iter()
        .map(|t| Tick {
            symbol: req.symbol.clone(),
            bid: t.bid,
            ask: t.ask,
            timestamp_ms: t.ts,
            lp_id: t.lp.unwrap_or_else(|| source.clone()),
        })
        .filter(Tick::is_valid)
        .collect();
    let inserted = ctx.state.tick_store.merge_historical(&req.symbol, &ticks)?;
    Ok(Json(serde_json::json!({ "inserted": inserted, "submitted": ticks.len() })).into_response())
}

async fn lp_list(_auth: AuthAdmin, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.lp_manager.status())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LpToggleRequest {
    lp_id: String,
}

async fn lp_enable(
    _auth: AuthAdmin,
    State(ctx): State<ApiContext>,
    Json(req): Json<LpToggleRequest>,
) -> ApiResult<Response> {
    ctx.state.lp_manager.enable(&req.lp_id)?;
    ctx.state.increment_version();
    Ok(Json(serde_json::json!({ "success": true })).into_response())
}

async fn lp_disable(
    _auth: AuthAdmin,
    State(ctx): State<ApiContext>,
    Json(req): Json<LpToggleRequest>,
) -> ApiResult<Response> {
    ctx.state.lp_manager.disable(&req.lp_id)?;
    ctx.state.increment_version();
    Ok(Json(serde_json::json!({ "success": true })).into_response())
}

async fn routing_rules(_auth: AuthAdmin, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.router.snapshot().as_ref().clone())
}

async fn set_routing_rules(
    _auth: AuthAdmin,
    State(ctx): State<ApiContext>,
    Json(rules): Json<Vec<RoutingRule>>,
) -> impl IntoResponse {
    ctx.state.router.set_rules(rules);
    ctx.state.increment_version();
    Json(ctx.state.router.snapshot().as_ref().clone())
}

async fn execution_mode(_auth: AuthAdmin, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.router.default_mode())
}

async fn set_execution_mode(
    _auth: AuthAdmin,
    State(ctx): State<ApiContext>,
    Json(mode): Json<ExecutionMode>,
) -> impl IntoResponse {
    ctx.state.router.set_default_mode(mode.clone());
    ctx.state.increment_version();
    Json(mode)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses() {
        fn status_of(e: CoreError) -> StatusCode {
            ApiError(e).into_response().status()
        }
        assert_eq!(status_of(CoreError::InvalidInput("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(CoreError::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_of(CoreError::NotFound { entity: "order", id: "1".into() }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status_of(CoreError::Conflict("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_of(crate::error::BusinessRule::NoPrice("EURUSD".into()).into()),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(CoreError::RateLimited { retry_after_s: 10 }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(status_of(CoreError::Upstream("lp".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(status_of(CoreError::Internal("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn rate_limit_response_carries_retry_after() {
        let response = ApiError(CoreError::RateLimited { retry_after_s: 10 }).into_response();
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "10"
        );
    }

    #[test]
    fn csv_rendering() {
        let ticks = vec![Tick {
            symbol: "EURUSD".into(),
            bid: 1.1,
            ask: 1.2,
            timestamp_ms: 5,
            lp_id: "lpa".into(),
        }];
        let csv = ticks_to_csv(&ticks);
        assert_eq!(csv, "ts,bid,ask,lp\n5,1.1,1.2,lpa\n");
    }

    #[test]
    fn binary_rendering_is_24_bytes_per_tick() {
        let ticks = vec![
            Tick {
                symbol: "EURUSD".into(),
                bid: 1.1,
                ask: 1.2,
                timestamp_ms: 5,
                lp_id: "lpa".into(),
            };
            3
        ];
        let bytes = ticks_to_binary(&ticks);
        assert_eq!(bytes.len(), 72);
        assert_eq!(i64::from_le_bytes(bytes[0..8].try_into().unwrap()), 5);
        assert_eq!(f64::from_le_bytes(bytes[8..16].try_into().unwrap()), 1.1);
    }

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1, 10.0.0.2".parse().unwrap());
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(client_ip(&headers, &addr), "10.0.0.1");
        assert_eq!(client_ip(&HeaderMap::new(), &addr), "127.0.0.1");
    }
}
