//! 原生管理 API（/api/v1）
//!
//! 账户管理和交易便捷入口，封套见 response 模块。
//! 用户体系（JWT 登录）不在范围内，接口直接带 account_id。

use axum::extract::{Path, RawQuery, State};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::common::exchange::Exchange;
use crate::common::keygen;
use crate::engine::types::{ClosePositionRequest, OpenPositionRequest};
use crate::engine::EngineError;
use crate::facade::{parse_params, response, AppState};
use crate::store::account_repo;
use crate::store::models::{Account, MarginMode, OrderType, PositionSide};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/accounts", post(create_account))
        .route("/api/v1/accounts/:id", get(get_account).delete(delete_account))
        .route("/api/v1/accounts/:id/reset-keys", post(reset_keys))
        .route("/api/v1/trading/:account_id/open-long", post(open_long))
        .route("/api/v1/trading/:account_id/open-short", post(open_short))
        .route("/api/v1/trading/:account_id/close-long", post(close_long))
        .route("/api/v1/trading/:account_id/close-short", post(close_short))
        .route("/api/v1/trading/:account_id/balance", get(get_balance))
        .route("/api/v1/trading/:account_id/positions", get(get_positions))
        .route("/api/v1/trading/:account_id/leverage", post(set_leverage))
        .route("/api/v1/trading/:account_id/stop-loss", post(set_stop_loss))
        .route("/api/v1/trading/:account_id/take-profit", post(set_take_profit))
        .route("/api/v1/trading/:account_id/orders", get(get_orders))
        .route("/api/v1/trading/:account_id/orders/:order_id", get(get_order))
        .route("/api/v1/trading/:account_id/trades", get(get_trades))
        .route("/api/v1/trading/:account_id/closed-pnl", get(get_closed_pnl))
        .with_state(state)
}

fn engine_error(error: EngineError) -> Response {
    match error {
        EngineError::AccountNotFound => response::not_found("account not found"),
        EngineError::OrderNotFound => response::not_found("order not found"),
        EngineError::Database(e) => response::internal_error(&e.to_string()),
        EngineError::Internal(msg) => response::internal_error(&msg),
        other => response::bad_request(&other.to_string()),
    }
}

/// 账户所属交易所：交易便捷接口按这个路由行情源
async fn account_venue(state: &AppState, account_id: i64) -> Result<(Account, Exchange), Response> {
    match account_repo::get_by_id(&state.pool, account_id).await {
        Ok(Some(account)) => {
            let venue = account.exchange_type;
            Ok((account, venue))
        }
        Ok(None) => Err(response::not_found("account not found")),
        Err(e) => Err(response::internal_error(&e.to_string())),
    }
}

#[derive(Deserialize)]
struct CreateAccountRequest {
    username: String,
    exchange_type: String,
    #[serde(default)]
    initial_balance: f64,
    #[serde(default)]
    margin_mode: Option<MarginMode>,
    #[serde(default)]
    hedge_mode: bool,
    #[serde(default)]
    default_leverage: Option<i32>,
}

async fn create_account(
    State(state): State<AppState>,
    Json(req): Json<CreateAccountRequest>,
) -> Response {
    let Some(venue) = Exchange::from_str(&req.exchange_type) else {
        return response::bad_request("unsupported exchange type");
    };
    if req.username.is_empty() {
        return response::bad_request("username is required");
    }

    let keys = keygen::generate_api_key(venue);
    let secret_encrypted = match state.cipher.encrypt(&keys.api_secret) {
        Ok(encrypted) => encrypted,
        Err(e) => return response::internal_error(&e.to_string()),
    };
    let passphrase_encrypted = match &keys.passphrase {
        Some(passphrase) => match state.cipher.encrypt(passphrase) {
            Ok(encrypted) => Some(encrypted),
            Err(e) => return response::internal_error(&e.to_string()),
        },
        None => None,
    };

    let user_id = match account_repo::ensure_user(&state.pool, &req.username).await {
        Ok(id) => id,
        Err(e) => return response::internal_error(&e.to_string()),
    };

    let account = match account_repo::create(
        &state.pool,
        account_repo::NewAccount {
            user_id,
            exchange_type: venue,
            api_key: &keys.api_key,
            api_secret_encrypted: &secret_encrypted,
            passphrase_encrypted: passphrase_encrypted.as_deref(),
            initial_balance: req.initial_balance,
            margin_mode: req.margin_mode.unwrap_or(MarginMode::Cross),
            hedge_mode: req.hedge_mode,
            default_leverage: req.default_leverage.unwrap_or(20),
            maker_fee_rate: 0.0002,
            taker_fee_rate: 0.0004,
        },
    )
    .await
    {
        Ok(account) => account,
        Err(e) => return response::internal_error(&e.to_string()),
    };

    // 明文 secret 只在创建响应里出现一次
    response::created(json!({
        "id": account.id,
        "exchange_type": account.exchange_type,
        "api_key": keys.api_key,
        "api_secret": keys.api_secret,
        "passphrase": keys.passphrase,
        "balance_usdt": account.balance_usdt,
        "initial_balance": account.initial_balance,
        "margin_mode": account.margin_mode,
        "hedge_mode": account.hedge_mode,
        "default_leverage": account.default_leverage,
        "maker_fee_rate": account.maker_fee_rate,
        "taker_fee_rate": account.taker_fee_rate,
        "created_at": account.created_at,
    }))
}

async fn get_account(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match account_repo::get_by_id(&state.pool, id).await {
        Ok(Some(account)) => response::success(account),
        Ok(None) => response::not_found("account not found"),
        Err(e) => response::internal_error(&e.to_string()),
    }
}

async fn delete_account(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match account_repo::soft_delete(&state.pool, id).await {
        Ok(()) => response::success(json!({"deleted": id})),
        Err(e) => response::internal_error(&e.to_string()),
    }
}

async fn reset_keys(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let (account, venue) = match account_venue(&state, id).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let keys = keygen::generate_api_key(venue);
    let secret_encrypted = match state.cipher.encrypt(&keys.api_secret) {
        Ok(encrypted) => encrypted,
        Err(e) => return response::internal_error(&e.to_string()),
    };
    let passphrase_encrypted = match &keys.passphrase {
        Some(passphrase) => match state.cipher.encrypt(passphrase) {
            Ok(encrypted) => Some(encrypted),
            Err(e) => return response::internal_error(&e.to_string()),
        },
        None => None,
    };

    if let Err(e) = account_repo::update_keys(
        &state.pool,
        account.id,
        &keys.api_key,
        &secret_encrypted,
        passphrase_encrypted.as_deref(),
    )
    .await
    {
        return response::internal_error(&e.to_string());
    }

    response::success(json!({
        "id": account.id,
        "api_key": keys.api_key,
        "api_secret": keys.api_secret,
        "passphrase": keys.passphrase,
    }))
}

#[derive(Deserialize)]
struct TradeRequest {
    symbol: String,
    #[serde(default)]
    quantity: f64,
    #[serde(default)]
    leverage: Option<u32>,
    #[serde(default)]
    stop_loss: Option<f64>,
    #[serde(default)]
    take_profit: Option<f64>,
}

async fn open_market(
    state: AppState,
    account_id: i64,
    side: PositionSide,
    req: TradeRequest,
) -> Response {
    let (_, venue) = match account_venue(&state, account_id).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let open_req = OpenPositionRequest {
        account_id,
        symbol: req.symbol,
        side,
        quantity: req.quantity,
        leverage: req.leverage,
        order_type: OrderType::Market,
        price: 0.0,
        stop_loss: req.stop_loss,
        take_profit: req.take_profit,
    };

    match state.engine.open_position(&open_req, venue).await {
        Ok((order, position)) => response::success(json!({
            "order": order,
            "position": position,
        })),
        Err(e) => engine_error(e),
    }
}

#[derive(Deserialize)]
struct CloseRequest {
    symbol: String,
    #[serde(default)]
    quantity: Option<f64>,
}

async fn close_market(
    state: AppState,
    account_id: i64,
    side: PositionSide,
    req: CloseRequest,
) -> Response {
    let (_, venue) = match account_venue(&state, account_id).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let close_req = ClosePositionRequest {
        account_id,
        symbol: req.symbol,
        side,
        quantity: req.quantity,
    };

    match state.engine.close_position(&close_req, venue).await {
        Ok((order, closed)) => response::success(json!({
            "order": order,
            "closed_pnl": closed,
        })),
        Err(e) => engine_error(e),
    }
}

async fn open_long(
    State(state): State<AppState>,
    Path(account_id): Path<i64>,
    Json(req): Json<TradeRequest>,
) -> Response {
    open_market(state, account_id, PositionSide::Long, req).await
}

async fn open_short(
    State(state): State<AppState>,
    Path(account_id): Path<i64>,
    Json(req): Json<TradeRequest>,
) -> Response {
    open_market(state, account_id, PositionSide::Short, req).await
}

async fn close_long(
    State(state): State<AppState>,
    Path(account_id): Path<i64>,
    Json(req): Json<CloseRequest>,
) -> Response {
    close_market(state, account_id, PositionSide::Long, req).await
}

async fn close_short(
    State(state): State<AppState>,
    Path(account_id): Path<i64>,
    Json(req): Json<CloseRequest>,
) -> Response {
    close_market(state, account_id, PositionSide::Short, req).await
}

async fn get_balance(State(state): State<AppState>, Path(account_id): Path<i64>) -> Response {
    let (_, venue) = match account_venue(&state, account_id).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.engine.get_balance(account_id, venue).await {
        Ok(balance) => response::success(balance),
        Err(e) => engine_error(e),
    }
}

async fn get_positions(State(state): State<AppState>, Path(account_id): Path<i64>) -> Response {
    let (_, venue) = match account_venue(&state, account_id).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.engine.get_positions(account_id, venue).await {
        Ok(positions) => response::success(positions),
        Err(e) => engine_error(e),
    }
}

#[derive(Deserialize)]
struct LeverageRequest {
    symbol: String,
    leverage: u32,
}

async fn set_leverage(
    State(state): State<AppState>,
    Path(account_id): Path<i64>,
    Json(req): Json<LeverageRequest>,
) -> Response {
    match state
        .engine
        .set_leverage(account_id, &req.symbol, req.leverage)
        .await
    {
        Ok(()) => response::success(json!({"symbol": req.symbol, "leverage": req.leverage})),
        Err(e) => engine_error(e),
    }
}

#[derive(Deserialize)]
struct StopLevelRequest {
    symbol: String,
    #[serde(default)]
    side: Option<PositionSide>,
    price: f64,
}

async fn set_stop_loss(
    State(state): State<AppState>,
    Path(account_id): Path<i64>,
    Json(req): Json<StopLevelRequest>,
) -> Response {
    let side = req.side.unwrap_or(PositionSide::Long);
    match state
        .engine
        .set_stop_loss(account_id, &req.symbol, side, req.price)
        .await
    {
        Ok(()) => response::success(json!({"symbol": req.symbol, "stop_loss": req.price})),
        Err(e) => engine_error(e),
    }
}

async fn set_take_profit(
    State(state): State<AppState>,
    Path(account_id): Path<i64>,
    Json(req): Json<StopLevelRequest>,
) -> Response {
    let side = req.side.unwrap_or(PositionSide::Long);
    match state
        .engine
        .set_take_profit(account_id, &req.symbol, side, req.price)
        .await
    {
        Ok(()) => response::success(json!({"symbol": req.symbol, "take_profit": req.price})),
        Err(e) => engine_error(e),
    }
}

async fn get_orders(
    State(state): State<AppState>,
    Path(account_id): Path<i64>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    let symbol = params.get("symbol").map(String::as_str);

    let mut orders = match state.engine.get_open_orders(account_id, symbol).await {
        Ok(orders) => orders,
        Err(e) => return engine_error(e),
    };
    match state.engine.get_open_algo_orders(account_id, symbol).await {
        Ok(algo) => orders.extend(algo),
        Err(e) => return engine_error(e),
    }
    response::success(orders)
}

async fn get_order(
    State(state): State<AppState>,
    Path((account_id, order_id)): Path<(i64, i64)>,
) -> Response {
    match state.engine.get_order(account_id, order_id).await {
        Ok(order) => response::success(order),
        Err(e) => engine_error(e),
    }
}

async fn get_trades(
    State(state): State<AppState>,
    Path(account_id): Path<i64>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    let limit: i64 = params
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(100);

    match state.engine.get_trades(account_id, limit).await {
        Ok(trades) => response::success(trades),
        Err(e) => engine_error(e),
    }
}

async fn get_closed_pnl(
    State(state): State<AppState>,
    Path(account_id): Path<i64>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    let page: i64 = params.get("page").and_then(|v| v.parse().ok()).unwrap_or(1);
    let page_size: i64 = params
        .get("page_size")
        .and_then(|v| v.parse().ok())
        .unwrap_or(20);

    match state.engine.get_closed_pnl(account_id, page, page_size).await {
        Ok((records, total)) => response::success_paginated(records, total, page, page_size),
        Err(e) => engine_error(e),
    }
}
