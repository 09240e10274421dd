//! Hyperliquid 门面
//!
//! 两个入口：POST /info（查询，按 body.type 分发）和 POST /exchange
//! （交易，按 body.action 分发）。响应要么 `{"status":"ok","response":{...}}`
//! 要么 `{"error":"..."}`。资产用下标表示，映射取自 meta universe 顺序。

use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use serde_json::json;

use crate::common::exchange::Exchange;
use crate::engine::types::{ClosePositionRequest, ConditionalOrderRequest, OpenPositionRequest};
use crate::engine::EngineError;
use crate::facade::{auth, fmt8, AppState, AuthedAccount};
use crate::market::hyperliquid::to_coin;
use crate::store::account_repo;
use crate::store::models::{Account, OrderStatus, OrderType, PositionSide};

const VENUE: Exchange = Exchange::Hyperliquid;

pub fn router(state: AppState) -> Router {
    let info = Router::new()
        .route("/info", post(info_handler))
        .with_state(state.clone());

    let exchange = Router::new()
        .route("/exchange", post(exchange_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::hyperliquid_auth,
        ))
        .with_state(state);

    info.merge(exchange)
}

fn error_json(msg: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response()
}

/// POST /info：type 分发
async fn info_handler(
    State(state): State<AppState>,
    Json(req): Json<serde_json::Value>,
) -> Response {
    let info_type = req.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match info_type {
        "allMids" => get_all_mids(&state).await,
        "meta" => get_meta(&state).await,
        "clearinghouseState" => {
            let Some(account) = account_from_user(&state, &req).await else {
                return (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"})))
                    .into_response();
            };
            get_user_state(&state, &account).await
        }
        "openOrders" => {
            let Some(account) = account_from_user(&state, &req).await else {
                return (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"})))
                    .into_response();
            };
            get_open_orders(&state, &account).await
        }
        _ => error_json("Unknown info type"),
    }
}

/// info 请求带 user（钱包地址，即 api key），据此找账户
async fn account_from_user(state: &AppState, req: &serde_json::Value) -> Option<Account> {
    let user = req.get("user").and_then(|u| u.as_str())?;
    let account = account_repo::get_by_api_key(&state.pool, user).await.ok()??;
    (account.exchange_type == VENUE).then_some(account)
}

async fn get_all_mids(state: &AppState) -> Response {
    let prices = state.prices.get_all_prices(VENUE).await;
    let mids: serde_json::Map<String, serde_json::Value> = prices
        .into_iter()
        .map(|(symbol, price)| (to_coin(&symbol), json!(fmt8(price))))
        .collect();
    Json(serde_json::Value::Object(mids)).into_response()
}

async fn get_meta(state: &AppState) -> Response {
    if let Some(data) = state.exchange_info.get_exchange_info(VENUE).await {
        return Json(data).into_response();
    }
    let universe: Vec<_> = state
        .prices
        .all_symbols(VENUE)
        .into_iter()
        .map(|symbol| json!({"name": to_coin(&symbol), "szDecimals": 3}))
        .collect();
    Json(json!({"universe": universe})).into_response()
}

async fn get_user_state(state: &AppState, account: &Account) -> Response {
    let balance = match state.engine.get_balance(account.id, VENUE).await {
        Ok(balance) => balance,
        Err(e) => return error_response(&e),
    };
    let positions = state
        .engine
        .get_positions(account.id, VENUE)
        .await
        .unwrap_or_default();

    let asset_positions: Vec<_> = positions
        .iter()
        .map(|pos| {
            let szi = match pos.side {
                PositionSide::Short => -pos.quantity,
                _ => pos.quantity,
            };
            json!({
                "type": "oneWay",
                "position": {
                    "coin": to_coin(&pos.symbol),
                    "szi": fmt8(szi),
                    "entryPx": fmt8(pos.entry_price),
                    "positionValue": fmt8(pos.mark_price * pos.quantity),
                    "unrealizedPnl": fmt8(pos.unrealized_pnl),
                    "leverage": {"type": "cross", "value": pos.leverage},
                    "liquidationPx": fmt8(pos.liquidation_price),
                    "marginUsed": fmt8(pos.margin),
                },
            })
        })
        .collect();

    Json(json!({
        "marginSummary": {
            "accountValue": fmt8(balance.equity),
            "totalNtlPos": fmt8(balance.margin * 10.0),
            "totalRawUsd": fmt8(balance.balance),
            "totalMarginUsed": fmt8(balance.margin),
        },
        "crossMarginSummary": {
            "accountValue": fmt8(balance.equity),
            "totalNtlPos": fmt8(balance.margin * 10.0),
            "totalRawUsd": fmt8(balance.balance),
            "totalMarginUsed": fmt8(balance.margin),
        },
        "withdrawable": fmt8(balance.available),
        "assetPositions": asset_positions,
    }))
    .into_response()
}

async fn get_open_orders(state: &AppState, account: &Account) -> Response {
    let mut orders = state
        .engine
        .get_open_orders(account.id, None)
        .await
        .unwrap_or_default();
    orders.extend(
        state
            .engine
            .get_open_algo_orders(account.id, None)
            .await
            .unwrap_or_default(),
    );

    let list: Vec<_> = orders
        .iter()
        .map(|order| {
            json!({
                "coin": to_coin(&order.symbol),
                "oid": order.id,
                "cloid": order.client_order_id,
                "side": if order.side == crate::store::models::OrderSide::Buy { "B" } else { "A" },
                "limitPx": fmt8(order.price),
                "triggerPx": fmt8(order.stop_price),
                "sz": fmt8(order.quantity),
                "origSz": fmt8(order.quantity),
                "timestamp": order.created_at.timestamp_millis(),
            })
        })
        .collect();
    Json(list).into_response()
}

/// POST /exchange：action 分发
async fn exchange_handler(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(req): Json<serde_json::Value>,
) -> Response {
    let action = req.get("action").and_then(|a| a.as_str()).unwrap_or("");
    match action {
        "order" => {
            // 带 trigger 的是 TP/SL 条件单
            let has_trigger = req
                .pointer("/orders/0/t/trigger")
                .map(|t| !t.is_null())
                .unwrap_or(false);
            if has_trigger {
                place_tpsl(&state, &account, &req).await
            } else {
                place_order(&state, &account, &req).await
            }
        }
        "cancel" => cancel_orders(&state, &account, &req).await,
        "updateLeverage" => update_leverage(&state, &account, &req).await,
        _ => error_json("Unknown action"),
    }
}

fn order_status_json(order: &crate::store::models::Order) -> serde_json::Value {
    // 市价成交回 filled，挂单回 resting
    if order.status == OrderStatus::Filled {
        json!({
            "status": "ok",
            "response": {
                "type": "order",
                "data": {"statuses": [{"filled": {
                    "oid": order.id,
                    "totalSz": fmt8(order.filled_qty),
                    "avgPx": fmt8(order.avg_price),
                }}]},
            },
        })
    } else {
        json!({
            "status": "ok",
            "response": {
                "type": "order",
                "data": {"statuses": [{"resting": {"oid": order.id}}]},
            },
        })
    }
}

async fn place_order(
    state: &AppState,
    account: &Account,
    req: &serde_json::Value,
) -> Response {
    let Some(order_map) = req.pointer("/orders/0") else {
        return error_json("Invalid orders");
    };

    let asset = order_map.get("a").and_then(|a| a.as_u64()).unwrap_or(0) as usize;
    let symbol = state
        .prices
        .hyperliquid()
        .symbol_for_asset(asset)
        .unwrap_or_else(|| "BTCUSDT".to_string());

    let is_buy = order_map.get("b").and_then(|b| b.as_bool()).unwrap_or(false);
    let price: f64 = order_map
        .get("p")
        .and_then(|p| p.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);
    let quantity: f64 = order_map
        .get("s")
        .and_then(|s| s.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);
    let reduce_only = order_map.get("r").and_then(|r| r.as_bool()).unwrap_or(false);

    let position_side = if is_buy {
        PositionSide::Long
    } else {
        PositionSide::Short
    };
    let order_type = if order_map.pointer("/t/market").is_some() {
        OrderType::Market
    } else {
        OrderType::Limit
    };

    let result = if reduce_only {
        // reduce-only 订单方向是出场方向，持仓在对面
        let close_req = ClosePositionRequest {
            account_id: account.id,
            symbol,
            side: position_side.opposite(),
            quantity: (quantity > 0.0).then_some(quantity),
        };
        state
            .engine
            .close_position(&close_req, VENUE)
            .await
            .map(|(order, _)| order)
    } else {
        let open_req = OpenPositionRequest {
            account_id: account.id,
            symbol,
            side: position_side,
            quantity,
            leverage: None,
            order_type,
            price,
            stop_loss: None,
            take_profit: None,
        };
        state
            .engine
            .open_position(&open_req, VENUE)
            .await
            .map(|(order, _)| order)
    };

    match result {
        Ok(order) => Json(order_status_json(&order)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn place_tpsl(
    state: &AppState,
    account: &Account,
    req: &serde_json::Value,
) -> Response {
    let Some(order_map) = req.pointer("/orders/0") else {
        return error_json("Invalid orders");
    };

    let asset = order_map.get("a").and_then(|a| a.as_u64()).unwrap_or(0) as usize;
    let symbol = state
        .prices
        .hyperliquid()
        .symbol_for_asset(asset)
        .unwrap_or_else(|| "BTCUSDT".to_string());

    let is_buy = order_map.get("b").and_then(|b| b.as_bool()).unwrap_or(false);
    let quantity: f64 = order_map
        .get("s")
        .and_then(|s| s.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);

    let trigger_price: f64 = order_map
        .pointer("/t/trigger/triggerPx")
        .and_then(|p| p.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);
    let tpsl = order_map
        .pointer("/t/trigger/tpsl")
        .and_then(|t| t.as_str())
        .unwrap_or("sl");

    // 触发单是出场单：买入触发保护空头，卖出触发保护多头
    let position_side = if is_buy {
        PositionSide::Short
    } else {
        PositionSide::Long
    };
    let order_type = if tpsl == "tp" {
        OrderType::TakeProfit
    } else {
        OrderType::StopMarket
    };

    let cond_req = ConditionalOrderRequest {
        account_id: account.id,
        symbol,
        side: position_side,
        quantity,
        order_type,
        stop_price: trigger_price,
        price: 0.0,
        reduce_only: true,
        close_position: quantity <= 0.0,
    };

    match state.engine.create_conditional_order(&cond_req, VENUE).await {
        Ok(order) => Json(json!({
            "status": "ok",
            "response": {
                "type": "order",
                "data": {"statuses": [{"resting": {"oid": order.id}}]},
            },
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn cancel_orders(
    state: &AppState,
    account: &Account,
    req: &serde_json::Value,
) -> Response {
    let cancels = req
        .get("cancels")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();

    let mut statuses = Vec::with_capacity(cancels.len());
    for cancel in cancels {
        let order_id = cancel.get("o").and_then(|o| o.as_i64()).unwrap_or(0);
        match state.engine.cancel_order(account.id, order_id).await {
            Ok(_) => statuses.push(json!("success")),
            Err(_) => statuses.push(json!({"error": "Order not found"})),
        }
    }

    Json(json!({
        "status": "ok",
        "response": {"type": "cancel", "data": {"statuses": statuses}},
    }))
    .into_response()
}

async fn update_leverage(
    state: &AppState,
    account: &Account,
    req: &serde_json::Value,
) -> Response {
    let asset = req.get("asset").and_then(|a| a.as_u64()).unwrap_or(0) as usize;
    let leverage = req.get("leverage").and_then(|l| l.as_u64()).unwrap_or(0) as u32;
    let symbol = state
        .prices
        .hyperliquid()
        .symbol_for_asset(asset)
        .unwrap_or_else(|| "BTCUSDT".to_string());

    match state.engine.set_leverage(account.id, &symbol, leverage).await {
        Ok(()) => Json(json!({"status": "ok", "response": {"type": "default"}})).into_response(),
        Err(e) => error_response(&e),
    }
}

/// 引擎错误 -> Hyperliquid 错误文案
fn error_response(error: &EngineError) -> Response {
    let msg = match error {
        EngineError::InsufficientBalance => "Insufficient margin".to_string(),
        EngineError::InvalidSymbol => "Invalid asset".to_string(),
        EngineError::InvalidQuantity => "Invalid size".to_string(),
        EngineError::NoOpenPosition | EngineError::PositionNotFound => {
            "No position to reduce".to_string()
        }
        EngineError::Unauthorized | EngineError::AccountNotFound => "Unauthorized".to_string(),
        other => other.to_string(),
    };
    let status = match error {
        EngineError::Database(_) | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({"error": msg}))).into_response()
}
