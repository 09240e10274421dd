//! Binance USDⓈ-M 合约门面
//!
//! 路径、字段名、错误码与 /fapi 实盘对齐；数字都是 8 位小数字符串。
//! STOP_MARKET / TAKE_PROFIT 一律走条件单：只建 NEW 单等待触发，
//! 创建时绝不开新仓。

use axum::extract::{Extension, RawQuery, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde_json::json;

use crate::common::exchange::Exchange;
use crate::common::time_util::get_timestamp_ms;
use crate::engine::types::{ClosePositionRequest, ConditionalOrderRequest, OpenPositionRequest};
use crate::engine::EngineError;
use crate::facade::{auth, fmt8, parse_params, AppState, AuthedAccount};
use crate::store::models::{Order, OrderType, PositionSide};

const VENUE: Exchange = Exchange::Binance;

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/fapi/v1/time", get(get_time))
        .route("/fapi/v1/exchangeInfo", get(get_exchange_info))
        .route("/fapi/v1/premiumIndex", get(get_mark_price))
        .route("/fapi/v2/ticker/price", get(get_ticker_price))
        .with_state(state.clone());

    let private = Router::new()
        .route(
            "/fapi/v1/order",
            post(create_order).delete(cancel_order).get(query_order),
        )
        .route("/fapi/v1/openOrders", get(get_open_orders))
        .route("/fapi/v1/allOpenOrders", delete(cancel_all_open_orders))
        .route("/fapi/v1/leverage", post(set_leverage))
        .route("/fapi/v1/marginType", post(set_margin_type))
        .route(
            "/fapi/v1/algoOrder",
            post(create_algo_order).delete(cancel_algo_order),
        )
        .route("/fapi/v1/openAlgoOrders", get(get_open_algo_orders))
        .route("/fapi/v1/allOpenAlgoOrders", delete(cancel_all_algo_orders))
        .route("/fapi/v2/account", get(get_account))
        .route("/fapi/v2/balance", get(get_balance))
        .route("/fapi/v2/positionRisk", get(get_position_risk))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::binance_auth,
        ))
        .with_state(state);

    public.merge(private)
}

async fn get_time() -> Response {
    Json(json!({"serverTime": get_timestamp_ms()})).into_response()
}

async fn get_exchange_info(State(state): State<AppState>) -> Response {
    if let Some(data) = state.exchange_info.get_exchange_info(VENUE).await {
        return Json(data).into_response();
    }
    Json(json!({
        "timezone": "UTC",
        "serverTime": get_timestamp_ms(),
        "futuresType": "U_MARGINED",
        "rateLimits": [],
        "exchangeFilters": [],
        "symbols": [],
    }))
    .into_response()
}

async fn get_mark_price(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    let symbol = params.get("symbol").cloned().unwrap_or_default();

    match state.prices.get_price(VENUE, &symbol).await {
        Ok(price) => Json(json!({
            "symbol": symbol,
            "markPrice": fmt8(price),
            "indexPrice": fmt8(price),
            "estimatedSettlePrice": fmt8(price),
            "lastFundingRate": "0.00010000",
            "nextFundingTime": get_timestamp_ms() + 8 * 3600 * 1000,
            "time": get_timestamp_ms(),
        }))
        .into_response(),
        Err(_) => error_response(&EngineError::InvalidSymbol),
    }
}

async fn get_ticker_price(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));

    if let Some(symbol) = params.get("symbol") {
        return match state.prices.get_price(VENUE, symbol).await {
            Ok(price) => Json(json!({
                "symbol": symbol,
                "price": fmt8(price),
                "time": get_timestamp_ms(),
            }))
            .into_response(),
            Err(_) => error_response(&EngineError::InvalidSymbol),
        };
    }

    let prices = state.prices.get_all_prices(VENUE).await;
    let list: Vec<_> = prices
        .into_iter()
        .map(|(symbol, price)| {
            json!({"symbol": symbol, "price": fmt8(price), "time": get_timestamp_ms()})
        })
        .collect();
    Json(list).into_response()
}

async fn create_order(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    RawQuery(query): RawQuery,
    body: String,
) -> Response {
    let mut params = parse_params(query.as_deref().unwrap_or(""));
    params.extend(parse_params(&body));

    let symbol = params.get("symbol").cloned().unwrap_or_default();
    if symbol.is_empty() {
        return missing_param("symbol");
    }
    let side = params.get("side").map(String::as_str).unwrap_or("");
    let position_side_param = params.get("positionSide").map(String::as_str).unwrap_or("");
    let order_type_param = params.get("type").map(String::as_str).unwrap_or("");
    let quantity: f64 = params
        .get("quantity")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);
    let price: f64 = params.get("price").and_then(|v| v.parse().ok()).unwrap_or(0.0);
    let stop_price: f64 = params
        .get("stopPrice")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);
    let reduce_only = params.get("reduceOnly").map(String::as_str) == Some("true");
    let close_position = params.get("closePosition").map(String::as_str) == Some("true");

    let position_side = match position_side_param {
        "LONG" => PositionSide::Long,
        "SHORT" => PositionSide::Short,
        _ => {
            if side == "BUY" {
                PositionSide::Long
            } else {
                PositionSide::Short
            }
        }
    };

    let order_type = match order_type_param {
        "LIMIT" => OrderType::Limit,
        "STOP" | "STOP_MARKET" | "STOP_LOSS" => OrderType::StopMarket,
        "TAKE_PROFIT" | "TAKE_PROFIT_MARKET" => OrderType::TakeProfit,
        _ => OrderType::Market,
    };

    // 条件单只落库等待触发
    if order_type.is_conditional() {
        let req = ConditionalOrderRequest {
            account_id: account.id,
            symbol,
            side: position_side,
            quantity,
            order_type,
            stop_price,
            price,
            reduce_only,
            close_position,
        };
        return match state.engine.create_conditional_order(&req, VENUE).await {
            Ok(order) => Json(format_order(&order)).into_response(),
            Err(e) => error_response(&e),
        };
    }

    // 对冲模式下 LONG+SELL / SHORT+BUY 是平仓；单向模式看 reduce 标记
    let is_closing = (position_side_param == "LONG" && side == "SELL")
        || (position_side_param == "SHORT" && side == "BUY")
        || reduce_only
        || close_position;

    let result = if is_closing {
        let req = ClosePositionRequest {
            account_id: account.id,
            symbol,
            side: position_side,
            quantity: (quantity > 0.0).then_some(quantity),
        };
        state.engine.close_position(&req, VENUE).await.map(|(o, _)| o)
    } else {
        let req = OpenPositionRequest {
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
        state.engine.open_position(&req, VENUE).await.map(|(o, _)| o)
    };

    match result {
        Ok(order) => Json(format_order(&order)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn create_algo_order(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    RawQuery(query): RawQuery,
    body: String,
) -> Response {
    let mut params = parse_params(query.as_deref().unwrap_or(""));
    params.extend(parse_params(&body));

    let symbol = params.get("symbol").cloned().unwrap_or_default();
    if symbol.is_empty() {
        return missing_param("symbol");
    }
    let position_side = match params.get("positionSide").map(String::as_str) {
        Some("LONG") => PositionSide::Long,
        _ => PositionSide::Short,
    };
    let order_type = match params.get("orderType").map(String::as_str).unwrap_or("") {
        "TAKE_PROFIT" | "TAKE_PROFIT_MARKET" => OrderType::TakeProfit,
        "TRAILING_STOP_MARKET" => OrderType::TrailingStopMarket,
        _ => OrderType::StopMarket,
    };
    let quantity: f64 = params
        .get("quantity")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);
    let trigger_price: f64 = params
        .get("triggerPrice")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);
    let price: f64 = params.get("price").and_then(|v| v.parse().ok()).unwrap_or(0.0);
    let reduce_only = params.get("reduceOnly").map(String::as_str) == Some("true");
    let close_position = params.get("closePosition").map(String::as_str) == Some("true");

    let req = ConditionalOrderRequest {
        account_id: account.id,
        symbol,
        side: position_side,
        quantity,
        order_type,
        stop_price: trigger_price,
        price,
        reduce_only,
        close_position,
    };

    match state.engine.create_conditional_order(&req, VENUE).await {
        Ok(order) => Json(json!({
            "clientAlgoId": order.client_order_id,
            "algoId": order.id,
            "success": true,
            "code": "200",
            "msg": "OK",
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_open_algo_orders(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    let symbol = params.get("symbol").map(String::as_str);

    let orders = state
        .engine
        .get_open_algo_orders(account.id, symbol)
        .await
        .unwrap_or_default();

    let list: Vec<_> = orders
        .iter()
        .map(|order| {
            json!({
                "algoId": order.id,
                "clientAlgoId": order.client_order_id,
                "symbol": order.symbol,
                "side": order.side.as_str(),
                "positionSide": order.position_side.as_str(),
                "orderType": order.order_type.as_str(),
                "triggerPrice": fmt8(order.stop_price),
                "quantity": fmt8(order.quantity),
                "reduceOnly": order.reduce_only,
                "closePosition": order.close_position,
                "algoStatus": "NEW",
                "bookTime": order.created_at.timestamp_millis(),
                "updateTime": order.updated_at.timestamp_millis(),
            })
        })
        .collect();

    Json(json!({"total": list.len(), "orders": list})).into_response()
}

async fn cancel_algo_order(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    if params.get("symbol").map_or(true, String::is_empty) {
        return missing_param("symbol");
    }
    let algo_id: i64 = params
        .get("algoId")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    match state.engine.cancel_order(account.id, algo_id).await {
        Ok(order) => Json(json!({
            "algoId": order.id,
            "success": true,
            "code": "200",
            "msg": "OK",
        }))
        .into_response(),
        Err(_) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"code": -2011, "msg": "Unknown order sent."})),
        )
            .into_response(),
    }
}

async fn cancel_all_algo_orders(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    let symbol = params.get("symbol").cloned().unwrap_or_default();
    if symbol.is_empty() {
        return missing_param("symbol");
    }

    let count = state
        .engine
        .cancel_all_algo_orders(account.id, Some(&symbol))
        .await
        .unwrap_or(0);
    Json(json!({
        "code": 200,
        "msg": "The operation of cancel all open algo orders is done.",
        "data": count,
    }))
    .into_response()
}

async fn cancel_order(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    if params.get("symbol").map_or(true, String::is_empty) {
        return missing_param("symbol");
    }
    let order_id: i64 = params
        .get("orderId")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    match state.engine.cancel_order(account.id, order_id).await {
        Ok(order) => Json(json!({
            "orderId": order.id,
            "symbol": order.symbol,
            "status": "CANCELED",
            "clientOrderId": order.client_order_id,
            "origQty": fmt8(order.quantity),
            "executedQty": fmt8(order.filled_qty),
            "type": order.order_type.as_str(),
            "side": order.side.as_str(),
            "updateTime": get_timestamp_ms(),
        }))
        .into_response(),
        Err(_) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"code": -2011, "msg": "Unknown order sent."})),
        )
            .into_response(),
    }
}

async fn query_order(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    let order_id: i64 = params
        .get("orderId")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    match state.engine.get_order(account.id, order_id).await {
        Ok(order) => Json(format_order(&order)).into_response(),
        Err(_) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"code": -2013, "msg": "Order does not exist."})),
        )
            .into_response(),
    }
}

async fn get_open_orders(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    let symbol = params.get("symbol").map(String::as_str);

    let orders = state
        .engine
        .get_open_orders(account.id, symbol)
        .await
        .unwrap_or_default();
    let list: Vec<_> = orders.iter().map(format_order).collect();
    Json(list).into_response()
}

async fn cancel_all_open_orders(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    let symbol = params.get("symbol").cloned().unwrap_or_default();
    if symbol.is_empty() {
        return missing_param("symbol");
    }

    match state.engine.cancel_all_orders(account.id, Some(&symbol)).await {
        Ok(count) => Json(json!({
            "code": 200,
            "msg": "The operation of cancel all open orders is done.",
            "data": count,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn set_leverage(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    RawQuery(query): RawQuery,
    body: String,
) -> Response {
    let mut params = parse_params(query.as_deref().unwrap_or(""));
    params.extend(parse_params(&body));

    let symbol = params.get("symbol").cloned().unwrap_or_default();
    if symbol.is_empty() {
        return missing_param("symbol");
    }
    let leverage: u32 = params
        .get("leverage")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    match state.engine.set_leverage(account.id, &symbol, leverage).await {
        Ok(()) => Json(json!({
            "leverage": leverage,
            "maxNotionalValue": "1000000",
            "symbol": symbol,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn set_margin_type(RawQuery(query): RawQuery, body: String) -> Response {
    let mut params = parse_params(query.as_deref().unwrap_or(""));
    params.extend(parse_params(&body));
    if params.get("symbol").map_or(true, String::is_empty) {
        return missing_param("symbol");
    }
    Json(json!({"code": 200, "msg": "success"})).into_response()
}

async fn get_account(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
) -> Response {
    let balance = match state.engine.get_balance(account.id, VENUE).await {
        Ok(balance) => balance,
        Err(e) => return error_response(&e),
    };
    let positions = state
        .engine
        .get_positions(account.id, VENUE)
        .await
        .unwrap_or_default();

    let position_list: Vec<_> = positions
        .iter()
        .map(|pos| {
            json!({
                "symbol": pos.symbol,
                "positionAmt": fmt8(pos.quantity),
                "entryPrice": fmt8(pos.entry_price),
                "markPrice": fmt8(pos.mark_price),
                "unRealizedProfit": fmt8(pos.unrealized_pnl),
                "liquidationPrice": fmt8(pos.liquidation_price),
                "leverage": pos.leverage.to_string(),
                "marginType": pos.margin_mode.as_str(),
                "positionSide": pos.side.as_str(),
                "updateTime": pos.updated_at.timestamp_millis(),
            })
        })
        .collect();

    Json(json!({
        "feeTier": 0,
        "canTrade": true,
        "canDeposit": true,
        "canWithdraw": true,
        "updateTime": get_timestamp_ms(),
        "totalInitialMargin": fmt8(balance.margin),
        "totalMaintMargin": fmt8(balance.margin * 0.5),
        "totalWalletBalance": fmt8(balance.balance),
        "totalUnrealizedProfit": fmt8(balance.unrealized_pnl),
        "totalMarginBalance": fmt8(balance.equity),
        "totalPositionInitialMargin": fmt8(balance.margin),
        "totalOpenOrderInitialMargin": "0",
        "totalCrossWalletBalance": fmt8(balance.balance),
        "totalCrossUnPnl": fmt8(balance.unrealized_pnl),
        "availableBalance": fmt8(balance.available),
        "maxWithdrawAmount": fmt8(balance.available),
        "assets": [{
            "asset": "USDT",
            "walletBalance": fmt8(balance.balance),
            "unrealizedProfit": fmt8(balance.unrealized_pnl),
            "marginBalance": fmt8(balance.equity),
            "maintMargin": fmt8(balance.margin * 0.5),
            "initialMargin": fmt8(balance.margin),
            "positionInitialMargin": fmt8(balance.margin),
            "openOrderInitialMargin": "0",
            "maxWithdrawAmount": fmt8(balance.available),
            "crossWalletBalance": fmt8(balance.balance),
            "crossUnPnl": fmt8(balance.unrealized_pnl),
            "availableBalance": fmt8(balance.available),
            "marginAvailable": true,
            "updateTime": get_timestamp_ms(),
        }],
        "positions": position_list,
    }))
    .into_response()
}

async fn get_balance(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
) -> Response {
    match state.engine.get_balance(account.id, VENUE).await {
        Ok(balance) => Json(json!([{
            "accountAlias": "SgsR",
            "asset": "USDT",
            "balance": fmt8(balance.balance),
            "crossWalletBalance": fmt8(balance.balance),
            "crossUnPnl": fmt8(balance.unrealized_pnl),
            "availableBalance": fmt8(balance.available),
            "maxWithdrawAmount": fmt8(balance.available),
            "marginAvailable": true,
            "updateTime": get_timestamp_ms(),
        }]))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_position_risk(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    let symbol_filter = params.get("symbol").cloned().unwrap_or_default();

    let positions = match state.engine.get_positions(account.id, VENUE).await {
        Ok(positions) => positions,
        Err(e) => return error_response(&e),
    };

    let list: Vec<_> = positions
        .iter()
        .filter(|pos| symbol_filter.is_empty() || pos.symbol == symbol_filter)
        .map(|pos| {
            json!({
                "symbol": pos.symbol,
                "positionAmt": fmt8(pos.quantity),
                "entryPrice": fmt8(pos.entry_price),
                "markPrice": fmt8(pos.mark_price),
                "unRealizedProfit": fmt8(pos.unrealized_pnl),
                "liquidationPrice": fmt8(pos.liquidation_price),
                "leverage": pos.leverage.to_string(),
                "marginType": pos.margin_mode.as_str(),
                "isolatedMargin": fmt8(pos.margin),
                "isAutoAddMargin": "false",
                "positionSide": pos.side.as_str(),
                "updateTime": pos.updated_at.timestamp_millis(),
            })
        })
        .collect();

    Json(list).into_response()
}

fn format_order(order: &Order) -> serde_json::Value {
    json!({
        "orderId": order.id,
        "symbol": order.symbol,
        "status": order.status.as_str(),
        "clientOrderId": order.client_order_id,
        "price": fmt8(order.price),
        "avgPrice": fmt8(order.avg_price),
        "origQty": fmt8(order.quantity),
        "executedQty": fmt8(order.filled_qty),
        "cumQuote": fmt8(order.avg_price * order.filled_qty),
        "type": order.order_type.as_str(),
        "side": order.side.as_str(),
        "positionSide": order.position_side.as_str(),
        "stopPrice": fmt8(order.stop_price),
        "reduceOnly": order.reduce_only,
        "closePosition": order.close_position,
        "time": order.created_at.timestamp_millis(),
        "updateTime": order.updated_at.timestamp_millis(),
    })
}

fn missing_param(name: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "code": -1102,
            "msg": format!("Mandatory parameter '{}' was not sent.", name),
        })),
    )
        .into_response()
}

/// 引擎错误 -> Binance 原生错误码
fn error_response(error: &EngineError) -> Response {
    let (status, code, msg) = match error {
        EngineError::InsufficientBalance => (StatusCode::BAD_REQUEST, -2019, "Margin is insufficient.".to_string()),
        EngineError::InvalidSymbol => (StatusCode::BAD_REQUEST, -1121, "Invalid symbol.".to_string()),
        EngineError::InvalidQuantity => (StatusCode::BAD_REQUEST, -1013, "Invalid quantity.".to_string()),
        EngineError::NoOpenPosition => (StatusCode::BAD_REQUEST, -2022, "Position side not match.".to_string()),
        EngineError::InvalidLeverage => (StatusCode::BAD_REQUEST, -4028, "Invalid leverage.".to_string()),
        EngineError::OrderNotFound => (StatusCode::BAD_REQUEST, -2013, "Order does not exist.".to_string()),
        EngineError::SignatureInvalid => (
            StatusCode::UNAUTHORIZED,
            -1022,
            "Signature for this request is not valid.".to_string(),
        ),
        EngineError::Unauthorized | EngineError::AccountNotFound => (
            StatusCode::UNAUTHORIZED,
            -2015,
            "Invalid API-key, IP, or permissions for action.".to_string(),
        ),
        other => (StatusCode::INTERNAL_SERVER_ERROR, -1, other.to_string()),
    };
    (status, Json(json!({"code": code, "msg": msg}))).into_response()
}
