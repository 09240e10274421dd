//! Bitget v2 mix 门面
//!
//! 统一封套 `{"code":"00000","msg":"success","requestTime":ms,"data":...}`。
//! plan order（loss_plan / profit_plan）只建条件单等待触发。

use axum::extract::{Extension, RawQuery, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;

use crate::common::exchange::Exchange;
use crate::common::time_util::get_timestamp_ms;
use crate::engine::types::{ClosePositionRequest, ConditionalOrderRequest, OpenPositionRequest};
use crate::engine::EngineError;
use crate::facade::{auth, fmt8, parse_params, AppState, AuthedAccount};
use crate::store::models::{Order, OrderType, PositionSide};

const VENUE: Exchange = Exchange::Bitget;

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/v2/public/time", get(get_time))
        .route("/api/v2/mix/market/contracts", get(get_contracts))
        .route("/api/v2/mix/market/ticker", get(get_ticker))
        .with_state(state.clone());

    let private = Router::new()
        .route("/api/v2/mix/account/account", get(get_account))
        .route("/api/v2/mix/account/set-leverage", post(set_leverage))
        .route("/api/v2/mix/position/all-position", get(get_all_positions))
        .route("/api/v2/mix/order/place-order", post(place_order))
        .route("/api/v2/mix/order/cancel-order", post(cancel_order))
        .route("/api/v2/mix/order/cancel-all-orders", post(cancel_all_orders))
        .route("/api/v2/mix/order/orders-pending", get(get_pending_orders))
        .route("/api/v2/mix/order/place-plan-order", post(place_plan_order))
        .route("/api/v2/mix/order/cancel-plan-order", post(cancel_plan_order))
        .route("/api/v2/mix/order/orders-plan-pending", get(get_pending_plan_orders))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::bitget_auth))
        .with_state(state);

    public.merge(private)
}

fn ok<T: serde::Serialize>(data: T) -> Response {
    Json(json!({
        "code": "00000",
        "msg": "success",
        "requestTime": get_timestamp_ms(),
        "data": data,
    }))
    .into_response()
}

async fn get_time() -> Response {
    ok(json!({"serverTime": get_timestamp_ms().to_string()}))
}

async fn get_contracts(State(state): State<AppState>) -> Response {
    if let Some(data) = state.exchange_info.get_exchange_info(VENUE).await {
        return Json(data).into_response();
    }
    ok(json!([]))
}

async fn get_ticker(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    let symbol = params.get("symbol").cloned().unwrap_or_default();

    match state.prices.get_price(VENUE, &symbol).await {
        Ok(price) => {
            let update = state.prices.get_price_update(VENUE, &symbol).await;
            let (bid, ask) = update
                .map(|u| (u.bid_price, u.ask_price))
                .unwrap_or((0.0, 0.0));
            ok(json!([{
                "symbol": symbol,
                "lastPr": fmt8(price),
                "markPrice": fmt8(price),
                "indexPrice": fmt8(price),
                "bidPr": fmt8(bid),
                "askPr": fmt8(ask),
                "ts": get_timestamp_ms().to_string(),
            }]))
        }
        Err(_) => error_response(&EngineError::InvalidSymbol),
    }
}

async fn get_account(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
) -> Response {
    match state.engine.get_balance(account.id, VENUE).await {
        Ok(balance) => ok(json!({
            "marginCoin": "USDT",
            "available": fmt8(balance.available),
            "frozen": "0",
            "locked": fmt8(balance.margin),
            "accountEquity": fmt8(balance.equity),
            "usdtEquity": fmt8(balance.equity),
            "unrealizedPL": fmt8(balance.unrealized_pnl),
            "crossedMaxAvailable": fmt8(balance.available),
            "crossedMarginLeverage": account.default_leverage,
        })),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct SetLeverageRequest {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    leverage: String,
}

async fn set_leverage(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(req): Json<SetLeverageRequest>,
) -> Response {
    let leverage: u32 = req.leverage.parse().unwrap_or(0);
    match state.engine.set_leverage(account.id, &req.symbol, leverage).await {
        Ok(()) => ok(json!({
            "symbol": req.symbol,
            "marginCoin": "USDT",
            "longLeverage": req.leverage,
            "shortLeverage": req.leverage,
            "crossMarginLeverage": req.leverage,
        })),
        Err(e) => error_response(&e),
    }
}

async fn get_all_positions(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
) -> Response {
    let positions = match state.engine.get_positions(account.id, VENUE).await {
        Ok(positions) => positions,
        Err(e) => return error_response(&e),
    };

    let list: Vec<_> = positions
        .iter()
        .map(|pos| {
            json!({
                "symbol": pos.symbol,
                "marginCoin": "USDT",
                "holdSide": pos.side.as_str().to_lowercase(),
                "posMode": "hedge_mode",
                "total": fmt8(pos.quantity),
                "available": fmt8(pos.quantity),
                "openPriceAvg": fmt8(pos.entry_price),
                "markPrice": fmt8(pos.mark_price),
                "unrealizedPL": fmt8(pos.unrealized_pnl),
                "leverage": pos.leverage,
                "liquidationPrice": fmt8(pos.liquidation_price),
                "marginSize": fmt8(pos.margin),
                "marginMode": if pos.margin_mode.as_str() == "cross" { "crossed" } else { "isolated" },
                "uTime": pos.updated_at.timestamp_millis().to_string(),
                "cTime": pos.created_at.timestamp_millis().to_string(),
            })
        })
        .collect();
    ok(list)
}

#[derive(Deserialize)]
struct PlaceOrderRequest {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    size: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    side: String,
    #[serde(default, rename = "tradeSide")]
    trade_side: String,
    #[serde(default, rename = "orderType")]
    order_type: String,
    #[serde(default, rename = "reduceOnly")]
    reduce_only: String,
}

async fn place_order(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(req): Json<PlaceOrderRequest>,
) -> Response {
    let quantity: f64 = req.size.parse().unwrap_or(0.0);
    let price: f64 = req.price.parse().unwrap_or(0.0);

    // open: buy=多 sell=空；close: sell=平多 buy=平空
    let position_side = if req.trade_side == "open" {
        if req.side == "buy" {
            PositionSide::Long
        } else {
            PositionSide::Short
        }
    } else if req.side == "sell" {
        PositionSide::Long
    } else {
        PositionSide::Short
    };

    let order_type = if req.order_type == "limit" {
        OrderType::Limit
    } else {
        OrderType::Market
    };
    let is_closing = req.trade_side == "close" || req.reduce_only == "YES";

    let result = if is_closing {
        let close_req = ClosePositionRequest {
            account_id: account.id,
            symbol: req.symbol.clone(),
            side: position_side,
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
            symbol: req.symbol.clone(),
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
        Ok(order) => ok(json!({
            "orderId": order.id.to_string(),
            "clientOid": order.client_order_id,
        })),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct PlanOrderRequest {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    size: String,
    #[serde(default)]
    side: String,
    #[serde(default, rename = "triggerPrice")]
    trigger_price: String,
    #[serde(default, rename = "planType")]
    plan_type: String,
    #[serde(default, rename = "holdSide")]
    hold_side: String,
}

/// loss_plan / profit_plan：创建条件单，触发由 worker 驱动
async fn place_plan_order(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(req): Json<PlanOrderRequest>,
) -> Response {
    let quantity: f64 = req.size.parse().unwrap_or(0.0);
    let trigger_price: f64 = req.trigger_price.parse().unwrap_or(0.0);

    // holdSide 优先；缺省时按出场方向推断（sell 保护多头）
    let position_side = match req.hold_side.as_str() {
        "long" => PositionSide::Long,
        "short" => PositionSide::Short,
        _ => {
            if req.side == "sell" {
                PositionSide::Long
            } else {
                PositionSide::Short
            }
        }
    };
    let order_type = match req.plan_type.as_str() {
        "profit_plan" => OrderType::TakeProfit,
        _ => OrderType::StopMarket,
    };

    let cond_req = ConditionalOrderRequest {
        account_id: account.id,
        symbol: req.symbol.clone(),
        side: position_side,
        quantity,
        order_type,
        stop_price: trigger_price,
        price: 0.0,
        reduce_only: true,
        close_position: quantity <= 0.0,
    };

    match state.engine.create_conditional_order(&cond_req, VENUE).await {
        Ok(order) => ok(json!({
            "orderId": order.id.to_string(),
            "clientOid": order.client_order_id,
        })),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct CancelOrderRequest {
    #[serde(default, rename = "orderId")]
    order_id: String,
}

async fn cancel_order(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(req): Json<CancelOrderRequest>,
) -> Response {
    let order_id: i64 = req.order_id.parse().unwrap_or(0);
    match state.engine.cancel_order(account.id, order_id).await {
        Ok(order) => ok(json!({
            "orderId": order.id.to_string(),
            "clientOid": order.client_order_id,
        })),
        Err(e) => error_response(&e),
    }
}

async fn cancel_plan_order(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(req): Json<CancelOrderRequest>,
) -> Response {
    let order_id: i64 = req.order_id.parse().unwrap_or(0);
    match state.engine.cancel_order(account.id, order_id).await {
        Ok(order) => ok(json!({
            "orderId": order.id.to_string(),
            "clientOid": order.client_order_id,
        })),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct CancelAllRequest {
    #[serde(default)]
    symbol: String,
}

async fn cancel_all_orders(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(req): Json<CancelAllRequest>,
) -> Response {
    let symbol = (!req.symbol.is_empty()).then_some(req.symbol.as_str());
    let count = state
        .engine
        .cancel_all_orders(account.id, symbol)
        .await
        .unwrap_or(0);
    ok(json!({"successList": [], "failureList": [], "total": count}))
}

async fn get_pending_orders(
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
    ok(json!({"entrustedList": list, "endId": ""}))
}

async fn get_pending_plan_orders(
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
                "orderId": order.id.to_string(),
                "clientOid": order.client_order_id,
                "symbol": order.symbol,
                "planType": if order.order_type == OrderType::TakeProfit { "profit_plan" } else { "loss_plan" },
                "triggerPrice": fmt8(order.stop_price),
                "size": fmt8(order.quantity),
                "side": order.side.as_str().to_lowercase(),
                "holdSide": order.position_side.as_str().to_lowercase(),
                "planStatus": "live",
                "cTime": order.created_at.timestamp_millis().to_string(),
            })
        })
        .collect();
    ok(json!({"entrustedList": list, "endId": ""}))
}

fn format_order(order: &Order) -> serde_json::Value {
    json!({
        "orderId": order.id.to_string(),
        "clientOid": order.client_order_id,
        "symbol": order.symbol,
        "size": fmt8(order.quantity),
        "price": fmt8(order.price),
        "side": order.side.as_str().to_lowercase(),
        "orderType": if order.order_type == OrderType::Limit { "limit" } else { "market" },
        "status": "live",
        "baseVolume": fmt8(order.filled_qty),
        "priceAvg": fmt8(order.avg_price),
        "cTime": order.created_at.timestamp_millis().to_string(),
        "uTime": order.updated_at.timestamp_millis().to_string(),
    })
}

/// 引擎错误 -> Bitget 原生错误码
fn error_response(error: &EngineError) -> Response {
    let (code, msg) = match error {
        EngineError::InsufficientBalance => ("45110", "Insufficient balance".to_string()),
        EngineError::InvalidSymbol => ("40018", "Invalid symbol".to_string()),
        EngineError::InvalidQuantity => ("40012", "Invalid size".to_string()),
        EngineError::NoOpenPosition | EngineError::PositionNotFound => {
            ("45112", "No position to close".to_string())
        }
        EngineError::SignatureInvalid => ("40009", "Invalid signature".to_string()),
        EngineError::Unauthorized | EngineError::AccountNotFound => {
            ("40001", "Invalid API Key".to_string())
        }
        other => ("50000", other.to_string()),
    };
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "code": code,
            "msg": msg,
            "requestTime": get_timestamp_ms(),
            "data": null,
        })),
    )
        .into_response()
}
