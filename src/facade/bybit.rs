//! Bybit v5 门面
//!
//! 统一封套 `{"retCode":0,"retMsg":"OK","result":{...},"time":ms}`。
//! positionIdx: 0 单向，1 对冲多头，2 对冲空头。
//! trading-stop 把 SL/TP 挂到持仓上，由 worker 监控触发。

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
use crate::engine::types::{ClosePositionRequest, OpenPositionRequest};
use crate::engine::EngineError;
use crate::facade::{auth, fmt8, parse_params, AppState, AuthedAccount};
use crate::store::models::{Order, OrderType, PositionSide};

const VENUE: Exchange = Exchange::Bybit;

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/v5/market/time", get(get_time))
        .route("/v5/market/instruments-info", get(get_instruments_info))
        .route("/v5/market/tickers", get(get_tickers))
        .with_state(state.clone());

    let private = Router::new()
        .route("/v5/account/wallet-balance", get(get_wallet_balance))
        .route("/v5/position/list", get(get_position_list))
        .route("/v5/position/set-leverage", post(set_leverage))
        .route("/v5/position/trading-stop", post(set_trading_stop))
        .route("/v5/order/create", post(create_order))
        .route("/v5/order/cancel", post(cancel_order))
        .route("/v5/order/cancel-all", post(cancel_all_orders))
        .route("/v5/order/realtime", get(get_open_orders))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::bybit_auth))
        .with_state(state);

    public.merge(private)
}

fn ok(result: serde_json::Value) -> Response {
    Json(json!({
        "retCode": 0,
        "retMsg": "OK",
        "result": result,
        "time": get_timestamp_ms(),
    }))
    .into_response()
}

async fn get_time() -> Response {
    let ms = get_timestamp_ms();
    ok(json!({
        "timeSecond": (ms / 1000).to_string(),
        "timeNano": (ms * 1_000_000).to_string(),
    }))
}

async fn get_instruments_info(State(state): State<AppState>) -> Response {
    if let Some(data) = state.exchange_info.get_exchange_info(VENUE).await {
        return Json(data).into_response();
    }
    ok(json!({"category": "linear", "list": []}))
}

async fn get_tickers(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    let symbol_filter = params.get("symbol").cloned().unwrap_or_default();

    let prices = state.prices.get_all_prices(VENUE).await;
    let mut list = Vec::new();
    for (symbol, price) in prices {
        if !symbol_filter.is_empty() && symbol != symbol_filter {
            continue;
        }
        let update = state.prices.get_price_update(VENUE, &symbol).await;
        let (bid, ask) = update
            .map(|u| (u.bid_price, u.ask_price))
            .unwrap_or((0.0, 0.0));
        list.push(json!({
            "symbol": symbol,
            "lastPrice": fmt8(price),
            "markPrice": fmt8(price),
            "indexPrice": fmt8(price),
            "bid1Price": fmt8(bid),
            "ask1Price": fmt8(ask),
        }));
    }

    ok(json!({"category": "linear", "list": list}))
}

async fn get_wallet_balance(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
) -> Response {
    match state.engine.get_balance(account.id, VENUE).await {
        Ok(balance) => ok(json!({
            "list": [{
                "accountType": "UNIFIED",
                "totalEquity": fmt8(balance.equity),
                "totalWalletBalance": fmt8(balance.balance),
                "totalMarginBalance": fmt8(balance.equity),
                "totalAvailableBalance": fmt8(balance.available),
                "totalPerpUPL": fmt8(balance.unrealized_pnl),
                "totalInitialMargin": fmt8(balance.margin),
                "totalMaintenanceMargin": fmt8(balance.margin * 0.5),
                "coin": [{
                    "coin": "USDT",
                    "walletBalance": fmt8(balance.balance),
                    "equity": fmt8(balance.equity),
                    "unrealisedPnl": fmt8(balance.unrealized_pnl),
                    "availableToWithdraw": fmt8(balance.available),
                    "totalPositionIM": fmt8(balance.margin),
                }],
            }],
        })),
        Err(e) => error_response(&e),
    }
}

async fn get_position_list(
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
            let (side, position_idx) = match pos.side {
                PositionSide::Short => ("Sell", 2),
                _ => ("Buy", 1),
            };
            json!({
                "symbol": pos.symbol,
                "side": side,
                "size": fmt8(pos.quantity),
                "avgPrice": fmt8(pos.entry_price),
                "markPrice": fmt8(pos.mark_price),
                "unrealisedPnl": fmt8(pos.unrealized_pnl),
                "leverage": pos.leverage.to_string(),
                "liqPrice": fmt8(pos.liquidation_price),
                "positionIM": fmt8(pos.margin),
                "positionIdx": position_idx,
                "stopLoss": pos.stop_loss.map(fmt8).unwrap_or_default(),
                "takeProfit": pos.take_profit.map(fmt8).unwrap_or_default(),
                "updatedTime": pos.updated_at.timestamp_millis().to_string(),
            })
        })
        .collect();

    ok(json!({"category": "linear", "list": list}))
}

#[derive(Deserialize)]
struct SetLeverageRequest {
    #[serde(default)]
    symbol: String,
    #[serde(default, rename = "buyLeverage")]
    buy_leverage: String,
}

async fn set_leverage(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(req): Json<SetLeverageRequest>,
) -> Response {
    let leverage: u32 = req.buy_leverage.parse().unwrap_or(0);
    match state.engine.set_leverage(account.id, &req.symbol, leverage).await {
        Ok(()) => ok(json!({})),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct TradingStopRequest {
    #[serde(default)]
    symbol: String,
    #[serde(default, rename = "takeProfit")]
    take_profit: String,
    #[serde(default, rename = "stopLoss")]
    stop_loss: String,
    #[serde(default, rename = "positionIdx")]
    position_idx: i64,
}

async fn set_trading_stop(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(req): Json<TradingStopRequest>,
) -> Response {
    let side = match req.position_idx {
        2 => PositionSide::Short,
        _ => PositionSide::Long,
    };

    if let Ok(stop_loss) = req.stop_loss.parse::<f64>() {
        if stop_loss > 0.0 {
            if let Err(e) = state
                .engine
                .set_stop_loss(account.id, &req.symbol, side, stop_loss)
                .await
            {
                return error_response(&e);
            }
        }
    }
    if let Ok(take_profit) = req.take_profit.parse::<f64>() {
        if take_profit > 0.0 {
            if let Err(e) = state
                .engine
                .set_take_profit(account.id, &req.symbol, side, take_profit)
                .await
            {
                return error_response(&e);
            }
        }
    }

    ok(json!({}))
}

#[derive(Deserialize)]
struct CreateOrderRequest {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    side: String,
    #[serde(default, rename = "orderType")]
    order_type: String,
    #[serde(default)]
    qty: String,
    #[serde(default)]
    price: String,
    #[serde(default, rename = "positionIdx")]
    position_idx: i64,
    #[serde(default, rename = "reduceOnly")]
    reduce_only: bool,
}

async fn create_order(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(req): Json<CreateOrderRequest>,
) -> Response {
    let quantity: f64 = req.qty.parse().unwrap_or(0.0);
    let price: f64 = req.price.parse().unwrap_or(0.0);

    // positionIdx 优先；单向模式回退到订单方向
    let position_side = match req.position_idx {
        1 => PositionSide::Long,
        2 => PositionSide::Short,
        _ => {
            if req.side == "Buy" {
                PositionSide::Long
            } else {
                PositionSide::Short
            }
        }
    };
    let order_type = match req.order_type.as_str() {
        "Limit" => OrderType::Limit,
        _ => OrderType::Market,
    };

    // 对冲模式下多头卖出 / 空头买入是平仓
    let is_closing = (req.position_idx == 1 && req.side == "Sell")
        || (req.position_idx == 2 && req.side == "Buy")
        || req.reduce_only;

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
            "orderLinkId": order.client_order_id,
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
            "orderLinkId": order.client_order_id,
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
    let normal = state
        .engine
        .cancel_all_orders(account.id, symbol)
        .await
        .unwrap_or(0);
    let algo = state
        .engine
        .cancel_all_algo_orders(account.id, symbol)
        .await
        .unwrap_or(0);

    ok(json!({"list": [], "success": ((normal + algo) > 0).to_string()}))
}

async fn get_open_orders(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    let symbol = params.get("symbol").map(String::as_str);

    let mut orders = state
        .engine
        .get_open_orders(account.id, symbol)
        .await
        .unwrap_or_default();
    let algo = state
        .engine
        .get_open_algo_orders(account.id, symbol)
        .await
        .unwrap_or_default();
    orders.extend(algo);

    let list: Vec<_> = orders.iter().map(format_order).collect();
    ok(json!({"category": "linear", "list": list}))
}

fn format_order(order: &Order) -> serde_json::Value {
    json!({
        "orderId": order.id.to_string(),
        "orderLinkId": order.client_order_id,
        "symbol": order.symbol,
        "side": if order.side == crate::store::models::OrderSide::Buy { "Buy" } else { "Sell" },
        "orderType": if order.order_type == OrderType::Limit { "Limit" } else { "Market" },
        "qty": fmt8(order.quantity),
        "price": fmt8(order.price),
        "triggerPrice": fmt8(order.stop_price),
        "orderStatus": order.status.as_str(),
        "reduceOnly": order.reduce_only,
        "closeOnTrigger": order.close_position,
        "createdTime": order.created_at.timestamp_millis().to_string(),
        "updatedTime": order.updated_at.timestamp_millis().to_string(),
    })
}

/// 引擎错误 -> Bybit 原生错误码
fn error_response(error: &EngineError) -> Response {
    let (ret_code, ret_msg) = match error {
        EngineError::InsufficientBalance => (110007, "Insufficient account balance".to_string()),
        EngineError::InvalidSymbol => (10001, "Invalid symbol".to_string()),
        EngineError::InvalidQuantity => (10001, "Invalid qty".to_string()),
        EngineError::InvalidLeverage => (10001, "Invalid leverage".to_string()),
        EngineError::NoOpenPosition | EngineError::PositionNotFound => {
            (110028, "position not exist".to_string())
        }
        EngineError::SignatureInvalid => (10004, "Invalid sign.".to_string()),
        EngineError::Unauthorized | EngineError::AccountNotFound => {
            (10003, "Invalid apiKey.".to_string())
        }
        other => (10000, other.to_string()),
    };
    (
        StatusCode::OK,
        Json(json!({
            "retCode": ret_code,
            "retMsg": ret_msg,
            "result": {},
            "time": get_timestamp_ms(),
        })),
    )
        .into_response()
}
