//! OKX v5 门面
//!
//! 统一封套 `{"code":"0","msg":"","data":[...]}`，时间戳是毫秒字符串，
//! 符号用 instId（BTC-USDT-SWAP）。order-algo 只建条件单，不直接平仓。

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
use crate::market::okx::{from_inst_id, to_inst_id};
use crate::store::models::{Order, OrderType, PositionSide};

const VENUE: Exchange = Exchange::Okx;

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/v5/public/time", get(get_time))
        .route("/api/v5/public/instruments", get(get_instruments))
        .route("/api/v5/public/mark-price", get(get_mark_price))
        .route("/api/v5/market/tickers", get(get_tickers))
        .with_state(state.clone());

    let private = Router::new()
        .route("/api/v5/account/balance", get(get_balance))
        .route("/api/v5/account/positions", get(get_positions))
        .route("/api/v5/account/set-leverage", post(set_leverage))
        .route("/api/v5/trade/order", post(create_order))
        .route("/api/v5/trade/cancel-order", post(cancel_order))
        .route("/api/v5/trade/cancel-batch-orders", post(cancel_batch_orders))
        .route("/api/v5/trade/orders-pending", get(get_open_orders))
        .route("/api/v5/trade/order-algo", post(create_algo_order))
        .route("/api/v5/trade/cancel-algos", post(cancel_algo_orders))
        .route("/api/v5/trade/orders-algo-pending", get(get_open_algo_orders))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::okx_auth))
        .with_state(state);

    public.merge(private)
}

fn ok<T: serde::Serialize>(data: T) -> Response {
    Json(json!({"code": "0", "msg": "", "data": data})).into_response()
}

async fn get_time() -> Response {
    ok(json!([{"ts": get_timestamp_ms().to_string()}]))
}

async fn get_instruments(State(state): State<AppState>) -> Response {
    if let Some(data) = state.exchange_info.get_exchange_info(VENUE).await {
        return Json(data).into_response();
    }
    ok(json!([]))
}

async fn get_mark_price(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    let inst_id = params.get("instId").cloned().unwrap_or_default();
    let symbol = from_inst_id(&inst_id);

    match state.prices.get_price(VENUE, &symbol).await {
        Ok(price) => ok(json!([{
            "instType": "SWAP",
            "instId": inst_id,
            "markPx": fmt8(price),
            "ts": get_timestamp_ms().to_string(),
        }])),
        Err(_) => error_response(&EngineError::InvalidSymbol),
    }
}

async fn get_tickers(State(state): State<AppState>) -> Response {
    let prices = state.prices.get_all_prices(VENUE).await;
    let list: Vec<_> = prices
        .into_iter()
        .map(|(symbol, price)| {
            json!({
                "instType": "SWAP",
                "instId": to_inst_id(&symbol),
                "last": fmt8(price),
                "markPx": fmt8(price),
                "ts": get_timestamp_ms().to_string(),
            })
        })
        .collect();
    ok(list)
}

async fn get_balance(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
) -> Response {
    match state.engine.get_balance(account.id, VENUE).await {
        Ok(balance) => ok(json!([{
            "totalEq": fmt8(balance.equity),
            "isoEq": "0",
            "adjEq": fmt8(balance.equity),
            "ordFroz": "0",
            "imr": fmt8(balance.margin),
            "mmr": "0",
            "notionalUsd": fmt8(balance.margin * 10.0),
            "mgnRatio": "999",
            "details": [{
                "ccy": "USDT",
                "eq": fmt8(balance.equity),
                "cashBal": fmt8(balance.balance),
                "availBal": fmt8(balance.available),
                "frozenBal": fmt8(balance.margin),
                "upl": fmt8(balance.unrealized_pnl),
                "uplLiab": "0",
            }],
            "uTime": get_timestamp_ms().to_string(),
        }])),
        Err(e) => error_response(&e),
    }
}

async fn get_positions(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    let inst_filter = params.get("instId").cloned().unwrap_or_default();

    let positions = match state.engine.get_positions(account.id, VENUE).await {
        Ok(positions) => positions,
        Err(e) => return error_response(&e),
    };

    let list: Vec<_> = positions
        .iter()
        .filter(|pos| inst_filter.is_empty() || to_inst_id(&pos.symbol) == inst_filter)
        .map(|pos| {
            json!({
                "instType": "SWAP",
                "instId": to_inst_id(&pos.symbol),
                "mgnMode": pos.margin_mode.as_str(),
                "posSide": pos.side.as_str().to_lowercase(),
                "pos": fmt8(pos.quantity),
                "avgPx": fmt8(pos.entry_price),
                "markPx": fmt8(pos.mark_price),
                "upl": fmt8(pos.unrealized_pnl),
                "lever": pos.leverage.to_string(),
                "liqPx": fmt8(pos.liquidation_price),
                "margin": fmt8(pos.margin),
                "uTime": pos.updated_at.timestamp_millis().to_string(),
                "cTime": pos.created_at.timestamp_millis().to_string(),
            })
        })
        .collect();

    ok(list)
}

#[derive(Deserialize)]
struct SetLeverageRequest {
    #[serde(rename = "instId")]
    inst_id: String,
    lever: String,
    #[serde(default, rename = "mgnMode")]
    mgn_mode: String,
    #[serde(default, rename = "posSide")]
    pos_side: String,
}

async fn set_leverage(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(req): Json<SetLeverageRequest>,
) -> Response {
    let symbol = from_inst_id(&req.inst_id);
    let leverage: u32 = req.lever.parse().unwrap_or(0);

    match state.engine.set_leverage(account.id, &symbol, leverage).await {
        Ok(()) => ok(json!([{
            "instId": req.inst_id,
            "lever": req.lever,
            "mgnMode": req.mgn_mode,
            "posSide": req.pos_side,
        }])),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct CreateOrderRequest {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(default, rename = "tdMode")]
    _td_mode: Option<String>,
    side: String,
    #[serde(default, rename = "posSide")]
    pos_side: String,
    #[serde(default, rename = "ordType")]
    ord_type: String,
    sz: String,
    #[serde(default)]
    px: String,
    #[serde(default, rename = "reduceOnly")]
    reduce_only: String,
}

async fn create_order(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(req): Json<CreateOrderRequest>,
) -> Response {
    let symbol = from_inst_id(&req.inst_id);
    let quantity: f64 = req.sz.parse().unwrap_or(0.0);
    let price: f64 = req.px.parse().unwrap_or(0.0);
    let reduce_only = req.reduce_only == "true";

    let position_side = match req.pos_side.as_str() {
        "long" => PositionSide::Long,
        "short" => PositionSide::Short,
        _ => {
            if req.side == "buy" {
                PositionSide::Long
            } else {
                PositionSide::Short
            }
        }
    };
    let order_type = match req.ord_type.as_str() {
        "limit" => OrderType::Limit,
        _ => OrderType::Market,
    };

    // 对冲模式下 long+sell / short+buy 是平仓
    let is_closing = (req.pos_side == "long" && req.side == "sell")
        || (req.pos_side == "short" && req.side == "buy")
        || reduce_only;

    let result = if is_closing {
        let close_req = ClosePositionRequest {
            account_id: account.id,
            symbol,
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
        Ok(order) => ok(json!([{
            "ordId": order.id.to_string(),
            "clOrdId": order.client_order_id,
            "tag": "",
            "sCode": "0",
            "sMsg": "",
        }])),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct AlgoOrderRequest {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(default)]
    side: String,
    #[serde(default, rename = "posSide")]
    pos_side: String,
    #[serde(default)]
    sz: String,
    #[serde(default, rename = "tpTriggerPx")]
    tp_trigger_px: String,
    #[serde(default, rename = "slTriggerPx")]
    sl_trigger_px: String,
    #[serde(default, rename = "closeFraction")]
    close_fraction: String,
}

/// SL/TP 条件单：创建后停在 NEW，由 worker 按触发价驱动
async fn create_algo_order(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(req): Json<AlgoOrderRequest>,
) -> Response {
    let symbol = from_inst_id(&req.inst_id);
    let quantity: f64 = req.sz.parse().unwrap_or(0.0);

    let position_side = match req.pos_side.as_str() {
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

    let (order_type, trigger_price) = if !req.sl_trigger_px.is_empty() {
        (OrderType::StopMarket, req.sl_trigger_px.parse().unwrap_or(0.0))
    } else {
        (OrderType::TakeProfit, req.tp_trigger_px.parse().unwrap_or(0.0))
    };

    let close_position = req.close_fraction == "1" || quantity <= 0.0;
    let cond_req = ConditionalOrderRequest {
        account_id: account.id,
        symbol,
        side: position_side,
        quantity,
        order_type,
        stop_price: trigger_price,
        price: 0.0,
        reduce_only: true,
        close_position,
    };

    match state.engine.create_conditional_order(&cond_req, VENUE).await {
        Ok(order) => ok(json!([{
            "algoId": order.id.to_string(),
            "algoClOrdId": order.client_order_id,
            "sCode": "0",
            "sMsg": "",
        }])),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct CancelOrderRequest {
    #[serde(default, rename = "instId")]
    _inst_id: String,
    #[serde(default, rename = "ordId")]
    ord_id: String,
}

async fn cancel_order(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(req): Json<CancelOrderRequest>,
) -> Response {
    let order_id: i64 = req.ord_id.parse().unwrap_or(0);
    match state.engine.cancel_order(account.id, order_id).await {
        Ok(order) => ok(json!([{
            "ordId": order.id.to_string(),
            "clOrdId": order.client_order_id,
            "sCode": "0",
            "sMsg": "",
        }])),
        Err(e) => error_response(&e),
    }
}

async fn cancel_batch_orders(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(reqs): Json<Vec<CancelOrderRequest>>,
) -> Response {
    let mut data = Vec::with_capacity(reqs.len());
    for req in reqs {
        let order_id: i64 = req.ord_id.parse().unwrap_or(0);
        match state.engine.cancel_order(account.id, order_id).await {
            Ok(order) => data.push(json!({
                "ordId": order.id.to_string(),
                "clOrdId": order.client_order_id,
                "sCode": "0",
                "sMsg": "",
            })),
            Err(_) => data.push(json!({
                "ordId": req.ord_id,
                "clOrdId": "",
                "sCode": "51400",
                "sMsg": "Cancellation failed as the order does not exist.",
            })),
        }
    }
    ok(data)
}

/// cancel-algos 请求体和 cancel-order 同构，algoId 字段名不同
#[derive(Deserialize)]
struct CancelAlgoRequest {
    #[serde(default, rename = "algoId")]
    algo_id: String,
}

async fn cancel_algo_orders(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(reqs): Json<Vec<CancelAlgoRequest>>,
) -> Response {
    let mut data = Vec::with_capacity(reqs.len());
    for req in reqs {
        let order_id: i64 = req.algo_id.parse().unwrap_or(0);
        match state.engine.cancel_order(account.id, order_id).await {
            Ok(order) => data.push(json!({
                "algoId": order.id.to_string(),
                "sCode": "0",
                "sMsg": "",
            })),
            Err(_) => data.push(json!({
                "algoId": req.algo_id,
                "sCode": "51400",
                "sMsg": "Cancellation failed as the order does not exist.",
            })),
        }
    }
    ok(data)
}

async fn get_open_orders(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    let symbol = params.get("instId").map(|inst| from_inst_id(inst));

    let orders = state
        .engine
        .get_open_orders(account.id, symbol.as_deref())
        .await
        .unwrap_or_default();
    let list: Vec<_> = orders.iter().map(format_order).collect();
    ok(list)
}

async fn get_open_algo_orders(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_params(query.as_deref().unwrap_or(""));
    let symbol = params.get("instId").map(|inst| from_inst_id(inst));

    let orders = state
        .engine
        .get_open_algo_orders(account.id, symbol.as_deref())
        .await
        .unwrap_or_default();

    let list: Vec<_> = orders
        .iter()
        .map(|order| {
            let (sl, tp) = match order.order_type {
                OrderType::TakeProfit => (String::new(), fmt8(order.stop_price)),
                _ => (fmt8(order.stop_price), String::new()),
            };
            json!({
                "algoId": order.id.to_string(),
                "algoClOrdId": order.client_order_id,
                "instType": "SWAP",
                "instId": to_inst_id(&order.symbol),
                "ordType": "conditional",
                "sz": fmt8(order.quantity),
                "posSide": order.position_side.as_str().to_lowercase(),
                "slTriggerPx": sl,
                "tpTriggerPx": tp,
                "state": "live",
                "cTime": order.created_at.timestamp_millis().to_string(),
            })
        })
        .collect();
    ok(list)
}

fn format_order(order: &Order) -> serde_json::Value {
    json!({
        "instType": "SWAP",
        "instId": to_inst_id(&order.symbol),
        "ordId": order.id.to_string(),
        "clOrdId": order.client_order_id,
        "px": fmt8(order.price),
        "sz": fmt8(order.quantity),
        "ordType": if order.order_type == OrderType::Limit { "limit" } else { "market" },
        "side": order.side.as_str().to_lowercase(),
        "posSide": order.position_side.as_str().to_lowercase(),
        "fillSz": fmt8(order.filled_qty),
        "avgPx": fmt8(order.avg_price),
        "state": "live",
        "cTime": order.created_at.timestamp_millis().to_string(),
        "uTime": order.updated_at.timestamp_millis().to_string(),
    })
}

/// 引擎错误 -> OKX 原生错误码
fn error_response(error: &EngineError) -> Response {
    let (code, msg) = match error {
        EngineError::InsufficientBalance => (
            "51008",
            "Order placement failed due to insufficient balance".to_string(),
        ),
        EngineError::InvalidSymbol => ("51001", "Instrument ID does not exist".to_string()),
        EngineError::InvalidQuantity => ("51001", "Order quantity must be greater than 0".to_string()),
        EngineError::NoOpenPosition => ("51010", "No positions to close".to_string()),
        EngineError::SignatureInvalid => ("50113", "Invalid signature.".to_string()),
        EngineError::Unauthorized | EngineError::AccountNotFound => {
            ("50111", "Invalid API Key.".to_string())
        }
        other => ("50000", other.to_string()),
    };
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"code": code, "msg": msg, "data": []})),
    )
        .into_response()
}
