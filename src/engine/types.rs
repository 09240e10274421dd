use serde::{Deserialize, Serialize};

use crate::store::models::{OrderType, PositionSide};

/// 开仓请求
#[derive(Debug, Clone, Deserialize)]
pub struct OpenPositionRequest {
    pub account_id: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    /// 不传则用账户缓存杠杆，再退回账户默认杠杆
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default = "default_order_type")]
    pub order_type: OrderType,
    /// 限价单价格
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

fn default_order_type() -> OrderType {
    OrderType::Market
}

/// 平仓请求；quantity 为 None 时全平
#[derive(Debug, Clone, Deserialize)]
pub struct ClosePositionRequest {
    pub account_id: i64,
    pub symbol: String,
    pub side: PositionSide,
    #[serde(default)]
    pub quantity: Option<f64>,
}

/// 条件单（SL/TP）请求，创建后停在 NEW 等待 worker 触发
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionalOrderRequest {
    pub account_id: i64,
    pub symbol: String,
    /// 要保护的持仓方向
    pub side: PositionSide,
    #[serde(default)]
    pub quantity: f64,
    pub order_type: OrderType,
    pub stop_price: f64,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub close_position: bool,
}

/// 余额视图，门面层各自渲染
#[derive(Debug, Clone, Serialize)]
pub struct BalanceView {
    pub balance: f64,
    pub available: f64,
    pub margin: f64,
    pub unrealized_pnl: f64,
    pub equity: f64,
    pub initial_balance: f64,
}
