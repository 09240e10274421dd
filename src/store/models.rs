use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::common::exchange::Exchange;

/// 保证金模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Cross,
    Isolated,
}

impl MarginMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginMode::Cross => "cross",
            MarginMode::Isolated => "isolated",
        }
    }
}

/// 持仓方向；订单上还会出现 BOTH（单向持仓模式）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
    Both,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
            PositionSide::Both => "BOTH",
        }
    }

    pub fn opposite(&self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
            PositionSide::Both => PositionSide::Both,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
    StopMarket,
    TrailingStopMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopLoss => "STOP_LOSS",
            OrderType::TakeProfit => "TAKE_PROFIT",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TrailingStopMarket => "TRAILING_STOP_MARKET",
        }
    }

    /// 条件单：创建时只落库，不吃价
    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            OrderType::StopLoss
                | OrderType::TakeProfit
                | OrderType::StopMarket
                | OrderType::TrailingStopMarket
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::Rejected => "REJECTED",
        }
    }
}

/// 平仓原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Manual,
    StopLoss,
    TakeProfit,
    Liquidation,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Manual => "manual",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::Liquidation => "liquidation",
        }
    }
}

/// 模拟账户，绑定唯一交易所
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: i64,
    pub user_id: i64,
    pub exchange_type: Exchange,
    pub api_key: String,
    #[serde(skip_serializing)]
    pub api_secret_encrypted: String,
    #[serde(skip_serializing)]
    pub passphrase_encrypted: Option<String>,
    pub balance_usdt: f64,
    pub initial_balance: f64,
    pub margin_mode: MarginMode,
    pub hedge_mode: bool,
    pub default_leverage: i32,
    pub maker_fee_rate: f64,
    pub taker_fee_rate: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Position {
    pub id: i64,
    pub account_id: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: i32,
    pub margin_mode: MarginMode,
    pub margin: f64,
    pub unrealized_pnl: f64,
    pub liquidation_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// 按给定标记价计算未实现盈亏
    pub fn unrealized_pnl_at(&self, mark_price: f64) -> f64 {
        match self.side {
            PositionSide::Long => (mark_price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - mark_price) * self.quantity,
            PositionSide::Both => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: i64,
    pub account_id: i64,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: f64,
    pub stop_price: f64,
    pub filled_qty: f64,
    pub avg_price: f64,
    pub status: OrderStatus,
    pub reduce_only: bool,
    pub close_position: bool,
    pub time_in_force: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn is_pending(&self) -> bool {
        matches!(self.status, OrderStatus::New | OrderStatus::PartiallyFilled)
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }
}

/// 成交记录，只增不改
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Trade {
    pub id: i64,
    pub account_id: i64,
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub fee: f64,
    pub fee_currency: String,
    pub realized_pnl: f64,
    pub is_maker: bool,
    pub executed_at: DateTime<Utc>,
}

/// 仓位清零时的结算记录，只增不改
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClosedPnlRecord {
    pub id: i64,
    pub account_id: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub total_fee: f64,
    pub leverage: i32,
    pub closed_reason: CloseReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_lifecycle_predicates() {
        let mut order = Order {
            id: 1,
            account_id: 1,
            client_order_id: "c1".into(),
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            position_side: PositionSide::Long,
            order_type: OrderType::Market,
            quantity: 1.0,
            price: 0.0,
            stop_price: 0.0,
            filled_qty: 0.0,
            avg_price: 0.0,
            status: OrderStatus::New,
            reduce_only: false,
            close_position: false,
            time_in_force: "GTC".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(order.is_pending());
        assert!(!order.is_completed());
        order.status = OrderStatus::Filled;
        assert!(order.is_completed());
    }

    #[test]
    fn test_conditional_order_types() {
        assert!(OrderType::StopMarket.is_conditional());
        assert!(OrderType::TakeProfit.is_conditional());
        assert!(OrderType::StopLoss.is_conditional());
        assert!(!OrderType::Market.is_conditional());
        assert!(!OrderType::Limit.is_conditional());
    }

    #[test]
    fn test_unrealized_pnl_sign() {
        let mut position = Position {
            id: 1,
            account_id: 1,
            symbol: "BTCUSDT".into(),
            side: PositionSide::Long,
            quantity: 0.5,
            entry_price: 50_000.0,
            mark_price: 0.0,
            leverage: 10,
            margin_mode: MarginMode::Cross,
            margin: 2_500.0,
            unrealized_pnl: 0.0,
            liquidation_price: 0.0,
            stop_loss: None,
            take_profit: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!((position.unrealized_pnl_at(51_000.0) - 500.0).abs() < 1e-9);
        position.side = PositionSide::Short;
        assert!((position.unrealized_pnl_at(51_000.0) + 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(
            serde_json::to_string(&OrderType::TrailingStopMarket).unwrap(),
            "\"TRAILING_STOP_MARKET\""
        );
        assert_eq!(serde_json::to_string(&PositionSide::Both).unwrap(), "\"BOTH\"");
        assert_eq!(
            serde_json::to_string(&CloseReason::StopLoss).unwrap(),
            "\"stop_loss\""
        );
    }
}
