//! SL/TP 触发 worker
//!
//! 每秒扫一遍 NEW 状态的条件单，逐个对照聚合器里的最新价：
//!
//! | 类型                    | 持仓方向 | 触发条件            |
//! |-------------------------|----------|---------------------|
//! | STOP_MARKET / STOP_LOSS | LONG     | price <= stopPrice  |
//! | STOP_MARKET / STOP_LOSS | SHORT    | price >= stopPrice  |
//! | TAKE_PROFIT             | LONG     | price >= stopPrice  |
//! | TAKE_PROFIT             | SHORT    | price <= stopPrice  |
//!
//! 触发后走引擎的平仓事务，订单在同一事务内离开 NEW，天然至多一次。
//! 单任务顺序执行，tick 超时就让下一个 tick 接着扫，不做并行流水。

use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::common::exchange::Exchange;
use crate::engine::TradingEngine;
use crate::market::aggregator::PriceService;
use crate::store::models::{Order, OrderType, PositionSide};
use crate::store::order_repo;

/// 找价格时按这个顺序轮询各交易所
const PRICE_VENUES: [Exchange; 5] = [
    Exchange::Binance,
    Exchange::Okx,
    Exchange::Bybit,
    Exchange::Bitget,
    Exchange::Hyperliquid,
];

pub struct SltpWorker {
    engine: Arc<TradingEngine>,
    prices: Arc<PriceService>,
    tick: Duration,
}

impl SltpWorker {
    pub fn new(engine: Arc<TradingEngine>, prices: Arc<PriceService>) -> Self {
        Self {
            engine,
            prices,
            tick: Duration::from_secs(1),
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("[sltp] worker started, tick={:?}", self.tick);
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("[sltp] worker stopped");
                        return;
                    }
                }
                _ = ticker.tick() => self.check_and_trigger().await,
            }
        }
    }

    async fn check_and_trigger(&self) {
        let orders = match order_repo::list_pending_stop_orders(self.engine.pool()).await {
            Ok(orders) => orders,
            Err(e) => {
                error!("[sltp] failed to load pending orders: {}", e);
                return;
            }
        };
        if orders.is_empty() {
            return;
        }

        for order in orders {
            let Some((venue, price)) = self.lookup_price(&order.symbol).await else {
                // 本轮拿不到价就跳过这张单
                continue;
            };

            if !should_trigger(&order, price) {
                continue;
            }

            info!(
                "[sltp] triggering order {} (type={}, symbol={}, stop={:.8}, price={:.8})",
                order.id,
                order.order_type.as_str(),
                order.symbol,
                order.stop_price,
                price
            );

            match self.engine.execute_triggered_order(order.id, venue).await {
                Ok(Some(closed)) => info!(
                    "[sltp] order {} executed, pnl={:.8} reason={}",
                    order.id,
                    closed.realized_pnl,
                    closed.closed_reason.as_str()
                ),
                Ok(None) => {}
                Err(e) => warn!("[sltp] failed to execute order {}: {}", order.id, e),
            }
        }
    }

    async fn lookup_price(&self, symbol: &str) -> Option<(Exchange, f64)> {
        for venue in PRICE_VENUES {
            if let Ok(price) = self.prices.get_price(venue, symbol).await {
                if price > 0.0 {
                    return Some((venue, price));
                }
            }
        }
        None
    }
}

/// 触发判定，stopPrice 非法的单永远不触发
pub fn should_trigger(order: &Order, current_price: f64) -> bool {
    if order.stop_price <= 0.0 {
        return false;
    }

    let is_stop_loss = matches!(order.order_type, OrderType::StopMarket | OrderType::StopLoss);
    let is_take_profit = order.order_type == OrderType::TakeProfit;

    match (order.position_side, is_stop_loss, is_take_profit) {
        (PositionSide::Long, true, _) => current_price <= order.stop_price,
        (PositionSide::Short, true, _) => current_price >= order.stop_price,
        (PositionSide::Long, _, true) => current_price >= order.stop_price,
        (PositionSide::Short, _, true) => current_price <= order.stop_price,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{OrderSide, OrderStatus};
    use chrono::Utc;

    fn stop_order(order_type: OrderType, position_side: PositionSide, stop_price: f64) -> Order {
        Order {
            id: 1,
            account_id: 1,
            client_order_id: "c1".into(),
            symbol: "BTCUSDT".into(),
            side: OrderSide::Sell,
            position_side,
            order_type,
            quantity: 0.0,
            price: 0.0,
            stop_price,
            filled_qty: 0.0,
            avg_price: 0.0,
            status: OrderStatus::New,
            reduce_only: true,
            close_position: true,
            time_in_force: "GTC".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_stop_loss_long_triggers_at_or_below_stop() {
        let order = stop_order(OrderType::StopMarket, PositionSide::Long, 48_000.0);
        assert!(should_trigger(&order, 47_900.0));
        assert!(should_trigger(&order, 48_000.0));
        assert!(!should_trigger(&order, 48_100.0));
    }

    #[test]
    fn test_stop_loss_short_triggers_at_or_above_stop() {
        let order = stop_order(OrderType::StopLoss, PositionSide::Short, 52_000.0);
        assert!(should_trigger(&order, 52_100.0));
        assert!(should_trigger(&order, 52_000.0));
        assert!(!should_trigger(&order, 51_900.0));
    }

    #[test]
    fn test_take_profit_long_triggers_at_or_above_stop() {
        let order = stop_order(OrderType::TakeProfit, PositionSide::Long, 55_000.0);
        assert!(should_trigger(&order, 55_000.0));
        assert!(should_trigger(&order, 56_000.0));
        assert!(!should_trigger(&order, 54_999.0));
    }

    #[test]
    fn test_take_profit_short_triggers_at_or_below_stop() {
        let order = stop_order(OrderType::TakeProfit, PositionSide::Short, 45_000.0);
        assert!(should_trigger(&order, 44_000.0));
        assert!(!should_trigger(&order, 45_100.0));
    }

    #[test]
    fn test_invalid_stop_price_never_triggers() {
        let order = stop_order(OrderType::StopMarket, PositionSide::Long, 0.0);
        assert!(!should_trigger(&order, 1.0));
    }

    #[test]
    fn test_both_side_never_triggers() {
        let order = stop_order(OrderType::StopMarket, PositionSide::Both, 48_000.0);
        assert!(!should_trigger(&order, 47_000.0));
    }
}
