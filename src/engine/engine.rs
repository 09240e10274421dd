//! 交易引擎
//!
//! 订单/仓位/余额状态机。每个交易操作一个事务，事务内先对目标仓位行
//! （首仓时对账户行）加排他锁，再读余额，防止并发请求重复占用保证金。
//!
//! 限价单只落库（NEW），没有撮合组件；撤单之前一直保持 NEW。
//! 条件单（SL/TP）创建时不吃价，由 SL/TP worker 按触发条件驱动执行。

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::common::exchange::Exchange;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::math;
use crate::engine::types::{
    BalanceView, ClosePositionRequest, ConditionalOrderRequest, OpenPositionRequest,
};
use crate::market::aggregator::PriceService;
use crate::store::models::{
    Account, CloseReason, ClosedPnlRecord, Order, OrderSide, OrderStatus, OrderType, Position,
    PositionSide, Trade,
};
use crate::store::{account_repo, closed_pnl_repo, order_repo, position_repo, trade_repo};

const MIN_LEVERAGE: u32 = 1;
const MAX_LEVERAGE: u32 = 125;

pub struct TradingEngine {
    pool: PgPool,
    prices: Arc<PriceService>,
    /// account_id -> symbol -> leverage
    leverage_cache: RwLock<HashMap<i64, HashMap<String, u32>>>,
}

impl TradingEngine {
    pub fn new(pool: PgPool, prices: Arc<PriceService>) -> Self {
        Self {
            pool,
            prices,
            leverage_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn prices(&self) -> &Arc<PriceService> {
        &self.prices
    }

    /// 开仓（或加仓）。市价单在本次调用内直接成交；
    /// 限价单落库后原样返回，没有持仓变化。
    /// 单向持仓模式下反方向已有持仓时，按"对手方向订单先减仓"处理。
    pub async fn open_position(
        &self,
        req: &OpenPositionRequest,
        venue: Exchange,
    ) -> EngineResult<(Order, Option<Position>)> {
        if req.order_type.is_conditional() {
            return Err(EngineError::InvalidOrderType);
        }

        let symbol = req.symbol.to_uppercase();
        let info = self
            .prices
            .symbol_info(venue, &symbol)
            .ok_or(EngineError::InvalidSymbol)?;
        if !math::validate_quantity(req.quantity, &info) {
            return Err(EngineError::InvalidQuantity);
        }

        let leverage = match req.leverage {
            Some(leverage) => {
                if !(MIN_LEVERAGE..=MAX_LEVERAGE).contains(&leverage) {
                    return Err(EngineError::InvalidLeverage);
                }
                leverage
            }
            None => self.cached_leverage(req.account_id, &symbol).await.unwrap_or(0),
        };

        // 限价单：只挂不吃价
        if req.order_type == OrderType::Limit {
            let order = order_repo::create(
                &self.pool,
                order_repo::NewOrder {
                    account_id: req.account_id,
                    client_order_id: &Uuid::new_v4().to_string(),
                    symbol: &symbol,
                    side: order_side(req.side, true),
                    position_side: req.side,
                    order_type: OrderType::Limit,
                    quantity: req.quantity,
                    price: req.price,
                    stop_price: 0.0,
                    status: OrderStatus::New,
                    reduce_only: false,
                    close_position: false,
                },
            )
            .await?;
            return Ok((order, None));
        }

        let mark_price = self
            .prices
            .get_price(venue, &symbol)
            .await
            .map_err(|_| EngineError::PriceUnavailable)?;

        let mut tx = self.pool.begin().await?;

        let existing = position_repo::get_by_account_symbol_side_for_update(
            &mut *tx,
            req.account_id,
            &symbol,
            req.side,
        )
        .await?;
        let account = account_repo::get_by_id_for_update(&mut *tx, req.account_id)
            .await?
            .ok_or(EngineError::AccountNotFound)?;

        // 单向持仓模式：对手方向已有持仓时本单视作减仓
        if !account.hedge_mode && existing.is_none() {
            let opposite = position_repo::get_by_account_symbol_side_for_update(
                &mut *tx,
                req.account_id,
                &symbol,
                req.side.opposite(),
            )
            .await?;
            if let Some(position) = opposite {
                if req.quantity > position.quantity + 1e-9 {
                    return Err(EngineError::InvalidQuantity);
                }
                let exec_price = math::close_exec_price(mark_price, position.side);
                let outcome = self
                    .execute_close_locked(
                        &mut tx,
                        &account,
                        &position,
                        req.quantity,
                        exec_price,
                        req.order_type,
                        CloseReason::Manual,
                        None,
                    )
                    .await?;
                tx.commit().await?;
                return Ok((outcome.order, outcome.position_after));
            }
        }

        let leverage = if leverage == 0 {
            self.resolve_leverage(&account, &symbol).await
        } else {
            leverage
        };

        let exec_price = math::round_to_tick(math::open_exec_price(mark_price, req.side), &info);
        let mmr = self
            .prices
            .maintenance_margin_rate(venue, exec_price * req.quantity);
        let plan = math::plan_open(
            exec_price,
            req.quantity,
            leverage,
            req.side,
            account.taker_fee_rate,
            mmr,
        );

        if account.balance_usdt < plan.margin + plan.fee {
            return Err(EngineError::InsufficientBalance);
        }

        let mut order = order_repo::create(
            &mut *tx,
            order_repo::NewOrder {
                account_id: req.account_id,
                client_order_id: &Uuid::new_v4().to_string(),
                symbol: &symbol,
                side: order_side(req.side, true),
                position_side: req.side,
                order_type: OrderType::Market,
                quantity: req.quantity,
                price: req.price,
                stop_price: 0.0,
                status: OrderStatus::New,
                reduce_only: false,
                close_position: false,
            },
        )
        .await?;

        // 市价单在创建调用内原子地 NEW -> FILLED
        order_repo::mark_filled(&mut *tx, order.id, req.quantity, plan.exec_price).await?;
        order.status = OrderStatus::Filled;
        order.filled_qty = req.quantity;
        order.avg_price = plan.exec_price;

        trade_repo::create(
            &mut *tx,
            trade_repo::NewTrade {
                account_id: req.account_id,
                order_id: order.id,
                symbol: &symbol,
                side: order.side,
                quantity: req.quantity,
                price: plan.exec_price,
                fee: plan.fee,
                realized_pnl: 0.0,
                is_maker: false,
            },
        )
        .await?;

        let position = match existing {
            Some(mut position) => {
                let total_qty = position.quantity + req.quantity;
                let avg_entry = (position.entry_price * position.quantity
                    + plan.exec_price * req.quantity)
                    / total_qty;
                let new_margin = position.margin + plan.margin;
                let new_mmr = self
                    .prices
                    .maintenance_margin_rate(venue, avg_entry * total_qty);
                let new_liq = math::liquidation_price(avg_entry, leverage, req.side, new_mmr);

                position_repo::update_amounts(
                    &mut *tx,
                    position.id,
                    total_qty,
                    avg_entry,
                    new_margin,
                    leverage as i32,
                    new_liq,
                )
                .await?;
                if let Some(stop_loss) = req.stop_loss {
                    position_repo::set_stop_loss(&mut *tx, position.id, stop_loss).await?;
                    position.stop_loss = Some(stop_loss);
                }
                if let Some(take_profit) = req.take_profit {
                    position_repo::set_take_profit(&mut *tx, position.id, take_profit).await?;
                    position.take_profit = Some(take_profit);
                }

                position.quantity = total_qty;
                position.entry_price = avg_entry;
                position.margin = new_margin;
                position.leverage = leverage as i32;
                position.liquidation_price = new_liq;
                position
            }
            None => {
                position_repo::create(
                    &mut *tx,
                    position_repo::NewPosition {
                        account_id: req.account_id,
                        symbol: &symbol,
                        side: req.side,
                        quantity: req.quantity,
                        entry_price: plan.exec_price,
                        mark_price: plan.exec_price,
                        leverage: leverage as i32,
                        margin_mode: account.margin_mode,
                        margin: plan.margin,
                        liquidation_price: plan.liquidation_price,
                        stop_loss: req.stop_loss,
                        take_profit: req.take_profit,
                    },
                )
                .await?
            }
        };

        account_repo::adjust_balance(&mut *tx, req.account_id, -(plan.margin + plan.fee)).await?;
        tx.commit().await?;

        info!(
            "[engine] account={} opened {} {} qty={} @ {:.8} margin={:.8}",
            req.account_id,
            req.side.as_str(),
            symbol,
            req.quantity,
            plan.exec_price,
            plan.margin
        );
        Ok((order, Some(position)))
    }

    /// 市价平仓（全平或部分平）
    pub async fn close_position(
        &self,
        req: &ClosePositionRequest,
        venue: Exchange,
    ) -> EngineResult<(Order, Option<ClosedPnlRecord>)> {
        let symbol = req.symbol.to_uppercase();

        let mark_price = self
            .prices
            .get_price(venue, &symbol)
            .await
            .map_err(|_| EngineError::PriceUnavailable)?;

        let mut tx = self.pool.begin().await?;

        let position = position_repo::get_by_account_symbol_side_for_update(
            &mut *tx,
            req.account_id,
            &symbol,
            req.side,
        )
        .await?
        .ok_or(EngineError::NoOpenPosition)?;
        let account = account_repo::get_by_id_for_update(&mut *tx, req.account_id)
            .await?
            .ok_or(EngineError::AccountNotFound)?;

        let close_qty = match req.quantity {
            Some(quantity) if quantity > 0.0 => {
                if quantity > position.quantity + 1e-9 {
                    return Err(EngineError::InvalidQuantity);
                }
                quantity
            }
            _ => position.quantity,
        };

        let exec_price = math::close_exec_price(mark_price, position.side);
        let outcome = self
            .execute_close_locked(
                &mut tx,
                &account,
                &position,
                close_qty,
                exec_price,
                OrderType::Market,
                CloseReason::Manual,
                None,
            )
            .await?;
        tx.commit().await?;

        Ok((outcome.order, outcome.closed))
    }

    /// 创建条件单（SL/TP），停在 NEW，由 worker 触发。
    /// 创建时只校验 symbol，不看行情。
    pub async fn create_conditional_order(
        &self,
        req: &ConditionalOrderRequest,
        venue: Exchange,
    ) -> EngineResult<Order> {
        if !req.order_type.is_conditional() {
            return Err(EngineError::InvalidOrderType);
        }
        if req.stop_price <= 0.0 {
            return Err(EngineError::InvalidOrderType);
        }
        if !self.prices.validate_symbol(venue, &req.symbol) {
            return Err(EngineError::InvalidSymbol);
        }

        let symbol = req.symbol.to_uppercase();
        // 数量缺省时按触发即全平处理
        let close_position = req.close_position || req.quantity <= 0.0;

        let order = order_repo::create(
            &self.pool,
            order_repo::NewOrder {
                account_id: req.account_id,
                client_order_id: &Uuid::new_v4().to_string(),
                symbol: &symbol,
                // 条件单永远是减仓方向
                side: order_side(req.side, false),
                position_side: req.side,
                order_type: req.order_type,
                quantity: req.quantity.max(0.0),
                price: req.price,
                stop_price: req.stop_price,
                status: OrderStatus::New,
                reduce_only: true,
                close_position,
            },
        )
        .await?;

        info!(
            "[engine] account={} conditional {} {} stop={:.8} close_position={}",
            req.account_id,
            order.order_type.as_str(),
            symbol,
            req.stop_price,
            close_position
        );
        Ok(order)
    }

    /// worker 专用：执行已触发的条件单。
    /// 订单行先 FOR UPDATE，非 NEW 直接返回 None，保证至多触发一次。
    pub async fn execute_triggered_order(
        &self,
        order_id: i64,
        venue: Exchange,
    ) -> EngineResult<Option<ClosedPnlRecord>> {
        // 行情在锁外取，事务尽量短
        let order_peek = order_repo::get_by_id(&self.pool, order_id)
            .await?
            .ok_or(EngineError::OrderNotFound)?;
        let mark_price = self
            .prices
            .get_price(venue, &order_peek.symbol)
            .await
            .map_err(|_| EngineError::PriceUnavailable)?;

        let mut tx = self.pool.begin().await?;

        let order = order_repo::get_by_id_for_update(&mut *tx, order_id)
            .await?
            .ok_or(EngineError::OrderNotFound)?;
        if order.status != OrderStatus::New {
            // 已被并发触发或撤销
            return Ok(None);
        }

        let position = position_repo::get_by_account_symbol_side_for_update(
            &mut *tx,
            order.account_id,
            &order.symbol,
            order.position_side,
        )
        .await?;
        let Some(position) = position else {
            // 持仓已不存在，条件单作废
            warn!(
                "[engine] conditional order {} has no position, canceling",
                order.id
            );
            order_repo::set_status(&mut *tx, order.id, OrderStatus::Canceled).await?;
            tx.commit().await?;
            return Ok(None);
        };
        let account = account_repo::get_by_id_for_update(&mut *tx, order.account_id)
            .await?
            .ok_or(EngineError::AccountNotFound)?;

        let close_qty = if order.close_position || order.quantity <= 0.0 {
            position.quantity
        } else {
            order.quantity.min(position.quantity)
        };
        let reason = match order.order_type {
            OrderType::TakeProfit => CloseReason::TakeProfit,
            _ => CloseReason::StopLoss,
        };

        let exec_price = math::close_exec_price(mark_price, position.side);
        let outcome = self
            .execute_close_locked(
                &mut tx,
                &account,
                &position,
                close_qty,
                exec_price,
                order.order_type,
                reason,
                Some(&order),
            )
            .await?;
        tx.commit().await?;

        if let Some(closed) = &outcome.closed {
            info!(
                "[engine] triggered order {} closed {} pnl={:.8} reason={}",
                order.id,
                order.symbol,
                closed.realized_pnl,
                closed.closed_reason.as_str()
            );
        }
        Ok(outcome.closed)
    }

    /// 事务内的平仓公共路径；调用方已持有仓位行与账户行的锁
    #[allow(clippy::too_many_arguments)]
    async fn execute_close_locked(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        account: &Account,
        position: &Position,
        close_qty: f64,
        exec_price: f64,
        order_type: OrderType,
        reason: CloseReason,
        trigger_order: Option<&Order>,
    ) -> EngineResult<CloseOutcome> {
        let plan = math::plan_close(
            position.entry_price,
            position.quantity,
            position.margin,
            position.side,
            exec_price,
            close_qty,
            account.taker_fee_rate,
        );

        let order = match trigger_order {
            Some(order) => {
                // 条件单：原单 NEW -> FILLED
                order_repo::mark_filled(&mut **tx, order.id, close_qty, plan.exec_price).await?;
                let mut filled = order.clone();
                filled.status = OrderStatus::Filled;
                filled.filled_qty = close_qty;
                filled.avg_price = plan.exec_price;
                filled
            }
            None => {
                let mut order = order_repo::create(
                    &mut **tx,
                    order_repo::NewOrder {
                        account_id: account.id,
                        client_order_id: &Uuid::new_v4().to_string(),
                        symbol: &position.symbol,
                        side: order_side(position.side, false),
                        position_side: position.side,
                        order_type,
                        quantity: close_qty,
                        price: 0.0,
                        stop_price: 0.0,
                        status: OrderStatus::New,
                        reduce_only: true,
                        close_position: plan.full_close,
                    },
                )
                .await?;
                order_repo::mark_filled(&mut **tx, order.id, close_qty, plan.exec_price).await?;
                order.status = OrderStatus::Filled;
                order.filled_qty = close_qty;
                order.avg_price = plan.exec_price;
                order
            }
        };

        trade_repo::create(
            &mut **tx,
            trade_repo::NewTrade {
                account_id: account.id,
                order_id: order.id,
                symbol: &position.symbol,
                side: order.side,
                quantity: close_qty,
                price: plan.exec_price,
                fee: plan.fee,
                realized_pnl: plan.realized_pnl,
                is_maker: false,
            },
        )
        .await?;

        let (closed, position_after) = if plan.full_close {
            let record = closed_pnl_repo::create(
                &mut **tx,
                closed_pnl_repo::NewClosedPnl {
                    account_id: account.id,
                    symbol: &position.symbol,
                    side: position.side,
                    quantity: position.quantity,
                    entry_price: position.entry_price,
                    exit_price: plan.exec_price,
                    realized_pnl: plan.realized_pnl,
                    total_fee: plan.fee,
                    leverage: position.leverage,
                    closed_reason: reason,
                    opened_at: position.created_at,
                },
            )
            .await?;
            position_repo::soft_delete(&mut **tx, position.id).await?;
            (Some(record), None)
        } else {
            position_repo::reduce(&mut **tx, position.id, close_qty, plan.returned_margin).await?;
            let mut remaining = position.clone();
            remaining.quantity -= close_qty;
            remaining.margin -= plan.returned_margin;
            (None, Some(remaining))
        };

        account_repo::adjust_balance(
            &mut **tx,
            account.id,
            plan.returned_margin + plan.realized_pnl - plan.fee,
        )
        .await?;

        Ok(CloseOutcome {
            order,
            closed,
            position_after,
        })
    }

    /// 杠杆只进内存缓存，按 (account, symbol) 记忆
    pub async fn set_leverage(
        &self,
        account_id: i64,
        symbol: &str,
        leverage: u32,
    ) -> EngineResult<()> {
        if !(MIN_LEVERAGE..=MAX_LEVERAGE).contains(&leverage) {
            return Err(EngineError::InvalidLeverage);
        }
        let mut cache = self.leverage_cache.write().await;
        cache
            .entry(account_id)
            .or_default()
            .insert(symbol.to_uppercase(), leverage);
        Ok(())
    }

    async fn cached_leverage(&self, account_id: i64, symbol: &str) -> Option<u32> {
        let cache = self.leverage_cache.read().await;
        cache.get(&account_id)?.get(&symbol.to_uppercase()).copied()
    }

    async fn resolve_leverage(&self, account: &Account, symbol: &str) -> u32 {
        if let Some(leverage) = self.cached_leverage(account.id, symbol).await {
            return leverage;
        }
        let default = account.default_leverage;
        if default >= MIN_LEVERAGE as i32 && default <= MAX_LEVERAGE as i32 {
            default as u32
        } else {
            20
        }
    }

    pub async fn set_stop_loss(
        &self,
        account_id: i64,
        symbol: &str,
        side: PositionSide,
        stop_loss: f64,
    ) -> EngineResult<()> {
        let position = position_repo::get_by_account_symbol_side(
            &self.pool,
            account_id,
            &symbol.to_uppercase(),
            side,
        )
        .await?
        .ok_or(EngineError::PositionNotFound)?;
        position_repo::set_stop_loss(&self.pool, position.id, stop_loss).await?;
        Ok(())
    }

    pub async fn set_take_profit(
        &self,
        account_id: i64,
        symbol: &str,
        side: PositionSide,
        take_profit: f64,
    ) -> EngineResult<()> {
        let position = position_repo::get_by_account_symbol_side(
            &self.pool,
            account_id,
            &symbol.to_uppercase(),
            side,
        )
        .await?
        .ok_or(EngineError::PositionNotFound)?;
        position_repo::set_take_profit(&self.pool, position.id, take_profit).await?;
        Ok(())
    }

    pub async fn cancel_all_orders(
        &self,
        account_id: i64,
        symbol: Option<&str>,
    ) -> EngineResult<u64> {
        Ok(order_repo::cancel_open(&self.pool, account_id, symbol, false).await?)
    }

    pub async fn cancel_all_algo_orders(
        &self,
        account_id: i64,
        symbol: Option<&str>,
    ) -> EngineResult<u64> {
        Ok(order_repo::cancel_open(&self.pool, account_id, symbol, true).await?)
    }

    /// 撤销单个未完结订单
    pub async fn cancel_order(&self, account_id: i64, order_id: i64) -> EngineResult<Order> {
        let mut order = order_repo::get_by_id(&self.pool, order_id)
            .await?
            .ok_or(EngineError::OrderNotFound)?;
        if order.account_id != account_id || !order.is_pending() {
            return Err(EngineError::OrderNotFound);
        }
        order_repo::set_status(&self.pool, order.id, OrderStatus::Canceled).await?;
        order.status = OrderStatus::Canceled;
        Ok(order)
    }

    pub async fn get_order(&self, account_id: i64, order_id: i64) -> EngineResult<Order> {
        let order = order_repo::get_by_id(&self.pool, order_id)
            .await?
            .ok_or(EngineError::OrderNotFound)?;
        if order.account_id != account_id {
            return Err(EngineError::OrderNotFound);
        }
        Ok(order)
    }

    pub async fn get_open_orders(
        &self,
        account_id: i64,
        symbol: Option<&str>,
    ) -> EngineResult<Vec<Order>> {
        Ok(order_repo::list_open(&self.pool, account_id, symbol).await?)
    }

    pub async fn get_open_algo_orders(
        &self,
        account_id: i64,
        symbol: Option<&str>,
    ) -> EngineResult<Vec<Order>> {
        Ok(order_repo::list_open_algo(&self.pool, account_id, symbol).await?)
    }

    /// 返回前刷新每个仓位的标记价和未实现盈亏，并回写仓位行
    pub async fn get_positions(
        &self,
        account_id: i64,
        venue: Exchange,
    ) -> EngineResult<Vec<Position>> {
        let mut positions = position_repo::list_by_account(&self.pool, account_id).await?;
        for position in &mut positions {
            if let Ok(price) = self.prices.get_price(venue, &position.symbol).await {
                position.mark_price = price;
                position.unrealized_pnl = position.unrealized_pnl_at(price);
                if let Err(e) = position_repo::update_mark(
                    &self.pool,
                    position.id,
                    position.mark_price,
                    position.unrealized_pnl,
                )
                .await
                {
                    warn!("[engine] failed to persist mark refresh for position {}: {}", position.id, e);
                }
            }
        }
        Ok(positions)
    }

    /// 余额派生视图：available = balance - Σmargin，equity = balance + ΣUPnL
    pub async fn get_balance(&self, account_id: i64, venue: Exchange) -> EngineResult<BalanceView> {
        let account = account_repo::get_by_id(&self.pool, account_id)
            .await?
            .ok_or(EngineError::AccountNotFound)?;
        let positions = self.get_positions(account_id, venue).await?;

        let total_margin: f64 = positions.iter().map(|p| p.margin).sum();
        let total_upnl: f64 = positions.iter().map(|p| p.unrealized_pnl).sum();

        Ok(BalanceView {
            balance: account.balance_usdt,
            available: account.balance_usdt - total_margin,
            margin: total_margin,
            unrealized_pnl: total_upnl,
            equity: account.balance_usdt + total_upnl,
            initial_balance: account.initial_balance,
        })
    }

    pub async fn get_closed_pnl(
        &self,
        account_id: i64,
        page: i64,
        page_size: i64,
    ) -> EngineResult<(Vec<ClosedPnlRecord>, i64)> {
        Ok(closed_pnl_repo::list_paginated(&self.pool, account_id, page, page_size).await?)
    }

    /// 最近成交，按执行时间倒序
    pub async fn get_trades(&self, account_id: i64, limit: i64) -> EngineResult<Vec<Trade>> {
        Ok(trade_repo::list_by_account(&self.pool, account_id, limit.clamp(1, 500)).await?)
    }
}

struct CloseOutcome {
    order: Order,
    closed: Option<ClosedPnlRecord>,
    position_after: Option<Position>,
}

/// 开仓方向到订单方向：开多=买，开空=卖；平仓取反
fn order_side(position_side: PositionSide, is_open: bool) -> OrderSide {
    let long = matches!(position_side, PositionSide::Long | PositionSide::Both);
    if is_open == long {
        OrderSide::Buy
    } else {
        OrderSide::Sell
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_side_mapping() {
        assert_eq!(order_side(PositionSide::Long, true), OrderSide::Buy);
        assert_eq!(order_side(PositionSide::Long, false), OrderSide::Sell);
        assert_eq!(order_side(PositionSide::Short, true), OrderSide::Sell);
        assert_eq!(order_side(PositionSide::Short, false), OrderSide::Buy);
    }
}
