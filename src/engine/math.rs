//! 成交定价与保证金纯计算
//!
//! 引擎事务只做状态落库，所有数值都在这里事先算好。

use crate::market::types::SymbolInfo;
use crate::store::models::PositionSide;

/// 市价单固定滑点 0.01%
pub const DEFAULT_SLIPPAGE: f64 = 1e-4;

/// 数量步进校验的浮点容差
const QTY_EPSILON: f64 = 1e-9;

/// 开仓的执行价：做多向上滑，做空向下滑
pub fn open_exec_price(mark_price: f64, side: PositionSide) -> f64 {
    match side {
        PositionSide::Short => mark_price * (1.0 - DEFAULT_SLIPPAGE),
        _ => mark_price * (1.0 + DEFAULT_SLIPPAGE),
    }
}

/// 平仓的执行价：平多向下滑（卖出），平空向上滑（买入）
pub fn close_exec_price(mark_price: f64, side: PositionSide) -> f64 {
    match side {
        PositionSide::Short => mark_price * (1.0 + DEFAULT_SLIPPAGE),
        _ => mark_price * (1.0 - DEFAULT_SLIPPAGE),
    }
}

/// 对齐 tick；没有 tick 时按价格精度四舍五入
pub fn round_to_tick(price: f64, info: &SymbolInfo) -> f64 {
    if info.tick_size > 0.0 {
        return (price / info.tick_size).round() * info.tick_size;
    }
    let scale = 10f64.powi(info.price_precision as i32);
    (price * scale).round() / scale
}

/// 数量合法性：min/max 与步进
pub fn validate_quantity(quantity: f64, info: &SymbolInfo) -> bool {
    if quantity <= 0.0 {
        return false;
    }
    if info.min_qty > 0.0 && quantity < info.min_qty - QTY_EPSILON {
        return false;
    }
    if info.max_qty > 0.0 && quantity > info.max_qty + QTY_EPSILON {
        return false;
    }
    if info.step_size > 0.0 {
        let steps = quantity / info.step_size;
        if (steps - steps.round()).abs() * info.step_size > QTY_EPSILON {
            return false;
        }
    }
    true
}

/// 强平价
///
/// LONG:  entry * (1 - 1/L + m)
/// SHORT: entry * (1 + 1/L - m)
pub fn liquidation_price(
    entry_price: f64,
    leverage: u32,
    side: PositionSide,
    maintenance_margin_rate: f64,
) -> f64 {
    let inverse_leverage = 1.0 / leverage as f64;
    match side {
        PositionSide::Short => entry_price * (1.0 + inverse_leverage - maintenance_margin_rate),
        _ => entry_price * (1.0 - inverse_leverage + maintenance_margin_rate),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpenPlan {
    pub exec_price: f64,
    pub notional: f64,
    pub margin: f64,
    pub fee: f64,
    pub liquidation_price: f64,
}

/// 开仓计划；exec_price 已对齐 tick
pub fn plan_open(
    exec_price: f64,
    quantity: f64,
    leverage: u32,
    side: PositionSide,
    taker_fee_rate: f64,
    maintenance_margin_rate: f64,
) -> OpenPlan {
    let notional = exec_price * quantity;
    OpenPlan {
        exec_price,
        notional,
        margin: notional / leverage as f64,
        fee: notional * taker_fee_rate,
        liquidation_price: liquidation_price(exec_price, leverage, side, maintenance_margin_rate),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClosePlan {
    pub exec_price: f64,
    pub realized_pnl: f64,
    pub fee: f64,
    pub returned_margin: f64,
    pub full_close: bool,
}

/// 平仓计划：盈亏、手续费、按比例退还的保证金
pub fn plan_close(
    entry_price: f64,
    position_qty: f64,
    position_margin: f64,
    side: PositionSide,
    exec_price: f64,
    close_qty: f64,
    taker_fee_rate: f64,
) -> ClosePlan {
    let realized_pnl = match side {
        PositionSide::Short => (entry_price - exec_price) * close_qty,
        _ => (exec_price - entry_price) * close_qty,
    };
    let fee = exec_price * close_qty * taker_fee_rate;
    let returned_margin = position_margin * (close_qty / position_qty);
    let full_close = close_qty >= position_qty - QTY_EPSILON;

    ClosePlan {
        exec_price,
        realized_pnl,
        fee,
        returned_margin,
        full_close,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::tiered_maintenance_margin_rate;

    const TOLERANCE: f64 = 1e-6;

    fn btc_info() -> SymbolInfo {
        SymbolInfo {
            symbol: "BTCUSDT".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            price_precision: 1,
            quantity_precision: 3,
            min_qty: 0.001,
            max_qty: 1000.0,
            min_notional: 5.0,
            tick_size: 0.1,
            step_size: 0.001,
        }
    }

    #[test]
    fn test_open_long_at_50000_with_10x() {
        // 初始余额 10000，taker 4e-4，0.01 BTC @ 50000
        let info = btc_info();
        let exec = round_to_tick(open_exec_price(50_000.0, PositionSide::Long), &info);
        assert!((exec - 50_005.0).abs() < TOLERANCE);

        let mmr = tiered_maintenance_margin_rate(exec * 0.01);
        let plan = plan_open(exec, 0.01, 10, PositionSide::Long, 4e-4, mmr);
        assert!((plan.margin - 50.005).abs() < TOLERANCE);
        assert!((plan.fee - 0.20002).abs() < TOLERANCE);

        let balance_after = 10_000.0 - plan.margin - plan.fee;
        assert!((balance_after - 9_949.79498).abs() < 1e-4);
    }

    #[test]
    fn test_liquidation_price_of_10x_long() {
        let liq = liquidation_price(50_005.0, 10, PositionSide::Long, 0.004);
        assert!((liq - 45_204.52).abs() < TOLERANCE);
    }

    #[test]
    fn test_liquidation_price_short_above_entry() {
        let liq = liquidation_price(50_000.0, 20, PositionSide::Short, 0.004);
        assert!((liq - 50_000.0 * (1.0 + 0.05 - 0.004)).abs() < TOLERANCE);
        assert!(liq > 50_000.0);
    }

    #[test]
    fn test_partial_close_at_unchanged_mark() {
        // 接上一笔：仓位 0.01 @ 50005，保证金 50.005，平掉 0.005 @ mark 50000
        let exec = close_exec_price(50_000.0, PositionSide::Long);
        assert!((exec - 49_995.0).abs() < TOLERANCE);

        let plan = plan_close(50_005.0, 0.01, 50.005, PositionSide::Long, exec, 0.005, 4e-4);
        assert!((plan.realized_pnl - (-0.05)).abs() < TOLERANCE);
        assert!((plan.returned_margin - 25.0025).abs() < TOLERANCE);
        assert!((plan.fee - 0.09999).abs() < TOLERANCE);
        assert!(!plan.full_close);

        let balance_after = 9_949.79498 + plan.returned_margin + plan.realized_pnl - plan.fee;
        assert!((balance_after - 9_974.64749).abs() < 1e-4);
    }

    #[test]
    fn test_open_close_round_trip_cost_is_slippage_plus_fees() {
        // 同一 mark 下开平 X 单位，净亏损 = X*p*(2s + 2f)
        let info = SymbolInfo {
            tick_size: 0.0,
            price_precision: 8,
            ..btc_info()
        };
        let p = 50_000.0;
        let x = 0.01;
        let f = 4e-4;

        let open_exec = round_to_tick(open_exec_price(p, PositionSide::Long), &info);
        let open = plan_open(open_exec, x, 10, PositionSide::Long, f, 0.004);
        let close_exec = close_exec_price(p, PositionSide::Long);
        let close = plan_close(open_exec, x, open.margin, PositionSide::Long, close_exec, x, f);

        let net = close.realized_pnl - open.fee - close.fee;
        let expected = -x * p * (2.0 * DEFAULT_SLIPPAGE + 2.0 * f);
        assert!((net - expected).abs() < 1e-3, "net={} expected={}", net, expected);
        assert!(close.full_close);
    }

    #[test]
    fn test_round_to_tick() {
        let info = btc_info();
        assert!((round_to_tick(50_005.04, &info) - 50_005.0).abs() < TOLERANCE);
        assert!((round_to_tick(50_005.06, &info) - 50_005.1).abs() < TOLERANCE);

        let no_tick = SymbolInfo {
            tick_size: 0.0,
            price_precision: 2,
            ..btc_info()
        };
        assert!((round_to_tick(1.2345, &no_tick) - 1.23).abs() < TOLERANCE);
    }

    #[test]
    fn test_validate_quantity() {
        let info = btc_info();
        assert!(validate_quantity(0.01, &info));
        assert!(validate_quantity(0.001, &info));
        assert!(!validate_quantity(0.0005, &info)); // 低于 minQty
        assert!(!validate_quantity(1001.0, &info)); // 超过 maxQty
        assert!(!validate_quantity(0.0015001, &info)); // 不在步进上
        assert!(!validate_quantity(0.0, &info));
        assert!(!validate_quantity(-1.0, &info));
    }

    #[test]
    fn test_slippage_direction() {
        assert!(open_exec_price(100.0, PositionSide::Long) > 100.0);
        assert!(open_exec_price(100.0, PositionSide::Short) < 100.0);
        assert!(close_exec_price(100.0, PositionSide::Long) < 100.0);
        assert!(close_exec_price(100.0, PositionSide::Short) > 100.0);
    }
}
