use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::common::exchange::Exchange;

/// 单条行情更新，symbol 统一为 BASEQUOTE 大写（如 BTCUSDT）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub exchange: Exchange,
    pub symbol: String,
    /// 标记价格
    pub price: f64,
    #[serde(default)]
    pub bid_price: f64,
    #[serde(default)]
    pub ask_price: f64,
    /// 交易所侧时间戳，毫秒
    pub timestamp: i64,
}

/// 交易对的下单约束信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub price_precision: u32,
    pub quantity_precision: u32,
    pub min_qty: f64,
    pub max_qty: f64,
    pub min_notional: f64,
    pub tick_size: f64,
    pub step_size: f64,
}

/// 行情接收方，由价格聚合器实现
#[async_trait]
pub trait PriceSink: Send + Sync {
    async fn on_price_update(&self, update: PriceUpdate);
}

/// 每个交易所的行情 WebSocket 客户端
#[async_trait]
pub trait PriceProvider: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// 注册行情接收方，必须在 connect 之前调用
    fn set_subscriber(&self, sink: Arc<dyn PriceSink>);

    /// 建立连接并启动 读循环/心跳循环/重连控制
    async fn connect(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> Result<()>;

    async fn subscribe(&self, symbols: &[String]) -> Result<()>;

    async fn unsubscribe(&self, symbols: &[String]) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// 交易所适配能力：行情之外，引擎还需要的查询
#[async_trait]
pub trait VenueAdapter: PriceProvider {
    /// REST 单次查询当前标记价，聚合器兜底用
    async fn current_price(&self, symbol: &str) -> Result<f64>;

    fn symbol_info(&self, symbol: &str) -> Option<SymbolInfo>;

    fn validate_symbol(&self, symbol: &str) -> bool;

    fn all_symbols(&self) -> Vec<String>;

    /// 维持保证金率，按仓位名义价值分档
    fn maintenance_margin_rate(&self, position_value: f64) -> f64 {
        tiered_maintenance_margin_rate(position_value)
    }

    /// (taker, maker)
    fn fee_rate(&self) -> (f64, f64) {
        (0.0004, 0.0002)
    }
}

/// 名义价值分档的维持保证金率
pub fn tiered_maintenance_margin_rate(position_value: f64) -> f64 {
    if position_value <= 50_000.0 {
        0.004
    } else if position_value <= 250_000.0 {
        0.005
    } else if position_value <= 1_000_000.0 {
        0.01
    } else {
        0.025
    }
}

/// 从字符串数值推断小数位数，交易所的 tickSz/lotSz 都是十进制字符串
pub fn precision_from_str(value: &str) -> u32 {
    match value.split('.').nth(1) {
        Some(frac) => frac.trim_end_matches('0').len() as u32,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiered_mmr() {
        assert_eq!(tiered_maintenance_margin_rate(500.05), 0.004);
        assert_eq!(tiered_maintenance_margin_rate(50_000.0), 0.004);
        assert_eq!(tiered_maintenance_margin_rate(100_000.0), 0.005);
        assert_eq!(tiered_maintenance_margin_rate(900_000.0), 0.01);
        assert_eq!(tiered_maintenance_margin_rate(2_000_000.0), 0.025);
    }

    #[test]
    fn test_precision_from_str() {
        assert_eq!(precision_from_str("0.001"), 3);
        assert_eq!(precision_from_str("0.0100"), 2);
        assert_eq!(precision_from_str("1"), 0);
    }
}
