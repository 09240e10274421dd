pub mod admin;
pub mod auth;
pub mod binance;
pub mod bitget;
pub mod bybit;
pub mod hyperliquid;
pub mod okx;
pub mod response;

use std::sync::Arc;

use sqlx::PgPool;

use crate::common::crypto::SecretCipher;
use crate::engine::TradingEngine;
use crate::market::aggregator::PriceService;
use crate::market::registry::ExchangeInfoService;
use crate::store::models::Account;

/// 所有门面共享的应用状态
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TradingEngine>,
    pub prices: Arc<PriceService>,
    pub exchange_info: Arc<ExchangeInfoService>,
    pub cipher: Arc<SecretCipher>,
    pub pool: PgPool,
}

/// 鉴权中间件写入 request extensions 的账户
#[derive(Clone)]
pub struct AuthedAccount(pub Account);

/// 交易所侧数字一律 8 位小数字符串
pub fn fmt8(value: f64) -> String {
    format!("{:.8}", value)
}

/// 解析 query / form 形式的参数表
pub fn parse_params(raw: &str) -> std::collections::HashMap<String, String> {
    url::form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt8() {
        assert_eq!(fmt8(50005.0), "50005.00000000");
        assert_eq!(fmt8(0.1), "0.10000000");
    }

    #[test]
    fn test_parse_params() {
        let params = parse_params("symbol=BTCUSDT&side=BUY&quantity=0.01");
        assert_eq!(params.get("symbol").unwrap(), "BTCUSDT");
        assert_eq!(params.get("quantity").unwrap(), "0.01");
        assert!(parse_params("").is_empty());
    }
}
