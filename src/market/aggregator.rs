//! 价格聚合器
//!
//! 全局唯一的 (venue, symbol) -> PriceUpdate 表，写入方是各交易所的读循环，
//! 读取方是引擎、worker 和行情类接口。每次写入同时镜像到 Redis
//! (`price:<venue>:<symbol>`，5s 过期) 并在 `price_updates` 频道广播，
//! Redis 不可用时静默退化为纯内存。

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::{watch, RwLock};

use crate::common::exchange::Exchange;
use crate::common::redis_client::RedisClient;
use crate::common::time_util::get_timestamp_ms;
use crate::market::binance::BinanceClient;
use crate::market::bitget::BitgetClient;
use crate::market::bybit::BybitClient;
use crate::market::hyperliquid::HyperliquidClient;
use crate::market::okx::OkxClient;
use crate::market::types::{PriceProvider, PriceSink, PriceUpdate, SymbolInfo, VenueAdapter};

/// 内存价格的新鲜窗口，超过即走 Redis/REST 兜底
const FRESHNESS_WINDOW_MS: i64 = 5_000;

/// 启动时默认订阅的交易对
pub const DEFAULT_SYMBOLS: [&str; 20] = [
    "BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT", "XRPUSDT", "ADAUSDT", "DOGEUSDT", "AVAXUSDT",
    "DOTUSDT", "LINKUSDT", "MATICUSDT", "LTCUSDT", "UNIUSDT", "ATOMUSDT", "ETCUSDT", "XLMUSDT",
    "FILUSDT", "TRXUSDT", "NEARUSDT", "AAVEUSDT",
];

struct StoredPrice {
    update: PriceUpdate,
    /// 本机收到的时间，新鲜度按这个算，容忍交易所侧时钟偏移
    received_at: i64,
}

pub struct PriceService {
    redis: Option<RedisClient>,
    binance: Arc<BinanceClient>,
    okx: Arc<OkxClient>,
    bybit: Arc<BybitClient>,
    bitget: Arc<BitgetClient>,
    hyperliquid: Arc<HyperliquidClient>,
    providers: HashMap<Exchange, Arc<dyn VenueAdapter>>,
    prices: RwLock<HashMap<Exchange, HashMap<String, StoredPrice>>>,
}

impl PriceService {
    pub fn new(redis: Option<RedisClient>) -> Arc<Self> {
        let binance = Arc::new(BinanceClient::new());
        let okx = Arc::new(OkxClient::new());
        let bybit = Arc::new(BybitClient::new());
        let bitget = Arc::new(BitgetClient::new());
        let hyperliquid = Arc::new(HyperliquidClient::new());

        let mut providers: HashMap<Exchange, Arc<dyn VenueAdapter>> = HashMap::new();
        providers.insert(Exchange::Binance, binance.clone());
        providers.insert(Exchange::Okx, okx.clone());
        providers.insert(Exchange::Bybit, bybit.clone());
        providers.insert(Exchange::Bitget, bitget.clone());
        providers.insert(Exchange::Hyperliquid, hyperliquid.clone());

        let service = Arc::new(Self {
            redis,
            binance,
            okx,
            bybit,
            bitget,
            hyperliquid,
            providers,
            prices: RwLock::new(HashMap::new()),
        });

        let sink: Arc<dyn PriceSink> = service.clone();
        for provider in service.providers.values() {
            provider.set_subscriber(sink.clone());
        }
        service
    }

    /// 连接全部交易所并订阅默认交易对，单个交易所失败不影响其他
    pub async fn start(&self, shutdown_rx: watch::Receiver<bool>) {
        let symbols: Vec<String> = DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect();

        macro_rules! bring_up {
            ($client:expr, $name:literal) => {
                match $client.clone().connect(shutdown_rx.clone()).await {
                    Ok(()) => {
                        if let Err(e) = $client.subscribe(&symbols).await {
                            warn!("[price] failed to subscribe on {}: {}", $name, e);
                        }
                    }
                    Err(e) => error!("[price] failed to connect to {}: {}", $name, e),
                }
            };
        }

        bring_up!(self.binance, "binance");
        bring_up!(self.okx, "okx");
        bring_up!(self.bybit, "bybit");
        bring_up!(self.bitget, "bitget");
        bring_up!(self.hyperliquid, "hyperliquid");

        info!("[price] started with {} exchanges", self.providers.len());
    }

    /// Hyperliquid 门面需要资产下标映射，给出具体句柄
    pub fn hyperliquid(&self) -> &Arc<HyperliquidClient> {
        &self.hyperliquid
    }

    /// 当前标记价：内存(5s 窗口) -> Redis -> REST 兜底
    pub async fn get_price(&self, venue: Exchange, symbol: &str) -> Result<f64> {
        let symbol = symbol.to_uppercase();

        {
            let prices = self.prices.read().await;
            if let Some(stored) = prices.get(&venue).and_then(|m| m.get(&symbol)) {
                if get_timestamp_ms() - stored.received_at < FRESHNESS_WINDOW_MS {
                    return Ok(stored.update.price);
                }
            }
        }

        if let Some(redis) = &self.redis {
            let key = format!("price:{}:{}", venue, symbol);
            if let Ok(Some(price)) = redis.hget(&key, "price").await {
                if let Ok(price) = price.parse::<f64>() {
                    return Ok(price);
                }
            }
        }

        let provider = self
            .providers
            .get(&venue)
            .ok_or_else(|| anyhow!("exchange not found: {}", venue))?;
        match provider.current_price(&symbol).await {
            Ok(price) if price > 0.0 => Ok(price),
            Ok(_) => Err(anyhow!("price not available for {} on {}", symbol, venue)),
            Err(e) => Err(anyhow!("price not available for {} on {}: {}", symbol, venue, e)),
        }
    }

    /// 完整的最近一条行情（不校验新鲜度）
    pub async fn get_price_update(&self, venue: Exchange, symbol: &str) -> Option<PriceUpdate> {
        let prices = self.prices.read().await;
        prices
            .get(&venue)
            .and_then(|m| m.get(&symbol.to_uppercase()))
            .map(|stored| stored.update.clone())
    }

    pub async fn get_all_prices(&self, venue: Exchange) -> HashMap<String, f64> {
        let prices = self.prices.read().await;
        prices
            .get(&venue)
            .map(|m| {
                m.iter()
                    .map(|(symbol, stored)| (symbol.clone(), stored.update.price))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn symbol_info(&self, venue: Exchange, symbol: &str) -> Option<SymbolInfo> {
        self.providers.get(&venue)?.symbol_info(symbol)
    }

    pub fn validate_symbol(&self, venue: Exchange, symbol: &str) -> bool {
        self.providers
            .get(&venue)
            .map(|p| p.validate_symbol(symbol))
            .unwrap_or(false)
    }

    pub fn all_symbols(&self, venue: Exchange) -> Vec<String> {
        self.providers
            .get(&venue)
            .map(|p| p.all_symbols())
            .unwrap_or_default()
    }

    pub fn maintenance_margin_rate(&self, venue: Exchange, position_value: f64) -> f64 {
        self.providers
            .get(&venue)
            .map(|p| p.maintenance_margin_rate(position_value))
            .unwrap_or(0.004)
    }

    pub async fn subscribe(&self, venue: Exchange, symbols: &[String]) -> Result<()> {
        let provider = self
            .providers
            .get(&venue)
            .ok_or_else(|| anyhow!("exchange not found: {}", venue))?;
        provider.subscribe(symbols).await
    }

    pub fn is_connected(&self, venue: Exchange) -> bool {
        self.providers
            .get(&venue)
            .map(|p| p.is_connected())
            .unwrap_or(false)
    }

    /// /health 用的各交易所连接状态
    pub fn exchange_status(&self) -> HashMap<String, bool> {
        self.providers
            .iter()
            .map(|(venue, provider)| (venue.to_string(), provider.is_connected()))
            .collect()
    }

    pub async fn close_all(&self) {
        for (venue, provider) in &self.providers {
            if let Err(e) = provider.close().await {
                warn!("[price] error closing {}: {}", venue, e);
            }
        }
        info!("[price] stopped");
    }
}

#[async_trait]
impl PriceSink for PriceService {
    async fn on_price_update(&self, update: PriceUpdate) {
        {
            let mut prices = self.prices.write().await;
            prices.entry(update.exchange).or_default().insert(
                update.symbol.clone(),
                StoredPrice {
                    update: update.clone(),
                    received_at: get_timestamp_ms(),
                },
            );
        }

        // Redis 镜像和广播都是尽力而为
        if let Some(redis) = &self.redis {
            let key = format!("price:{}:{}", update.exchange, update.symbol);
            let fields = [
                ("price", format!("{:.8}", update.price)),
                ("bid", format!("{:.8}", update.bid_price)),
                ("ask", format!("{:.8}", update.ask_price)),
                ("timestamp", update.timestamp.to_string()),
            ];
            if let Err(e) = redis.hset_ex(&key, &fields, 5).await {
                debug!("[price] redis mirror failed for {}: {}", key, e);
            }

            let payload = format!("{}:{}:{:.8}", update.exchange, update.symbol, update.price);
            if let Err(e) = redis.publish("price_updates", &payload).await {
                debug!("[price] redis publish failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(symbol: &str, price: f64) -> PriceUpdate {
        PriceUpdate {
            exchange: Exchange::Binance,
            symbol: symbol.to_string(),
            price,
            bid_price: 0.0,
            ask_price: 0.0,
            timestamp: get_timestamp_ms(),
        }
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let service = PriceService::new(None);
        service.on_price_update(update("BTCUSDT", 50_000.0)).await;
        service.on_price_update(update("BTCUSDT", 50_001.0)).await;

        let price = service.get_price(Exchange::Binance, "BTCUSDT").await.unwrap();
        assert_eq!(price, 50_001.0);
    }

    #[tokio::test]
    async fn test_fresh_price_served_from_memory() {
        let service = PriceService::new(None);
        // 来源时间戳可以很旧，新鲜度按本机收到时间判定
        let mut stale_source = update("ETHUSDT", 3_000.0);
        stale_source.timestamp = 1;
        service.on_price_update(stale_source).await;

        let price = service.get_price(Exchange::Binance, "ETHUSDT").await.unwrap();
        assert_eq!(price, 3_000.0);
    }

    #[tokio::test]
    async fn test_unknown_symbol_without_fallback_errors() {
        let service = PriceService::new(None);
        // 无内存值、无 Redis，REST 也会失败（测试环境无网络时直接报错）
        let result = service.get_price(Exchange::Binance, "NOPEUSDT").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_symbols_are_case_normalised() {
        let service = PriceService::new(None);
        service.on_price_update(update("BTCUSDT", 42_000.0)).await;
        let price = service.get_price(Exchange::Binance, "btcusdt").await.unwrap();
        assert_eq!(price, 42_000.0);
    }
}
