//! exchangeInfo 缓存
//!
//! 每小时拉取各交易所的完整合约列表原文，内存一份，Redis 一份
//! (`exchangeinfo:<venue>`，2h 过期)，门面层原样返回。

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::sync::{watch, RwLock};
use tokio::time::Duration;

use crate::common::exchange::Exchange;
use crate::common::redis_client::RedisClient;

const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);
const REDIS_TTL_SECS: u64 = 7200;

pub struct ExchangeInfoService {
    redis: Option<RedisClient>,
    http: reqwest::Client,
    cache: RwLock<HashMap<Exchange, serde_json::Value>>,
}

impl ExchangeInfoService {
    pub fn new(redis: Option<RedisClient>) -> Self {
        Self {
            redis,
            http: reqwest::Client::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// 先做一次全量加载，然后后台每小时刷新
    pub async fn start(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        self.update_all().await;

        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            ticker.tick().await; // 第一次立即到期，上面已经加载过
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                    _ = ticker.tick() => service.update_all().await,
                }
            }
        });
    }

    async fn update_all(&self) {
        for venue in Exchange::ALL {
            match self.fetch(venue).await {
                Ok(data) => {
                    if let Some(redis) = &self.redis {
                        let key = format!("exchangeinfo:{}", venue);
                        if let Err(e) = redis
                            .set_string_ex(&key, &data.to_string(), REDIS_TTL_SECS)
                            .await
                        {
                            warn!("[exchangeinfo] redis mirror failed for {}: {}", venue, e);
                        }
                    }
                    self.cache.write().await.insert(venue, data);
                    info!("[exchangeinfo] updated {}", venue);
                }
                Err(e) => warn!("[exchangeinfo] failed to update {}: {}", venue, e),
            }
        }
    }

    async fn fetch(&self, venue: Exchange) -> Result<serde_json::Value> {
        let request = match venue {
            Exchange::Binance => self
                .http
                .get("https://fapi.binance.com/fapi/v1/exchangeInfo"),
            Exchange::Okx => self
                .http
                .get("https://www.okx.com/api/v5/public/instruments")
                .query(&[("instType", "SWAP")]),
            Exchange::Bybit => self
                .http
                .get("https://api.bybit.com/v5/market/instruments-info")
                .query(&[("category", "linear"), ("limit", "1000")]),
            Exchange::Bitget => self
                .http
                .get("https://api.bitget.com/api/v2/mix/market/contracts")
                .query(&[("productType", "usdt-futures")]),
            Exchange::Hyperliquid => self
                .http
                .post("https://api.hyperliquid.xyz/info")
                .json(&serde_json::json!({"type": "meta"})),
        };

        let data = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("invalid exchangeinfo payload from {}", venue))?;
        Ok(data)
    }

    /// 内存 -> Redis，都没有返回 None，门面层自行降级
    pub async fn get_exchange_info(&self, venue: Exchange) -> Option<serde_json::Value> {
        if let Some(data) = self.cache.read().await.get(&venue) {
            return Some(data.clone());
        }

        if let Some(redis) = &self.redis {
            let key = format!("exchangeinfo:{}", venue);
            if let Ok(Some(raw)) = redis.get_string(&key).await {
                if let Ok(data) = serde_json::from_str(&raw) {
                    return Some(data);
                }
            }
        }
        None
    }
}
