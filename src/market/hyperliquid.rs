//! Hyperliquid allMids 客户端
//!
//! 订阅消息:
//! ```json
//! {"method": "subscribe", "subscription": {"type": "allMids"}}
//! ```
//! 推送（coin 为 base，价格为字符串）:
//! ```json
//! {"channel":"allMids","data":{"mids":{"BTC":"50000.1","ETH":"3000.2"}}}
//! ```
//! 符号归一化：base 补 USDT，即 BTC -> BTCUSDT。
//! 资产下标映射取自 `meta` 返回的 universe 顺序，下单接口用。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, Duration};
use tokio_tungstenite::tungstenite::Message;

use crate::common::exchange::Exchange;
use crate::common::time_util::get_timestamp_ms;
use crate::market::connection::{Backoff, WsConnector, WsReader, WsWriter};
use crate::market::types::{PriceProvider, PriceSink, PriceUpdate, SymbolInfo, VenueAdapter};

const HYPERLIQUID_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";
const HYPERLIQUID_REST_URL: &str = "https://api.hyperliquid.xyz";
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// meta 不可用时的兜底映射
const FALLBACK_UNIVERSE: [&str; 5] = ["BTC", "ETH", "SOL", "DOGE", "XRP"];

pub struct HyperliquidClient {
    ws_url: String,
    rest_url: String,
    http: reqwest::Client,
    subscriber: RwLock<Option<Arc<dyn PriceSink>>>,
    writer: Mutex<Option<WsWriter>>,
    connected: AtomicBool,
    /// 以 coin（BTC）形式记录
    subscribed: RwLock<HashSet<String>>,
    symbols: RwLock<HashMap<String, SymbolInfo>>,
    /// universe 顺序即资产下标
    universe: RwLock<Vec<String>>,
}

impl HyperliquidClient {
    pub fn new() -> Self {
        Self {
            ws_url: HYPERLIQUID_WS_URL.to_string(),
            rest_url: HYPERLIQUID_REST_URL.to_string(),
            http: reqwest::Client::new(),
            subscriber: RwLock::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            subscribed: RwLock::new(HashSet::new()),
            symbols: RwLock::new(HashMap::new()),
            universe: RwLock::new(FALLBACK_UNIVERSE.iter().map(|s| s.to_string()).collect()),
        }
    }

    /// 资产下标 -> 归一化符号（0 -> BTCUSDT）
    pub fn symbol_for_asset(&self, index: usize) -> Option<String> {
        self.universe
            .read()
            .unwrap()
            .get(index)
            .map(|coin| to_standard_symbol(coin))
    }

    /// 归一化符号 -> 资产下标
    pub fn asset_for_symbol(&self, symbol: &str) -> Option<usize> {
        let coin = to_coin(symbol);
        self.universe.read().unwrap().iter().position(|c| c == &coin)
    }

    async fn dial(&self) -> Result<WsReader> {
        let sub = serde_json::json!({
            "method": "subscribe",
            "subscription": { "type": "allMids" },
        });
        let (writer, reader) = WsConnector::connect(&self.ws_url, Some(&sub)).await?;
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        info!("[hyperliquid] websocket connected, allMids subscribed");
        Ok(reader)
    }

    async fn send_frame(&self, msg: Message) -> Result<()> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => Ok(writer.send(msg).await?),
            None => Err(anyhow!("not connected")),
        }
    }

    async fn handle_message(&self, text: &str) {
        let Some(mids) = parse_all_mids(text) else {
            return;
        };
        let sink = self.subscriber.read().unwrap().clone();
        let Some(sink) = sink else { return };

        let subscribed = self.subscribed.read().unwrap().clone();
        let ts = get_timestamp_ms();
        for (coin, price) in mids {
            // allMids 是全市场推送，只透传订阅过的
            if !subscribed.is_empty() && !subscribed.contains(&coin) {
                continue;
            }
            sink.on_price_update(PriceUpdate {
                exchange: Exchange::Hyperliquid,
                symbol: to_standard_symbol(&coin),
                price,
                bid_price: 0.0,
                ask_price: 0.0,
                timestamp: ts,
            })
            .await;
        }
    }

    async fn run_loop(self: Arc<Self>, mut reader: WsReader, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = Backoff::new();
        loop {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            let _ = self.close().await;
                            return;
                        }
                    }
                    msg = reader.next() => match msg {
                        Some(Ok(Message::Text(text))) => self.handle_message(&text).await,
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(e) = self.send_frame(Message::Pong(payload)).await {
                                error!("[hyperliquid] failed to send pong: {}", e);
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            warn!("[hyperliquid] received close frame: {:?}", frame);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("[hyperliquid] websocket error: {}", e);
                            break;
                        }
                        None => {
                            warn!("[hyperliquid] connection closed by server");
                            break;
                        }
                    }
                }
            }

            self.connected.store(false, Ordering::SeqCst);
            *self.writer.lock().await = None;

            loop {
                let delay = backoff.next_delay("hyperliquid");
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                info!("[hyperliquid] reconnect attempt {}", backoff.attempts());
                match self.dial().await {
                    Ok(new_reader) => {
                        reader = new_reader;
                        backoff.reset();
                        break;
                    }
                    Err(e) => error!("[hyperliquid] reconnect failed: {}", e),
                }
            }
        }
    }

    async fn ping_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(PING_INTERVAL);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if self.is_connected() {
                        let ping = serde_json::json!({"method": "ping"});
                        if let Err(e) = self.send_frame(Message::Text(ping.to_string())).await {
                            warn!("[hyperliquid] ping failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn load_symbol_info(&self) -> Result<()> {
        #[derive(Deserialize)]
        struct Meta {
            universe: Vec<RawAsset>,
        }
        #[derive(Deserialize)]
        struct RawAsset {
            name: String,
            #[serde(default, rename = "szDecimals")]
            sz_decimals: u32,
        }

        let meta: Meta = self
            .http
            .post(format!("{}/info", self.rest_url))
            .json(&serde_json::json!({"type": "meta"}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut map = HashMap::new();
        let mut universe = Vec::with_capacity(meta.universe.len());
        for asset in &meta.universe {
            let coin = asset.name.to_uppercase();
            let symbol = to_standard_symbol(&coin);
            map.insert(
                symbol.clone(),
                SymbolInfo {
                    symbol,
                    base_asset: coin.clone(),
                    quote_asset: "USD".to_string(),
                    price_precision: 6,
                    quantity_precision: asset.sz_decimals,
                    min_qty: 0.0,
                    max_qty: 0.0,
                    min_notional: 0.0,
                    tick_size: 0.0,
                    step_size: 10f64.powi(-(asset.sz_decimals as i32)),
                },
            );
            universe.push(coin);
        }

        info!("[hyperliquid] loaded {} assets from meta", universe.len());
        *self.symbols.write().unwrap() = map;
        *self.universe.write().unwrap() = universe;
        Ok(())
    }
}

impl Default for HyperliquidClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceProvider for HyperliquidClient {
    fn exchange(&self) -> Exchange {
        Exchange::Hyperliquid
    }

    fn set_subscriber(&self, sink: Arc<dyn PriceSink>) {
        *self.subscriber.write().unwrap() = Some(sink);
    }

    async fn connect(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        if let Err(e) = self.load_symbol_info().await {
            warn!("[hyperliquid] failed to load meta, using fallback universe: {}", e);
        }

        let reader = self.dial().await?;

        let read_client = self.clone();
        let read_shutdown = shutdown_rx.clone();
        tokio::spawn(async move { read_client.run_loop(reader, read_shutdown).await });

        let ping_client = self.clone();
        tokio::spawn(async move { ping_client.ping_loop(shutdown_rx).await });
        Ok(())
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<()> {
        // allMids 已经是全市场流，这里只维护过滤集合
        let mut set = self.subscribed.write().unwrap();
        for symbol in symbols {
            set.insert(to_coin(symbol));
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<()> {
        let mut set = self.subscribed.write().unwrap();
        for symbol in symbols {
            set.remove(&to_coin(symbol));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.send(Message::Close(None)).await;
        }
        info!("[hyperliquid] websocket closed");
        Ok(())
    }
}

#[async_trait]
impl VenueAdapter for HyperliquidClient {
    async fn current_price(&self, symbol: &str) -> Result<f64> {
        let mids: HashMap<String, String> = self
            .http
            .post(format!("{}/info", self.rest_url))
            .json(&serde_json::json!({"type": "allMids"}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let coin = to_coin(symbol);
        let price = mids
            .get(&coin)
            .ok_or_else(|| anyhow!("no mid price for {}", coin))?;
        Ok(price.parse()?)
    }

    fn symbol_info(&self, symbol: &str) -> Option<SymbolInfo> {
        self.symbols.read().unwrap().get(&symbol.to_uppercase()).cloned()
    }

    fn validate_symbol(&self, symbol: &str) -> bool {
        self.symbols.read().unwrap().contains_key(&symbol.to_uppercase())
    }

    fn all_symbols(&self) -> Vec<String> {
        self.symbols.read().unwrap().keys().cloned().collect()
    }
}

/// BTCUSDT -> BTC
pub fn to_coin(symbol: &str) -> String {
    let upper = symbol.to_uppercase();
    if let Some(base) = upper.strip_suffix("USDT") {
        return base.to_string();
    }
    if let Some(base) = upper.strip_suffix("USD") {
        return base.to_string();
    }
    upper
}

/// BTC -> BTCUSDT
pub fn to_standard_symbol(coin: &str) -> String {
    let upper = coin.to_uppercase();
    if upper.ends_with("USDT") || upper.ends_with("USD") {
        return upper;
    }
    format!("{}USDT", upper)
}

/// 解析 allMids 推送，返回 (coin, price) 列表
pub fn parse_all_mids(text: &str) -> Option<Vec<(String, f64)>> {
    let v: serde_json::Value = serde_json::from_str(text).ok()?;
    if v.get("channel")?.as_str()? != "allMids" {
        return None;
    }
    let mids = v.get("data")?.get("mids")?.as_object()?;
    let mut out = Vec::with_capacity(mids.len());
    for (coin, price) in mids {
        if let Some(price) = price.as_str().and_then(|s| s.parse().ok()) {
            out.push((coin.to_uppercase(), price));
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_conversion() {
        assert_eq!(to_coin("BTCUSDT"), "BTC");
        assert_eq!(to_coin("ETHUSD"), "ETH");
        assert_eq!(to_coin("BTC"), "BTC");
        assert_eq!(to_standard_symbol("BTC"), "BTCUSDT");
        assert_eq!(to_standard_symbol("BTCUSDT"), "BTCUSDT");
    }

    #[test]
    fn test_parse_all_mids() {
        let raw = r#"{"channel":"allMids","data":{"mids":{"BTC":"50000.1","ETH":"3000.25"}}}"#;
        let mut mids = parse_all_mids(raw).unwrap();
        mids.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(mids.len(), 2);
        assert_eq!(mids[0].0, "BTC");
        assert!((mids[0].1 - 50000.1).abs() < 1e-9);
    }

    #[test]
    fn test_parse_ignores_other_channels() {
        assert!(parse_all_mids(r#"{"channel":"subscriptionResponse","data":{}}"#).is_none());
        assert!(parse_all_mids(r#"{"channel":"pong"}"#).is_none());
    }

    #[test]
    fn test_fallback_asset_index_mapping() {
        let client = HyperliquidClient::new();
        assert_eq!(client.symbol_for_asset(0).as_deref(), Some("BTCUSDT"));
        assert_eq!(client.symbol_for_asset(4).as_deref(), Some("XRPUSDT"));
        assert_eq!(client.symbol_for_asset(99), None);
        assert_eq!(client.asset_for_symbol("ETHUSDT"), Some(1));
    }
}
