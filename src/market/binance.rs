//! Binance USDⓈ-M 合约标记价格客户端
//!
//! 订阅消息:
//! ```json
//! {"method": "SUBSCRIBE", "params": ["btcusdt@markPrice@1s"], "id": 1700000000000}
//! ```
//! 标记价格推送:
//! ```json
//! {"e": "markPriceUpdate", "E": 1700000000123, "s": "BTCUSDT", "p": "50000.10000000", ...}
//! ```

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

const BINANCE_WS_URL: &str = "wss://fstream.binance.com/ws";
const BINANCE_REST_URL: &str = "https://fapi.binance.com";
const PING_INTERVAL: Duration = Duration::from_secs(30);

pub struct BinanceClient {
    ws_url: String,
    rest_url: String,
    http: reqwest::Client,
    subscriber: RwLock<Option<Arc<dyn PriceSink>>>,
    writer: Mutex<Option<WsWriter>>,
    connected: AtomicBool,
    subscribed: RwLock<HashSet<String>>,
    symbols: RwLock<HashMap<String, SymbolInfo>>,
}

impl BinanceClient {
    pub fn new() -> Self {
        Self {
            ws_url: BINANCE_WS_URL.to_string(),
            rest_url: BINANCE_REST_URL.to_string(),
            http: reqwest::Client::new(),
            subscriber: RwLock::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            subscribed: RwLock::new(HashSet::new()),
            symbols: RwLock::new(HashMap::new()),
        }
    }

    async fn dial(&self) -> Result<WsReader> {
        let (writer, reader) = WsConnector::connect(&self.ws_url, None).await?;
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        info!("[binance] websocket connected");

        // 重连后补发之前订阅过的全部 symbol
        let symbols: Vec<String> = self.subscribed.read().unwrap().iter().cloned().collect();
        if !symbols.is_empty() {
            if let Err(e) = self.send_subscribe(&symbols).await {
                warn!("[binance] resubscribe failed: {}", e);
            }
        }
        Ok(reader)
    }

    async fn send_frame(&self, msg: Message) -> Result<()> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => Ok(writer.send(msg).await?),
            None => Err(anyhow!("not connected")),
        }
    }

    async fn send_subscribe(&self, symbols: &[String]) -> Result<()> {
        let msg = build_subscribe_message("SUBSCRIBE", symbols);
        self.send_frame(Message::Text(msg.to_string())).await?;
        info!("[binance] subscribed to {} symbols", symbols.len());
        Ok(())
    }

    async fn handle_message(&self, text: &str) {
        if let Some(update) = parse_mark_price(text) {
            let sink = self.subscriber.read().unwrap().clone();
            if let Some(sink) = sink {
                sink.on_price_update(update).await;
            }
        }
    }

    async fn run_loop(self: Arc<Self>, mut reader: WsReader, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = Backoff::new();
        loop {
            // ==== 读循环 ====
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
                                error!("[binance] failed to send pong: {}", e);
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            warn!("[binance] received close frame: {:?}", frame);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("[binance] websocket error: {}", e);
                            break;
                        }
                        None => {
                            warn!("[binance] connection closed by server");
                            break;
                        }
                    }
                }
            }

            self.connected.store(false, Ordering::SeqCst);
            *self.writer.lock().await = None;

            // ==== 重连循环 ====
            loop {
                let delay = backoff.next_delay("binance");
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                info!("[binance] reconnect attempt {}", backoff.attempts());
                match self.dial().await {
                    Ok(new_reader) => {
                        reader = new_reader;
                        backoff.reset();
                        break;
                    }
                    Err(e) => error!("[binance] reconnect failed: {}", e),
                }
            }
        }
    }

    /// Binance 要求连接侧保持心跳，空 pong 帧即可
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
                        if let Err(e) = self.send_frame(Message::Pong(Vec::new())).await {
                            warn!("[binance] ping failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn load_symbol_info(&self) -> Result<()> {
        let resp = self
            .http
            .get(format!("{}/fapi/v1/exchangeInfo", self.rest_url))
            .send()
            .await?
            .error_for_status()?;
        let info: RawExchangeInfo = resp.json().await?;

        let mut map = HashMap::new();
        for raw in info.symbols {
            let mut entry = SymbolInfo {
                symbol: raw.symbol.to_uppercase(),
                base_asset: raw.base_asset.to_uppercase(),
                quote_asset: raw.quote_asset.to_uppercase(),
                price_precision: raw.price_precision,
                quantity_precision: raw.quantity_precision,
                ..SymbolInfo::default()
            };
            for filter in raw.filters {
                match filter.filter_type.as_str() {
                    "LOT_SIZE" => {
                        entry.min_qty = parse_f64(filter.min_qty.as_deref());
                        entry.max_qty = parse_f64(filter.max_qty.as_deref());
                        entry.step_size = parse_f64(filter.step_size.as_deref());
                    }
                    "PRICE_FILTER" => {
                        entry.tick_size = parse_f64(filter.tick_size.as_deref());
                    }
                    "MIN_NOTIONAL" => {
                        entry.min_notional = parse_f64(filter.notional.as_deref());
                    }
                    _ => {}
                }
            }
            map.insert(entry.symbol.clone(), entry);
        }

        info!("[binance] loaded {} symbols", map.len());
        *self.symbols.write().unwrap() = map;
        Ok(())
    }
}

impl Default for BinanceClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceProvider for BinanceClient {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn set_subscriber(&self, sink: Arc<dyn PriceSink>) {
        *self.subscriber.write().unwrap() = Some(sink);
    }

    async fn connect(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        if let Err(e) = self.load_symbol_info().await {
            warn!("[binance] failed to load symbol info: {}", e);
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
        {
            let mut set = self.subscribed.write().unwrap();
            for symbol in symbols {
                set.insert(symbol.to_uppercase());
            }
        }
        if self.is_connected() {
            self.send_subscribe(symbols).await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<()> {
        {
            let mut set = self.subscribed.write().unwrap();
            for symbol in symbols {
                set.remove(&symbol.to_uppercase());
            }
        }
        if self.is_connected() {
            let msg = build_subscribe_message("UNSUBSCRIBE", symbols);
            self.send_frame(Message::Text(msg.to_string())).await?;
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
        info!("[binance] websocket closed");
        Ok(())
    }
}

#[async_trait]
impl VenueAdapter for BinanceClient {
    async fn current_price(&self, symbol: &str) -> Result<f64> {
        #[derive(Deserialize)]
        struct TickerPrice {
            price: String,
        }
        let resp: TickerPrice = self
            .http
            .get(format!("{}/fapi/v1/ticker/price", self.rest_url))
            .query(&[("symbol", symbol.to_uppercase())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.price.parse()?)
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

fn build_subscribe_message(method: &str, symbols: &[String]) -> serde_json::Value {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@markPrice@1s", s.to_lowercase()))
        .collect();
    serde_json::json!({
        "method": method,
        "params": streams,
        "id": get_timestamp_ms(),
    })
}

/// 解析 markPriceUpdate 推送，其他消息返回 None
pub fn parse_mark_price(text: &str) -> Option<PriceUpdate> {
    let v: serde_json::Value = serde_json::from_str(text).ok()?;
    if v.get("e")?.as_str()? != "markPriceUpdate" {
        return None;
    }
    let symbol = v.get("s")?.as_str()?.to_uppercase();
    let price: f64 = v.get("p")?.as_str()?.parse().ok()?;
    let timestamp = v
        .get("E")
        .and_then(|t| t.as_i64())
        .unwrap_or_else(get_timestamp_ms);

    Some(PriceUpdate {
        exchange: Exchange::Binance,
        symbol,
        price,
        bid_price: 0.0,
        ask_price: 0.0,
        timestamp,
    })
}

fn parse_f64(value: Option<&str>) -> f64 {
    value.and_then(|s| s.parse().ok()).unwrap_or(0.0)
}

#[derive(Debug, Deserialize)]
struct RawExchangeInfo {
    symbols: Vec<RawSymbol>,
}

#[derive(Debug, Deserialize)]
struct RawSymbol {
    symbol: String,
    #[serde(rename = "baseAsset")]
    base_asset: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
    #[serde(default, rename = "pricePrecision")]
    price_precision: u32,
    #[serde(default, rename = "quantityPrecision")]
    quantity_precision: u32,
    #[serde(default)]
    filters: Vec<RawFilter>,
}

#[derive(Debug, Deserialize)]
struct RawFilter {
    #[serde(rename = "filterType")]
    filter_type: String,
    #[serde(rename = "minQty")]
    min_qty: Option<String>,
    #[serde(rename = "maxQty")]
    max_qty: Option<String>,
    #[serde(rename = "stepSize")]
    step_size: Option<String>,
    #[serde(rename = "tickSize")]
    tick_size: Option<String>,
    #[serde(rename = "notional")]
    notional: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mark_price() {
        let raw = r#"{"e":"markPriceUpdate","E":1700000000123,"s":"BTCUSDT","p":"50000.10000000","i":"50001.2","r":"0.0001","T":1700028800000}"#;
        let update = parse_mark_price(raw).unwrap();
        assert_eq!(update.exchange, Exchange::Binance);
        assert_eq!(update.symbol, "BTCUSDT");
        assert!((update.price - 50000.1).abs() < 1e-9);
        assert_eq!(update.timestamp, 1700000000123);
    }

    #[test]
    fn test_parse_ignores_other_events() {
        assert!(parse_mark_price(r#"{"result":null,"id":1}"#).is_none());
        assert!(parse_mark_price(r#"{"e":"aggTrade","s":"BTCUSDT","p":"1"}"#).is_none());
        assert!(parse_mark_price("not json").is_none());
    }

    #[test]
    fn test_subscribe_message_shape() {
        let msg = build_subscribe_message("SUBSCRIBE", &["BTCUSDT".into(), "ETHUSDT".into()]);
        assert_eq!(msg["method"], "SUBSCRIBE");
        assert_eq!(msg["params"][0], "btcusdt@markPrice@1s");
        assert_eq!(msg["params"][1], "ethusdt@markPrice@1s");
        assert!(msg["id"].is_i64() || msg["id"].is_u64());
    }
}
