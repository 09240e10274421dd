//! Bybit USDT 合约 ticker 客户端
//!
//! 订阅消息:
//! ```json
//! {"op": "subscribe", "args": ["tickers.BTCUSDT"]}
//! ```
//! ticker 推送（delta 可能缺字段，缺 markPrice 的一律丢弃）:
//! ```json
//! {"topic":"tickers.BTCUSDT","type":"snapshot","ts":1700000000123,
//!  "data":{"symbol":"BTCUSDT","markPrice":"50000.1","bid1Price":"49999.9","ask1Price":"50000.3"}}
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

const BYBIT_WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";
const BYBIT_REST_URL: &str = "https://api.bybit.com";
// Bybit 要求 20s 心跳
const PING_INTERVAL: Duration = Duration::from_secs(20);

pub struct BybitClient {
    ws_url: String,
    rest_url: String,
    http: reqwest::Client,
    subscriber: RwLock<Option<Arc<dyn PriceSink>>>,
    writer: Mutex<Option<WsWriter>>,
    connected: AtomicBool,
    subscribed: RwLock<HashSet<String>>,
    symbols: RwLock<HashMap<String, SymbolInfo>>,
}

impl BybitClient {
    pub fn new() -> Self {
        Self {
            ws_url: BYBIT_WS_URL.to_string(),
            rest_url: BYBIT_REST_URL.to_string(),
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
        info!("[bybit] websocket connected");

        let symbols: Vec<String> = self.subscribed.read().unwrap().iter().cloned().collect();
        if !symbols.is_empty() {
            if let Err(e) = self.send_op("subscribe", &symbols).await {
                warn!("[bybit] resubscribe failed: {}", e);
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

    async fn send_op(&self, op: &str, symbols: &[String]) -> Result<()> {
        let msg = build_op_message(op, symbols);
        self.send_frame(Message::Text(msg.to_string())).await?;
        info!("[bybit] {} {} symbols", op, symbols.len());
        Ok(())
    }

    async fn handle_message(&self, text: &str) {
        if let Some(update) = parse_ticker(text) {
            let sink = self.subscriber.read().unwrap().clone();
            if let Some(sink) = sink {
                sink.on_price_update(update).await;
            }
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
                                error!("[bybit] failed to send pong: {}", e);
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            warn!("[bybit] received close frame: {:?}", frame);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("[bybit] websocket error: {}", e);
                            break;
                        }
                        None => {
                            warn!("[bybit] connection closed by server");
                            break;
                        }
                    }
                }
            }

            self.connected.store(false, Ordering::SeqCst);
            *self.writer.lock().await = None;

            loop {
                let delay = backoff.next_delay("bybit");
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                info!("[bybit] reconnect attempt {}", backoff.attempts());
                match self.dial().await {
                    Ok(new_reader) => {
                        reader = new_reader;
                        backoff.reset();
                        break;
                    }
                    Err(e) => error!("[bybit] reconnect failed: {}", e),
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
                        let ping = serde_json::json!({"op": "ping"});
                        if let Err(e) = self.send_frame(Message::Text(ping.to_string())).await {
                            warn!("[bybit] ping failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn load_symbol_info(&self) -> Result<()> {
        #[derive(Deserialize)]
        struct Response {
            result: ResultData,
        }
        #[derive(Deserialize)]
        struct ResultData {
            list: Vec<RawInstrument>,
        }
        #[derive(Deserialize)]
        struct RawInstrument {
            symbol: String,
            #[serde(default, rename = "baseCoin")]
            base_coin: String,
            #[serde(default, rename = "quoteCoin")]
            quote_coin: String,
            #[serde(default, rename = "priceScale")]
            price_scale: String,
            #[serde(default, rename = "lotSizeFilter")]
            lot_size_filter: LotSizeFilter,
            #[serde(default, rename = "priceFilter")]
            price_filter: PriceFilter,
        }
        #[derive(Default, Deserialize)]
        struct LotSizeFilter {
            #[serde(default, rename = "minOrderQty")]
            min_order_qty: String,
            #[serde(default, rename = "maxOrderQty")]
            max_order_qty: String,
            #[serde(default, rename = "qtyStep")]
            qty_step: String,
        }
        #[derive(Default, Deserialize)]
        struct PriceFilter {
            #[serde(default, rename = "tickSize")]
            tick_size: String,
        }

        let resp: Response = self
            .http
            .get(format!("{}/v5/market/instruments-info", self.rest_url))
            .query(&[("category", "linear"), ("limit", "1000")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut map = HashMap::new();
        for raw in resp.result.list {
            let symbol = raw.symbol.to_uppercase();
            let entry = SymbolInfo {
                symbol: symbol.clone(),
                base_asset: raw.base_coin.to_uppercase(),
                quote_asset: raw.quote_coin.to_uppercase(),
                price_precision: raw.price_scale.parse().unwrap_or(2),
                quantity_precision: crate::market::types::precision_from_str(
                    &raw.lot_size_filter.qty_step,
                ),
                min_qty: raw.lot_size_filter.min_order_qty.parse().unwrap_or(0.0),
                max_qty: raw.lot_size_filter.max_order_qty.parse().unwrap_or(0.0),
                min_notional: 0.0,
                tick_size: raw.price_filter.tick_size.parse().unwrap_or(0.0),
                step_size: raw.lot_size_filter.qty_step.parse().unwrap_or(0.0),
            };
            map.insert(symbol, entry);
        }

        info!("[bybit] loaded {} symbols", map.len());
        *self.symbols.write().unwrap() = map;
        Ok(())
    }
}

impl Default for BybitClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceProvider for BybitClient {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    fn set_subscriber(&self, sink: Arc<dyn PriceSink>) {
        *self.subscriber.write().unwrap() = Some(sink);
    }

    async fn connect(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        if let Err(e) = self.load_symbol_info().await {
            warn!("[bybit] failed to load symbol info: {}", e);
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
            self.send_op("subscribe", symbols).await?;
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
            self.send_op("unsubscribe", symbols).await?;
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
        info!("[bybit] websocket closed");
        Ok(())
    }
}

#[async_trait]
impl VenueAdapter for BybitClient {
    async fn current_price(&self, symbol: &str) -> Result<f64> {
        #[derive(Deserialize)]
        struct Response {
            result: ResultData,
        }
        #[derive(Deserialize)]
        struct ResultData {
            list: Vec<Ticker>,
        }
        #[derive(Deserialize)]
        struct Ticker {
            #[serde(rename = "markPrice")]
            mark_price: String,
        }
        let resp: Response = self
            .http
            .get(format!("{}/v5/market/tickers", self.rest_url))
            .query(&[("category", "linear"), ("symbol", &symbol.to_uppercase())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let first = resp
            .result
            .list
            .first()
            .ok_or_else(|| anyhow!("empty tickers response for {}", symbol))?;
        Ok(first.mark_price.parse()?)
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

fn build_op_message(op: &str, symbols: &[String]) -> serde_json::Value {
    let args: Vec<String> = symbols
        .iter()
        .map(|s| format!("tickers.{}", s.to_uppercase()))
        .collect();
    serde_json::json!({ "op": op, "args": args })
}

/// 解析 tickers.* 推送；delta 消息缺 markPrice 时返回 None
pub fn parse_ticker(text: &str) -> Option<PriceUpdate> {
    let v: serde_json::Value = serde_json::from_str(text).ok()?;
    let topic = v.get("topic")?.as_str()?;
    if !topic.starts_with("tickers.") {
        return None;
    }
    let data = v.get("data")?;
    let symbol = data.get("symbol")?.as_str()?.to_uppercase();
    let price: f64 = data.get("markPrice")?.as_str()?.parse().ok()?;
    let bid_price = data
        .get("bid1Price")
        .and_then(|p| p.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);
    let ask_price = data
        .get("ask1Price")
        .and_then(|p| p.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);
    let timestamp = v.get("ts").and_then(|t| t.as_i64()).unwrap_or_else(get_timestamp_ms);

    Some(PriceUpdate {
        exchange: Exchange::Bybit,
        symbol,
        price,
        bid_price,
        ask_price,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ticker_snapshot() {
        let raw = r#"{"topic":"tickers.BTCUSDT","type":"snapshot","ts":1700000000123,"data":{"symbol":"BTCUSDT","markPrice":"50000.10","bid1Price":"49999.90","ask1Price":"50000.30","lastPrice":"50000.00"}}"#;
        let update = parse_ticker(raw).unwrap();
        assert_eq!(update.symbol, "BTCUSDT");
        assert!((update.price - 50000.1).abs() < 1e-9);
        assert!((update.bid_price - 49999.9).abs() < 1e-9);
        assert!((update.ask_price - 50000.3).abs() < 1e-9);
        assert_eq!(update.timestamp, 1700000000123);
    }

    #[test]
    fn test_parse_ticker_delta_without_mark_is_dropped() {
        let raw = r#"{"topic":"tickers.BTCUSDT","type":"delta","ts":1700000000124,"data":{"symbol":"BTCUSDT","lastPrice":"50001.00"}}"#;
        assert!(parse_ticker(raw).is_none());
    }

    #[test]
    fn test_parse_ignores_other_topics() {
        assert!(parse_ticker(r#"{"topic":"kline.1.BTCUSDT","data":{}}"#).is_none());
        assert!(parse_ticker(r#"{"op":"pong"}"#).is_none());
    }

    #[test]
    fn test_op_message_shape() {
        let msg = build_op_message("subscribe", &["btcusdt".into()]);
        assert_eq!(msg["op"], "subscribe");
        assert_eq!(msg["args"][0], "tickers.BTCUSDT");
    }
}
