//! Bitget USDT-FUTURES ticker 客户端
//!
//! 订阅消息:
//! ```json
//! {"op": "subscribe", "args": [{"instType": "USDT-FUTURES", "channel": "ticker", "instId": "BTCUSDT"}]}
//! ```
//! ticker 推送（ts 为字符串毫秒）:
//! ```json
//! {"action":"snapshot",
//!  "arg":{"instType":"USDT-FUTURES","channel":"ticker","instId":"BTCUSDT"},
//!  "data":[{"instId":"BTCUSDT","markPrice":"50000.1","bidPr":"49999.9","askPr":"50000.3","ts":"1700000000123"}],
//!  "ts":1700000000124}
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail, Result};
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

const BITGET_WS_URL: &str = "wss://ws.bitget.com/v2/ws/public";
const BITGET_REST_URL: &str = "https://api.bitget.com";
// Bitget 要求 30s 内发裸文本 "ping"
const PING_INTERVAL: Duration = Duration::from_secs(30);

pub struct BitgetClient {
    ws_url: String,
    rest_url: String,
    http: reqwest::Client,
    subscriber: RwLock<Option<Arc<dyn PriceSink>>>,
    writer: Mutex<Option<WsWriter>>,
    connected: AtomicBool,
    subscribed: RwLock<HashSet<String>>,
    symbols: RwLock<HashMap<String, SymbolInfo>>,
}

impl BitgetClient {
    pub fn new() -> Self {
        Self {
            ws_url: BITGET_WS_URL.to_string(),
            rest_url: BITGET_REST_URL.to_string(),
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
        info!("[bitget] websocket connected");

        let symbols: Vec<String> = self.subscribed.read().unwrap().iter().cloned().collect();
        if !symbols.is_empty() {
            if let Err(e) = self.send_op("subscribe", &symbols).await {
                warn!("[bitget] resubscribe failed: {}", e);
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
        info!("[bitget] {} {} symbols", op, symbols.len());
        Ok(())
    }

    async fn handle_message(&self, text: &str) {
        if text == "pong" {
            return;
        }
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
                                error!("[bitget] failed to send pong: {}", e);
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            warn!("[bitget] received close frame: {:?}", frame);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("[bitget] websocket error: {}", e);
                            break;
                        }
                        None => {
                            warn!("[bitget] connection closed by server");
                            break;
                        }
                    }
                }
            }

            self.connected.store(false, Ordering::SeqCst);
            *self.writer.lock().await = None;

            loop {
                let delay = backoff.next_delay("bitget");
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                info!("[bitget] reconnect attempt {}", backoff.attempts());
                match self.dial().await {
                    Ok(new_reader) => {
                        reader = new_reader;
                        backoff.reset();
                        break;
                    }
                    Err(e) => error!("[bitget] reconnect failed: {}", e),
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
                        if let Err(e) = self.send_frame(Message::Text("ping".to_string())).await {
                            warn!("[bitget] ping failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn load_symbol_info(&self) -> Result<()> {
        #[derive(Deserialize)]
        struct Response {
            code: String,
            data: Vec<RawContract>,
        }
        #[derive(Deserialize)]
        struct RawContract {
            symbol: String,
            #[serde(default, rename = "baseCoin")]
            base_coin: String,
            #[serde(default, rename = "quoteCoin")]
            quote_coin: String,
            #[serde(default, rename = "pricePlace")]
            price_place: String,
            #[serde(default, rename = "volumePlace")]
            volume_place: String,
            #[serde(default, rename = "minTradeNum")]
            min_trade_num: String,
            #[serde(default, rename = "maxMarketOrderQty")]
            max_market_order_qty: String,
            #[serde(default, rename = "minTradeUSDT")]
            min_trade_usdt: String,
        }

        let resp: Response = self
            .http
            .get(format!("{}/api/v2/mix/market/contracts", self.rest_url))
            .query(&[("productType", "usdt-futures")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if resp.code != "00000" {
            bail!("contracts query returned code {}", resp.code);
        }

        let mut map = HashMap::new();
        for raw in resp.data {
            let symbol = raw.symbol.to_uppercase();
            let price_place: u32 = raw.price_place.parse().unwrap_or(2);
            let volume_place: u32 = raw.volume_place.parse().unwrap_or(2);
            let entry = SymbolInfo {
                symbol: symbol.clone(),
                base_asset: raw.base_coin.to_uppercase(),
                quote_asset: raw.quote_coin.to_uppercase(),
                price_precision: price_place,
                quantity_precision: volume_place,
                min_qty: raw.min_trade_num.parse().unwrap_or(0.0),
                max_qty: raw.max_market_order_qty.parse().unwrap_or(0.0),
                min_notional: raw.min_trade_usdt.parse().unwrap_or(0.0),
                tick_size: 10f64.powi(-(price_place as i32)),
                step_size: 10f64.powi(-(volume_place as i32)),
            };
            map.insert(symbol, entry);
        }

        info!("[bitget] loaded {} symbols", map.len());
        *self.symbols.write().unwrap() = map;
        Ok(())
    }
}

impl Default for BitgetClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceProvider for BitgetClient {
    fn exchange(&self) -> Exchange {
        Exchange::Bitget
    }

    fn set_subscriber(&self, sink: Arc<dyn PriceSink>) {
        *self.subscriber.write().unwrap() = Some(sink);
    }

    async fn connect(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        if let Err(e) = self.load_symbol_info().await {
            warn!("[bitget] failed to load symbol info: {}", e);
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
        info!("[bitget] websocket closed");
        Ok(())
    }
}

#[async_trait]
impl VenueAdapter for BitgetClient {
    async fn current_price(&self, symbol: &str) -> Result<f64> {
        #[derive(Deserialize)]
        struct Response {
            data: Vec<Ticker>,
        }
        #[derive(Deserialize)]
        struct Ticker {
            #[serde(rename = "markPrice")]
            mark_price: String,
        }
        let resp: Response = self
            .http
            .get(format!("{}/api/v2/mix/market/ticker", self.rest_url))
            .query(&[
                ("productType", "usdt-futures"),
                ("symbol", &symbol.to_uppercase()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let first = resp
            .data
            .first()
            .ok_or_else(|| anyhow!("empty ticker response for {}", symbol))?;
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
    let args: Vec<serde_json::Value> = symbols
        .iter()
        .map(|s| {
            serde_json::json!({
                "instType": "USDT-FUTURES",
                "channel": "ticker",
                "instId": s.to_uppercase(),
            })
        })
        .collect();
    serde_json::json!({ "op": op, "args": args })
}

/// 解析 ticker 推送；缺 markPrice 的消息丢弃
pub fn parse_ticker(text: &str) -> Option<PriceUpdate> {
    let v: serde_json::Value = serde_json::from_str(text).ok()?;
    let arg = v.get("arg")?;
    if arg.get("channel")?.as_str()? != "ticker" {
        return None;
    }
    let symbol = arg.get("instId")?.as_str()?.to_uppercase();
    let first = v.get("data")?.as_array()?.first()?;
    let price: f64 = first.get("markPrice")?.as_str()?.parse().ok()?;
    let bid_price = first
        .get("bidPr")
        .and_then(|p| p.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);
    let ask_price = first
        .get("askPr")
        .and_then(|p| p.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);
    let timestamp = first
        .get("ts")
        .and_then(|t| t.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(get_timestamp_ms);

    Some(PriceUpdate {
        exchange: Exchange::Bitget,
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
    fn test_parse_ticker() {
        let raw = r#"{"action":"snapshot","arg":{"instType":"USDT-FUTURES","channel":"ticker","instId":"BTCUSDT"},"data":[{"instId":"BTCUSDT","lastPr":"50000.0","markPrice":"50000.1","bidPr":"49999.9","askPr":"50000.3","ts":"1700000000123"}],"ts":1700000000124}"#;
        let update = parse_ticker(raw).unwrap();
        assert_eq!(update.exchange, Exchange::Bitget);
        assert_eq!(update.symbol, "BTCUSDT");
        assert!((update.price - 50000.1).abs() < 1e-9);
        assert_eq!(update.timestamp, 1700000000123);
    }

    #[test]
    fn test_parse_ignores_other_channels() {
        let raw = r#"{"arg":{"instType":"USDT-FUTURES","channel":"candle1m","instId":"BTCUSDT"},"data":[[1,2,3]]}"#;
        assert!(parse_ticker(raw).is_none());
        assert!(parse_ticker(r#"{"event":"subscribe","arg":{"channel":"ticker","instId":"BTCUSDT"}}"#).is_none());
    }

    #[test]
    fn test_op_message_shape() {
        let msg = build_op_message("subscribe", &["btcusdt".into()]);
        assert_eq!(msg["op"], "subscribe");
        assert_eq!(msg["args"][0]["instType"], "USDT-FUTURES");
        assert_eq!(msg["args"][0]["channel"], "ticker");
        assert_eq!(msg["args"][0]["instId"], "BTCUSDT");
    }
}
