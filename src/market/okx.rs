//! OKX 永续合约标记价格客户端
//!
//! 订阅消息:
//! ```json
//! {"op": "subscribe", "args": [{"channel": "mark-price", "instId": "BTC-USDT-SWAP"}]}
//! ```
//! 标记价格推送:
//! ```json
//! {"arg":{"channel":"mark-price","instId":"BTC-USDT-SWAP"},
//!  "data":[{"instId":"BTC-USDT-SWAP","markPx":"50000.1","ts":"1700000000123"}]}
//! ```
//! 符号归一化：去掉 `-SWAP` 和 `-`，即 BTC-USDT-SWAP -> BTCUSDT。

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
use crate::market::types::{
    precision_from_str, PriceProvider, PriceSink, PriceUpdate, SymbolInfo, VenueAdapter,
};

const OKX_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const OKX_REST_URL: &str = "https://www.okx.com";
// OKX 要求 30s 内有数据往来，25s 主动发 "ping"
const PING_INTERVAL: Duration = Duration::from_secs(25);

pub struct OkxClient {
    ws_url: String,
    rest_url: String,
    http: reqwest::Client,
    subscriber: RwLock<Option<Arc<dyn PriceSink>>>,
    writer: Mutex<Option<WsWriter>>,
    connected: AtomicBool,
    subscribed: RwLock<HashSet<String>>,
    symbols: RwLock<HashMap<String, SymbolInfo>>,
}

impl OkxClient {
    pub fn new() -> Self {
        Self {
            ws_url: OKX_WS_URL.to_string(),
            rest_url: OKX_REST_URL.to_string(),
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
        info!("[okx] websocket connected");

        let symbols: Vec<String> = self.subscribed.read().unwrap().iter().cloned().collect();
        if !symbols.is_empty() {
            if let Err(e) = self.send_op("subscribe", &symbols).await {
                warn!("[okx] resubscribe failed: {}", e);
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
        info!("[okx] {} {} symbols", op, symbols.len());
        Ok(())
    }

    async fn handle_message(&self, text: &str) {
        // 心跳应答是裸文本 "pong"
        if text == "pong" {
            return;
        }
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
                                error!("[okx] failed to send pong: {}", e);
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            warn!("[okx] received close frame: {:?}", frame);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("[okx] websocket error: {}", e);
                            break;
                        }
                        None => {
                            warn!("[okx] connection closed by server");
                            break;
                        }
                    }
                }
            }

            self.connected.store(false, Ordering::SeqCst);
            *self.writer.lock().await = None;

            loop {
                let delay = backoff.next_delay("okx");
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                info!("[okx] reconnect attempt {}", backoff.attempts());
                match self.dial().await {
                    Ok(new_reader) => {
                        reader = new_reader;
                        backoff.reset();
                        break;
                    }
                    Err(e) => error!("[okx] reconnect failed: {}", e),
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
                            warn!("[okx] ping failed: {}", e);
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
            data: Vec<RawInstrument>,
        }
        #[derive(Deserialize)]
        struct RawInstrument {
            #[serde(rename = "instId")]
            inst_id: String,
            #[serde(default, rename = "tickSz")]
            tick_sz: String,
            #[serde(default, rename = "lotSz")]
            lot_sz: String,
            #[serde(default, rename = "minSz")]
            min_sz: String,
            #[serde(default, rename = "maxMktSz")]
            max_mkt_sz: String,
            #[serde(default, rename = "settleCcy")]
            settle_ccy: String,
        }

        let resp: Response = self
            .http
            .get(format!("{}/api/v5/public/instruments", self.rest_url))
            .query(&[("instType", "SWAP")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if resp.code != "0" {
            bail!("instruments query returned code {}", resp.code);
        }

        let mut map = HashMap::new();
        for raw in resp.data {
            if raw.settle_ccy != "USDT" {
                continue;
            }
            let symbol = from_inst_id(&raw.inst_id);
            let base = symbol.trim_end_matches("USDT").to_string();
            let entry = SymbolInfo {
                symbol: symbol.clone(),
                base_asset: base,
                quote_asset: "USDT".to_string(),
                price_precision: precision_from_str(&raw.tick_sz),
                quantity_precision: precision_from_str(&raw.lot_sz),
                min_qty: raw.min_sz.parse().unwrap_or(0.0),
                max_qty: raw.max_mkt_sz.parse().unwrap_or(0.0),
                min_notional: 0.0,
                tick_size: raw.tick_sz.parse().unwrap_or(0.0),
                step_size: raw.lot_sz.parse().unwrap_or(0.0),
            };
            map.insert(symbol, entry);
        }

        info!("[okx] loaded {} symbols", map.len());
        *self.symbols.write().unwrap() = map;
        Ok(())
    }
}

impl Default for OkxClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceProvider for OkxClient {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    fn set_subscriber(&self, sink: Arc<dyn PriceSink>) {
        *self.subscriber.write().unwrap() = Some(sink);
    }

    async fn connect(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        if let Err(e) = self.load_symbol_info().await {
            warn!("[okx] failed to load symbol info: {}", e);
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
        info!("[okx] websocket closed");
        Ok(())
    }
}

#[async_trait]
impl VenueAdapter for OkxClient {
    async fn current_price(&self, symbol: &str) -> Result<f64> {
        #[derive(Deserialize)]
        struct Response {
            data: Vec<MarkPx>,
        }
        #[derive(Deserialize)]
        struct MarkPx {
            #[serde(rename = "markPx")]
            mark_px: String,
        }
        let resp: Response = self
            .http
            .get(format!("{}/api/v5/public/mark-price", self.rest_url))
            .query(&[("instType", "SWAP"), ("instId", &to_inst_id(symbol))])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let first = resp
            .data
            .first()
            .ok_or_else(|| anyhow!("empty mark-price response for {}", symbol))?;
        Ok(first.mark_px.parse()?)
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

/// BTCUSDT -> BTC-USDT-SWAP
pub fn to_inst_id(symbol: &str) -> String {
    let upper = symbol.to_uppercase();
    if let Some(base) = upper.strip_suffix("USDT") {
        format!("{}-USDT-SWAP", base)
    } else {
        upper
    }
}

/// BTC-USDT-SWAP -> BTCUSDT
pub fn from_inst_id(inst_id: &str) -> String {
    inst_id.to_uppercase().replace("-SWAP", "").replace('-', "")
}

fn build_op_message(op: &str, symbols: &[String]) -> serde_json::Value {
    let args: Vec<serde_json::Value> = symbols
        .iter()
        .map(|s| {
            serde_json::json!({
                "channel": "mark-price",
                "instId": to_inst_id(s),
            })
        })
        .collect();
    serde_json::json!({ "op": op, "args": args })
}

/// 解析 mark-price 推送，其他消息返回 None
pub fn parse_mark_price(text: &str) -> Option<PriceUpdate> {
    let v: serde_json::Value = serde_json::from_str(text).ok()?;
    let arg = v.get("arg")?;
    if arg.get("channel")?.as_str()? != "mark-price" {
        return None;
    }
    let inst_id = arg.get("instId")?.as_str()?;
    let first = v.get("data")?.as_array()?.first()?;
    let price: f64 = first.get("markPx")?.as_str()?.parse().ok()?;
    let timestamp = first
        .get("ts")
        .and_then(|t| t.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(get_timestamp_ms);

    Some(PriceUpdate {
        exchange: Exchange::Okx,
        symbol: from_inst_id(inst_id),
        price,
        bid_price: 0.0,
        ask_price: 0.0,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_conversion() {
        assert_eq!(to_inst_id("BTCUSDT"), "BTC-USDT-SWAP");
        assert_eq!(to_inst_id("btcusdt"), "BTC-USDT-SWAP");
        assert_eq!(from_inst_id("BTC-USDT-SWAP"), "BTCUSDT");
        assert_eq!(from_inst_id("TRX-USDT-SWAP"), "TRXUSDT");
    }

    #[test]
    fn test_parse_mark_price() {
        let raw = r#"{"arg":{"channel":"mark-price","instId":"BTC-USDT-SWAP"},"data":[{"instId":"BTC-USDT-SWAP","instType":"SWAP","markPx":"50000.1","ts":"1700000000123"}]}"#;
        let update = parse_mark_price(raw).unwrap();
        assert_eq!(update.exchange, Exchange::Okx);
        assert_eq!(update.symbol, "BTCUSDT");
        assert!((update.price - 50000.1).abs() < 1e-9);
        assert_eq!(update.timestamp, 1700000000123);
    }

    #[test]
    fn test_parse_ignores_other_channels() {
        let raw = r#"{"arg":{"channel":"index-tickers","instId":"BTC-USDT"},"data":[{"idxPx":"1"}]}"#;
        assert!(parse_mark_price(raw).is_none());
        assert!(parse_mark_price(r#"{"event":"subscribe","arg":{"channel":"mark-price","instId":"BTC-USDT-SWAP"}}"#).is_none());
    }

    #[test]
    fn test_op_message_shape() {
        let msg = build_op_message("subscribe", &["BTCUSDT".into()]);
        assert_eq!(msg["op"], "subscribe");
        assert_eq!(msg["args"][0]["channel"], "mark-price");
        assert_eq!(msg["args"][0]["instId"], "BTC-USDT-SWAP");
    }
}
