//! WebSocket 连接和重连公共部分
//!
//! 每个交易所连接由三个并发任务组成：读循环、心跳循环、重连控制。
//! 这里只收敛最重复的两块：拨号 + 退避调度。

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::net::TcpStream;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsWriter = SplitSink<WsStream, Message>;
pub type WsReader = SplitStream<WsStream>;

pub struct WsConnector;

impl WsConnector {
    /// 拨号并发送订阅消息，返回拆分后的读写两端
    pub async fn connect(url: &str, sub_msg: Option<&serde_json::Value>) -> Result<(WsWriter, WsReader)> {
        let parsed = Url::parse(url).with_context(|| format!("invalid ws url: {}", url))?;
        let (ws_stream, _) = connect_async(parsed.as_str())
            .await
            .with_context(|| format!("failed to connect {}", url))?;

        let (mut writer, reader) = ws_stream.split();
        if let Some(msg) = sub_msg {
            writer
                .send(Message::Text(msg.to_string()))
                .await
                .context("failed to send subscription message")?;
            info!("sent subscription message to {}", url);
        }
        Ok((writer, reader))
    }
}

/// 指数退避：5s 起步，每次翻倍，封顶 60s
///
/// 连续失败超过 max_attempts 次时告警一次，之后继续按封顶间隔重试，
/// 连接状态保持 false，由 /health 暴露降级。
pub struct Backoff {
    attempt: u32,
    initial: Duration,
    cap: Duration,
    max_attempts: u32,
    exhausted_logged: bool,
}

impl Backoff {
    pub const DEFAULT_INITIAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_CAP: Duration = Duration::from_secs(60);
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

    pub fn new() -> Self {
        Self {
            attempt: 0,
            initial: Self::DEFAULT_INITIAL,
            cap: Self::DEFAULT_CAP,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            exhausted_logged: false,
        }
    }

    /// 下一次重连前应等待的时长
    pub fn next_delay(&mut self, venue: &str) -> Duration {
        self.attempt += 1;
        if self.attempt > self.max_attempts {
            if !self.exhausted_logged {
                error!(
                    "[{}] max reconnect attempts reached ({}), keep retrying at {:?} interval",
                    venue, self.max_attempts, self.cap
                );
                self.exhausted_logged = true;
            } else {
                warn!("[{}] reconnect attempt {} (degraded)", venue, self.attempt);
            }
            return self.cap;
        }

        let factor = 2u32.saturating_pow(self.attempt - 1);
        let delay = self.initial.saturating_mul(factor);
        std::cmp::min(delay, self.cap)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.exhausted_logged = false;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let mut b = Backoff::new();
        assert_eq!(b.next_delay("test"), Duration::from_secs(5));
        assert_eq!(b.next_delay("test"), Duration::from_secs(10));
        assert_eq!(b.next_delay("test"), Duration::from_secs(20));
        assert_eq!(b.next_delay("test"), Duration::from_secs(40));
        // 封顶 60s
        assert_eq!(b.next_delay("test"), Duration::from_secs(60));
        assert_eq!(b.next_delay("test"), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_keeps_retrying_past_cap() {
        let mut b = Backoff::new();
        for _ in 0..Backoff::DEFAULT_MAX_ATTEMPTS {
            b.next_delay("test");
        }
        // 超过上限后仍然给出封顶间隔而不是停止
        assert_eq!(b.next_delay("test"), Backoff::DEFAULT_CAP);
        assert_eq!(b.attempts(), Backoff::DEFAULT_MAX_ATTEMPTS + 1);
    }

    #[test]
    fn test_backoff_reset() {
        let mut b = Backoff::new();
        b.next_delay("test");
        b.next_delay("test");
        b.reset();
        assert_eq!(b.next_delay("test"), Duration::from_secs(5));
    }
}
