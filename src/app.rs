//! 应用装配
//!
//! Redis / Postgres / 行情服务 / 引擎 / worker / HTTP 服务的生命周期
//! 都在这里。收到 ctrl-c 后通过 watch 通道广播关闭，等各 WS 客户端
//! 自行收尾。

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use log::{error, info, warn};
use serde_json::json;
use tokio::sync::watch;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};

use crate::cfg::Config;
use crate::common::crypto::SecretCipher;
use crate::common::redis_client::RedisClient;
use crate::common::time_util::get_timestamp_secs;
use crate::engine::TradingEngine;
use crate::facade::{self, AppState};
use crate::market::aggregator::PriceService;
use crate::market::registry::ExchangeInfoService;
use crate::store;
use crate::worker::SltpWorker;

pub struct SimulatorApp {
    config: Config,
    state: AppState,
    prices: Arc<PriceService>,
    shutdown_tx: watch::Sender<bool>,
}

impl SimulatorApp {
    pub async fn new(config: Config) -> Result<Self> {
        let cipher = Arc::new(
            SecretCipher::new(&config.encryption.aes_key).context("invalid encryption key")?,
        );

        // Redis 不可用时行情退化为纯内存，交易照常
        let redis = match RedisClient::connect(config.redis.clone()).await {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("redis unavailable, price mirror disabled: {}", e);
                None
            }
        };

        let pool = store::connect(&config.database).await?;
        let prices = PriceService::new(redis.clone());
        let exchange_info = Arc::new(ExchangeInfoService::new(redis));
        let engine = Arc::new(TradingEngine::new(pool.clone(), prices.clone()));

        let (shutdown_tx, _) = watch::channel(false);

        let state = AppState {
            engine,
            prices: prices.clone(),
            exchange_info,
            cipher,
            pool,
        };

        Ok(Self {
            config,
            state,
            prices,
            shutdown_tx,
        })
    }

    pub async fn run(self) -> Result<()> {
        let shutdown_rx = self.shutdown_tx.subscribe();

        // 行情面先起：WS 客户端 + exchangeInfo 缓存
        self.prices.start(shutdown_rx.clone()).await;
        self.state.exchange_info.clone().start(shutdown_rx.clone()).await;

        // SL/TP worker
        let worker = SltpWorker::new(self.state.engine.clone(), self.prices.clone());
        tokio::spawn(worker.run(shutdown_rx.clone()));

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = Router::new()
            .route("/health", get(health))
            .with_state(self.state.clone())
            .merge(facade::admin::router(self.state.clone()))
            .merge(facade::binance::router(self.state.clone()))
            .merge(facade::okx::router(self.state.clone()))
            .merge(facade::bybit::router(self.state.clone()))
            .merge(facade::bitget::router(self.state.clone()))
            .merge(facade::hyperliquid::router(self.state.clone()))
            .layer(cors)
            // 门面 panic 不能带崩整个进程
            .layer(CatchPanicLayer::new());

        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        info!("simulator listening at http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("failed to listen for shutdown signal: {}", e);
                }
                info!("shutdown signal received");
            })
            .await
            .context("http server error")?;

        // 广播关闭，等 WS 客户端收尾
        let _ = self.shutdown_tx.send(true);
        self.prices.close_all().await;
        info!("simulator stopped");
        Ok(())
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "commit": option_env!("GIT_COMMIT").unwrap_or("unknown"),
        "build_time": option_env!("BUILD_TIME").unwrap_or("unknown"),
        "time": get_timestamp_secs(),
        "exchanges": state.prices.exchange_status(),
    }))
}
