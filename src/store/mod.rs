pub mod account_repo;
pub mod closed_pnl_repo;
pub mod models;
pub mod order_repo;
pub mod position_repo;
pub mod trade_repo;

use anyhow::{Context, Result};
use log::info;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::cfg::DatabaseCfg;

/// 建立连接池并执行迁移
pub async fn connect(cfg: &DatabaseCfg) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&cfg.connection_url())
        .await
        .with_context(|| format!("failed to connect postgres at {}:{}", cfg.host, cfg.port))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("migration failed")?;

    info!(
        "postgres connected host={} port={} db={}",
        cfg.host, cfg.port, cfg.dbname
    );
    Ok(pool)
}
