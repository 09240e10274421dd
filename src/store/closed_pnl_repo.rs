//! 平仓结算记录，只增不改

use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use crate::store::models::{CloseReason, ClosedPnlRecord, PositionSide};

pub struct NewClosedPnl<'a> {
    pub account_id: i64,
    pub symbol: &'a str,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub total_fee: f64,
    pub leverage: i32,
    pub closed_reason: CloseReason,
    pub opened_at: DateTime<Utc>,
}

pub async fn create(db: impl PgExecutor<'_>, new: NewClosedPnl<'_>) -> sqlx::Result<ClosedPnlRecord> {
    sqlx::query_as::<_, ClosedPnlRecord>(
        r#"
        INSERT INTO closed_pnl_records (
            account_id, symbol, side, quantity, entry_price, exit_price,
            realized_pnl, total_fee, leverage, closed_reason, opened_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING *
        "#,
    )
    .bind(new.account_id)
    .bind(new.symbol)
    .bind(new.side)
    .bind(new.quantity)
    .bind(new.entry_price)
    .bind(new.exit_price)
    .bind(new.realized_pnl)
    .bind(new.total_fee)
    .bind(new.leverage)
    .bind(new.closed_reason)
    .bind(new.opened_at)
    .fetch_one(db)
    .await
}

/// 分页查询，返回 (记录, 总条数)
pub async fn list_paginated(
    db: impl PgExecutor<'_> + Copy,
    account_id: i64,
    page: i64,
    page_size: i64,
) -> sqlx::Result<(Vec<ClosedPnlRecord>, i64)> {
    let page = page.max(1);
    let page_size = page_size.clamp(1, 200);

    let (total,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM closed_pnl_records WHERE account_id = $1")
            .bind(account_id)
            .fetch_one(db)
            .await?;

    let records = sqlx::query_as::<_, ClosedPnlRecord>(
        r#"
        SELECT * FROM closed_pnl_records
        WHERE account_id = $1
        ORDER BY closed_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(account_id)
    .bind(page_size)
    .bind((page - 1) * page_size)
    .fetch_all(db)
    .await?;

    Ok((records, total))
}
