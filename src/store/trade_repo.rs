//! 成交表访问，只增不改

use sqlx::PgExecutor;

use crate::store::models::{OrderSide, Trade};

pub struct NewTrade<'a> {
    pub account_id: i64,
    pub order_id: i64,
    pub symbol: &'a str,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub fee: f64,
    pub realized_pnl: f64,
    pub is_maker: bool,
}

pub async fn create(db: impl PgExecutor<'_>, new: NewTrade<'_>) -> sqlx::Result<Trade> {
    sqlx::query_as::<_, Trade>(
        r#"
        INSERT INTO trades (
            account_id, order_id, symbol, side, quantity, price, fee,
            fee_currency, realized_pnl, is_maker
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'USDT', $8, $9)
        RETURNING *
        "#,
    )
    .bind(new.account_id)
    .bind(new.order_id)
    .bind(new.symbol)
    .bind(new.side)
    .bind(new.quantity)
    .bind(new.price)
    .bind(new.fee)
    .bind(new.realized_pnl)
    .bind(new.is_maker)
    .fetch_one(db)
    .await
}

pub async fn list_by_account(
    db: impl PgExecutor<'_>,
    account_id: i64,
    limit: i64,
) -> sqlx::Result<Vec<Trade>> {
    sqlx::query_as::<_, Trade>(
        r#"
        SELECT * FROM trades
        WHERE account_id = $1
        ORDER BY executed_at DESC
        LIMIT $2
        "#,
    )
    .bind(account_id)
    .bind(limit)
    .fetch_all(db)
    .await
}
