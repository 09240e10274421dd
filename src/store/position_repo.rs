//! 仓位表访问
//!
//! 引擎的开平仓都在事务内先 `FOR UPDATE` 锁住目标仓位行，
//! 防止同账户并发请求重复占用保证金。

use sqlx::PgExecutor;

use crate::store::models::{MarginMode, Position, PositionSide};

pub struct NewPosition<'a> {
    pub account_id: i64,
    pub symbol: &'a str,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: i32,
    pub margin_mode: MarginMode,
    pub margin: f64,
    pub liquidation_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

pub async fn create(db: impl PgExecutor<'_>, new: NewPosition<'_>) -> sqlx::Result<Position> {
    sqlx::query_as::<_, Position>(
        r#"
        INSERT INTO positions (
            account_id, symbol, side, quantity, entry_price, mark_price, leverage,
            margin_mode, margin, liquidation_price, stop_loss, take_profit
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        RETURNING *
        "#,
    )
    .bind(new.account_id)
    .bind(new.symbol)
    .bind(new.side)
    .bind(new.quantity)
    .bind(new.entry_price)
    .bind(new.mark_price)
    .bind(new.leverage)
    .bind(new.margin_mode)
    .bind(new.margin)
    .bind(new.liquidation_price)
    .bind(new.stop_loss)
    .bind(new.take_profit)
    .fetch_one(db)
    .await
}

pub async fn get_by_account_symbol_side(
    db: impl PgExecutor<'_>,
    account_id: i64,
    symbol: &str,
    side: PositionSide,
) -> sqlx::Result<Option<Position>> {
    sqlx::query_as::<_, Position>(
        r#"
        SELECT * FROM positions
        WHERE account_id = $1 AND symbol = $2 AND side = $3 AND deleted_at IS NULL
        "#,
    )
    .bind(account_id)
    .bind(symbol)
    .bind(side)
    .fetch_optional(db)
    .await
}

/// 行级排他锁变体，事务内使用
pub async fn get_by_account_symbol_side_for_update(
    db: impl PgExecutor<'_>,
    account_id: i64,
    symbol: &str,
    side: PositionSide,
) -> sqlx::Result<Option<Position>> {
    sqlx::query_as::<_, Position>(
        r#"
        SELECT * FROM positions
        WHERE account_id = $1 AND symbol = $2 AND side = $3 AND deleted_at IS NULL
        FOR UPDATE
        "#,
    )
    .bind(account_id)
    .bind(symbol)
    .bind(side)
    .fetch_optional(db)
    .await
}

pub async fn list_by_account(
    db: impl PgExecutor<'_>,
    account_id: i64,
) -> sqlx::Result<Vec<Position>> {
    sqlx::query_as::<_, Position>(
        "SELECT * FROM positions WHERE account_id = $1 AND deleted_at IS NULL ORDER BY id",
    )
    .bind(account_id)
    .fetch_all(db)
    .await
}

/// 加仓后的数量/均价/保证金/强平价一次写入
pub async fn update_amounts(
    db: impl PgExecutor<'_>,
    id: i64,
    quantity: f64,
    entry_price: f64,
    margin: f64,
    leverage: i32,
    liquidation_price: f64,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE positions
        SET quantity = $2, entry_price = $3, margin = $4, leverage = $5,
            liquidation_price = $6, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(quantity)
    .bind(entry_price)
    .bind(margin)
    .bind(leverage)
    .bind(liquidation_price)
    .execute(db)
    .await?;
    Ok(())
}

/// 部分平仓：数量和保证金同步扣减，SL/TP 保留
pub async fn reduce(
    db: impl PgExecutor<'_>,
    id: i64,
    close_qty: f64,
    returned_margin: f64,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE positions
        SET quantity = quantity - $2, margin = margin - $3, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(close_qty)
    .bind(returned_margin)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn set_stop_loss(db: impl PgExecutor<'_>, id: i64, stop_loss: f64) -> sqlx::Result<()> {
    sqlx::query("UPDATE positions SET stop_loss = $2, updated_at = now() WHERE id = $1")
        .bind(id)
        .bind(stop_loss)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn set_take_profit(
    db: impl PgExecutor<'_>,
    id: i64,
    take_profit: f64,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE positions SET take_profit = $2, updated_at = now() WHERE id = $1")
        .bind(id)
        .bind(take_profit)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn update_mark(
    db: impl PgExecutor<'_>,
    id: i64,
    mark_price: f64,
    unrealized_pnl: f64,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE positions SET mark_price = $2, unrealized_pnl = $3, updated_at = now() WHERE id = $1",
    )
    .bind(id)
    .bind(mark_price)
    .bind(unrealized_pnl)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn soft_delete(db: impl PgExecutor<'_>, id: i64) -> sqlx::Result<()> {
    sqlx::query("UPDATE positions SET deleted_at = now() WHERE id = $1")
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}
