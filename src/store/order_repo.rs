//! 订单表访问

use sqlx::PgExecutor;

use crate::store::models::{Order, OrderSide, OrderStatus, OrderType, PositionSide};

/// 条件单类型集合，SQL 里直接用字面量
const CONDITIONAL_TYPES: &str = "('STOP_LOSS', 'TAKE_PROFIT', 'STOP_MARKET', 'TRAILING_STOP_MARKET')";

pub struct NewOrder<'a> {
    pub account_id: i64,
    pub client_order_id: &'a str,
    pub symbol: &'a str,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: f64,
    pub stop_price: f64,
    pub status: OrderStatus,
    pub reduce_only: bool,
    pub close_position: bool,
}

pub async fn create(db: impl PgExecutor<'_>, new: NewOrder<'_>) -> sqlx::Result<Order> {
    sqlx::query_as::<_, Order>(
        r#"
        INSERT INTO orders (
            account_id, client_order_id, symbol, side, position_side, order_type,
            quantity, price, stop_price, status, reduce_only, close_position
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        RETURNING *
        "#,
    )
    .bind(new.account_id)
    .bind(new.client_order_id)
    .bind(new.symbol)
    .bind(new.side)
    .bind(new.position_side)
    .bind(new.order_type)
    .bind(new.quantity)
    .bind(new.price)
    .bind(new.stop_price)
    .bind(new.status)
    .bind(new.reduce_only)
    .bind(new.close_position)
    .fetch_one(db)
    .await
}

pub async fn get_by_id(db: impl PgExecutor<'_>, id: i64) -> sqlx::Result<Option<Order>> {
    sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1 AND deleted_at IS NULL")
        .bind(id)
        .fetch_optional(db)
        .await
}

/// 行级排他锁，worker 触发执行时用来保证至多一次
pub async fn get_by_id_for_update(db: impl PgExecutor<'_>, id: i64) -> sqlx::Result<Option<Order>> {
    sqlx::query_as::<_, Order>(
        "SELECT * FROM orders WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
    )
    .bind(id)
    .fetch_optional(db)
    .await
}

/// 待撮合的普通挂单（不含条件单）
pub async fn list_open(
    db: impl PgExecutor<'_>,
    account_id: i64,
    symbol: Option<&str>,
) -> sqlx::Result<Vec<Order>> {
    let sql = format!(
        r#"
        SELECT * FROM orders
        WHERE account_id = $1 AND status IN ('NEW', 'PARTIALLY_FILLED')
          AND order_type NOT IN {}
          AND deleted_at IS NULL
          AND ($2::text IS NULL OR symbol = $2)
        ORDER BY id
        "#,
        CONDITIONAL_TYPES
    );
    sqlx::query_as::<_, Order>(&sql)
        .bind(account_id)
        .bind(symbol)
        .fetch_all(db)
        .await
}

/// 待触发的条件单
pub async fn list_open_algo(
    db: impl PgExecutor<'_>,
    account_id: i64,
    symbol: Option<&str>,
) -> sqlx::Result<Vec<Order>> {
    let sql = format!(
        r#"
        SELECT * FROM orders
        WHERE account_id = $1 AND status = 'NEW'
          AND order_type IN {}
          AND deleted_at IS NULL
          AND ($2::text IS NULL OR symbol = $2)
        ORDER BY id
        "#,
        CONDITIONAL_TYPES
    );
    sqlx::query_as::<_, Order>(&sql)
        .bind(account_id)
        .bind(symbol)
        .fetch_all(db)
        .await
}

/// 全量扫描待触发的 SL/TP，worker 每个 tick 调一次
pub async fn list_pending_stop_orders(db: impl PgExecutor<'_>) -> sqlx::Result<Vec<Order>> {
    sqlx::query_as::<_, Order>(
        r#"
        SELECT * FROM orders
        WHERE status = 'NEW'
          AND order_type IN ('STOP_LOSS', 'TAKE_PROFIT', 'STOP_MARKET')
          AND deleted_at IS NULL
        ORDER BY id
        "#,
    )
    .fetch_all(db)
    .await
}

pub async fn mark_filled(
    db: impl PgExecutor<'_>,
    id: i64,
    filled_qty: f64,
    avg_price: f64,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE orders
        SET status = 'FILLED', filled_qty = $2, avg_price = $3, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(filled_qty)
    .bind(avg_price)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn set_status(db: impl PgExecutor<'_>, id: i64, status: OrderStatus) -> sqlx::Result<()> {
    sqlx::query("UPDATE orders SET status = $2, updated_at = now() WHERE id = $1")
        .bind(id)
        .bind(status)
        .execute(db)
        .await?;
    Ok(())
}

/// 撤销全部未完结订单；algo=true 时只撤条件单，false 只撤普通单
pub async fn cancel_open(
    db: impl PgExecutor<'_>,
    account_id: i64,
    symbol: Option<&str>,
    algo: bool,
) -> sqlx::Result<u64> {
    let clause = if algo { "IN" } else { "NOT IN" };
    let sql = format!(
        r#"
        UPDATE orders
        SET status = 'CANCELED', updated_at = now()
        WHERE account_id = $1 AND status IN ('NEW', 'PARTIALLY_FILLED')
          AND order_type {} {}
          AND deleted_at IS NULL
          AND ($2::text IS NULL OR symbol = $2)
        "#,
        clause, CONDITIONAL_TYPES
    );
    let result = sqlx::query(&sql).bind(account_id).bind(symbol).execute(db).await?;
    Ok(result.rows_affected())
}
