//! 账户表访问

use sqlx::PgExecutor;

use crate::common::exchange::Exchange;
use crate::store::models::{Account, MarginMode};

pub struct NewAccount<'a> {
    pub user_id: i64,
    pub exchange_type: Exchange,
    pub api_key: &'a str,
    pub api_secret_encrypted: &'a str,
    pub passphrase_encrypted: Option<&'a str>,
    pub initial_balance: f64,
    pub margin_mode: MarginMode,
    pub hedge_mode: bool,
    pub default_leverage: i32,
    pub maker_fee_rate: f64,
    pub taker_fee_rate: f64,
}

pub async fn create(db: impl PgExecutor<'_>, new: NewAccount<'_>) -> sqlx::Result<Account> {
    sqlx::query_as::<_, Account>(
        r#"
        INSERT INTO accounts (
            user_id, exchange_type, api_key, api_secret_encrypted, passphrase_encrypted,
            balance_usdt, initial_balance, margin_mode, hedge_mode, default_leverage,
            maker_fee_rate, taker_fee_rate
        )
        VALUES ($1, $2, $3, $4, $5, $6, $6, $7, $8, $9, $10, $11)
        RETURNING *
        "#,
    )
    .bind(new.user_id)
    .bind(new.exchange_type)
    .bind(new.api_key)
    .bind(new.api_secret_encrypted)
    .bind(new.passphrase_encrypted)
    .bind(new.initial_balance)
    .bind(new.margin_mode)
    .bind(new.hedge_mode)
    .bind(new.default_leverage)
    .bind(new.maker_fee_rate)
    .bind(new.taker_fee_rate)
    .fetch_one(db)
    .await
}

pub async fn get_by_id(db: impl PgExecutor<'_>, id: i64) -> sqlx::Result<Option<Account>> {
    sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(id)
    .fetch_optional(db)
    .await
}

/// 行级排他锁，事务内使用
pub async fn get_by_id_for_update(
    db: impl PgExecutor<'_>,
    id: i64,
) -> sqlx::Result<Option<Account>> {
    sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
    )
    .bind(id)
    .fetch_optional(db)
    .await
}

pub async fn get_by_api_key(db: impl PgExecutor<'_>, api_key: &str) -> sqlx::Result<Option<Account>> {
    sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts WHERE api_key = $1 AND deleted_at IS NULL",
    )
    .bind(api_key)
    .fetch_optional(db)
    .await
}

/// 余额加减（delta 可为负）
pub async fn adjust_balance(db: impl PgExecutor<'_>, id: i64, delta: f64) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE accounts SET balance_usdt = balance_usdt + $2, updated_at = now() WHERE id = $1",
    )
    .bind(id)
    .bind(delta)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn update_keys(
    db: impl PgExecutor<'_>,
    id: i64,
    api_key: &str,
    api_secret_encrypted: &str,
    passphrase_encrypted: Option<&str>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE accounts
        SET api_key = $2, api_secret_encrypted = $3, passphrase_encrypted = $4, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(api_key)
    .bind(api_secret_encrypted)
    .bind(passphrase_encrypted)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn soft_delete(db: impl PgExecutor<'_>, id: i64) -> sqlx::Result<()> {
    sqlx::query("UPDATE accounts SET deleted_at = now() WHERE id = $1")
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

/// 按用户名取用户 id，不存在则创建
pub async fn ensure_user(db: impl PgExecutor<'_>, username: &str) -> sqlx::Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO users (username)
        VALUES ($1)
        ON CONFLICT (username) DO UPDATE SET updated_at = now()
        RETURNING id
        "#,
    )
    .bind(username)
    .fetch_one(db)
    .await?;
    Ok(id)
}
