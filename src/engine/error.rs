use thiserror::Error;

/// 引擎内部错误，门面层逐一映射为各交易所的原生错误码
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("invalid symbol")]
    InvalidSymbol,
    #[error("invalid quantity")]
    InvalidQuantity,
    #[error("invalid leverage")]
    InvalidLeverage,
    #[error("no open position to close")]
    NoOpenPosition,
    #[error("position not found")]
    PositionNotFound,
    #[error("order not found")]
    OrderNotFound,
    #[error("invalid order type")]
    InvalidOrderType,
    #[error("price unavailable")]
    PriceUnavailable,
    #[error("account not found")]
    AccountNotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
