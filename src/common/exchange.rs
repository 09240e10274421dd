use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// 支持的交易所
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Okx,
    Bybit,
    Bitget,
    Hyperliquid,
}

impl Exchange {
    pub const ALL: [Exchange; 5] = [
        Exchange::Binance,
        Exchange::Okx,
        Exchange::Bybit,
        Exchange::Bitget,
        Exchange::Hyperliquid,
    ];

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "binance" => Some(Exchange::Binance),
            "okx" => Some(Exchange::Okx),
            "bybit" => Some(Exchange::Bybit),
            "bitget" => Some(Exchange::Bitget),
            "hyperliquid" => Some(Exchange::Hyperliquid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Okx => "okx",
            Exchange::Bybit => "bybit",
            Exchange::Bitget => "bitget",
            Exchange::Hyperliquid => "hyperliquid",
        }
    }
}

impl Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for ex in Exchange::ALL {
            assert_eq!(Exchange::from_str(ex.as_str()), Some(ex));
        }
        assert_eq!(Exchange::from_str("gate"), None);
    }
}
