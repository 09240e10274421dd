//! 按交易所风格生成模拟 API key
//!
//! 每个交易所的 key 形态不同，机器人侧的 SDK 往往会做格式校验，
//! 所以这里逐一模仿真实形态。

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::distributions::Slice;
use rand::{Rng, RngCore};
use uuid::Uuid;

use crate::common::exchange::Exchange;

const ALPHA_NUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const UPPER_ALPHA_NUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const LOWER_ALPHA_NUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// 生成的一组凭证
#[derive(Debug, Clone)]
pub struct ApiKeySet {
    pub api_key: String,
    pub api_secret: String,
    /// 仅 OKX（以及可选的 Bitget）使用
    pub passphrase: Option<String>,
}

/// 按交易所生成 key/secret/passphrase
pub fn generate_api_key(exchange: Exchange) -> ApiKeySet {
    match exchange {
        // key/secret 都是 64 位字母数字
        Exchange::Binance => ApiKeySet {
            api_key: random_string(64, ALPHA_NUMERIC),
            api_secret: random_string(64, ALPHA_NUMERIC),
            passphrase: None,
        },
        // key 是 UUID，secret 是 24 字节 base64，passphrase 16 位
        Exchange::Okx => {
            let mut secret_bytes = [0u8; 24];
            rand::thread_rng().fill_bytes(&mut secret_bytes);
            ApiKeySet {
                api_key: Uuid::new_v4().to_string(),
                api_secret: BASE64.encode(secret_bytes),
                passphrase: Some(random_string(16, ALPHA_NUMERIC)),
            }
        }
        // key 18 位大写字母数字，secret 36 位 hex
        Exchange::Bybit => {
            let mut secret_bytes = [0u8; 18];
            rand::thread_rng().fill_bytes(&mut secret_bytes);
            ApiKeySet {
                api_key: random_string(18, UPPER_ALPHA_NUMERIC),
                api_secret: hex::encode(secret_bytes),
                passphrase: None,
            }
        }
        // key 32 位小写，secret 64 位小写
        Exchange::Bitget => ApiKeySet {
            api_key: random_string(32, LOWER_ALPHA_NUMERIC),
            api_secret: random_string(64, LOWER_ALPHA_NUMERIC),
            passphrase: None,
        },
        // key 是 0x 开头的地址形态，secret 是 64 位 hex 私钥形态
        Exchange::Hyperliquid => {
            let mut addr_bytes = [0u8; 20];
            rand::thread_rng().fill_bytes(&mut addr_bytes);
            let mut secret_bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret_bytes);
            ApiKeySet {
                api_key: format!("0x{}", hex::encode(addr_bytes)),
                api_secret: hex::encode(secret_bytes),
                passphrase: None,
            }
        }
    }
}

fn random_string(length: usize, charset: &[u8]) -> String {
    let dist = Slice::new(charset).expect("charset is non-empty");
    rand::thread_rng()
        .sample_iter(&dist)
        .take(length)
        .map(|b| *b as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binance_shape() {
        let keys = generate_api_key(Exchange::Binance);
        assert_eq!(keys.api_key.len(), 64);
        assert_eq!(keys.api_secret.len(), 64);
        assert!(keys.passphrase.is_none());
        assert!(keys.api_key.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_okx_shape() {
        let keys = generate_api_key(Exchange::Okx);
        assert!(Uuid::parse_str(&keys.api_key).is_ok());
        assert_eq!(keys.passphrase.as_ref().unwrap().len(), 16);
        assert!(BASE64.decode(&keys.api_secret).is_ok());
    }

    #[test]
    fn test_bybit_shape() {
        let keys = generate_api_key(Exchange::Bybit);
        assert_eq!(keys.api_key.len(), 18);
        assert_eq!(keys.api_secret.len(), 36);
        assert!(keys
            .api_key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        assert!(hex::decode(&keys.api_secret).is_ok());
    }

    #[test]
    fn test_bitget_shape() {
        let keys = generate_api_key(Exchange::Bitget);
        assert_eq!(keys.api_key.len(), 32);
        assert_eq!(keys.api_secret.len(), 64);
        assert!(keys
            .api_key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_hyperliquid_shape() {
        let keys = generate_api_key(Exchange::Hyperliquid);
        assert!(keys.api_key.starts_with("0x"));
        assert_eq!(keys.api_key.len(), 42);
        assert_eq!(keys.api_secret.len(), 64);
    }
}
