//! API secret 落库加密
//!
//! 密钥为进程级 32 字节 AES-256-GCM key，缺失时启动即失败。
//! 密文格式: base64(nonce || ciphertext)，nonce 12 字节随机。

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, bail, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

const NONCE_LEN: usize = 12;

pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn new(aes_key: &str) -> Result<Self> {
        if aes_key.len() != 32 {
            bail!("AES key must be exactly 32 bytes, got {}", aes_key.len());
        }
        let key = Key::<Aes256Gcm>::from_slice(aes_key.as_bytes());
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("encrypt failed: {}", e))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let raw = BASE64.decode(encoded)?;
        if raw.len() <= NONCE_LEN {
            bail!("ciphertext too short");
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| anyhow!("decrypt failed: {}", e))?;
        Ok(String::from_utf8(plaintext)?)
    }
}

/// 日志里只保留 key 前 8 位
pub fn mask_key(key: &str) -> String {
    if key.len() <= 8 {
        return "***".to_string();
    }
    format!("{}***", &key[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let cipher = SecretCipher::new(KEY).unwrap();
        let secret = "Jk8s0dPq3mNvXwYzAbCdEfGhIjKlMnOpQrStUvWxYz012345";
        let encrypted = cipher.encrypt(secret).unwrap();
        assert_ne!(encrypted, secret);
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), secret);
    }

    #[test]
    fn test_nonce_makes_ciphertext_unique() {
        let cipher = SecretCipher::new(KEY).unwrap();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let cipher = SecretCipher::new(KEY).unwrap();
        let mut raw = BASE64.decode(cipher.encrypt("secret").unwrap()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(cipher.decrypt(&BASE64.encode(raw)).is_err());
    }

    #[test]
    fn test_bad_key_length() {
        assert!(SecretCipher::new("short").is_err());
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("abcdefghijklmnop"), "abcdefgh***");
        assert_eq!(mask_key("short"), "***");
    }
}
