//! 各交易所的请求鉴权
//!
//! 流程统一：从交易所的规范 header 取 public key -> 查账户并校验所属
//! 交易所 -> 解密 secret -> 重建 prehash 并做常数时间 HMAC 比对。
//! 失败一律用该交易所的原生错误码应答。secret 只在这里解密，日志只留
//! key 前 8 位。

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use log::warn;
use serde_json::json;
use sha2::Sha256;

use crate::common::crypto::mask_key;
use crate::common::exchange::Exchange;
use crate::common::time_util::get_timestamp_ms;
use crate::facade::{AppState, AuthedAccount};
use crate::store::account_repo;
use crate::store::models::Account;

type HmacSha256 = Hmac<Sha256>;

/// Binance 风格的时间戳容忍窗口
pub const TIMESTAMP_SKEW_MS: i64 = 300_000;

const MAX_BODY_BYTES: usize = 1 << 20;

// ==================== 纯校验函数 ====================

/// |now - ts| 超窗即拒
pub fn timestamp_within_skew(timestamp_ms: i64, now_ms: i64) -> bool {
    (now_ms - timestamp_ms).abs() <= TIMESTAMP_SKEW_MS
}

fn hmac_sha256(secret: &str, message: &str) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take any size");
    mac.update(message.as_bytes());
    mac
}

/// hex 签名的常数时间比对
fn verify_hex(secret: &str, message: &str, provided_hex: &str) -> bool {
    match hex::decode(provided_hex) {
        Ok(signature) => hmac_sha256(secret, message).verify_slice(&signature).is_ok(),
        Err(_) => false,
    }
}

/// base64 签名的常数时间比对
fn verify_base64(secret: &str, message: &str, provided_b64: &str) -> bool {
    match BASE64.decode(provided_b64) {
        Ok(signature) => hmac_sha256(secret, message).verify_slice(&signature).is_ok(),
        Err(_) => false,
    }
}

/// 去掉参数串里的 signature 项，返回 (过滤后的串, 提供的签名)
fn strip_signature(raw: &str) -> (String, Option<String>) {
    let mut filtered = Vec::new();
    let mut signature = None;
    for part in raw.split('&') {
        if part.is_empty() {
            continue;
        }
        if let Some(value) = part.strip_prefix("signature=") {
            signature = Some(value.to_string());
        } else {
            filtered.push(part);
        }
    }
    (filtered.join("&"), signature)
}

/// Binance: HMAC-SHA256(body_without_sig + "&" + query_without_sig)，小写 hex。
/// 任意一侧为空时不拼 '&'。
pub fn verify_binance_signature(raw_query: &str, raw_body: &str, secret: &str) -> bool {
    let (query_filtered, query_sig) = strip_signature(raw_query);
    let (body_filtered, body_sig) = strip_signature(raw_body);

    let Some(provided) = query_sig.or(body_sig) else {
        return false;
    };

    let sign_string = if !body_filtered.is_empty() && !query_filtered.is_empty() {
        format!("{}&{}", body_filtered, query_filtered)
    } else if !body_filtered.is_empty() {
        body_filtered
    } else {
        query_filtered
    };

    verify_hex(secret, &sign_string, &provided)
}

/// 测试和工具用：Binance 方式签一个参数串
pub fn binance_sign(sign_string: &str, secret: &str) -> String {
    hex::encode(hmac_sha256(secret, sign_string).finalize().into_bytes())
}

/// OKX / Bitget: prehash = timestamp + method + (path[?query]) + body
pub fn passphrase_prehash(timestamp: &str, method: &str, path: &str, query: &str, body: &str) -> String {
    if query.is_empty() {
        format!("{}{}{}{}", timestamp, method, path, body)
    } else {
        format!("{}{}{}?{}{}", timestamp, method, path, query, body)
    }
}

/// OKX: base64(HMAC-SHA256(prehash))
pub fn verify_okx_signature(
    secret: &str,
    timestamp: &str,
    method: &str,
    path: &str,
    query: &str,
    body: &str,
    provided: &str,
) -> bool {
    let prehash = passphrase_prehash(timestamp, method, path, query, body);
    verify_base64(secret, &prehash, provided)
}

/// 测试和工具用：OKX 方式签名
pub fn okx_sign(secret: &str, timestamp: &str, method: &str, path: &str, query: &str, body: &str) -> String {
    let prehash = passphrase_prehash(timestamp, method, path, query, body);
    BASE64.encode(hmac_sha256(secret, &prehash).finalize().into_bytes())
}

/// Bybit: prehash = timestamp + apiKey + recvWindow + (GET→query, 其他→body)，小写 hex
pub fn verify_bybit_signature(
    secret: &str,
    timestamp: &str,
    api_key: &str,
    recv_window: &str,
    param_str: &str,
    provided: &str,
) -> bool {
    let prehash = format!("{}{}{}{}", timestamp, api_key, recv_window, param_str);
    verify_hex(secret, &prehash, provided)
}

/// Bitget: 同 OKX 的 prehash，base64 编码
pub fn verify_bitget_signature(
    secret: &str,
    timestamp: &str,
    method: &str,
    path: &str,
    query: &str,
    body: &str,
    provided: &str,
) -> bool {
    let prehash = passphrase_prehash(timestamp, method, path, query, body);
    verify_base64(secret, &prehash, provided)
}

// ==================== axum 中间件 ====================

fn header<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

async fn lookup_account(
    state: &AppState,
    api_key: &str,
    venue: Exchange,
) -> Result<(Account, String), ()> {
    let account = account_repo::get_by_api_key(&state.pool, api_key)
        .await
        .ok()
        .flatten()
        .ok_or(())?;
    if account.exchange_type != venue {
        return Err(());
    }
    let secret = state
        .cipher
        .decrypt(&account.api_secret_encrypted)
        .map_err(|_| ())?;
    Ok((account, secret))
}

/// 读出整个 body 再还回去，签名校验需要原文
async fn buffer_body(req: Request) -> Result<(axum::http::request::Parts, String), Response> {
    let (parts, body) = req.into_parts();
    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| StatusCode::PAYLOAD_TOO_LARGE.into_response())?;
    let text = String::from_utf8_lossy(&bytes).to_string();
    Ok((parts, text))
}

pub async fn binance_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let invalid_key = || {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"code": -2015, "msg": "Invalid API-key, IP, or permissions for action."})),
        )
            .into_response()
    };

    let Some(api_key) = header(&req, "X-MBX-APIKEY").map(str::to_string) else {
        return invalid_key();
    };
    let Ok((account, secret)) = lookup_account(&state, &api_key, Exchange::Binance).await else {
        return invalid_key();
    };

    let method = req.method().clone();
    let raw_query = req.uri().query().unwrap_or("").to_string();
    let (parts, body_text) = match buffer_body(req).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // GET 且不带签名的行情类请求放行，其余必须验签
    if method != axum::http::Method::GET || raw_query.contains("signature=") {
        if !verify_binance_signature(&raw_query, &body_text, &secret) {
            warn!(
                "[binance] signature verification failed: method={} path={} key={}",
                method,
                parts.uri.path(),
                mask_key(&api_key)
            );
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"code": -1022, "msg": "Signature for this request is not valid."})),
            )
                .into_response();
        }
    }

    // 时间戳窗口 ±300s
    let params = crate::facade::parse_params(&raw_query);
    if let Some(ts) = params.get("timestamp") {
        let valid = ts
            .parse::<i64>()
            .map(|ts| timestamp_within_skew(ts, get_timestamp_ms()))
            .unwrap_or(false);
        if !valid {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "code": -1021,
                    "msg": "Timestamp for this request was 1000ms ahead of the server's time."
                })),
            )
                .into_response();
        }
    }

    let mut req = Request::from_parts(parts, Body::from(body_text));
    req.extensions_mut().insert(AuthedAccount(account));
    next.run(req).await
}

pub async fn okx_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let unauthorized = |msg: &str, code: &str| {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"code": code, "msg": msg, "data": []})),
        )
            .into_response()
    };

    let api_key = header(&req, "OK-ACCESS-KEY").map(str::to_string);
    let timestamp = header(&req, "OK-ACCESS-TIMESTAMP").map(str::to_string);
    let sign = header(&req, "OK-ACCESS-SIGN").map(str::to_string);
    let passphrase = header(&req, "OK-ACCESS-PASSPHRASE").map(str::to_string);

    let (Some(api_key), Some(timestamp), Some(sign), Some(passphrase)) =
        (api_key, timestamp, sign, passphrase)
    else {
        return unauthorized("Invalid credentials.", "50111");
    };

    let Ok((account, secret)) = lookup_account(&state, &api_key, Exchange::Okx).await else {
        return unauthorized("Invalid API Key.", "50111");
    };

    let stored_passphrase = account
        .passphrase_encrypted
        .as_deref()
        .and_then(|enc| state.cipher.decrypt(enc).ok());
    if stored_passphrase.as_deref() != Some(passphrase.as_str()) {
        return unauthorized("Invalid passphrase.", "50113");
    }

    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let (parts, body_text) = match buffer_body(req).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let body_for_sign = if method == "POST" || method == "PUT" {
        body_text.as_str()
    } else {
        ""
    };
    if !verify_okx_signature(&secret, &timestamp, &method, &path, &query, body_for_sign, &sign) {
        warn!(
            "[okx] signature verification failed: path={} key={}",
            path,
            mask_key(&api_key)
        );
        return unauthorized("Invalid signature.", "50113");
    }

    let mut req = Request::from_parts(parts, Body::from(body_text));
    req.extensions_mut().insert(AuthedAccount(account));
    next.run(req).await
}

pub async fn bybit_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let unauthorized = |code: i64, msg: &str| {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"retCode": code, "retMsg": msg})),
        )
            .into_response()
    };

    let api_key = header(&req, "X-BAPI-API-KEY").map(str::to_string);
    let timestamp = header(&req, "X-BAPI-TIMESTAMP").map(str::to_string);
    let sign = header(&req, "X-BAPI-SIGN").map(str::to_string);
    let recv_window = header(&req, "X-BAPI-RECV-WINDOW").unwrap_or("").to_string();

    let (Some(api_key), Some(timestamp), Some(sign)) = (api_key, timestamp, sign) else {
        return unauthorized(10003, "Invalid apiKey.");
    };

    let Ok((account, secret)) = lookup_account(&state, &api_key, Exchange::Bybit).await else {
        return unauthorized(10003, "Invalid apiKey.");
    };

    let method = req.method().clone();
    let query = req.uri().query().unwrap_or("").to_string();
    let (parts, body_text) = match buffer_body(req).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let param_str = if method == axum::http::Method::GET {
        query.as_str()
    } else {
        body_text.as_str()
    };
    if !verify_bybit_signature(&secret, &timestamp, &api_key, &recv_window, param_str, &sign) {
        warn!(
            "[bybit] signature verification failed: path={} key={}",
            parts.uri.path(),
            mask_key(&api_key)
        );
        return unauthorized(10004, "Invalid sign.");
    }

    let mut req = Request::from_parts(parts, Body::from(body_text));
    req.extensions_mut().insert(AuthedAccount(account));
    next.run(req).await
}

pub async fn bitget_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let unauthorized = |code: &str, msg: &str| {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"code": code, "msg": msg, "requestTime": get_timestamp_ms(), "data": null})),
        )
            .into_response()
    };

    let api_key = header(&req, "ACCESS-KEY").map(str::to_string);
    let timestamp = header(&req, "ACCESS-TIMESTAMP").map(str::to_string);
    let sign = header(&req, "ACCESS-SIGN").map(str::to_string);
    let passphrase = header(&req, "ACCESS-PASSPHRASE").map(str::to_string);

    let (Some(api_key), Some(timestamp), Some(sign)) = (api_key, timestamp, sign) else {
        return unauthorized("40001", "Invalid API credentials.");
    };

    let Ok((account, secret)) = lookup_account(&state, &api_key, Exchange::Bitget).await else {
        return unauthorized("40001", "Invalid API Key.");
    };

    // passphrase 可选，带了就校验
    if let (Some(provided), Some(encrypted)) = (&passphrase, &account.passphrase_encrypted) {
        let stored = state.cipher.decrypt(encrypted).ok();
        if stored.as_deref() != Some(provided.as_str()) {
            return unauthorized("40001", "Invalid passphrase.");
        }
    }

    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let (parts, body_text) = match buffer_body(req).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let body_for_sign = if method == "POST" || method == "PUT" {
        body_text.as_str()
    } else {
        ""
    };
    if !verify_bitget_signature(&secret, &timestamp, &method, &path, &query, body_for_sign, &sign) {
        warn!(
            "[bitget] signature verification failed: path={} key={}",
            path,
            mask_key(&api_key)
        );
        return unauthorized("40009", "Invalid signature.");
    }

    let mut req = Request::from_parts(parts, Body::from(body_text));
    req.extensions_mut().insert(AuthedAccount(account));
    next.run(req).await
}

/// Hyperliquid 用钱包签名，模拟环境退化为 key 存在性校验
pub async fn hyperliquid_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let api_key = header(&req, "HL-API-KEY").map(str::to_string).or_else(|| {
        crate::facade::parse_params(req.uri().query().unwrap_or(""))
            .get("apiKey")
            .cloned()
    });

    let Some(api_key) = api_key else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing API key"})),
        )
            .into_response();
    };

    let Ok((account, _secret)) = lookup_account(&state, &api_key, Exchange::Hyperliquid).await
    else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid API key"})),
        )
            .into_response();
    };

    let mut req = req;
    req.extensions_mut().insert(AuthedAccount(account));
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test_secret_for_hmac";

    #[test]
    fn test_binance_signature_round_trip() {
        let query = "symbol=BTCUSDT&side=BUY&type=MARKET&quantity=0.01&timestamp=1700000000000";
        let signature = binance_sign(query, SECRET);
        let signed_query = format!("{}&signature={}", query, signature);

        assert!(verify_binance_signature(&signed_query, "", SECRET));
        // query 任意一位变化都失败
        let tampered = signed_query.replace("0.01", "0.02");
        assert!(!verify_binance_signature(&tampered, "", SECRET));
        // secret 不对也失败
        assert!(!verify_binance_signature(&signed_query, "", "other_secret"));
    }

    #[test]
    fn test_binance_signature_body_plus_query() {
        let body = "symbol=BTCUSDT&side=BUY";
        let query = "timestamp=1700000000000";
        let signature = binance_sign(&format!("{}&{}", body, query), SECRET);
        let signed_body = format!("{}&signature={}", body, signature);
        assert!(verify_binance_signature(query, &signed_body, SECRET));
    }

    #[test]
    fn test_binance_missing_signature_fails() {
        assert!(!verify_binance_signature("a=1", "", SECRET));
    }

    #[test]
    fn test_okx_signature_round_trip() {
        // base64(HMAC_SHA256(secret, T + "POST" + path + body))
        let timestamp = "2024-01-10T08:15:47.000Z";
        let path = "/api/v5/trade/order";
        let body = r#"{"instId":"BTC-USDT-SWAP","tdMode":"cross","side":"buy","ordType":"market","sz":"1"}"#;

        let signature = okx_sign(SECRET, timestamp, "POST", path, "", body);
        assert!(verify_okx_signature(SECRET, timestamp, "POST", path, "", body, &signature));

        // body 的一位变化使签名失效
        let tampered = body.replace("buy", "sell");
        assert!(!verify_okx_signature(SECRET, timestamp, "POST", path, "", &tampered, &signature));
        // 时间戳变化同样失效
        assert!(!verify_okx_signature(SECRET, "2024-01-10T08:15:48.000Z", "POST", path, "", body, &signature));
    }

    #[test]
    fn test_okx_prehash_includes_query() {
        assert_eq!(
            passphrase_prehash("T", "GET", "/api/v5/account/balance", "ccy=USDT", ""),
            "TGET/api/v5/account/balance?ccy=USDT"
        );
        assert_eq!(
            passphrase_prehash("T", "POST", "/api/v5/trade/order", "", "{}"),
            "TPOST/api/v5/trade/order{}"
        );
    }

    #[test]
    fn test_bybit_signature_round_trip() {
        let timestamp = "1700000000000";
        let api_key = "APIKEY123456789012";
        let recv_window = "5000";
        let body = r#"{"category":"linear","symbol":"BTCUSDT","side":"Buy","orderType":"Market","qty":"0.01"}"#;

        let prehash = format!("{}{}{}{}", timestamp, api_key, recv_window, body);
        let signature = binance_sign(&prehash, SECRET); // 同样是 hex(HMAC)
        assert!(verify_bybit_signature(SECRET, timestamp, api_key, recv_window, body, &signature));
        assert!(!verify_bybit_signature(SECRET, timestamp, api_key, "6000", body, &signature));
    }

    #[test]
    fn test_bitget_signature_round_trip() {
        let timestamp = "1700000000000";
        let path = "/api/v2/mix/order/place-order";
        let body = r#"{"symbol":"BTCUSDT","size":"0.01"}"#;
        let signature = okx_sign(SECRET, timestamp, "POST", path, "", body);
        assert!(verify_bitget_signature(SECRET, timestamp, "POST", path, "", body, &signature));
        assert!(!verify_bitget_signature(SECRET, timestamp, "GET", path, "", body, &signature));
    }

    #[test]
    fn test_timestamp_skew() {
        let now = 1_700_000_600_000;
        assert!(timestamp_within_skew(now - 299_999, now));
        assert!(timestamp_within_skew(now + 299_999, now));
        // 过期 600s 的时间戳被拒
        assert!(!timestamp_within_skew(now - 600_000, now));
        assert!(!timestamp_within_skew(now + 300_001, now));
    }

    #[test]
    fn test_strip_signature() {
        let (filtered, sig) = strip_signature("a=1&signature=abc&b=2");
        assert_eq!(filtered, "a=1&b=2");
        assert_eq!(sig.as_deref(), Some("abc"));

        let (filtered, sig) = strip_signature("");
        assert_eq!(filtered, "");
        assert!(sig.is_none());
    }
}
