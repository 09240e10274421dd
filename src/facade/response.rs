//! 原生管理 API 的响应封套
//!
//! `{"code": 0, "message": "success", "data": ...}`，code 0 表示成功；
//! 分页数据包成 `{items, total, page, page_size, total_pages}`。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::json;

pub fn success<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "code": 0,
            "message": "success",
            "data": data,
        })),
    )
        .into_response()
}

pub fn created<T: Serialize>(data: T) -> Response {
    (
        StatusCode::CREATED,
        Json(json!({
            "code": 0,
            "message": "created",
            "data": data,
        })),
    )
        .into_response()
}

pub fn error(status: StatusCode, code: i32, message: &str) -> Response {
    (
        status,
        Json(json!({
            "code": code,
            "message": message,
        })),
    )
        .into_response()
}

pub fn bad_request(message: &str) -> Response {
    error(StatusCode::BAD_REQUEST, -1, message)
}

pub fn not_found(message: &str) -> Response {
    error(StatusCode::NOT_FOUND, -1003, message)
}

pub fn internal_error(message: &str) -> Response {
    error(StatusCode::INTERNAL_SERVER_ERROR, -1, message)
}

pub fn success_paginated<T: Serialize>(items: T, total: i64, page: i64, page_size: i64) -> Response {
    let total_pages = if page_size > 0 {
        (total + page_size - 1) / page_size
    } else {
        0
    };
    success(json!({
        "items": items,
        "total": total,
        "page": page,
        "page_size": page_size,
        "total_pages": total_pages,
    }))
}
