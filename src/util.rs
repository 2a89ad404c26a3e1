// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! 通用工具函数：URI 编解码、查询串解析、请求 ID 生成与 HTTP 日期格式化。

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// 百分号解码失败（编码不完整或解码结果不是合法 UTF-8）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError(pub String);

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 严格的百分号解码，与 `+` 无关（仅用于路径）
pub fn decode_uri_component(input: &str) -> Result<String, DecodeError> {
    if !input.contains('%') {
        return Ok(input.to_string());
    }

    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| DecodeError(input.to_string()))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).map_err(|_| DecodeError(input.to_string()))
}

/// 百分号编码，保留 `A-Z a-z 0-9 - . _ ~`
pub fn encode_uri_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        if byte.is_ascii_alphanumeric() || b"-._~".contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// 将 `a=1&b=2&b=3` 解析为 JSON 对象，重复键合并为数组
pub fn parse_query(query: &str) -> Value {
    let mut map = Map::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let value = Value::String(value.into_owned());
        match map.get_mut(key.as_ref()) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(key.into_owned(), value);
            }
        }
    }
    Value::Object(map)
}

/// 生成进程内唯一的请求 ID：`<毫秒时间戳>:<单调计数>:<随机数>`
pub fn generate_request_id() -> String {
    let counter = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}:{}:{:08x}",
        Utc::now().timestamp_millis(),
        counter,
        fastrand::u32(..)
    )
}

/// IMF-fixdate 格式，用于 `Date` 与 cookie 的 `Expires`
pub fn format_http_date(date: &DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
