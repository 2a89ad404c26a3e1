// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Cookie 状态编解码
//!
//! 每个 cookie 名可以注册一份 [`StateDefinition`]，控制其编码方式、
//! `Set-Cookie` 属性以及解析失败时的行为。未注册的 cookie 使用默认定义。

use std::{collections::HashMap, time::Duration};

use chrono::{TimeZone, Utc};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde_json::Value;

use crate::{
    exception::Exception,
    http_error::HttpError,
    util::{format_http_date, parse_query},
};

lazy_static! {
    static ref NAME: Regex = Regex::new(r#"^[^\x00-\x20()<>@,;:\\"/\[\]?={}\x7F]+$"#).unwrap();
    static ref VALUE: Regex = Regex::new(r#"^[^\x00-\x20",;\\\x7F]*$"#).unwrap();
    static ref DOMAIN: Regex = Regex::new(r"^\.?[a-zA-Z0-9][a-zA-Z0-9.\-]*$").unwrap();
}

/// cookie 值的编码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateEncoding {
    /// 原样保存字符串
    #[default]
    None,
    /// `a=1&b=2` 形式的对象
    Form,
    /// JSON 序列化后再做 URI 编码
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// 单个 cookie 的定义
#[derive(Debug, Clone)]
pub struct StateDefinition {
    pub ttl: Option<Duration>,
    pub is_secure: bool,
    pub is_http_only: bool,
    pub is_same_site: Option<SameSite>,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub encoding: StateEncoding,
    pub strict_header: bool,
    pub ignore_errors: bool,
    pub clear_invalid: bool,
    /// 请求未携带该 cookie 时自动设置的值
    pub auto_value: Option<Value>,
}

impl Default for StateDefinition {
    fn default() -> Self {
        Self {
            ttl: None,
            is_secure: true,
            is_http_only: true,
            is_same_site: Some(SameSite::Strict),
            path: None,
            domain: None,
            encoding: StateEncoding::None,
            strict_header: true,
            ignore_errors: false,
            clear_invalid: false,
            auto_value: None,
        }
    }
}

/// 待写入响应的 cookie 变更
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Set(String, Value),
    Unset(String),
}

impl StateChange {
    pub fn name(&self) -> &str {
        match self {
            StateChange::Set(name, _) | StateChange::Unset(name) => name,
        }
    }
}

/// 解析 `Cookie` 头得到的结果
#[derive(Debug, Default)]
pub struct ParsedState {
    pub values: HashMap<String, Value>,
    /// 值非法且配置了 `clear_invalid` 的 cookie，需要在响应中清除
    pub invalid: Vec<String>,
}

/// 全部 cookie 定义
#[derive(Debug, Clone, Default)]
pub struct StateRegistry {
    definitions: HashMap<String, StateDefinition>,
    default: StateDefinition,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, definition: StateDefinition) -> Result<(), Exception> {
        if !NAME.is_match(name) {
            return Err(Exception::InvalidOperation(format!("Invalid cookie name: {}", name)));
        }
        if let Some(domain) = &definition.domain {
            if !DOMAIN.is_match(domain) {
                return Err(Exception::InvalidOperation(format!("Invalid cookie domain: {}", domain)));
            }
        }
        if self.definitions.contains_key(name) {
            return Err(Exception::Duplicate {
                kind: "cookie",
                name: name.to_string(),
            });
        }
        self.definitions.insert(name.to_string(), definition);
        Ok(())
    }

    pub fn definition(&self, name: &str) -> &StateDefinition {
        self.definitions.get(name).unwrap_or(&self.default)
    }

    /// 带自动值的 cookie 名称及其值
    pub fn auto_values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.definitions
            .iter()
            .filter_map(|(name, def)| def.auto_value.as_ref().map(|v| (name.as_str(), v)))
    }

    /// 解析 `Cookie` 请求头
    pub fn parse(&self, header: &str) -> Result<ParsedState, HttpError> {
        let mut parsed = ParsedState::default();

        for pair in header.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (name, raw) = match pair.split_once('=') {
                Some((name, raw)) => (name.trim(), raw.trim()),
                None => (pair, ""),
            };
            let definition = self.definition(name);

            let value = match self.decode(name, raw, definition) {
                Ok(value) => value,
                Err(reason) => {
                    if definition.ignore_errors {
                        debug!("忽略非法 cookie {}: {}", name, reason);
                        continue;
                    }
                    if definition.clear_invalid {
                        parsed.invalid.push(name.to_string());
                        continue;
                    }
                    return Err(HttpError::bad_request("Invalid cookie value")
                        .with_data(Value::String(name.to_string())));
                }
            };

            match parsed.values.get_mut(name) {
                Some(Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    parsed.values.insert(name.to_string(), value);
                }
            }
        }

        Ok(parsed)
    }

    fn decode(&self, name: &str, raw: &str, definition: &StateDefinition) -> Result<Value, String> {
        if definition.strict_header {
            if !NAME.is_match(name) {
                return Err("invalid cookie name".to_string());
            }
            let unquoted = unquote(raw);
            if !VALUE.is_match(unquoted) {
                return Err("invalid cookie value".to_string());
            }
        }
        let raw = unquote(raw);

        match definition.encoding {
            StateEncoding::None => Ok(Value::String(raw.to_string())),
            StateEncoding::Form => Ok(parse_query(raw)),
            StateEncoding::Json => {
                let decoded = crate::util::decode_uri_component(raw).map_err(|e| e.0)?;
                serde_json::from_str(&decoded).map_err(|e| e.to_string())
            }
        }
    }

    fn encode(&self, name: &str, value: &Value, definition: &StateDefinition) -> Result<String, HttpError> {
        let encoded = match (definition.encoding, value) {
            (StateEncoding::None, Value::String(s)) => s.clone(),
            (StateEncoding::None, other) => other.to_string(),
            (StateEncoding::Form, Value::Object(map)) => {
                let mut serializer = url::form_urlencoded::Serializer::new(String::new());
                for (k, v) in map {
                    match v {
                        Value::String(s) => serializer.append_pair(k, s),
                        other => serializer.append_pair(k, &other.to_string()),
                    };
                }
                serializer.finish()
            }
            (StateEncoding::Form, _) => {
                return Err(HttpError::bad_implementation(format!(
                    "Invalid form cookie value for {}",
                    name
                )))
            }
            (StateEncoding::Json, value) => crate::util::encode_uri_component(&value.to_string()),
        };

        if definition.strict_header && !VALUE.is_match(&encoded) {
            return Err(HttpError::bad_implementation(format!("Invalid cookie value: {}", encoded)));
        }
        Ok(encoded)
    }

    /// 把 cookie 变更格式化为 `Set-Cookie` 头的值列表
    pub fn format(&self, changes: &[StateChange]) -> Result<Vec<String>, HttpError> {
        let mut lines = Vec::with_capacity(changes.len());
        for change in changes {
            let name = change.name();
            if !NAME.is_match(name) {
                return Err(HttpError::bad_implementation(format!("Invalid cookie name: {}", name)));
            }
            let definition = self.definition(name);

            let mut segments = Vec::new();
            match change {
                StateChange::Set(_, value) => {
                    segments.push(format!("{}={}", name, self.encode(name, value, definition)?));
                    if let Some(ttl) = definition.ttl {
                        let expires = Utc::now() + chrono::Duration::milliseconds(ttl.as_millis() as i64);
                        segments.push(format!("Max-Age={}", ttl.as_secs()));
                        segments.push(format!("Expires={}", format_http_date(&expires)));
                    }
                }
                StateChange::Unset(_) => {
                    let epoch = Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now);
                    segments.push(format!("{}=", name));
                    segments.push("Max-Age=0".to_string());
                    segments.push(format!("Expires={}", format_http_date(&epoch)));
                }
            }

            if definition.is_secure {
                segments.push("Secure".to_string());
            }
            if definition.is_http_only {
                segments.push("HttpOnly".to_string());
            }
            match definition.is_same_site {
                Some(SameSite::Strict) => segments.push("SameSite=Strict".to_string()),
                Some(SameSite::Lax) => segments.push("SameSite=Lax".to_string()),
                Some(SameSite::None) => segments.push("SameSite=None".to_string()),
                None => {}
            }
            if let Some(domain) = &definition.domain {
                segments.push(format!("Domain={}", domain));
            }
            if let Some(path) = &definition.path {
                segments.push(format!("Path={}", path));
            }

            lines.push(segments.join("; "));
        }
        Ok(lines)
    }
}

fn unquote(raw: &str) -> &str {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        &raw[1..raw.len() - 1]
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plain() -> StateDefinition {
        StateDefinition {
            is_secure: false,
            is_http_only: false,
            is_same_site: None,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_plain_and_repeated() {
        let registry = StateRegistry::new();
        let parsed = registry.parse("a=1; b=\"two\"; a=3").unwrap();
        assert_eq!(parsed.values["a"], json!(["1", "3"]));
        assert_eq!(parsed.values["b"], "two");
    }

    #[test]
    fn test_parse_encodings() {
        let mut registry = StateRegistry::new();
        registry
            .add("f", StateDefinition { encoding: StateEncoding::Form, ..plain() })
            .unwrap();
        registry
            .add("j", StateDefinition { encoding: StateEncoding::Json, ..plain() })
            .unwrap();

        let parsed = registry.parse("f=a=1&b=x; j=%7B%22k%22%3A2%7D").unwrap();
        assert_eq!(parsed.values["f"]["a"], "1");
        assert_eq!(parsed.values["j"]["k"], 2);
    }

    #[test]
    fn test_parse_invalid_value() {
        let mut registry = StateRegistry::new();
        let err = registry.parse("a=x\\y").unwrap_err();
        assert_eq!(err.status(), 400);

        registry
            .add("a", StateDefinition { ignore_errors: true, ..plain() })
            .unwrap();
        assert!(registry.parse("a=x\\y").unwrap().values.is_empty());

        registry
            .add("b", StateDefinition { clear_invalid: true, ..plain() })
            .unwrap();
        assert_eq!(registry.parse("b=x\\y").unwrap().invalid, vec!["b".to_string()]);
    }

    #[test]
    fn test_format_attributes() {
        let mut registry = StateRegistry::new();
        registry
            .add(
                "session",
                StateDefinition {
                    ttl: Some(Duration::from_secs(3600)),
                    path: Some("/".to_string()),
                    domain: Some("example.com".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let lines = registry
            .format(&[StateChange::Set("session".into(), json!("abc"))])
            .unwrap();
        let line = &lines[0];
        assert!(line.starts_with("session=abc; Max-Age=3600; Expires="));
        assert!(line.contains("; Secure; HttpOnly; SameSite=Strict; Domain=example.com; Path=/"));
    }

    #[test]
    fn test_format_unset() {
        let registry = StateRegistry::new();
        let lines = registry.format(&[StateChange::Unset("old".into())]).unwrap();
        assert!(lines[0].starts_with("old=; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT"));
    }

    #[test]
    fn test_format_rejects_invalid_value() {
        let registry = StateRegistry::new();
        let err = registry
            .format(&[StateChange::Set("a".into(), json!("has space"))])
            .unwrap_err();
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn test_add_duplicate_and_invalid_name() {
        let mut registry = StateRegistry::new();
        registry.add("a", plain()).unwrap();
        assert!(registry.add("a", plain()).is_err());
        assert!(registry.add("bad name", plain()).is_err());
    }
}
