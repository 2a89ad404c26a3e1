// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 错误模块
//!
//! 生命周期内所有面向客户端的错误都表示为 [`HttpError`]：
//! - 携带状态码、消息、可选的附加数据与额外响应头；
//! - 校验失败额外携带 `validation: {source, keys}`；
//! - 由非框架代码抛出的未知错误统一归类为 500 实现错误（developer error），
//!   详细信息只写入服务端日志，客户端只看到通用消息。

use std::{error::Error, fmt};

use serde_derive::Serialize;
use serde_json::{json, Value};

use crate::{exception::Exception, header::Headers, param::status_text};

/// 用户代码返回的通用错误类型
pub type BoxError = Box<dyn Error + Send + Sync>;

/// 500 响应对客户端隐藏真实原因时使用的消息
pub const CENSORED_MESSAGE: &str = "An internal server error occurred";

/// 校验失败的来源及出错字段
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationDetail {
    pub source: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HttpError {
    status: u16,
    message: String,
    data: Option<Value>,
    headers: Headers,
    validation: Option<ValidationDetail>,
    developer: bool,
    missing: bool,
    cause: Option<String>,
}

impl HttpError {
    /// 构造任意 4xx/5xx 错误，非错误状态码按实现错误处理
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status < 400 {
            return Self::bad_implementation(format!(
                "Invalid error status code {}: {}",
                status, message
            ));
        }
        Self {
            status,
            message,
            data: None,
            headers: Headers::new(),
            validation: None,
            developer: false,
            missing: false,
            cause: None,
        }
    }

    fn titled(status: u16, message: Option<&str>) -> Self {
        Self::new(status, message.unwrap_or(status_text(status)))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, message)
    }

    /// 请求完全没有携带凭证，`scheme` 写入 `WWW-Authenticate`
    pub fn missing_credentials(scheme: &str) -> Self {
        let mut err = Self::titled(401, None);
        err.missing = true;
        err.headers.insert("WWW-Authenticate", scheme.to_string());
        err
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(403, message)
    }

    pub fn not_found() -> Self {
        Self::titled(404, None)
    }

    pub fn client_timeout() -> Self {
        Self::titled(408, None)
    }

    pub fn length_required() -> Self {
        Self::titled(411, None)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(413, message)
    }

    pub fn unsupported_media_type(message: impl Into<String>) -> Self {
        Self::new(415, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    /// 框架检测到的实现错误（处理函数抛出未知错误、未返回值、超时等）
    pub fn bad_implementation(message: impl Into<String>) -> Self {
        let mut err = Self::new(500, message);
        err.developer = true;
        err
    }

    pub fn server_unavailable() -> Self {
        Self::titled(503, None)
    }

    /// 将用户代码返回的任意错误归类：已知的 `HttpError` 原样保留，其余包装为实现错误
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<HttpError>() {
            Ok(known) => *known,
            Err(other) => match other.downcast::<Exception>() {
                Ok(exception) => {
                    Self::bad_implementation("Framework error").with_cause(exception.to_string())
                }
                Err(foreign) => Self::bad_implementation("Unhandled error").with_cause(foreign.to_string()),
            },
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn with_validation(mut self, source: &str, keys: Vec<String>) -> Self {
        self.validation = Some(ValidationDetail {
            source: source.to_string(),
            keys,
        });
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// 允许 onPreResponse 扩展改写（例如屏蔽）错误消息
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn validation(&self) -> Option<&ValidationDetail> {
        self.validation.as_ref()
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    pub fn is_server(&self) -> bool {
        self.status >= 500
    }

    pub fn is_developer_error(&self) -> bool {
        self.developer
    }

    pub fn is_missing(&self) -> bool {
        self.missing
    }

    /// 发送给客户端的 JSON 载荷
    pub fn output_payload(&self) -> Value {
        let message = if self.status == 500 {
            CENSORED_MESSAGE.to_string()
        } else {
            self.message.clone()
        };
        let mut payload = json!({
            "statusCode": self.status,
            "error": status_text(self.status),
            "message": message,
        });
        if let Some(validation) = &self.validation {
            payload["validation"] = json!(validation);
        }
        payload
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{} ({}): {}", self.message, self.status, cause),
            None => write!(f, "{} ({})", self.message, self.status),
        }
    }
}

impl Error for HttpError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_payload() {
        let err = HttpError::bad_request("Invalid query input").with_validation("query", vec!["a".into()]);
        let payload = err.output_payload();
        assert_eq!(payload["statusCode"], 400);
        assert_eq!(payload["error"], "Bad Request");
        assert_eq!(payload["message"], "Invalid query input");
        assert_eq!(payload["validation"]["source"], "query");
        assert_eq!(payload["validation"]["keys"][0], "a");
    }

    #[test]
    fn test_internal_message_is_censored() {
        let err = HttpError::bad_implementation("database password is hunter2");
        assert!(err.is_developer_error());
        assert_eq!(err.output_payload()["message"], CENSORED_MESSAGE);
    }

    #[test]
    fn test_from_boxed_keeps_known_errors() {
        let boxed: BoxError = Box::new(HttpError::forbidden("nope"));
        let err = HttpError::from_boxed(boxed);
        assert_eq!(err.status(), 403);
        assert!(!err.is_developer_error());
    }

    #[test]
    fn test_from_boxed_wraps_foreign_errors() {
        let boxed: BoxError = "parse failure".into();
        let err = HttpError::from_boxed(boxed);
        assert_eq!(err.status(), 500);
        assert!(err.is_developer_error());
        assert_eq!(err.cause(), Some("parse failure"));
    }

    #[test]
    fn test_non_error_status_is_rejected() {
        let err = HttpError::new(200, "fine");
        assert_eq!(err.status(), 500);
        assert!(err.is_developer_error());
    }

    #[test]
    fn test_missing_credentials() {
        let err = HttpError::missing_credentials("Basic");
        assert!(err.is_missing());
        assert_eq!(err.headers().get("www-authenticate"), Some("Basic"));
    }
}
