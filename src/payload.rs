// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求体读取与解析
//!
//! 请求体在路由确定之后才读取，读取上限、允许的内容类型与超时都来自路由设置。
//! `output: stream` 的路由不读取请求体，由处理函数自行消费 [`Body`]。

use std::{
    fmt,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use log::{debug, warn};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::{http_error::HttpError, request::Request, util::parse_query};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadOutput {
    /// 读取完整请求体并按内容类型解析
    #[default]
    Data,
    /// 不读取，交给处理函数
    Stream,
}

/// 路由的请求体设置
#[derive(Debug, Clone)]
pub struct PayloadOptions {
    pub output: PayloadOutput,
    pub parse: bool,
    /// 为空时使用服务器配置
    pub max_bytes: Option<usize>,
    /// 允许的内容类型，为空时不限制
    pub allow: Option<Vec<String>>,
    pub timeout: Option<Duration>,
    /// 请求没有 `Content-Type` 时假定的类型
    pub default_content_type: String,
}

impl Default for PayloadOptions {
    fn default() -> Self {
        Self {
            output: PayloadOutput::Data,
            parse: true,
            max_bytes: None,
            allow: None,
            timeout: None,
            default_content_type: "application/json".to_string(),
        }
    }
}

impl PayloadOptions {
    pub fn stream() -> Self {
        Self {
            output: PayloadOutput::Stream,
            ..Self::default()
        }
    }

    pub fn max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    pub fn allow(mut self, content_type: &str) -> Self {
        self.allow
            .get_or_insert_with(Vec::new)
            .push(content_type.to_ascii_lowercase());
        self
    }

    pub fn parse(mut self, parse: bool) -> Self {
        self.parse = parse;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 尚未读取的请求体
pub struct Body {
    reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
    length: Option<u64>,
}

impl Body {
    pub fn new(reader: impl AsyncRead + Send + Sync + Unpin + 'static, length: Option<u64>) -> Self {
        Self {
            reader: Box::new(reader),
            length,
        }
    }

    /// `Content-Length` 声明的长度
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// 读取剩余全部内容
    pub async fn bytes(mut self) -> io::Result<Bytes> {
        let mut buf = Vec::new();
        self.reader.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

impl AsyncRead for Body {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body").field("length", &self.length).finish()
    }
}

/// 请求的媒体类型（不含参数，小写）
pub fn media_type(request: &Request, default: &str) -> String {
    request
        .headers()
        .get("content-type")
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// 按内容类型解析请求体
pub fn parse(content_type: &str, raw: &[u8]) -> Result<Value, HttpError> {
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    if content_type == "application/json" || content_type.ends_with("+json") {
        return serde_json::from_slice(raw)
            .map_err(|e| HttpError::bad_request("Invalid request payload JSON format").with_cause(e.to_string()));
    }
    if content_type == "application/x-www-form-urlencoded" {
        let text = std::str::from_utf8(raw)
            .map_err(|_| HttpError::bad_request("Invalid request payload encoding"))?;
        return Ok(parse_query(text));
    }
    if content_type.starts_with("text/") {
        let text = String::from_utf8(raw.to_vec())
            .map_err(|_| HttpError::bad_request("Invalid request payload encoding"))?;
        return Ok(Value::String(text));
    }
    if content_type == "application/octet-stream" {
        return Ok(Value::Null);
    }
    Err(HttpError::unsupported_media_type("Unsupported Media Type"))
}

/// 读取并解析请求体，结果写入 `request.raw_payload` 与 `request.payload`
pub(crate) async fn read(
    request: &mut Request,
    options: &PayloadOptions,
    server_max: usize,
    server_timeout: Option<Duration>,
) -> Result<(), HttpError> {
    let id = request.id().to_string();
    let content_type = media_type(request, &options.default_content_type);

    if let Some(allow) = &options.allow {
        if !allow.iter().any(|a| a == &content_type) {
            debug!("[ID{}]不允许的请求体类型：{}", id, content_type);
            return Err(HttpError::unsupported_media_type("Unsupported Media Type"));
        }
    }

    let max = options.max_bytes.unwrap_or(server_max);
    if let Some(length) = request.content_length() {
        if length > max as u64 {
            debug!("[ID{}]请求体长度{}超过上限{}", id, length, max);
            return Err(HttpError::payload_too_large("Payload content length greater than maximum allowed"));
        }
    }

    if options.output == PayloadOutput::Stream {
        return Ok(());
    }

    let Some(body) = request.take_body() else {
        return Ok(());
    };
    let expected = body.length();
    let mut buf = Vec::new();
    let mut limited = body.take(max as u64 + 1);
    let reading = limited.read_to_end(&mut buf);
    let outcome = match options.timeout.or(server_timeout) {
        Some(limit) => match tokio::time::timeout(limit, reading).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("[ID{}]读取请求体超时", id);
                return Err(HttpError::client_timeout());
            }
        },
        None => reading.await,
    };
    if let Err(e) = outcome {
        warn!("[ID{}]读取请求体失败：{}", id, e);
        request.bail();
        return Err(HttpError::bad_request("Bad Request").with_cause(e.to_string()));
    }

    if buf.len() > max {
        return Err(HttpError::payload_too_large("Payload content length greater than maximum allowed"));
    }
    if let Some(expected) = expected {
        if (buf.len() as u64) < expected {
            warn!("[ID{}]请求体不完整：{}/{}字节", id, buf.len(), expected);
            request.bail();
            return Err(HttpError::bad_request("Incomplete payload"));
        }
    }

    request.raw_payload = Bytes::from(buf);
    if options.parse {
        request.payload = parse(&content_type, &request.raw_payload)?;
    }
    debug!("[ID{}]读取请求体{}字节", id, request.raw_payload.len());
    Ok(())
}
