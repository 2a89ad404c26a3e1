// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 响应模块
//!
//! 响应由处理函数或扩展产生，经过两个阶段发出：
//! - [`Response::prepare`]：计算状态码与头部（Content-Type、Content-Length、
//!   Cache-Control、CORS、JSONP、Set-Cookie），可能失败；
//! - [`Response::transmit`]：协商压缩，写出状态行、头部与响应体，只能执行一次。
//!
//! 响应被丢弃时（无论是否发出）执行登记的释放回调，文件流随之关闭。

use std::{
    fmt,
    io,
    path::Path,
    time::Duration,
};

use bytes::Bytes;
use chrono::Utc;
use log::{debug, error, warn};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    compression::{compress, decide_encoding, should_skip_compression},
    exception::Exception,
    header::Headers,
    http_error::HttpError,
    param::{mime_for_extension, status_text, HttpVersion, Method, CRLF, SERVER_NAME},
    request::Request,
    route::Privacy,
    server::Core,
    state::StateChange,
    util::format_http_date,
};

const STREAM_CHUNK: usize = 16 * 1024;

/// 普通响应的内容
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Text(String),
    Bytes(Bytes),
    Json(Value),
}

impl Payload {
    fn is_empty(&self) -> bool {
        match self {
            Payload::Empty => true,
            Payload::Text(s) => s.is_empty(),
            Payload::Bytes(b) => b.is_empty(),
            Payload::Json(v) => v.is_null(),
        }
    }

    fn encode(&self) -> (Bytes, &'static str) {
        match self {
            Payload::Empty => (Bytes::new(), "text/html; charset=utf-8"),
            Payload::Text(s) => (Bytes::from(s.clone()), "text/html; charset=utf-8"),
            Payload::Bytes(b) => (b.clone(), "application/octet-stream"),
            Payload::Json(v) => (Bytes::from(v.to_string()), "application/json; charset=utf-8"),
        }
    }
}

/// 服务端缓存中保存的响应
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEnvelope {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

#[derive(Serialize, Deserialize)]
struct EnvelopeHead {
    status: u16,
    content_type: Option<String>,
}

impl CachedEnvelope {
    /// 编码为 `<JSON 头>\n<响应体>`
    pub fn encode(&self) -> Bytes {
        let head = EnvelopeHead {
            status: self.status,
            content_type: self.content_type.clone(),
        };
        let mut out = serde_json::to_vec(&head).unwrap_or_default();
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        Bytes::from(out)
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        let split = raw.iter().position(|b| *b == b'\n')?;
        let head: EnvelopeHead = serde_json::from_slice(&raw[..split]).ok()?;
        Some(Self {
            status: head.status,
            content_type: head.content_type,
            body: Bytes::copy_from_slice(&raw[split + 1..]),
        })
    }
}

enum Variant {
    Plain(Payload),
    Stream {
        reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
        length: Option<u64>,
    },
    Error(HttpError),
    Redirect {
        location: String,
        permanent: bool,
        rewritable: bool,
    },
    Raw {
        status: u16,
        headers: Headers,
        chunks: Vec<Bytes>,
        head_written: bool,
    },
    Cached(CachedEnvelope),
}

/// 响应所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Created,
    Prepared,
    Transmitted,
}

type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

pub struct Response {
    variant: Variant,
    status: Option<u16>,
    headers: Headers,
    content_type: Option<String>,
    ttl: Option<Duration>,
    states: Vec<StateChange>,
    takeover: bool,
    compressible: bool,
    phase: Phase,
    body: Option<Bytes>,
    release: Vec<ReleaseHook>,
}

impl Response {
    fn with_variant(variant: Variant) -> Self {
        Self {
            variant,
            status: None,
            headers: Headers::new(),
            content_type: None,
            ttl: None,
            states: Vec::new(),
            takeover: false,
            compressible: true,
            phase: Phase::Created,
            body: None,
            release: Vec::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::with_variant(Variant::Plain(Payload::Text(text.into())))
    }

    pub fn json(value: Value) -> Self {
        Self::with_variant(Variant::Plain(Payload::Json(value)))
    }

    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self::with_variant(Variant::Plain(Payload::Bytes(bytes.into())))
    }

    pub fn empty() -> Self {
        Self::with_variant(Variant::Plain(Payload::Empty))
    }

    /// 流式响应，`length` 未知时以 chunked 编码发送
    pub fn stream(reader: impl AsyncRead + Send + Sync + Unpin + 'static, length: Option<u64>) -> Self {
        let mut response = Self::with_variant(Variant::Stream {
            reader: Box::new(reader),
            length,
        });
        response.compressible = false;
        response
    }

    pub fn error(err: HttpError) -> Self {
        Self::with_variant(Variant::Error(err))
    }

    /// 重定向，默认为可改写方法的临时重定向（302）
    pub fn redirect(location: &str) -> Self {
        Self::with_variant(Variant::Redirect {
            location: location.to_string(),
            permanent: false,
            rewritable: true,
        })
    }

    /// 原始模式：处理函数通过 [`write_head`](Self::write_head) 与 [`write`](Self::write) 自行构造响应
    pub fn raw() -> Self {
        let mut response = Self::with_variant(Variant::Raw {
            status: 200,
            headers: Headers::new(),
            chunks: Vec::new(),
            head_written: false,
        });
        response.compressible = false;
        response
    }

    pub fn cached(envelope: CachedEnvelope) -> Self {
        Self::with_variant(Variant::Cached(envelope))
    }

    /// 以流的方式发送文件，MIME 类型由扩展名决定
    pub async fn file(path: impl AsRef<Path>) -> Result<Self, HttpError> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => HttpError::not_found(),
            io::ErrorKind::PermissionDenied => HttpError::forbidden("Forbidden"),
            _ => HttpError::internal("Failed to open file").with_cause(e.to_string()),
        })?;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| HttpError::internal("Failed to read file metadata").with_cause(e.to_string()))?;
        if metadata.is_dir() {
            return Err(HttpError::forbidden("Forbidden"));
        }
        let mime = path
            .extension()
            .and_then(|e| e.to_str())
            .map(mime_for_extension)
            .unwrap_or("application/octet-stream");
        debug!("打开文件{}，大小{}字节，MIME类型{}", path.display(), metadata.len(), mime);

        let mut response = Self::stream(file, Some(metadata.len()));
        response.content_type = Some(mime.to_string());
        response.compressible = !should_skip_compression(mime);
        Ok(response)
    }

    pub fn code(mut self, status: u16) -> Self {
        self.set_code(status);
        self
    }

    pub fn set_code(&mut self, status: u16) {
        self.status = Some(status);
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn state(mut self, name: &str, value: Value) -> Self {
        self.states.retain(|c| c.name() != name);
        self.states.push(StateChange::Set(name.to_string(), value));
        self
    }

    pub fn unstate(mut self, name: &str) -> Self {
        self.states.retain(|c| c.name() != name);
        self.states.push(StateChange::Unset(name.to_string()));
        self
    }

    /// 扩展返回的响应立即结束生命周期
    pub fn takeover(mut self) -> Self {
        self.takeover = true;
        self
    }

    pub fn compressed(mut self, compressible: bool) -> Self {
        self.compressible = compressible;
        self
    }

    /// 响应被丢弃时执行的回调
    pub fn on_release(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.release.push(Box::new(hook));
        self
    }

    fn set_redirect(mut self, perm: Option<bool>, rewrite: Option<bool>) -> Self {
        if let Variant::Redirect {
            permanent,
            rewritable,
            ..
        } = &mut self.variant
        {
            if let Some(p) = perm {
                *permanent = p;
            }
            if let Some(r) = rewrite {
                *rewritable = r;
            }
        }
        self
    }

    pub fn temporary(self) -> Self {
        self.set_redirect(Some(false), None)
    }

    pub fn permanent(self) -> Self {
        self.set_redirect(Some(true), None)
    }

    /// 是否允许客户端把 POST 改写为 GET
    pub fn rewritable(self, rewritable: bool) -> Self {
        self.set_redirect(None, Some(rewritable))
    }

    /// 原始模式下写入状态码与头部
    pub fn write_head(&mut self, code: u16, extra: Headers) -> Result<(), Exception> {
        if self.phase == Phase::Transmitted {
            return Err(Exception::InvalidOperation("Response already transmitted".to_string()));
        }
        match &mut self.variant {
            Variant::Raw {
                status,
                headers,
                head_written,
                ..
            } => {
                if *head_written {
                    return Err(Exception::InvalidOperation("Head already written".to_string()));
                }
                *status = code;
                for (name, value) in extra.iter() {
                    headers.append(name, value);
                }
                *head_written = true;
                Ok(())
            }
            _ => Err(Exception::InvalidOperation("Response is not in raw mode".to_string())),
        }
    }

    /// 原始模式下追加响应体
    pub fn write(&mut self, chunk: impl Into<Bytes>) -> Result<(), Exception> {
        if self.phase == Phase::Transmitted {
            return Err(Exception::InvalidOperation("Response already transmitted".to_string()));
        }
        match &mut self.variant {
            Variant::Raw { chunks, .. } => {
                chunks.push(chunk.into());
                Ok(())
            }
            _ => Err(Exception::InvalidOperation("Response is not in raw mode".to_string())),
        }
    }
}

// --- Getter 访问器实现 ---

impl Response {
    /// 当前（或即将发送的）状态码
    pub fn status_code(&self) -> u16 {
        if let Some(status) = self.status {
            return status;
        }
        match &self.variant {
            Variant::Error(err) => err.status(),
            Variant::Redirect {
                permanent,
                rewritable,
                ..
            } => match (permanent, rewritable) {
                (false, true) => 302,
                (true, true) => 301,
                (false, false) => 307,
                (true, false) => 308,
            },
            Variant::Raw { status, .. } => *status,
            Variant::Cached(envelope) => envelope.status,
            _ => 200,
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn source(&self) -> Option<&Payload> {
        match &self.variant {
            Variant::Plain(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&HttpError> {
        match &self.variant {
            Variant::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn as_error_mut(&mut self) -> Option<&mut HttpError> {
        match &mut self.variant {
            Variant::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.variant, Variant::Error(_))
    }

    pub fn is_takeover(&self) -> bool {
        self.takeover
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// 响应内容对应的值，前置方法的结果以此写入 `request.pre`
    pub fn source_value(&self) -> Value {
        match &self.variant {
            Variant::Plain(Payload::Json(v)) => v.clone(),
            Variant::Plain(Payload::Text(s)) => Value::String(s.clone()),
            Variant::Plain(Payload::Bytes(b)) => Value::String(String::from_utf8_lossy(b).into_owned()),
            _ => Value::Null,
        }
    }

    /// 可缓存时的有效期：只有 2xx 的普通响应可以缓存
    pub fn get_ttl(&self, default: Option<Duration>) -> Option<Duration> {
        let status = self.status_code();
        if !(200..300).contains(&status) {
            return None;
        }
        match self.variant {
            Variant::Plain(_) | Variant::Stream { .. } | Variant::Cached(_) => self.ttl.or(default),
            _ => None,
        }
    }

    /// 转换为服务端缓存条目，只支持普通响应
    pub fn to_envelope(&self) -> Option<CachedEnvelope> {
        let Variant::Plain(payload) = &self.variant else {
            return None;
        };
        let (body, default_type) = payload.encode();
        Some(CachedEnvelope {
            status: self.status_code(),
            content_type: Some(self.content_type.clone().unwrap_or_else(|| default_type.to_string())),
            body,
        })
    }
}

impl Response {
    /// 计算响应头部
    ///
    /// `with_states` 为 false 时不生成 `Set-Cookie`（用于 cookie 编码失败后的重新准备）。
    pub fn prepare(&mut self, request: &Request, core: &Core, with_states: bool) -> Result<(), HttpError> {
        if self.phase == Phase::Transmitted {
            return Err(HttpError::bad_implementation("Cannot prepare a transmitted response"));
        }
        let id = request.id();
        let status = self.status_code();

        let mut body = None;
        match &self.variant {
            Variant::Plain(payload) => {
                let (bytes, default_type) = payload.encode();
                if payload.is_empty() {
                    if self.status.is_none() {
                        self.status = Some(core.config.response.empty_status_code);
                    }
                } else if self.content_type.is_none() {
                    self.content_type = Some(default_type.to_string());
                }
                body = Some(bytes);
            }
            Variant::Error(err) => {
                for (name, value) in err.headers().iter() {
                    self.headers.insert(name, value);
                }
                self.content_type = Some("application/json; charset=utf-8".to_string());
                body = Some(Bytes::from(err.output_payload().to_string()));
            }
            Variant::Redirect { location, .. } => {
                self.headers.insert("Location", location.clone());
                body = Some(Bytes::new());
            }
            Variant::Cached(envelope) => {
                if self.content_type.is_none() {
                    self.content_type = envelope.content_type.clone();
                }
                body = Some(envelope.body.clone());
            }
            Variant::Stream { length, .. } => {
                if self.content_type.is_none() {
                    self.content_type = Some("application/octet-stream".to_string());
                }
                match length {
                    Some(length) => self.headers.insert("Content-Length", length.to_string()),
                    None if request.version() == HttpVersion::V1_1 => {
                        self.headers.insert("Transfer-Encoding", "chunked")
                    }
                    None => {}
                }
            }
            Variant::Raw {
                status,
                headers,
                chunks,
                ..
            } => {
                self.status = Some(*status);
                for (name, value) in headers.iter() {
                    self.headers.insert(name, value);
                }
                let mut all = Vec::new();
                for chunk in chunks {
                    all.extend_from_slice(chunk);
                }
                body = Some(Bytes::from(all));
            }
        }

        let route = request.route();
        let settings = route.map(|r| r.settings());

        if !self.headers.contains("cache-control") {
            let policy = settings.and_then(|s| s.cache.as_ref());
            let ttl = policy.and_then(|p| self.get_ttl(p.expires_in));
            let value = match (ttl, policy) {
                (Some(ttl), Some(policy)) => {
                    let mut value = format!("max-age={}, must-revalidate", ttl.as_secs());
                    match policy.privacy {
                        Privacy::Public => value.push_str(", public"),
                        Privacy::Private => value.push_str(", private"),
                        Privacy::Default => {}
                    }
                    value
                }
                _ => "no-cache".to_string(),
            };
            self.headers.insert("Cache-Control", value);
        }

        if let Some(cors) = settings.and_then(|s| s.cors.as_ref()) {
            cors.apply(request.headers().get("origin"), &mut self.headers);
        }

        if let (Some(callback), Some(bytes)) = (request.jsonp(), body.as_ref()) {
            let wraps = matches!(
                self.variant,
                Variant::Plain(Payload::Json(_)) | Variant::Plain(Payload::Text(_)) | Variant::Error(_)
            );
            if wraps {
                let wrapped = format!("/**/{}({});", callback, String::from_utf8_lossy(bytes));
                body = Some(Bytes::from(wrapped));
                self.content_type = Some("text/javascript; charset=utf-8".to_string());
                self.headers.insert("X-Content-Type-Options", "nosniff");
            }
        }

        if with_states {
            let mut changes: Vec<StateChange> = Vec::new();
            for change in request.states.iter().chain(self.states.iter()) {
                changes.retain(|c| c.name() != change.name());
                changes.push(change.clone());
            }
            for name in &request.invalid_states {
                if !changes.iter().any(|c| c.name() == name) {
                    changes.push(StateChange::Unset(name.clone()));
                }
            }
            for (name, value) in core.states.auto_values() {
                if !request.state.contains_key(name) && !changes.iter().any(|c| c.name() == name) {
                    changes.push(StateChange::Set(name.to_string(), value.clone()));
                }
            }
            if !changes.is_empty() {
                let lines = core.states.format(&changes).inspect_err(|e| {
                    error!("[ID{}]无法生成Set-Cookie：{}", id, e);
                })?;
                for line in lines {
                    self.headers.append("Set-Cookie", line);
                }
            }
        }

        if let Some(content_type) = &self.content_type {
            self.headers.insert("Content-Type", content_type.clone());
        }
        if let Some(bytes) = &body {
            self.headers.insert("Content-Length", bytes.len().to_string());
        }
        self.body = body;
        self.phase = Phase::Prepared;
        debug!("[ID{}]响应准备完成，状态码{}", id, status);
        Ok(())
    }

    fn negotiate(&mut self, request: &Request, core: &Core) {
        let compression = &core.config.compression;
        let Some(body) = self.body.take() else {
            return;
        };
        if !compression.enabled
            || !self.compressible
            || body.len() < compression.min_bytes
            || self.headers.contains("content-encoding")
            || should_skip_compression(self.content_type.as_deref().unwrap_or(""))
        {
            self.body = Some(body);
            return;
        }

        self.headers.merge_list("Vary", "accept-encoding");
        let encoding = request
            .headers()
            .get("accept-encoding")
            .and_then(decide_encoding);
        let Some(encoding) = encoding else {
            self.body = Some(body);
            return;
        };

        let original = body.len();
        match compress(body.to_vec(), Some(encoding)) {
            Ok(compressed) => {
                debug!(
                    "[ID{}]使用{}压缩，原始: {} bytes -> 压缩后: {} bytes",
                    request.id(),
                    encoding,
                    original,
                    compressed.len()
                );
                self.headers.insert("Content-Encoding", encoding.to_string());
                self.headers.insert("Content-Length", compressed.len().to_string());
                self.body = Some(Bytes::from(compressed));
            }
            Err(e) => {
                warn!("[ID{}]压缩失败: {}，返回未压缩内容", request.id(), e);
                self.body = Some(body);
            }
        }
    }

    /// 写出响应，只能执行一次
    pub async fn transmit<W>(&mut self, request: &Request, core: &Core, writer: &mut W) -> Result<(), Exception>
    where
        W: AsyncWrite + Unpin + Send,
    {
        match self.phase {
            Phase::Created => {
                return Err(Exception::InvalidOperation("Response was not prepared".to_string()))
            }
            Phase::Transmitted => {
                return Err(Exception::InvalidOperation("Response already transmitted".to_string()))
            }
            Phase::Prepared => {}
        }
        self.phase = Phase::Transmitted;

        let status = self.status_code();
        let headless = request.method() == Method::Head || status == 204 || status == 304;
        if !headless {
            self.negotiate(request, core);
        }
        if status == 204 || status == 304 {
            self.headers.remove("content-length");
        }
        self.headers.insert_if_absent("Date", format_http_date(&Utc::now()));
        self.headers.insert_if_absent("Server", SERVER_NAME);
        self.headers.insert("Connection", "close");

        let head = format!(
            "{} {} {}{}{}{}",
            HttpVersion::V1_1,
            status,
            status_text(status),
            CRLF,
            self.headers,
            CRLF
        );
        writer.write_all(head.as_bytes()).await?;

        if !headless {
            let chunked = self
                .headers
                .get("transfer-encoding")
                .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
            if let Variant::Stream { reader, .. } = &mut self.variant {
                if chunked {
                    let mut buf = vec![0u8; STREAM_CHUNK];
                    loop {
                        let n = reader.read(&mut buf).await?;
                        if n == 0 {
                            break;
                        }
                        writer.write_all(format!("{:X}{}", n, CRLF).as_bytes()).await?;
                        writer.write_all(&buf[..n]).await?;
                        writer.write_all(CRLF.as_bytes()).await?;
                    }
                    writer.write_all(format!("0{}{}", CRLF, CRLF).as_bytes()).await?;
                } else {
                    tokio::io::copy(reader, writer).await?;
                }
            } else if let Some(body) = &self.body {
                writer.write_all(body).await?;
            }
        }
        writer.flush().await?;
        debug!("[ID{}]响应发送完成，状态码{}", request.id(), status);
        Ok(())
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        for hook in self.release.drain(..) {
            hook();
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.variant {
            Variant::Plain(_) => "plain",
            Variant::Stream { .. } => "stream",
            Variant::Error(_) => "error",
            Variant::Redirect { .. } => "redirect",
            Variant::Raw { .. } => "raw",
            Variant::Cached(_) => "cached",
        };
        f.debug_struct("Response")
            .field("variant", &kind)
            .field("status", &self.status_code())
            .field("phase", &self.phase)
            .field("takeover", &self.takeover)
            .finish()
    }
}

impl From<&str> for Response {
    fn from(text: &str) -> Self {
        Response::text(text)
    }
}

impl From<String> for Response {
    fn from(text: String) -> Self {
        Response::text(text)
    }
}

impl From<Value> for Response {
    fn from(value: Value) -> Self {
        Response::json(value)
    }
}

impl From<Bytes> for Response {
    fn from(bytes: Bytes) -> Self {
        Response::bytes(bytes)
    }
}

impl From<Vec<u8>> for Response {
    fn from(bytes: Vec<u8>) -> Self {
        Response::bytes(bytes)
    }
}

impl From<HttpError> for Response {
    fn from(err: HttpError) -> Self {
        Response::error(err)
    }
}
