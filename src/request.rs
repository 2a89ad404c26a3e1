// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 请求处理模块
//!
//! 负责两件事：
//! 1. 将从 TCP 流中读取的请求头（请求行 + 头部）解析为 [`RequestHead`]；
//! 2. 承载单个请求在生命周期中逐步累积的状态（[`Request`]）：
//!    路由、路径参数、查询串、请求体、cookie、认证结果、前置方法结果与响应。
//!
//! `Request` 只属于执行它的生命周期，不会在并发请求之间共享。

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, error};
use serde_json::Value;

use crate::{
    auth::AuthInfo,
    exception::Exception,
    header::Headers,
    lifecycle::{Shared, Tail},
    param::{HttpVersion, Method, CRLF},
    payload::Body,
    response::Response,
    route::Route,
    server::ServerEvent,
    state::StateChange,
    util::parse_query,
};

/// 请求行与头部
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// 请求目标（路径 + 查询串）
    pub target: String,
    pub version: HttpVersion,
    pub headers: Headers,
}

impl RequestHead {
    /// 从原始字节缓冲区构建请求头
    ///
    /// # 参数
    /// * `buffer` - 请求头原始数据（到空行为止，之后的内容会被忽略）。
    /// * `id` - 请求 ID，用于日志追踪。
    pub fn try_from(buffer: &[u8], id: &str) -> Result<Self, Exception> {
        let request_string = match std::str::from_utf8(buffer) {
            Ok(string) => string,
            Err(_) => {
                error!("[ID{}]无法解析HTTP请求", id);
                return Err(Exception::RequestIsNotUtf8);
            }
        };

        let head = request_string
            .split_once("\r\n\r\n")
            .map(|(head, _)| head)
            .unwrap_or(request_string);
        let mut lines = head.split(CRLF);

        // 请求行 (e.g., "GET /index.html HTTP/1.1")
        let request_line = lines.next().unwrap_or_default();
        let parts: Vec<&str> = request_line.split(' ').filter(|p| !p.is_empty()).collect();
        if parts.len() != 3 {
            error!("[ID{}]HTTP请求行格式不正确：{}", id, request_line);
            return Err(Exception::MalformedRequest(request_line.to_string()));
        }

        let method: Method = parts[0].parse().inspect_err(|_| {
            error!("[ID{}]不支持的HTTP请求方法：{}", id, parts[0]);
        })?;

        let version = match parts[2].to_uppercase().as_str() {
            "HTTP/1.1" => HttpVersion::V1_1,
            "HTTP/1.0" => HttpVersion::V1_0,
            other => {
                error!("[ID{}]不支持的HTTP协议版本：{}", id, other);
                return Err(Exception::UnsupportedHttpVersion);
            }
        };

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                error!("[ID{}]HTTP头部格式不正确：{}", id, line);
                return Err(Exception::MalformedRequest(line.to_string()));
            };
            headers.append(name.trim(), value.trim());
        }

        Ok(Self {
            method,
            target: parts[1].to_string(),
            version,
            headers,
        })
    }

    /// `Content-Length` 头，无法解析时视为不存在
    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("content-length")?.trim().parse().ok()
    }
}

/// 请求级日志条目
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub tags: Vec<String>,
    pub data: Value,
}

fn split_target(target: &str) -> (String, String) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target.to_string(), String::new()),
    }
}

pub struct Request {
    id: String,
    received: Instant,
    received_at: DateTime<Utc>,
    method: Method,
    url: String,
    path: String,
    query_string: String,
    version: HttpVersion,
    headers: Headers,
    remote: Option<SocketAddr>,
    /// 路径参数
    pub params: HashMap<String, String>,
    /// 路径参数，按出现顺序
    pub param_array: Vec<String>,
    pub query: Value,
    pub payload: Value,
    pub raw_payload: Bytes,
    body: Option<Body>,
    /// 解析后的 cookie
    pub state: HashMap<String, Value>,
    /// 前置方法结果
    pub pre: HashMap<String, Value>,
    pub auth: AuthInfo,
    /// 应用自定义数据
    pub app: HashMap<String, Value>,
    pub(crate) jsonp: Option<String>,
    pub(crate) route: Option<Arc<Route>>,
    pub(crate) response: Option<Response>,
    pub(crate) states: Vec<StateChange>,
    pub(crate) invalid_states: Vec<String>,
    logs: Vec<LogEntry>,
    pub(crate) shared: Arc<Shared>,
}

impl Request {
    pub(crate) fn new(head: RequestHead, body: Option<Body>, remote: Option<SocketAddr>, shared: Arc<Shared>) -> Self {
        let (path, query_string) = split_target(&head.target);
        Self {
            id: shared.id().to_string(),
            received: Instant::now(),
            received_at: Utc::now(),
            method: head.method,
            query: parse_query(&query_string),
            url: head.target,
            path,
            query_string,
            version: head.version,
            headers: head.headers,
            remote,
            params: HashMap::new(),
            param_array: Vec::new(),
            payload: Value::Null,
            raw_payload: Bytes::new(),
            body,
            state: HashMap::new(),
            pre: HashMap::new(),
            auth: AuthInfo::default(),
            app: HashMap::new(),
            jsonp: None,
            route: None,
            response: None,
            states: Vec::new(),
            invalid_states: Vec::new(),
            logs: Vec::new(),
            shared,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn received(&self) -> Instant {
        self.received
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// 改写请求方法，只在 onRequest 中生效
    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// 改写请求 URL，只在 onRequest 中生效
    pub fn set_url(&mut self, url: &str) {
        let (path, query_string) = split_target(url);
        self.url = url.to_string();
        self.path = path;
        self.query = parse_query(&query_string);
        self.query_string = query_string;
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// 主机名（不含端口）
    pub fn host(&self) -> Option<&str> {
        let host = self.headers.get("host")?.trim();
        if let Some(rest) = host.strip_prefix('[') {
            return rest.split(']').next();
        }
        host.split(':').next().filter(|h| !h.is_empty())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("content-length")?.trim().parse().ok()
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_deref()
    }

    /// 已经确定的响应（onPreResponse 之后的扩展可以读取并修改）
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut Response> {
        self.response.as_mut()
    }

    /// 取出尚未读取的请求体（`output: stream` 的路由使用）
    pub fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    /// JSONP 回调名
    pub fn jsonp(&self) -> Option<&str> {
        self.jsonp.as_deref()
    }

    /// 设置 cookie（随响应写出）
    pub fn set_state(&mut self, name: &str, value: Value) {
        self.states.retain(|c| c.name() != name);
        self.states.push(StateChange::Set(name.to_string(), value));
    }

    /// 清除 cookie
    pub fn unstate(&mut self, name: &str) {
        self.states.retain(|c| c.name() != name);
        self.states.push(StateChange::Unset(name.to_string()));
    }

    /// 记录请求级日志，并作为服务器事件广播
    pub fn log(&mut self, tags: &[&str], data: Value) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            data,
        };
        debug!("[ID{}]请求日志{:?}：{}", self.id, entry.tags, entry.data);
        self.shared.publish(ServerEvent::RequestLog {
            id: self.id.clone(),
            tags: entry.tags.clone(),
            data: entry.data.clone(),
        });
        self.logs.push(entry);
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    /// 登记一项响应发出后仍在进行的后台工作，返回的令牌被丢弃时视为完成
    pub fn tail(&self, name: &str) -> Tail {
        self.shared.add_tail(name)
    }

    /// 客户端是否已经断开
    pub fn is_bailed(&self) -> bool {
        self.shared.is_bailed()
    }

    pub(crate) fn bail(&self) {
        self.shared.bail();
    }

    /// 生命周期超时后用于构造响应的副本，不含请求体与响应
    pub(crate) fn stand_in(&self) -> Self {
        Self {
            id: self.id.clone(),
            received: self.received,
            received_at: self.received_at,
            method: self.method,
            url: self.url.clone(),
            path: self.path.clone(),
            query_string: self.query_string.clone(),
            version: self.version,
            headers: self.headers.clone(),
            remote: self.remote,
            params: self.params.clone(),
            param_array: self.param_array.clone(),
            query: self.query.clone(),
            payload: Value::Null,
            raw_payload: Bytes::new(),
            body: None,
            state: self.state.clone(),
            pre: HashMap::new(),
            auth: AuthInfo::default(),
            app: self.app.clone(),
            jsonp: self.jsonp.clone(),
            route: self.route.clone(),
            response: None,
            states: self.states.clone(),
            invalid_states: self.invalid_states.clone(),
            logs: Vec::new(),
            shared: self.shared.clone(),
        }
    }
}
