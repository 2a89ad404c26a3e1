// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 该模块定义了框架在注册期、启动期以及连接层可能产生的各类异常。
//!
//! ## 设计意图
//! - **配置错误**：路由模板非法、指纹冲突、扩展排序成环等，均在启动前暴露，永不在请求期恢复。
//! - **协议错误**：请求头无法解析、HTTP 版本不受支持等，由连接层直接转化为 4xx 响应。
//! - 请求生命周期内面向客户端的错误使用 [`crate::HttpError`]，而不是本类型。

use thiserror::Error;

/// 注册、启动与连接处理过程中发生的异常类型。
#[derive(Debug, Error)]
pub enum Exception {
    /// 路由模板不符合语法
    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// 同一方法（及虚拟主机）下两个路由的指纹冲突
    #[error("New route {path} conflicts with existing {existing}")]
    ConflictingRoute { path: String, existing: String },

    /// 未知的 HTTP 方法
    #[error("Unsupported request method: {0}")]
    UnsupportedMethod(String),

    /// 扩展点的 before/after 约束形成了环
    #[error("Invalid dependencies for {event}: {detail}")]
    CyclicExtensions { event: String, detail: String },

    /// 引用了未注册的认证策略
    #[error("Unknown authentication strategy {0}")]
    UnknownStrategy(String),

    /// 引用了未注册的认证方案
    #[error("Unknown authentication scheme {0}")]
    UnknownScheme(String),

    /// 同名对象重复注册（策略、方案、cookie、服务器方法、插件）
    #[error("Duplicate {kind} registration: {name}")]
    Duplicate { kind: &'static str, name: String },

    /// 插件依赖缺失
    #[error("Plugin {plugin} missing dependency {dependency}")]
    MissingDependency { plugin: String, dependency: String },

    /// 服务器已经开始处理流量，注册表不可再修改
    #[error("Cannot modify server configuration after it started serving requests")]
    ServerStarted,

    /// 方法调用不在其有效窗口内（例如对非 raw 响应写入原始字节）
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// 服务器方法调用失败
    #[error("Server method {0} is not registered")]
    UnknownMethod(String),

    /// 客户端发送的请求字节流无法解析为合法的 UTF-8 字符串
    #[error("Request bytes can't be parsed in UTF-8")]
    RequestIsNotUtf8,

    /// 请求行或请求头格式不正确
    #[error("Malformed HTTP request: {0}")]
    MalformedRequest(String),

    /// 客户端使用了服务器不支持的 HTTP 协议版本
    #[error("Unsupported HTTP version")]
    UnsupportedHttpVersion,

    /// 配置文件读取或解析失败
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
