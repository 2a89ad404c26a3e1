// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # pipeweb
//!
//! 以请求生命周期为核心的 HTTP 服务框架：路由表、扩展点、认证、请求体解析、
//! 输入校验、前置方法、响应准备与发送，全部按固定顺序在每个请求上执行。

pub mod auth;
pub mod cache;
pub mod compression;
pub mod config;
pub mod cors;
pub mod exception;
pub mod ext;
pub mod header;
pub mod http_error;
pub mod lifecycle;
pub mod methods;
pub mod param;
pub mod path;
pub mod payload;
pub mod request;
pub mod response;
pub mod route;
pub mod router;
pub mod server;
pub mod state;
pub mod toolkit;
pub mod util;
pub mod validation;

pub use auth::{AuthConfig, AuthMode, Scheme};
pub use cache::{CacheClient, CacheKey, MemoryCache};
pub use config::ServerConfig;
pub use cors::CorsOptions;
pub use exception::Exception;
pub use ext::{Event, ExtFunc, ExtOptions};
pub use header::Headers;
pub use http_error::{BoxError, HttpError};
pub use param::{HttpEncoding, HttpVersion, Method};
pub use request::Request;
pub use response::Response;
pub use route::{CachePolicy, PreFailAction, Prerequisite, RouteConfig};
pub use server::{InjectRequest, InjectResponse, Plugin, Server, ServerEvent};
pub use toolkit::{reply, HandlerResult, Reply, Toolkit};
pub use validation::{FailAction, Kind, ResponseValidation, Schema, Validator};
