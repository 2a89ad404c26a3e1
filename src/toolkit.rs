// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 工具箱
//!
//! 每个用户函数（处理函数、扩展、前置方法、认证方案）都会收到一个 [`Toolkit`]，
//! 通过它产生响应、继续流程、放弃处理或报告认证结果。
//!
//! 用户函数的各种结束方式（返回值、返回错误、panic、超时、什么也不返回）
//! 都由 [`execute`] 统一归类为 `Result<Reply, HttpError>`。

use std::{
    any::Any,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use futures_util::{future::BoxFuture, FutureExt};
use log::{debug, error};
use serde_json::Value;

use crate::{
    http_error::{BoxError, HttpError},
    response::Response,
    server::Core,
};

/// 用户函数的返回类型
pub type HandlerResult = Result<Reply, BoxError>;

/// 用户函数的结论
pub enum Reply {
    /// 不表态，按默认行为继续
    Continue,
    /// 没有返回任何内容，视为实现错误
    Empty,
    Value(Response),
    /// 不再发送响应
    Abandon,
    /// 不发送响应并关闭连接
    Close,
    /// 认证成功，携带凭证
    Authenticated(Value),
    /// 认证失败，可附带部分凭证
    Unauthenticated(HttpError, Option<Value>),
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Continue => write!(f, "Continue"),
            Reply::Empty => write!(f, "Empty"),
            Reply::Value(response) => write!(f, "Value({:?})", response),
            Reply::Abandon => write!(f, "Abandon"),
            Reply::Close => write!(f, "Close"),
            Reply::Authenticated(credentials) => write!(f, "Authenticated({})", credentials),
            Reply::Unauthenticated(err, _) => write!(f, "Unauthenticated({})", err),
        }
    }
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Reply::Value(response)
    }
}

impl From<HttpError> for Reply {
    fn from(err: HttpError) -> Self {
        Reply::Value(Response::error(err))
    }
}

impl From<&str> for Reply {
    fn from(text: &str) -> Self {
        Reply::Value(Response::from(text))
    }
}

impl From<String> for Reply {
    fn from(text: String) -> Self {
        Reply::Value(Response::from(text))
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(Response::from(value))
    }
}

impl From<Bytes> for Reply {
    fn from(bytes: Bytes) -> Self {
        Reply::Value(Response::from(bytes))
    }
}

impl From<Vec<u8>> for Reply {
    fn from(bytes: Vec<u8>) -> Self {
        Reply::Value(Response::from(bytes))
    }
}

impl From<()> for Reply {
    fn from(_: ()) -> Self {
        Reply::Empty
    }
}

/// 把 async 块装箱为用户函数需要返回的 future
pub fn reply<'a, F>(future: F) -> BoxFuture<'a, HandlerResult>
where
    F: Future<Output = HandlerResult> + Send + 'a,
{
    Box::pin(future)
}

/// 调用方类别，决定哪些结论是合法的
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Handler,
    Ext,
    Pre,
    Auth,
    FailAction,
}

pub struct Toolkit {
    core: Arc<Core>,
    realm: String,
    context: Option<Arc<dyn Any + Send + Sync>>,
    caller: Caller,
}

impl Toolkit {
    pub(crate) fn new(
        core: Arc<Core>,
        realm: &str,
        context: Option<Arc<dyn Any + Send + Sync>>,
        caller: Caller,
    ) -> Self {
        Self {
            core,
            realm: realm.to_string(),
            context,
            caller,
        }
    }

    /// 继续执行生命周期
    pub fn proceed(&self) -> HandlerResult {
        Ok(Reply::Continue)
    }

    pub fn response(&self, value: impl Into<Response>) -> Response {
        value.into()
    }

    pub fn redirect(&self, location: &str) -> Response {
        Response::redirect(location)
    }

    pub fn abandon(&self) -> HandlerResult {
        Ok(Reply::Abandon)
    }

    pub fn close(&self) -> HandlerResult {
        Ok(Reply::Close)
    }

    pub fn authenticated(&self, credentials: Value) -> HandlerResult {
        Ok(Reply::Authenticated(credentials))
    }

    pub fn unauthenticated(&self, error: HttpError, credentials: Option<Value>) -> HandlerResult {
        Ok(Reply::Unauthenticated(error, credentials))
    }

    /// 注册扩展时绑定的上下文
    pub fn context<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.context.as_ref()?.downcast_ref::<T>()
    }

    /// 注册该函数的插件名
    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn caller(&self) -> Caller {
        self.caller
    }

    /// 调用服务器方法
    pub async fn method(&self, name: &str, args: Value) -> Result<Value, HttpError> {
        self.core.methods.call(self.core.cache.as_ref(), name, args).await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 执行用户函数并归类结果
///
/// 返回错误、panic 与超时都转换为 [`HttpError`]；非框架错误记为实现错误。
pub(crate) async fn execute<'a>(
    future: BoxFuture<'a, HandlerResult>,
    name: &str,
    caller: Caller,
    timeout: Option<Duration>,
    id: &str,
) -> Result<Reply, HttpError> {
    let guarded = AssertUnwindSafe(future).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("[ID{}]{} 执行超时（{}ms）", id, name, limit.as_millis());
                return Err(HttpError::bad_implementation(format!("{} timed out", name)));
            }
        },
        None => guarded.await,
    };

    let result = match outcome {
        Ok(result) => result,
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            error!("[ID{}]{} 发生panic：{}", id, name, detail);
            return Err(HttpError::bad_implementation(format!("{} panicked", name)).with_cause(detail));
        }
    };

    let reply = match result {
        Ok(reply) => reply,
        Err(err) => {
            let err = HttpError::from_boxed(err);
            if err.is_developer_error() {
                error!("[ID{}]{} 返回了未知错误：{}", id, name, err);
            } else {
                debug!("[ID{}]{} 返回错误：{}", id, name, err);
            }
            return Err(err);
        }
    };

    match reply {
        Reply::Empty => {
            error!("[ID{}]{} 没有返回任何值", id, name);
            Err(HttpError::bad_implementation(format!(
                "{} method did not return a value, a response, or an error",
                name
            )))
        }
        Reply::Authenticated(_) | Reply::Unauthenticated(..) if caller != Caller::Auth => {
            error!("[ID{}]{} 在认证之外返回了认证结果", id, name);
            Err(HttpError::bad_implementation(format!(
                "{} cannot return an authentication outcome",
                name
            )))
        }
        reply => Ok(reply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(future: BoxFuture<'static, HandlerResult>, caller: Caller) -> Result<Reply, HttpError> {
        execute(future, "test", caller, Some(Duration::from_millis(50)), "0").await
    }

    #[tokio::test]
    async fn test_value_passthrough() {
        let reply = run(reply(async { Ok("hello".into()) }), Caller::Handler).await.unwrap();
        assert!(matches!(reply, Reply::Value(_)));
    }

    #[tokio::test]
    async fn test_known_error_kept() {
        let err = run(
            reply(async { Err(HttpError::forbidden("no").into()) }),
            Caller::Handler,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), 403);
    }

    #[tokio::test]
    async fn test_foreign_error_becomes_500() {
        let err = run(reply(async { Err("db down".into()) }), Caller::Ext)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 500);
        assert!(err.is_developer_error());
    }

    #[tokio::test]
    async fn test_empty_reply_is_fault() {
        let err = run(reply(async { Ok(().into()) }), Caller::Handler).await.unwrap_err();
        assert_eq!(err.status(), 500);
        assert!(err.message().contains("test method did not return"));
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let err = run(reply(async { panic!("boom") }), Caller::Handler).await.unwrap_err();
        assert_eq!(err.status(), 500);
        assert_eq!(err.cause(), Some("boom"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let slow = reply(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Reply::Continue)
        });
        let err = run(slow, Caller::Ext).await.unwrap_err();
        assert!(err.message().contains("timed out"));
    }

    #[tokio::test]
    async fn test_auth_outcome_outside_auth() {
        let err = run(
            reply(async { Ok(Reply::Authenticated(Value::Null)) }),
            Caller::Handler,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), 500);

        let ok = run(reply(async { Ok(Reply::Authenticated(Value::Null)) }), Caller::Auth).await;
        assert!(ok.is_ok());
    }
}
