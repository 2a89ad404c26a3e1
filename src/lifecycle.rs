// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求生命周期
//!
//! 每个请求按路由预先计算好的步骤列表顺序执行，任何步骤产生错误或接管响应时立即跳到响应阶段。
//!
//! 步骤列表在独立的任务中执行，驱动方同时等待三件事：
//! - 步骤执行完毕；
//! - 客户端断开（bail）；
//! - 路由或服务器配置的超时。
//!
//! 先到者胜出，之后由 [`Shared::claim_reply`] 保证只有一个响应被发送。
//! 超时后被放弃的任务不会被强行终止，它在下一个步骤前发现请求已回复，随即停止；
//! 它持有的响应在任务结束时被丢弃，释放钩子照常执行。

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use futures_util::{future::join_all, FutureExt};
use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use regex::Regex;
use serde_json::{Map, Value};
use tokio::{
    io::AsyncWrite,
    sync::{broadcast, watch},
    task::JoinError,
};

use crate::{
    auth,
    cache::CacheKey,
    config::StateFailAction,
    ext::{Event, ExtFunc},
    http_error::HttpError,
    param::Method,
    payload,
    request::Request,
    response::{CachedEnvelope, Payload, Response},
    route::{PreFailAction, Prerequisite, Route, Step},
    server::{Core, ServerEvent},
    toolkit::{execute, Caller, Reply, Toolkit},
    validation::{input_error, FailAction},
};

lazy_static! {
    static ref JSONP_CALLBACK: Regex = Regex::new(r"^[\w\$\[\]\.]+$").unwrap();
}

/// 同一请求的各个任务之间共享的状态
pub struct Shared {
    id: String,
    bailed: watch::Sender<bool>,
    replied: AtomicBool,
    tails: AtomicUsize,
    finalized: AtomicBool,
    tail_fired: AtomicBool,
    events: broadcast::Sender<ServerEvent>,
}

impl Shared {
    pub(crate) fn new(id: String, events: broadcast::Sender<ServerEvent>) -> Arc<Self> {
        let (bailed, _) = watch::channel(false);
        Arc::new(Self {
            id,
            bailed,
            replied: AtomicBool::new(false),
            tails: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
            tail_fired: AtomicBool::new(false),
            events,
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn publish(&self, event: ServerEvent) {
        // 没有订阅者时发送失败，忽略即可
        let _ = self.events.send(event);
    }

    pub(crate) fn bail(&self) {
        if !self.bailed.send_replace(true) {
            debug!("[ID{}]客户端连接已中断", self.id);
        }
    }

    pub(crate) fn is_bailed(&self) -> bool {
        *self.bailed.borrow()
    }

    pub(crate) fn subscribe_bail(&self) -> watch::Receiver<bool> {
        self.bailed.subscribe()
    }

    /// 抢占回复权，只有第一次调用返回 true
    pub(crate) fn claim_reply(&self) -> bool {
        self.replied
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn is_replied(&self) -> bool {
        self.replied.load(Ordering::SeqCst)
    }

    pub(crate) fn add_tail(self: &Arc<Self>, name: &str) -> Tail {
        let count = self.tails.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("[ID{}]登记后台任务{}，当前{}个", self.id, name, count);
        Tail {
            shared: self.clone(),
            name: name.to_string(),
        }
    }

    fn release_tail(&self, name: &str) {
        let left = self.tails.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!("[ID{}]后台任务{}结束，剩余{}个", self.id, name, left);
        if left == 0 && self.finalized.load(Ordering::SeqCst) {
            self.fire_tail();
        }
    }

    /// 响应已发出
    pub(crate) fn finalize(&self) {
        self.finalized.store(true, Ordering::SeqCst);
        if self.tails.load(Ordering::SeqCst) == 0 {
            self.fire_tail();
        }
    }

    fn fire_tail(&self) {
        if !self.tail_fired.swap(true, Ordering::SeqCst) {
            debug!("[ID{}]请求的全部后台任务已完成", self.id);
            self.publish(ServerEvent::Tail { id: self.id.clone() });
        }
    }
}

/// 后台任务令牌，被丢弃时视为该任务完成
pub struct Tail {
    shared: Arc<Shared>,
    name: String,
}

impl Tail {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Tail {
    fn drop(&mut self) {
        self.shared.release_tail(&self.name);
    }
}

impl fmt::Debug for Tail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tail")
            .field("id", &self.shared.id)
            .field("name", &self.name)
            .finish()
    }
}

/// 步骤提前结束的原因
pub(crate) enum Exit {
    /// 以该响应结束（错误响应或接管响应）
    Respond(Response),
    Abandon,
    Close,
    /// 客户端已断开或请求已被回复
    Aborted,
}

impl From<HttpError> for Exit {
    fn from(err: HttpError) -> Self {
        Exit::Respond(Response::error(err))
    }
}

/// 一次请求的最终结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Sent(u16),
    Abandoned,
    Closed,
    Aborted,
}

/// 按顺序执行某个事件的全部请求级扩展
///
/// onPreResponse 中扩展返回的值或错误替换当前响应，其余扩展继续执行；
/// onPostResponse 的失败只记录日志。
pub(crate) async fn invoke(core: &Arc<Core>, event: Event, request: &mut Request) -> Result<(), Exit> {
    let id = request.id().to_string();
    let finishing = matches!(event, Event::OnPreResponse | Event::OnPostResponse);

    for node in core.exts.nodes(event) {
        let ExtFunc::Request(func) = &node.func else {
            continue;
        };
        if !finishing && request.is_bailed() {
            return Err(Exit::Aborted);
        }
        let toolkit = Toolkit::new(core.clone(), &node.realm, node.bind.clone(), Caller::Ext);
        let outcome = execute(func(request, &toolkit), &node.name, Caller::Ext, node.timeout, &id).await;

        match (event, outcome) {
            (_, Ok(Reply::Continue)) => {}
            (_, Ok(Reply::Abandon)) => return Err(Exit::Abandon),
            (_, Ok(Reply::Close)) => return Err(Exit::Close),
            (Event::OnPostResponse, Ok(_)) => {}
            (Event::OnPostResponse, Err(err)) => {
                warn!("[ID{}]{} 执行失败：{}", id, node.name, err);
            }
            (Event::OnPreResponse, Ok(Reply::Value(response))) => {
                request.response = Some(response);
            }
            (Event::OnPreResponse, Err(err)) => {
                request.response = Some(Response::error(err));
            }
            (_, Ok(Reply::Value(response))) => {
                if response.is_takeover() || response.is_error() {
                    debug!("[ID{}]{} 接管了响应", id, node.name);
                    return Err(Exit::Respond(response));
                }
                if event != Event::OnPostHandler {
                    return Err(Exit::from(HttpError::bad_implementation(format!(
                        "{} must return continue or a takeover response",
                        node.name
                    ))));
                }
                request.response = Some(response);
            }
            (_, Ok(_)) => {
                return Err(Exit::from(HttpError::bad_implementation(format!(
                    "{} returned an unsupported outcome",
                    node.name
                ))))
            }
            (_, Err(err)) => return Err(Exit::from(err)),
        }
    }
    Ok(())
}

/// 依次执行路由的步骤
async fn walk(core: Arc<Core>, request: &mut Request) -> Result<(), Exit> {
    let id = request.id().to_string();
    let Some(route) = request.route.clone() else {
        return Err(Exit::from(HttpError::bad_implementation("Request was not routed")));
    };

    for step in route.cycle() {
        if request.shared.is_replied() || request.is_bailed() {
            debug!("[ID{}]请求已结束，停止执行步骤{}", id, step.name());
            return Err(Exit::Aborted);
        }
        debug!("[ID{}]执行步骤{}", id, step.name());

        match step {
            Step::State => parse_state(&core, request)?,
            Step::Ext(event) => invoke(&core, *event, request).await?,
            Step::Auth => {
                if let Some(config) = route.auth() {
                    auth::authenticate(&core, request, config).await?;
                }
            }
            Step::Payload => {
                payload::read(
                    request,
                    &route.settings().payload,
                    core.config.payload.max_bytes,
                    core.config.payload_timeout(),
                )
                .await?
            }
            Step::AuthPayload => auth::authenticate_payload(&core, request).await?,
            Step::ValidateHeaders => validate_input(&core, request, &route, Source::Headers).await?,
            Step::ValidatePath => validate_input(&core, request, &route, Source::Params).await?,
            Step::Jsonp => extract_jsonp(request, &route)?,
            Step::ValidateQuery => validate_input(&core, request, &route, Source::Query).await?,
            Step::ValidatePayload => validate_input(&core, request, &route, Source::Payload).await?,
            Step::Handler => handle(&core, request, &route).await?,
            Step::ValidateResponse => validate_response(&core, request, &route).await?,
        }
    }
    Ok(())
}

fn cookie_header(request: &Request) -> String {
    request.headers().get_all("cookie").collect::<Vec<_>>().join("; ")
}

fn parse_state(core: &Core, request: &mut Request) -> Result<(), Exit> {
    let header = cookie_header(request);
    if header.is_empty() {
        return Ok(());
    }
    match core.states.parse(&header) {
        Ok(parsed) => {
            request.state = parsed.values;
            request.invalid_states = parsed.invalid;
            Ok(())
        }
        Err(err) => match core.config.state.fail_action {
            StateFailAction::Error => {
                debug!("[ID{}]Cookie解析失败：{}", request.id(), err);
                Err(Exit::from(err))
            }
            StateFailAction::Log => {
                warn!("[ID{}]Cookie解析失败，忽略：{}", request.id(), err);
                request.log(&["state", "error"], err.output_payload());
                Ok(())
            }
            StateFailAction::Ignore => Ok(()),
        },
    }
}

/// 超时或任务异常时，替身请求补上 cookie，避免重复下发自动值或漏掉清除
fn restore_state(core: &Core, stand_in: &mut Request) {
    if !core.config.state.parse {
        return;
    }
    let header = cookie_header(stand_in);
    if header.is_empty() {
        return;
    }
    if let Ok(parsed) = core.states.parse(&header) {
        stand_in.state = parsed.values;
        stand_in.invalid_states = parsed.invalid;
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Headers,
    Params,
    Query,
    Payload,
}

impl Source {
    fn name(&self) -> &'static str {
        match self {
            Source::Headers => "headers",
            Source::Params => "params",
            Source::Query => "query",
            Source::Payload => "payload",
        }
    }

    fn value(&self, request: &Request) -> Value {
        match self {
            Source::Headers => Value::Object(
                request
                    .headers()
                    .iter()
                    .map(|(name, value)| (name.to_ascii_lowercase(), Value::from(value)))
                    .collect::<Map<_, _>>(),
            ),
            Source::Params => Value::Object(
                request
                    .params
                    .iter()
                    .map(|(name, value)| (name.clone(), Value::from(value.as_str())))
                    .collect::<Map<_, _>>(),
            ),
            Source::Query => request.query.clone(),
            Source::Payload => request.payload.clone(),
        }
    }

    // 请求头只校验，不回写
    fn assign(&self, request: &mut Request, value: Value) {
        match self {
            Source::Headers => {}
            Source::Params => {
                if let Value::Object(map) = value {
                    request.params = map
                        .into_iter()
                        .map(|(name, value)| match value {
                            Value::String(text) => (name, text),
                            other => (name, other.to_string()),
                        })
                        .collect();
                }
            }
            Source::Query => request.query = value,
            Source::Payload => request.payload = value,
        }
    }
}

async fn validate_input(core: &Arc<Core>, request: &mut Request, route: &Route, source: Source) -> Result<(), Exit> {
    let validate = &route.settings().validate;
    let validator = match source {
        Source::Headers => validate.headers.as_ref(),
        Source::Params => validate.params.as_ref(),
        Source::Query => validate.query.as_ref(),
        Source::Payload => validate.payload.as_ref(),
    };
    let Some(validator) = validator else {
        return Ok(());
    };

    match validator.validate(&source.value(request)) {
        Ok(value) => {
            source.assign(request, value);
            Ok(())
        }
        Err(err) => {
            debug!("[ID{}]{}校验失败：{}", request.id(), source.name(), err);
            let error = input_error(source.name(), &err);
            fail(core, request, route, &validate.fail_action, error, source.name()).await
        }
    }
}

/// 按 failAction 处理校验失败
async fn fail(
    core: &Arc<Core>,
    request: &mut Request,
    route: &Route,
    action: &FailAction,
    error: HttpError,
    source: &str,
) -> Result<(), Exit> {
    match action {
        FailAction::Error => Err(Exit::from(error)),
        FailAction::Log => {
            warn!("[ID{}]{}校验失败，继续处理：{}", request.id(), source, error);
            request.log(&["validation", "error", source], error.output_payload());
            Ok(())
        }
        FailAction::Ignore => Ok(()),
        FailAction::Custom(f) => {
            let id = request.id().to_string();
            let toolkit = Toolkit::new(core.clone(), route.realm(), None, Caller::FailAction);
            let outcome = execute(f(request, &toolkit, error), "failAction", Caller::FailAction, None, &id).await;
            match outcome {
                Ok(Reply::Value(response)) => Err(Exit::Respond(response)),
                Ok(Reply::Abandon) => Err(Exit::Abandon),
                Ok(Reply::Close) => Err(Exit::Close),
                Ok(_) => Ok(()),
                Err(err) => Err(Exit::from(err)),
            }
        }
    }
}

fn extract_jsonp(request: &mut Request, route: &Route) -> Result<(), Exit> {
    let Some(param) = route.settings().jsonp.as_deref() else {
        return Ok(());
    };
    let callback = match request.query.get(param) {
        None => return Ok(()),
        Some(Value::String(callback)) if JSONP_CALLBACK.is_match(callback) => callback.clone(),
        Some(_) => return Err(Exit::from(HttpError::bad_request("Invalid JSONP parameter value"))),
    };
    if let Value::Object(query) = &mut request.query {
        query.remove(param);
    }
    request.jsonp = Some(callback);
    Ok(())
}

fn pre_failure(request: &mut Request, pre: &Prerequisite, err: HttpError) -> Result<Value, Exit> {
    match pre.fail_action {
        PreFailAction::Error => Err(Exit::from(err)),
        PreFailAction::Log => {
            warn!("[ID{}]前置方法{}失败：{}", request.id(), pre.name(), err);
            request.log(&["pre", "error"], err.output_payload());
            Ok(err.output_payload())
        }
        PreFailAction::Ignore => Ok(err.output_payload()),
    }
}

/// 服务端缓存的键，只缓存 GET
fn server_cache_key(request: &Request, route: &Route) -> Option<CacheKey> {
    let policy = route.settings().cache.as_ref()?;
    if !policy.server || !matches!(request.method(), Method::Get | Method::Head) {
        return None;
    }
    Some(CacheKey::new(
        format!("route:{}", route.path().template()),
        request.url(),
    ))
}

async fn handle(core: &Arc<Core>, request: &mut Request, route: &Route) -> Result<(), Exit> {
    let id = request.id().to_string();
    let settings = route.settings();

    let cache_key = server_cache_key(request, route);
    if let Some(key) = &cache_key {
        match core.cache.get(key).await {
            Ok(Some(hit)) => match CachedEnvelope::decode(&hit.item) {
                Some(envelope) => {
                    debug!("[ID{}]命中服务端缓存{}", id, key);
                    request.response = Some(Response::cached(envelope).ttl(hit.ttl));
                    return Ok(());
                }
                None => warn!("[ID{}]服务端缓存{}内容损坏，忽略", id, key),
            },
            Ok(None) => debug!("[ID{}]服务端缓存未命中{}", id, key),
            Err(e) => warn!("[ID{}]读取服务端缓存失败，跳过缓存：{}", id, e),
        }
    }

    for group in &settings.pre {
        let toolkits: Vec<Toolkit> = group
            .iter()
            .map(|_| Toolkit::new(core.clone(), route.realm(), None, Caller::Pre))
            .collect();
        let outcomes = {
            let shared: &Request = request;
            join_all(
                group
                    .iter()
                    .zip(&toolkits)
                    .map(|(pre, toolkit)| {
                        execute((pre.method)(shared, toolkit), pre.name(), Caller::Pre, None, &id).boxed()
                    }),
            )
            .await
        };

        for (pre, outcome) in group.iter().zip(outcomes) {
            let value = match outcome {
                Ok(Reply::Value(response)) if response.is_takeover() => return Err(Exit::Respond(response)),
                Ok(Reply::Value(response)) => match response.as_error() {
                    Some(err) => pre_failure(request, pre, err.clone())?,
                    None => response.source_value(),
                },
                Ok(Reply::Abandon) => return Err(Exit::Abandon),
                Ok(Reply::Close) => return Err(Exit::Close),
                Ok(_) => Value::Null,
                Err(err) => pre_failure(request, pre, err)?,
            };
            if let Some(key) = &pre.assign {
                request.pre.insert(key.clone(), value);
            }
        }
    }

    let toolkit = Toolkit::new(core.clone(), route.realm(), None, Caller::Handler);
    let outcome = execute((route.handler)(request, &toolkit), "handler", Caller::Handler, None, &id).await;
    let response = match outcome {
        Ok(Reply::Value(response)) => response,
        Ok(Reply::Continue) => Response::empty(),
        Ok(Reply::Abandon) => return Err(Exit::Abandon),
        Ok(Reply::Close) => return Err(Exit::Close),
        Ok(other) => {
            return Err(Exit::from(HttpError::bad_implementation(format!(
                "handler returned an unsupported outcome {:?}",
                other
            ))))
        }
        Err(err) => return Err(Exit::from(err)),
    };
    if response.is_error() {
        return Err(Exit::Respond(response));
    }

    if let (Some(key), Some(policy)) = (&cache_key, settings.cache.as_ref()) {
        if let (Some(ttl), Some(envelope)) = (response.get_ttl(policy.expires_in), response.to_envelope()) {
            match core.cache.set(key, envelope.encode(), ttl).await {
                Ok(()) => debug!("[ID{}]响应已写入服务端缓存{}", id, key),
                Err(e) => warn!("[ID{}]写入服务端缓存失败：{}", id, e),
            }
        }
    }

    request.response = Some(response);
    Ok(())
}

async fn validate_response(core: &Arc<Core>, request: &mut Request, route: &Route) -> Result<(), Exit> {
    let Some(validation) = route.settings().response.as_ref() else {
        return Ok(());
    };
    let value = match request.response.as_ref().and_then(|r| r.source()) {
        Some(Payload::Json(value)) => value.clone(),
        _ => return Ok(()),
    };
    if !validation.should_validate() {
        return Ok(());
    }
    match validation.schema.validate(&value) {
        Ok(_) => Ok(()),
        Err(err) => {
            error!("[ID{}]响应内容校验失败：{}", request.id(), err);
            let error = HttpError::bad_implementation("Response validation failed")
                .with_validation("response", err.keys.clone())
                .with_cause(err.message.clone());
            fail(core, request, route, &validation.fail_action, error, "response").await
        }
    }
}

async fn bailed(receiver: &mut watch::Receiver<bool>) {
    let result = receiver.wait_for(|bailed| *bailed).await.map(|_| ());
    if result.is_err() {
        std::future::pending::<()>().await;
    }
}

enum Race {
    Bailed,
    Joined(Result<(Request, Result<(), Exit>), JoinError>),
    TimedOut,
}

/// 没有响应可发送时的收尾
fn conclude(request: Request, exit: Exit) -> Outcome {
    let id = request.id().to_string();
    let outcome = match exit {
        Exit::Abandon => {
            debug!("[ID{}]处理函数放弃了响应", id);
            Outcome::Abandoned
        }
        Exit::Close => {
            debug!("[ID{}]处理函数要求关闭连接", id);
            Outcome::Closed
        }
        Exit::Aborted | Exit::Respond(_) => {
            info!("[ID{}]客户端在响应前断开连接", id);
            request.shared.publish(ServerEvent::Aborted { id: id.clone() });
            Outcome::Aborted
        }
    };
    request.shared.finalize();
    outcome
}

/// 执行一个请求的完整生命周期并写出响应
pub(crate) async fn run<W>(core: Arc<Core>, mut request: Request, writer: &mut W) -> Outcome
where
    W: AsyncWrite + Unpin + Send,
{
    let id = request.id().to_string();
    let early = invoke(&core, Event::OnRequest, &mut request).await.err();

    let resolved = core.router.resolve(request.method(), request.path(), request.host());
    debug!(
        "[ID{}]路由匹配完成：{} {}",
        id,
        resolved.route.method(),
        resolved.route.path().template()
    );
    request.params = resolved.params.params;
    request.param_array = resolved.params.array;
    let route = resolved.route;
    request.route = Some(route.clone());

    let (mut request, result) = match early {
        Some(exit) => (request, Err(exit)),
        None => {
            let deadline = route
                .settings()
                .timeout
                .or(core.config.server_timeout())
                .map(|limit| limit.saturating_sub(request.received().elapsed()));
            let mut stand_in = request.stand_in();
            let mut bail = request.shared.subscribe_bail();

            let walker = core.clone();
            let mut task = tokio::spawn(async move {
                let result = walk(walker, &mut request).await;
                (request, result)
            });
            let timer = async {
                match deadline {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let race = tokio::select! {
                biased;
                _ = bailed(&mut bail) => Race::Bailed,
                joined = &mut task => Race::Joined(joined),
                _ = timer => Race::TimedOut,
            };
            match race {
                Race::Bailed => (stand_in, Err(Exit::Aborted)),
                Race::Joined(Ok(finished)) => finished,
                Race::Joined(Err(e)) => {
                    error!("[ID{}]请求处理任务异常终止：{}", id, e);
                    let err = HttpError::bad_implementation("Request lifecycle failed").with_cause(e.to_string());
                    restore_state(&core, &mut stand_in);
                    (stand_in, Err(Exit::from(err)))
                }
                Race::TimedOut => {
                    warn!("[ID{}]请求处理超时，返回503", id);
                    restore_state(&core, &mut stand_in);
                    (stand_in, Err(Exit::from(HttpError::server_unavailable())))
                }
            }
        }
    };

    if !request.shared.claim_reply() {
        error!("[ID{}]请求已被回复，丢弃重复的响应", id);
        return Outcome::Aborted;
    }

    let response = match result {
        Ok(()) => request.response.take().unwrap_or_else(|| {
            error!("[ID{}]生命周期结束但没有产生响应", id);
            Response::error(HttpError::bad_implementation("Lifecycle completed without a response"))
        }),
        Err(Exit::Respond(response)) => response,
        Err(exit) => return conclude(request, exit),
    };

    request.response = Some(response);
    match invoke(&core, Event::OnPreResponse, &mut request).await {
        Ok(()) => {}
        Err(Exit::Respond(response)) => request.response = Some(response),
        Err(exit) => return conclude(request, exit),
    }
    let mut response = request
        .response
        .take()
        .unwrap_or_else(|| Response::error(HttpError::bad_implementation("Response was removed")));

    let mut with_states = true;
    loop {
        match response.prepare(&request, &core, with_states) {
            Ok(()) => break,
            Err(err) if with_states => {
                error!("[ID{}]准备响应失败，改为返回错误：{}", id, err);
                response = Response::error(err);
                with_states = false;
            }
            Err(err) => {
                error!("[ID{}]无法准备错误响应：{}", id, err);
                return conclude(request, Exit::Close);
            }
        }
    }

    let status = response.status_code();
    if let Err(e) = response.transmit(&request, &core, writer).await {
        warn!("[ID{}]发送响应失败：{}", id, e);
    }
    let elapsed = request.received().elapsed();
    info!(
        "[ID{}] {}, {}, {}, {}ms",
        id,
        request.method(),
        request.path(),
        status,
        elapsed.as_millis()
    );
    request.shared.publish(ServerEvent::Response {
        id: id.clone(),
        method: request.method(),
        path: request.path().to_string(),
        status,
        elapsed_ms: elapsed.as_millis() as u64,
    });

    request.response = Some(response);
    if core.exts.has(Event::OnPostResponse) {
        let tail = request.tail(Event::OnPostResponse.as_str());
        request.shared.finalize();
        tokio::spawn(async move {
            let _tail = tail;
            if invoke(&core, Event::OnPostResponse, &mut request).await.is_err() {
                debug!("[ID{}]onPostResponse 提前结束", request.id());
            }
        });
    } else {
        request.shared.finalize();
    }
    Outcome::Sent(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> (Arc<Shared>, broadcast::Receiver<ServerEvent>) {
        let (events, receiver) = broadcast::channel(16);
        (Shared::new("1".to_string(), events), receiver)
    }

    #[test]
    fn test_claim_reply_once() {
        let (shared, _rx) = shared();
        assert!(!shared.is_replied());
        assert!(shared.claim_reply());
        assert!(!shared.claim_reply());
        assert!(shared.is_replied());
    }

    #[test]
    fn test_tail_fires_after_finalize() {
        let (shared, mut rx) = shared();
        let first = shared.add_tail("a");
        let second = shared.add_tail("b");
        shared.finalize();
        assert!(rx.try_recv().is_err());

        drop(first);
        assert!(rx.try_recv().is_err());
        drop(second);
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::Tail { id }) if id == "1"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_tail_fires_immediately_without_tokens() {
        let (shared, mut rx) = shared();
        shared.finalize();
        shared.finalize();
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::Tail { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bail_wakes_waiter() {
        let (shared, _rx) = shared();
        let mut receiver = shared.subscribe_bail();
        let waiter = tokio::spawn(async move { bailed(&mut receiver).await });
        shared.bail();
        assert!(shared.is_bailed());
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
