// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 路由定义
//!
//! 路由在注册时完成路径编译、认证设置解析，并预先计算生命周期步骤（cycle）：
//! 只包含该路由实际需要的内置步骤，以及当前已注册扩展的事件。
//! 扩展注册之后，服务器会为所有路由重新计算 cycle。

use std::{fmt, sync::Arc, time::Duration};

use futures_util::future::BoxFuture;

use crate::{
    auth::{AuthConfig, AuthSetting},
    cors::CorsOptions,
    exception::Exception,
    ext::{Event, ExtRegistry},
    http_error::HttpError,
    param::Method,
    path::CompiledPath,
    payload::{PayloadOptions, PayloadOutput},
    request::Request,
    toolkit::{reply, HandlerResult, Toolkit},
    validation::{FailAction, ResponseValidation, ValidateOptions, Validator},
};

pub type Handler = Arc<
    dyn for<'a> Fn(&'a mut Request, &'a Toolkit) -> BoxFuture<'a, HandlerResult> + Send + Sync,
>;

/// 前置方法只读访问请求，同组内并发执行
pub type PreMethod =
    Arc<dyn for<'a> Fn(&'a Request, &'a Toolkit) -> BoxFuture<'a, HandlerResult> + Send + Sync>;

/// 包装处理函数
pub fn handler<F>(f: F) -> Handler
where
    F: for<'a> Fn(&'a mut Request, &'a Toolkit) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// 前置方法失败时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreFailAction {
    #[default]
    Error,
    /// 记录日志，错误载荷写入 `request.pre`
    Log,
    /// 错误载荷写入 `request.pre`
    Ignore,
}

#[derive(Clone)]
pub struct Prerequisite {
    pub(crate) method: PreMethod,
    pub(crate) assign: Option<String>,
    pub(crate) fail_action: PreFailAction,
}

impl Prerequisite {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a Request, &'a Toolkit) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
    {
        Self {
            method: Arc::new(f),
            assign: None,
            fail_action: PreFailAction::Error,
        }
    }

    /// 结果写入 `request.pre[key]`
    pub fn assign(mut self, key: &str) -> Self {
        self.assign = Some(key.to_string());
        self
    }

    pub fn fail_action(mut self, action: PreFailAction) -> Self {
        self.fail_action = action;
        self
    }

    pub fn name(&self) -> &str {
        self.assign.as_deref().unwrap_or("anonymous")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Privacy {
    #[default]
    Default,
    Public,
    Private,
}

/// 客户端缓存头与服务端响应缓存
#[derive(Debug, Clone, Default)]
pub struct CachePolicy {
    pub expires_in: Option<Duration>,
    pub privacy: Privacy,
    /// 在服务器缓存中保存 GET 响应
    pub server: bool,
}

impl CachePolicy {
    pub fn expires_in(ttl: Duration) -> Self {
        Self {
            expires_in: Some(ttl),
            ..Self::default()
        }
    }

    pub fn privacy(mut self, privacy: Privacy) -> Self {
        self.privacy = privacy;
        self
    }

    pub fn server(mut self, server: bool) -> Self {
        self.server = server;
        self
    }
}

/// 路由设置
#[derive(Clone, Default)]
pub struct RouteSettings {
    pub auth: AuthSetting,
    pub validate: ValidateOptions,
    pub payload: PayloadOptions,
    pub cache: Option<CachePolicy>,
    pub cors: Option<CorsOptions>,
    /// JSONP 回调所在的查询参数名
    pub jsonp: Option<String>,
    /// 前置方法分组，组间串行，组内并发
    pub pre: Vec<Vec<Prerequisite>>,
    pub response: Option<ResponseValidation>,
    /// 覆盖服务器的响应期限
    pub timeout: Option<Duration>,
    pub vhost: Vec<String>,
}

/// 路由注册参数
pub struct RouteConfig {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) handler: Handler,
    pub(crate) settings: RouteSettings,
}

impl RouteConfig {
    /// `method` 为 `*` 时匹配任意方法
    pub fn new<F>(method: &str, path: &str, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut Request, &'a Toolkit) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            handler: Arc::new(f),
            settings: RouteSettings::default(),
        }
    }

    pub fn auth(mut self, config: AuthConfig) -> Self {
        self.settings.auth = AuthSetting::Config(config);
        self
    }

    /// 不使用服务器的默认认证
    pub fn no_auth(mut self) -> Self {
        self.settings.auth = AuthSetting::Disabled;
        self
    }

    pub fn validate_headers(mut self, validator: impl Validator + 'static) -> Self {
        self.settings.validate.headers = Some(Arc::new(validator));
        self
    }

    pub fn validate_params(mut self, validator: impl Validator + 'static) -> Self {
        self.settings.validate.params = Some(Arc::new(validator));
        self
    }

    pub fn validate_query(mut self, validator: impl Validator + 'static) -> Self {
        self.settings.validate.query = Some(Arc::new(validator));
        self
    }

    pub fn validate_payload(mut self, validator: impl Validator + 'static) -> Self {
        self.settings.validate.payload = Some(Arc::new(validator));
        self
    }

    pub fn fail_action(mut self, action: FailAction) -> Self {
        self.settings.validate.fail_action = action;
        self
    }

    pub fn payload(mut self, options: PayloadOptions) -> Self {
        self.settings.payload = options;
        self
    }

    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.settings.cache = Some(policy);
        self
    }

    pub fn cors(mut self, options: CorsOptions) -> Self {
        self.settings.cors = Some(options);
        self
    }

    pub fn jsonp(mut self, param: &str) -> Self {
        self.settings.jsonp = Some(param.to_string());
        self
    }

    /// 追加一组前置方法
    pub fn pre(mut self, group: Vec<Prerequisite>) -> Self {
        self.settings.pre.push(group);
        self
    }

    pub fn response(mut self, validation: ResponseValidation) -> Self {
        self.settings.response = Some(validation);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.settings.timeout = Some(timeout);
        self
    }

    pub fn vhost(mut self, host: &str) -> Self {
        self.settings.vhost.push(host.to_ascii_lowercase());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMethod {
    Exact(Method),
    /// `*`
    Any,
}

impl RouteMethod {
    pub fn parse(method: &str) -> Result<Self, Exception> {
        if method == "*" {
            return Ok(RouteMethod::Any);
        }
        let method: Method = method.parse()?;
        if method == Method::Head {
            return Err(Exception::InvalidOperation(
                "Cannot add a HEAD route, GET routes also serve HEAD".to_string(),
            ));
        }
        Ok(RouteMethod::Exact(method))
    }

    fn has_payload(&self) -> bool {
        match self {
            RouteMethod::Exact(m) => m.has_payload(),
            RouteMethod::Any => true,
        }
    }
}

impl fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteMethod::Exact(m) => write!(f, "{}", m.as_str()),
            RouteMethod::Any => write!(f, "*"),
        }
    }
}

/// 生命周期步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    State,
    Ext(Event),
    Auth,
    Payload,
    AuthPayload,
    ValidateHeaders,
    ValidatePath,
    Jsonp,
    ValidateQuery,
    ValidatePayload,
    Handler,
    ValidateResponse,
}

impl Step {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Step::State => "state",
            Step::Ext(event) => event.as_str(),
            Step::Auth => "auth",
            Step::Payload => "payload",
            Step::AuthPayload => "authPayload",
            Step::ValidateHeaders => "validateHeaders",
            Step::ValidatePath => "validatePath",
            Step::Jsonp => "jsonp",
            Step::ValidateQuery => "validateQuery",
            Step::ValidatePayload => "validatePayload",
            Step::Handler => "handler",
            Step::ValidateResponse => "validateResponse",
        }
    }
}

#[derive(Clone)]
pub struct Route {
    method: RouteMethod,
    path: CompiledPath,
    pub(crate) handler: Handler,
    settings: RouteSettings,
    auth: Option<AuthConfig>,
    realm: String,
    cycle: Vec<Step>,
}

impl Route {
    pub(crate) fn new(
        method: RouteMethod,
        path: CompiledPath,
        handler: Handler,
        settings: RouteSettings,
        auth: Option<AuthConfig>,
        realm: &str,
    ) -> Self {
        Self {
            method,
            path,
            handler,
            settings,
            auth,
            realm: realm.to_string(),
            cycle: Vec::new(),
        }
    }

    /// 未匹配到任何路由时使用的终止路由
    pub(crate) fn not_found() -> Result<Self, Exception> {
        Self::terminal(HttpError::not_found)
    }

    /// 路径参数解码失败时使用的终止路由
    pub(crate) fn bad_request() -> Result<Self, Exception> {
        Self::terminal(|| HttpError::bad_request("Invalid request path"))
    }

    fn terminal(make: fn() -> HttpError) -> Result<Self, Exception> {
        let path = CompiledPath::compile("/{p*}", true)?;
        let handler = handler(move |_req, _h| reply(async move { Err(make().into()) }));
        Ok(Self::new(
            RouteMethod::Any,
            path,
            handler,
            RouteSettings::default(),
            None,
            "server",
        ))
    }

    pub fn method(&self) -> RouteMethod {
        self.method
    }

    pub fn path(&self) -> &CompiledPath {
        &self.path
    }

    pub fn settings(&self) -> &RouteSettings {
        &self.settings
    }

    pub fn auth(&self) -> Option<&AuthConfig> {
        self.auth.as_ref()
    }

    /// 注册该路由的插件名
    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub(crate) fn cycle(&self) -> &[Step] {
        &self.cycle
    }

    /// 各步骤名称，按执行顺序
    pub fn cycle_names(&self) -> Vec<&'static str> {
        self.cycle.iter().map(|s| s.name()).collect()
    }

    fn parses_payload(&self) -> bool {
        self.method.has_payload() && self.settings.payload.output == PayloadOutput::Data
    }

    /// 根据路由设置与已注册扩展计算步骤列表
    pub(crate) fn build_cycle(&mut self, exts: &ExtRegistry, parse_state: bool) {
        let mut cycle = Vec::new();
        let validate = &self.settings.validate;

        if parse_state {
            cycle.push(Step::State);
        }
        if exts.has(Event::OnPreAuth) {
            cycle.push(Step::Ext(Event::OnPreAuth));
        }
        if self.auth.is_some() {
            cycle.push(Step::Auth);
        }
        if self.method.has_payload() {
            cycle.push(Step::Payload);
        }
        if self.auth.as_ref().is_some_and(|a| a.payload) && self.parses_payload() {
            cycle.push(Step::AuthPayload);
        }
        if exts.has(Event::OnPostAuth) {
            cycle.push(Step::Ext(Event::OnPostAuth));
        }
        if validate.headers.is_some() {
            cycle.push(Step::ValidateHeaders);
        }
        if validate.params.is_some() {
            cycle.push(Step::ValidatePath);
        }
        if self.settings.jsonp.is_some() {
            cycle.push(Step::Jsonp);
        }
        if validate.query.is_some() {
            cycle.push(Step::ValidateQuery);
        }
        if validate.payload.is_some() && self.parses_payload() && self.settings.payload.parse {
            cycle.push(Step::ValidatePayload);
        }
        if exts.has(Event::OnPreHandler) {
            cycle.push(Step::Ext(Event::OnPreHandler));
        }
        cycle.push(Step::Handler);
        if exts.has(Event::OnPostHandler) {
            cycle.push(Step::Ext(Event::OnPostHandler));
        }
        if self.settings.response.as_ref().is_some_and(|r| r.sample > 0) {
            cycle.push(Step::ValidateResponse);
        }
        self.cycle = cycle;
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("path", &self.path.template())
            .field("realm", &self.realm)
            .field("cycle", &self.cycle_names())
            .finish()
    }
}
