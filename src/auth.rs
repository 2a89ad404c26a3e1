// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 认证
//!
//! 认证方案（scheme）是一个工厂，根据策略选项创建 [`Scheme`] 实例；
//! 策略（strategy）是具名的方案实例，路由通过策略名引用。
//!
//! 路由认证模式：
//! - `Required`：必须认证成功；
//! - `Optional`：可以不带凭证，但带了就必须有效；
//! - `Try`：凭证无效也继续，只记录错误。

use std::{collections::HashMap, sync::Arc};

use futures_util::future::BoxFuture;
use log::debug;
use serde_json::Value;

use crate::{
    exception::Exception,
    ext::Event,
    http_error::{BoxError, HttpError},
    lifecycle::{self, Exit},
    request::Request,
    response::Response,
    server::Core,
    toolkit::{execute, Caller, HandlerResult, Reply, Toolkit},
};

/// 认证方案实例
pub trait Scheme: Send + Sync {
    /// 校验请求凭证，必须以 `h.authenticated(..)` / `h.unauthenticated(..)`、
    /// 错误或接管响应结束
    fn authenticate<'a>(&'a self, request: &'a mut Request, h: &'a Toolkit) -> BoxFuture<'a, HandlerResult>;

    /// 可选的请求体校验（例如签名覆盖请求体的方案）
    fn payload<'a>(
        &'a self,
        _request: &'a mut Request,
        _h: &'a Toolkit,
    ) -> Option<BoxFuture<'a, HandlerResult>> {
        None
    }
}

/// 方案工厂：策略选项 -> 方案实例
pub type SchemeFactory = Arc<dyn Fn(&Value) -> Result<Arc<dyn Scheme>, BoxError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    Required,
    Optional,
    Try,
}

/// 路由的认证配置
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub strategies: Vec<String>,
    pub mode: AuthMode,
    /// 认证成功后是否还要校验请求体
    pub payload: bool,
}

impl AuthConfig {
    pub fn new(strategy: &str) -> Self {
        Self {
            strategies: vec![strategy.to_string()],
            mode: AuthMode::Required,
            payload: false,
        }
    }

    pub fn strategy(mut self, strategy: &str) -> Self {
        self.strategies.push(strategy.to_string());
        self
    }

    pub fn mode(mut self, mode: AuthMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn payload(mut self, payload: bool) -> Self {
        self.payload = payload;
        self
    }
}

/// 路由上的认证设置
#[derive(Debug, Clone, Default)]
pub enum AuthSetting {
    /// 使用服务器默认配置（没有默认配置时不认证）
    #[default]
    Default,
    Disabled,
    Config(AuthConfig),
}

/// 请求上的认证结果
#[derive(Debug, Clone, Default)]
pub struct AuthInfo {
    pub is_authenticated: bool,
    pub credentials: Option<Value>,
    pub strategy: Option<String>,
    pub mode: Option<AuthMode>,
    pub error: Option<HttpError>,
}

pub(crate) struct Strategy {
    scheme: Arc<dyn Scheme>,
    realm: String,
}

#[derive(Default)]
pub struct AuthRegistry {
    schemes: HashMap<String, SchemeFactory>,
    strategies: HashMap<String, Strategy>,
    default: Option<AuthConfig>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheme(&mut self, name: &str, factory: SchemeFactory) -> Result<(), Exception> {
        if self.schemes.contains_key(name) {
            return Err(Exception::Duplicate {
                kind: "authentication scheme",
                name: name.to_string(),
            });
        }
        self.schemes.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn strategy(&mut self, name: &str, scheme: &str, options: &Value, realm: &str) -> Result<(), Exception> {
        if self.strategies.contains_key(name) {
            return Err(Exception::Duplicate {
                kind: "authentication strategy",
                name: name.to_string(),
            });
        }
        let factory = self
            .schemes
            .get(scheme)
            .ok_or_else(|| Exception::UnknownScheme(scheme.to_string()))?;
        let instance = factory(options).map_err(|e| {
            Exception::InvalidOperation(format!("Failed to create strategy {}: {}", name, e))
        })?;
        self.strategies.insert(
            name.to_string(),
            Strategy {
                scheme: instance,
                realm: realm.to_string(),
            },
        );
        Ok(())
    }

    pub fn set_default(&mut self, config: AuthConfig) -> Result<(), Exception> {
        self.check(&config)?;
        self.default = Some(config);
        Ok(())
    }

    fn check(&self, config: &AuthConfig) -> Result<(), Exception> {
        if config.strategies.is_empty() {
            return Err(Exception::InvalidOperation(
                "Authentication config must name at least one strategy".to_string(),
            ));
        }
        for name in &config.strategies {
            if !self.strategies.contains_key(name) {
                return Err(Exception::UnknownStrategy(name.clone()));
            }
        }
        Ok(())
    }

    /// 路由注册时解析认证设置
    pub fn resolve(&self, setting: &AuthSetting) -> Result<Option<AuthConfig>, Exception> {
        match setting {
            AuthSetting::Default => Ok(self.default.clone()),
            AuthSetting::Disabled => Ok(None),
            AuthSetting::Config(config) => {
                self.check(config)?;
                Ok(Some(config.clone()))
            }
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Strategy> {
        self.strategies.get(name)
    }
}

fn reject(request: &mut Request, config: &AuthConfig, name: &str, err: HttpError, credentials: Option<Value>) -> Result<(), Exit> {
    if config.mode == AuthMode::Try {
        debug!("[ID{}]try模式下认证失败，继续处理：{}", request.id(), err);
        request.auth = AuthInfo {
            is_authenticated: false,
            credentials,
            strategy: Some(name.to_string()),
            mode: Some(config.mode),
            error: Some(err),
        };
        return Ok(());
    }
    Err(Exit::from(err))
}

/// 依次尝试各策略，直到某个策略给出明确结论
pub(crate) async fn authenticate(core: &Arc<Core>, request: &mut Request, config: &AuthConfig) -> Result<(), Exit> {
    let id = request.id().to_string();
    let mut challenges = Vec::new();

    for name in &config.strategies {
        let strategy = core.auth.get(name).ok_or_else(|| {
            Exit::from(HttpError::bad_implementation(format!("Unknown authentication strategy {}", name)))
        })?;
        let toolkit = Toolkit::new(core.clone(), &strategy.realm, None, Caller::Auth);
        let label = format!("Authentication strategy {}", name);
        let outcome = execute(
            strategy.scheme.authenticate(request, &toolkit),
            &label,
            Caller::Auth,
            None,
            &id,
        )
        .await;

        let err = match outcome {
            Ok(Reply::Authenticated(credentials)) => {
                debug!("[ID{}]策略{}认证成功", id, name);
                request.auth = AuthInfo {
                    is_authenticated: true,
                    credentials: Some(credentials),
                    strategy: Some(name.clone()),
                    mode: Some(config.mode),
                    error: None,
                };
                return lifecycle::invoke(core, Event::OnCredentials, request).await;
            }
            Ok(Reply::Unauthenticated(err, credentials)) => {
                if !err.is_missing() {
                    return reject(request, config, name, err, credentials);
                }
                err
            }
            Ok(Reply::Value(response)) => return Err(Exit::Respond(response)),
            Ok(Reply::Abandon) => return Err(Exit::Abandon),
            Ok(Reply::Close) => return Err(Exit::Close),
            Ok(_) => {
                return Err(Exit::from(HttpError::bad_implementation(format!(
                    "{} must return an authentication outcome",
                    label
                ))))
            }
            Err(err) => {
                if !err.is_missing() {
                    return reject(request, config, name, err, None);
                }
                err
            }
        };

        if let Some(challenge) = err.headers().get("WWW-Authenticate") {
            challenges.push(challenge.to_string());
        }
    }

    // 所有策略都没有找到凭证
    request.auth.mode = Some(config.mode);
    if config.mode == AuthMode::Required {
        let mut err = HttpError::unauthorized("Missing authentication");
        if !challenges.is_empty() {
            err = err.with_header("WWW-Authenticate", challenges.join(", "));
        }
        return Err(Exit::from(err));
    }
    Ok(())
}

/// 认证成功后按策略校验请求体
pub(crate) async fn authenticate_payload(core: &Arc<Core>, request: &mut Request) -> Result<(), Exit> {
    if !request.auth.is_authenticated {
        return Ok(());
    }
    let Some(name) = request.auth.strategy.clone() else {
        return Ok(());
    };
    let Some(strategy) = core.auth.get(&name) else {
        return Ok(());
    };

    let id = request.id().to_string();
    let toolkit = Toolkit::new(core.clone(), &strategy.realm, None, Caller::Auth);
    let Some(future) = strategy.scheme.payload(request, &toolkit) else {
        return Ok(());
    };
    let label = format!("Payload authentication {}", name);
    match execute(future, &label, Caller::Auth, None, &id).await {
        Ok(Reply::Value(response)) => Err(Exit::Respond(response)),
        Ok(Reply::Unauthenticated(err, _)) => Err(Exit::from(err)),
        Ok(_) => Ok(()),
        Err(err) => Err(Exit::from(err)),
    }
}

/// 创建不依赖选项的方案工厂
pub fn scheme_factory<S: Scheme + Clone + 'static>(scheme: S) -> SchemeFactory {
    Arc::new(move |_options: &Value| -> Result<Arc<dyn Scheme>, BoxError> { Ok(Arc::new(scheme.clone())) })
}

/// 请求没有提供凭证时的认证失败
pub fn missing(scheme: &str) -> Response {
    Response::error(HttpError::missing_credentials(scheme))
}
