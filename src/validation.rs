// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 输入/输出校验
//!
//! 生命周期把 schema 当作不透明对象，只调用 [`Validator::validate`]。
//! 任何 `Fn(&Value) -> Result<Value, ValidationError>` 闭包都可以充当校验器；
//! [`Schema`] 提供一个覆盖常见对象校验场景的最小实现。

use std::{fmt, sync::Arc};

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};

use crate::{
    http_error::HttpError,
    request::Request,
    toolkit::{HandlerResult, Toolkit},
};

/// 校验失败：描述信息与出错字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
    pub keys: Vec<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>, keys: Vec<String>) -> Self {
        Self {
            message: message.into(),
            keys,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// 校验器：返回（可能经过类型转换的）新值
#[cfg_attr(test, mockall::automock)]
pub trait Validator: Send + Sync {
    fn validate(&self, value: &Value) -> Result<Value, ValidationError>;
}

impl<F> Validator for F
where
    F: Fn(&Value) -> Result<Value, ValidationError> + Send + Sync,
{
    fn validate(&self, value: &Value) -> Result<Value, ValidationError> {
        self(value)
    }
}

/// 自定义失败处理函数，返回值决定最终结果
pub type FailHandler = Arc<
    dyn for<'a> Fn(&'a mut Request, &'a Toolkit, HttpError) -> BoxFuture<'a, HandlerResult>
        + Send
        + Sync,
>;

/// 校验失败时的处理策略
#[derive(Clone, Default)]
pub enum FailAction {
    /// 返回 400（响应校验为 500）
    #[default]
    Error,
    /// 记录日志后继续，使用未经校验的值
    Log,
    /// 静默继续
    Ignore,
    Custom(FailHandler),
}

impl FailAction {
    pub fn custom<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut Request, &'a Toolkit, HttpError) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        FailAction::Custom(Arc::new(f))
    }
}

impl fmt::Debug for FailAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailAction::Error => write!(f, "Error"),
            FailAction::Log => write!(f, "Log"),
            FailAction::Ignore => write!(f, "Ignore"),
            FailAction::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// 路由的输入校验配置
#[derive(Clone, Default)]
pub struct ValidateOptions {
    pub headers: Option<Arc<dyn Validator>>,
    pub params: Option<Arc<dyn Validator>>,
    pub query: Option<Arc<dyn Validator>>,
    pub payload: Option<Arc<dyn Validator>>,
    pub fail_action: FailAction,
}

/// 路由的响应校验配置
#[derive(Clone)]
pub struct ResponseValidation {
    pub schema: Arc<dyn Validator>,
    /// 抽样百分比，0 表示不校验
    pub sample: u8,
    pub fail_action: FailAction,
}

impl ResponseValidation {
    pub fn new(schema: impl Validator + 'static) -> Self {
        Self {
            schema: Arc::new(schema),
            sample: 100,
            fail_action: FailAction::Error,
        }
    }

    pub fn sample(mut self, percent: u8) -> Self {
        self.sample = percent.min(100);
        self
    }

    pub fn fail_action(mut self, action: FailAction) -> Self {
        self.fail_action = action;
        self
    }

    /// 按抽样比例决定本次是否校验
    pub fn should_validate(&self) -> bool {
        self.sample >= 100 || (self.sample > 0 && fastrand::u8(0..100) < self.sample)
    }
}

/// 输入校验失败对应的 400 错误
pub fn input_error(source: &str, err: &ValidationError) -> HttpError {
    HttpError::bad_request(format!("Invalid request {} input", source))
        .with_validation(source, err.keys.clone())
        .with_cause(err.message.clone())
}

/// 字段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl Kind {
    fn name(&self) -> &'static str {
        match self {
            Kind::String => "a string",
            Kind::Integer => "an integer",
            Kind::Number => "a number",
            Kind::Boolean => "a boolean",
            Kind::Object => "an object",
            Kind::Array => "an array",
            Kind::Any => "any value",
        }
    }

    /// 检查并转换：路径参数与查询串中的值都是字符串，需要按目标类型转换
    fn coerce(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (Kind::Any, v) => Some(v.clone()),
            (Kind::String, Value::String(_)) => Some(value.clone()),
            (Kind::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Some(value.clone()),
            (Kind::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
            (Kind::Number, Value::Number(_)) => Some(value.clone()),
            (Kind::Number, Value::String(s)) => s.trim().parse::<f64>().ok().map(Value::from),
            (Kind::Boolean, Value::Bool(_)) => Some(value.clone()),
            (Kind::Boolean, Value::String(s)) => match s.as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            (Kind::Object, Value::Object(_)) => Some(value.clone()),
            (Kind::Array, Value::Array(_)) => Some(value.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Field {
    name: String,
    kind: Kind,
    required: bool,
}

/// 简单的对象 schema
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<Field>,
    allow_unknown: bool,
}

impl Schema {
    pub fn object() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, kind: Kind) -> Self {
        self.fields.push(Field {
            name: name.to_string(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: &str, kind: Kind) -> Self {
        self.fields.push(Field {
            name: name.to_string(),
            kind,
            required: false,
        });
        self
    }

    pub fn allow_unknown(mut self, allow: bool) -> Self {
        self.allow_unknown = allow;
        self
    }
}

impl Validator for Schema {
    fn validate(&self, value: &Value) -> Result<Value, ValidationError> {
        let empty = Map::new();
        let object = match value {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => return Err(ValidationError::new("\"value\" must be an object", vec![])),
        };

        let mut out = Map::new();
        let mut messages = Vec::new();
        let mut keys = Vec::new();

        for field in &self.fields {
            match object.get(&field.name) {
                Some(raw) => match field.kind.coerce(raw) {
                    Some(converted) => {
                        out.insert(field.name.clone(), converted);
                    }
                    None => {
                        messages.push(format!("\"{}\" must be {}", field.name, field.kind.name()));
                        keys.push(field.name.clone());
                    }
                },
                None if field.required => {
                    messages.push(format!("\"{}\" is required", field.name));
                    keys.push(field.name.clone());
                }
                None => {}
            }
        }

        for (key, raw) in object {
            if self.fields.iter().any(|f| &f.name == key) {
                continue;
            }
            if self.allow_unknown {
                out.insert(key.clone(), raw.clone());
            } else {
                messages.push(format!("\"{}\" is not allowed", key));
                keys.push(key.clone());
            }
        }

        if keys.is_empty() {
            Ok(Value::Object(out))
        } else {
            Err(ValidationError::new(messages.join(". "), keys))
        }
    }
}
