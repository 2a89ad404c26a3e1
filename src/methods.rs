// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! 服务器方法：按名称注册的共享函数，可选地把结果缓存在服务器缓存中。

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use serde_json::Value;

use crate::{
    cache::{CacheClient, CacheKey},
    exception::Exception,
    http_error::{BoxError, HttpError},
};

lazy_static! {
    static ref METHOD_NAME: Regex = Regex::new(r"^[A-Za-z_$][\w$]*(\.[A-Za-z_$][\w$]*)*$").unwrap();
}

pub type MethodFunc = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct MethodOptions {
    /// 结果缓存时长，`None` 表示不缓存
    pub cache: Option<Duration>,
}

impl MethodOptions {
    pub fn cached(ttl: Duration) -> Self {
        Self { cache: Some(ttl) }
    }
}

struct ServerMethod {
    func: MethodFunc,
    options: MethodOptions,
}

#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<String, ServerMethod>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F, Fut>(&mut self, name: &str, f: F, options: MethodOptions) -> Result<(), Exception>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        if !METHOD_NAME.is_match(name) {
            return Err(Exception::InvalidOperation(format!("Invalid method name: {}", name)));
        }
        if self.methods.contains_key(name) {
            return Err(Exception::Duplicate {
                kind: "server method",
                name: name.to_string(),
            });
        }
        let func: MethodFunc = Arc::new(move |args| -> BoxFuture<'static, Result<Value, BoxError>> {
            Box::pin(f(args))
        });
        self.methods.insert(name.to_string(), ServerMethod { func, options });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    fn key(name: &str, args: &Value) -> CacheKey {
        CacheKey::new(format!("#{}", name), args.to_string())
    }

    /// 调用方法；配置了缓存时优先读取缓存，缓存故障只记录警告
    pub async fn call(&self, cache: &dyn CacheClient, name: &str, args: Value) -> Result<Value, HttpError> {
        let method = self
            .methods
            .get(name)
            .ok_or_else(|| HttpError::bad_implementation(format!("Unknown server method {}", name)))?;

        let key = Self::key(name, &args);
        if method.options.cache.is_some() {
            match cache.get(&key).await {
                Ok(Some(hit)) => match serde_json::from_slice::<Value>(&hit.item) {
                    Ok(value) => {
                        debug!("方法{}命中缓存", name);
                        return Ok(value);
                    }
                    Err(e) => warn!("方法{}的缓存内容无法解析：{}", name, e),
                },
                Ok(None) => {}
                Err(e) => warn!("读取方法{}的缓存失败：{}", name, e),
            }
        }

        let value = (method.func)(args).await.map_err(HttpError::from_boxed)?;

        if let Some(ttl) = method.options.cache {
            let item = Bytes::from(value.to_string());
            if let Err(e) = cache.set(&key, item, ttl).await {
                warn!("写入方法{}的缓存失败：{}", name, e);
            }
        }
        Ok(value)
    }

    /// 丢弃某组参数的缓存结果
    pub async fn invalidate(&self, cache: &dyn CacheClient, name: &str, args: &Value) -> Result<(), Exception> {
        if !self.contains(name) {
            return Err(Exception::UnknownMethod(name.to_string()));
        }
        if let Err(e) = CacheClient::drop(cache, &Self::key(name, args)).await {
            warn!("清除方法{}的缓存失败：{}", name, e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cached, MemoryCache};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BrokenCache;

    impl CacheClient for BrokenCache {
        fn get<'a>(&'a self, _key: &'a CacheKey) -> BoxFuture<'a, Result<Option<Cached>, BoxError>> {
            Box::pin(async { Err::<Option<Cached>, BoxError>("cache offline".into()) })
        }

        fn set<'a>(&'a self, _key: &'a CacheKey, _item: Bytes, _ttl: Duration) -> BoxFuture<'a, Result<(), BoxError>> {
            Box::pin(async { Err::<(), BoxError>("cache offline".into()) })
        }

        fn drop<'a>(&'a self, _key: &'a CacheKey) -> BoxFuture<'a, Result<(), BoxError>> {
            Box::pin(async { Err::<(), BoxError>("cache offline".into()) })
        }

        fn is_ready(&self) -> bool {
            false
        }
    }

    fn counting(registry: &mut MethodRegistry, options: MethodOptions) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry
            .add(
                "math.double",
                move |args: Value| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(args["n"].as_i64().unwrap_or(0) * 2))
                    }
                },
                options,
            )
            .unwrap();
        calls
    }

    #[test]
    fn test_name_validation() {
        let mut registry = MethodRegistry::new();
        let f = |_: Value| async { Ok::<Value, BoxError>(Value::Null) };
        assert!(registry.add("1bad", f, MethodOptions::default()).is_err());
        assert!(registry.add("a..b", f, MethodOptions::default()).is_err());
        assert!(registry.add("users.get_by_id", f, MethodOptions::default()).is_ok());
        assert!(registry.add("users.get_by_id", f, MethodOptions::default()).is_err());
    }

    #[tokio::test]
    async fn test_cached_call() {
        let mut registry = MethodRegistry::new();
        let calls = counting(&mut registry, MethodOptions::cached(Duration::from_secs(60)));
        let cache = MemoryCache::from_capacity(10);

        assert_eq!(registry.call(&cache, "math.double", json!({"n": 4})).await.unwrap(), json!(8));
        assert_eq!(registry.call(&cache, "math.double", json!({"n": 4})).await.unwrap(), json!(8));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        registry.invalidate(&cache, "math.double", &json!({"n": 4})).await.unwrap();
        registry.call(&cache, "math.double", json!({"n": 4})).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_broken_cache_is_soft() {
        let mut registry = MethodRegistry::new();
        let calls = counting(&mut registry, MethodOptions::cached(Duration::from_secs(60)));

        assert_eq!(registry.call(&BrokenCache, "math.double", json!({"n": 1})).await.unwrap(), json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let registry = MethodRegistry::new();
        let err = registry.call(&BrokenCache, "nope", Value::Null).await.unwrap_err();
        assert_eq!(err.status(), 500);
    }
}
