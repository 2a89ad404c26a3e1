// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 缓存模块
//!
//! 生命周期与服务器方法只通过 [`CacheClient`] 契约访问缓存，
//! 不直接依赖具体后端。[`MemoryCache`] 是默认的进程内实现（LRU + TTL）。
//!
//! 缓存只是优化手段：调用方把后端错误当作未命中处理并记录警告。

use std::{
    fmt,
    num::NonZeroUsize,
    sync::Mutex,
    time::{Duration, Instant},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use lru::LruCache;

use crate::http_error::BoxError;

/// 缓存键：分段 + 段内标识
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub segment: String,
    pub id: String,
}

impl CacheKey {
    pub fn new(segment: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            segment: segment.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.segment, self.id)
    }
}

/// 命中的缓存项，`ttl` 为剩余有效期
#[derive(Debug, Clone)]
pub struct Cached {
    pub item: Bytes,
    pub stored: DateTime<Utc>,
    pub ttl: Duration,
}

/// 缓存后端契约
pub trait CacheClient: Send + Sync {
    fn get<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<Option<Cached>, BoxError>>;

    fn set<'a>(
        &'a self,
        key: &'a CacheKey,
        item: Bytes,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), BoxError>>;

    fn drop<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<(), BoxError>>;

    fn is_ready(&self) -> bool;
}

struct CacheEntry {
    content: Bytes,
    stored: DateTime<Utc>,
    expires: Instant,
}

/// 进程内 LRU 缓存，条目按 TTL 过期
pub struct MemoryCache {
    cache: Mutex<LruCache<CacheKey, CacheEntry>>,
}

impl MemoryCache {
    /// 根据容量构造，容量为 0 时按 1 处理
    pub fn from_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    // 放入
    fn push(&self, key: &CacheKey, content: Bytes, ttl: Duration) -> Result<(), BoxError> {
        let entry = CacheEntry {
            content,
            stored: Utc::now(),
            expires: Instant::now() + ttl,
        };
        let mut cache = self.cache.lock().map_err(|_| "memory cache lock poisoned")?;
        cache.put(key.clone(), entry);
        Ok(())
    }

    // 查询有效缓存，过期条目顺带清除
    fn find(&self, key: &CacheKey) -> Result<Option<Cached>, BoxError> {
        let mut cache = self.cache.lock().map_err(|_| "memory cache lock poisoned")?;
        let now = Instant::now();
        let expired = match cache.get(key) {
            Some(entry) if entry.expires > now => {
                return Ok(Some(Cached {
                    item: entry.content.clone(),
                    stored: entry.stored,
                    ttl: entry.expires - now,
                }))
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.pop(key);
        }
        Ok(None)
    }

    fn remove(&self, key: &CacheKey) -> Result<(), BoxError> {
        let mut cache = self.cache.lock().map_err(|_| "memory cache lock poisoned")?;
        cache.pop(key);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.cache.lock().map(|c| c.cap().get()).unwrap_or(0)
    }
}

impl CacheClient for MemoryCache {
    fn get<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<Option<Cached>, BoxError>> {
        Box::pin(async move { self.find(key) })
    }

    fn set<'a>(
        &'a self,
        key: &'a CacheKey,
        item: Bytes,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), BoxError>> {
        Box::pin(async move { self.push(key, item, ttl) })
    }

    fn drop<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<(), BoxError>> {
        Box::pin(async move { self.remove(key) })
    }

    fn is_ready(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> CacheKey {
        CacheKey::new("segment", id)
    }

    #[test]
    fn test_cache_creation() {
        let cache = MemoryCache::from_capacity(10);
        assert_eq!(cache.capacity(), 10);
        assert!(cache.is_empty());
        assert_eq!(MemoryCache::from_capacity(0).capacity(), 1);
    }

    #[tokio::test]
    async fn test_cache_set_and_get() {
        let cache = MemoryCache::from_capacity(3);
        let content = Bytes::from("test content");
        cache.set(&key("a"), content.clone(), Duration::from_secs(60)).await.unwrap();

        let found = cache.get(&key("a")).await.unwrap().unwrap();
        assert_eq!(found.item, content);
        assert!(found.ttl <= Duration::from_secs(60));
        assert!(cache.get(&key("b")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_ttl_expiry() {
        let cache = MemoryCache::from_capacity(3);
        cache.set(&key("a"), Bytes::from("x"), Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get(&key("a")).await.unwrap().is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_cache_lru_eviction() {
        let cache = MemoryCache::from_capacity(2);
        let ttl = Duration::from_secs(60);
        cache.set(&key("1"), Bytes::from("1"), ttl).await.unwrap();
        cache.set(&key("2"), Bytes::from("2"), ttl).await.unwrap();
        cache.get(&key("1")).await.unwrap();
        cache.set(&key("3"), Bytes::from("3"), ttl).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("2")).await.unwrap().is_none());
        assert!(cache.get(&key("1")).await.unwrap().is_some());
        assert!(cache.get(&key("3")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cache_drop_and_segments() {
        let cache = MemoryCache::from_capacity(4);
        let ttl = Duration::from_secs(60);
        cache.set(&CacheKey::new("a", "x"), Bytes::from("a"), ttl).await.unwrap();
        cache.set(&CacheKey::new("b", "x"), Bytes::from("b"), ttl).await.unwrap();

        CacheClient::drop(&cache, &CacheKey::new("a", "x")).await.unwrap();
        assert!(cache.get(&CacheKey::new("a", "x")).await.unwrap().is_none());
        assert_eq!(
            cache.get(&CacheKey::new("b", "x")).await.unwrap().unwrap().item,
            Bytes::from("b")
        );
    }
}
