// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! 服务器配置：从 TOML 文件读取，所有字段都有默认值。

use std::{fs::File, io::prelude::*, time::Duration};

use log::{error, warn};
use serde_derive::{Deserialize, Serialize};

use crate::exception::Exception;

const DEFAULT_CACHE_CAPACITY: usize = 1000;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RouterConfig {
    pub is_case_sensitive: bool,
    pub strip_trailing_slash: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            is_case_sensitive: true,
            strip_trailing_slash: false,
        }
    }
}

/// 超时设置，单位毫秒，0 表示不限制
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TimeoutConfig {
    pub server_ms: u64,
    pub payload_ms: u64,
    pub head_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            server_ms: 0,
            payload_ms: 10_000,
            head_ms: 10_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PayloadConfig {
    pub max_bytes: usize,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub min_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_bytes: 1024,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Cookie 解析失败时的处理方式
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateFailAction {
    #[default]
    Error,
    Log,
    Ignore,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StateConfig {
    pub parse: bool,
    pub fail_action: StateFailAction,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            parse: true,
            fail_action: StateFailAction::Error,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ResponseConfig {
    pub empty_status_code: u16,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            empty_status_code: 204,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub local: bool,
    pub worker_threads: usize,
    pub router: RouterConfig,
    pub timeout: TimeoutConfig,
    pub payload: PayloadConfig,
    pub compression: CompressionConfig,
    pub cache: CacheConfig,
    pub state: StateConfig,
    pub response: ResponseConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7878,
            local: true,
            worker_threads: 0,
            router: RouterConfig::default(),
            timeout: TimeoutConfig::default(),
            payload: PayloadConfig::default(),
            compression: CompressionConfig::default(),
            cache: CacheConfig::default(),
            state: StateConfig::default(),
            response: ResponseConfig::default(),
        }
    }
}

fn millis(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_millis(value))
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取 TOML 配置文件；文件内容无法解析时记录错误并使用默认配置
    pub fn from_toml(filename: &str) -> Result<Self, Exception> {
        let mut file = File::open(filename)
            .map_err(|e| Exception::Config(format!("no such file {}: {}", filename, e)))?;
        let mut str_val = String::new();
        file.read_to_string(&mut str_val)?;

        let mut raw_config: ServerConfig = match toml::from_str(&str_val) {
            Ok(t) => t,
            Err(e) => {
                error!("无法成功从配置文件构建配置对象，使用默认配置：{}", e);
                ServerConfig::new()
            }
        };
        if raw_config.worker_threads == 0 {
            raw_config.worker_threads = num_cpus::get();
        }
        if raw_config.cache.capacity == 0 {
            warn!(
                "cache.capacity被设置为0，但目前尚不支持禁用缓存，因此该值将被改为{}。",
                DEFAULT_CACHE_CAPACITY
            );
            raw_config.cache.capacity = DEFAULT_CACHE_CAPACITY;
        }
        Ok(raw_config)
    }

    /// 服务端响应期限
    pub fn server_timeout(&self) -> Option<Duration> {
        millis(self.timeout.server_ms)
    }

    /// 读取请求体的期限
    pub fn payload_timeout(&self) -> Option<Duration> {
        millis(self.timeout.payload_ms)
    }

    /// 读取请求头的期限
    pub fn head_timeout(&self) -> Option<Duration> {
        millis(self.timeout.head_ms)
    }

    pub fn worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_from_toml_partial() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "port = 9000\nworker_threads = 2\n[timeout]\nserver_ms = 50\n[router]\nis_case_sensitive = false"
        )
        .unwrap();

        let config = ServerConfig::from_toml(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.server_timeout(), Some(Duration::from_millis(50)));
        assert!(!config.router.is_case_sensitive);
        assert_eq!(config.payload.max_bytes, 1024 * 1024);
        assert_eq!(config.response.empty_status_code, 204);
    }

    #[test]
    fn test_from_toml_invalid_falls_back() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "port = \"not a number\"").unwrap();
        let config = ServerConfig::from_toml(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.port, 7878);
        assert!(config.worker_threads > 0);
    }

    #[test]
    fn test_from_toml_missing_file() {
        assert!(ServerConfig::from_toml("/definitely/not/here.toml").is_err());
    }

    #[test]
    fn test_zero_cache_capacity_replaced() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[cache]\ncapacity = 0\n[state]\nfail_action = \"log\"").unwrap();
        let config = ServerConfig::from_toml(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.cache.capacity, DEFAULT_CACHE_CAPACITY);
        assert_eq!(config.state.fail_action, StateFailAction::Log);
    }

    #[test]
    fn test_zero_timeout_disabled() {
        let config = ServerConfig::new();
        assert_eq!(config.server_timeout(), None);
        assert!(config.payload_timeout().is_some());
    }
}
