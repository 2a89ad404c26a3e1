// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! CORS 决策：来源匹配（支持 `*` 通配）、预检响应、实际响应的附加头部。

use regex::Regex;

use crate::{header::Headers, http_error::HttpError, param::Method};

const DEFAULT_HEADERS: [&str; 4] = ["Accept", "Authorization", "Content-Type", "If-None-Match"];
const DEFAULT_EXPOSED: [&str; 2] = ["WWW-Authenticate", "Server-Authorization"];

/// 路由级 CORS 配置
#[derive(Debug, Clone)]
pub struct CorsOptions {
    origins: Vec<String>,
    patterns: Vec<Regex>,
    any: bool,
    pub max_age: u64,
    pub headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub credentials: bool,
    pub preflight_status: u16,
}

impl Default for CorsOptions {
    fn default() -> Self {
        Self::new(vec!["*".to_string()])
    }
}

impl CorsOptions {
    pub fn new(origins: Vec<String>) -> Self {
        let any = origins.iter().any(|o| o == "*");
        let patterns = origins
            .iter()
            .filter(|o| o.contains('*') && o.as_str() != "*")
            .filter_map(|o| {
                let escaped = regex::escape(o).replace(r"\*", "[^/]*");
                Regex::new(&format!("^{}$", escaped)).ok()
            })
            .collect();
        Self {
            origins,
            patterns,
            any,
            max_age: 86400,
            headers: DEFAULT_HEADERS.iter().map(|h| h.to_string()).collect(),
            exposed_headers: DEFAULT_EXPOSED.iter().map(|h| h.to_string()).collect(),
            credentials: false,
            preflight_status: 200,
        }
    }

    pub fn with_credentials(mut self, credentials: bool) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_additional_headers(mut self, headers: &[&str]) -> Self {
        self.headers.extend(headers.iter().map(|h| h.to_string()));
        self
    }

    pub fn with_exposed_headers(mut self, headers: &[&str]) -> Self {
        self.exposed_headers.extend(headers.iter().map(|h| h.to_string()));
        self
    }

    pub fn with_max_age(mut self, seconds: u64) -> Self {
        self.max_age = seconds;
        self
    }

    pub fn matches_origin(&self, origin: &str) -> bool {
        self.any
            || self.origins.iter().any(|o| o == origin)
            || self.patterns.iter().any(|p| p.is_match(origin))
    }

    fn allow_origin(&self, origin: &str) -> String {
        if self.any && !self.credentials {
            "*".to_string()
        } else {
            origin.to_string()
        }
    }

    /// 处理 OPTIONS 预检请求，返回需要写入响应的头部
    pub fn preflight(&self, request_headers: &Headers) -> Result<Headers, HttpError> {
        let origin = request_headers
            .get("origin")
            .ok_or_else(|| HttpError::new(404, "CORS error: Missing Origin header"))?;
        if !self.matches_origin(origin) {
            return Err(HttpError::new(404, "CORS error: Origin not allowed"));
        }

        let method = request_headers
            .get("access-control-request-method")
            .ok_or_else(|| HttpError::new(404, "CORS error: Missing Access-Control-Request-Method header"))?;
        let method: Method = method
            .parse()
            .map_err(|_| HttpError::new(404, "CORS error: Unsupported method"))?;

        if let Some(requested) = request_headers.get("access-control-request-headers") {
            let allowed = requested
                .split(',')
                .map(|h| h.trim())
                .filter(|h| !h.is_empty())
                .all(|h| self.headers.iter().any(|a| a.eq_ignore_ascii_case(h)));
            if !allowed {
                return Err(HttpError::new(404, "CORS error: Some headers are not allowed"));
            }
        }

        let mut headers = Headers::new();
        headers.insert("Access-Control-Allow-Origin", self.allow_origin(origin));
        headers.insert("Access-Control-Allow-Methods", method.to_string());
        headers.insert("Access-Control-Allow-Headers", self.headers.join(","));
        headers.insert("Access-Control-Max-Age", self.max_age.to_string());
        if self.credentials {
            headers.insert("Access-Control-Allow-Credentials", "true");
        }
        headers.merge_list("Vary", "origin");
        Ok(headers)
    }

    /// 为普通响应附加 CORS 头部
    pub fn apply(&self, origin: Option<&str>, headers: &mut Headers) {
        if !self.any || self.credentials {
            headers.merge_list("Vary", "origin");
        }
        let Some(origin) = origin else {
            return;
        };
        if !self.matches_origin(origin) {
            return;
        }
        headers.insert("Access-Control-Allow-Origin", self.allow_origin(origin));
        if !self.exposed_headers.is_empty() {
            headers.insert("Access-Control-Expose-Headers", self.exposed_headers.join(","));
        }
        if self.credentials {
            headers.insert("Access-Control-Allow-Credentials", "true");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(pairs: &[(&str, &str)]) -> Headers {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_origin_matching() {
        let cors = CorsOptions::new(vec![
            "https://example.com".to_string(),
            "https://*.example.org".to_string(),
        ]);
        assert!(cors.matches_origin("https://example.com"));
        assert!(cors.matches_origin("https://api.example.org"));
        assert!(!cors.matches_origin("https://example.net"));
        assert!(CorsOptions::default().matches_origin("http://anything"));
    }

    #[test]
    fn test_preflight_success() {
        let cors = CorsOptions::default();
        let headers = cors
            .preflight(&request(&[
                ("Origin", "http://a.com"),
                ("Access-Control-Request-Method", "POST"),
                ("Access-Control-Request-Headers", "content-type"),
            ]))
            .unwrap();
        assert_eq!(headers.get("access-control-allow-origin"), Some("*"));
        assert_eq!(headers.get("access-control-allow-methods"), Some("POST"));
        assert_eq!(headers.get("access-control-max-age"), Some("86400"));
    }

    #[test]
    fn test_preflight_failures() {
        let cors = CorsOptions::new(vec!["http://a.com".to_string()]);
        assert_eq!(cors.preflight(&request(&[])).unwrap_err().status(), 404);
        let err = cors
            .preflight(&request(&[("Origin", "http://b.com"), ("Access-Control-Request-Method", "GET")]))
            .unwrap_err();
        assert_eq!(err.message(), "CORS error: Origin not allowed");
        let err = cors
            .preflight(&request(&[
                ("Origin", "http://a.com"),
                ("Access-Control-Request-Method", "GET"),
                ("Access-Control-Request-Headers", "x-secret"),
            ]))
            .unwrap_err();
        assert_eq!(err.message(), "CORS error: Some headers are not allowed");
    }

    #[test]
    fn test_apply_with_credentials_echoes_origin() {
        let cors = CorsOptions::default().with_credentials(true);
        let mut headers = Headers::new();
        cors.apply(Some("http://a.com"), &mut headers);
        assert_eq!(headers.get("access-control-allow-origin"), Some("http://a.com"));
        assert_eq!(headers.get("access-control-allow-credentials"), Some("true"));
        assert_eq!(headers.get("vary"), Some("origin"));
    }
}
