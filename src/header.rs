// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! HTTP 头部集合：保持插入顺序、名称大小写不敏感、允许重复字段（如 `Set-Cookie`）。

use std::fmt;

use crate::param::CRLF;

/// 有序的 HTTP 头部多值映射
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取第一个同名字段的值
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 获取所有同名字段的值
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// 设置字段，覆盖已有的同名字段
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// 追加字段，不影响已有的同名字段
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// 仅在字段不存在时设置
    pub fn insert_if_absent(&mut self, name: &str, value: impl Into<String>) {
        if !self.contains(name) {
            self.entries.push((name.to_string(), value.into()));
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 合并 `Vary` 之类的逗号分隔列表字段，已存在的条目不重复添加
    pub fn merge_list(&mut self, name: &str, item: &str) {
        let existing = self.get(name).map(|v| v.to_string());
        match existing {
            Some(current) => {
                let present = current
                    .split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(item));
                if !present {
                    self.insert(name.to_string(), format!("{},{}", current, item));
                }
            }
            None => self.insert(name.to_string(), item.to_string()),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.append(k, v);
        }
        headers
    }
}

impl fmt::Display for Headers {
    /// 每个字段格式为 `name: value`，以 CRLF 结尾
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.entries {
            write!(f, "{}: {}{}", k, v, CRLF)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_get() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn test_insert_replaces_append_keeps() {
        let mut headers = Headers::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("set-cookie", "b=2");
        assert_eq!(headers.get_all("Set-Cookie").count(), 2);

        headers.insert("Set-Cookie", "c=3");
        assert_eq!(headers.get_all("set-cookie").collect::<Vec<_>>(), vec!["c=3"]);
    }

    #[test]
    fn test_merge_list() {
        let mut headers = Headers::new();
        headers.merge_list("Vary", "origin");
        headers.merge_list("Vary", "accept-encoding");
        headers.merge_list("vary", "Origin");
        assert_eq!(headers.get("vary"), Some("origin,accept-encoding"));
    }

    #[test]
    fn test_display() {
        let headers: Headers = vec![("A", "1"), ("B", "2")].into_iter().collect();
        assert_eq!(headers.to_string(), "A: 1\r\nB: 2\r\n");
    }
}
