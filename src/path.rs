// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 路径匹配器
//!
//! 把路由模板（如 `/user/{id}/posts/{tag?}`）编译为按段匹配的结构，并提供：
//! 1. **指纹**：字面量原样保留，单参数记为 `?`，通配记为 `#`，用于检测冲突；
//! 2. **匹配**：按位置逐段比较，提取参数；解码失败返回错误而不是“未匹配”；
//! 3. **排序**：路由间的严格全序，越具体的路由越靠前。
//!
//! ## 模板语法
//! - `literal`：纯字面量
//! - `{name}`：必选单段参数
//! - `{name?}`：可选单段参数，只能出现在最后一段
//! - `{name*}`：任意多段通配，只能出现在最后一段
//! - `{name*N}`：恰好 N 段
//! - `pre{name}post` / `pre{name?}post`：字面量中嵌入一个参数

use std::{
    cmp::{Ordering, Reverse},
    collections::{HashMap, HashSet},
};

use lazy_static::lazy_static;
use regex::Regex;

use crate::{
    exception::Exception,
    util::{decode_uri_component, DecodeError},
};

lazy_static! {
    static ref PARAM: Regex = Regex::new(r"^\{(\w+)(?:(\*)(\d+)?)?(\?)?\}$").unwrap();
    static ref MIXED: Regex = Regex::new(r"^([^{}]*)\{(\w+)(\?)?\}([^{}]*)$").unwrap();
    static ref LITERAL: Regex = Regex::new(r"^[A-Za-z0-9!$&'()*+,;=:@\-._~%]*$").unwrap();
    static ref ENCODED: Regex = Regex::new(r"%([0-9A-Fa-f]{2})").unwrap();
}

/// 模板中的一段
#[derive(Debug, Clone)]
pub enum Segment {
    Literal(String),
    Param {
        name: String,
        optional: bool,
    },
    Mixed {
        pre: String,
        name: String,
        post: String,
        optional: bool,
        regex: Regex,
    },
    Multi {
        name: String,
        count: usize,
    },
    Wildcard {
        name: String,
    },
}

/// 排序键，枚举顺序即具体程度（字面量 > 混合 > 参数 > 通配）
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SortKey {
    Literal(Reverse<usize>, String),
    Mixed(Reverse<usize>, Reverse<usize>, String, String),
    Param,
    Wildcard,
}

/// 匹配结果：参数映射以及按捕获顺序排列的参数值
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathMatch {
    pub params: HashMap<String, String>,
    pub array: Vec<String>,
}

/// 编译完成的路由路径
#[derive(Debug, Clone)]
pub struct CompiledPath {
    template: String,
    segments: Vec<Segment>,
    fingerprint: String,
    alternate: Option<String>,
    params: Vec<String>,
    literal: Option<String>,
    case_sensitive: bool,
    keys: Vec<SortKey>,
    wildcard: bool,
}

fn invalid(path: &str, reason: &str) -> Exception {
    Exception::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"-._~".contains(&byte)
}

/// 把请求路径中被编码的非保留字符还原，其余编码统一为大写十六进制
pub fn normalize(path: &str) -> String {
    if !path.contains('%') {
        return path.to_string();
    }
    ENCODED
        .replace_all(path, |caps: &regex::Captures| {
            let byte = u8::from_str_radix(&caps[1], 16).unwrap_or(0);
            if is_unreserved(byte) {
                (byte as char).to_string()
            } else {
                format!("%{}", caps[1].to_ascii_uppercase())
            }
        })
        .into_owned()
}

impl CompiledPath {
    /// 编译路由模板，语法错误、参数重名、通配/可选段不在末尾时返回配置错误
    pub fn compile(template: &str, case_sensitive: bool) -> Result<Self, Exception> {
        if !template.starts_with('/') {
            return Err(invalid(template, "path must begin with /"));
        }

        for caps in ENCODED.captures_iter(template) {
            let byte = u8::from_str_radix(&caps[1], 16).unwrap_or(0);
            if is_unreserved(byte) || byte == b'/' {
                return Err(invalid(
                    template,
                    "path cannot contain encoded non-reserved characters or encoded slashes",
                ));
            }
        }
        if template.matches('%').count() != ENCODED.find_iter(template).count() {
            return Err(invalid(template, "path contains an incomplete percent-encoding"));
        }

        let pieces: Vec<&str> = template[1..].split('/').collect();
        let last = pieces.len() - 1;
        let mut segments = Vec::with_capacity(pieces.len());
        let mut names = HashSet::new();

        for (i, piece) in pieces.iter().enumerate() {
            let segment = Self::compile_segment(template, piece, i == last, case_sensitive)?;
            let name = match &segment {
                Segment::Literal(_) => None,
                Segment::Param { name, .. }
                | Segment::Mixed { name, .. }
                | Segment::Multi { name, .. }
                | Segment::Wildcard { name } => Some(name.clone()),
            };
            if let Some(name) = name {
                if !names.insert(name.clone()) {
                    return Err(invalid(template, &format!("duplicate parameter name {}", name)));
                }
            }
            segments.push(segment);
        }

        let params = segments
            .iter()
            .filter_map(|s| match s {
                Segment::Literal(_) => None,
                Segment::Param { name, .. }
                | Segment::Mixed { name, .. }
                | Segment::Multi { name, .. }
                | Segment::Wildcard { name } => Some(name.clone()),
            })
            .collect::<Vec<_>>();

        let cased = |s: &str| {
            if case_sensitive {
                s.to_string()
            } else {
                s.to_lowercase()
            }
        };

        let prints: Vec<String> = segments
            .iter()
            .map(|s| match s {
                Segment::Literal(l) => cased(l),
                Segment::Param { .. } => "?".to_string(),
                Segment::Mixed { pre, post, .. } => format!("{}?{}", cased(pre), cased(post)),
                Segment::Multi { count, .. } => vec!["?"; *count].join("/"),
                Segment::Wildcard { .. } => "#".to_string(),
            })
            .collect();
        let fingerprint = format!("/{}", prints.join("/"));

        let alternate = match segments.last() {
            Some(Segment::Param { optional: true, .. }) => {
                Some(format!("/{}", prints[..prints.len() - 1].join("/")))
            }
            _ => None,
        };

        let mut keys = Vec::new();
        for segment in &segments {
            match segment {
                Segment::Literal(l) => keys.push(SortKey::Literal(Reverse(l.len()), cased(l))),
                Segment::Mixed { pre, post, .. } => keys.push(SortKey::Mixed(
                    Reverse(pre.len() + post.len()),
                    Reverse(pre.len()),
                    cased(pre),
                    cased(post),
                )),
                Segment::Param { .. } => keys.push(SortKey::Param),
                Segment::Multi { count, .. } => keys.extend(std::iter::repeat(SortKey::Param).take(*count)),
                Segment::Wildcard { .. } => keys.push(SortKey::Wildcard),
            }
        }

        let literal = if params.is_empty() {
            Some(cased(template))
        } else {
            None
        };
        let wildcard = matches!(segments.last(), Some(Segment::Wildcard { .. }));

        Ok(Self {
            template: template.to_string(),
            segments,
            fingerprint,
            alternate,
            params,
            literal,
            case_sensitive,
            keys,
            wildcard,
        })
    }

    fn compile_segment(
        template: &str,
        piece: &str,
        is_last: bool,
        case_sensitive: bool,
    ) -> Result<Segment, Exception> {
        if !piece.contains('{') && !piece.contains('}') {
            if !LITERAL.is_match(piece) {
                return Err(invalid(template, "path contains invalid characters"));
            }
            return Ok(Segment::Literal(if case_sensitive {
                piece.to_string()
            } else {
                piece.to_lowercase()
            }));
        }

        if let Some(caps) = PARAM.captures(piece) {
            let name = caps[1].to_string();
            let star = caps.get(2).is_some();
            let count = caps.get(3).map(|c| c.as_str());
            let optional = caps.get(4).is_some();

            return match (star, count, optional) {
                (true, _, true) => Err(invalid(template, "wildcard parameters cannot be optional")),
                (true, None, false) => {
                    if !is_last {
                        return Err(invalid(template, "wildcard parameter must be the last segment"));
                    }
                    Ok(Segment::Wildcard { name })
                }
                (true, Some(count), false) => {
                    let count: usize = count
                        .parse()
                        .map_err(|_| invalid(template, "invalid segment count"))?;
                    if count == 0 {
                        return Err(invalid(template, "segment count must be at least 1"));
                    }
                    Ok(Segment::Multi { name, count })
                }
                (false, _, true) => {
                    if !is_last {
                        return Err(invalid(template, "optional parameter must be the last segment"));
                    }
                    Ok(Segment::Param { name, optional: true })
                }
                (false, _, false) => Ok(Segment::Param {
                    name,
                    optional: false,
                }),
            };
        }

        if let Some(caps) = MIXED.captures(piece) {
            let pre = caps[1].to_string();
            let name = caps[2].to_string();
            let optional = caps.get(3).is_some();
            let post = caps[4].to_string();
            if !LITERAL.is_match(&pre) || !LITERAL.is_match(&post) {
                return Err(invalid(template, "path contains invalid characters"));
            }
            let pattern = format!(
                "^{}{}({}){}$",
                if case_sensitive { "" } else { "(?i)" },
                regex::escape(&pre),
                if optional { ".*?" } else { ".+?" },
                regex::escape(&post)
            );
            let regex = Regex::new(&pattern).map_err(|e| invalid(template, &e.to_string()))?;
            return Ok(Segment::Mixed {
                pre,
                name,
                post,
                optional,
                regex,
            });
        }

        Err(invalid(template, &format!("invalid segment {}", piece)))
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// 末段为可选参数时，去掉该段后的替代指纹
    ///
    /// 通配路由没有替代指纹：它与同前缀的字面量路由可以共存，由排序决定优先级。
    pub fn alternate_fingerprint(&self) -> Option<&str> {
        self.alternate.as_deref()
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// 纯字面量路由返回归一化后的完整路径
    pub fn literal(&self) -> Option<&str> {
        self.literal.as_deref()
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// 两个路由是否会匹配同一组请求路径
    pub fn conflicts_with(&self, other: &CompiledPath) -> bool {
        if self.fingerprint == other.fingerprint {
            return true;
        }
        let alt_hit = |a: &CompiledPath, b: &CompiledPath| {
            a.alternate.as_deref() == Some(b.fingerprint.as_str())
        };
        if alt_hit(self, other) || alt_hit(other, self) {
            return true;
        }
        matches!((&self.alternate, &other.alternate), (Some(a), Some(b)) if a == b)
    }

    /// 匹配请求路径，`Ok(None)` 表示未匹配，`Err` 表示参数解码失败
    pub fn match_path(&self, path: &str) -> Result<Option<PathMatch>, DecodeError> {
        if let Some(literal) = &self.literal {
            let hit = if self.case_sensitive {
                literal == path
            } else {
                literal.eq_ignore_ascii_case(path)
            };
            return Ok(if hit { Some(PathMatch::default()) } else { None });
        }

        let Some(rest) = path.strip_prefix('/') else {
            return Ok(None);
        };
        let pieces: Vec<&str> = rest.split('/').collect();
        let Some(captured) = self.capture(&pieces) else {
            return Ok(None);
        };

        let mut matched = PathMatch::default();
        for (name, raw) in captured {
            let value = decode_uri_component(&raw)?;
            matched.array.push(value.clone());
            matched.params.insert(name.to_string(), value);
        }
        Ok(Some(matched))
    }

    fn capture<'a>(&'a self, pieces: &[&str]) -> Option<Vec<(&'a str, String)>> {
        let total = self.keys.len();
        let length_ok = match self.segments.last() {
            Some(Segment::Wildcard { .. }) => pieces.len() + 1 >= total,
            Some(Segment::Param { optional: true, .. }) => {
                pieces.len() == total || pieces.len() + 1 == total
            }
            _ => pieces.len() == total,
        };
        if !length_ok {
            return None;
        }

        let mut out = Vec::with_capacity(self.params.len());
        let mut idx = 0;
        for segment in &self.segments {
            match segment {
                Segment::Literal(l) => {
                    let piece = pieces.get(idx)?;
                    let same = if self.case_sensitive {
                        piece == l
                    } else {
                        piece.eq_ignore_ascii_case(l)
                    };
                    if !same {
                        return None;
                    }
                    idx += 1;
                }
                Segment::Param { name, optional } => match pieces.get(idx) {
                    Some(piece) if !piece.is_empty() => {
                        out.push((name.as_str(), piece.to_string()));
                        idx += 1;
                    }
                    Some(_) if *optional => idx += 1,
                    None if *optional => {}
                    _ => return None,
                },
                Segment::Mixed { name, regex, .. } => {
                    let piece = pieces.get(idx)?;
                    let caps = regex.captures(piece)?;
                    let value = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                    if !value.is_empty() {
                        out.push((name.as_str(), value.to_string()));
                    }
                    idx += 1;
                }
                Segment::Multi { name, count } => {
                    let slice = pieces.get(idx..idx + count)?;
                    if slice.iter().any(|p| p.is_empty()) {
                        return None;
                    }
                    out.push((name.as_str(), slice.join("/")));
                    idx += count;
                }
                Segment::Wildcard { name } => {
                    if idx < pieces.len() {
                        out.push((name.as_str(), pieces[idx..].join("/")));
                    }
                    idx = pieces.len();
                }
            }
        }

        if idx != pieces.len() {
            return None;
        }
        Some(out)
    }
}

/// 路由具体程度的全序：越具体越靠前
///
/// 1. 以通配结尾的路由排在不以通配结尾的路由之后；
/// 2. 逐段比较：字面量先于参数，较长字面量优先，同长按字典序；
///    混合段先于纯参数，混合段之间比较字面量总长、前缀长度、前缀与后缀内容；
/// 3. 其余均相同时段数少者优先。
///
/// 字面量之间的比较只看该段本身，不看两个路由的总段数。不同字面量在同一位置
/// 不可能匹配同一请求路径，这一规则只影响路由表的列出顺序。
///
/// 只有指纹相同的两个路由比较结果才为 `Equal`，而路由表会拒绝这种组合。
pub fn sort(a: &CompiledPath, b: &CompiledPath) -> Ordering {
    (a.wildcard, &a.keys).cmp(&(b.wildcard, &b.keys))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(path: &str) -> CompiledPath {
        CompiledPath::compile(path, true).unwrap()
    }

    #[test]
    fn test_fingerprints() {
        assert_eq!(compile("/").fingerprint(), "/");
        assert_eq!(compile("/user/{id}/posts/{tag?}").fingerprint(), "/user/?/posts/?");
        assert_eq!(compile("/files/{path*}").fingerprint(), "/files/#");
        assert_eq!(compile("/a/{b*2}/c").fingerprint(), "/a/?/?/c");
        assert_eq!(compile("/img/{name}.png").fingerprint(), "/img/?.png");
        assert_eq!(
            CompiledPath::compile("/Users/{id}", false).unwrap().fingerprint(),
            "/users/?"
        );
    }

    #[test]
    fn test_alternate_fingerprint() {
        assert_eq!(compile("/path/{p?}").alternate_fingerprint(), Some("/path"));
        assert_eq!(compile("/{p?}").alternate_fingerprint(), Some("/"));
        assert_eq!(compile("/path/{p*}").alternate_fingerprint(), None);
        assert_eq!(compile("/path/{p}").alternate_fingerprint(), None);
    }

    #[test]
    fn test_compile_errors() {
        assert!(CompiledPath::compile("path", true).is_err());
        assert!(CompiledPath::compile("/{a}/{a}", true).is_err());
        assert!(CompiledPath::compile("/{a*}/b", true).is_err());
        assert!(CompiledPath::compile("/{a?}/b", true).is_err());
        assert!(CompiledPath::compile("/a b", true).is_err());
        assert!(CompiledPath::compile("/a?b", true).is_err());
        assert!(CompiledPath::compile("/%41bc", true).is_err());
        assert!(CompiledPath::compile("/a%2Fb", true).is_err());
        assert!(CompiledPath::compile("/a%2", true).is_err());
        assert!(CompiledPath::compile("/{a}{b}", true).is_err());
        assert!(CompiledPath::compile("/{a*0}", true).is_err());
        assert!(CompiledPath::compile("/{a*?}", true).is_err());
    }

    #[test]
    fn test_match_params() {
        let path = compile("/a/{p}/b/{x}");
        let matched = path.match_path("/a/c/b/d").unwrap().unwrap();
        assert_eq!(matched.params["p"], "c");
        assert_eq!(matched.params["x"], "d");
        assert_eq!(matched.array, vec!["c", "d"]);

        assert!(path.match_path("/a/c/b").unwrap().is_none());
        assert!(path.match_path("/a/c/b/d/e").unwrap().is_none());
        assert!(path.match_path("/a//b/d").unwrap().is_none());
    }

    #[test]
    fn test_match_literal_only() {
        let path = compile("/a/b");
        assert!(path.match_path("/a/b").unwrap().is_some());
        assert!(path.match_path("/a/B").unwrap().is_none());

        let insensitive = CompiledPath::compile("/a/B", false).unwrap();
        assert!(insensitive.match_path("/A/b").unwrap().is_some());
    }

    #[test]
    fn test_match_optional() {
        let path = compile("/book/{id?}");
        assert_eq!(path.match_path("/book/5").unwrap().unwrap().params["id"], "5");
        assert!(path.match_path("/book").unwrap().unwrap().params.is_empty());
        assert!(path.match_path("/book/").unwrap().unwrap().params.is_empty());
        assert!(path.match_path("/book/5/6").unwrap().is_none());
    }

    #[test]
    fn test_match_wildcard() {
        let path = compile("/files/{path*}");
        let matched = path.match_path("/files/a/b/c.txt").unwrap().unwrap();
        assert_eq!(matched.params["path"], "a/b/c.txt");
        assert!(path.match_path("/files").unwrap().unwrap().params.is_empty());
        assert!(path.match_path("/other/a").unwrap().is_none());
    }

    #[test]
    fn test_match_multi() {
        let path = compile("/a/{b*2}/c");
        let matched = path.match_path("/a/x/y/c").unwrap().unwrap();
        assert_eq!(matched.params["b"], "x/y");
        assert!(path.match_path("/a/x/c").unwrap().is_none());
    }

    #[test]
    fn test_match_mixed() {
        let path = compile("/img/{name}.png");
        assert_eq!(path.match_path("/img/cat.png").unwrap().unwrap().params["name"], "cat");
        assert!(path.match_path("/img/.png").unwrap().is_none());
        assert!(path.match_path("/img/cat.gif").unwrap().is_none());

        let optional = compile("/v{version?}");
        assert_eq!(optional.match_path("/v2").unwrap().unwrap().params["version"], "2");
        assert!(optional.match_path("/v").unwrap().unwrap().params.is_empty());
    }

    #[test]
    fn test_match_decode_error_is_not_a_miss() {
        let path = compile("/a/{p}");
        assert_eq!(path.match_path("/a/b%20c").unwrap().unwrap().params["p"], "b c");
        assert!(path.match_path("/a/%zz").is_err());
        // 结构不匹配时不解码，仍然返回未匹配
        assert!(path.match_path("/b/%zz").unwrap().is_none());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/%7Euser/%2f"), "/~user/%2F");
        assert_eq!(normalize("/plain"), "/plain");
    }

    #[test]
    fn test_conflicts() {
        assert!(compile("/path/{p?}").conflicts_with(&compile("/path")));
        assert!(compile("/path").conflicts_with(&compile("/path/{p?}")));
        assert!(compile("/a/{b}").conflicts_with(&compile("/a/{c}")));
        assert!(compile("/a/{b*2}").conflicts_with(&compile("/a/{c}/{d}")));
        assert!(!compile("/a/{p?}").conflicts_with(&compile("/a/{q*}")));
        assert!(!compile("/").conflicts_with(&compile("/{p*}")));
        assert!(!compile("/files").conflicts_with(&compile("/files/{path*}")));
        assert!(!compile("/a/{b}").conflicts_with(&compile("/a/b")));
        assert!(!compile("/a/{b}.png").conflicts_with(&compile("/a/{b}.gif")));
    }

    #[test]
    fn test_sort_order() {
        let ordered = [
            "/path/to/somethings",
            "/path/to/",
            "/path/to/xx{param}",
            "/path/to/a{param}b",
            "/path/to/{param}",
            "/path/to/{param}/between",
            "/path/to/{param*2}",
            "/path/{param}",
            "/",
            "/{param}",
            "/path/to/{param*}",
            "/path/{param*}",
            "/{param*}",
        ];

        let mut shuffled: Vec<CompiledPath> = ordered.iter().rev().map(|p| compile(p)).collect();
        shuffled.sort_by(sort);
        let result: Vec<&str> = shuffled.iter().map(|p| p.template()).collect();
        assert_eq!(result, ordered);
    }

    #[test]
    fn test_sort_literal_ignores_route_length() {
        assert_eq!(sort(&compile("/abc/{p}/y"), &compile("/a/x")), Ordering::Less);
        assert_eq!(sort(&compile("/a/x"), &compile("/abc/{p}/y")), Ordering::Greater);
        assert_eq!(sort(&compile("/ab"), &compile("/ac")), Ordering::Less);
    }

    #[test]
    fn test_sort_is_antisymmetric() {
        let paths = ["/a/{b}", "/a/b", "/a/{b*}", "/{a}/b", "/a/x{b}", "/a/{b}/c"];
        for a in paths.iter() {
            for b in paths.iter() {
                let (pa, pb) = (compile(a), compile(b));
                assert_eq!(sort(&pa, &pb), sort(&pb, &pa).reverse());
                if a != b {
                    assert_ne!(sort(&pa, &pb), Ordering::Equal);
                }
            }
        }
    }
}
