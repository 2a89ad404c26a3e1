// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 路由表
//!
//! 每个虚拟主机一张表，表内按方法分桶，另有任意方法（`*`）桶。
//! 桶内路由按具体程度排序；纯字面量路由额外建立哈希索引。
//!
//! 查找顺序：
//! 1. 虚拟主机表中的同方法路由，然后是默认表；
//! 2. HEAD 请求回退到 GET 路由；
//! 3. OPTIONS 请求查找 CORS 预检路由；
//! 4. 任意方法路由（先虚拟主机，后默认表）；
//! 5. 内置 404 路由。
//!
//! 路径参数解码失败时转到内置 400 路由。

use std::{collections::HashMap, sync::Arc};

use log::debug;

use crate::{
    exception::Exception,
    param::Method,
    path::{normalize, sort, PathMatch},
    route::{Route, RouteMethod},
};

#[derive(Default)]
struct Bucket {
    routes: Vec<Arc<Route>>,
    /// 字面量路径 -> routes 下标
    literals: HashMap<String, usize>,
}

enum Lookup {
    Miss,
    Hit(Arc<Route>, PathMatch),
    Malformed,
}

impl Bucket {
    fn conflict(&self, route: &Route) -> Option<&Arc<Route>> {
        self.routes
            .iter()
            .find(|existing| existing.path().conflicts_with(route.path()))
    }

    fn add(&mut self, route: Arc<Route>) -> Result<(), Exception> {
        if let Some(existing) = self.conflict(&route) {
            return Err(Exception::ConflictingRoute {
                path: route.path().template().to_string(),
                existing: existing.path().template().to_string(),
            });
        }
        self.routes.push(route);
        self.routes.sort_by(|a, b| sort(a.path(), b.path()));
        self.literals = self
            .routes
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.path().literal().map(|l| (l.to_string(), i)))
            .collect();
        Ok(())
    }

    fn lookup(&self, path: &str, case_sensitive: bool) -> Lookup {
        let key = if case_sensitive {
            path.to_string()
        } else {
            path.to_ascii_lowercase()
        };
        if let Some(&i) = self.literals.get(&key) {
            return Lookup::Hit(self.routes[i].clone(), PathMatch::default());
        }
        for route in &self.routes {
            if route.path().literal().is_some() {
                continue;
            }
            match route.path().match_path(path) {
                Ok(Some(matched)) => return Lookup::Hit(route.clone(), matched),
                Ok(None) => {}
                Err(_) => return Lookup::Malformed,
            }
        }
        Lookup::Miss
    }
}

#[derive(Default)]
struct Table {
    methods: HashMap<Method, Bucket>,
    any: Bucket,
}

impl Table {
    fn bucket_mut(&mut self, method: RouteMethod) -> &mut Bucket {
        match method {
            RouteMethod::Exact(m) => self.methods.entry(m).or_default(),
            RouteMethod::Any => &mut self.any,
        }
    }

    fn buckets_mut(&mut self) -> impl Iterator<Item = &mut Bucket> {
        self.methods.values_mut().chain(std::iter::once(&mut self.any))
    }
}

/// 查找结果
#[derive(Debug, Clone)]
pub struct Resolved {
    pub route: Arc<Route>,
    pub params: PathMatch,
}

pub struct Router {
    default: Table,
    vhosts: HashMap<String, Table>,
    /// 自动注册的 CORS 预检路由
    cors: Bucket,
    not_found: Arc<Route>,
    bad_request: Arc<Route>,
    case_sensitive: bool,
    strip_trailing_slash: bool,
}

impl Router {
    pub fn new(case_sensitive: bool, strip_trailing_slash: bool) -> Result<Self, Exception> {
        Ok(Self {
            default: Table::default(),
            vhosts: HashMap::new(),
            cors: Bucket::default(),
            not_found: Arc::new(Route::not_found()?),
            bad_request: Arc::new(Route::bad_request()?),
            case_sensitive,
            strip_trailing_slash,
        })
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// 添加路由；同一张表同一方法下指纹冲突的路由会被拒绝
    pub fn add(&mut self, route: Route) -> Result<(), Exception> {
        let route = Arc::new(route);
        let method = route.method();
        let hosts = route.settings().vhost.clone();

        if hosts.is_empty() {
            return self.default.bucket_mut(method).add(route);
        }
        // 先检查所有虚拟主机，避免部分添加
        for host in &hosts {
            if let Some(table) = self.vhosts.get_mut(host) {
                if let Some(existing) = table.bucket_mut(method).conflict(&route) {
                    return Err(Exception::ConflictingRoute {
                        path: route.path().template().to_string(),
                        existing: existing.path().template().to_string(),
                    });
                }
            }
        }
        for host in hosts {
            self.vhosts
                .entry(host)
                .or_default()
                .bucket_mut(method)
                .add(route.clone())?;
        }
        Ok(())
    }

    /// 添加 CORS 预检路由，路径已存在时返回 false
    pub fn add_preflight(&mut self, route: Route) -> bool {
        if self.cors.conflict(&route).is_some() {
            return false;
        }
        self.cors.add(Arc::new(route)).is_ok()
    }

    fn normalize_path(&self, path: &str) -> String {
        let mut path = normalize(path);
        if self.strip_trailing_slash && path.len() > 1 && path.ends_with('/') {
            path.pop();
        }
        path
    }

    fn found(&self, lookup: Lookup) -> Option<Resolved> {
        match lookup {
            Lookup::Miss => None,
            Lookup::Hit(route, params) => Some(Resolved { route, params }),
            Lookup::Malformed => Some(Resolved {
                route: self.bad_request.clone(),
                params: PathMatch::default(),
            }),
        }
    }

    fn lookup_method(&self, table: Option<&Table>, method: Method, path: &str) -> Option<Resolved> {
        let bucket = table?.methods.get(&method)?;
        self.found(bucket.lookup(path, self.case_sensitive))
    }

    /// 为请求选择路由
    pub fn resolve(&self, method: Method, path: &str, host: Option<&str>) -> Resolved {
        let path = self.normalize_path(path);
        let vhost = host.and_then(|h| self.vhosts.get(&h.to_ascii_lowercase()));
        let default = Some(&self.default);

        let mut candidates = vec![(vhost, method), (default, method)];
        if method == Method::Head {
            candidates.push((vhost, Method::Get));
            candidates.push((default, Method::Get));
        }
        for (table, method) in candidates {
            if let Some(resolved) = self.lookup_method(table, method, &path) {
                return resolved;
            }
        }

        if method == Method::Options {
            if let Some(resolved) = self.found(self.cors.lookup(&path, self.case_sensitive)) {
                return resolved;
            }
        }

        for table in [vhost, default].into_iter().flatten() {
            if let Some(resolved) = self.found(table.any.lookup(&path, self.case_sensitive)) {
                return resolved;
            }
        }

        debug!("未找到匹配的路由：{} {}", method, path);
        Resolved {
            route: self.not_found.clone(),
            params: PathMatch::default(),
        }
    }

    /// 已注册的全部路由（不含内置路由与预检路由）
    pub fn routes(&self) -> Vec<Arc<Route>> {
        let mut all = Vec::new();
        let tables = std::iter::once(&self.default).chain(self.vhosts.values());
        for table in tables {
            for bucket in table.methods.values().chain(std::iter::once(&table.any)) {
                for route in &bucket.routes {
                    if !all.iter().any(|r| Arc::ptr_eq(r, route)) {
                        all.push(route.clone());
                    }
                }
            }
        }
        all
    }

    /// 对所有路由（含内置路由）执行修改，用于重新计算 cycle
    pub(crate) fn for_each_route_mut(&mut self, mut f: impl FnMut(&mut Route)) {
        let tables = std::iter::once(&mut self.default).chain(self.vhosts.values_mut());
        for table in tables {
            for bucket in table.buckets_mut() {
                for route in bucket.routes.iter_mut() {
                    f(Arc::make_mut(route));
                }
            }
        }
        for route in self.cors.routes.iter_mut() {
            f(Arc::make_mut(route));
        }
        f(Arc::make_mut(&mut self.not_found));
        f(Arc::make_mut(&mut self.bad_request));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        path::CompiledPath,
        route::{handler, RouteSettings},
        toolkit::reply,
    };

    fn make(method: &str, path: &str, vhost: &[&str]) -> Route {
        let settings = RouteSettings {
            vhost: vhost.iter().map(|h| h.to_string()).collect(),
            ..RouteSettings::default()
        };
        Route::new(
            RouteMethod::parse(method).unwrap(),
            CompiledPath::compile(path, true).unwrap(),
            handler(|_req, h| {
                let result = h.proceed();
                reply(async move { result })
            }),
            settings,
            None,
            "test",
        )
    }

    fn router(routes: &[(&str, &str)]) -> Router {
        let mut router = Router::new(true, false).unwrap();
        for (method, path) in routes {
            router.add(make(method, path, &[])).unwrap();
        }
        router
    }

    fn template(resolved: &Resolved) -> &str {
        resolved.route.path().template()
    }

    #[test]
    fn test_most_specific_wins() {
        let r = router(&[
            ("GET", "/{p*}"),
            ("GET", "/a/{p}"),
            ("GET", "/a/b"),
            ("GET", "/a/{p}/c"),
        ]);
        assert_eq!(template(&r.resolve(Method::Get, "/a/b", None)), "/a/b");
        assert_eq!(template(&r.resolve(Method::Get, "/a/x", None)), "/a/{p}");
        assert_eq!(template(&r.resolve(Method::Get, "/a/x/c", None)), "/a/{p}/c");
        let resolved = r.resolve(Method::Get, "/z/y", None);
        assert_eq!(template(&resolved), "/{p*}");
        assert_eq!(resolved.params.params["p"], "z/y");
    }

    #[test]
    fn test_conflicts_rejected() {
        let mut r = router(&[("GET", "/a/{p}")]);
        assert!(matches!(
            r.add(make("GET", "/a/{q}", &[])),
            Err(Exception::ConflictingRoute { .. })
        ));
        assert!(r.add(make("POST", "/a/{q}", &[])).is_ok());
        assert!(r.add(make("GET", "/b/{p?}", &[])).is_ok());
        assert!(r.add(make("GET", "/b", &[])).is_err());
    }

    #[test]
    fn test_head_falls_back_to_get() {
        let r = router(&[("GET", "/page")]);
        assert_eq!(template(&r.resolve(Method::Head, "/page", None)), "/page");
        assert!(r.resolve(Method::Post, "/page", None).route.path().is_wildcard());
    }

    #[test]
    fn test_any_method_bucket() {
        let r = router(&[("*", "/any"), ("GET", "/any")]);
        assert_eq!(r.resolve(Method::Get, "/any", None).route.method(), RouteMethod::Exact(Method::Get));
        assert_eq!(r.resolve(Method::Delete, "/any", None).route.method(), RouteMethod::Any);
    }

    #[test]
    fn test_vhost_preferred() {
        let mut r = router(&[("GET", "/")]);
        r.add(make("GET", "/", &["example.com"])).unwrap();
        let resolved = r.resolve(Method::Get, "/", Some("Example.com"));
        assert_eq!(resolved.route.settings().vhost, vec!["example.com"]);
        let other = r.resolve(Method::Get, "/", Some("other.com"));
        assert!(other.route.settings().vhost.is_empty());
    }

    #[test]
    fn test_bad_encoding_routes_to_400() {
        let r = router(&[("GET", "/a/{p}")]);
        let resolved = r.resolve(Method::Get, "/a/%E0%A4%A", None);
        assert!(Arc::ptr_eq(&resolved.route, &r.bad_request));
    }

    #[test]
    fn test_trailing_slash() {
        let strict = router(&[("GET", "/a")]);
        assert!(Arc::ptr_eq(&strict.resolve(Method::Get, "/a/", None).route, &strict.not_found));

        let mut lenient = Router::new(true, true).unwrap();
        lenient.add(make("GET", "/a", &[])).unwrap();
        assert_eq!(template(&lenient.resolve(Method::Get, "/a/", None)), "/a");
    }

    #[test]
    fn test_preflight_bucket() {
        let mut r = router(&[("GET", "/c")]);
        assert!(r.add_preflight(make("OPTIONS", "/c", &[])));
        assert!(!r.add_preflight(make("OPTIONS", "/c", &[])));
        assert_eq!(template(&r.resolve(Method::Options, "/c", None)), "/c");
    }

    #[test]
    fn test_case_insensitive() {
        let mut r = Router::new(false, false).unwrap();
        let route = Route::new(
            RouteMethod::Exact(Method::Get),
            CompiledPath::compile("/Users/list", false).unwrap(),
            handler(|_req, h| {
                let result = h.proceed();
                reply(async move { result })
            }),
            RouteSettings::default(),
            None,
            "test",
        );
        r.add(route).unwrap();
        assert_eq!(template(&r.resolve(Method::Get, "/USERS/LIST", None)), "/Users/list");
    }
}
