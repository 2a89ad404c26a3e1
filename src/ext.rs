// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 扩展点注册表
//!
//! 每个生命周期事件维护一份独立排序的扩展列表。
//! 扩展的分组（group）是注册它的插件名；`before` / `after` 引用其他分组。
//! 每次添加都会重新做拓扑排序，出现环时撤销本次添加并返回错误。
//! 引用不存在的分组会被忽略。

use std::{
    any::Any,
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    future::Future,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use futures_util::future::BoxFuture;

use crate::{
    exception::Exception,
    http_error::BoxError,
    request::Request,
    toolkit::{HandlerResult, Toolkit},
};

/// 生命周期事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    OnRequest,
    OnPreAuth,
    OnCredentials,
    OnPostAuth,
    OnPreHandler,
    OnPostHandler,
    OnPreResponse,
    OnPostResponse,
    OnPreStart,
    OnPostStart,
    OnPreStop,
    OnPostStop,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::OnRequest => "onRequest",
            Event::OnPreAuth => "onPreAuth",
            Event::OnCredentials => "onCredentials",
            Event::OnPostAuth => "onPostAuth",
            Event::OnPreHandler => "onPreHandler",
            Event::OnPostHandler => "onPostHandler",
            Event::OnPreResponse => "onPreResponse",
            Event::OnPostResponse => "onPostResponse",
            Event::OnPreStart => "onPreStart",
            Event::OnPostStart => "onPostStart",
            Event::OnPreStop => "onPreStop",
            Event::OnPostStop => "onPostStop",
        }
    }

    /// 服务器级事件，不关联任何请求
    pub fn is_server(&self) -> bool {
        matches!(
            self,
            Event::OnPreStart | Event::OnPostStart | Event::OnPreStop | Event::OnPostStop
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Event {
    type Err = Exception;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let event = match s {
            "onRequest" => Event::OnRequest,
            "onPreAuth" => Event::OnPreAuth,
            "onCredentials" => Event::OnCredentials,
            "onPostAuth" => Event::OnPostAuth,
            "onPreHandler" => Event::OnPreHandler,
            "onPostHandler" => Event::OnPostHandler,
            "onPreResponse" => Event::OnPreResponse,
            "onPostResponse" => Event::OnPostResponse,
            "onPreStart" => Event::OnPreStart,
            "onPostStart" => Event::OnPostStart,
            "onPreStop" => Event::OnPreStop,
            "onPostStop" => Event::OnPostStop,
            _ => return Err(Exception::InvalidOperation(format!("Unknown event {}", s))),
        };
        Ok(event)
    }
}

pub type ExtMethod = Arc<
    dyn for<'a> Fn(&'a mut Request, &'a Toolkit) -> BoxFuture<'a, HandlerResult> + Send + Sync,
>;

pub type ServerExtMethod = Arc<dyn Fn() -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

#[derive(Clone)]
pub enum ExtFunc {
    Request(ExtMethod),
    Server(ServerExtMethod),
}

impl ExtFunc {
    /// 请求级扩展
    pub fn request<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut Request, &'a Toolkit) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        ExtFunc::Request(Arc::new(f))
    }

    /// 服务器级扩展（onPreStart 等）
    pub fn server<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        ExtFunc::Server(Arc::new(move || -> BoxFuture<'static, Result<(), BoxError>> {
            Box::pin(f())
        }))
    }
}

/// 扩展注册选项
#[derive(Clone, Default)]
pub struct ExtOptions {
    pub before: Vec<String>,
    pub after: Vec<String>,
    pub timeout: Option<Duration>,
    pub bind: Option<Arc<dyn Any + Send + Sync>>,
    pub name: Option<String>,
}

impl ExtOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before(mut self, group: &str) -> Self {
        self.before.push(group.to_string());
        self
    }

    pub fn after(mut self, group: &str) -> Self {
        self.after.push(group.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn bind<T: Any + Send + Sync>(mut self, context: T) -> Self {
        self.bind = Some(Arc::new(context));
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

pub struct ExtNode {
    pub(crate) func: ExtFunc,
    pub(crate) realm: String,
    pub(crate) before: Vec<String>,
    pub(crate) after: Vec<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) bind: Option<Arc<dyn Any + Send + Sync>>,
    pub(crate) name: String,
}

impl ExtNode {
    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Default)]
struct EventList {
    /// 注册顺序
    added: Vec<Arc<ExtNode>>,
    sorted: Vec<Arc<ExtNode>>,
}

#[derive(Default)]
pub struct ExtRegistry {
    events: HashMap<Event, EventList>,
}

impl ExtRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        event: Event,
        func: ExtFunc,
        realm: &str,
        options: ExtOptions,
    ) -> Result<(), Exception> {
        match (&func, event.is_server()) {
            (ExtFunc::Request(_), true) | (ExtFunc::Server(_), false) => {
                return Err(Exception::InvalidOperation(format!(
                    "Extension function type does not match event {}",
                    event
                )))
            }
            _ => {}
        }

        let list = self.events.entry(event).or_default();
        let node = ExtNode {
            func,
            realm: realm.to_string(),
            before: options.before,
            after: options.after,
            timeout: options.timeout,
            bind: options.bind,
            name: options
                .name
                .unwrap_or_else(|| format!("{}[{}]", event, list.added.len())),
        };
        list.added.push(Arc::new(node));

        match topo_sort(event, &list.added) {
            Ok(sorted) => {
                list.sorted = sorted;
                Ok(())
            }
            Err(e) => {
                list.added.pop();
                Err(e)
            }
        }
    }

    /// 按执行顺序排列的扩展
    pub fn nodes(&self, event: Event) -> &[Arc<ExtNode>] {
        self.events
            .get(&event)
            .map(|list| list.sorted.as_slice())
            .unwrap_or(&[])
    }

    pub fn has(&self, event: Event) -> bool {
        !self.nodes(event).is_empty()
    }
}

/// Kahn 拓扑排序，无约束的节点保持注册顺序
fn topo_sort(event: Event, nodes: &[Arc<ExtNode>]) -> Result<Vec<Arc<ExtNode>>, Exception> {
    let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        groups.entry(node.realm.as_str()).or_default().push(i);
    }

    let mut edges: HashSet<(usize, usize)> = HashSet::new();
    for (i, node) in nodes.iter().enumerate() {
        for group in &node.before {
            if group == &node.realm {
                return Err(Exception::CyclicExtensions {
                    event: event.to_string(),
                    detail: format!("{} cannot come before itself", node.realm),
                });
            }
            for &j in groups.get(group.as_str()).into_iter().flatten() {
                edges.insert((i, j));
            }
        }
        for group in &node.after {
            if group == &node.realm {
                return Err(Exception::CyclicExtensions {
                    event: event.to_string(),
                    detail: format!("{} cannot come after itself", node.realm),
                });
            }
            for &j in groups.get(group.as_str()).into_iter().flatten() {
                edges.insert((j, i));
            }
        }
    }

    let mut incoming = vec![0usize; nodes.len()];
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for &(from, to) in &edges {
        incoming[to] += 1;
        outgoing[from].push(to);
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| incoming[i] == 0).collect();
    let mut sorted = Vec::with_capacity(nodes.len());
    while let Some(i) = ready.pop_first() {
        sorted.push(nodes[i].clone());
        for &to in &outgoing[i] {
            incoming[to] -= 1;
            if incoming[to] == 0 {
                ready.insert(to);
            }
        }
    }

    if sorted.len() != nodes.len() {
        let stuck: Vec<&str> = (0..nodes.len())
            .filter(|&i| incoming[i] > 0)
            .map(|i| nodes[i].realm.as_str())
            .collect();
        return Err(Exception::CyclicExtensions {
            event: event.to_string(),
            detail: format!("cyclic ordering between {}", stuck.join(", ")),
        });
    }
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolkit::reply;

    fn noop() -> ExtFunc {
        ExtFunc::request(|_req, h| {
            let result = h.proceed();
            reply(async move { result })
        })
    }

    fn order(registry: &ExtRegistry) -> Vec<String> {
        registry
            .nodes(Event::OnPreAuth)
            .iter()
            .map(|n| n.name().to_string())
            .collect()
    }

    #[test]
    fn test_insertion_order_without_constraints() {
        let mut registry = ExtRegistry::new();
        registry.add(Event::OnPreAuth, noop(), "a", ExtOptions::new().name("1")).unwrap();
        registry.add(Event::OnPreAuth, noop(), "b", ExtOptions::new().name("2")).unwrap();
        registry.add(Event::OnPreAuth, noop(), "a", ExtOptions::new().name("3")).unwrap();
        assert_eq!(order(&registry), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_before_and_after() {
        let mut registry = ExtRegistry::new();
        registry.add(Event::OnPreAuth, noop(), "a", ExtOptions::new().name("a1")).unwrap();
        registry
            .add(Event::OnPreAuth, noop(), "b", ExtOptions::new().name("b1").before("a"))
            .unwrap();
        registry
            .add(Event::OnPreAuth, noop(), "c", ExtOptions::new().name("c1").after("d"))
            .unwrap();
        registry.add(Event::OnPreAuth, noop(), "d", ExtOptions::new().name("d1")).unwrap();
        assert_eq!(order(&registry), vec!["b1", "a1", "d1", "c1"]);
    }

    #[test]
    fn test_missing_group_is_ignored() {
        let mut registry = ExtRegistry::new();
        registry
            .add(Event::OnPreAuth, noop(), "a", ExtOptions::new().name("a1").after("ghost"))
            .unwrap();
        assert_eq!(order(&registry), vec!["a1"]);
    }

    #[test]
    fn test_cycle_is_rejected_and_rolled_back() {
        let mut registry = ExtRegistry::new();
        registry
            .add(Event::OnPreAuth, noop(), "a", ExtOptions::new().name("a1").before("b"))
            .unwrap();
        let err = registry
            .add(Event::OnPreAuth, noop(), "b", ExtOptions::new().name("b1").before("a"))
            .unwrap_err();
        assert!(matches!(err, Exception::CyclicExtensions { .. }));
        assert_eq!(order(&registry), vec!["a1"]);
    }

    #[test]
    fn test_self_reference_is_rejected() {
        let mut registry = ExtRegistry::new();
        let err = registry
            .add(Event::OnPreAuth, noop(), "a", ExtOptions::new().before("a"))
            .unwrap_err();
        assert!(matches!(err, Exception::CyclicExtensions { .. }));
        assert!(!registry.has(Event::OnPreAuth));
    }

    #[test]
    fn test_function_kind_must_match_event() {
        let mut registry = ExtRegistry::new();
        assert!(registry.add(Event::OnPreStart, noop(), "a", ExtOptions::new()).is_err());
        let server = ExtFunc::server(|| async { Ok(()) });
        assert!(registry
            .add(Event::OnPreAuth, server.clone(), "a", ExtOptions::new())
            .is_err());
        assert!(registry.add(Event::OnPreStart, server, "a", ExtOptions::new()).is_ok());
    }

    #[test]
    fn test_event_names_round_trip() {
        assert_eq!("onPreResponse".parse::<Event>().unwrap(), Event::OnPreResponse);
        assert!("onSomething".parse::<Event>().is_err());
        assert!(Event::OnPostStop.is_server());
    }
}
