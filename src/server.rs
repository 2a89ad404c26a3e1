// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 服务器
//!
//! [`Server`] 负责注册（路由、扩展、认证、cookie、服务器方法、插件）与运行（监听、停机、注入请求）。
//! 所有注册表放在 [`Core`] 中，开始监听后以 `Arc` 共享给各连接，只读访问，不再加锁。
//! 因此注册只能在服务器没有被监听循环或进行中的请求共享时进行，否则返回
//! [`Exception::ServerStarted`]。
//!
//! 连接层实现了 HTTP/1.1 的一个子集：每个连接只处理一个请求，响应带 `Connection: close`；
//! 请求体只支持 `Content-Length`，分块编码的请求返回 411。

use std::{
    io::Cursor,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{broadcast, watch},
    task::JoinHandle,
};

use crate::{
    auth::{AuthConfig, AuthRegistry, AuthSetting, SchemeFactory},
    cache::{CacheClient, MemoryCache},
    config::ServerConfig,
    exception::Exception,
    ext::{Event, ExtFunc, ExtOptions, ExtRegistry},
    header::Headers,
    http_error::{BoxError, HttpError},
    lifecycle::{self, Outcome, Shared},
    methods::{MethodOptions, MethodRegistry},
    param::{status_text, HttpVersion, Method, CRLF, SERVER_NAME},
    path::CompiledPath,
    payload::Body,
    request::{Request, RequestHead},
    response::Response,
    route::{handler, Route, RouteConfig, RouteMethod, RouteSettings},
    router::Router,
    state::{StateDefinition, StateRegistry},
    toolkit::reply,
    util::generate_request_id,
};

/// 请求头最大长度
const MAX_HEAD_BYTES: usize = 16 * 1024;
/// 停机时等待进行中连接的上限
const STOP_GRACE: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 1024;

/// 服务器广播的事件
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Started { address: SocketAddr },
    Stopped,
    /// 响应已发出
    Response {
        id: String,
        method: Method,
        path: String,
        status: u16,
        elapsed_ms: u64,
    },
    /// 请求的全部后台任务已完成
    Tail { id: String },
    RequestLog {
        id: String,
        tags: Vec<String>,
        data: Value,
    },
    /// 客户端在响应前断开
    Aborted { id: String },
}

#[derive(Debug, Clone)]
struct PluginRecord {
    name: String,
    dependencies: Vec<String>,
}

/// 插件：把一组注册打包，注册内容归属于插件名（realm）
pub trait Plugin {
    fn name(&self) -> &str;

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn register(&self, server: &mut Server) -> Result<(), Exception>;
}

/// 服务器的全部注册表与配置
pub struct Core {
    pub(crate) config: ServerConfig,
    pub(crate) router: Router,
    pub(crate) exts: ExtRegistry,
    pub(crate) auth: AuthRegistry,
    pub(crate) states: StateRegistry,
    pub(crate) methods: MethodRegistry,
    pub(crate) cache: Arc<dyn CacheClient>,
    pub(crate) events: broadcast::Sender<ServerEvent>,
    plugins: Vec<PluginRecord>,
    connections: AtomicUsize,
}

impl Core {
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// 当前活跃连接数
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn rebuild_cycles(&mut self) {
        let Core {
            router,
            exts,
            config,
            ..
        } = self;
        router.for_each_route_mut(|route| route.build_cycle(exts, config.state.parse));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Initialized,
    Started,
    Stopped,
}

pub struct Server {
    core: Arc<Core>,
    realm: String,
    phase: Phase,
    shutdown: Option<watch::Sender<bool>>,
    accept: Option<JoinHandle<()>>,
    address: Option<SocketAddr>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self, Exception> {
        let router = Router::new(
            config.router.is_case_sensitive,
            config.router.strip_trailing_slash,
        )?;
        let cache: Arc<dyn CacheClient> = Arc::new(MemoryCache::from_capacity(config.cache.capacity));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut core = Core {
            config,
            router,
            exts: ExtRegistry::new(),
            auth: AuthRegistry::new(),
            states: StateRegistry::new(),
            methods: MethodRegistry::new(),
            cache,
            events,
            plugins: Vec::new(),
            connections: AtomicUsize::new(0),
        };
        core.rebuild_cycles();
        Ok(Self {
            core: Arc::new(core),
            realm: "server".to_string(),
            phase: Phase::Created,
            shutdown: None,
            accept: None,
            address: None,
        })
    }

    fn core_mut(&mut self) -> Result<&mut Core, Exception> {
        if self.phase == Phase::Started {
            return Err(Exception::ServerStarted);
        }
        Arc::get_mut(&mut self.core).ok_or(Exception::ServerStarted)
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn config(&self) -> &ServerConfig {
        &self.core.config
    }

    /// 当前注册归属的插件名
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// 监听地址，启动后可用
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// 替换缓存后端
    pub fn set_cache(&mut self, cache: Arc<dyn CacheClient>) -> Result<(), Exception> {
        self.core_mut()?.cache = cache;
        Ok(())
    }

    pub fn route(&mut self, config: RouteConfig) -> Result<(), Exception> {
        let realm = self.realm.clone();
        let core = self.core_mut()?;
        let method = RouteMethod::parse(&config.method)?;
        let path = CompiledPath::compile(&config.path, core.config.router.is_case_sensitive)?;
        let auth = core.auth.resolve(&config.settings.auth)?;
        let cors = config.settings.cors.clone();

        let mut route = Route::new(method, path.clone(), config.handler, config.settings, auth, &realm);
        route.build_cycle(&core.exts, core.config.state.parse);
        core.router.add(route)?;
        info!("路由已注册：{} {}（{}）", method, path.template(), realm);

        if let Some(cors) = cors {
            let preflight = handler(move |request, _h| {
                let cors = cors.clone();
                reply(async move {
                    let headers = cors.preflight(request.headers())?;
                    let mut response = Response::empty().code(cors.preflight_status);
                    for (name, value) in headers.iter() {
                        response = response.header(name, value);
                    }
                    Ok(response.into())
                })
            });
            let settings = RouteSettings {
                auth: AuthSetting::Disabled,
                ..RouteSettings::default()
            };
            let mut route = Route::new(RouteMethod::Exact(Method::Options), path, preflight, settings, None, &realm);
            route.build_cycle(&core.exts, core.config.state.parse);
            if core.router.add_preflight(route) {
                debug!("已为路由添加CORS预检");
            }
        }
        Ok(())
    }

    /// 注册扩展，之后所有路由重新计算步骤
    pub fn ext(&mut self, event: Event, func: ExtFunc, options: ExtOptions) -> Result<(), Exception> {
        let realm = self.realm.clone();
        let core = self.core_mut()?;
        core.exts.add(event, func, &realm, options)?;
        core.rebuild_cycles();
        debug!("扩展已注册：{}（{}）", event, realm);
        Ok(())
    }

    pub fn auth_scheme(&mut self, name: &str, factory: SchemeFactory) -> Result<(), Exception> {
        self.core_mut()?.auth.scheme(name, factory)
    }

    pub fn auth_strategy(&mut self, name: &str, scheme: &str, options: Value) -> Result<(), Exception> {
        let realm = self.realm.clone();
        self.core_mut()?.auth.strategy(name, scheme, &options, &realm)
    }

    /// 设置默认认证，只影响之后注册的路由
    pub fn auth_default(&mut self, config: AuthConfig) -> Result<(), Exception> {
        self.core_mut()?.auth.set_default(config)
    }

    pub fn state(&mut self, name: &str, definition: StateDefinition) -> Result<(), Exception> {
        self.core_mut()?.states.add(name, definition)
    }

    pub fn method<F, Fut>(&mut self, name: &str, f: F, options: MethodOptions) -> Result<(), Exception>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        self.core_mut()?.methods.add(name, f, options)
    }

    pub async fn call_method(&self, name: &str, args: Value) -> Result<Value, HttpError> {
        self.core.methods.call(self.core.cache.as_ref(), name, args).await
    }

    pub async fn invalidate_method(&self, name: &str, args: &Value) -> Result<(), Exception> {
        self.core.methods.invalidate(self.core.cache.as_ref(), name, args).await
    }

    pub fn register(&mut self, plugin: &dyn Plugin) -> Result<(), Exception> {
        let name = plugin.name().to_string();
        if self.core.plugins.iter().any(|p| p.name == name) {
            return Err(Exception::Duplicate { kind: "plugin", name });
        }

        let previous = std::mem::replace(&mut self.realm, name.clone());
        let result = plugin.register(self);
        self.realm = previous;
        result?;

        self.core_mut()?.plugins.push(PluginRecord {
            name: name.clone(),
            dependencies: plugin.dependencies(),
        });
        info!("插件{}注册完成", name);
        Ok(())
    }

    /// 订阅服务器事件
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.core.events.subscribe()
    }

    /// 已注册的路由
    pub fn table(&self) -> Vec<Arc<Route>> {
        self.core.router.routes()
    }

    async fn run_server_ext(&self, event: Event) -> Result<(), Exception> {
        for node in self.core.exts.nodes(event) {
            let ExtFunc::Server(func) = &node.func else {
                continue;
            };
            let outcome = match node.timeout {
                Some(limit) => match tokio::time::timeout(limit, func()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(format!("timed out after {}ms", limit.as_millis()).into()),
                },
                None => func().await,
            };
            if let Err(e) = outcome {
                error!("{} 扩展{}执行失败：{}", event, node.name(), e);
                return Err(Exception::InvalidOperation(format!("{} failed: {}", node.name(), e)));
            }
        }
        Ok(())
    }

    /// 检查插件依赖并执行 onPreStart
    pub async fn initialize(&mut self) -> Result<(), Exception> {
        if self.phase != Phase::Created {
            return Ok(());
        }
        for plugin in &self.core.plugins {
            for dependency in &plugin.dependencies {
                if !self.core.plugins.iter().any(|p| &p.name == dependency) {
                    return Err(Exception::MissingDependency {
                        plugin: plugin.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }
        self.run_server_ext(Event::OnPreStart).await?;
        self.phase = Phase::Initialized;
        info!("服务器初始化完成");
        Ok(())
    }

    /// 按配置绑定地址并开始监听
    pub async fn start(&mut self) -> Result<SocketAddr, Exception> {
        // 支持全地址监听 (0.0.0.0) 或本地回环监听 (127.0.0.1)
        let address = match self.core.config.local {
            true => Ipv4Addr::new(127, 0, 0, 1),
            false => Ipv4Addr::new(0, 0, 0, 0),
        };
        let port = self.core.config.port;
        let listener = TcpListener::bind(SocketAddrV4::new(address, port)).await.map_err(|e| {
            error!("无法绑定端口：{}，错误：{}", port, e);
            e
        })?;
        info!("端口{}绑定完成", port);
        self.listen(listener).await
    }

    /// 在已绑定的监听器上开始服务
    pub async fn listen(&mut self, listener: TcpListener) -> Result<SocketAddr, Exception> {
        if self.phase == Phase::Started {
            return Err(Exception::ServerStarted);
        }
        self.initialize().await?;

        let address = listener.local_addr()?;
        let (shutdown, stop) = watch::channel(false);
        self.accept = Some(tokio::spawn(accept_loop(self.core.clone(), listener, stop)));
        self.shutdown = Some(shutdown);
        self.address = Some(address);
        self.phase = Phase::Started;
        info!("服务端在{}上监听Socket连接", address);
        let _ = self.core.events.send(ServerEvent::Started { address });

        self.run_server_ext(Event::OnPostStart).await?;
        Ok(address)
    }

    /// onPreStop、停止接受连接、等待进行中的连接、onPostStop
    pub async fn stop(&mut self) -> Result<(), Exception> {
        if self.phase != Phase::Started {
            return Err(Exception::InvalidOperation("Server is not started".to_string()));
        }
        self.run_server_ext(Event::OnPreStop).await?;

        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send_replace(true);
        }
        if let Some(accept) = self.accept.take() {
            if let Err(e) = accept.await {
                error!("监听任务异常退出：{}", e);
            }
        }
        let waiting = async {
            while self.core.connections() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        if tokio::time::timeout(STOP_GRACE, waiting).await.is_err() {
            warn!("仍有{}个连接未结束，强制停机", self.core.connections());
        }

        self.phase = Phase::Stopped;
        self.address = None;
        let _ = self.core.events.send(ServerEvent::Stopped);
        info!("服务器已停止");
        self.run_server_ext(Event::OnPostStop).await
    }

    /// 不经过网络，直接在内存中执行一次完整请求
    pub async fn inject(&self, options: InjectRequest) -> Result<InjectResponse, Exception> {
        let method: Method = options.method.parse()?;
        let mut headers = options.headers;
        headers.insert_if_absent("host", "localhost");
        let length = options.payload.len() as u64;
        if length > 0 {
            headers.insert_if_absent("content-length", length.to_string());
        }

        let head = RequestHead {
            method,
            target: options.url,
            version: HttpVersion::V1_1,
            headers,
        };
        let shared = Shared::new(generate_request_id(), self.core.events.clone());
        let body = (length > 0).then(|| Body::new(Cursor::new(options.payload.to_vec()), Some(length)));
        let request = Request::new(head, body, options.remote, shared.clone());

        if let Some(delay) = options.abort_after {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                shared.bail();
            });
        }

        let mut output = Vec::new();
        match lifecycle::run(self.core.clone(), request, &mut output).await {
            Outcome::Sent(_) => InjectResponse::parse(&output),
            _ => Ok(InjectResponse {
                status: 499,
                headers: Headers::new(),
                payload: Bytes::new(),
            }),
        }
    }
}

/// 注入请求
#[derive(Debug, Clone)]
pub struct InjectRequest {
    method: String,
    url: String,
    headers: Headers,
    payload: Bytes,
    remote: Option<SocketAddr>,
    abort_after: Option<Duration>,
}

impl InjectRequest {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_string(),
            url: url.to_string(),
            headers: Headers::new(),
            payload: Bytes::new(),
            remote: None,
            abort_after: None,
        }
    }

    pub fn get(url: &str) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: &str, payload: impl Into<Bytes>) -> Self {
        Self::new("POST", url).payload(payload)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn remote(mut self, remote: SocketAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    /// 模拟客户端在指定时间后断开
    pub fn abort_after(mut self, delay: Duration) -> Self {
        self.abort_after = Some(delay);
        self
    }
}

/// 注入请求得到的响应，客户端断开时状态码为 499
#[derive(Debug, Clone)]
pub struct InjectResponse {
    pub status: u16,
    pub headers: Headers,
    pub payload: Bytes,
}

impl InjectResponse {
    fn parse(raw: &[u8]) -> Result<Self, Exception> {
        let malformed = |reason: &str| Exception::MalformedRequest(format!("injected response {}", reason));
        let split = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or_else(|| malformed("has no header terminator"))?;
        let head = std::str::from_utf8(&raw[..split]).map_err(|_| malformed("head is not UTF-8"))?;
        let mut lines = head.split(CRLF);

        let status = lines
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| malformed("has an invalid status line"))?;
        let mut headers = Headers::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.append(name.trim(), value.trim());
            }
        }

        let body = &raw[split + 4..];
        let chunked = headers
            .get("transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
        let payload = match chunked {
            true => dechunk(body).ok_or_else(|| malformed("has a broken chunked body"))?,
            false => body.to_vec(),
        };
        Ok(Self {
            status,
            headers,
            payload: Bytes::from(payload),
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

fn dechunk(mut data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let end = data.windows(2).position(|w| w == b"\r\n")?;
        let size = usize::from_str_radix(std::str::from_utf8(&data[..end]).ok()?.trim(), 16).ok()?;
        data = data.get(end + 2..)?;
        if size == 0 {
            return Some(out);
        }
        out.extend_from_slice(data.get(..size)?);
        data = data.get(size + 2..)?;
    }
}

async fn accept_loop(core: Arc<Core>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            _ = stop.changed() => {
                info!("监听循环接收到停机指令，正在退出...");
                break;
            }
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("接受TCP连接失败：{}", e);
                continue;
            }
        };
        debug!("新的连接：{}", remote);

        // 为每个连接克隆资源句柄（Arc 引用计数增加）
        let core = core.clone();
        core.connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            handle_connection(&core, stream, remote).await;
            core.connections.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

/// 读取请求头，直到空行；连接在发送任何内容前关闭时返回 None
async fn read_head<R>(reader: &mut R, id: &str) -> Result<Option<Vec<u8>>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffer = Vec::new();
    loop {
        let remaining = (MAX_HEAD_BYTES + 1).saturating_sub(buffer.len()) as u64;
        let read = match (&mut *reader).take(remaining).read_until(b'\n', &mut buffer).await {
            Ok(read) => read,
            Err(e) => {
                error!("[ID{}]读取TCPStream时遇到错误: {}", id, e);
                return Ok(None);
            }
        };
        if buffer.len() > MAX_HEAD_BYTES {
            return Err(HttpError::new(431, "Request Header Fields Too Large"));
        }
        if read == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(HttpError::bad_request("Incomplete request head"));
        }
        if buffer.ends_with(b"\r\n\r\n") || buffer.ends_with(b"\n\n") {
            return Ok(Some(buffer));
        }
    }
}

/// 生命周期之外的错误响应（请求头无法解析等）
async fn reject<W>(writer: &mut W, err: HttpError, id: &str)
where
    W: AsyncWrite + Unpin,
{
    let body = err.output_payload().to_string();
    let response = format!(
        "{} {} {}{}Content-Type: application/json; charset=utf-8{}Content-Length: {}{}Server: {}{}Connection: close{}{}{}",
        HttpVersion::V1_1,
        err.status(),
        status_text(err.status()),
        CRLF,
        CRLF,
        body.len(),
        CRLF,
        SERVER_NAME,
        CRLF,
        CRLF,
        CRLF,
        body
    );
    if let Err(e) = writer.write_all(response.as_bytes()).await {
        warn!("[ID{}]发送错误响应失败：{}", id, e);
    }
    let _ = writer.shutdown().await;
}

/// # 连接处理器
///
/// 读取并解析请求头，构造请求后交给生命周期处理。
async fn handle_connection(core: &Arc<Core>, stream: TcpStream, remote: SocketAddr) {
    let id = generate_request_id();
    debug!("[ID{}]TCP连接已建立", id);
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let reading = read_head(&mut reader, &id);
    let raw = match core.config.head_timeout() {
        Some(limit) => match tokio::time::timeout(limit, reading).await {
            Ok(raw) => raw,
            Err(_) => {
                debug!("[ID{}]读取请求头超时", id);
                return reject(&mut write_half, HttpError::client_timeout(), &id).await;
            }
        },
        None => reading.await,
    };
    let raw = match raw {
        Ok(Some(raw)) => raw,
        Ok(None) => return,
        Err(err) => return reject(&mut write_half, err, &id).await,
    };

    let head = match RequestHead::try_from(&raw, &id) {
        Ok(head) => head,
        Err(Exception::UnsupportedHttpVersion) => {
            return reject(&mut write_half, HttpError::new(505, "HTTP Version Not Supported"), &id).await
        }
        Err(e) => {
            warn!("[ID{}]解析HTTP请求失败，返回400: {}", id, e);
            return reject(&mut write_half, HttpError::bad_request("Bad Request"), &id).await;
        }
    };
    debug!("[ID{}]成功解析HTTP请求", id);

    if head.headers.contains("transfer-encoding") {
        debug!("[ID{}]不支持分块请求体，返回411", id);
        return reject(&mut write_half, HttpError::length_required(), &id).await;
    }

    let shared = Shared::new(id.clone(), core.events.clone());
    let (body, watcher) = match head.content_length() {
        Some(length) if length > 0 => (Some(Body::new(reader.take(length), Some(length))), None),
        _ => {
            // 没有请求体时监听连接：读取出错视为客户端断开，
            // EOF 只表示客户端半关闭了写端，仍然需要回复
            let shared = shared.clone();
            let watcher = tokio::spawn(async move {
                let mut probe = [0u8; 512];
                loop {
                    match reader.read(&mut probe).await {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!("[ID{}]连接读取出错，视为客户端断开：{}", shared.id(), e);
                            shared.bail();
                            break;
                        }
                    }
                }
            });
            (None, Some(watcher))
        }
    };

    let request = Request::new(head, body, Some(remote), shared);
    let outcome = lifecycle::run(core.clone(), request, &mut write_half).await;
    if let Some(watcher) = watcher {
        watcher.abort();
    }
    debug!("[ID{}]连接处理结束：{:?}", id, outcome);
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello() -> RouteConfig {
        RouteConfig::new("GET", "/hello", |_req, h| {
            reply(async move { Ok(h.response("hello").into()) })
        })
    }

    struct Named(&'static str, Vec<String>);

    impl Plugin for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn dependencies(&self) -> Vec<String> {
            self.1.clone()
        }

        fn register(&self, server: &mut Server) -> Result<(), Exception> {
            assert_eq!(server.realm(), self.0);
            Ok(())
        }
    }

    #[test]
    fn test_dechunk() {
        assert_eq!(dechunk(b"3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n"), Some(b"abcde".to_vec()));
        assert_eq!(dechunk(b"zz\r\n"), None);
        assert_eq!(dechunk(b"5\r\nab"), None);
    }

    #[test]
    fn test_inject_response_parse() {
        let raw = b"HTTP/1.1 201 Created\r\nContent-Type: text/plain\r\nX-A: 1\r\n\r\nbody";
        let response = InjectResponse::parse(raw).unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.headers.get("x-a"), Some("1"));
        assert_eq!(response.text(), "body");
        assert!(InjectResponse::parse(b"garbage").is_err());
    }

    #[tokio::test]
    async fn test_read_head_limits() {
        let mut ok = BufReader::new(&b"GET / HTTP/1.1\r\nHost: a\r\n\r\nrest"[..]);
        let head = read_head(&mut ok, "0").await.unwrap().unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));

        let mut empty = BufReader::new(&b""[..]);
        assert!(read_head(&mut empty, "0").await.unwrap().is_none());

        let huge = format!("GET / HTTP/1.1\r\nX: {}\r\n\r\n", "a".repeat(MAX_HEAD_BYTES));
        let mut big = BufReader::new(huge.as_bytes());
        assert_eq!(read_head(&mut big, "0").await.unwrap_err().status(), 431);
    }

    #[tokio::test]
    async fn test_registration_after_share_fails() {
        let mut server = Server::new(ServerConfig::default()).unwrap();
        server.route(hello()).unwrap();
        let held = server.core.clone();
        assert!(matches!(server.route(hello()), Err(Exception::ServerStarted)));
        drop(held);
        assert!(matches!(server.route(hello()), Err(Exception::ConflictingRoute { .. })));
    }

    #[tokio::test]
    async fn test_plugin_dependencies() {
        let mut server = Server::new(ServerConfig::default()).unwrap();
        server.register(&Named("b", vec!["a".to_string()])).unwrap();
        assert_eq!(server.realm(), "server");
        assert!(server.register(&Named("b", Vec::new())).is_err());
        assert!(matches!(
            server.initialize().await,
            Err(Exception::MissingDependency { .. })
        ));

        let mut server = Server::new(ServerConfig::default()).unwrap();
        server.register(&Named("a", Vec::new())).unwrap();
        server.register(&Named("b", vec!["a".to_string()])).unwrap();
        server.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn test_inject_hello() {
        let mut server = Server::new(ServerConfig::default()).unwrap();
        server.route(hello()).unwrap();
        let response = server.inject(InjectRequest::get("/hello")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.text(), "hello");

        let missing = server.inject(InjectRequest::get("/nope")).await.unwrap();
        assert_eq!(missing.status, 404);
    }

    #[tokio::test]
    async fn test_server_ext_failure_stops_initialize() {
        let mut server = Server::new(ServerConfig::default()).unwrap();
        server
            .ext(
                Event::OnPreStart,
                ExtFunc::server(|| async { Err::<(), BoxError>("no database".into()) }),
                ExtOptions::new(),
            )
            .unwrap();
        assert!(server.initialize().await.is_err());
    }
}
