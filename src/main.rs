// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 示例服务器
//!
//! 读取 `config/development.toml`，初始化 log4rs，注册几条示例路由后开始监听。
//! 核心功能演示：
//! - 路径参数与查询串校验
//! - JSON 请求体
//! - 前置方法与服务端响应缓存
//! - 静态文件流式发送
//! - 后台管理控制台（CLI 指令交互）

use std::time::Duration;

use log::{error, info};
use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    runtime::Builder,
    sync::mpsc,
};

use pipeweb::{
    reply, CachePolicy, Event, ExtFunc, ExtOptions, HttpError, Kind, Prerequisite, Reply, Response,
    RouteConfig, Schema, Server, ServerConfig,
};

/// # 程序入口点
///
/// 初始化日志与配置，按配置的线程数构建运行时。
fn main() {
    // 日志系统：通过外部 YAML 灵活配置级别与输出目的地
    if let Err(e) = log4rs::init_file("config/log4rs.yaml", Default::default()) {
        eprintln!("无法初始化日志系统：{}", e);
    }

    let config = match ServerConfig::from_toml("config/development.toml") {
        Ok(config) => {
            info!("配置文件已载入");
            config
        }
        Err(e) => {
            error!("{}，使用默认配置", e);
            ServerConfig::default()
        }
    };

    // 根据配置文件动态分配工作线程数
    let runtime = match Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("无法创建异步运行时：{}", e);
            return;
        }
    };

    if let Err(e) = runtime.block_on(serve(config)) {
        error!("服务器异常退出：{}", e);
    }
}

fn routes(server: &mut Server) -> Result<(), pipeweb::Exception> {
    server.ext(
        Event::OnRequest,
        ExtFunc::request(|request, h| {
            reply(async move {
                request.app.insert("start".to_string(), json!(request.received_at().to_rfc3339()));
                h.proceed()
            })
        }),
        ExtOptions::new().name("stamp"),
    )?;

    server.route(RouteConfig::new("GET", "/", |_request, h| {
        reply(async move { Ok(h.response("pipeweb is running").into()) })
    }))?;

    server.route(
        RouteConfig::new("GET", "/users/{id}", |request, _h| {
            reply(async move {
                let id = request.params.get("id").cloned().unwrap_or_default();
                let verbose = request.query.get("verbose").cloned().unwrap_or(json!(false));
                Ok(json!({ "id": id, "verbose": verbose }).into())
            })
        })
        .validate_params(Schema::object().required("id", Kind::Integer))
        .validate_query(Schema::object().optional("verbose", Kind::Boolean)),
    )?;

    server.route(
        RouteConfig::new("POST", "/echo", |request, _h| {
            reply(async move { Ok(Reply::from(request.payload.clone())) })
        })
        .payload(pipeweb::payload::PayloadOptions::default().max_bytes(64 * 1024)),
    )?;

    server.route(
        RouteConfig::new("GET", "/clock", |request, _h| {
            reply(async move {
                let now = request.pre.get("now").cloned().unwrap_or_default();
                Ok(json!({ "now": now }).into())
            })
        })
        .pre(vec![Prerequisite::new(|_request, h| {
            reply(async move { Ok(h.response(json!(chrono::Utc::now().to_rfc3339())).into()) })
        })
        .assign("now")])
        .cache(CachePolicy::expires_in(Duration::from_secs(5)).server(true)),
    )?;

    server.route(RouteConfig::new("GET", "/static/{file*}", |request, _h| {
        reply(async move {
            let file = request.params.get("file").cloned().unwrap_or_default();
            if file.split('/').any(|segment| segment == "..") {
                return Err(HttpError::forbidden("Path traversal is not allowed").into());
            }
            let response = Response::file(format!("static/{}", file)).await?;
            Ok(response.into())
        })
    }))?;

    Ok(())
}

async fn serve(config: ServerConfig) -> Result<(), pipeweb::Exception> {
    let mut server = Server::new(config)?;
    routes(&mut server)?;
    let address = server.start().await?;
    info!("服务端已在{}上启动", address);

    // 启动交互式管理控制台任务
    // 标准输入关闭后服务器继续运行，直到收到 stop
    let (commands, mut received) = mpsc::channel::<String>(8);
    let _console = commands.clone();
    tokio::spawn(async move {
        let stdin = tokio::io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut input = String::new();
        loop {
            input.clear();
            match reader.read_line(&mut input).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if commands.send(input.trim().to_string()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(cmd) = received.recv().await {
        match cmd.as_str() {
            "stop" => {
                println!("停机指令已激活，服务器将在处理完进行中的请求后关闭...");
                break;
            }
            "help" => {
                println!("== pipeweb Help ==");
                println!("stop   - 发出停机信号");
                println!("status - 查看当前服务器运行状态");
                println!("help   - 显示此帮助信息");
                println!("==================");
            }
            "status" => {
                println!("== pipeweb 状态 ===");
                println!("监听地址: {:?}", server.address());
                println!("当前活跃连接数: {}", server.core().connections());
                println!("已注册路由数: {}", server.table().len());
                println!("==================");
            }
            "" => {}
            _ => {
                println!("无效的命令：{}", cmd);
            }
        }
    }

    server.stop().await
}
