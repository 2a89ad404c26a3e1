// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

#[cfg(test)]
mod security_tests {
    //! # 安全漏洞回归测试套件
    //!
    //! 该模块旨在通过模拟常见的 Web 攻击向量来验证服务器的防御能力。
    //! 覆盖范围包括：
    //! - 路径遍历 (Path Traversal / LFI)
    //! - 拒绝服务攻击 (DoS / Oversized Header / Oversized Payload)
    //! - 协议健壮性 (Protocol Robustness)
    //! - 慢速连接攻击 (Slowloris)
    //! - 错误信息泄露 (Information Disclosure)

    use std::{net::SocketAddr, time::Duration};

    use pipeweb::{payload::PayloadOptions, reply, HttpError, Response, RouteConfig, Server, ServerConfig};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    const MAX_HEAD_BYTES: usize = 16 * 1024;

    /// # 启动测试服务器
    ///
    /// 挂载一个只读的静态目录、一个限制请求体大小的上传接口和一个会泄露内部信息的接口，
    /// 请求头与请求体的读取期限缩短到 200ms。
    async fn start() -> (Server, SocketAddr, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>public</h1>").unwrap();
        let root = dir.path().to_path_buf();

        let mut config = ServerConfig::default();
        config.timeout.head_ms = 200;
        config.timeout.payload_ms = 200;
        let mut server = Server::new(config).unwrap();

        server
            .route(RouteConfig::new("GET", "/static/{file*}", move |request, _h| {
                let file = request.params.get("file").cloned().unwrap_or_default();
                let path = root.join(&file);
                reply(async move {
                    if file.split('/').any(|segment| segment == "..") || file.contains('\0') {
                        return Err(HttpError::forbidden("Path traversal is not allowed").into());
                    }
                    Ok(Response::file(path).await?.into())
                })
            }))
            .unwrap();
        server
            .route(
                RouteConfig::new("POST", "/upload", |request, h| {
                    let size = request.raw_payload.len();
                    reply(async move { Ok(h.response(format!("received {}", size)).into()) })
                })
                .payload(PayloadOptions::default().max_bytes(64)),
            )
            .unwrap();
        server
            .route(RouteConfig::new("GET", "/leak", |_request, _h| {
                reply(async move { Err(HttpError::internal("database password is hunter2").into()) })
            }))
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = server.listen(listener).await.unwrap();
        (server, address, dir)
    }

    /// # 异步安全请求发送器
    ///
    /// 底层采用 Tokio 异步 I/O 驱动，允许精确控制数据包的发送时机。
    /// 读取到服务器关闭连接为止。
    async fn send_request(address: SocketAddr, request: &[u8]) -> Result<String, String> {
        let mut stream = TcpStream::connect(address).await.map_err(|e| e.to_string())?;
        stream.write_all(request).await.map_err(|e| e.to_string())?;

        let mut buffer = Vec::new();
        // 设置硬超时限制，防止测试用例因服务器挂起而永久阻塞
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buffer))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;

        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    /// 从原始响应字符串中提取 HTTP 状态码
    fn extract_status_code(response: &str) -> u16 {
        response
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse().ok())
            .unwrap_or(0)
    }

    async fn status_of(address: SocketAddr, request: &str) -> u16 {
        let response = send_request(address, request.as_bytes()).await.unwrap();
        extract_status_code(&response)
    }

    /// ## 攻击向量：基础路径遍历
    /// 验证服务器能拦截通过 `../` 越权访问系统敏感文件的企图。
    #[tokio::test]
    async fn test_path_traversal_simple() {
        let (mut server, address, _dir) = start().await;

        let attacks = [
            "GET /static/../../../../etc/passwd HTTP/1.1\r\nHost: localhost\r\n\r\n",
            "GET /static/%2e%2e/%2e%2e/etc/passwd HTTP/1.1\r\nHost: localhost\r\n\r\n",
            "GET /static/..%2F..%2Fetc%2Fpasswd HTTP/1.1\r\nHost: localhost\r\n\r\n",
        ];
        for attack in attacks {
            let response = send_request(address, attack.as_bytes()).await.unwrap();
            let status = extract_status_code(&response);
            assert!(matches!(status, 400 | 403 | 404), "{} -> {}", attack, status);
            assert!(!response.contains("root:"), "{}", attack);
        }

        // 正常文件仍然可以访问
        let response = send_request(address, b"GET /static/index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(extract_status_code(&response), 200);
        assert!(response.ends_with("<h1>public</h1>"));

        server.stop().await.unwrap();
    }

    /// ## 攻击向量：空字节注入
    #[tokio::test]
    async fn test_null_byte_injection() {
        let (mut server, address, _dir) = start().await;

        let status = status_of(address, "GET /static/index.html%00.png HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        assert_eq!(status, 403);

        server.stop().await.unwrap();
    }

    /// ## 攻击向量：超大请求头
    /// 请求头超过上限时返回 431，且不会读取上限之外的数据。
    #[tokio::test]
    async fn test_oversized_header() {
        let (mut server, address, _dir) = start().await;

        let mut request = b"GET / HTTP/1.1\r\nX-Padding: ".to_vec();
        request.resize(MAX_HEAD_BYTES + 1, b'a');
        let response = send_request(address, &request).await.unwrap();
        assert_eq!(extract_status_code(&response), 431);

        server.stop().await.unwrap();
    }

    /// ## 攻击向量：超大请求体
    /// 声明的长度超过路由上限时直接拒绝，不读取请求体。
    #[tokio::test]
    async fn test_oversized_payload() {
        let (mut server, address, _dir) = start().await;

        let status = status_of(
            address,
            "POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\nContent-Length: 1048576\r\n\r\n",
        )
        .await;
        assert_eq!(status, 413);

        let status = status_of(
            address,
            "POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await;
        assert_eq!(status, 200);

        server.stop().await.unwrap();
    }

    /// ## 协议健壮性：分块请求体
    #[tokio::test]
    async fn test_chunked_request_rejected() {
        let (mut server, address, _dir) = start().await;

        let status = status_of(
            address,
            "POST /upload HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .await;
        assert_eq!(status, 411);

        server.stop().await.unwrap();
    }

    /// ## 协议健壮性：畸形请求
    /// 各种无法解析的请求行都应当得到 4xx/5xx 响应，而不是让连接挂起。
    #[tokio::test]
    async fn test_malformed_requests() {
        let (mut server, address, _dir) = start().await;

        let cases = [
            ("GARBAGE\r\n\r\n", 400),
            ("GET /\r\n\r\n", 400),
            ("BREW /pot HTTP/1.1\r\nHost: localhost\r\n\r\n", 400),
            ("GET / HTTP/9.9\r\nHost: localhost\r\n\r\n", 505),
            ("GET / HTTP/1.1\r\nBroken header line\r\n\r\n", 400),
        ];
        for (request, expected) in cases {
            assert_eq!(status_of(address, request).await, expected, "{:?}", request);
        }

        // 非 UTF-8 请求头
        let response = send_request(address, b"GET /\xff\xfe HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(extract_status_code(&response), 400);

        server.stop().await.unwrap();
    }

    /// ## 攻击向量：慢速请求头 (Slowloris)
    /// 请求头迟迟不完整时，服务器在期限后返回 408 并关闭连接。
    #[tokio::test]
    async fn test_slowloris_header() {
        let (mut server, address, _dir) = start().await;

        let started = std::time::Instant::now();
        let status = status_of(address, "GET / HTTP/1.1\r\nHost: localhost\r\n").await;
        assert_eq!(status, 408);
        assert!(started.elapsed() >= Duration::from_millis(190));

        server.stop().await.unwrap();
    }

    /// ## 攻击向量：慢速请求体
    #[tokio::test]
    async fn test_slow_payload() {
        let (mut server, address, _dir) = start().await;

        let status = status_of(
            address,
            "POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\nContent-Length: 10\r\n\r\nabc",
        )
        .await;
        assert_eq!(status, 408);

        server.stop().await.unwrap();
    }

    /// ## 信息泄露：5xx 错误只返回通用提示
    #[tokio::test]
    async fn test_internal_error_is_censored() {
        let (mut server, address, _dir) = start().await;

        let response = send_request(address, b"GET /leak HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(extract_status_code(&response), 500);
        assert!(!response.contains("hunter2"));
        assert!(response.contains("An internal server error occurred"));

        server.stop().await.unwrap();
    }

    /// ## 故障隔离：空连接不影响后续请求
    #[tokio::test]
    async fn test_empty_connections_are_harmless() {
        let (mut server, address, _dir) = start().await;

        for _ in 0..5 {
            let stream = TcpStream::connect(address).await.unwrap();
            drop(stream);
        }
        let status = status_of(address, "GET /static/index.html HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        assert_eq!(status, 200);

        server.stop().await.unwrap();
    }
}
