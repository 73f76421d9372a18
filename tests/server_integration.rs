//! End-to-end coverage for the concrete scenarios in spec §8: a mock
//! endpoint's static match and priority tie-break, a proxy endpoint's path
//! stripping and status translation, and a container endpoint's "not
//! running" 503. Each test drives a real `server::start` instance over the
//! network, mirroring `cmux-novnc-proxy`'s `tests/proxy_tests.rs` style of
//! spinning up the thing under test and a minimal raw-TCP backend rather
//! than mocking at the type level.

use std::net::SocketAddr;
use std::sync::Arc;

use relaykeep::config::{
    Config, ContainerConfig, Endpoint, EndpointConfig, HttpMethod, ProxyConfig, ResponseMode,
    Rule, StatusTranslation, TranslationMode, ValidationPredicate,
};
use relaykeep::handlers::proxy::ProxyClient;
use relaykeep::state::AppState;
use relaykeep::{server, socks5};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;

fn rule(id: &str, path_pattern: &str, body: &str) -> Rule {
    Rule {
        id: id.to_string(),
        methods: vec![HttpMethod::Get],
        path_pattern: path_pattern.to_string(),
        status_code: 200,
        headers: vec![],
        body: body.to_string(),
        response_mode: ResponseMode::Static,
        script_body: None,
        validation: ValidationPredicate::default(),
        delay_ms: None,
        enabled: true,
        domain_filter: Default::default(),
        group: None,
    }
}

fn endpoint(id: &str, path_prefix: &str, config: EndpointConfig, translation_mode: TranslationMode) -> Endpoint {
    Endpoint {
        id: id.to_string(),
        name: id.to_string(),
        path_prefix: path_prefix.to_string(),
        config,
        translation_mode,
        translate_pattern: None,
        translate_replace: None,
        enabled: true,
        domain_filter: Default::default(),
    }
}

/// A backend that echoes the request path in its body, replying 502 for any
/// path containing "error". Just enough HTTP/1.1 to satisfy hyper's client.
async fn start_echo_backend() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut total = 0;
                let path = loop {
                    let n = stream.read(&mut buf[total..]).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    total += n;
                    if let Some(end) = find_header_end(&buf[..total]) {
                        let request_line = std::str::from_utf8(&buf[..end]).unwrap_or("");
                        let first_line = request_line.lines().next().unwrap_or("");
                        break first_line.split_whitespace().nth(1).unwrap_or("/").to_string();
                    }
                    if total == buf.len() {
                        buf.resize(buf.len() * 2, 0);
                    }
                };

                let status = if path.contains("error") { "502 Bad Gateway" } else { "200 OK" };
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{path}",
                    path.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (addr, handle)
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

async fn start_test_server(cfg: Config) -> (server::ServerHandles, Arc<AppState>, Arc<Notify>) {
    let state = AppState::new(cfg, None).expect("valid config");
    let proxy_client = ProxyClient::new();
    let shutdown = Arc::new(Notify::new());
    let handles = server::start(state.clone(), proxy_client, shutdown.clone())
        .await
        .expect("server starts");
    (handles, state, shutdown)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mock_static_match() {
    let mut cfg = Config::default();
    cfg.endpoints = vec![endpoint(
        "mock",
        "/mock",
        EndpointConfig::Mock {
            rules: vec![rule("status", "/mock/api/status", r#"{"ok":true}"#)],
        },
        TranslationMode::None,
    )];

    let (handles, state, shutdown) = start_test_server(cfg).await;
    let resp = reqwest::get(format!("http://{}/mock/api/status", handles.http_addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), r#"{"ok":true}"#);

    server::shutdown(&state, &shutdown, handles).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn priority_tie_break_exact_over_param() {
    let mut cfg = Config::default();
    cfg.endpoints = vec![endpoint(
        "mock",
        "/mock",
        EndpointConfig::Mock {
            rules: vec![
                rule("admin", "/mock/users/admin", "A"),
                rule("by_id", "/mock/users/:id", "B"),
            ],
        },
        TranslationMode::None,
    )];

    let (handles, state, shutdown) = start_test_server(cfg).await;

    let admin = reqwest::get(format!("http://{}/mock/users/admin", handles.http_addr))
        .await
        .unwrap();
    assert_eq!(admin.text().await.unwrap(), "A");

    let other = reqwest::get(format!("http://{}/mock/users/42", handles.http_addr))
        .await
        .unwrap();
    assert_eq!(other.text().await.unwrap(), "B");

    server::shutdown(&state, &shutdown, handles).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proxy_strips_prefix_before_forwarding() {
    let (backend_addr, backend_handle) = start_echo_backend().await;

    let mut cfg = Config::default();
    cfg.endpoints = vec![endpoint(
        "proxy",
        "/proxy",
        EndpointConfig::Proxy {
            proxy: ProxyConfig {
                backend_url: format!("http://{backend_addr}"),
                ..ProxyConfig::default()
            },
        },
        TranslationMode::Strip,
    )];

    let (handles, state, shutdown) = start_test_server(cfg).await;
    let resp = reqwest::get(format!("http://{}/proxy/v1/users", handles.http_addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "/v1/users");

    server::shutdown(&state, &shutdown, handles).await;
    backend_handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_translation_class_and_passthrough() {
    let (backend_addr, backend_handle) = start_echo_backend().await;

    let mut cfg = Config::default();
    cfg.endpoints = vec![
        endpoint(
            "proxy",
            "/proxy",
            EndpointConfig::Proxy {
                proxy: ProxyConfig {
                    backend_url: format!("http://{backend_addr}"),
                    status_translation: vec![StatusTranslation { pattern: "5xx".into(), target: 503 }],
                    ..ProxyConfig::default()
                },
            },
            TranslationMode::Strip,
        ),
        endpoint(
            "proxy-passthrough",
            "/proxy2",
            EndpointConfig::Proxy {
                proxy: ProxyConfig {
                    backend_url: format!("http://{backend_addr}"),
                    status_passthrough: true,
                    ..ProxyConfig::default()
                },
            },
            TranslationMode::Strip,
        ),
    ];

    let (handles, state, shutdown) = start_test_server(cfg).await;

    let translated = reqwest::get(format!("http://{}/proxy/error", handles.http_addr))
        .await
        .unwrap();
    assert_eq!(translated.status(), 503);

    let passthrough = reqwest::get(format!("http://{}/proxy2/error", handles.http_addr))
        .await
        .unwrap();
    assert_eq!(passthrough.status(), 502);

    server::shutdown(&state, &shutdown, handles).await;
    backend_handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn container_endpoint_returns_503_without_dialing_when_not_running() {
    let mut cfg = Config::default();
    cfg.endpoints = vec![endpoint(
        "container",
        "/container",
        EndpointConfig::Container {
            container: ContainerConfig {
                proxy: ProxyConfig::default(),
                image: "nginx:alpine".to_string(),
                container_port: 80,
                pull_on_startup: false,
                restart_on_server_start: false,
                restart_policy: relaykeep::config::RestartPolicy::No,
                env: vec![],
                volumes: vec![],
            },
        },
        TranslationMode::None,
    )];

    let (handles, state, shutdown) = start_test_server(cfg).await;
    let resp = reqwest::get(format!("http://{}/container/anything", handles.http_addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    assert_eq!(resp.content_length(), Some(0));

    server::shutdown(&state, &shutdown, handles).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn socks5_start_and_shutdown_round_trip() {
    let cfg = Config::default();
    let (handles, state, shutdown) = start_test_server(cfg).await;

    let socks5_handles = socks5::start(
        state.clone(),
        0,
        None,
        None,
        handles.loopback_http_addr,
        handles.loopback_https_addr,
        shutdown.clone(),
    )
    .await
    .expect("socks5 starts");
    assert_eq!(socks5_handles.addr.ip().to_string(), "0.0.0.0");

    server::shutdown(&state, &shutdown, handles).await;
    socks5_handles.join().await;
}
