//! HTTP server(s) (spec §4.12) plus startup/shutdown orchestration for the
//! background pieces (health probes, container bootstrap) that must exist
//! before the listeners start taking traffic. Connection handling mirrors
//! the teacher's `cmux-proxy::spawn_proxy`: one accept loop per listener, a
//! `Notify`-based shutdown signal, and `hyper_util`'s `auto::Builder` for
//! simultaneous HTTP/1.1 + HTTP/2 service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use http::{Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::config::{Config, EndpointConfig, RestartPolicy};
use crate::handlers::proxy::ProxyClient;
use crate::handlers::{empty_body, BoxBody};
use crate::health::{self, ProbeHandle};
use crate::router;
use crate::runtime::{CreateSpec, RestartPolicySpec, VolumeSpec};
use crate::state::AppState;
use crate::tls;

fn restart_spec(policy: RestartPolicy) -> RestartPolicySpec {
    match policy {
        RestartPolicy::No => RestartPolicySpec::No,
        RestartPolicy::Always => RestartPolicySpec::Always,
        RestartPolicy::UnlessStopped => RestartPolicySpec::UnlessStopped,
        RestartPolicy::OnFailure => RestartPolicySpec::OnFailure,
    }
}

/// Handles needed to stop the system cleanly: listener tasks, probe loops,
/// and enough identity to issue container stops on shutdown.
pub struct ServerHandles {
    pub http_addr: SocketAddr,
    pub https_addr: Option<SocketAddr>,
    pub loopback_http_addr: SocketAddr,
    pub loopback_https_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    probes: Vec<ProbeHandle>,
}

async fn dispatch_request(
    state: Arc<AppState>,
    proxy_client: ProxyClient,
    remote_addr: SocketAddr,
    scheme: &'static str,
    tls: bool,
    arrived_via_intercept: bool,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, std::convert::Infallible> {
    let (parts, body) = req.into_parts();
    let user_agent = parts
        .headers
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let timer = crate::logsink::RequestTimer::start(
        parts.method.as_str(),
        parts.uri.path(),
        &remote_addr.ip().to_string(),
        &user_agent,
        scheme,
    );

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "failed to buffer request body");
            let resp = Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(empty_body())
                .unwrap();
            timer.finish(&state.request_log, Some(resp.status().as_u16()));
            return Ok(resp);
        }
    };

    let resp = router::dispatch(
        &state,
        &proxy_client,
        parts,
        body,
        remote_addr,
        scheme,
        tls,
        arrived_via_intercept,
    )
    .await;
    timer.finish(&state.request_log, Some(resp.status().as_u16()));
    Ok(resp)
}

fn redirect_response(host: &str, https_port: u16, path_and_query: &str) -> Response<BoxBody> {
    let location = format!("https://{host}:{https_port}{path_and_query}");
    Response::builder()
        .status(StatusCode::PERMANENT_REDIRECT)
        .header(http::header::LOCATION, location)
        .body(empty_body())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn spawn_plain_listener(
    listener: TcpListener,
    addr: SocketAddr,
    state: Arc<AppState>,
    proxy_client: ProxyClient,
    arrived_via_intercept: bool,
    redirect_https_port: Option<u16>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(%addr, "http listener started");
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!(%addr, "http listener shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "accept error");
                            continue;
                        }
                    };
                    let state = state.clone();
                    let proxy_client = proxy_client.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req: Request<Incoming>| {
                            let state = state.clone();
                            let proxy_client = proxy_client.clone();
                            async move {
                                if let Some(https_port) = redirect_https_port {
                                    let host = req
                                        .headers()
                                        .get(http::header::HOST)
                                        .and_then(|v| v.to_str().ok())
                                        .unwrap_or("")
                                        .rsplit_once(':')
                                        .map(|(h, _)| h)
                                        .unwrap_or("");
                                    let path_and_query = req
                                        .uri()
                                        .path_and_query()
                                        .map(|pq| pq.as_str().to_string())
                                        .unwrap_or_default();
                                    return Ok::<_, std::convert::Infallible>(redirect_response(host, https_port, &path_and_query));
                                }
                                dispatch_request(state, proxy_client, remote_addr, "http", false, arrived_via_intercept, req).await
                            }
                        });
                        let conn = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                            .http1()
                            .title_case_headers(true)
                            .preserve_header_case(true)
                            .serve_connection(io, service);
                        if let Err(e) = conn.await {
                            error!(error = %e, "connection error");
                        }
                    });
                }
            }
        }
    })
}

fn spawn_tls_listener(
    listener: TcpListener,
    addr: SocketAddr,
    acceptor: TlsAcceptor,
    state: Arc<AppState>,
    proxy_client: ProxyClient,
    arrived_via_intercept: bool,
    http2: bool,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(%addr, "https listener started");
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!(%addr, "https listener shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "accept error");
                            continue;
                        }
                    };
                    let acceptor = acceptor.clone();
                    let state = state.clone();
                    let proxy_client = proxy_client.clone();
                    tokio::spawn(async move {
                        let tls_stream = match acceptor.accept(stream).await {
                            Ok(s) => s,
                            Err(e) => {
                                warn!(error = %e, "tls handshake failed");
                                return;
                            }
                        };
                        let io = TokioIo::new(tls_stream);
                        let service = service_fn(move |req: Request<Incoming>| {
                            dispatch_request(state.clone(), proxy_client.clone(), remote_addr, "https", true, arrived_via_intercept, req)
                        });
                        let mut builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
                        if http2 {
                            builder.http2().adaptive_window(true);
                        }
                        builder.http1().title_case_headers(true).preserve_header_case(true);
                        if let Err(e) = builder.serve_connection(io, service).await {
                            error!(error = %e, "connection error");
                        }
                    });
                }
            }
        }
    })
}

/// Pulls (if configured), creates and starts every container endpoint whose
/// `restart_on_server_start` is set (spec.md §3 `ContainerConfig`), and
/// spawns its health probe + stats sampler.
async fn bootstrap_container(
    state: &Arc<AppState>,
    proxy_client: &ProxyClient,
    endpoint_id: &str,
    container: &crate::config::ContainerConfig,
    probes: &mut Vec<ProbeHandle>,
) {
    let Some(runtime) = state.runtime.clone() else {
        warn!(endpoint = %endpoint_id, "container endpoint configured but no runtime is available");
        return;
    };

    let name = crate::handlers::container::container_name(endpoint_id);

    if container.pull_on_startup {
        match runtime.pull_image(&container.image).await {
            Ok(mut progress) => {
                while let Some(line) = progress.next().await {
                    tracing::debug!(endpoint = %endpoint_id, image = %container.image, "{}", line);
                }
            }
            Err(e) => {
                error!(endpoint = %endpoint_id, error = %e, "image pull failed");
                return;
            }
        }
    }

    if container.restart_on_server_start {
        let ctx = crate::script::ScriptContext::empty();
        let mut env = Vec::with_capacity(container.env.len());
        for entry in &container.env {
            let value = if entry.is_script {
                match state.script_host.eval_expression(&entry.value, &ctx).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(endpoint = %endpoint_id, env = %entry.name, error = %e, "env expression failed");
                        String::new()
                    }
                }
            } else {
                entry.value.clone()
            };
            env.push((entry.name.clone(), value));
        }

        let volumes = container
            .volumes
            .iter()
            .map(|v| VolumeSpec {
                host_path: crate::runtime::hostpath::translate_host_path(&v.host_path),
                container_path: v.container_path.clone(),
                read_only: v.read_only,
            })
            .collect();

        let spec = CreateSpec {
            name: name.clone(),
            image: container.image.clone(),
            container_port: container.container_port,
            env,
            volumes,
            restart_policy: restart_spec(container.restart_policy),
        };

        let id = match runtime.find_container_by_name(&name).await {
            Ok(Some(existing)) => existing.id,
            _ => match runtime.create_container(&spec).await {
                Ok(id) => id,
                Err(e) => {
                    error!(endpoint = %endpoint_id, error = %e, "container create failed");
                    return;
                }
            },
        };

        if let Err(e) = runtime.start_container(&id).await {
            error!(endpoint = %endpoint_id, error = %e, "container start failed");
            return;
        }

        probes.push(health::spawn_stats_sampler(name.clone(), runtime.clone()));
    }

    probes.push(health::spawn_container_probe(
        endpoint_id.to_string(),
        name,
        container.clone(),
        proxy_client.clone(),
        runtime,
        state.health.clone(),
    ));
}

/// Binds the public and loopback listeners, bootstraps container endpoints,
/// and starts every configured health probe. Returns handles the caller
/// keeps for [`shutdown`].
pub async fn start(
    state: Arc<AppState>,
    proxy_client: ProxyClient,
    shutdown_signal: Arc<Notify>,
) -> std::io::Result<ServerHandles> {
    let cfg: Arc<Config> = state.config.load_full();

    let mut tasks = Vec::new();
    let mut probes: Vec<ProbeHandle> = Vec::new();

    let http_listener = TcpListener::bind(("0.0.0.0", cfg.http_port)).await?;
    let http_addr = http_listener.local_addr()?;
    let redirect_https_port = if cfg.tls.enabled && cfg.tls.redirect_http {
        Some(cfg.tls.https_port)
    } else {
        None
    };
    tasks.push(spawn_plain_listener(
        http_listener,
        http_addr,
        state.clone(),
        proxy_client.clone(),
        false,
        redirect_https_port,
        shutdown_signal.clone(),
    ));

    let mut https_addr = None;
    let mut loopback_https_addr = None;
    let tls_server_config = match (cfg.tls.enabled, &cfg.tls.cert_path, &cfg.tls.key_path) {
        (true, Some(cert_path), Some(key_path)) => match tls::load_server_config(cert_path, key_path) {
            Ok(server_config) => Some(server_config),
            Err(e) => {
                warn!(error = %e, "tls enabled but certificate could not be loaded; https listeners disabled");
                None
            }
        },
        (true, _, _) => {
            warn!("tls enabled but cert_path/key_path are not configured; https listeners disabled");
            None
        }
        (false, _, _) => None,
    };

    if let Some(tls_cfg) = &tls_server_config {
        let acceptor = TlsAcceptor::from(tls_cfg.clone());
        let listener = TcpListener::bind(("0.0.0.0", cfg.tls.https_port)).await?;
        let addr = listener.local_addr()?;
        https_addr = Some(addr);
        tasks.push(spawn_tls_listener(
            listener,
            addr,
            acceptor.clone(),
            state.clone(),
            proxy_client.clone(),
            false,
            cfg.tls.http2,
            shutdown_signal.clone(),
        ));

        let loopback_listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let loopback_addr = loopback_listener.local_addr()?;
        loopback_https_addr = Some(loopback_addr);
        tasks.push(spawn_tls_listener(
            loopback_listener,
            loopback_addr,
            acceptor,
            state.clone(),
            proxy_client.clone(),
            true,
            cfg.tls.http2,
            shutdown_signal.clone(),
        ));
    }

    let loopback_http_listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let loopback_http_addr = loopback_http_listener.local_addr()?;
    tasks.push(spawn_plain_listener(
        loopback_http_listener,
        loopback_http_addr,
        state.clone(),
        proxy_client.clone(),
        true,
        None,
        shutdown_signal.clone(),
    ));

    for endpoint in &cfg.endpoints {
        if !endpoint.enabled {
            continue;
        }
        match &endpoint.config {
            EndpointConfig::Container { container } => {
                bootstrap_container(&state, &proxy_client, &endpoint.id, container, &mut probes).await;
            }
            EndpointConfig::Proxy { proxy } if proxy.health_check.enabled => {
                probes.push(health::spawn_proxy_probe(
                    endpoint.id.clone(),
                    proxy.clone(),
                    proxy_client.clone(),
                    state.health.clone(),
                ));
            }
            _ => {}
        }
    }

    Ok(ServerHandles {
        http_addr,
        https_addr,
        loopback_http_addr,
        loopback_https_addr,
        tasks,
        probes,
    })
}

/// Cancels probe loops, stops container endpoints whose restart policy is
/// not `no` (spec §5 "Server shutdown... issues container stop with 10s
/// grace"), then waits for listener tasks to wind down.
pub async fn shutdown(state: &Arc<AppState>, shutdown_signal: &Arc<Notify>, handles: ServerHandles) {
    shutdown_signal.notify_waiters();

    for probe in &handles.probes {
        probe.cancel();
    }

    let cfg = state.config.load();
    if let Some(runtime) = &state.runtime {
        for endpoint in &cfg.endpoints {
            if let EndpointConfig::Container { container } = &endpoint.config {
                if container.restart_policy == RestartPolicy::No {
                    continue;
                }
                let name = crate::handlers::container::container_name(&endpoint.id);
                if let Ok(Some(info)) = runtime.find_container_by_name(&name).await {
                    if let Err(e) = runtime.stop_container(&info.id, Duration::from_secs(10)).await {
                        warn!(endpoint = %endpoint.id, error = %e, "container stop failed during shutdown");
                    }
                }
            }
        }
    }

    for task in handles.tasks {
        let _ = task.await;
    }
}
