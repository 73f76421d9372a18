//! HTTP proxy handler (spec §4.7), shared by the static-backend endpoint
//! kind and, via [`crate::handlers::container`], the container-backed kind.
//! Grounded on the teacher's `cmux-proxy` reverse-proxy loop (connection
//! pooling, CONNECT/upgrade tunneling via `hyper::upgrade`) generalized to
//! the configurable header/status/body pipeline this spec adds.

use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future;
use http::request::Parts;
use http::{HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::copy_bidirectional;

use super::{boxed, empty_body, full_body, BoxBody};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::headers;
use crate::script::{ScriptContext, ScriptHost};

type HttpsConnector = hyper_rustls::HttpsConnector<HttpConnector>;

/// Shared connection-pooled client used by every proxy/container request
/// and by the health poller's probes. Backends are dialed over a
/// `rustls`-backed `HttpsConnector` wrapping a plain `HttpConnector`, so
/// `http`, `https`, `ws`, and `wss` backend URLs (spec §3) are all
/// reachable from one client.
#[derive(Clone)]
pub struct ProxyClient {
    client: Client<HttpsConnector, BoxBody>,
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyClient {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(10)));
        connector.set_nodelay(true);
        connector.set_keepalive(Some(Duration::from_secs(90)));
        // The wrapping HttpsConnector forwards https:// URIs to this
        // connector unchanged to establish the TCP leg; enforce_http's
        // default of true would reject them before TLS ever starts.
        connector.enforce_http(false);

        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(32)
            .build(https);

        ProxyClient { client }
    }

    /// GET `url` and treat any status in [200,500) as healthy (spec §4.10).
    pub async fn probe(&self, url: &str, timeout: Duration) -> bool {
        let Ok(uri) = Uri::from_str(url) else { return false };
        let Ok(req) = Request::get(uri).body(empty_body()) else { return false };
        match tokio::time::timeout(timeout, self.client.request(req)).await {
            Ok(Ok(resp)) => {
                let status = resp.status().as_u16();
                (200..500).contains(&status)
            }
            _ => false,
        }
    }
}

fn is_upgrade_request(parts: &Parts) -> bool {
    let has_conn_upgrade = parts
        .headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    has_conn_upgrade && parts.headers.contains_key(http::header::UPGRADE)
}

/// `ws`/`wss` backend URLs (spec §3) name a WebSocket origin but the
/// connector only dials `http`/`https`; the distinction between a plain
/// request and an upgrade is carried by the request's own `Connection`/
/// `Upgrade` headers; see [`is_upgrade_request`].
fn normalize_backend_scheme(backend_url: &str) -> std::borrow::Cow<'_, str> {
    if let Some(rest) = backend_url.strip_prefix("wss://") {
        std::borrow::Cow::Owned(format!("https://{rest}"))
    } else if let Some(rest) = backend_url.strip_prefix("ws://") {
        std::borrow::Cow::Owned(format!("http://{rest}"))
    } else {
        std::borrow::Cow::Borrowed(backend_url)
    }
}

fn build_backend_uri(backend_url: &str, path_and_query: &str) -> Result<Uri, ProxyError> {
    let backend_url = normalize_backend_scheme(backend_url);
    let base = backend_url.trim_end_matches('/');
    Uri::from_str(&format!("{base}{path_and_query}")).map_err(|e| ProxyError::Transport(e.to_string()))
}

fn empty_response(status: StatusCode) -> Response<BoxBody> {
    Response::builder().status(status).body(empty_body()).unwrap()
}

/// Run the C7 pipeline for one request. `backend_url` is the resolved
/// backend origin (static for a proxy endpoint, dynamic per-request for a
/// container endpoint); `path_and_query` is the already-translated path
/// (spec §4.11 step 3) combined with the original query string.
pub async fn dispatch(
    client: &ProxyClient,
    proxy: &ProxyConfig,
    script_host: &ScriptHost,
    backend_url: &str,
    parts: Parts,
    body: Bytes,
    path_and_query: &str,
    ctx: ScriptContext,
) -> Response<BoxBody> {
    let timeout = Duration::from_secs(proxy.timeout_secs.max(1));
    match tokio::time::timeout(timeout, run(client, proxy, script_host, backend_url, parts, body, path_and_query, ctx)).await {
        Ok(resp) => resp,
        Err(_) => empty_response(StatusCode::GATEWAY_TIMEOUT),
    }
}

async fn run(
    client: &ProxyClient,
    proxy: &ProxyConfig,
    script_host: &ScriptHost,
    backend_url: &str,
    parts: Parts,
    body: Bytes,
    path_and_query: &str,
    ctx: ScriptContext,
) -> Response<BoxBody> {
    let uri = match build_backend_uri(backend_url, path_and_query) {
        Ok(uri) => uri,
        Err(e) => {
            tracing::warn!(error = %e, "invalid backend uri");
            return empty_response(StatusCode::BAD_GATEWAY);
        }
    };

    let upgrade = is_upgrade_request(&parts);

    let mut out_headers = parts.headers.clone();
    headers::apply(&proxy.inbound_headers, &mut out_headers, script_host, &ctx).await;
    if !upgrade {
        headers::strip_hop_by_hop(&mut out_headers);
    }

    let mut builder = Request::builder().method(parts.method.clone()).uri(uri).version(parts.version);
    *builder.headers_mut().unwrap() = out_headers;
    let backend_req = match builder.body(full_body(body)) {
        Ok(req) => req,
        Err(_) => return empty_response(StatusCode::INTERNAL_SERVER_ERROR),
    };

    if upgrade {
        return handle_upgrade(client, backend_req, parts, script_host, proxy, &ctx).await;
    }

    let backend_resp = match client.client.request(backend_req).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(error = %e, "backend transport error");
            return empty_response(StatusCode::SERVICE_UNAVAILABLE);
        }
    };

    let status = translate_status(proxy, backend_resp.status().as_u16());
    let mut resp_headers = backend_resp.headers().clone();

    let final_body: BoxBody = if proxy.body_transform.trim().is_empty() {
        boxed(backend_resp.into_body())
    } else {
        let content_type = resp_headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let collected = backend_resp.into_body().collect().await;
        match collected {
            Ok(collected) => {
                let original = collected.to_bytes();
                let original_str = String::from_utf8_lossy(&original).into_owned();
                match script_host.eval_body_transform(&proxy.body_transform, &original_str, &content_type).await {
                    Ok(transformed) => full_body(Bytes::from(transformed)),
                    Err(e) => {
                        tracing::warn!(error = %e, "body transform failed, keeping original body");
                        full_body(original)
                    }
                }
            }
            Err(_) => empty_body(),
        }
    };

    headers::apply(&proxy.outbound_headers, &mut resp_headers, script_host, &ctx).await;
    headers::strip_hop_by_hop(&mut resp_headers);

    let mut response_builder = Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
    *response_builder.headers_mut().unwrap() = resp_headers;
    response_builder.body(final_body).unwrap_or_else(|_| empty_response(StatusCode::INTERNAL_SERVER_ERROR))
}

/// Patterns are `"NNN"` (exact) or `"Nxx"` (class); first match wins; skipped
/// entirely when `status_passthrough` (spec §4.7, §8 "Status translation
/// closure").
fn translate_status(proxy: &ProxyConfig, backend_status: u16) -> u16 {
    if proxy.status_passthrough {
        return backend_status;
    }
    proxy
        .status_translation
        .iter()
        .find(|t| t.matches(backend_status))
        .map(|t| t.target)
        .unwrap_or(backend_status)
}

/// WebSocket (or other protocol) upgrade: forward the handshake, mirror a
/// 101 back to the client, then shuttle bytes until either side closes
/// (spec §4.7 "header/body transforms are not applied to frames").
async fn handle_upgrade(
    client: &ProxyClient,
    backend_req: Request<BoxBody>,
    client_parts: Parts,
    _script_host: &ScriptHost,
    _proxy: &ProxyConfig,
    _ctx: &ScriptContext,
) -> Response<BoxBody> {
    let backend_resp = match client.client.request(backend_req).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(error = %e, "backend upgrade request failed");
            return empty_response(StatusCode::BAD_GATEWAY);
        }
    };

    if backend_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        let status = backend_resp.status();
        let mut headers = backend_resp.headers().clone();
        headers::strip_hop_by_hop(&mut headers);
        let body = boxed(backend_resp.into_body());
        let mut builder = Response::builder().status(status);
        *builder.headers_mut().unwrap() = headers;
        return builder.body(body).unwrap_or_else(|_| empty_response(StatusCode::INTERNAL_SERVER_ERROR));
    }

    let mut out_headers = backend_resp.headers().clone();
    out_headers.insert(http::header::CONNECTION, HeaderValue::from_static("upgrade"));

    let client_resp = {
        let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        *builder.headers_mut().unwrap() = out_headers;
        builder.body(empty_body()).unwrap_or_else(|_| empty_response(StatusCode::INTERNAL_SERVER_ERROR))
    };

    tokio::spawn(async move {
        let mut client_req = Request::from_parts(client_parts, ());
        match future::try_join(hyper::upgrade::on(&mut client_req), hyper::upgrade::on(backend_resp)).await {
            Ok((client_upgraded, backend_upgraded)) => {
                let mut client_io = TokioIo::new(client_upgraded);
                let mut backend_io = TokioIo::new(backend_upgraded);
                if let Err(e) = copy_bidirectional(&mut client_io, &mut backend_io).await {
                    tracing::warn!(error = %e, "upgrade tunnel error");
                }
            }
            Err(e) => tracing::warn!(error = %e, "upgrade handshake error"),
        }
    });

    client_resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_and_wss_backend_urls_are_normalized_for_the_connector() {
        assert_eq!(normalize_backend_scheme("ws://x.test:9000"), "http://x.test:9000");
        assert_eq!(normalize_backend_scheme("wss://x.test"), "https://x.test");
        assert_eq!(normalize_backend_scheme("http://x.test"), "http://x.test");
        assert_eq!(normalize_backend_scheme("https://x.test"), "https://x.test");
    }

    #[test]
    fn build_backend_uri_rewrites_ws_scheme_before_parsing() {
        let uri = build_backend_uri("wss://x.test", "/v1/stream").unwrap();
        assert_eq!(uri.scheme_str(), Some("https"));
    }

    #[test]
    fn status_translation_class_wins_over_passthrough_off() {
        let mut proxy = ProxyConfig::default();
        proxy.status_translation = vec![crate::config::StatusTranslation {
            pattern: "5xx".into(),
            target: 503,
        }];
        assert_eq!(translate_status(&proxy, 502), 503);
    }

    #[test]
    fn passthrough_ignores_translation_rules() {
        let mut proxy = ProxyConfig::default();
        proxy.status_passthrough = true;
        proxy.status_translation = vec![crate::config::StatusTranslation {
            pattern: "5xx".into(),
            target: 503,
        }];
        assert_eq!(translate_status(&proxy, 502), 502);
    }

    #[test]
    fn no_matching_rule_keeps_backend_status() {
        let proxy = ProxyConfig::default();
        assert_eq!(translate_status(&proxy, 418), 418);
    }
}
