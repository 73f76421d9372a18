//! Container handler (spec §4.8). Inherits the entire C7 pipeline; the only
//! differences are a dynamically-resolved backend URL and a default set of
//! inbound headers that rewrite `Host` to the container's loopback port.

use bytes::Bytes;
use http::request::Parts;
use http::{Response, StatusCode};

use super::proxy::{self, ProxyClient};
use super::{empty_body, BoxBody};
use crate::config::{ContainerConfig, HeaderManipulation, HeaderMode};
use crate::health::HealthStatus;
use crate::script::ScriptContext;
use crate::state::AppState;

pub fn container_name(endpoint_id: &str) -> String {
    format!("relaykeep-{endpoint_id}")
}

/// Default `inbound_headers` a container endpoint gets unless the user
/// overrode them (spec §4.8, §8 "Container default safety"). Hop-by-hop
/// stripping is already unconditional in [`proxy::dispatch`]; these four
/// cover the rest of the default set.
pub fn default_inbound_headers() -> Vec<HeaderManipulation> {
    vec![
        HeaderManipulation {
            name: "host".into(),
            mode: HeaderMode::Expression,
            value: None,
            expression: Some("'127.0.0.1:' + request.hostPort".into()),
        },
        HeaderManipulation {
            name: "x-forwarded-for".into(),
            mode: HeaderMode::Expression,
            value: None,
            expression: Some("request.remoteAddr".into()),
        },
        HeaderManipulation {
            name: "x-forwarded-host".into(),
            mode: HeaderMode::Expression,
            value: None,
            expression: Some("request.host".into()),
        },
        HeaderManipulation {
            name: "x-forwarded-proto".into(),
            mode: HeaderMode::Expression,
            value: None,
            expression: Some("request.scheme".into()),
        },
    ]
}

async fn resolve_port(
    state: &AppState,
    endpoint_id: &str,
    name: &str,
    container_port: u16,
) -> Option<u16> {
    if matches!(state.health.get(endpoint_id).map(|s| *s), Some(HealthStatus::Healthy)) {
        if let Some(entry) = state.container_ports.get(name) {
            return Some(entry.value().1);
        }
    }

    let Some(runtime) = &state.runtime else { return None };
    match runtime.find_container_by_name(name).await {
        Ok(Some(info)) if info.running => {
            let port = *info.ports.get(&container_port)?;
            state.container_ports.insert(name.to_string(), (info.id.clone(), port));
            Some(port)
        }
        _ => {
            state.container_ports.remove(name);
            None
        }
    }
}

fn empty_response(status: StatusCode) -> Response<BoxBody> {
    Response::builder().status(status).body(empty_body()).unwrap()
}

pub async fn handle(
    state: &AppState,
    proxy_client: &ProxyClient,
    endpoint_id: &str,
    container: &ContainerConfig,
    parts: Parts,
    body: Bytes,
    path_and_query: &str,
    mut ctx: ScriptContext,
) -> Response<BoxBody> {
    if state.runtime.is_none() {
        return empty_response(StatusCode::SERVICE_UNAVAILABLE);
    }

    let name = container_name(endpoint_id);
    let Some(host_port) = resolve_port(state, endpoint_id, &name, container.container_port).await else {
        return empty_response(StatusCode::SERVICE_UNAVAILABLE);
    };

    ctx.extra.insert("hostPort".to_string(), host_port.to_string());

    let backend_url = format!("http://127.0.0.1:{host_port}");

    let mut proxy_cfg = container.proxy.clone();
    if proxy_cfg.inbound_headers.is_empty() {
        proxy_cfg.inbound_headers = default_inbound_headers();
    }

    proxy::dispatch(
        proxy_client,
        &proxy_cfg,
        &state.script_host,
        &backend_url,
        parts,
        body,
        path_and_query,
        ctx,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_prefixed_and_stable() {
        assert_eq!(container_name("api"), "relaykeep-api");
    }

    #[test]
    fn default_inbound_headers_rewrite_host_and_forwarded_set() {
        let headers = default_inbound_headers();
        let names: Vec<&str> = headers.iter().map(|h| h.name.as_str()).collect();
        assert!(names.contains(&"host"));
        assert!(names.contains(&"x-forwarded-for"));
        assert!(names.contains(&"x-forwarded-host"));
        assert!(names.contains(&"x-forwarded-proto"));
    }
}
