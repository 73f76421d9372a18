//! Dispatch core (spec §4.11). Selects an endpoint by (domain, path
//! prefix), translates the path, selects a rule (mock endpoints only) by
//! pattern priority, and dispatches to the matching handler.

use std::net::SocketAddr;

use bytes::Bytes;
use http::request::Parts;
use http::{Response, StatusCode};

use crate::config::{Config, DomainFilter, EndpointConfig, InterceptContext, TranslationMode};
use crate::handlers::{container, empty_body, mock, proxy, BoxBody};
use crate::predicate;
use crate::reqctx;
use crate::state::AppState;

fn empty_response(status: StatusCode) -> Response<BoxBody> {
    Response::builder().status(status).body(empty_body()).unwrap()
}

fn path_and_query(parts: &Parts) -> String {
    match parts.uri.query() {
        Some(q) => format!("{}?{}", parts.uri.path(), q),
        None => parts.uri.path().to_string(),
    }
}

fn strip_prefix_path(path: &str, prefix: &str) -> String {
    let stripped = path.strip_prefix(prefix).unwrap_or(path);
    if stripped.starts_with('/') {
        stripped.to_string()
    } else {
        format!("/{stripped}")
    }
}

/// Whether `host` is covered by an *enabled* intercepted-domain entry, and
/// if so whether it runs in overlay mode (spec §4.13 step 2).
fn overlay_enabled_for_host(cfg: &Config, host: &str) -> bool {
    cfg.socks5
        .intercepted_domains
        .iter()
        .filter(|d| d.enabled)
        .find(|d| regex::Regex::new(&d.pattern).map(|re| re.is_match(host)).unwrap_or(false))
        .map(|d| d.overlay_mode)
        .unwrap_or(false)
}

/// Entry point shared by the public HTTP(S) listeners and the SOCKS5
/// loopback listener; `arrived_via_intercept` distinguishes the two (spec
/// §9 open question: `all_intercepted` is re-evaluated against live state,
/// not a snapshot taken at connect time — see SPEC_FULL §3 decision 1).
pub async fn dispatch(
    state: &AppState,
    proxy_client: &proxy::ProxyClient,
    parts: Parts,
    body: Bytes,
    remote_addr: SocketAddr,
    scheme: &str,
    tls: bool,
    arrived_via_intercept: bool,
) -> Response<BoxBody> {
    let mut ctx = reqctx::build(&parts, &body, remote_addr, scheme, tls);
    let cfg = state.config.load();
    let routes = state.routes.load();

    let enabled_patterns: Vec<String> = cfg
        .socks5
        .intercepted_domains
        .iter()
        .filter(|d| d.enabled)
        .map(|d| d.pattern.clone())
        .collect();
    let intercept = InterceptContext {
        arrived_via_intercept,
        enabled_patterns: &enabled_patterns,
    };

    let mut best: Option<(usize, usize)> = None; // (prefix_len, endpoint_index)
    for (idx, endpoint) in cfg.endpoints.iter().enumerate() {
        if !endpoint.enabled {
            continue;
        }
        if !endpoint.domain_filter.accepts(&ctx.host, &intercept) {
            continue;
        }
        if !ctx.path.starts_with(endpoint.path_prefix.as_str()) {
            continue;
        }
        let len = endpoint.path_prefix.len();
        if best.map(|(best_len, _)| len > best_len).unwrap_or(true) {
            best = Some((len, idx));
        }
    }

    let Some((_, endpoint_idx)) = best else {
        if arrived_via_intercept && overlay_enabled_for_host(&cfg, &ctx.host) {
            return overlay_passthrough(state, proxy_client, parts, body, ctx, scheme).await;
        }
        return empty_response(StatusCode::NOT_FOUND);
    };
    let endpoint = &cfg.endpoints[endpoint_idx];

    let translated_path = match endpoint.translation_mode {
        TranslationMode::None => ctx.path.clone(),
        TranslationMode::Strip => strip_prefix_path(&ctx.path, &endpoint.path_prefix),
        TranslationMode::Translate => routes
            .endpoints
            .get(&endpoint.id)
            .and_then(|e| e.translate_regex.as_ref())
            .map(|re| {
                re.replace(&ctx.path, endpoint.translate_replace.as_deref().unwrap_or(""))
                    .into_owned()
            })
            .unwrap_or_else(|| ctx.path.clone()),
    };

    let query_suffix = parts.uri.query().map(|q| format!("?{q}")).unwrap_or_default();
    let translated_path_and_query = format!("{translated_path}{query_suffix}");

    match &endpoint.config {
        EndpointConfig::Mock { rules } => {
            let Some(compiled) = routes.endpoints.get(&endpoint.id) else {
                return empty_response(StatusCode::NOT_FOUND);
            };

            let mut best_rule: Option<(crate::pattern::Priority, usize)> = None;
            let mut best_params = std::collections::HashMap::new();

            for (idx, rule) in rules.iter().enumerate() {
                if !rule.enabled {
                    continue;
                }
                if !rule.methods.iter().any(|m| m.as_http() == parts.method) {
                    continue;
                }
                if !rule.domain_filter.accepts(&ctx.host, &intercept) {
                    continue;
                }
                let Some(compiled_rule) = compiled.rules.get(idx) else { continue };
                let Some(mut params) = compiled_rule.pattern.matches(&translated_path) else { continue };

                let outcome = predicate::evaluate(&rule.validation, &ctx.body_raw, &state.script_host, &ctx).await;
                if !outcome.passed {
                    continue;
                }
                params.extend(outcome.captured_params);

                let priority = compiled_rule.pattern.priority();
                let better = best_rule.map(|(p, _)| priority < p).unwrap_or(true);
                if better {
                    best_rule = Some((priority, idx));
                    best_params = params;
                }
            }

            let Some((_, rule_idx)) = best_rule else {
                return empty_response(StatusCode::NOT_FOUND);
            };
            ctx.path_params = best_params;
            mock::handle(&rules[rule_idx], &ctx, &state.script_host).await
        }
        EndpointConfig::Proxy { proxy: proxy_cfg } => {
            proxy::dispatch(
                proxy_client,
                proxy_cfg,
                &state.script_host,
                &proxy_cfg.backend_url,
                parts,
                body,
                &translated_path_and_query,
                ctx,
            )
            .await
        }
        EndpointConfig::Container { container: container_cfg } => {
            container::handle(
                state,
                proxy_client,
                &endpoint.id,
                container_cfg,
                parts,
                body,
                &translated_path_and_query,
                ctx,
            )
            .await
        }
    }
}

async fn overlay_passthrough(
    state: &AppState,
    client: &proxy::ProxyClient,
    parts: Parts,
    body: Bytes,
    ctx: crate::script::ScriptContext,
    scheme: &str,
) -> Response<BoxBody> {
    let port: u16 = if scheme == "https" { 443 } else { 80 };
    match state.dns_cache.resolve(&ctx.host, port).await {
        Ok(ip) => {
            let backend_url = format!("{scheme}://{ip}:{port}");
            let proxy_cfg = crate::config::ProxyConfig {
                status_passthrough: true,
                ..crate::config::ProxyConfig::default()
            };
            let pq = path_and_query(&parts);
            proxy::dispatch(client, &proxy_cfg, &state.script_host, &backend_url, parts, body, &pq, ctx).await
        }
        Err(e) => {
            tracing::warn!(error = %e, host = %ctx.host, "overlay dns resolution failed");
            empty_response(StatusCode::BAD_GATEWAY)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_prefix_always_yields_leading_slash() {
        assert_eq!(strip_prefix_path("/api/v1/users", "/api"), "/v1/users");
        assert_eq!(strip_prefix_path("/api", "/api"), "/");
    }

    #[test]
    fn overlay_disabled_when_no_intercepted_domain_matches() {
        let cfg = Config::default();
        assert!(!overlay_enabled_for_host(&cfg, "example.test"));
    }

    #[test]
    fn overlay_enabled_when_matching_entry_has_overlay_mode() {
        let mut cfg = Config::default();
        cfg.socks5.intercepted_domains.push(crate::config::InterceptedDomain {
            pattern: r"^api\.test\.local$".to_string(),
            overlay_mode: true,
            enabled: true,
        });
        assert!(overlay_enabled_for_host(&cfg, "api.test.local"));
    }
}
