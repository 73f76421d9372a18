//! Mock handler (spec §4.6). Selects a rule upstream (§4.11), then produces
//! a response from it according to `response_mode`.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};

use super::{full_body, BoxBody};
use crate::config::{Rule, ResponseMode};
use crate::script::{ScriptContext, ScriptHost};
use crate::template;

pub async fn handle(rule: &Rule, ctx: &ScriptContext, script_host: &ScriptHost) -> Response<BoxBody> {
    match rule.response_mode {
        ResponseMode::Static => {
            delay(rule.delay_ms).await;
            build(rule.status_code, &rule.headers, rule.body.clone())
        }
        ResponseMode::Template => {
            delay(rule.delay_ms).await;
            let body = template::render(&rule.body, script_host, ctx).await;
            build(rule.status_code, &rule.headers, body)
        }
        ResponseMode::Script => {
            let script_body = rule.script_body.as_deref().unwrap_or_default();
            match script_host.eval_mock(script_body, ctx).await {
                Ok(resp) => {
                    delay(Some(resp.delay).filter(|d| *d > 0)).await;
                    build_from_map(resp.status, &resp.headers, resp.body)
                }
                Err(e) => {
                    tracing::warn!(rule_id = %rule.id, error = %e, "mock script failed");
                    script_error_response(&e)
                }
            }
        }
    }
}

async fn delay(delay_ms: Option<u64>) {
    if let Some(ms) = delay_ms {
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

fn build(status: u16, headers: &[(String, Vec<String>)], body: String) -> Response<BoxBody> {
    let map: HashMap<String, Vec<String>> = headers.iter().cloned().collect();
    build_from_map(status, &map, body)
}

fn build_from_map(status: u16, headers: &HashMap<String, Vec<String>>, body: String) -> Response<BoxBody> {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    let mut header_map = HeaderMap::new();
    for (name, values) in headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else { continue };
        for value in values {
            let Ok(value) = HeaderValue::from_str(value) else { continue };
            header_map.append(name.clone(), value);
        }
    }
    if !header_map.contains_key(http::header::CONTENT_TYPE) && !body.is_empty() {
        header_map.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
    }

    let mut builder = Response::builder().status(status);
    *builder.headers_mut().unwrap() = header_map;
    builder.body(full_body(Bytes::from(body))).unwrap()
}

/// Script failure in mock mode: 500 with a body carrying the error kind and
/// message (spec §4.2, §7 `ScriptRuntimeError`).
fn script_error_response(err: &crate::error::ScriptError) -> Response<BoxBody> {
    let kind = match err {
        crate::error::ScriptError::Syntax(_) => "syntax",
        crate::error::ScriptError::Thrown(_) => "thrown",
        crate::error::ScriptError::Timeout => "timeout",
    };
    let body = serde_json::json!({ "error": kind, "message": err.to_string() }).to_string();
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(full_body(Bytes::from(body)))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DomainFilter, ValidationPredicate};
    use http_body_util::BodyExt;

    fn rule(status: u16, body: &str) -> Rule {
        Rule {
            id: "r1".into(),
            methods: vec![crate::config::HttpMethod::Get],
            path_pattern: "/x".into(),
            status_code: status,
            headers: vec![],
            body: body.to_string(),
            response_mode: ResponseMode::Static,
            script_body: None,
            validation: ValidationPredicate::default(),
            delay_ms: None,
            enabled: true,
            domain_filter: DomainFilter::Any,
            group: None,
        }
    }

    #[tokio::test]
    async fn static_rule_returns_declared_status_and_body() {
        let script_host = ScriptHost::new(Duration::from_secs(1));
        let ctx = ScriptContext::empty();
        let resp = handle(&rule(201, "created"), &ctx, &script_host).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"created");
    }

    #[tokio::test]
    async fn non_empty_body_without_content_type_gets_octet_stream() {
        let script_host = ScriptHost::new(Duration::from_secs(1));
        let ctx = ScriptContext::empty();
        let resp = handle(&rule(200, "hi"), &ctx, &script_host).await;
        assert_eq!(resp.headers().get(http::header::CONTENT_TYPE).unwrap(), "application/octet-stream");
    }

    #[tokio::test]
    async fn script_mode_can_set_status_and_body() {
        let script_host = ScriptHost::new(Duration::from_secs(1));
        let ctx = ScriptContext::empty();
        let mut r = rule(200, "");
        r.response_mode = ResponseMode::Script;
        r.script_body = Some("response.status = 418; response.body = 'teapot';".into());
        let resp = handle(&r, &ctx, &script_host).await;
        assert_eq!(resp.status().as_u16(), 418);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"teapot");
    }

    #[tokio::test]
    async fn throwing_script_produces_500_with_error_body() {
        let script_host = ScriptHost::new(Duration::from_secs(1));
        let ctx = ScriptContext::empty();
        let mut r = rule(200, "");
        r.response_mode = ResponseMode::Script;
        r.script_body = Some("throw new Error('nope');".into());
        let resp = handle(&r, &ctx, &script_host).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
