//! Header manipulation engine (spec §4.5). Applied twice per proxied
//! request: inbound before dispatch to the backend, outbound before the
//! response is written back to the client.

use http::{HeaderMap, HeaderName, HeaderValue};

use crate::config::{HeaderManipulation, HeaderMode};
use crate::script::{ScriptContext, ScriptHost};

/// RFC 7230 §6.1 hop-by-hop headers, stripped unconditionally after user
/// rules have run on the inbound path (spec §4.5, §8 "Hop-by-hop").
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    if let Some(conn_val) = headers
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
    {
        for token in conn_val.split(',') {
            let name = token.trim();
            if !name.is_empty() {
                headers.remove(name);
            }
        }
    }
}

/// Apply a declared-order list of manipulations. Later entries for the same
/// header name replace earlier effects (spec §4.5, §8 "Header idempotence").
pub async fn apply(
    rules: &[HeaderManipulation],
    headers: &mut HeaderMap,
    script_host: &ScriptHost,
    ctx: &ScriptContext,
) {
    for rule in rules {
        let name = match HeaderName::from_bytes(rule.name.as_bytes()) {
            Ok(n) => n,
            Err(_) => continue,
        };
        match rule.mode {
            HeaderMode::Drop => {
                headers.remove(&name);
            }
            HeaderMode::Replace => {
                if let Some(value) = &rule.value {
                    if let Ok(hv) = HeaderValue::from_str(value) {
                        headers.insert(name, hv);
                    }
                }
            }
            HeaderMode::Expression => {
                let Some(expr) = &rule.expression else { continue };
                match script_host.eval_expression(expr, ctx).await {
                    Ok(value) => {
                        if let Ok(hv) = HeaderValue::from_str(&value) {
                            headers.insert(name, hv);
                        }
                        // else: coercion produced something invalid as a header
                        // value; leave the header unchanged (spec §4.5).
                    }
                    Err(_) => {
                        // Script failure: leave the header unchanged and let the
                        // caller's error log record it (spec §7 ScriptRuntimeError).
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_hop_by_hop_removes_standard_set() {
        let mut h = HeaderMap::new();
        h.insert("Connection", HeaderValue::from_static("keep-alive"));
        h.insert("Keep-Alive", HeaderValue::from_static("timeout=5"));
        h.insert("X-Custom", HeaderValue::from_static("keep"));
        strip_hop_by_hop(&mut h);
        assert!(h.get("connection").is_none());
        assert!(h.get("keep-alive").is_none());
        assert!(h.get("x-custom").is_some());
    }

    #[test]
    fn strip_hop_by_hop_honors_connection_token_list() {
        let mut h = HeaderMap::new();
        h.insert("Connection", HeaderValue::from_static("x-extra"));
        h.insert("X-Extra", HeaderValue::from_static("value"));
        strip_hop_by_hop(&mut h);
        assert!(h.get("x-extra").is_none());
    }

    #[tokio::test]
    async fn empty_rule_list_leaves_headers_unchanged() {
        let mut h = HeaderMap::new();
        h.insert("X-Foo", HeaderValue::from_static("bar"));
        let host = ScriptHost::new(std::time::Duration::from_secs(1));
        let ctx = ScriptContext::empty();
        apply(&[], &mut h, &host, &ctx).await;
        assert_eq!(h.get("x-foo").unwrap(), "bar");
    }

    #[tokio::test]
    async fn repeated_drop_equals_single_drop() {
        let mut h = HeaderMap::new();
        h.insert("X-Foo", HeaderValue::from_static("bar"));
        let rules = vec![
            HeaderManipulation {
                name: "X-Foo".into(),
                mode: HeaderMode::Drop,
                value: None,
                expression: None,
            },
            HeaderManipulation {
                name: "X-Foo".into(),
                mode: HeaderMode::Drop,
                value: None,
                expression: None,
            },
        ];
        let host = ScriptHost::new(std::time::Duration::from_secs(1));
        let ctx = ScriptContext::empty();
        apply(&rules, &mut h, &host, &ctx).await;
        assert!(h.get("x-foo").is_none());
    }

    #[tokio::test]
    async fn replace_then_replace_keeps_last_value() {
        let mut h = HeaderMap::new();
        let rules = vec![
            HeaderManipulation {
                name: "X-Foo".into(),
                mode: HeaderMode::Replace,
                value: Some("first".into()),
                expression: None,
            },
            HeaderManipulation {
                name: "X-Foo".into(),
                mode: HeaderMode::Replace,
                value: Some("second".into()),
                expression: None,
            },
        ];
        let host = ScriptHost::new(std::time::Duration::from_secs(1));
        let ctx = ScriptContext::empty();
        apply(&rules, &mut h, &host, &ctx).await;
        assert_eq!(h.get("x-foo").unwrap(), "second");
    }
}
