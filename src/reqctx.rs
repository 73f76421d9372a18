//! Builds a [`ScriptContext`] from an inbound request's parts and buffered
//! body. Shared by the router, predicate evaluation, and all three handlers
//! so request introspection is defined exactly once.

use std::collections::HashMap;
use std::net::SocketAddr;

use http::request::Parts;
use url::Url;

use crate::script::ScriptContext;

pub fn build(
    parts: &Parts,
    body: &[u8],
    remote_addr: SocketAddr,
    scheme: &str,
    tls: bool,
) -> ScriptContext {
    let host = parts
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(strip_port)
        .unwrap_or_default();

    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in parts.headers.iter() {
        if let Ok(v) = value.to_str() {
            headers.entry(name.as_str().to_string()).or_default().push(v.to_string());
        }
    }

    let query_params = parse_query(parts.uri.query().unwrap_or(""));
    let body_raw = String::from_utf8_lossy(body).into_owned();
    let body_json = serde_json::from_slice(body).ok();
    let content_type = parts
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let body_form = if content_type.starts_with("application/x-www-form-urlencoded") {
        parse_form(&body_raw)
    } else {
        HashMap::new()
    };

    ScriptContext {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        path_params: HashMap::new(),
        query_params,
        headers,
        host,
        remote_addr: remote_addr.ip().to_string(),
        scheme: scheme.to_string(),
        tls,
        body_raw,
        body_json,
        body_form,
        extra: HashMap::new(),
    }
}

fn strip_port(host: &str) -> String {
    host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host).to_string()
}

fn parse_query(query: &str) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    if query.is_empty() {
        return map;
    }
    let url = Url::parse(&format!("http://placeholder/?{query}"));
    if let Ok(url) = url {
        for (k, v) in url.query_pairs() {
            map.entry(k.into_owned()).or_default().push(v.into_owned());
        }
    }
    map
}

fn parse_form(body: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Ok(url) = Url::parse(&format!("http://placeholder/?{body}")) {
        for (k, v) in url.query_pairs() {
            map.insert(k.into_owned(), v.into_owned());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    #[test]
    fn extracts_host_without_port_and_query_params() {
        let req = Request::builder()
            .method("GET")
            .uri("/search?q=rust&q=lang")
            .header("host", "example.test:8080")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let ctx = build(&parts, b"", addr, "http", false);
        assert_eq!(ctx.host, "example.test");
        assert_eq!(ctx.query_params.get("q").unwrap(), &vec!["rust".to_string(), "lang".to_string()]);
    }

    #[test]
    fn json_body_is_parsed_when_valid() {
        let req = Request::builder().method("POST").uri("/x").body(()).unwrap();
        let (parts, _) = req.into_parts();
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let ctx = build(&parts, br#"{"a":1}"#, addr, "http", false);
        assert!(ctx.body_json.is_some());
    }
}
