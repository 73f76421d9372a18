//! Script host (spec §4.2). Evaluates untrusted JavaScript with a wall-clock
//! deadline and no network/filesystem/process access, via a fresh
//! `boa_engine::Context` per call so scripts cannot leak state across
//! invocations (spec §9 "Script cycles and isolation").

use std::collections::HashMap;
use std::sync::mpsc;
use std::time::Duration;

use boa_engine::object::FunctionObjectBuilder;
use boa_engine::property::Attribute;
use boa_engine::{js_string, Context, JsArgs, JsResult, JsValue, NativeFunction, Source};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::ScriptError;

/// Everything a script (or template, §4.3) may read about the in-flight
/// request. Built fresh per call from the live `http::Request` plus
/// handler-specific extra context (e.g. `hostPort` for container requests).
#[derive(Debug, Clone, Serialize, Default)]
pub struct ScriptContext {
    pub method: String,
    pub path: String,
    pub path_params: HashMap<String, String>,
    pub query_params: HashMap<String, Vec<String>>,
    pub headers: HashMap<String, Vec<String>>,
    pub host: String,
    pub remote_addr: String,
    pub scheme: String,
    pub tls: bool,
    pub body_raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_json: Option<Json>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub body_form: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, String>,
}

impl ScriptContext {
    pub fn empty() -> Self {
        ScriptContext::default()
    }

    fn request_json(&self) -> Json {
        let mut value = serde_json::to_value(self).unwrap_or(Json::Null);
        if let Json::Object(map) = &mut value {
            map.insert(
                "body".to_string(),
                serde_json::json!({
                    "raw": self.body_raw,
                    "json": self.body_json,
                    "form": self.body_form,
                }),
            );
            for (k, v) in &self.extra {
                map.insert(k.clone(), Json::String(v.clone()));
            }
        }
        value
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MockScriptResponse {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub delay: u64,
}

fn default_status() -> u16 {
    200
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredicateScriptResult {
    pub valid: bool,
    #[serde(default)]
    pub error: Option<String>,
}

pub struct ScriptHost {
    timeout: Duration,
}

impl ScriptHost {
    pub fn new(timeout: Duration) -> Self {
        ScriptHost { timeout }
    }

    /// Run `body` in a mock-response script, returning the final `response`
    /// object (spec §4.2, §4.6).
    pub async fn eval_mock(
        &self,
        body: &str,
        ctx: &ScriptContext,
    ) -> Result<MockScriptResponse, ScriptError> {
        let prelude = format!(
            "var request = {}; var response = {{status:200, headers:{{}}, body:\"\", delay:0}};",
            ctx.request_json()
        );
        let epilogue = "JSON.stringify(response)";
        let json = self.run(&prelude, body, epilogue).await?;
        serde_json::from_str(&json).map_err(|e| ScriptError::Thrown(e.to_string()))
    }

    /// Run a validation-predicate script (spec §4.4).
    pub async fn eval_predicate(
        &self,
        body: &str,
        ctx: &ScriptContext,
    ) -> Result<PredicateScriptResult, ScriptError> {
        let prelude = format!("var request = {};", ctx.request_json());
        let wrapped = format!("var __result = (function() {{\n{}\n}})();", body);
        let epilogue = "JSON.stringify(__result)";
        let json = self.run(&prelude, &wrapped, epilogue).await?;
        serde_json::from_str(&json).map_err(|e| ScriptError::Thrown(e.to_string()))
    }

    /// Run a header-expression or body-transform script, coercing the
    /// result to a string (spec §4.5, §4.7).
    pub async fn eval_expression(&self, expr: &str, ctx: &ScriptContext) -> Result<String, ScriptError> {
        let prelude = format!("var request = {};", ctx.request_json());
        let wrapped = format!("var __result = (function() {{\nreturn ({});\n}})();", expr);
        let epilogue = "String(__result)";
        self.run(&prelude, &wrapped, epilogue).await
    }

    /// Body-transform variant: the expression context is `{body, contentType}`
    /// rather than the full request object (spec §4.7).
    pub async fn eval_body_transform(
        &self,
        expr: &str,
        body: &str,
        content_type: &str,
    ) -> Result<String, ScriptError> {
        let prelude = format!(
            "var body = {}; var contentType = {};",
            Json::String(body.to_string()),
            Json::String(content_type.to_string())
        );
        let wrapped = format!("var __result = (function() {{\nreturn ({});\n}})();", expr);
        let epilogue = "String(__result)";
        self.run(&prelude, &wrapped, epilogue).await
    }

    async fn run(&self, prelude: &str, body: &str, epilogue: &str) -> Result<String, ScriptError> {
        let prelude = prelude.to_string();
        let body = body.to_string();
        let epilogue = epilogue.to_string();
        let timeout = self.timeout;

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let result = eval_sandboxed(&prelude, &body, &epilogue);
            // The receiver may already be gone if we timed out; ignore.
            let _ = tx.send(result);
        });

        let handle = tokio::task::spawn_blocking(move || rx.recv_timeout(timeout));
        match handle.await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ScriptError::Timeout),
            Err(_) => Err(ScriptError::Timeout),
        }
    }
}

fn eval_sandboxed(prelude: &str, body: &str, epilogue: &str) -> Result<String, ScriptError> {
    let mut context = Context::default();
    install_globals(&mut context).map_err(|e| ScriptError::Syntax(e.to_string()))?;

    context
        .eval(Source::from_bytes(prelude))
        .map_err(|e| ScriptError::Syntax(e.to_string()))?;
    context
        .eval(Source::from_bytes(body))
        .map_err(|e| ScriptError::Thrown(e.to_string()))?;
    let result = context
        .eval(Source::from_bytes(epilogue))
        .map_err(|e| ScriptError::Thrown(e.to_string()))?;

    result
        .to_string(&mut context)
        .map(|s| s.to_std_string_escaped())
        .map_err(|e| ScriptError::Thrown(e.to_string()))
}

fn install_globals(context: &mut Context) -> JsResult<()> {
    register_fn(context, "uuid", 0, |_this, _args, _ctx| {
        Ok(JsValue::from(js_string!(uuid::Uuid::new_v4().to_string())))
    })?;
    register_fn(context, "now", 0, |_this, _args, _ctx| {
        let millis = chrono::Utc::now().timestamp_millis();
        Ok(JsValue::from(millis as f64))
    })?;
    register_fn(context, "base64Encode", 1, |_this, args, ctx| {
        let input = args.get_or_undefined(0).to_string(ctx)?.to_std_string_escaped();
        use base64::Engine;
        Ok(JsValue::from(js_string!(
            base64::engine::general_purpose::STANDARD.encode(input)
        )))
    })?;
    register_fn(context, "base64Decode", 1, |_this, args, ctx| {
        let input = args.get_or_undefined(0).to_string(ctx)?.to_std_string_escaped();
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(input)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        Ok(JsValue::from(js_string!(decoded)))
    })?;
    register_fn(context, "randomInt", 2, |_this, args, ctx| {
        let min = args.get_or_undefined(0).to_number(ctx)? as i64;
        let max = args.get_or_undefined(1).to_number(ctx)? as i64;
        let value = if max > min {
            min + (rand::random::<u64>() as i64).rem_euclid(max - min)
        } else {
            min
        };
        Ok(JsValue::from(value as f64))
    })?;
    register_fn(context, "randomString", 1, |_this, args, ctx| {
        let len = args.get_or_undefined(0).to_number(ctx)? as usize;
        const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        let s: String = (0..len)
            .map(|_| CHARS[rand::random::<usize>() % CHARS.len()] as char)
            .collect();
        Ok(JsValue::from(js_string!(s)))
    })?;
    register_fn(context, "__consoleLog", 1, |_this, args, ctx| {
        let msg = args.get_or_undefined(0).to_string(ctx)?.to_std_string_escaped();
        tracing::info!(target: "relaykeep::script", "{}", msg);
        Ok(JsValue::undefined())
    })?;
    context
        .eval(Source::from_bytes(
            "var console = { log: function() { __consoleLog(Array.prototype.slice.call(arguments).join(' ')); } };",
        ))
        .map(|_| ())
}

fn register_fn(
    context: &mut Context,
    name: &'static str,
    length: usize,
    f: fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue>,
) -> JsResult<()> {
    let func = FunctionObjectBuilder::new(context.realm(), unsafe { NativeFunction::from_closure(f) })
        .name(name)
        .length(length)
        .build();
    context
        .global_object()
        .define_property_or_throw(
            js_string!(name),
            boa_engine::property::PropertyDescriptor::builder()
                .value(func)
                .writable(true)
                .enumerable(false)
                .configurable(true),
            context,
        )
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expression_script_reads_request_path() {
        let host = ScriptHost::new(Duration::from_secs(2));
        let mut ctx = ScriptContext::empty();
        ctx.path = "/hello".into();
        let out = host.eval_expression("request.path", &ctx).await.unwrap();
        assert_eq!(out, "/hello");
    }

    #[tokio::test]
    async fn mock_script_can_set_status_and_body() {
        let host = ScriptHost::new(Duration::from_secs(2));
        let ctx = ScriptContext::empty();
        let resp = host
            .eval_mock("response.status = 201; response.body = 'created';", &ctx)
            .await
            .unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(resp.body, "created");
    }

    #[tokio::test]
    async fn predicate_script_returns_valid_flag() {
        let host = ScriptHost::new(Duration::from_secs(2));
        let ctx = ScriptContext::empty();
        let result = host
            .eval_predicate("return { valid: true };", &ctx)
            .await
            .unwrap();
        assert!(result.valid);
    }

    #[tokio::test]
    async fn thrown_exception_surfaces_as_script_error() {
        let host = ScriptHost::new(Duration::from_secs(2));
        let ctx = ScriptContext::empty();
        let err = host.eval_expression("throw new Error('boom')", &ctx).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn infinite_loop_times_out() {
        let host = ScriptHost::new(Duration::from_millis(100));
        let ctx = ScriptContext::empty();
        let err = host.eval_expression("while(true) {}", &ctx).await;
        assert!(matches!(err, Err(ScriptError::Timeout)));
    }
}
