//! Template engine (spec §4.3). Minimal `{{expr}}` text substitution over
//! the same context the script host exposes, plus a handful of string
//! helpers. Fails closed: any evaluation error leaves the raw template text
//! in place for that one substitution and logs a warning.

use crate::script::{ScriptContext, ScriptHost};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Expand `template`, replacing each `{{expr}}` with the string result of
/// evaluating `expr` as a script-host expression. A failing expression keeps
/// its literal `{{expr}}` text in the output (spec §4.3).
pub async fn render(template: &str, script_host: &ScriptHost, ctx: &ScriptContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    loop {
        let Some(start) = rest.find(OPEN) else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            // Unterminated `{{`: emit literally and stop scanning.
            out.push_str(&rest[start..]);
            break;
        };
        let expr = after_open[..end].trim();
        match script_host.eval_expression(&wrap_helpers(expr), ctx).await {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                tracing::warn!(target: "relaykeep::template", expr, "template expression failed, keeping literal");
                out.push_str(OPEN);
                out.push_str(expr);
                out.push_str(CLOSE);
            }
        }
        rest = &after_open[end + CLOSE.len()..];
    }

    out
}

/// Wrap a bare expression with the template's helper prelude
/// (`json`, `base64Encode/Decode`, `upper/lower/title/trim`, `now`, `uuid`,
/// `randomInt`, `randomString` — spec §4.3) so the script host's generic
/// expression evaluator can serve both templates and header expressions.
fn wrap_helpers(expr: &str) -> String {
    format!(
        "(function() {{\n\
           function upper(s) {{ return String(s).toUpperCase(); }}\n\
           function lower(s) {{ return String(s).toLowerCase(); }}\n\
           function trim(s) {{ return String(s).trim(); }}\n\
           function title(s) {{ return String(s).replace(/\\w\\S*/g, function(t) {{ return t.charAt(0).toUpperCase() + t.substr(1).toLowerCase(); }}); }}\n\
           function json(v) {{ return JSON.stringify(v); }}\n\
           return ({});\n\
         }})()",
        expr
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn substitutes_request_fields() {
        let host = ScriptHost::new(Duration::from_secs(2));
        let mut ctx = ScriptContext::empty();
        ctx.path = "/widgets/7".into();
        let out = render("path is {{request.path}}", &host, &ctx).await;
        assert_eq!(out, "path is /widgets/7");
    }

    #[tokio::test]
    async fn helper_functions_are_available() {
        let host = ScriptHost::new(Duration::from_secs(2));
        let ctx = ScriptContext::empty();
        let out = render("{{upper('abc')}}", &host, &ctx).await;
        assert_eq!(out, "ABC");
    }

    #[tokio::test]
    async fn failing_expression_keeps_literal_text() {
        let host = ScriptHost::new(Duration::from_secs(2));
        let ctx = ScriptContext::empty();
        let out = render("before {{nonexistentFn()}} after", &host, &ctx).await;
        assert_eq!(out, "before {{nonexistentFn()}} after");
    }

    #[tokio::test]
    async fn plain_text_without_placeholders_is_unchanged() {
        let host = ScriptHost::new(Duration::from_secs(2));
        let ctx = ScriptContext::empty();
        let out = render("just plain text", &host, &ctx).await;
        assert_eq!(out, "just plain text");
    }
}
