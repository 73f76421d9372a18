//! Request-validation predicate (spec §4.4). Decides whether a rule applies
//! based on the request body. A failing predicate is not an error: the rule
//! is simply skipped and the router tries the next one (spec §7
//! `PredicateFail`).

use std::collections::HashMap;

use regex::Regex;

use crate::config::{StaticMatchMode, ValidationMode, ValidationPredicate};
use crate::script::{ScriptContext, ScriptHost};

pub struct PredicateOutcome {
    pub passed: bool,
    /// Named groups captured by a `regex` predicate, merged into the rule's
    /// `pathParams` for later stages (spec §4.4).
    pub captured_params: HashMap<String, String>,
}

impl PredicateOutcome {
    fn pass() -> Self {
        PredicateOutcome {
            passed: true,
            captured_params: HashMap::new(),
        }
    }
    fn fail() -> Self {
        PredicateOutcome {
            passed: false,
            captured_params: HashMap::new(),
        }
    }
}

pub async fn evaluate(
    predicate: &ValidationPredicate,
    body: &str,
    script_host: &ScriptHost,
    ctx: &ScriptContext,
) -> PredicateOutcome {
    match predicate.mode {
        ValidationMode::None => PredicateOutcome::pass(),
        ValidationMode::Static => {
            let pattern = predicate.pattern.as_deref().unwrap_or("");
            let matched = match predicate.static_mode.unwrap_or(StaticMatchMode::Contains) {
                StaticMatchMode::Contains => body.contains(pattern),
                StaticMatchMode::Exact => body == pattern,
            };
            if matched {
                PredicateOutcome::pass()
            } else {
                PredicateOutcome::fail()
            }
        }
        ValidationMode::Regex => {
            let Some(pattern) = predicate.pattern.as_deref() else {
                return PredicateOutcome::fail();
            };
            let Ok(re) = Regex::new(pattern) else {
                tracing::warn!(pattern, "predicate regex failed to compile");
                return PredicateOutcome::fail();
            };
            match re.captures(body) {
                Some(caps) => {
                    let mut captured_params = HashMap::new();
                    for name in re.capture_names().flatten() {
                        if let Some(m) = caps.name(name) {
                            captured_params.insert(name.to_string(), m.as_str().to_string());
                        }
                    }
                    PredicateOutcome {
                        passed: true,
                        captured_params,
                    }
                }
                None => PredicateOutcome::fail(),
            }
        }
        ValidationMode::Script => {
            let Some(script_body) = predicate.script_body.as_deref() else {
                return PredicateOutcome::fail();
            };
            match script_host.eval_predicate(script_body, ctx).await {
                Ok(result) => {
                    if !result.valid {
                        if let Some(msg) = result.error {
                            tracing::warn!(error = %msg, "validation predicate reported invalid");
                        }
                    }
                    if result.valid {
                        PredicateOutcome::pass()
                    } else {
                        PredicateOutcome::fail()
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "validation predicate script failed");
                    PredicateOutcome::fail()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn host() -> ScriptHost {
        ScriptHost::new(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn none_mode_always_passes() {
        let p = ValidationPredicate {
            mode: ValidationMode::None,
            ..Default::default()
        };
        let out = evaluate(&p, "anything", &host(), &ScriptContext::empty()).await;
        assert!(out.passed);
    }

    #[tokio::test]
    async fn static_contains_mode() {
        let p = ValidationPredicate {
            mode: ValidationMode::Static,
            static_mode: Some(StaticMatchMode::Contains),
            pattern: Some("hello".into()),
            ..Default::default()
        };
        assert!(evaluate(&p, "say hello world", &host(), &ScriptContext::empty()).await.passed);
        assert!(!evaluate(&p, "goodbye", &host(), &ScriptContext::empty()).await.passed);
    }

    #[tokio::test]
    async fn static_exact_mode() {
        let p = ValidationPredicate {
            mode: ValidationMode::Static,
            static_mode: Some(StaticMatchMode::Exact),
            pattern: Some("exact".into()),
            ..Default::default()
        };
        assert!(evaluate(&p, "exact", &host(), &ScriptContext::empty()).await.passed);
        assert!(!evaluate(&p, "exactly", &host(), &ScriptContext::empty()).await.passed);
    }

    #[tokio::test]
    async fn regex_mode_exports_named_groups() {
        let p = ValidationPredicate {
            mode: ValidationMode::Regex,
            pattern: Some(r#""id":"(?P<id>\d+)""#.to_string()),
            ..Default::default()
        };
        let out = evaluate(&p, r#"{"id":"42"}"#, &host(), &ScriptContext::empty()).await;
        assert!(out.passed);
        assert_eq!(out.captured_params.get("id").unwrap(), "42");
    }

    #[tokio::test]
    async fn script_mode_uses_valid_flag() {
        let p = ValidationPredicate {
            mode: ValidationMode::Script,
            script_body: Some("return { valid: request.body.raw.length > 0 };".into()),
            ..Default::default()
        };
        let mut ctx = ScriptContext::empty();
        ctx.body_raw = "x".into();
        assert!(evaluate(&p, "x", &host(), &ctx).await.passed);
    }
}
