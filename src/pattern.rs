//! Path-pattern matcher (spec §4.1). Compiles a pattern string into one of
//! four variants and matches a request path against it, extracting named
//! params along the way.

use std::collections::HashMap;

use regex::Regex;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Exact = 0,
    Wildcard = 1,
    Param = 2,
    Regex = 3,
}

#[derive(Debug, Clone)]
pub enum CompiledPattern {
    Exact(String),
    Wildcard(Vec<Segment>),
    Param(Vec<Segment>),
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub enum Segment {
    Literal(String),
    Wildcard,
    Param(String),
}

impl CompiledPattern {
    pub fn compile(pattern: &str) -> Result<CompiledPattern, ConfigError> {
        if let Some(body) = pattern.strip_prefix('^') {
            let _ = body; // anchored regex, fallthrough below handles it uniformly
        }
        if looks_like_regex(pattern) {
            let anchored = anchor_regex(pattern);
            let re = Regex::new(&anchored).map_err(|source| ConfigError::InvalidRegex {
                pattern: pattern.to_string(),
                source,
            })?;
            return Ok(CompiledPattern::Regex(re));
        }

        let segments: Vec<Segment> = pattern
            .split('/')
            .map(|seg| {
                if seg == "*" {
                    Segment::Wildcard
                } else if let Some(name) = seg.strip_prefix(':') {
                    Segment::Param(name.to_string())
                } else if seg.starts_with('{') && seg.ends_with('}') && seg.len() > 2 {
                    Segment::Param(seg[1..seg.len() - 1].to_string())
                } else {
                    Segment::Literal(seg.to_string())
                }
            })
            .collect();

        if segments.iter().any(|s| matches!(s, Segment::Param(_))) {
            Ok(CompiledPattern::Param(segments))
        } else if segments.iter().any(|s| matches!(s, Segment::Wildcard)) {
            Ok(CompiledPattern::Wildcard(segments))
        } else {
            Ok(CompiledPattern::Exact(pattern.to_string()))
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            CompiledPattern::Exact(_) => Priority::Exact,
            CompiledPattern::Wildcard(_) => Priority::Wildcard,
            CompiledPattern::Param(_) => Priority::Param,
            CompiledPattern::Regex(_) => Priority::Regex,
        }
    }

    /// Returns extracted params on a match, `None` otherwise.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        match self {
            CompiledPattern::Exact(p) => (p == path).then(HashMap::new),
            CompiledPattern::Wildcard(segs) => match_segments(segs, path),
            CompiledPattern::Param(segs) => match_segments(segs, path),
            CompiledPattern::Regex(re) => {
                let caps = re.captures(path)?;
                let mut params = HashMap::new();
                for name in re.capture_names().flatten() {
                    if let Some(m) = caps.name(name) {
                        params.insert(name.to_string(), m.as_str().to_string());
                    }
                }
                Some(params)
            }
        }
    }
}

fn match_segments(segs: &[Segment], path: &str) -> Option<HashMap<String, String>> {
    let path_segs: Vec<&str> = path.split('/').collect();
    if path_segs.len() != segs.len() {
        return None;
    }
    let mut params = HashMap::new();
    for (seg, actual) in segs.iter().zip(path_segs.iter()) {
        match seg {
            Segment::Literal(lit) => {
                if lit != actual {
                    return None;
                }
            }
            Segment::Wildcard => {}
            Segment::Param(name) => {
                params.insert(name.clone(), actual.to_string());
            }
        }
    }
    Some(params)
}

/// Heuristic: a pattern is treated as regex if it contains characters that
/// never appear in the literal/wildcard/param grammar (spec: "anchored on
/// both ends"). Callers that want an unambiguous regex pattern should anchor
/// it with `^...$`.
fn looks_like_regex(pattern: &str) -> bool {
    pattern.starts_with('^') || pattern.ends_with('$') || pattern.contains("(?P<")
}

/// A regex rule pattern is "anchored on both ends" regardless of what the
/// user wrote (spec §4.1): wrap unanchored patterns so `matches` never
/// accepts a mere substring match.
fn anchor_regex(pattern: &str) -> String {
    match (pattern.starts_with('^'), pattern.ends_with('$')) {
        (true, true) => pattern.to_string(),
        (true, false) => format!("{pattern}$"),
        (false, true) => format!("^{pattern}"),
        (false, false) => format!("^(?:{pattern})$"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_matches_only_identical_path() {
        let p = CompiledPattern::compile("/users/admin").unwrap();
        assert!(p.matches("/users/admin").is_some());
        assert!(p.matches("/users/42").is_none());
        assert_eq!(p.priority(), Priority::Exact);
    }

    #[test]
    fn wildcard_matches_single_segment() {
        let p = CompiledPattern::compile("/files/*").unwrap();
        assert!(p.matches("/files/readme.txt").is_some());
        assert!(p.matches("/files/a/b").is_none());
        assert_eq!(p.priority(), Priority::Wildcard);
    }

    #[test]
    fn param_captures_named_segment() {
        let p = CompiledPattern::compile("/users/:id").unwrap();
        let m = p.matches("/users/42").unwrap();
        assert_eq!(m.get("id").unwrap(), "42");
        assert_eq!(p.priority(), Priority::Param);
    }

    #[test]
    fn brace_param_syntax_also_supported() {
        let p = CompiledPattern::compile("/users/{id}").unwrap();
        let m = p.matches("/users/7").unwrap();
        assert_eq!(m.get("id").unwrap(), "7");
    }

    #[test]
    fn regex_pattern_exports_named_groups() {
        let p = CompiledPattern::compile(r"^/orders/(?P<order_id>\d+)$").unwrap();
        let m = p.matches("/orders/123").unwrap();
        assert_eq!(m.get("order_id").unwrap(), "123");
        assert_eq!(p.priority(), Priority::Regex);
        assert!(p.matches("/orders/abc").is_none());
    }

    #[test]
    fn unanchored_regex_pattern_is_anchored_at_compile_time() {
        let p = CompiledPattern::compile(r"foo(?P<x>\d+)bar").unwrap();
        assert!(p.matches("foo123bar").is_some());
        assert!(p.matches("xfoo123bar").is_none());
        assert!(p.matches("foo123barx").is_none());
    }

    #[test]
    fn priority_ordering_exact_lt_wildcard_lt_param_lt_regex() {
        assert!(Priority::Exact < Priority::Wildcard);
        assert!(Priority::Wildcard < Priority::Param);
        assert!(Priority::Param < Priority::Regex);
    }
}
