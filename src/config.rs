//! In-memory configuration tree (spec §3) plus load/migrate helpers (spec §6).
//!
//! This struct is the entire contract with the external config-file
//! collaborator: it owns load/save of the on-disk document and hands us a
//! `Config` (or its serialized JSON, via [`load`]); we never touch a path on
//! disk ourselves beyond that single entry point.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_HTTPS_PORT: u16 = 8443;
pub const DEFAULT_SOCKS5_PORT: u16 = 1080;
pub const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_http(&self) -> http::Method {
        match self {
            HttpMethod::Get => http::Method::GET,
            HttpMethod::Post => http::Method::POST,
            HttpMethod::Put => http::Method::PUT,
            HttpMethod::Delete => http::Method::DELETE,
            HttpMethod::Patch => http::Method::PATCH,
            HttpMethod::Head => http::Method::HEAD,
            HttpMethod::Options => http::Method::OPTIONS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TranslationMode {
    #[default]
    None,
    Strip,
    Translate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Mock,
    Proxy,
    Container,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum DomainFilter {
    #[default]
    Any,
    AllIntercepted,
    Specific {
        patterns: Vec<String>,
    },
}

/// Per-request context needed only by the `all_intercepted` domain filter
/// mode: whether this request reached the HTTP engine via a SOCKS5 domain
/// takeover at all, plus the *currently enabled* intercepted-domain patterns
/// from the live config (not a point-in-time snapshot — see SPEC_FULL §3,
/// decision 1).
pub struct InterceptContext<'a> {
    pub arrived_via_intercept: bool,
    pub enabled_patterns: &'a [String],
}

impl<'a> InterceptContext<'a> {
    pub fn none() -> InterceptContext<'static> {
        InterceptContext {
            arrived_via_intercept: false,
            enabled_patterns: &[],
        }
    }

    fn matches_live(&self, host: &str) -> bool {
        self.arrived_via_intercept && self.enabled_patterns.iter().any(|p| {
            regex::Regex::new(p).map(|re| re.is_match(host)).unwrap_or(false)
        })
    }
}

impl DomainFilter {
    pub fn accepts(&self, host: &str, intercept: &InterceptContext) -> bool {
        match self {
            DomainFilter::Any => true,
            DomainFilter::AllIntercepted => intercept.matches_live(host),
            DomainFilter::Specific { patterns } => patterns.iter().any(|p| domain_matches(p, host)),
        }
    }
}

fn domain_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        host.len() > suffix.len() && host.ends_with(suffix) && host[..host.len() - suffix.len()].ends_with('.')
            || host == suffix
    } else {
        pattern.eq_ignore_ascii_case(host)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderMode {
    Drop,
    Replace,
    Expression,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderManipulation {
    pub name: String,
    pub mode: HeaderMode,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub expression: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    None,
    Static,
    Regex,
    Script,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaticMatchMode {
    Contains,
    Exact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationPredicate {
    pub mode: ValidationMode,
    #[serde(default)]
    pub static_mode: Option<StaticMatchMode>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub script_body: Option<String>,
}

impl Default for ValidationPredicate {
    fn default() -> Self {
        ValidationPredicate {
            mode: ValidationMode::None,
            static_mode: None,
            pattern: None,
            script_body: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Static,
    Template,
    Script,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub methods: Vec<HttpMethod>,
    pub path_pattern: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: Vec<(String, Vec<String>)>,
    #[serde(default)]
    pub body: String,
    pub response_mode: ResponseMode,
    #[serde(default)]
    pub script_body: Option<String>,
    #[serde(default)]
    pub validation: ValidationPredicate,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub domain_filter: DomainFilter,
    #[serde(default)]
    pub group: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Rule {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.methods.is_empty() {
            return Err(ConfigError::EmptyMethodSet {
                rule_id: self.id.clone(),
            });
        }
        if self.response_mode == ResponseMode::Script && self.script_body.is_none() {
            return Err(ConfigError::MissingScriptBody {
                rule_id: self.id.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTranslation {
    pub pattern: String,
    pub target: u16,
}

impl StatusTranslation {
    pub fn matches(&self, status: u16) -> bool {
        if let Some(class) = self.pattern.strip_suffix("xx") {
            if let Ok(digit) = class.parse::<u16>() {
                return status / 100 == digit;
            }
            false
        } else if let Ok(exact) = self.pattern.parse::<u16>() {
            status == exact
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_interval")]
    pub interval_s: u64,
    #[serde(default = "default_health_path")]
    pub path: String,
}

fn default_health_interval() -> u64 {
    30
}
fn default_health_path() -> String {
    "/".to_string()
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        HealthCheckConfig {
            enabled: false,
            interval_s: default_health_interval(),
            path: default_health_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub backend_url: String,
    #[serde(default = "default_proxy_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub inbound_headers: Vec<HeaderManipulation>,
    #[serde(default)]
    pub outbound_headers: Vec<HeaderManipulation>,
    #[serde(default)]
    pub status_passthrough: bool,
    #[serde(default)]
    pub status_translation: Vec<StatusTranslation>,
    #[serde(default)]
    pub body_transform: String,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

fn default_proxy_timeout() -> u64 {
    DEFAULT_PROXY_TIMEOUT_SECS
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            backend_url: String::new(),
            timeout_secs: default_proxy_timeout(),
            inbound_headers: Vec::new(),
            outbound_headers: Vec::new(),
            status_passthrough: false,
            status_translation: Vec::new(),
            body_transform: String::new(),
            health_check: HealthCheckConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    Always,
    UnlessStopped,
    OnFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvEntry {
    pub name: String,
    /// Either a static literal, or (if `is_script`) a script expression
    /// evaluated once at container creation with the same request-less
    /// context helpers as the template engine.
    pub value: String,
    #[serde(default)]
    pub is_script: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMapping {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(flatten)]
    pub proxy: ProxyConfig,
    pub image: String,
    pub container_port: u16,
    #[serde(default)]
    pub pull_on_startup: bool,
    #[serde(default)]
    pub restart_on_server_start: bool,
    #[serde(default = "default_restart_policy")]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub env: Vec<EnvEntry>,
    #[serde(default)]
    pub volumes: Vec<VolumeMapping>,
}

fn default_restart_policy() -> RestartPolicy {
    RestartPolicy::No
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndpointConfig {
    Mock { rules: Vec<Rule> },
    Proxy { proxy: ProxyConfig },
    Container { container: ContainerConfig },
}

impl EndpointConfig {
    pub fn kind(&self) -> EndpointKind {
        match self {
            EndpointConfig::Mock { .. } => EndpointKind::Mock,
            EndpointConfig::Proxy { .. } => EndpointKind::Proxy,
            EndpointConfig::Container { .. } => EndpointKind::Container,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub name: String,
    pub path_prefix: String,
    #[serde(flatten)]
    pub config: EndpointConfig,
    #[serde(default)]
    pub translation_mode: TranslationMode,
    #[serde(default)]
    pub translate_pattern: Option<String>,
    #[serde(default)]
    pub translate_replace: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub domain_filter: DomainFilter,
}

impl Endpoint {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.translation_mode == TranslationMode::Translate {
            let pattern = self.translate_pattern.as_deref().unwrap_or("");
            regex::Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex {
                pattern: pattern.to_string(),
                source,
            })?;
        }
        if let EndpointConfig::Mock { rules } = &self.config {
            for rule in rules {
                rule.validate()?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptedDomain {
    pub pattern: String,
    #[serde(default)]
    pub overlay_mode: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Socks5Config {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_socks5_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub intercepted_domains: Vec<InterceptedDomain>,
}

fn default_socks5_port() -> u16 {
    DEFAULT_SOCKS5_PORT
}

impl Default for Socks5Config {
    fn default() -> Self {
        Socks5Config {
            enabled: false,
            port: default_socks5_port(),
            username: None,
            password: None,
            intercepted_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default)]
    pub http2: bool,
    #[serde(default)]
    pub redirect_http: bool,
    #[serde(default)]
    pub cert_path: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
}

fn default_https_port() -> u16 {
    DEFAULT_HTTPS_PORT
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            enabled: false,
            https_port: default_https_port(),
            http2: false,
            redirect_http: false,
            cert_path: None,
            key_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub socks5: Socks5Config,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Legacy shape: a flat rules list with no owning endpoint. Migrated
    /// into a default mock endpoint by [`migrate`] on load; never written
    /// back out by this crate (SPEC_FULL §3, decision 2).
    #[serde(default)]
    pub legacy_rules: Vec<Rule>,
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

impl Default for Config {
    fn default() -> Self {
        Config {
            http_port: default_http_port(),
            tls: TlsConfig::default(),
            cors: CorsConfig { enabled: false, allowed_origins: Vec::new() },
            socks5: Socks5Config::default(),
            endpoints: Vec::new(),
            legacy_rules: Vec::new(),
        }
    }
}

/// Parse + migrate a configuration document (spec §6). Idempotent: calling
/// `migrate` on an already-migrated `Config` is a no-op.
pub fn load(json: &str) -> Result<Config, serde_json::Error> {
    let mut cfg: Config = serde_json::from_str(json)?;
    migrate(&mut cfg);
    Ok(cfg)
}

pub fn migrate(cfg: &mut Config) {
    if !cfg.legacy_rules.is_empty() {
        let rules = std::mem::take(&mut cfg.legacy_rules);
        cfg.endpoints.push(Endpoint {
            id: "default".to_string(),
            name: "Default".to_string(),
            path_prefix: "/".to_string(),
            config: EndpointConfig::Mock { rules },
            translation_mode: TranslationMode::None,
            translate_pattern: None,
            translate_replace: None,
            enabled: true,
            domain_filter: DomainFilter::Any,
        });
    }
    if cfg.endpoints.is_empty() {
        cfg.endpoints.push(Endpoint {
            id: "default".to_string(),
            name: "Default".to_string(),
            path_prefix: "/".to_string(),
            config: EndpointConfig::Mock { rules: Vec::new() },
            translation_mode: TranslationMode::None,
            translate_pattern: None,
            translate_replace: None,
            enabled: true,
            domain_filter: DomainFilter::Any,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_moves_legacy_rules_into_default_endpoint() {
        let mut cfg = Config {
            legacy_rules: vec![Rule {
                id: "r1".into(),
                methods: vec![HttpMethod::Get],
                path_pattern: "/x".into(),
                status_code: 200,
                headers: vec![],
                body: "ok".into(),
                response_mode: ResponseMode::Static,
                script_body: None,
                validation: ValidationPredicate::default(),
                delay_ms: None,
                enabled: true,
                domain_filter: DomainFilter::Any,
                group: None,
            }],
            ..Default::default()
        };
        migrate(&mut cfg);
        assert!(cfg.legacy_rules.is_empty());
        assert_eq!(cfg.endpoints.len(), 1);
        match &cfg.endpoints[0].config {
            EndpointConfig::Mock { rules } => assert_eq!(rules.len(), 1),
            _ => panic!("expected mock endpoint"),
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let mut cfg = Config::default();
        migrate(&mut cfg);
        let first_len = cfg.endpoints.len();
        migrate(&mut cfg);
        assert_eq!(cfg.endpoints.len(), first_len);
    }

    #[test]
    fn domain_filter_wildcard_matches_subdomain_only() {
        let f = DomainFilter::Specific {
            patterns: vec!["*.example.test".into()],
        };
        let ctx = InterceptContext::none();
        assert!(f.accepts("api.example.test", &ctx));
        assert!(!f.accepts("example.test", &ctx));
        assert!(!f.accepts("evilexample.test", &ctx));
    }

    #[test]
    fn all_intercepted_requires_both_arrival_and_live_enabled_pattern() {
        let f = DomainFilter::AllIntercepted;
        let patterns = vec!["^api\\.test\\.local$".to_string()];
        let live = InterceptContext {
            arrived_via_intercept: true,
            enabled_patterns: &patterns,
        };
        assert!(f.accepts("api.test.local", &live));

        let not_via_socks = InterceptContext {
            arrived_via_intercept: false,
            enabled_patterns: &patterns,
        };
        assert!(!f.accepts("api.test.local", &not_via_socks));

        let no_patterns = InterceptContext {
            arrived_via_intercept: true,
            enabled_patterns: &[],
        };
        assert!(!f.accepts("api.test.local", &no_patterns));
    }

    #[test]
    fn status_translation_class_matches() {
        let t = StatusTranslation {
            pattern: "5xx".into(),
            target: 503,
        };
        assert!(t.matches(502));
        assert!(!t.matches(404));
        let exact = StatusTranslation {
            pattern: "404".into(),
            target: 410,
        };
        assert!(exact.matches(404));
        assert!(!exact.matches(400));
    }
}
