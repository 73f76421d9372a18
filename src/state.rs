//! Shared runtime state (spec §5). The configuration tree lives behind an
//! `ArcSwap` so readers clone only the `Arc` they need and writers publish a
//! whole new tree atomically; derived pattern caches are rebuilt under a
//! single-writer lock whenever the config changes and otherwise read as an
//! immutable snapshot, matching the concurrency model in spec §5.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use regex::Regex;

use crate::config::{Config, EndpointConfig, TranslationMode};
use crate::dns::DnsCache;
use crate::error::ConfigError;
use crate::health::HealthStatus;
use crate::pattern::CompiledPattern;
use crate::runtime::ContainerRuntime;
use crate::script::ScriptHost;

pub struct CompiledRule {
    pub rule_id: String,
    pub pattern: CompiledPattern,
}

pub struct CompiledEndpoint {
    pub endpoint_id: String,
    pub translate_regex: Option<Regex>,
    pub rules: Vec<CompiledRule>,
}

/// Pattern caches derived from [`Config`], rebuilt wholesale on every
/// config change (spec §5 "Compiled pattern caches").
#[derive(Default)]
pub struct CompiledRoutes {
    pub endpoints: HashMap<String, CompiledEndpoint>,
}

impl CompiledRoutes {
    pub fn build(cfg: &Config) -> Result<CompiledRoutes, ConfigError> {
        let mut endpoints = HashMap::new();
        for endpoint in &cfg.endpoints {
            endpoint.validate()?;
            let translate_regex = if endpoint.translation_mode == TranslationMode::Translate {
                let pattern = endpoint.translate_pattern.clone().unwrap_or_default();
                Some(Regex::new(&pattern).map_err(|source| ConfigError::InvalidRegex { pattern, source })?)
            } else {
                None
            };
            let rules = match &endpoint.config {
                EndpointConfig::Mock { rules } => rules
                    .iter()
                    .map(|r| {
                        Ok(CompiledRule {
                            rule_id: r.id.clone(),
                            pattern: CompiledPattern::compile(&r.path_pattern)?,
                        })
                    })
                    .collect::<Result<Vec<_>, ConfigError>>()?,
                _ => Vec::new(),
            };
            endpoints.insert(
                endpoint.id.clone(),
                CompiledEndpoint {
                    endpoint_id: endpoint.id.clone(),
                    translate_regex,
                    rules,
                },
            );
        }
        Ok(CompiledRoutes { endpoints })
    }
}

#[derive(Clone)]
pub struct RequestLogEntry {
    pub id: String,
    pub timestamp_ms: i64,
    pub method: String,
    pub path: String,
    pub source_ip: String,
    pub user_agent: String,
    pub protocol: String,
    pub status: Option<u16>,
    pub rtt_ms: Option<u64>,
}

/// Bounded ring buffer of recently completed requests (spec §3 `RequestLog`).
pub struct RequestLogRing {
    capacity: usize,
    entries: Mutex<VecDeque<RequestLogEntry>>,
}

impl RequestLogRing {
    pub fn new(capacity: usize) -> Self {
        RequestLogRing {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, entry: RequestLogEntry) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<RequestLogEntry> {
        self.entries.lock().iter().cloned().collect()
    }
}

pub struct AppState {
    pub config: ArcSwap<Config>,
    pub routes: ArcSwap<CompiledRoutes>,
    pub script_host: Arc<ScriptHost>,
    pub dns_cache: DnsCache,
    pub container_ports: dashmap::DashMap<String, (String, u16)>,
    pub runtime: Option<Arc<dyn ContainerRuntime>>,
    pub request_log: RequestLogRing,
    pub health: Arc<dashmap::DashMap<String, HealthStatus>>,
}

impl AppState {
    pub fn new(config: Config, runtime: Option<Arc<dyn ContainerRuntime>>) -> Result<Arc<AppState>, ConfigError> {
        let routes = CompiledRoutes::build(&config)?;
        Ok(Arc::new(AppState {
            config: ArcSwap::from_pointee(config),
            routes: ArcSwap::from_pointee(routes),
            script_host: Arc::new(ScriptHost::new(Duration::from_millis(
                crate::config::DEFAULT_SCRIPT_TIMEOUT_MS,
            ))),
            dns_cache: DnsCache::new(Duration::from_secs(300)),
            container_ports: dashmap::DashMap::new(),
            runtime,
            request_log: RequestLogRing::new(1000),
            health: Arc::new(dashmap::DashMap::new()),
        }))
    }

    /// Atomically replace the configuration tree and rebuild its derived
    /// pattern caches (spec §5: "writers swap the tree atomically").
    pub fn replace_config(&self, new_config: Config) -> Result<(), ConfigError> {
        let routes = CompiledRoutes::build(&new_config)?;
        self.config.store(Arc::new(new_config));
        self.routes.store(Arc::new(routes));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_log_ring_drops_oldest_beyond_capacity() {
        let ring = RequestLogRing::new(2);
        for i in 0..3 {
            ring.push(RequestLogEntry {
                id: i.to_string(),
                timestamp_ms: 0,
                method: "GET".into(),
                path: "/".into(),
                source_ip: "127.0.0.1".into(),
                user_agent: "".into(),
                protocol: "http".into(),
                status: Some(200),
                rtt_ms: Some(1),
            });
        }
        let snap = ring.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].id, "1");
        assert_eq!(snap[1].id, "2");
    }
}
