//! Health/stats poller (spec §4.10). One background task per endpoint with
//! its own cancellation token; the task is dropped (and so stops probing)
//! within one interval of the endpoint being deleted or the server
//! stopping, via `tokio_util`-style `CancellationToken` semantics implemented
//! here directly on top of `tokio::sync::watch` to avoid an extra
//! dependency the teacher doesn't otherwise need.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;

use crate::config::{ContainerConfig, ProxyConfig};
use crate::runtime::ContainerRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub sampled_at_ms: i64,
}

pub struct ProbeHandle {
    stop: watch::Sender<bool>,
}

impl ProbeHandle {
    pub fn cancel(&self) {
        let _ = self.stop.send(true);
    }
}

/// Spawns the poller for a proxy endpoint: periodic GET of
/// `backend_url + health_check.path`; success is any status in [200,500)
/// (spec §4.10).
pub fn spawn_proxy_probe(
    endpoint_id: String,
    proxy: ProxyConfig,
    client: crate::handlers::proxy::ProxyClient,
    health_map: Arc<dashmap::DashMap<String, HealthStatus>>,
) -> ProbeHandle {
    let (tx, mut rx) = watch::channel(false);
    health_map.insert(endpoint_id.clone(), HealthStatus::Starting);

    tokio::spawn(async move {
        if !proxy.health_check.enabled {
            return;
        }
        let mut ticker = interval(Duration::from_secs(proxy.health_check.interval_s.max(1)));
        loop {
            tokio::select! {
                _ = rx.changed() => {
                    if *rx.borrow() {
                        health_map.insert(endpoint_id.clone(), HealthStatus::Stopped);
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let url = format!(
                        "{}{}",
                        proxy.backend_url.trim_end_matches('/'),
                        proxy.health_check.path
                    );
                    let healthy = client.probe(&url, Duration::from_secs(proxy.timeout_secs)).await;
                    health_map.insert(
                        endpoint_id.clone(),
                        if healthy { HealthStatus::Healthy } else { HealthStatus::Unhealthy },
                    );
                }
            }
        }
    });

    ProbeHandle { stop: tx }
}

/// Spawns the poller for a container endpoint: combines container-running
/// state with the HTTP probe; either failing marks Unhealthy (spec §4.10).
pub fn spawn_container_probe(
    endpoint_id: String,
    container_name: String,
    container: ContainerConfig,
    client: crate::handlers::proxy::ProxyClient,
    runtime: Arc<dyn ContainerRuntime>,
    health_map: Arc<dashmap::DashMap<String, HealthStatus>>,
) -> ProbeHandle {
    let (tx, mut rx) = watch::channel(false);
    health_map.insert(endpoint_id.clone(), HealthStatus::Starting);

    tokio::spawn(async move {
        let interval_s = if container.proxy.health_check.enabled {
            container.proxy.health_check.interval_s
        } else {
            30
        };
        let mut ticker = interval(Duration::from_secs(interval_s.max(1)));
        loop {
            tokio::select! {
                _ = rx.changed() => {
                    if *rx.borrow() {
                        health_map.insert(endpoint_id.clone(), HealthStatus::Stopped);
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let inspect = runtime.inspect_container(&container_name).await.ok();
                    let running = inspect.as_ref().map(|i| i.running).unwrap_or(false);

                    let http_ok = if running && container.proxy.health_check.enabled {
                        if let Some(info) = &inspect {
                            if let Some(&host_port) = info.ports.get(&container.container_port) {
                                let url = format!(
                                    "http://127.0.0.1:{}{}",
                                    host_port, container.proxy.health_check.path
                                );
                                client.probe(&url, Duration::from_secs(container.proxy.timeout_secs)).await
                            } else {
                                false
                            }
                        } else {
                            false
                        }
                    } else {
                        true
                    };

                    health_map.insert(
                        endpoint_id.clone(),
                        if running && http_ok { HealthStatus::Healthy } else { HealthStatus::Unhealthy },
                    );
                }
            }
        }
    });

    ProbeHandle { stop: tx }
}

/// Resource-stat sampling loop (spec §4.10): every 1s for the container's
/// first minute of life, then every 5s, emitted to the tracing log sink.
pub fn spawn_stats_sampler(
    container_name: String,
    runtime: Arc<dyn ContainerRuntime>,
) -> ProbeHandle {
    let (tx, mut rx) = watch::channel(false);

    tokio::spawn(async move {
        let started = tokio::time::Instant::now();
        loop {
            let elapsed = started.elapsed();
            let period = if elapsed < Duration::from_secs(60) {
                Duration::from_secs(1)
            } else {
                Duration::from_secs(5)
            };

            tokio::select! {
                _ = rx.changed() => {
                    if *rx.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(period) => {
                    match runtime.get_container_stats(&container_name).await {
                        Ok(stats) => {
                            tracing::info!(
                                container = %container_name,
                                cpu_percent = stats.cpu_percent,
                                memory_bytes = stats.memory_bytes,
                                "container stats sample"
                            );
                        }
                        Err(e) => {
                            tracing::debug!(container = %container_name, error = %e, "stats sample failed");
                        }
                    }
                }
            }
        }
    });

    ProbeHandle { stop: tx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_handle_cancel_sends_stop_signal() {
        let (tx, rx) = watch::channel(false);
        let handle = ProbeHandle { stop: tx };
        handle.cancel();
        assert!(*rx.borrow());
    }
}
