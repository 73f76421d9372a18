//! Shared `bollard`-backed implementation used by both the Docker and
//! Podman adapters — Podman's API socket is Docker-API-compatible, so the
//! only real difference between the two engines is which socket `bollard`
//! dials (spec §4.9: "two implementations ... selected by preference").

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as BollardConfig, CreateContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, Stats as BollardStats, StatsOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures_util::stream::{BoxStream, StreamExt};

use super::{ContainerRuntime, CreateSpec, InspectResult, RestartPolicySpec};
use crate::error::ContainerError;
use crate::health::ContainerStats;
use crate::runtime::hostpath::translate_host_path;

pub struct BollardBacked {
    pub client: Docker,
    pub label: &'static str,
}

fn restart_policy(policy: RestartPolicySpec) -> RestartPolicy {
    let name = match policy {
        RestartPolicySpec::No => RestartPolicyNameEnum::NO,
        RestartPolicySpec::Always => RestartPolicyNameEnum::ALWAYS,
        RestartPolicySpec::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        RestartPolicySpec::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
    };
    RestartPolicy {
        name: Some(name),
        maximum_retry_count: None,
    }
}

fn compute_cpu_percent(stats: &BollardStats) -> f64 {
    let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
        - stats.precpu_stats.cpu_usage.total_usage as f64;
    let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
        - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
    if system_delta > 0.0 && cpu_delta > 0.0 {
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1) as f64;
        (cpu_delta / system_delta) * online_cpus * 100.0
    } else {
        0.0
    }
}

#[async_trait]
impl ContainerRuntime for BollardBacked {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn is_available(&self) -> bool {
        self.client.ping().await.is_ok()
    }

    async fn pull_image(&self, image: &str) -> Result<BoxStream<'static, String>, ContainerError> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let stream = self
            .client
            .create_image(Some(options), None, None)
            .map(|item| match item {
                Ok(info) => info.status.unwrap_or_default(),
                Err(e) => format!("error: {e}"),
            })
            .boxed();
        Ok(stream)
    }

    async fn validate_image(&self, image: &str) -> Result<(), ContainerError> {
        self.client
            .inspect_image(image)
            .await
            .map(|_| ())
            .map_err(|e| ContainerError::InvalidImage(e.to_string()))
    }

    async fn create_container(&self, spec: &CreateSpec) -> Result<String, ContainerError> {
        let container_port_key = format!("{}/tcp", spec.container_port);
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            container_port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some("0".to_string()),
            }]),
        );

        let mounts: Vec<Mount> = spec
            .volumes
            .iter()
            .map(|v| Mount {
                source: Some(translate_host_path(&v.host_path)),
                target: Some(v.container_path.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(v.read_only),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            mounts: Some(mounts),
            restart_policy: Some(restart_policy(spec.restart_policy)),
            ..Default::default()
        };

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let config = BollardConfig {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: Some(HashMap::from([(container_port_key, HashMap::new())])),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| ContainerError::Transport(e.to_string()))?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), ContainerError> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ContainerError::Transport(e.to_string()))
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), ContainerError> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        self.client
            .stop_container(id, Some(options))
            .await
            .map_err(|e| ContainerError::Transport(e.to_string()))
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), ContainerError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(|e| ContainerError::Transport(e.to_string()))
    }

    async fn inspect_container(&self, id_or_name: &str) -> Result<InspectResult, ContainerError> {
        let inspect = self
            .client
            .inspect_container(id_or_name, None)
            .await
            .map_err(|e| ContainerError::NotFound(e.to_string()))?;

        let running = inspect.state.as_ref().and_then(|s| s.running).unwrap_or(false);
        let status = inspect
            .state
            .as_ref()
            .and_then(|s| s.status)
            .map(|s| format!("{s:?}"))
            .unwrap_or_default();

        let mut ports = HashMap::new();
        if let Some(network_settings) = &inspect.network_settings {
            if let Some(port_map) = &network_settings.ports {
                for (container_port, bindings) in port_map {
                    let Some((port_str, _)) = container_port.split_once('/') else { continue };
                    let Ok(container_port_num) = port_str.parse::<u16>() else { continue };
                    if let Some(bindings) = bindings {
                        if let Some(binding) = bindings.first() {
                            if let Some(host_port) = &binding.host_port {
                                if let Ok(host_port_num) = host_port.parse::<u16>() {
                                    ports.insert(container_port_num, host_port_num);
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(InspectResult {
            id: inspect.id.unwrap_or_default(),
            running,
            status,
            ports,
        })
    }

    async fn find_container_by_name(&self, name: &str) -> Result<Option<InspectResult>, ContainerError> {
        match self.inspect_container(name).await {
            Ok(result) => Ok(Some(result)),
            Err(ContainerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_container_stats(&self, id: &str) -> Result<ContainerStats, ContainerError> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.client.stats(id, Some(options));
        let stats: BollardStats = stream
            .next()
            .await
            .ok_or_else(|| ContainerError::Transport("no stats returned".to_string()))?
            .map_err(|e| ContainerError::Transport(e.to_string()))?;

        Ok(ContainerStats {
            cpu_percent: compute_cpu_percent(&stats),
            memory_bytes: stats.memory_stats.usage.unwrap_or(0),
            sampled_at_ms: chrono::Utc::now().timestamp_millis(),
        })
    }

    async fn get_container_logs(&self, id: &str, tail: usize) -> Result<String, ContainerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.logs(id, Some(options));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.push_str(&log.to_string()),
                Err(e) => return Err(ContainerError::Transport(e.to_string())),
            }
        }
        Ok(out)
    }
}
