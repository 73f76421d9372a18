//! Container runtime adapter (spec §4.9): a narrow, engine-agnostic
//! interface over a local container engine. Two implementations are
//! required — Docker and a fallback — selected by preference and
//! overridable by `CONTAINER_RUNTIME` (spec §6). Handlers only ever see
//! `dyn ContainerRuntime`; no Docker/Podman-specific type crosses that
//! boundary (spec §9 "Container adapter choice").

mod bollard_common;
pub mod docker;
pub mod hostpath;
pub mod podman;

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::ContainerError;
use crate::health::ContainerStats;

#[derive(Debug, Clone)]
pub struct InspectResult {
    pub id: String,
    pub running: bool,
    pub status: String,
    /// container_port -> host_port
    pub ports: HashMap<u16, u16>,
}

#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    pub container_port: u16,
    pub env: Vec<(String, String)>,
    pub volumes: Vec<VolumeSpec>,
    pub restart_policy: RestartPolicySpec,
}

#[derive(Debug, Clone)]
pub struct VolumeSpec {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicySpec {
    No,
    Always,
    UnlessStopped,
    OnFailure,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    async fn is_available(&self) -> bool;

    async fn pull_image(&self, image: &str) -> Result<BoxStream<'static, String>, ContainerError>;

    async fn validate_image(&self, image: &str) -> Result<(), ContainerError>;

    async fn create_container(&self, spec: &CreateSpec) -> Result<String, ContainerError>;

    async fn start_container(&self, id: &str) -> Result<(), ContainerError>;

    async fn stop_container(&self, id: &str, timeout: std::time::Duration) -> Result<(), ContainerError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), ContainerError>;

    async fn inspect_container(&self, id_or_name: &str) -> Result<InspectResult, ContainerError>;

    async fn find_container_by_name(&self, name: &str) -> Result<Option<InspectResult>, ContainerError>;

    async fn get_container_stats(&self, id: &str) -> Result<ContainerStats, ContainerError>;

    async fn get_container_logs(&self, id: &str, tail: usize) -> Result<String, ContainerError>;
}

/// Selects a runtime by preference (Docker, then the fallback engine),
/// honoring `CONTAINER_RUNTIME` when set (spec §4.9, §6). Returns `None` if
/// neither is available; callers only treat that as fatal when a container
/// endpoint actually exists (spec §4.9).
pub async fn select_runtime() -> Option<std::sync::Arc<dyn ContainerRuntime>> {
    if let Ok(forced) = std::env::var("CONTAINER_RUNTIME") {
        return match forced.as_str() {
            "docker" => {
                let rt = docker::connect().ok()?;
                rt.is_available().await.then(|| std::sync::Arc::new(rt) as _)
            }
            "podman" => {
                let rt = podman::connect().ok()?;
                rt.is_available().await.then(|| std::sync::Arc::new(rt) as _)
            }
            _ => None,
        };
    }

    if let Ok(rt) = docker::connect() {
        if rt.is_available().await {
            return Some(std::sync::Arc::new(rt));
        }
    }
    if let Ok(rt) = podman::connect() {
        if rt.is_available().await {
            return Some(std::sync::Arc::new(rt));
        }
    }
    None
}
