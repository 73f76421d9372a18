//! Podman implementation of [`super::ContainerRuntime`]. Podman's REST API
//! is Docker-API-compatible, so we reuse [`BollardBacked`] and only change
//! which socket `bollard` dials: `$PODMAN_SOCKET` if set, else the rootless
//! default under the user's runtime dir, else the system-wide socket
//! (spec §4.9: a narrow, engine-agnostic adapter interface).

use bollard::Docker;

use super::bollard_common::BollardBacked;
use crate::error::ContainerError;

fn socket_path() -> String {
    if let Ok(path) = std::env::var("PODMAN_SOCKET") {
        return path;
    }
    if let Ok(uid) = std::env::var("UID") {
        return format!("/run/user/{uid}/podman/podman.sock");
    }
    "/run/podman/podman.sock".to_string()
}

pub fn connect() -> Result<BollardBacked, ContainerError> {
    let path = socket_path();
    let client = Docker::connect_with_socket(&path, 120, bollard::API_DEFAULT_VERSION)
        .map_err(|e| ContainerError::Transport(e.to_string()))?;
    Ok(BollardBacked { client, label: "podman" })
}
