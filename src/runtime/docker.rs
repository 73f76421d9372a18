//! Docker implementation of [`super::ContainerRuntime`], via `bollard`
//! dialing the default Docker socket.

use bollard::Docker;

use super::bollard_common::BollardBacked;
use crate::error::ContainerError;

pub fn connect() -> Result<BollardBacked, ContainerError> {
    let client = Docker::connect_with_local_defaults().map_err(|e| ContainerError::Transport(e.to_string()))?;
    Ok(BollardBacked { client, label: "docker" })
}
