//! Targets and the containers that make them up.

use serde::Deserialize;

/// Configuration for a single container within a target.
///
/// The last container of a target is its *primary*: the one whose exit
/// code decides the target's outcome and whose output is captured. Every
/// other container is a sidecar.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// Container name, unique within its target.
    pub name: String,
    /// OCI image reference.
    pub image: String,
    /// Environment variables as `KEY=VALUE` or bare `KEY` strings.
    #[serde(default)]
    pub environment: Vec<String>,
    /// Working directory inside the container.
    #[serde(default)]
    pub working_directory: Option<String>,
    /// Command to run; empty means the image entrypoint.
    #[serde(default)]
    pub command: String,
    /// Allocate a TTY for the container.
    #[serde(default)]
    pub tty: bool,
    /// Run the container privileged.
    #[serde(default)]
    pub privileged: bool,
    /// Bind-mount the host's container engine socket.
    #[serde(default)]
    pub mount_docker_socket: bool,
    /// Path inside the container at which project source is mounted.
    #[serde(default)]
    pub source_mount_path: Option<String>,
}

/// The smallest executable unit: an ordered group of containers that
/// share a network and, possibly, the project source.
#[derive(Debug, Clone)]
pub struct Target {
    name: String,
    containers: Vec<ContainerSpec>,
}

impl Target {
    pub fn new(name: impl Into<String>, containers: Vec<ContainerSpec>) -> Self {
        Self {
            name: name.into(),
            containers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn containers(&self) -> &[ContainerSpec] {
        &self.containers
    }

    /// The primary container, i.e. the last one. A target with zero
    /// containers has no primary and executes as a no-op.
    pub fn primary(&self) -> Option<&ContainerSpec> {
        self.containers.last()
    }

    /// All containers except the primary, in start order.
    pub fn sidecars(&self) -> &[ContainerSpec] {
        match self.containers.len() {
            0 => &[],
            n => &self.containers[..n - 1],
        }
    }
}
