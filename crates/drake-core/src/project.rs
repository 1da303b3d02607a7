//! Cluster-side project configuration.

use std::collections::BTreeMap;

/// A project as registered with the cluster executor. Loaded once per
/// build from the project secret plus the worker environment.
#[derive(Debug, Clone, Default)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub repo: Repository,
    pub kubernetes: ClusterSettings,
    /// Secrets exposed to every target container of this project.
    pub secrets: BTreeMap<String, String>,
    pub allow_privileged_jobs: bool,
    pub allow_host_mounts: bool,
}

/// VCS details for a project.
#[derive(Debug, Clone, Default)]
pub struct Repository {
    pub name: String,
    pub clone_url: String,
    pub ssh_key: String,
    pub token: String,
    pub init_git_submodules: bool,
}

/// Kubernetes-related project settings, including sizing knobs for the
/// source-clone sidecar and the shared source volume.
#[derive(Debug, Clone, Default)]
pub struct ClusterSettings {
    pub namespace: String,
    pub service_account: String,
    pub vcs_sidecar: String,
    pub sidecar_limits_cpu: Option<String>,
    pub sidecar_limits_memory: Option<String>,
    pub sidecar_requests_cpu: Option<String>,
    pub sidecar_requests_memory: Option<String>,
    /// Size of the pipeline-scoped source volume.
    pub build_storage_size: String,
    pub build_storage_class: Option<String>,
}

impl ClusterSettings {
    /// Default size of the shared source volume when the project does
    /// not specify one.
    pub const DEFAULT_BUILD_STORAGE_SIZE: &'static str = "50Mi";
}
