//! Container and pod execution backends for the Drake task runner.
//!
//! The local backend drives a Docker daemon directly; the cluster
//! backend translates targets into Kubernetes pods and watches them to
//! completion. Both execute one target at a time; fanning out across a
//! stage is the scheduler's job.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use drake_core::{Result, Target};

pub mod docker;
pub mod kubernetes;
pub mod notify;
pub mod secret;
pub mod source;
pub mod storage;

pub use docker::DockerRunner;
pub use kubernetes::PodRunner;
pub use notify::{CheckNotifier, Conclusion, LogNotifier};

/// Capability to execute one target as a local container group.
///
/// `execution_name` is the fully composed per-target prefix; the runner
/// appends each container's own name to it. Secrets are injected into
/// every container environment ahead of the container's own entries.
#[async_trait]
pub trait TargetRunner: Send + Sync {
    async fn run_target(
        &self,
        token: &CancellationToken,
        execution_name: &str,
        source_path: &Path,
        secrets: &[String],
        target: &Target,
    ) -> Result<()>;

    /// Pre-pull the given images, streaming engine progress.
    async fn pull_images(&self, token: &CancellationToken, images: &[String]) -> Result<()>;
}
