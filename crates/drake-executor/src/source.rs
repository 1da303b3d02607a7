//! The source-clone pod.
//!
//! Before a pipeline's stages run, a single-container pod clones the
//! project source onto the pipeline's shared volume.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    ResourceRequirements, SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, PostParams};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use drake_core::{Error, Event, Project, Result};

use crate::kubernetes::{watch_pod_until, PodVerdict, SRC_VOLUME};
use crate::storage;

const DEFAULT_SIDECAR_IMAGE: &str = "brigadecore/git-sidecar:latest";
const WORKSPACE: &str = "/src";

/// Hard wall-clock limit on the source clone, measured from pod creation.
pub const DEFAULT_CLONE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Run the source-clone pod for a pipeline synchronously: returns once
/// the clone has succeeded, and fails on pod failure, timeout, or
/// cancellation.
pub async fn run_source_clone_pod(
    client: &Client,
    token: &CancellationToken,
    project: &Project,
    event: &Event,
    pipeline_name: &str,
    timeout: Duration,
) -> Result<()> {
    let pod = build_source_clone_pod(project, event, pipeline_name);
    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(client.clone(), &project.kubernetes.namespace);

    info!(pod = %pod_name, pipeline = %pipeline_name, "cloning source to shared storage");
    pods.create(&PostParams::default(), &pod).await.map_err(|e| {
        Error::engine(
            format!("error creating source clone pod for pipeline \"{pipeline_name}\""),
            e,
        )
    })?;

    let outcome = watch_pod_until(&pods, &pod_name, timeout, token, |pod| {
        match pod.status.as_ref()?.phase.as_deref() {
            Some("Succeeded") => Some(PodVerdict::Succeeded),
            Some("Failed") => Some(PodVerdict::Failed(format!(
                "source clone pod \"{pod_name}\" failed"
            ))),
            _ => None,
        }
    })
    .await;

    if let Err(err) = pods.delete(&pod_name, &DeleteParams::default()).await {
        warn!(pod = %pod_name, error = %err, "error deleting source clone pod");
    } else {
        debug!(pod = %pod_name, "deleted source clone pod");
    }
    outcome
}

/// Construct the source-clone pod for a pipeline.
pub(crate) fn build_source_clone_pod(
    project: &Project,
    event: &Event,
    pipeline_name: &str,
) -> Pod {
    let job_name = format!("{pipeline_name}-source-clone");
    let pod_name = format!("{job_name}-{}", event.build_id.to_lowercase());
    let labels = BTreeMap::from([
        ("heritage".to_string(), "brigade".to_string()),
        ("component".to_string(), "job".to_string()),
        ("jobname".to_string(), job_name),
        ("project".to_string(), project.id.clone()),
        ("worker".to_string(), event.worker_id.to_lowercase()),
        ("build".to_string(), event.build_id.to_lowercase()),
    ]);

    let mut env = vec![
        plain_env("CI", "true"),
        plain_env("BRIGADE_BUILD_ID", &event.build_id),
        plain_env("BRIGADE_COMMIT_ID", &event.revision.commit),
        plain_env("BRIGADE_COMMIT_REF", &event.revision.git_ref),
        plain_env("BRIGADE_EVENT_PROVIDER", &event.provider),
        plain_env("BRIGADE_EVENT_TYPE", &event.event_type),
        plain_env("BRIGADE_PROJECT_ID", &project.id),
        plain_env("BRIGADE_REMOTE_URL", &project.repo.clone_url),
        plain_env("BRIGADE_WORKSPACE", WORKSPACE),
        plain_env("BRIGADE_PROJECT_NAMESPACE", &project.kubernetes.namespace),
        plain_env(
            "BRIGADE_SUBMODULES",
            &project.repo.init_git_submodules.to_string(),
        ),
    ];
    if !project.repo.ssh_key.is_empty() {
        env.push(secret_env("BRIGADE_REPO_KEY", &project.id, "sshKey"));
    }
    if !project.repo.token.is_empty() {
        env.push(secret_env(
            "BRIGADE_REPO_AUTH_TOKEN",
            &project.id,
            "github.token",
        ));
    }

    let image = if project.kubernetes.vcs_sidecar.is_empty() {
        DEFAULT_SIDECAR_IMAGE.to_string()
    } else {
        project.kubernetes.vcs_sidecar.clone()
    };

    let mut limits = BTreeMap::new();
    if let Some(cpu) = &project.kubernetes.sidecar_limits_cpu {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &project.kubernetes.sidecar_limits_memory {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }
    let mut requests = BTreeMap::new();
    if let Some(cpu) = &project.kubernetes.sidecar_requests_cpu {
        requests.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &project.kubernetes.sidecar_requests_memory {
        requests.insert("memory".to_string(), Quantity(memory.clone()));
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "source-cloner".to_string(),
                image: Some(image),
                image_pull_policy: Some("Always".to_string()),
                env: Some(env),
                volume_mounts: Some(vec![VolumeMount {
                    name: SRC_VOLUME.to_string(),
                    mount_path: WORKSPACE.to_string(),
                    ..Default::default()
                }]),
                resources: Some(ResourceRequirements {
                    limits: (!limits.is_empty()).then_some(limits),
                    requests: (!requests.is_empty()).then_some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: SRC_VOLUME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: storage::source_pvc_name(&event.worker_id, pipeline_name),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn plain_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
