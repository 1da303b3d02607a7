//! Cluster target runner: one target, one pod.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, HostPathVolumeSource, PersistentVolumeClaimVolumeSource, Pod,
    PodSpec, SecretKeySelector, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, PostParams, WatchEvent, WatchParams};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use drake_core::{ContainerSpec, Error, Event, Project, Result, Target};

use crate::notify::{CheckNotifier, Conclusion, LogNotifier};
use crate::{secret, storage};

pub(crate) const SRC_VOLUME: &str = "src";
pub(crate) const DOCKER_SOCKET_VOLUME: &str = "docker-socket";
const DOCKER_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Hard wall-clock limit on a target pod, measured from creation.
pub const DEFAULT_POD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Runs targets as pods on a Kubernetes cluster.
#[derive(Clone)]
pub struct PodRunner {
    client: Client,
    notifier: Arc<dyn CheckNotifier>,
    timeout: Duration,
}

impl PodRunner {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            notifier: Arc::new(LogNotifier),
            timeout: DEFAULT_POD_TIMEOUT,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn CheckNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute one target of one stage as a pod, watching it to
    /// completion and reporting check progress around it.
    pub async fn run(
        &self,
        token: &CancellationToken,
        project: &Project,
        event: &Event,
        environment: &[String],
        pipeline_name: &str,
        stage_index: usize,
        target: &Target,
    ) -> Result<()> {
        if target.containers().is_empty() {
            return Ok(());
        }
        self.notifier.check_started(event, target.name()).await?;
        let outcome = self
            .run_pod(token, project, event, environment, pipeline_name, stage_index, target)
            .await;
        let conclusion = match &outcome {
            Ok(()) => Conclusion::Success,
            Err(Error::TimedOut { .. }) => Conclusion::TimedOut,
            Err(Error::Cancelled) => Conclusion::Cancelled,
            Err(_) => Conclusion::Failure,
        };
        if let Err(err) = self
            .notifier
            .check_completed(event, target.name(), conclusion)
            .await
        {
            warn!(target = %target.name(), error = %err, "error sending completed check");
        }
        outcome
    }

    async fn run_pod(
        &self,
        token: &CancellationToken,
        project: &Project,
        event: &Event,
        environment: &[String],
        pipeline_name: &str,
        stage_index: usize,
        target: &Target,
    ) -> Result<()> {
        let pod = build_target_pod(project, event, environment, pipeline_name, stage_index, target)?;
        let pod_name = pod
            .metadata
            .name
            .clone()
            .unwrap_or_default();
        let primary_name = target
            .primary()
            .map(|c| c.name.clone())
            .unwrap_or_default();
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &project.kubernetes.namespace);

        info!(pod = %pod_name, target = %target.name(), "creating target pod");
        pods.create(&PostParams::default(), &pod)
            .await
            .map_err(|e| Error::engine(format!("error creating pod \"{pod_name}\""), e))?;

        let outcome = watch_pod_until(&pods, &pod_name, self.timeout, token, |pod| {
            let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
            let primary = statuses.iter().find(|s| s.name == primary_name)?;
            let terminated = primary.state.as_ref()?.terminated.as_ref()?;
            if terminated.reason.as_deref() == Some("Completed") {
                Some(PodVerdict::Succeeded)
            } else {
                Some(PodVerdict::Failed(format!("pod \"{pod_name}\" failed")))
            }
        })
        .await;

        // The pod is removed on every exit path, including timeout and
        // cancellation; removal failures never override the outcome.
        if let Err(err) = pods.delete(&pod_name, &DeleteParams::default()).await {
            warn!(pod = %pod_name, error = %err, "error deleting pod");
        } else {
            debug!(pod = %pod_name, "deleted pod");
        }
        outcome
    }
}

/// Construct the pod for one target. The primary container sits at index
/// 0 of the pod spec; sidecars follow in their declared order.
pub(crate) fn build_target_pod(
    project: &Project,
    event: &Event,
    environment: &[String],
    pipeline_name: &str,
    stage_index: usize,
    target: &Target,
) -> Result<Pod> {
    let job_name = format!("{pipeline_name}-stage{stage_index}-{}", target.name());
    let pod_name = format!("{job_name}-{}", event.build_id.to_lowercase());
    let labels = BTreeMap::from([
        ("heritage".to_string(), "brigade".to_string()),
        ("component".to_string(), "job".to_string()),
        ("jobname".to_string(), job_name),
        ("project".to_string(), project.id.clone()),
        ("worker".to_string(), event.worker_id.to_lowercase()),
        ("build".to_string(), event.build_id.to_lowercase()),
        ("pipeline".to_string(), pipeline_name.to_string()),
        ("stage".to_string(), stage_index.to_string()),
        ("target".to_string(), target.name().to_string()),
    ]);

    let mut containers = Vec::with_capacity(target.containers().len());
    if let Some(primary) = target.primary() {
        containers.push(pod_container(primary, environment, project, event)?);
    }
    for sidecar in target.sidecars() {
        containers.push(pod_container(sidecar, environment, project, event)?);
    }

    let mut volumes = vec![Volume {
        name: SRC_VOLUME.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: storage::source_pvc_name(&event.worker_id, pipeline_name),
            ..Default::default()
        }),
        ..Default::default()
    }];
    if target.containers().iter().any(|c| c.mount_docker_socket) {
        volumes.push(Volume {
            name: DOCKER_SOCKET_VOLUME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: DOCKER_SOCKET_PATH.to_string(),
                type_: None,
            }),
            ..Default::default()
        });
    }

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers,
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Translate one container spec into a pod container. Its environment is
/// the pipeline environment, then the container's own entries, then one
/// reference per project secret into the build-scoped secret.
fn pod_container(
    spec: &ContainerSpec,
    environment: &[String],
    project: &Project,
    event: &Event,
) -> Result<Container> {
    let command = if spec.command.is_empty() {
        None
    } else {
        Some(shell_words::split(&spec.command).map_err(|e| {
            Error::Config(format!(
                "error parsing command for container \"{}\": {}",
                spec.name, e
            ))
        })?)
    };

    let mut env: Vec<EnvVar> = Vec::new();
    for entry in environment.iter().chain(spec.environment.iter()) {
        env.push(env_var_from_entry(entry));
    }
    let build_secret = secret::build_secret_name(&event.build_id);
    for key in project.secrets.keys() {
        env.push(EnvVar {
            name: key.clone(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: build_secret.clone(),
                    key: key.clone(),
                    optional: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let mut volume_mounts = Vec::new();
    if let Some(mount) = &spec.source_mount_path {
        volume_mounts.push(VolumeMount {
            name: SRC_VOLUME.to_string(),
            mount_path: mount.clone(),
            ..Default::default()
        });
    }
    if spec.mount_docker_socket {
        volume_mounts.push(VolumeMount {
            name: DOCKER_SOCKET_VOLUME.to_string(),
            mount_path: DOCKER_SOCKET_PATH.to_string(),
            ..Default::default()
        });
    }

    Ok(Container {
        name: spec.name.clone(),
        image: Some(spec.image.clone()),
        image_pull_policy: Some("Always".to_string()),
        command,
        env: Some(env),
        working_dir: spec.working_directory.clone(),
        stdin: Some(spec.tty),
        tty: Some(spec.tty),
        security_context: Some(SecurityContext {
            privileged: Some(spec.privileged),
            ..Default::default()
        }),
        volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
        ..Default::default()
    })
}

/// Split a `KEY=VALUE` or bare `KEY` environment entry.
fn env_var_from_entry(entry: &str) -> EnvVar {
    match entry.split_once('=') {
        Some((key, value)) => EnvVar {
            name: key.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        },
        None => EnvVar {
            name: entry.to_string(),
            ..Default::default()
        },
    }
}

pub(crate) enum PodVerdict {
    Succeeded,
    Failed(String),
}

/// Watch a pod by name until the verdict function decides, the timeout
/// expires, or the token fires. The timer starts when the watch is
/// armed, immediately after pod creation.
pub(crate) async fn watch_pod_until<F>(
    pods: &Api<Pod>,
    pod_name: &str,
    timeout: Duration,
    token: &CancellationToken,
    mut verdict: F,
) -> Result<()>
where
    F: FnMut(&Pod) -> Option<PodVerdict>,
{
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let params = WatchParams::default().fields(&format!("metadata.name={pod_name}"));
    'watch: loop {
        let stream = pods
            .watch(&params, "0")
            .await
            .map_err(|e| Error::engine(format!("error watching pod \"{pod_name}\""), e))?;
        let mut stream = Box::pin(stream);
        loop {
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = &mut deadline => return Err(Error::TimedOut { pod: pod_name.to_string() }),
                event = stream.next() => match event {
                    Some(Ok(WatchEvent::Added(pod) | WatchEvent::Modified(pod))) => {
                        if let Some(verdict) = verdict(&pod) {
                            return match verdict {
                                PodVerdict::Succeeded => Ok(()),
                                PodVerdict::Failed(message) => Err(Error::Engine(message)),
                            };
                        }
                    }
                    Some(Ok(WatchEvent::Deleted(_))) => {
                        return Err(Error::Engine(format!(
                            "pod \"{pod_name}\" was deleted while awaiting completion"
                        )));
                    }
                    Some(Ok(WatchEvent::Bookmark(_))) => {}
                    Some(Ok(WatchEvent::Error(status))) => {
                        return Err(Error::Engine(format!(
                            "error watching pod \"{pod_name}\": {}",
                            status.message
                        )));
                    }
                    Some(Err(err)) => {
                        return Err(Error::engine(
                            format!("error watching pod \"{pod_name}\""),
                            err,
                        ));
                    }
                    // The server closed the watch; re-establish it.
                    None => continue 'watch,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drake_core::Revision;

    fn project() -> Project {
        let mut project = Project {
            id: "deadbeef".to_string(),
            ..Default::default()
        };
        project.kubernetes.namespace = "builds".to_string();
        project
            .secrets
            .insert("API_TOKEN".to_string(), "hunter2".to_string());
        project
    }

    fn event() -> Event {
        Event {
            build_id: "01ARZ3Ndeadbeef".to_string(),
            worker_id: "Worker-01".to_string(),
            event_type: "push".to_string(),
            provider: "github".to_string(),
            revision: Revision {
                commit: "abc123".to_string(),
                git_ref: "refs/tags/v1.0.0".to_string(),
            },
            payload: Vec::new(),
        }
    }

    fn target() -> Target {
        Target::new(
            "it",
            vec![
                ContainerSpec {
                    name: "db".to_string(),
                    image: "postgres:11".to_string(),
                    ..Default::default()
                },
                ContainerSpec {
                    name: "app".to_string(),
                    image: "alpine:latest".to_string(),
                    command: "sh -c 'run tests'".to_string(),
                    environment: vec!["LOG=debug".to_string(), "PASSTHROUGH".to_string()],
                    source_mount_path: Some("/src".to_string()),
                    ..Default::default()
                },
            ],
        )
    }

    #[test]
    fn primary_container_sits_at_index_zero() {
        let pod = build_target_pod(&project(), &event(), &[], "ci", 1, &target()).unwrap();
        let spec = pod.spec.unwrap();
        assert_eq!(spec.containers[0].name, "app");
        assert_eq!(spec.containers[1].name, "db");
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
    }

    #[test]
    fn pod_name_and_labels_identify_the_build() {
        let pod = build_target_pod(&project(), &event(), &[], "ci", 1, &target()).unwrap();
        assert_eq!(
            pod.metadata.name.as_deref(),
            Some("ci-stage1-it-01arz3ndeadbeef")
        );
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels["heritage"], "brigade");
        assert_eq!(labels["component"], "job");
        assert_eq!(labels["jobname"], "ci-stage1-it");
        assert_eq!(labels["worker"], "worker-01");
        assert_eq!(labels["pipeline"], "ci");
        assert_eq!(labels["stage"], "1");
        assert_eq!(labels["target"], "it");
    }

    #[test]
    fn environment_layers_pipeline_own_and_secret_entries() {
        let pipeline_env = vec!["DRAKE_SHA1=abc123".to_string()];
        let pod =
            build_target_pod(&project(), &event(), &pipeline_env, "ci", 0, &target()).unwrap();
        let env = pod.spec.unwrap().containers[0].env.clone().unwrap();
        assert_eq!(env[0].name, "DRAKE_SHA1");
        assert_eq!(env[0].value.as_deref(), Some("abc123"));
        assert_eq!(env[1].name, "LOG");
        assert_eq!(env[2].name, "PASSTHROUGH");
        assert!(env[2].value.is_none());
        let secret_ref = env
            .iter()
            .find(|e| e.name == "API_TOKEN")
            .and_then(|e| e.value_from.as_ref())
            .and_then(|v| v.secret_key_ref.as_ref())
            .expect("secret-backed env var");
        assert_eq!(secret_ref.name, "01arz3ndeadbeef");
        assert_eq!(secret_ref.key, "API_TOKEN");
    }

    #[test]
    fn source_volume_references_the_pipeline_pvc() {
        let pod = build_target_pod(&project(), &event(), &[], "ci", 0, &target()).unwrap();
        let spec = pod.spec.unwrap();
        let volumes = spec.volumes.unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, SRC_VOLUME);
        assert_eq!(
            volumes[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "worker-01-ci"
        );
        let mounts = spec.containers[0].volume_mounts.clone().unwrap();
        assert_eq!(mounts[0].name, SRC_VOLUME);
        assert_eq!(mounts[0].mount_path, "/src");
    }

    #[test]
    fn docker_socket_volume_appears_only_when_requested() {
        let mut with_socket = target();
        let pod = build_target_pod(&project(), &event(), &[], "ci", 0, &with_socket).unwrap();
        assert_eq!(pod.spec.unwrap().volumes.unwrap().len(), 1);

        let mut containers = with_socket.containers().to_vec();
        containers[1].mount_docker_socket = true;
        with_socket = Target::new("it", containers);
        let pod = build_target_pod(&project(), &event(), &[], "ci", 0, &with_socket).unwrap();
        let spec = pod.spec.unwrap();
        let volumes = spec.volumes.unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[1].name, DOCKER_SOCKET_VOLUME);
        let mounts = spec.containers[0].volume_mounts.clone().unwrap();
        assert!(mounts.iter().any(|m| m.name == DOCKER_SOCKET_VOLUME));
    }

    #[test]
    fn bare_env_keys_carry_no_value() {
        let var = env_var_from_entry("JUST_A_KEY");
        assert_eq!(var.name, "JUST_A_KEY");
        assert!(var.value.is_none());
        let var = env_var_from_entry("KEY=a=b");
        assert_eq!(var.name, "KEY");
        assert_eq!(var.value.as_deref(), Some("a=b"));
    }
}
