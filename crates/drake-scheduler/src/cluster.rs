//! Cluster root executor: one build, driven by a repository event.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use drake_config::Config;
use drake_core::{Error, Event, Pipeline, Project, Result, TriggerRef};
use drake_executor::kubernetes::PodRunner;
use drake_executor::notify::CheckNotifier;
use drake_executor::{secret, source, storage};

use crate::stage::run_stage;

/// Where the worker's source checkout exposes the build document.
pub const DEFAULT_CLUSTER_CONFIG_PATH: &str = "/vcs/Drakefile.yaml";

/// Executes one build on a Kubernetes cluster: dispatches the event,
/// selects the pipelines it triggers, and runs them in parallel.
pub struct ClusterExecutor {
    client: Client,
    runner: PodRunner,
    clone_timeout: Duration,
    config_path: PathBuf,
}

impl ClusterExecutor {
    pub fn new(client: Client) -> Self {
        Self {
            runner: PodRunner::new(client.clone()),
            client,
            clone_timeout: source::DEFAULT_CLONE_TIMEOUT,
            config_path: DEFAULT_CLUSTER_CONFIG_PATH.into(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn CheckNotifier>) -> Self {
        self.runner = self.runner.with_notifier(notifier);
        self
    }

    pub fn with_pod_timeout(mut self, timeout: Duration) -> Self {
        self.runner = self.runner.with_timeout(timeout);
        self
    }

    pub fn with_clone_timeout(mut self, timeout: Duration) -> Self {
        self.clone_timeout = timeout;
        self
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }

    /// Execute the build for one event. Events that trigger nothing (a
    /// branch push, an unrecognized type) succeed without side effects.
    pub async fn execute_build(
        &self,
        token: &CancellationToken,
        project: &Project,
        event: &Event,
    ) -> Result<()> {
        let Some(trigger) = event.trigger_ref()? else {
            return Ok(());
        };
        info!(
            build = %event.build_id,
            branch = %trigger.branch,
            tag = %trigger.tag,
            "executing build"
        );
        let config = Config::from_file(&self.config_path)?;

        secret::create_build_secret(&self.client, project, event).await?;
        let outcome = self
            .run_matching_pipelines(token, project, event, &trigger, &config)
            .await;
        if let Err(err) = secret::destroy_build_secret(&self.client, project, event).await {
            warn!(build = %event.build_id, error = %err, "error destroying build secret");
        }
        outcome
    }

    async fn run_matching_pipelines(
        &self,
        token: &CancellationToken,
        project: &Project,
        event: &Event,
        trigger: &TriggerRef,
        config: &Config,
    ) -> Result<()> {
        let environment = event.pipeline_environment(trigger);
        let selected = select_pipelines(config, trigger)?;
        let mut handles = Vec::with_capacity(selected.len());
        for pipeline in selected {
            let client = self.client.clone();
            let runner = self.runner.clone();
            let token = token.clone();
            let project = project.clone();
            let event = event.clone();
            let environment = environment.clone();
            let clone_timeout = self.clone_timeout;
            handles.push((
                pipeline.name().to_string(),
                tokio::spawn(async move {
                    run_pipeline(
                        &client,
                        &runner,
                        &token,
                        &project,
                        &event,
                        &environment,
                        &pipeline,
                        clone_timeout,
                    )
                    .await
                }),
            ));
        }
        let mut errors = Vec::new();
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(err) => {
                    errors.push(Error::engine(
                        format!("task for pipeline \"{name}\" failed"),
                        err,
                    ));
                }
            }
        }
        match Error::aggregate(errors) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// The pipelines whose criteria match the trigger, in name order.
pub fn select_pipelines(config: &Config, trigger: &TriggerRef) -> Result<Vec<Arc<Pipeline>>> {
    let mut selected = Vec::new();
    for pipeline in config.all_pipelines() {
        if pipeline.matches(&trigger.branch, &trigger.tag)? {
            selected.push(pipeline);
        }
    }
    Ok(selected)
}

/// Drive one pipeline: provision its shared source volume, clone the
/// source into it, then run the stages in order, stopping at the first
/// stage failure. The volume is destroyed last on every exit path.
#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    client: &Client,
    runner: &PodRunner,
    token: &CancellationToken,
    project: &Project,
    event: &Event,
    environment: &[String],
    pipeline: &Arc<Pipeline>,
    clone_timeout: Duration,
) -> Result<()> {
    info!(pipeline = %pipeline.name(), "executing pipeline");
    storage::create_source_pvc(client, project, event, pipeline.name()).await?;
    let outcome = run_stages(
        client,
        runner,
        token,
        project,
        event,
        environment,
        pipeline,
        clone_timeout,
    )
    .await;
    // A cancelled worker must not leave pods behind to outlive it; sweep
    // everything labeled with this worker before the volume goes away.
    if token.is_cancelled() {
        sweep_worker_pods(client, project, event).await;
    }
    if let Err(err) = storage::destroy_source_pvc(client, project, event, pipeline.name()).await {
        warn!(pipeline = %pipeline.name(), error = %err, "error destroying source PVC");
    }
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn run_stages(
    client: &Client,
    runner: &PodRunner,
    token: &CancellationToken,
    project: &Project,
    event: &Event,
    environment: &[String],
    pipeline: &Arc<Pipeline>,
    clone_timeout: Duration,
) -> Result<()> {
    source::run_source_clone_pod(client, token, project, event, pipeline.name(), clone_timeout)
        .await?;
    for (index, stage) in pipeline.stages().iter().enumerate() {
        info!(pipeline = %pipeline.name(), stage = index, "executing stage");
        run_stage(stage.targets(), true, |target| {
            let runner = runner.clone();
            let token = token.clone();
            let project = project.clone();
            let event = event.clone();
            let environment = environment.to_vec();
            let pipeline_name = pipeline.name().to_string();
            async move {
                runner
                    .run(
                        &token,
                        &project,
                        &event,
                        &environment,
                        &pipeline_name,
                        index,
                        &target,
                    )
                    .await
            }
        })
        .await?;
    }
    Ok(())
}

async fn sweep_worker_pods(client: &Client, project: &Project, event: &Event) {
    let pods: Api<Pod> = Api::namespaced(client.clone(), &project.kubernetes.namespace);
    let params =
        ListParams::default().labels(&format!("worker={}", event.worker_id.to_lowercase()));
    match pods.delete_collection(&DeleteParams::default(), &params).await {
        Ok(_) => debug!(worker = %event.worker_id, "swept worker pods"),
        Err(err) => {
            warn!(worker = %event.worker_id, error = %err, "error sweeping worker pods");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r#"
targets:
  test:
    containers:
      - name: test
        image: alpine:latest
pipelines:
  pr:
    criteria:
      branches:
        ignore:
          - master
    stages:
      - targets:
          - test
  master:
    criteria:
      branches:
        only:
          - master
    stages:
      - targets:
          - test
  release:
    criteria:
      tags:
        only:
          - /v[0-9]+(\.[0-9]+)*(-.+)?/
    stages:
      - targets:
          - test
  nightly:
    criteria:
      manualOnly: true
    stages:
      - targets:
          - test
"#;

    fn selected_names(trigger: &TriggerRef) -> Vec<String> {
        let config = Config::from_bytes(CONFIG.as_bytes()).unwrap();
        select_pipelines(&config, trigger)
            .unwrap()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    #[test]
    fn null_head_branch_selects_the_pr_pipeline() {
        // branch "" is not "master", so the blacklist passes it.
        let names = selected_names(&TriggerRef::default());
        assert_eq!(names, vec!["pr"]);
    }

    #[test]
    fn master_branch_selects_the_master_pipeline() {
        let names = selected_names(&TriggerRef {
            branch: "master".to_string(),
            tag: String::new(),
        });
        assert_eq!(names, vec!["master"]);
    }

    #[test]
    fn release_tags_select_the_release_pipeline_only() {
        let names = selected_names(&TriggerRef {
            branch: String::new(),
            tag: "v1.2.3".to_string(),
        });
        assert_eq!(names, vec!["release"]);

        let names = selected_names(&TriggerRef {
            branch: String::new(),
            tag: "latest".to_string(),
        });
        assert!(names.is_empty());
    }

    #[test]
    fn selection_propagates_pattern_errors() {
        let config = Config::from_bytes(
            br#"
pipelines:
  broken:
    criteria:
      branches:
        only:
          - /(/
    stages: []
"#,
        )
        .unwrap();
        let err = select_pipelines(
            &config,
            &TriggerRef {
                branch: "master".to_string(),
                tag: String::new(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Selector(_)));
    }
}
