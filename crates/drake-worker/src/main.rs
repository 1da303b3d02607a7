//! Drake cluster worker.
//!
//! Runs once per build: reads the event and project from the
//! environment the gateway prepared, then executes every matching
//! pipeline on the cluster.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use kube::api::Api;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use drake_core::{ClusterSettings, Event, Project, Repository};
use drake_scheduler::ClusterExecutor;

/// Environment handed to the worker by its gateway.
#[derive(Parser)]
#[command(name = "drake-worker")]
struct WorkerEnv {
    #[arg(long, env = "BRIGADE_PROJECT_ID")]
    project_id: String,
    #[arg(long, env = "BRIGADE_PROJECT_NAMESPACE")]
    project_namespace: String,
    #[arg(long, env = "BRIGADE_SERVICE_ACCOUNT", default_value = "brigade-worker")]
    service_account: String,
    #[arg(long, env = "BRIGADE_BUILD_ID")]
    build_id: Option<String>,
    /// The gateway exposes the worker id as the build name.
    #[arg(long, env = "BRIGADE_BUILD_NAME")]
    build_name: Option<String>,
    #[arg(long, env = "BRIGADE_EVENT_TYPE")]
    event_type: Option<String>,
    #[arg(long, env = "BRIGADE_EVENT_PROVIDER")]
    event_provider: Option<String>,
    #[arg(long, env = "BRIGADE_COMMIT_ID")]
    commit_id: Option<String>,
    #[arg(long, env = "BRIGADE_COMMIT_REF")]
    commit_ref: Option<String>,
    #[arg(long, env = "BRIGADE_PAYLOAD_FILE", default_value = "/etc/brigade/payload")]
    payload_file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let env = WorkerEnv::parse();
    let client = Client::try_default()
        .await
        .context("building the Kubernetes client")?;
    let project = load_project(&client, &env).await?;
    let event = load_event(&env);
    info!(build = %event.build_id, project = %project.id, "worker starting");

    let token = shutdown_token();
    let executor = ClusterExecutor::new(client);
    if let Err(err) = executor.execute_build(&token, &project, &event).await {
        error!(error = %err, "build failed");
        std::process::exit(1);
    }
    if token.is_cancelled() {
        std::process::exit(1);
    }
    Ok(())
}

fn load_event(env: &WorkerEnv) -> Event {
    let mut event = Event::with_defaults();
    if let Some(build_id) = &env.build_id {
        event.build_id = build_id.clone();
    }
    if let Some(build_name) = &env.build_name {
        event.worker_id = build_name.clone();
    }
    if let Some(event_type) = &env.event_type {
        event.event_type = event_type.clone();
    }
    if let Some(provider) = &env.event_provider {
        event.provider = provider.clone();
    }
    if let Some(commit) = &env.commit_id {
        event.revision.commit = commit.clone();
    }
    if let Some(git_ref) = &env.commit_ref {
        event.revision.git_ref = git_ref.clone();
    }
    match std::fs::read(&env.payload_file) {
        Ok(payload) => event.payload = payload,
        Err(_) => warn!(file = %env.payload_file.display(), "no payload loaded"),
    }
    event
}

/// Assemble the project from the worker environment and the
/// project-specific Kubernetes secret.
async fn load_project(client: &Client, env: &WorkerEnv) -> anyhow::Result<Project> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &env.project_namespace);
    let secret = secrets
        .get(&env.project_id)
        .await
        .with_context(|| format!("reading project secret \"{}\"", env.project_id))?;
    let data = secret.data.unwrap_or_default();
    let field = |key: &str| -> String {
        data.get(key)
            .map(|v| String::from_utf8_lossy(&v.0).into_owned())
            .unwrap_or_default()
    };

    let mut project = Project {
        id: env.project_id.clone(),
        name: field("repository"),
        repo: Repository {
            name: secret
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get("projectName"))
                .cloned()
                .unwrap_or_default(),
            clone_url: field("cloneURL"),
            ssh_key: field("sshKey"),
            token: field("github.token"),
            init_git_submodules: field("initGitSubmodules") == "true",
        },
        kubernetes: ClusterSettings {
            namespace: env.project_namespace.clone(),
            service_account: env.service_account.clone(),
            vcs_sidecar: field("vcsSidecar"),
            sidecar_limits_cpu: optional(field("vcsSidecarResources.limits.cpu")),
            sidecar_limits_memory: optional(field("vcsSidecarResources.limits.memory")),
            sidecar_requests_cpu: optional(field("vcsSidecarResources.requests.cpu")),
            sidecar_requests_memory: optional(field("vcsSidecarResources.requests.memory")),
            build_storage_size: field("buildStorageSize"),
            build_storage_class: optional(field("kubernetes.buildStorageClass")),
        },
        allow_privileged_jobs: field("allowPrivilegedJobs") == "true",
        allow_host_mounts: field("allowHostMounts") == "true",
        ..Default::default()
    };
    if project.kubernetes.build_storage_size.is_empty() {
        project.kubernetes.build_storage_size =
            ClusterSettings::DEFAULT_BUILD_STORAGE_SIZE.to_string();
    }
    if let Some(raw) = data.get("secrets") {
        project.secrets = serde_json::from_slice(&raw.0).context("parsing project secrets")?;
    }
    Ok(project)
}

fn optional(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

/// A token that fires on SIGINT or SIGTERM. Teardown paths deliberately
/// do not observe it, so pods and volumes are reclaimed even after a
/// signal.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("installing the SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        signal_token.cancel();
    });
    token
}
