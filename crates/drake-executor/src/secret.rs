//! The build-scoped Kubernetes secret.
//!
//! Created once per build before any pipeline starts; target containers
//! reference its keys through `SecretKeyRef` env vars.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, PostParams};
use tracing::debug;

use drake_core::{Error, Event, Project, Result};

/// Name of the secret holding a build's project secrets.
pub fn build_secret_name(build_id: &str) -> String {
    build_id.to_lowercase()
}

pub(crate) fn build_build_secret(project: &Project, event: &Event) -> Secret {
    let labels = BTreeMap::from([
        ("heritage".to_string(), "brigade".to_string()),
        ("component".to_string(), "buildSecret".to_string()),
        ("project".to_string(), project.id.clone()),
        ("worker".to_string(), event.worker_id.to_lowercase()),
        ("build".to_string(), event.build_id.to_lowercase()),
    ]);
    Secret {
        metadata: ObjectMeta {
            name: Some(build_secret_name(&event.build_id)),
            labels: Some(labels),
            ..Default::default()
        },
        string_data: Some(project.secrets.clone()),
        ..Default::default()
    }
}

/// Create the secret for this build.
pub async fn create_build_secret(client: &Client, project: &Project, event: &Event) -> Result<()> {
    let secret = build_build_secret(project, event);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &project.kubernetes.namespace);
    secrets
        .create(&PostParams::default(), &secret)
        .await
        .map_err(|e| {
            Error::engine(
                format!("error creating secret for build \"{}\"", event.build_id),
                e,
            )
        })?;
    debug!(build = %event.build_id, "created build secret");
    Ok(())
}

/// Destroy the secret for this build.
pub async fn destroy_build_secret(client: &Client, project: &Project, event: &Event) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &project.kubernetes.namespace);
    secrets
        .delete(&build_secret_name(&event.build_id), &DeleteParams::default())
        .await
        .map_err(|e| {
            Error::engine(
                format!("error deleting build secret for build \"{}\"", event.build_id),
                e,
            )
        })?;
    debug!(build = %event.build_id, "destroyed build secret");
    Ok(())
}
