//! The pipeline-scoped shared source volume.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, PostParams};
use tracing::debug;

use drake_core::{ClusterSettings, Error, Event, Project, Result};

/// Name of the source volume shared by all of a pipeline's target pods.
pub fn source_pvc_name(worker_id: &str, pipeline_name: &str) -> String {
    format!(
        "{}-{}",
        worker_id.to_lowercase(),
        pipeline_name.to_lowercase()
    )
}

/// Build the claim for a pipeline's shared source volume.
pub(crate) fn build_source_pvc(
    project: &Project,
    event: &Event,
    pipeline_name: &str,
) -> PersistentVolumeClaim {
    let size = if project.kubernetes.build_storage_size.is_empty() {
        ClusterSettings::DEFAULT_BUILD_STORAGE_SIZE.to_string()
    } else {
        project.kubernetes.build_storage_size.clone()
    };
    let labels = BTreeMap::from([
        ("heritage".to_string(), "brigade".to_string()),
        ("component".to_string(), "buildStorage".to_string()),
        ("project".to_string(), project.id.clone()),
        ("worker".to_string(), event.worker_id.to_lowercase()),
        ("build".to_string(), event.build_id.to_lowercase()),
        ("pipeline".to_string(), pipeline_name.to_string()),
    ]);
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(source_pvc_name(&event.worker_id, pipeline_name)),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            resources: Some(k8s_openapi::api::core::v1::VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size))])),
                ..Default::default()
            }),
            storage_class_name: project.kubernetes.build_storage_class.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Create the pipeline's shared source volume.
pub async fn create_source_pvc(
    client: &Client,
    project: &Project,
    event: &Event,
    pipeline_name: &str,
) -> Result<()> {
    let pvc = build_source_pvc(project, event, pipeline_name);
    let claims: Api<PersistentVolumeClaim> =
        Api::namespaced(client.clone(), &project.kubernetes.namespace);
    claims.create(&PostParams::default(), &pvc).await.map_err(|e| {
        Error::engine(
            format!("error creating source PVC for pipeline \"{pipeline_name}\""),
            e,
        )
    })?;
    debug!(pipeline = %pipeline_name, "created source PVC");
    Ok(())
}

/// Destroy the pipeline's shared source volume.
pub async fn destroy_source_pvc(
    client: &Client,
    project: &Project,
    event: &Event,
    pipeline_name: &str,
) -> Result<()> {
    let claims: Api<PersistentVolumeClaim> =
        Api::namespaced(client.clone(), &project.kubernetes.namespace);
    claims
        .delete(
            &source_pvc_name(&event.worker_id, pipeline_name),
            &DeleteParams::default(),
        )
        .await
        .map_err(|e| {
            Error::engine(
                format!("error deleting source PVC for pipeline \"{pipeline_name}\""),
                e,
            )
        })?;
    debug!(pipeline = %pipeline_name, "destroyed source PVC");
    Ok(())
}
