use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde_json::{json, Value};

use super::{
    selector_string, ExecutionBackend, LabelSelector, RunCondition,
    RunEvent, RunEventKind, RunEventStream, RunHandle, RunStatus, RunUnit,
    VolumeRef,
};
use crate::error::BackendError;
use crate::steps::{
    ContainerSpec, EnvValue, NamedData, ResourceSpec, VolumeRequest,
    VolumeSource,
};

/// Object kinds the cluster backend manages.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ManifestKind {
    PersistentVolumeClaim,
    Secret,
    ConfigMap,
    Job,
}

impl ManifestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ManifestKind::Secret => "Secret",
            ManifestKind::ConfigMap => "ConfigMap",
            ManifestKind::Job => "Job",
        }
    }
}

/// A raw watch notification for a batch Job.
#[derive(Clone, Debug, PartialEq)]
pub struct WatchEvent {
    /// `ADDED`, `MODIFIED` or `DELETED`.
    pub event_type: String,
    pub object: Value,
}

/// Minimal cluster API surface the backend needs.
///
/// Implementations wrap a real cluster client; `create` reports
/// `AlreadyExists` and `delete` reports `NotFound` as such.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create(
        &self,
        namespace: &str,
        kind: ManifestKind,
        manifest: Value,
    ) -> Result<(), BackendError>;

    async fn delete(
        &self,
        namespace: &str,
        kind: ManifestKind,
        name: &str,
    ) -> Result<(), BackendError>;

    async fn list_jobs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>, BackendError>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>, BackendError>;

    async fn read_pod_log(
        &self,
        namespace: &str,
        pod_name: &str,
        container: Option<&str>,
    ) -> Result<String, BackendError>;

    async fn watch_jobs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent, BackendError>>, BackendError>;
}

/// Runs steps as batch Jobs in one namespace.
pub struct ClusterBackend<A> {
    api: Arc<A>,
    namespace: String,
}

impl<A> std::fmt::Debug for ClusterBackend<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterBackend")
            .field("api", &std::any::type_name::<A>())
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl<A: ClusterApi> ClusterBackend<A> {
    pub fn new(api: Arc<A>, namespace: impl Into<String>) -> Self {
        Self {
            api,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn delete_ignoring_missing(
        &self,
        kind: ManifestKind,
        name: &str,
    ) -> Result<(), BackendError> {
        match self.api.delete(&self.namespace, kind, name).await {
            Err(err) if err.is_not_found() => Ok(()),
            other => other,
        }
    }
}

fn metadata(name: &str, labels: Option<&BTreeMap<String, String>>) -> Value {
    match labels {
        Some(labels) => json!({ "name": name, "labels": labels }),
        None => json!({ "name": name }),
    }
}

pub fn volume_claim_manifest(request: &VolumeRequest) -> Value {
    let mut spec = json!({
        "accessModes": ["ReadWriteMany"],
        "resources": { "requests": { "storage": format!("{}Gi", request.size_in_g) } },
    });
    if let Some(class) = &request.storage_class {
        spec["storageClassName"] = json!(class);
    }
    json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": metadata(&request.name, None),
        "spec": spec,
    })
}

pub fn secret_manifest(secret: &NamedData) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": metadata(&secret.name, None),
        "stringData": secret.data,
    })
}

pub fn config_map_manifest(config: &NamedData) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": metadata(&config.name, None),
        "data": config.data,
    })
}

fn container_manifest(
    container: &ContainerSpec,
    resources: Option<Value>,
) -> Value {
    let env: Vec<Value> = container
        .env
        .iter()
        .map(|var| match &var.value {
            EnvValue::Literal(value) => json!({ "name": var.name, "value": value }),
            EnvValue::SecretKey { secret, key } => json!({
                "name": var.name,
                "valueFrom": { "secretKeyRef": { "name": secret, "key": key } },
            }),
        })
        .collect();
    let mounts: Vec<Value> = container
        .mounts
        .iter()
        .map(|mount| {
            json!({
                "name": mount.name,
                "mountPath": mount.mount_path,
                "readOnly": mount.read_only,
            })
        })
        .collect();
    let mut manifest = json!({
        "name": container.name,
        "image": container.image,
        "command": container.command,
        "env": env,
        "volumeMounts": mounts,
    });
    if let Some(dir) = &container.working_dir {
        manifest["workingDir"] = json!(dir);
    }
    if let Some(resources) = resources {
        manifest["resources"] = resources;
    }
    manifest
}

/// Batch Job manifest for a run; never retried by the cluster.
pub fn job_manifest(
    name: &str,
    spec: &ResourceSpec,
    labels: &BTreeMap<String, String>,
) -> Value {
    let requests = json!({
        "cpu": spec.cpu.to_string(),
        "memory": format!("{}Gi", spec.memory_in_g),
    });
    let resources = json!({ "requests": requests, "limits": requests });
    let mut containers = vec![container_manifest(&spec.container, Some(resources))];
    if let Some(sidecar) = &spec.sidecar {
        containers.push(container_manifest(sidecar, None));
    }
    let volumes: Vec<Value> = spec
        .volumes()
        .into_iter()
        .map(|mount| match &mount.source {
            VolumeSource::PersistentClaim { claim_name } => json!({
                "name": mount.name,
                "persistentVolumeClaim": {
                    "claimName": claim_name,
                    "readOnly": mount.read_only,
                },
            }),
            VolumeSource::Secret { secret_name } => json!({
                "name": mount.name,
                "secret": { "secretName": secret_name },
            }),
            VolumeSource::Config { config_name } => json!({
                "name": mount.name,
                "configMap": { "name": config_name },
            }),
        })
        .collect();
    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": metadata(name, Some(labels)),
        "spec": {
            "backoffLimit": 0,
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "restartPolicy": "Never",
                    "containers": containers,
                    "volumes": volumes,
                },
            },
        },
    })
}

fn object_name(object: &Value) -> Option<String> {
    object["metadata"]["name"].as_str().map(str::to_string)
}

fn object_labels(object: &Value) -> BTreeMap<String, String> {
    object["metadata"]["labels"]
        .as_object()
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn condition_is_true(condition: &Value, kind: &str) -> bool {
    condition["type"].as_str() == Some(kind)
        && condition["status"].as_str() == Some("True")
}

/// Read a batch Job object into a run status.
pub fn job_status(object: &Value) -> Option<RunStatus> {
    let name = object_name(object)?;
    let status = &object["status"];
    let conditions = status["conditions"].as_array().cloned().unwrap_or_default();
    let failed = conditions.iter().find(|c| condition_is_true(c, "Failed"));
    let (condition, reason) = if conditions.iter().any(|c| condition_is_true(c, "Complete")) {
        (RunCondition::Succeeded, None)
    } else if let Some(failed) = failed {
        (
            RunCondition::Failed,
            failed["message"]
                .as_str()
                .or_else(|| failed["reason"].as_str())
                .map(str::to_string),
        )
    } else if status["active"].as_u64().unwrap_or(0) > 0 {
        (RunCondition::Running, None)
    } else {
        (RunCondition::Pending, None)
    };
    Some(RunStatus {
        name,
        labels: object_labels(object),
        condition,
        reason,
    })
}

fn watch_event_kind(event_type: &str) -> Option<RunEventKind> {
    match event_type {
        "ADDED" => Some(RunEventKind::Added),
        "MODIFIED" => Some(RunEventKind::Modified),
        "DELETED" => Some(RunEventKind::Deleted),
        _ => None,
    }
}

#[async_trait]
impl<A: ClusterApi + 'static> ExecutionBackend for ClusterBackend<A> {
    fn name(&self) -> &'static str {
        "cluster"
    }

    async fn create_persistent_volume(
        &self,
        request: &VolumeRequest,
    ) -> Result<VolumeRef, BackendError> {
        self.api
            .create(
                &self.namespace,
                ManifestKind::PersistentVolumeClaim,
                volume_claim_manifest(request),
            )
            .await?;
        Ok(VolumeRef {
            name: request.name.clone(),
            size_in_g: request.size_in_g,
        })
    }

    async fn delete_persistent_volume(
        &self,
        name: &str,
    ) -> Result<(), BackendError> {
        self.delete_ignoring_missing(ManifestKind::PersistentVolumeClaim, name)
            .await
    }

    async fn create_secret(
        &self,
        secret: &NamedData,
    ) -> Result<(), BackendError> {
        self.api
            .create(&self.namespace, ManifestKind::Secret, secret_manifest(secret))
            .await
    }

    async fn delete_secret(&self, name: &str) -> Result<(), BackendError> {
        self.delete_ignoring_missing(ManifestKind::Secret, name).await
    }

    async fn create_config(
        &self,
        config: &NamedData,
    ) -> Result<(), BackendError> {
        self.api
            .create(
                &self.namespace,
                ManifestKind::ConfigMap,
                config_map_manifest(config),
            )
            .await
    }

    async fn delete_config(&self, name: &str) -> Result<(), BackendError> {
        self.delete_ignoring_missing(ManifestKind::ConfigMap, name).await
    }

    async fn run(
        &self,
        name: &str,
        spec: &ResourceSpec,
        labels: &BTreeMap<String, String>,
    ) -> Result<RunHandle, BackendError> {
        self.api
            .create(
                &self.namespace,
                ManifestKind::Job,
                job_manifest(name, spec, labels),
            )
            .await?;
        Ok(RunHandle {
            name: name.to_string(),
        })
    }

    async fn delete_run(&self, name: &str) -> Result<(), BackendError> {
        self.delete_ignoring_missing(ManifestKind::Job, name).await
    }

    async fn list_runs(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<RunStatus>, BackendError> {
        let jobs = self
            .api
            .list_jobs(&self.namespace, &selector_string(selector))
            .await?;
        Ok(jobs.iter().filter_map(job_status).collect())
    }

    async fn list_run_units(
        &self,
        run_name: &str,
    ) -> Result<Vec<RunUnit>, BackendError> {
        let pods = self
            .api
            .list_pods(&self.namespace, &format!("job-name={run_name}"))
            .await?;
        Ok(pods
            .iter()
            .filter_map(|pod| {
                let name = object_name(pod)?;
                let created_at = pod["metadata"]["creationTimestamp"]
                    .as_str()
                    .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                    .map(|ts| ts.with_timezone(&Utc))?;
                Some(RunUnit { name, created_at })
            })
            .collect())
    }

    async fn read_unit_logs(
        &self,
        unit_name: &str,
        container: Option<&str>,
    ) -> Result<String, BackendError> {
        self.api
            .read_pod_log(&self.namespace, unit_name, container)
            .await
    }

    async fn watch_runs(
        &self,
        selector: &LabelSelector,
    ) -> Result<RunEventStream, BackendError> {
        let events = self
            .api
            .watch_jobs(&self.namespace, &selector_string(selector))
            .await?;
        Ok(events
            .filter_map(|event| async move {
                match event {
                    Err(err) => Some(Err(err)),
                    Ok(event) => {
                        let kind = watch_event_kind(&event.event_type)?;
                        let run = job_status(&event.object)?;
                        Some(Ok(RunEvent { kind, run }))
                    }
                }
            })
            .boxed())
    }
}
