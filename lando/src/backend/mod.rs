//! Execution backends.
//!
//! An [`ExecutionBackend`] provisions, runs and tears down the resources a
//! step plan declares. Runs are fire-and-forget: completion is observed
//! through [`ExecutionBackend::watch_runs`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::steps::{NamedData, ResourceSpec, Teardown, VolumeRequest};

/// Kubernetes-shaped backend driven through [`cluster::ClusterApi`].
pub mod cluster;
/// Cloud VM backend driven through [`vm::CloudApi`].
pub mod vm;

pub use cluster::{ClusterApi, ClusterBackend, ManifestKind, WatchEvent};
pub use vm::{CloudApi, Flavor, Instance, InstanceRequest, InstanceStatus, VmBackend};

/// Label selector: every entry must match.
pub type LabelSelector = BTreeMap<String, String>;

/// Event stream returned by [`ExecutionBackend::watch_runs`].
pub type RunEventStream = BoxStream<'static, Result<RunEvent, BackendError>>;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VolumeRef {
    pub name: String,
    pub size_in_g: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunHandle {
    pub name: String,
}

/// Coarse condition of a backend run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunCondition {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunCondition {
    pub fn is_finished(&self) -> bool {
        matches!(self, RunCondition::Succeeded | RunCondition::Failed)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub condition: RunCondition,
    /// Backend failure reason when the backend reports one.
    pub reason: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub kind: RunEventKind,
    pub run: RunStatus,
}

/// A log producing unit of a run (a pod, an instance).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunUnit {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Capability to provision and run step work remotely.
///
/// Deletes are idempotent: removing a resource that does not exist is `Ok`.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Short backend name used in logs and spans.
    fn name(&self) -> &'static str;

    /// Create a persistent volume. Fails with `AlreadyExists` when a volume
    /// of that name is already present.
    async fn create_persistent_volume(
        &self,
        request: &VolumeRequest,
    ) -> Result<VolumeRef, BackendError>;

    async fn delete_persistent_volume(
        &self,
        name: &str,
    ) -> Result<(), BackendError>;

    async fn create_secret(&self, secret: &NamedData)
        -> Result<(), BackendError>;

    async fn delete_secret(&self, name: &str) -> Result<(), BackendError>;

    async fn create_config(&self, config: &NamedData)
        -> Result<(), BackendError>;

    async fn delete_config(&self, name: &str) -> Result<(), BackendError>;

    /// Schedule a run and return without waiting for it.
    async fn run(
        &self,
        name: &str,
        spec: &ResourceSpec,
        labels: &BTreeMap<String, String>,
    ) -> Result<RunHandle, BackendError>;

    async fn delete_run(&self, name: &str) -> Result<(), BackendError>;

    async fn list_runs(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<RunStatus>, BackendError>;

    /// Log producing units of a run, in no particular order.
    async fn list_run_units(
        &self,
        run_name: &str,
    ) -> Result<Vec<RunUnit>, BackendError>;

    /// Logs of one unit, optionally of a single named container.
    async fn read_unit_logs(
        &self,
        unit_name: &str,
        container: Option<&str>,
    ) -> Result<String, BackendError>;

    /// Stream of run events for runs matching `selector`.
    async fn watch_runs(
        &self,
        selector: &LabelSelector,
    ) -> Result<RunEventStream, BackendError>;
}

#[async_trait]
impl<T: ExecutionBackend + ?Sized> ExecutionBackend for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn create_persistent_volume(
        &self,
        request: &VolumeRequest,
    ) -> Result<VolumeRef, BackendError> {
        (**self).create_persistent_volume(request).await
    }

    async fn delete_persistent_volume(
        &self,
        name: &str,
    ) -> Result<(), BackendError> {
        (**self).delete_persistent_volume(name).await
    }

    async fn create_secret(
        &self,
        secret: &NamedData,
    ) -> Result<(), BackendError> {
        (**self).create_secret(secret).await
    }

    async fn delete_secret(&self, name: &str) -> Result<(), BackendError> {
        (**self).delete_secret(name).await
    }

    async fn create_config(
        &self,
        config: &NamedData,
    ) -> Result<(), BackendError> {
        (**self).create_config(config).await
    }

    async fn delete_config(&self, name: &str) -> Result<(), BackendError> {
        (**self).delete_config(name).await
    }

    async fn run(
        &self,
        name: &str,
        spec: &ResourceSpec,
        labels: &BTreeMap<String, String>,
    ) -> Result<RunHandle, BackendError> {
        (**self).run(name, spec, labels).await
    }

    async fn delete_run(&self, name: &str) -> Result<(), BackendError> {
        (**self).delete_run(name).await
    }

    async fn list_runs(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<RunStatus>, BackendError> {
        (**self).list_runs(selector).await
    }

    async fn list_run_units(
        &self,
        run_name: &str,
    ) -> Result<Vec<RunUnit>, BackendError> {
        (**self).list_run_units(run_name).await
    }

    async fn read_unit_logs(
        &self,
        unit_name: &str,
        container: Option<&str>,
    ) -> Result<String, BackendError> {
        (**self).read_unit_logs(unit_name, container).await
    }

    async fn watch_runs(
        &self,
        selector: &LabelSelector,
    ) -> Result<RunEventStream, BackendError> {
        (**self).watch_runs(selector).await
    }
}

/// Most recently created unit; later creation wins ties on name order.
pub fn latest_unit(units: &[RunUnit]) -> Option<&RunUnit> {
    units
        .iter()
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)))
}

/// Read the logs of the latest unit of `run_name`.
pub async fn read_run_logs<B: ExecutionBackend + ?Sized>(
    backend: &B,
    run_name: &str,
    container: Option<&str>,
) -> Result<String, BackendError> {
    let units = backend.list_run_units(run_name).await?;
    let unit = latest_unit(&units).ok_or_else(|| BackendError::NotFound {
        kind: "run unit",
        name: run_name.to_string(),
    })?;
    backend.read_unit_logs(&unit.name, container).await
}

/// Delete everything in `teardown`: runs first, volumes last.
///
/// Keeps going after a failed delete and returns the first error.
pub async fn apply_teardown<B: ExecutionBackend + ?Sized>(
    backend: &B,
    teardown: &Teardown,
) -> Result<(), BackendError> {
    let mut first_error = None;
    let mut note = |result: Result<(), BackendError>| {
        if let Err(err) = result {
            tracing::warn!(error = %err, "teardown delete failed");
            first_error.get_or_insert(err);
        }
    };
    for name in &teardown.runs {
        note(backend.delete_run(name).await);
    }
    for name in &teardown.configs {
        note(backend.delete_config(name).await);
    }
    for name in &teardown.secrets {
        note(backend.delete_secret(name).await);
    }
    for name in &teardown.volumes {
        note(backend.delete_persistent_volume(name).await);
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Render a selector as `k=v,k2=v2`.
pub fn selector_string(selector: &LabelSelector) -> String {
    selector
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn latest_unit_wins_by_creation_time() {
        let at = |secs| Utc.timestamp_opt(secs, 0).unwrap();
        let units = vec![
            RunUnit { name: "pod-b".into(), created_at: at(10) },
            RunUnit { name: "pod-c".into(), created_at: at(30) },
            RunUnit { name: "pod-a".into(), created_at: at(20) },
        ];
        assert_eq!(latest_unit(&units).unwrap().name, "pod-c");
        assert!(latest_unit(&[]).is_none());
    }

    #[test]
    fn selector_renders_sorted() {
        let selector = LabelSelector::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]);
        assert_eq!(selector_string(&selector), "a=1,b=2");
    }
}
