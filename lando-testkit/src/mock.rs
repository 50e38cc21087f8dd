use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use lando::backend::{
    ClusterApi, CloudApi, Instance, InstanceRequest, InstanceStatus,
    ManifestKind, WatchEvent,
};
use lando::error::BackendError;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

fn parse_selector(selector: &str) -> BTreeMap<String, String> {
    selector
        .split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn matches_selector(object: &Value, selector: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(key, value)| object["metadata"]["labels"][key].as_str() == Some(value))
}

#[derive(Default)]
struct ClusterState {
    objects: HashMap<(ManifestKind, String), Value>,
    pods: Vec<(String, Value, HashMap<Option<String>, String>)>,
    namespaces: Vec<String>,
    create_failures: Vec<BackendError>,
    watchers: Vec<mpsc::UnboundedSender<Result<WatchEvent, BackendError>>>,
}

/// In-memory stand-in for a cluster API server.
#[derive(Clone, Default)]
pub struct FakeClusterApi {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, kind: ManifestKind, name: &str) -> Option<Value> {
        self.state
            .lock()
            .objects
            .get(&(kind, name.to_string()))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Namespaces seen by every call, in order.
    pub fn namespaces(&self) -> Vec<String> {
        self.state.lock().namespaces.clone()
    }

    pub fn fail_next_create(&self, err: BackendError) {
        self.state.lock().create_failures.push(err);
    }

    /// Register a pod of `job` with one entry per container. A `None` name
    /// stands for the only container of a single-container pod. Like the
    /// API server, reading without a container name fails once the pod has
    /// more than one.
    pub fn add_pod(
        &self,
        job: &str,
        pod: &str,
        created_at: DateTime<Utc>,
        logs: &[(Option<&str>, &str)],
    ) {
        let object = json!({
            "metadata": {
                "name": pod,
                "labels": { "job-name": job },
                "creationTimestamp": created_at.to_rfc3339(),
            },
        });
        let logs = logs
            .iter()
            .map(|(container, text)| (container.map(str::to_string), text.to_string()))
            .collect();
        self.state.lock().pods.push((pod.to_string(), object, logs));
    }

    /// Set a batch Job condition (`Complete` or `Failed`) and send a
    /// `MODIFIED` event.
    pub fn set_job_condition(&self, name: &str, condition: &str) {
        let mut state = self.state.lock();
        let Some(job) = state.objects.get_mut(&(ManifestKind::Job, name.to_string()))
        else {
            return;
        };
        job["status"] = json!({
            "conditions": [{ "type": condition, "status": "True" }],
        });
        let event = WatchEvent {
            event_type: "MODIFIED".to_string(),
            object: job.clone(),
        };
        state
            .watchers
            .retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn create(
        &self,
        namespace: &str,
        kind: ManifestKind,
        manifest: Value,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.namespaces.push(namespace.to_string());
        if !state.create_failures.is_empty() {
            return Err(state.create_failures.remove(0));
        }
        let name = manifest["metadata"]["name"]
            .as_str()
            .ok_or_else(|| BackendError::InvalidSpec("manifest without a name".into()))?
            .to_string();
        let key = (kind, name.clone());
        if state.objects.contains_key(&key) {
            return Err(BackendError::AlreadyExists {
                kind: kind.as_str(),
                name,
            });
        }
        if kind == ManifestKind::Job {
            let event = WatchEvent {
                event_type: "ADDED".to_string(),
                object: manifest.clone(),
            };
            state
                .watchers
                .retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
        }
        state.objects.insert(key, manifest);
        Ok(())
    }

    async fn delete(
        &self,
        namespace: &str,
        kind: ManifestKind,
        name: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.namespaces.push(namespace.to_string());
        match state.objects.remove(&(kind, name.to_string())) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound {
                kind: kind.as_str(),
                name: name.to_string(),
            }),
        }
    }

    async fn list_jobs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>, BackendError> {
        let selector = parse_selector(label_selector);
        let mut state = self.state.lock();
        state.namespaces.push(namespace.to_string());
        Ok(state
            .objects
            .iter()
            .filter(|((kind, _), object)| {
                *kind == ManifestKind::Job && matches_selector(object, &selector)
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>, BackendError> {
        let selector = parse_selector(label_selector);
        let mut state = self.state.lock();
        state.namespaces.push(namespace.to_string());
        Ok(state
            .pods
            .iter()
            .filter(|(_, object, _)| matches_selector(object, &selector))
            .map(|(_, object, _)| object.clone())
            .collect())
    }

    async fn read_pod_log(
        &self,
        namespace: &str,
        pod_name: &str,
        container: Option<&str>,
    ) -> Result<String, BackendError> {
        let mut state = self.state.lock();
        state.namespaces.push(namespace.to_string());
        let not_found = || BackendError::NotFound {
            kind: "pod log",
            name: pod_name.to_string(),
        };
        let (_, _, logs) = state
            .pods
            .iter()
            .find(|(name, _, _)| name == pod_name)
            .ok_or_else(not_found)?;
        match container {
            Some(container) => logs
                .get(&Some(container.to_string()))
                .or_else(|| logs.get(&None).filter(|_| logs.len() == 1))
                .cloned()
                .ok_or_else(not_found),
            None if logs.len() > 1 => Err(BackendError::Request(format!(
                "a container name must be specified for pod {pod_name}"
            ))),
            None => logs.values().next().cloned().ok_or_else(not_found),
        }
    }

    async fn watch_jobs(
        &self,
        namespace: &str,
        _label_selector: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent, BackendError>>, BackendError>
    {
        let mut state = self.state.lock();
        state.namespaces.push(namespace.to_string());
        let (tx, rx) = mpsc::unbounded();
        state.watchers.push(tx);
        Ok(rx.boxed())
    }
}

#[derive(Default)]
struct CloudState {
    volumes: BTreeMap<String, u32>,
    instances: BTreeMap<String, Instance>,
    requests: Vec<InstanceRequest>,
    consoles: HashMap<String, String>,
    capacity_exhausted: bool,
    list_failures: usize,
}

/// In-memory stand-in for a cloud compute API.
#[derive(Clone, Default)]
pub struct FakeCloudApi {
    state: Arc<Mutex<CloudState>>,
}

impl FakeCloudApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state.lock().volumes.contains_key(name)
    }

    pub fn instance(&self, name: &str) -> Option<Instance> {
        self.state.lock().instances.get(name).cloned()
    }

    /// Launch requests in the order received.
    pub fn requests(&self) -> Vec<InstanceRequest> {
        self.state.lock().requests.clone()
    }

    /// Reject launches with `Capacity`, as a cloud with no valid host would.
    pub fn set_capacity_exhausted(&self, exhausted: bool) {
        self.state.lock().capacity_exhausted = exhausted;
    }

    /// Fail the next `count` instance listings.
    pub fn fail_listings(&self, count: usize) {
        self.state.lock().list_failures = count;
    }

    pub fn set_status(&self, name: &str, status: InstanceStatus) {
        if let Some(instance) = self.state.lock().instances.get_mut(name) {
            instance.status = status;
        }
    }

    /// Power an instance off with `exit_code` and its console output.
    pub fn power_off(&self, name: &str, exit_code: i32, console: &str) {
        let mut state = self.state.lock();
        if let Some(instance) = state.instances.get_mut(name) {
            instance.status = InstanceStatus::Shutoff;
            instance.exit_code = Some(exit_code);
        }
        state.consoles.insert(name.to_string(), console.to_string());
    }
}

#[async_trait]
impl CloudApi for FakeCloudApi {
    async fn create_volume(
        &self,
        name: &str,
        size_in_g: u32,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.volumes.contains_key(name) {
            return Err(BackendError::AlreadyExists {
                kind: "volume",
                name: name.to_string(),
            });
        }
        state.volumes.insert(name.to_string(), size_in_g);
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), BackendError> {
        match self.state.lock().volumes.remove(name) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound {
                kind: "volume",
                name: name.to_string(),
            }),
        }
    }

    async fn launch_instance(
        &self,
        request: InstanceRequest,
    ) -> Result<Instance, BackendError> {
        let mut state = self.state.lock();
        if state.capacity_exhausted {
            return Err(BackendError::Capacity {
                resource: "host".into(),
                message: "no valid host was found".into(),
            });
        }
        if state.instances.contains_key(&request.name) {
            return Err(BackendError::AlreadyExists {
                kind: "instance",
                name: request.name.clone(),
            });
        }
        let instance = Instance {
            name: request.name.clone(),
            status: InstanceStatus::Active,
            metadata: request.metadata.clone(),
            created_at: Utc::now(),
            exit_code: None,
            fault: None,
        };
        state.instances.insert(request.name.clone(), instance.clone());
        state.requests.push(request);
        Ok(instance)
    }

    async fn delete_instance(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.consoles.remove(name);
        match state.instances.remove(name) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound {
                kind: "instance",
                name: name.to_string(),
            }),
        }
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, BackendError> {
        let mut state = self.state.lock();
        if state.list_failures > 0 {
            state.list_failures -= 1;
            return Err(BackendError::Request("compute api unavailable".into()));
        }
        Ok(state.instances.values().cloned().collect())
    }

    async fn console_log(&self, name: &str) -> Result<String, BackendError> {
        self.state
            .lock()
            .consoles
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::NotFound {
                kind: "console log",
                name: name.to_string(),
            })
    }
}
