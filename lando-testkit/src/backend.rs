use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::StreamExt;
use lando::backend::{
    ExecutionBackend, LabelSelector, RunCondition, RunEvent, RunEventKind,
    RunEventStream, RunHandle, RunStatus, RunUnit, VolumeRef,
};
use lando::error::BackendError;
use lando::names::{labels_match, ResourceNames};
use lando::steps::{NamedData, ResourceSpec, VolumeRequest};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// Backend operations that can be made to fail.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BackendOp {
    CreateVolume,
    DeleteVolume,
    CreateSecret,
    DeleteSecret,
    CreateConfig,
    DeleteConfig,
    Run,
    DeleteRun,
    ListRunUnits,
    ReadLogs,
    Watch,
}

/// One recorded mutating call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BackendCall {
    CreateVolume(String),
    DeleteVolume(String),
    CreateSecret(String),
    DeleteSecret(String),
    CreateConfig(String),
    DeleteConfig(String),
    Run(String),
    DeleteRun(String),
}

impl BackendCall {
    pub fn name(&self) -> &str {
        match self {
            BackendCall::CreateVolume(n)
            | BackendCall::DeleteVolume(n)
            | BackendCall::CreateSecret(n)
            | BackendCall::DeleteSecret(n)
            | BackendCall::CreateConfig(n)
            | BackendCall::DeleteConfig(n)
            | BackendCall::Run(n)
            | BackendCall::DeleteRun(n) => n,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(
            self,
            BackendCall::CreateVolume(_)
                | BackendCall::CreateSecret(_)
                | BackendCall::CreateConfig(_)
                | BackendCall::Run(_)
        )
    }
}

#[derive(Clone, Debug)]
pub struct StoredRun {
    pub spec: ResourceSpec,
    pub labels: BTreeMap<String, String>,
    pub condition: RunCondition,
    pub created_at: DateTime<Utc>,
    /// Logs by container name.
    pub logs: HashMap<String, String>,
}

impl StoredRun {
    fn status(&self, name: &str) -> RunStatus {
        RunStatus {
            name: name.to_string(),
            labels: self.labels.clone(),
            condition: self.condition,
            reason: None,
        }
    }
}

type Watcher = mpsc::UnboundedSender<Result<RunEvent, BackendError>>;

#[derive(Default)]
struct State {
    volumes: BTreeMap<String, VolumeRequest>,
    secrets: BTreeMap<String, NamedData>,
    configs: BTreeMap<String, NamedData>,
    runs: BTreeMap<String, StoredRun>,
    calls: Vec<BackendCall>,
    failures: HashMap<BackendOp, VecDeque<BackendError>>,
    watchers: Vec<(LabelSelector, Watcher)>,
    watch_count: usize,
}

impl State {
    fn take_failure(&mut self, op: BackendOp) -> Result<(), BackendError> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn emit(&mut self, event: RunEvent) {
        self.watchers.retain(|(selector, tx)| {
            if !labels_match(selector, &event.run.labels) {
                return !tx.is_closed();
            }
            tx.unbounded_send(Ok(event.clone())).is_ok()
        });
    }
}

/// Execution backend holding every resource in memory.
///
/// Records each mutating call, lets tests finish or fail runs (emitting run
/// events to open watch streams) and injects failures per operation.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryBackend")
            .field("volumes", &state.volumes.len())
            .field("secrets", &state.secrets.len())
            .field("configs", &state.configs.len())
            .field("runs", &state.runs.len())
            .finish()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `err`. Queued failures are used
    /// in order, one per call.
    pub fn fail_next(&self, op: BackendOp, err: BackendError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn created(&self) -> Vec<BackendCall> {
        self.calls().into_iter().filter(BackendCall::is_create).collect()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let calls = self.calls();
        assert_eq!(
            calls.len(),
            expected,
            "Expected {} backend calls, got {:?}",
            expected,
            calls
        );
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state.lock().volumes.contains_key(name)
    }

    pub fn has_secret(&self, name: &str) -> bool {
        self.state.lock().secrets.contains_key(name)
    }

    pub fn has_config(&self, name: &str) -> bool {
        self.state.lock().configs.contains_key(name)
    }

    pub fn has_run(&self, name: &str) -> bool {
        self.state.lock().runs.contains_key(name)
    }

    pub fn stored_run(&self, name: &str) -> Option<StoredRun> {
        self.state.lock().runs.get(name).cloned()
    }

    pub fn secret(&self, name: &str) -> Option<NamedData> {
        self.state.lock().secrets.get(name).cloned()
    }

    pub fn config(&self, name: &str) -> Option<NamedData> {
        self.state.lock().configs.get(name).cloned()
    }

    pub fn volume(&self, name: &str) -> Option<VolumeRequest> {
        self.state.lock().volumes.get(name).cloned()
    }

    /// Names of every resource still present for a job, sorted.
    pub fn resources_for(&self, names: &ResourceNames) -> Vec<String> {
        let suffix = format!("-{}", names.suffix());
        let state = self.state.lock();
        let mut found: Vec<String> = state
            .volumes
            .keys()
            .chain(state.secrets.keys())
            .chain(state.configs.keys())
            .chain(state.runs.keys())
            .filter(|name| name.ends_with(&suffix))
            .cloned()
            .collect();
        found.sort();
        found
    }

    pub fn resource_count(&self) -> usize {
        let state = self.state.lock();
        state.volumes.len()
            + state.secrets.len()
            + state.configs.len()
            + state.runs.len()
    }

    /// Number of `watch_runs` streams opened so far.
    pub fn watch_count(&self) -> usize {
        self.state.lock().watch_count
    }

    pub fn set_logs(&self, run: &str, container: &str, logs: &str) {
        if let Some(stored) = self.state.lock().runs.get_mut(run) {
            stored.logs.insert(container.to_string(), logs.to_string());
        }
    }

    /// Mark a run succeeded and notify watchers.
    pub fn complete_run(&self, run: &str) {
        self.finish(run, RunCondition::Succeeded, None);
    }

    /// Mark a run failed with `logs` as its output and notify watchers.
    pub fn fail_run(&self, run: &str, logs: &str) {
        self.finish(run, RunCondition::Failed, Some(logs));
    }

    fn finish(&self, run: &str, condition: RunCondition, logs: Option<&str>) {
        let mut state = self.state.lock();
        let Some(stored) = state.runs.get_mut(run) else {
            return;
        };
        stored.condition = condition;
        if let Some(logs) = logs {
            stored
                .logs
                .insert(stored.spec.container.name.clone(), logs.to_string());
        }
        let status = stored.status(run);
        state.emit(RunEvent {
            kind: RunEventKind::Modified,
            run: status,
        });
    }

    /// Send an arbitrary event to open watch streams.
    pub fn emit(&self, event: RunEvent) {
        self.state.lock().emit(event);
    }

    /// Terminate open watch streams with `StreamClosed`.
    pub fn break_watches(&self) {
        let watchers = std::mem::take(&mut self.state.lock().watchers);
        for (_, tx) in watchers {
            let _ = tx.unbounded_send(Err(BackendError::StreamClosed));
        }
    }

    /// End open watch streams cleanly.
    pub fn close_watches(&self) {
        self.state.lock().watchers.clear();
    }
}

#[async_trait]
impl ExecutionBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn create_persistent_volume(
        &self,
        request: &VolumeRequest,
    ) -> Result<VolumeRef, BackendError> {
        let mut state = self.state.lock();
        state.take_failure(BackendOp::CreateVolume)?;
        state.calls.push(BackendCall::CreateVolume(request.name.clone()));
        if state.volumes.contains_key(&request.name) {
            return Err(BackendError::AlreadyExists {
                kind: "volume",
                name: request.name.clone(),
            });
        }
        state.volumes.insert(request.name.clone(), request.clone());
        Ok(VolumeRef {
            name: request.name.clone(),
            size_in_g: request.size_in_g,
        })
    }

    async fn delete_persistent_volume(
        &self,
        name: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.take_failure(BackendOp::DeleteVolume)?;
        state.calls.push(BackendCall::DeleteVolume(name.to_string()));
        state.volumes.remove(name);
        Ok(())
    }

    async fn create_secret(
        &self,
        secret: &NamedData,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.take_failure(BackendOp::CreateSecret)?;
        state.calls.push(BackendCall::CreateSecret(secret.name.clone()));
        if state.secrets.contains_key(&secret.name) {
            return Err(BackendError::AlreadyExists {
                kind: "secret",
                name: secret.name.clone(),
            });
        }
        state.secrets.insert(secret.name.clone(), secret.clone());
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.take_failure(BackendOp::DeleteSecret)?;
        state.calls.push(BackendCall::DeleteSecret(name.to_string()));
        state.secrets.remove(name);
        Ok(())
    }

    async fn create_config(
        &self,
        config: &NamedData,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.take_failure(BackendOp::CreateConfig)?;
        state.calls.push(BackendCall::CreateConfig(config.name.clone()));
        if state.configs.contains_key(&config.name) {
            return Err(BackendError::AlreadyExists {
                kind: "config",
                name: config.name.clone(),
            });
        }
        state.configs.insert(config.name.clone(), config.clone());
        Ok(())
    }

    async fn delete_config(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.take_failure(BackendOp::DeleteConfig)?;
        state.calls.push(BackendCall::DeleteConfig(name.to_string()));
        state.configs.remove(name);
        Ok(())
    }

    async fn run(
        &self,
        name: &str,
        spec: &ResourceSpec,
        labels: &BTreeMap<String, String>,
    ) -> Result<RunHandle, BackendError> {
        let mut state = self.state.lock();
        state.take_failure(BackendOp::Run)?;
        state.calls.push(BackendCall::Run(name.to_string()));
        if state.runs.contains_key(name) {
            return Err(BackendError::AlreadyExists {
                kind: "run",
                name: name.to_string(),
            });
        }
        let stored = StoredRun {
            spec: spec.clone(),
            labels: labels.clone(),
            condition: RunCondition::Pending,
            created_at: Utc::now(),
            logs: HashMap::new(),
        };
        let status = stored.status(name);
        state.runs.insert(name.to_string(), stored);
        state.emit(RunEvent {
            kind: RunEventKind::Added,
            run: status,
        });
        Ok(RunHandle {
            name: name.to_string(),
        })
    }

    async fn delete_run(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.take_failure(BackendOp::DeleteRun)?;
        state.calls.push(BackendCall::DeleteRun(name.to_string()));
        if let Some(stored) = state.runs.remove(name) {
            let status = stored.status(name);
            state.emit(RunEvent {
                kind: RunEventKind::Deleted,
                run: status,
            });
        }
        Ok(())
    }

    async fn list_runs(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<RunStatus>, BackendError> {
        let state = self.state.lock();
        Ok(state
            .runs
            .iter()
            .filter(|(_, run)| labels_match(selector, &run.labels))
            .map(|(name, run)| run.status(name))
            .collect())
    }

    async fn list_run_units(
        &self,
        run_name: &str,
    ) -> Result<Vec<RunUnit>, BackendError> {
        let mut state = self.state.lock();
        state.take_failure(BackendOp::ListRunUnits)?;
        Ok(state
            .runs
            .get(run_name)
            .map(|run| {
                vec![RunUnit {
                    name: run_name.to_string(),
                    created_at: run.created_at,
                }]
            })
            .unwrap_or_default())
    }

    async fn read_unit_logs(
        &self,
        unit_name: &str,
        container: Option<&str>,
    ) -> Result<String, BackendError> {
        let mut state = self.state.lock();
        state.take_failure(BackendOp::ReadLogs)?;
        let not_found = || BackendError::NotFound {
            kind: "logs",
            name: unit_name.to_string(),
        };
        let run = state.runs.get(unit_name).ok_or_else(not_found)?;
        let container = match container {
            Some(container) => container.to_string(),
            None if run.spec.sidecar.is_some() => {
                return Err(BackendError::Request(format!(
                    "a container name must be specified for {unit_name}"
                )));
            }
            None => run.spec.container.name.clone(),
        };
        run.logs.get(&container).cloned().ok_or_else(not_found)
    }

    async fn watch_runs(
        &self,
        selector: &LabelSelector,
    ) -> Result<RunEventStream, BackendError> {
        let mut state = self.state.lock();
        state.take_failure(BackendOp::Watch)?;
        state.watch_count += 1;
        let (tx, rx) = mpsc::unbounded();
        state.watchers.push((selector.clone(), tx));
        Ok(rx.boxed())
    }
}
