use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{
    ExecutionBackend, LabelSelector, RunCondition, RunEvent, RunEventKind,
    RunEventStream, RunHandle, RunStatus, RunUnit, VolumeRef,
};
use crate::error::BackendError;
use crate::names::labels_match;
use crate::steps::{
    shell_quote, ContainerSpec, EnvValue, NamedData, ResourceSpec,
    VolumeRequest, VolumeSource,
};

/// A machine size offered by the cloud.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Flavor {
    pub name: String,
    pub vcpus: u32,
    pub ram_mb: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Build,
    Active,
    Shutoff,
    Error,
}

/// An instance as reported by the cloud.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub status: InstanceStatus,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// Exit code of the boot script once the instance powered off.
    pub exit_code: Option<i32>,
    pub fault: Option<String>,
}

/// Volume attached to an instance at launch.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub volume_name: String,
    pub read_only: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub name: String,
    pub flavor: String,
    pub metadata: BTreeMap<String, String>,
    pub volumes: Vec<VolumeAttachment>,
    /// Boot script run once by the instance.
    pub user_data: String,
}

/// Minimal cloud API surface the VM backend needs.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn create_volume(
        &self,
        name: &str,
        size_in_g: u32,
    ) -> Result<(), BackendError>;

    async fn delete_volume(&self, name: &str) -> Result<(), BackendError>;

    /// Launch an instance. Fails with `Capacity` when no host can take it.
    async fn launch_instance(
        &self,
        request: InstanceRequest,
    ) -> Result<Instance, BackendError>;

    async fn delete_instance(&self, name: &str) -> Result<(), BackendError>;

    async fn list_instances(&self) -> Result<Vec<Instance>, BackendError>;

    async fn console_log(&self, name: &str) -> Result<String, BackendError>;
}

/// Runs each step on its own VM, with the step's containers started by the
/// boot script.
pub struct VmBackend<A> {
    api: Arc<A>,
    flavors: Vec<Flavor>,
    poll_interval: Duration,
    configs: Mutex<BTreeMap<String, NamedData>>,
    secrets: Mutex<BTreeMap<String, NamedData>>,
}

impl<A> std::fmt::Debug for VmBackend<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmBackend")
            .field("api", &std::any::type_name::<A>())
            .field("flavors", &self.flavors)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl<A: CloudApi> VmBackend<A> {
    pub fn new(api: Arc<A>, flavors: Vec<Flavor>) -> Self {
        Self {
            api,
            flavors,
            poll_interval: Duration::from_secs(10),
            configs: Mutex::new(BTreeMap::new()),
            secrets: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Smallest flavor with enough cpu and memory.
    pub fn pick_flavor(
        &self,
        cpu: u32,
        memory_in_g: u32,
    ) -> Result<&Flavor, BackendError> {
        let ram_mb = u64::from(memory_in_g) * 1024;
        self.flavors
            .iter()
            .filter(|f| f.vcpus >= cpu && f.ram_mb >= ram_mb)
            .min_by_key(|f| (f.vcpus, f.ram_mb))
            .ok_or_else(|| BackendError::Capacity {
                resource: "flavor".into(),
                message: format!(
                    "no flavor offers {cpu} vcpus and {memory_in_g}G memory"
                ),
            })
    }

    fn named_data(
        &self,
        store: &Mutex<BTreeMap<String, NamedData>>,
        kind: &'static str,
        name: &str,
    ) -> Result<NamedData, BackendError> {
        store.lock().get(name).cloned().ok_or_else(|| {
            BackendError::InvalidSpec(format!("{kind} '{name}' was not created"))
        })
    }

    /// Render the boot script for a run.
    pub fn boot_script(&self, spec: &ResourceSpec) -> Result<String, BackendError> {
        let mut script = String::from("#!/bin/bash\nset -u\n");
        for mount in spec.volumes() {
            let host = host_path(&mount.name);
            script.push_str(&format!("mkdir -p {host}\n"));
            match &mount.source {
                VolumeSource::PersistentClaim { claim_name } => {
                    script.push_str(&format!(
                        "mount -L {} {host}\n",
                        shell_quote(claim_name)
                    ));
                }
                VolumeSource::Config { config_name } => {
                    let data = self.named_data(&self.configs, "config", config_name)?;
                    write_files(&mut script, &host, &data);
                }
                VolumeSource::Secret { secret_name } => {
                    let data = self.named_data(&self.secrets, "secret", secret_name)?;
                    write_files(&mut script, &host, &data);
                }
            }
        }
        let main = docker_run(&spec.container, spec, true)?;
        script.push_str(&section(&spec.container.name, &main, true));
        if let Some(sidecar) = &spec.sidecar {
            let command = docker_run(sidecar, spec, false)?;
            script.push_str(&section(&sidecar.name, &command, false));
        }
        script.push_str("echo \"lando-exit-code: $rc\"\npoweroff\n");
        Ok(script)
    }
}

fn host_path(volume: &str) -> String {
    format!("/mnt/lando/{volume}")
}

fn write_files(script: &mut String, dir: &str, data: &NamedData) {
    for (file, contents) in &data.data {
        script.push_str(&format!(
            "cat > {dir}/{} <<'LANDO_EOF'\n{contents}\nLANDO_EOF\n",
            shell_quote(file)
        ));
    }
}

fn section(container: &str, command: &str, record_exit: bool) -> String {
    let mut out = format!("echo '{}'\n{command}\n", begin_marker(container));
    if record_exit {
        out.push_str("rc=$?\n");
    }
    out.push_str(&format!("echo '{}'\n", end_marker(container)));
    out
}

fn begin_marker(container: &str) -> String {
    format!("--- lando:{container} begin ---")
}

fn end_marker(container: &str) -> String {
    format!("--- lando:{container} end ---")
}

fn docker_run(
    container: &ContainerSpec,
    spec: &ResourceSpec,
    with_limits: bool,
) -> Result<String, BackendError> {
    let mut args = vec!["docker".to_string(), "run".into(), "--rm".into()];
    if with_limits {
        args.push(format!("--cpus={}", spec.cpu));
        args.push(format!("--memory={}g", spec.memory_in_g));
    }
    if let Some(dir) = &container.working_dir {
        args.push("-w".into());
        args.push(dir.clone());
    }
    for mount in &container.mounts {
        let suffix = if mount.read_only { ":ro" } else { "" };
        args.push("-v".into());
        args.push(format!("{}:{}{}", host_path(&mount.name), mount.mount_path, suffix));
    }
    let mut rendered: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();
    for var in &container.env {
        let value = match &var.value {
            EnvValue::Literal(value) => shell_quote(value),
            EnvValue::SecretKey { secret, key } => {
                let mount = container
                    .mounts
                    .iter()
                    .find(|m| {
                        matches!(&m.source, VolumeSource::Secret { secret_name } if secret_name == secret)
                    })
                    .ok_or_else(|| {
                        BackendError::InvalidSpec(format!(
                            "env {} references unmounted secret '{secret}'",
                            var.name
                        ))
                    })?;
                format!("\"$(cat {}/{})\"", host_path(&mount.name), shell_quote(key))
            }
        };
        rendered.push("-e".into());
        rendered.push(format!("{}={}", shell_quote(&var.name), value));
    }
    rendered.push(shell_quote(&container.image));
    rendered.extend(container.command.iter().map(|a| shell_quote(a)));
    Ok(rendered.join(" "))
}

/// Pull one container's section out of a console log.
pub fn console_section(log: &str, container: &str) -> Option<String> {
    let begin = begin_marker(container);
    let end = end_marker(container);
    let start = log.find(&begin)? + begin.len();
    let rest = &log[start..];
    let stop = rest.find(&end).unwrap_or(rest.len());
    Some(rest[..stop].trim_matches('\n').to_string())
}

fn instance_status(instance: &Instance) -> RunStatus {
    let (condition, reason) = match instance.status {
        InstanceStatus::Build => (RunCondition::Pending, None),
        InstanceStatus::Active => (RunCondition::Running, None),
        InstanceStatus::Shutoff => match instance.exit_code {
            Some(0) => (RunCondition::Succeeded, None),
            Some(code) => (
                RunCondition::Failed,
                Some(format!("boot script exited with {code}")),
            ),
            None => (
                RunCondition::Failed,
                Some("instance shut off without an exit code".to_string()),
            ),
        },
        InstanceStatus::Error => (
            RunCondition::Failed,
            Some(instance.fault.clone().unwrap_or_else(|| "instance error".into())),
        ),
    };
    RunStatus {
        name: instance.name.clone(),
        labels: instance.metadata.clone(),
        condition,
        reason,
    }
}

struct PollState<A> {
    api: Arc<A>,
    selector: LabelSelector,
    interval: Duration,
    seen: BTreeMap<String, RunCondition>,
    pending: VecDeque<RunEvent>,
}

impl<A: CloudApi> PollState<A> {
    async fn poll(&mut self) -> Result<(), BackendError> {
        let instances = self.api.list_instances().await?;
        let mut current = BTreeMap::new();
        for instance in instances
            .iter()
            .filter(|i| labels_match(&self.selector, &i.metadata))
        {
            let status = instance_status(instance);
            let kind = match self.seen.get(&status.name) {
                None => Some(RunEventKind::Added),
                Some(prev) if *prev != status.condition => Some(RunEventKind::Modified),
                Some(_) => None,
            };
            current.insert(status.name.clone(), status.condition);
            if let Some(kind) = kind {
                self.pending.push_back(RunEvent { kind, run: status });
            }
        }
        for (name, condition) in &self.seen {
            if !current.contains_key(name) {
                self.pending.push_back(RunEvent {
                    kind: RunEventKind::Deleted,
                    run: RunStatus {
                        name: name.clone(),
                        labels: BTreeMap::new(),
                        condition: *condition,
                        reason: None,
                    },
                });
            }
        }
        self.seen = current;
        Ok(())
    }
}

#[async_trait]
impl<A: CloudApi + 'static> ExecutionBackend for VmBackend<A> {
    fn name(&self) -> &'static str {
        "vm"
    }

    async fn create_persistent_volume(
        &self,
        request: &VolumeRequest,
    ) -> Result<VolumeRef, BackendError> {
        self.api.create_volume(&request.name, request.size_in_g).await?;
        Ok(VolumeRef {
            name: request.name.clone(),
            size_in_g: request.size_in_g,
        })
    }

    async fn delete_persistent_volume(
        &self,
        name: &str,
    ) -> Result<(), BackendError> {
        match self.api.delete_volume(name).await {
            Err(err) if err.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn create_secret(
        &self,
        secret: &NamedData,
    ) -> Result<(), BackendError> {
        let mut secrets = self.secrets.lock();
        if secrets.contains_key(&secret.name) {
            return Err(BackendError::AlreadyExists {
                kind: "secret",
                name: secret.name.clone(),
            });
        }
        secrets.insert(secret.name.clone(), secret.clone());
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), BackendError> {
        self.secrets.lock().remove(name);
        Ok(())
    }

    async fn create_config(
        &self,
        config: &NamedData,
    ) -> Result<(), BackendError> {
        let mut configs = self.configs.lock();
        if configs.contains_key(&config.name) {
            return Err(BackendError::AlreadyExists {
                kind: "config",
                name: config.name.clone(),
            });
        }
        configs.insert(config.name.clone(), config.clone());
        Ok(())
    }

    async fn delete_config(&self, name: &str) -> Result<(), BackendError> {
        self.configs.lock().remove(name);
        Ok(())
    }

    async fn run(
        &self,
        name: &str,
        spec: &ResourceSpec,
        labels: &BTreeMap<String, String>,
    ) -> Result<RunHandle, BackendError> {
        let flavor = self.pick_flavor(spec.cpu, spec.memory_in_g)?;
        let volumes = spec
            .volumes()
            .into_iter()
            .filter_map(|mount| match &mount.source {
                VolumeSource::PersistentClaim { claim_name } => Some(VolumeAttachment {
                    volume_name: claim_name.clone(),
                    read_only: mount.read_only,
                }),
                _ => None,
            })
            .collect();
        let request = InstanceRequest {
            name: name.to_string(),
            flavor: flavor.name.clone(),
            metadata: labels.clone(),
            volumes,
            user_data: self.boot_script(spec)?,
        };
        tracing::debug!(run_name = name, flavor = %request.flavor, "launching instance");
        self.api.launch_instance(request).await?;
        Ok(RunHandle {
            name: name.to_string(),
        })
    }

    async fn delete_run(&self, name: &str) -> Result<(), BackendError> {
        match self.api.delete_instance(name).await {
            Err(err) if err.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn list_runs(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<RunStatus>, BackendError> {
        let instances = self.api.list_instances().await?;
        Ok(instances
            .iter()
            .filter(|i| labels_match(selector, &i.metadata))
            .map(instance_status)
            .collect())
    }

    async fn list_run_units(
        &self,
        run_name: &str,
    ) -> Result<Vec<RunUnit>, BackendError> {
        let instances = self.api.list_instances().await?;
        Ok(instances
            .into_iter()
            .filter(|i| i.name == run_name)
            .map(|i| RunUnit {
                name: i.name,
                created_at: i.created_at,
            })
            .collect())
    }

    async fn read_unit_logs(
        &self,
        unit_name: &str,
        container: Option<&str>,
    ) -> Result<String, BackendError> {
        let log = self.api.console_log(unit_name).await?;
        match container {
            None => Ok(log),
            Some(container) => console_section(&log, container).ok_or_else(|| {
                BackendError::NotFound {
                    kind: "container log",
                    name: format!("{unit_name}/{container}"),
                }
            }),
        }
    }

    async fn watch_runs(
        &self,
        selector: &LabelSelector,
    ) -> Result<RunEventStream, BackendError> {
        let mut state = PollState {
            api: Arc::clone(&self.api),
            selector: selector.clone(),
            interval: self.poll_interval,
            seen: BTreeMap::new(),
            pending: VecDeque::new(),
        };
        // Fail fast when the cloud is unreachable instead of on first poll.
        state.poll().await?;
        let events = stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((Ok(event), Some(state)));
                }
                tokio::time::sleep(state.interval).await;
                if let Err(err) = state.poll().await {
                    return Some((Err(err), None));
                }
            }
        });
        Ok(events.boxed())
    }
}
