//! Declarative definitions of the four pipeline steps.
//!
//! Building a [`StepPlan`] is pure: it reads the job, static config and
//! record-store data handed in by the orchestrator and never talks to a
//! backend. Backends translate the plan into their own objects.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::LandoConfig;
use crate::job::{Job, StepType, Workflow, WorkflowType};
use crate::names::{
    ResourceNames, VolumePurpose, CONFIG_DIR, CREDENTIALS_DIR,
    JOB_DATA_ROOT, JOB_ORDER_PATH, OUTPUT_DATA_ROOT, RESULTS_DIR,
    RESULTS_MANIFEST_PATH, TMPOUT_ROOT, WORKFLOW_DIR, WORKFLOW_STDERR_PATH,
    WORKFLOW_STDOUT_PATH,
};
use crate::store::{
    InputFiles, JobCredentials, OutputLocation, ShareTargets,
};

/// Container name of the save output results sidecar.
pub const RESULTS_CONTAINER: &str = "results";

/// Name of the container running `step` itself; its log is the step's output.
pub fn main_container(step: StepType) -> String {
    step.as_str().replace('_', "-")
}

/// Value of an environment variable.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvValue {
    Literal(String),
    /// Reference to a key of a secret; never the secret value itself.
    SecretKey { secret: String, key: String },
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: EnvValue,
}

impl EnvVar {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: EnvValue::Literal(value.into()),
        }
    }

    pub fn secret_key(
        name: impl Into<String>,
        secret: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: EnvValue::SecretKey {
                secret: secret.into(),
                key: key.into(),
            },
        }
    }
}

/// What backs a mounted volume.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeSource {
    PersistentClaim { claim_name: String },
    Secret { secret_name: String },
    Config { config_name: String },
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Volume name local to the run.
    pub name: String,
    pub source: VolumeSource,
    pub mount_path: String,
    pub read_only: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<EnvVar>,
    pub working_dir: Option<String>,
    pub mounts: Vec<VolumeMount>,
}

/// Declarative description of one backend run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub step_type: StepType,
    pub container: ContainerSpec,
    /// Companion container running alongside the main one.
    pub sidecar: Option<ContainerSpec>,
    pub cpu: u32,
    pub memory_in_g: u32,
}

impl ResourceSpec {
    /// Every mount of the main container and sidecar, deduplicated by name.
    pub fn volumes(&self) -> Vec<&VolumeMount> {
        let mut seen = BTreeMap::new();
        for mount in self
            .container
            .mounts
            .iter()
            .chain(self.sidecar.iter().flat_map(|s| s.mounts.iter()))
        {
            seen.entry(mount.name.as_str()).or_insert(mount);
        }
        seen.into_values().collect()
    }
}

/// A persistent volume a step needs before it can run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub name: String,
    pub size_in_g: u32,
    pub storage_class: Option<String>,
}

/// A named key/value document (config or secret).
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct NamedData {
    pub name: String,
    pub data: BTreeMap<String, String>,
}

impl std::fmt::Debug for NamedData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedData")
            .field("name", &self.name)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Everything needed to launch one step of one job.
#[derive(Clone, Debug)]
pub struct StepPlan {
    pub step_type: StepType,
    pub run_name: String,
    pub labels: BTreeMap<String, String>,
    pub volumes: Vec<VolumeRequest>,
    pub configs: Vec<NamedData>,
    pub secrets: Vec<NamedData>,
    pub spec: ResourceSpec,
}

/// Resources to remove from a backend.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Teardown {
    pub runs: Vec<String>,
    pub configs: Vec<String>,
    pub secrets: Vec<String>,
    pub volumes: Vec<String>,
}

impl Teardown {
    fn extend(&mut self, other: Teardown) {
        self.runs.extend(other.runs);
        self.configs.extend(other.configs);
        self.secrets.extend(other.secrets);
        self.volumes.extend(other.volumes);
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
            && self.configs.is_empty()
            && self.secrets.is_empty()
            && self.volumes.is_empty()
    }
}

fn has_config(step: StepType) -> bool {
    !matches!(step, StepType::RunWorkflow)
}

fn has_secret(step: StepType) -> bool {
    matches!(step, StepType::StageData | StepType::SaveOutput)
}

/// Run, config and secret belonging to a step. Volumes are excluded.
pub fn step_resources(names: &ResourceNames, step: StepType) -> Teardown {
    Teardown {
        runs: vec![names.run(step)],
        configs: has_config(step)
            .then(|| names.config(step))
            .into_iter()
            .collect(),
        secrets: has_secret(step)
            .then(|| names.secret(step))
            .into_iter()
            .collect(),
        volumes: Vec::new(),
    }
}

/// What to delete once `step` completed successfully.
pub fn exit_teardown(names: &ResourceNames, step: StepType) -> Teardown {
    let mut teardown = step_resources(names, step);
    if step == StepType::RunWorkflow {
        teardown.volumes.push(names.volume(VolumePurpose::Tmpout));
    }
    teardown
}

/// Every resource a job can own.
pub fn cleanup_all(names: &ResourceNames) -> Teardown {
    let mut teardown = Teardown::default();
    for step in StepType::ALL {
        teardown.extend(step_resources(names, step));
    }
    teardown.volumes = VolumePurpose::ALL
        .into_iter()
        .map(|purpose| names.volume(purpose))
        .collect();
    teardown
}

/// Kind of a stage data item.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum StageItemKind {
    #[serde(rename = "url")]
    Url,
    #[serde(rename = "write")]
    Write,
    #[serde(rename = "DukeDS")]
    DukeDs,
}

/// One thing the stage data step puts into job-data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageItem {
    #[serde(rename = "type")]
    pub kind: StageItemKind,
    pub source: serde_json::Value,
    pub dest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unzip_to: Option<String>,
}

/// Path the workflow file is downloaded to.
pub fn workflow_download_path(workflow: &Workflow) -> String {
    format!("{}/{}", WORKFLOW_DIR, workflow.download_file_name())
}

/// Argument handed to the workflow engine to select the workflow.
pub fn workflow_target(workflow: &Workflow) -> String {
    match &workflow.workflow_type {
        WorkflowType::Packed => {
            format!("{}#main", workflow_download_path(workflow))
        }
        WorkflowType::Zipped { workflow_path } => {
            format!(
                "{}/{}",
                WORKFLOW_DIR,
                workflow_path.trim_start_matches('/')
            )
        }
    }
}

/// Items the stage data step fetches or writes, in order.
pub fn stage_data_items(
    workflow: &Workflow,
    input_files: &InputFiles,
) -> Vec<StageItem> {
    let unzip_to = match workflow.workflow_type {
        WorkflowType::Zipped { .. } => Some(WORKFLOW_DIR.to_string()),
        WorkflowType::Packed => None,
    };
    let mut items = vec![
        StageItem {
            kind: StageItemKind::Url,
            source: serde_json::Value::String(workflow.url.clone()),
            dest: workflow_download_path(workflow),
            unzip_to,
        },
        StageItem {
            kind: StageItemKind::Write,
            source: workflow.job_order.clone(),
            dest: JOB_ORDER_PATH.to_string(),
            unzip_to: None,
        },
    ];
    items.extend(input_files.remote_files.iter().map(|file| StageItem {
        kind: StageItemKind::DukeDs,
        source: serde_json::Value::String(file.file_id.clone()),
        dest: format!(
            "{}/{}",
            JOB_DATA_ROOT,
            file.destination_path.trim_start_matches('/')
        ),
        unzip_to: None,
    }));
    items
}

/// Parse the results manifest printed by the save output sidecar.
pub fn parse_results_manifest(
    raw: &str,
) -> Result<OutputLocation, serde_json::Error> {
    serde_json::from_str(raw.trim())
}

/// Quote `arg` for a POSIX shell when it contains special characters.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | '@' | '%' | '+' | ',' | '#')
        });
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Builds step plans for one job.
#[derive(Debug)]
pub struct StepBuilder<'a> {
    config: &'a LandoConfig,
    job: &'a Job,
    names: ResourceNames,
}

impl<'a> StepBuilder<'a> {
    pub fn new(config: &'a LandoConfig, job: &'a Job) -> Self {
        Self {
            config,
            job,
            names: ResourceNames::new(job.id, &job.username),
        }
    }

    pub fn names(&self) -> &ResourceNames {
        &self.names
    }

    fn volume_request(&self, purpose: VolumePurpose) -> VolumeRequest {
        let storage = &self.config.storage;
        let requests = &self.job.resource_requests;
        let size_in_g = match purpose {
            VolumePurpose::JobData => requests
                .job_data_size_in_g
                .unwrap_or(storage.job_data_size_in_g),
            VolumePurpose::OutputData => requests
                .output_data_size_in_g
                .unwrap_or(storage.output_data_size_in_g),
            VolumePurpose::Tmpout => storage.tmpout_size_in_g,
        };
        VolumeRequest {
            name: self.names.volume(purpose),
            size_in_g,
            storage_class: storage.storage_class.clone(),
        }
    }

    fn claim_mount(
        &self,
        purpose: VolumePurpose,
        mount_path: &str,
        read_only: bool,
    ) -> VolumeMount {
        VolumeMount {
            name: purpose.as_str().to_string(),
            source: VolumeSource::PersistentClaim {
                claim_name: self.names.volume(purpose),
            },
            mount_path: mount_path.to_string(),
            read_only,
        }
    }

    fn config_mount(&self, step: StepType) -> VolumeMount {
        VolumeMount {
            name: "config".into(),
            source: VolumeSource::Config {
                config_name: self.names.config(step),
            },
            mount_path: CONFIG_DIR.into(),
            read_only: true,
        }
    }

    fn credentials_mount(&self, step: StepType) -> VolumeMount {
        VolumeMount {
            name: "credentials".into(),
            source: VolumeSource::Secret {
                secret_name: self.names.secret(step),
            },
            mount_path: CREDENTIALS_DIR.into(),
            read_only: true,
        }
    }

    fn credentials_secret(
        &self,
        step: StepType,
        credentials: &JobCredentials,
    ) -> Result<NamedData, serde_yaml::Error> {
        let document = serde_yaml::to_string(credentials)?;
        Ok(NamedData {
            name: self.names.secret(step),
            data: BTreeMap::from([(
                self.config.data_store.credentials_key.clone(),
                document,
            )]),
        })
    }

    fn credentials_env(&self) -> EnvVar {
        EnvVar::literal(
            self.config.data_store.credentials_env.clone(),
            format!(
                "{}/{}",
                CREDENTIALS_DIR, self.config.data_store.credentials_key
            ),
        )
    }

    fn config_document(
        &self,
        step: StepType,
        file_name: &str,
        document: &serde_json::Value,
    ) -> Result<NamedData, serde_json::Error> {
        Ok(NamedData {
            name: self.names.config(step),
            data: BTreeMap::from([(
                file_name.to_string(),
                serde_json::to_string_pretty(document)?,
            )]),
        })
    }

    fn plan(
        &self,
        spec: ResourceSpec,
        volumes: Vec<VolumeRequest>,
        configs: Vec<NamedData>,
        secrets: Vec<NamedData>,
    ) -> StepPlan {
        let step = spec.step_type;
        StepPlan {
            step_type: step,
            run_name: self.names.run(step),
            labels: self.names.labels(step),
            volumes,
            configs,
            secrets,
            spec,
        }
    }

    /// Download the workflow, write the job order and fetch input files.
    pub fn stage_data(
        &self,
        input_files: &InputFiles,
        credentials: &JobCredentials,
    ) -> Result<StepPlan, StepBuildError> {
        let step = StepType::StageData;
        let settings = &self.config.stage_data;
        let items = stage_data_items(&self.job.workflow, input_files);
        let document = serde_json::json!({ "items": items });
        let file_name = "stagedata.json";

        let mut command = settings.command.clone();
        command.push(format!("{CONFIG_DIR}/{file_name}"));

        let spec = ResourceSpec {
            step_type: step,
            container: ContainerSpec {
                name: main_container(step),
                image: settings.image.clone(),
                command,
                env: vec![self.credentials_env()],
                working_dir: Some(JOB_DATA_ROOT.into()),
                mounts: vec![
                    self.claim_mount(VolumePurpose::JobData, JOB_DATA_ROOT, false),
                    self.config_mount(step),
                    self.credentials_mount(step),
                ],
            },
            sidecar: None,
            cpu: settings.cpu,
            memory_in_g: settings.memory_in_g,
        };
        Ok(self.plan(
            spec,
            vec![self.volume_request(VolumePurpose::JobData)],
            vec![self.config_document(step, file_name, &document)?],
            vec![self.credentials_secret(step, credentials)?],
        ))
    }

    /// Run the job's workflow engine over the staged data.
    pub fn run_workflow(&self) -> StepPlan {
        let step = StepType::RunWorkflow;
        let defaults = &self.config.run_workflow;
        let requests = &self.job.resource_requests;
        let cpu = requests.cpu.unwrap_or(defaults.cpu);
        let memory_in_g = requests.memory_in_g.unwrap_or(defaults.memory_in_g);

        let mut args = self.job.run_settings.base_command.clone();
        args.extend([
            "--tmp-outdir-prefix".to_string(),
            format!("{TMPOUT_ROOT}/"),
            "--outdir".to_string(),
            format!("{RESULTS_DIR}/"),
            "--max-ram".to_string(),
            format!("{memory_in_g}G"),
            "--max-cores".to_string(),
            cpu.to_string(),
            workflow_target(&self.job.workflow),
            JOB_ORDER_PATH.to_string(),
        ]);
        let script = format!(
            "{} > {} 2> {}",
            args.iter()
                .map(|arg| shell_quote(arg))
                .collect::<Vec<_>>()
                .join(" "),
            WORKFLOW_STDOUT_PATH,
            WORKFLOW_STDERR_PATH
        );

        let mut mounts = vec![
            self.claim_mount(VolumePurpose::JobData, JOB_DATA_ROOT, true),
            self.claim_mount(VolumePurpose::OutputData, OUTPUT_DATA_ROOT, false),
            self.claim_mount(VolumePurpose::Tmpout, TMPOUT_ROOT, false),
        ];
        if let Some(system) = &defaults.system_data_volume {
            mounts.push(VolumeMount {
                name: "system-data".into(),
                source: VolumeSource::PersistentClaim {
                    claim_name: system.volume_claim_name.clone(),
                },
                mount_path: system.mount_path.clone(),
                read_only: true,
            });
        }

        let spec = ResourceSpec {
            step_type: step,
            container: ContainerSpec {
                name: main_container(step),
                image: self.job.run_settings.image.clone(),
                command: vec!["sh".into(), "-c".into(), script],
                env: Vec::new(),
                working_dir: Some(OUTPUT_DATA_ROOT.into()),
                mounts,
            },
            sidecar: None,
            cpu,
            memory_in_g,
        };
        self.plan(
            spec,
            vec![
                self.volume_request(VolumePurpose::OutputData),
                self.volume_request(VolumePurpose::Tmpout),
            ],
            Vec::new(),
            Vec::new(),
        )
    }

    /// Arrange results, logs and the methods document for upload.
    pub fn organize_output(
        &self,
        methods_document: &str,
    ) -> Result<StepPlan, StepBuildError> {
        let step = StepType::OrganizeOutput;
        let settings = &self.config.organize_output;
        let file_name = "organizeoutput.json";
        let document = serde_json::json!({
            "destination_dir": OUTPUT_DATA_ROOT,
            "results_dir": RESULTS_DIR,
            "workflow_path": workflow_download_path(&self.job.workflow),
            "job_order_path": JOB_ORDER_PATH,
            "bespin_workflow_stdout_path": WORKFLOW_STDOUT_PATH,
            "bespin_workflow_stderr_path": WORKFLOW_STDERR_PATH,
            "methods_document_content": methods_document,
        });

        let mut command = settings.command.clone();
        command.push(format!("{CONFIG_DIR}/{file_name}"));

        let spec = ResourceSpec {
            step_type: step,
            container: ContainerSpec {
                name: main_container(step),
                image: settings.image.clone(),
                command,
                env: Vec::new(),
                working_dir: Some(OUTPUT_DATA_ROOT.into()),
                mounts: vec![
                    self.claim_mount(VolumePurpose::JobData, JOB_DATA_ROOT, true),
                    self.claim_mount(
                        VolumePurpose::OutputData,
                        OUTPUT_DATA_ROOT,
                        false,
                    ),
                    self.config_mount(step),
                ],
            },
            sidecar: None,
            cpu: settings.cpu,
            memory_in_g: settings.memory_in_g,
        };
        Ok(self.plan(
            spec,
            Vec::new(),
            vec![self.config_document(step, file_name, &document)?],
            Vec::new(),
        ))
    }

    /// Upload output-data to the data store and share it.
    ///
    /// The results sidecar blocks until the upload wrote its manifest and
    /// prints it, so the orchestrator can read it back from the sidecar log.
    pub fn save_output(
        &self,
        share_targets: &ShareTargets,
        credentials: &JobCredentials,
    ) -> Result<StepPlan, StepBuildError> {
        let step = StepType::SaveOutput;
        let settings = &self.config.save_output;
        let file_name = "saveoutput.json";
        let document = serde_json::json!({
            "destination": share_targets.destination_project_name,
            "paths": [OUTPUT_DATA_ROOT],
            "share": { "dds_user_ids": share_targets.share_user_ids },
            "activity": {
                "name": format!("{} - Bespin Job {}", self.job.name, self.job.id),
                "description": format!(
                    "Bespin Job {} - Workflow {}",
                    self.job.id, self.job.workflow.url
                ),
                "started_on": self.job.created.to_rfc3339(),
            },
            "results_manifest_path": RESULTS_MANIFEST_PATH,
        });

        let mut command = settings.step.command.clone();
        command.push(format!("{CONFIG_DIR}/{file_name}"));

        let output_mount = |read_only| {
            self.claim_mount(VolumePurpose::OutputData, OUTPUT_DATA_ROOT, read_only)
        };
        let wait_script = format!(
            "while [ ! -f {path} ]; do sleep 5; done; cat {path}",
            path = RESULTS_MANIFEST_PATH
        );

        let spec = ResourceSpec {
            step_type: step,
            container: ContainerSpec {
                name: main_container(step),
                image: settings.step.image.clone(),
                command,
                env: vec![self.credentials_env()],
                working_dir: Some(OUTPUT_DATA_ROOT.into()),
                mounts: vec![
                    output_mount(false),
                    self.config_mount(step),
                    self.credentials_mount(step),
                ],
            },
            sidecar: Some(ContainerSpec {
                name: RESULTS_CONTAINER.into(),
                image: settings.results_image.clone(),
                command: vec!["sh".into(), "-c".into(), wait_script],
                env: Vec::new(),
                working_dir: None,
                mounts: vec![output_mount(true)],
            }),
            cpu: settings.step.cpu,
            memory_in_g: settings.step.memory_in_g,
        };
        Ok(self.plan(
            spec,
            Vec::new(),
            vec![self.config_document(step, file_name, &document)?],
            vec![self.credentials_secret(step, credentials)?],
        ))
    }
}

/// Failure to render a step's config or secret documents.
#[derive(Debug, thiserror::Error)]
pub enum StepBuildError {
    #[error("failed to render config document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to render credentials document: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, JobState, JobStep, RunSettings, ResourceRequests};
    use crate::store::RemoteFile;
    use chrono::Utc;

    fn config() -> LandoConfig {
        LandoConfig::from_yaml_str(
            r#"
queue: { name: lando }
stage_data: { image: stage:1, command: [stage] }
organize_output: { image: organize:1, command: [organize] }
save_output: { image: save:1, command: [save], results_image: busybox }
"#,
        )
        .unwrap()
    }

    fn job(url: &str, job_order: serde_json::Value) -> Job {
        Job {
            id: JobId(51),
            name: "exome".into(),
            username: "jpb".into(),
            created: Utc::now(),
            state: JobState::Running,
            step: JobStep::Staging,
            workflow: Workflow {
                url: url.into(),
                workflow_type: WorkflowType::Packed,
                job_order,
            },
            run_settings: RunSettings {
                image: "calrissian:0.1".into(),
                base_command: vec!["cwltool".into(), "--no-container".into()],
            },
            resource_requests: ResourceRequests::default(),
        }
    }

    fn credentials() -> JobCredentials {
        JobCredentials {
            url: "https://dds".into(),
            agent_key: "agent".into(),
            user_key: "user".into(),
        }
    }

    #[test]
    fn stage_items_match_expected_document() {
        let job = job("someurl", serde_json::json!({"threads": 2}));
        let input_files = InputFiles {
            remote_files: vec![RemoteFile {
                file_id: "myid".into(),
                destination_path: "file1.txt".into(),
            }],
        };
        let items = stage_data_items(&job.workflow, &input_files);
        assert_eq!(
            serde_json::to_value(&items).unwrap(),
            serde_json::json!([
                {"type": "url", "source": "someurl", "dest": "/bespin/job-data/workflow/someurl"},
                {"type": "write", "source": {"threads": 2}, "dest": "/bespin/job-data/job-order.json"},
                {"type": "DukeDS", "source": "myid", "dest": "/bespin/job-data/file1.txt"},
            ])
        );
    }

    #[test]
    fn zipped_workflows_are_unzipped_and_targeted_by_path() {
        let mut job = job("https://host/exome.zip", serde_json::json!({}));
        job.workflow.workflow_type = WorkflowType::Zipped {
            workflow_path: "exome/main.cwl".into(),
        };
        let items = stage_data_items(&job.workflow, &InputFiles::default());
        assert_eq!(items[0].unzip_to.as_deref(), Some(WORKFLOW_DIR));
        assert_eq!(
            workflow_target(&job.workflow),
            "/bespin/job-data/workflow/exome/main.cwl"
        );
    }

    #[test]
    fn stage_data_plan_declares_job_data_volume() {
        let config = config();
        let job = job("someurl", serde_json::json!({}));
        let plan = StepBuilder::new(&config, &job)
            .stage_data(&InputFiles::default(), &credentials())
            .unwrap();
        assert_eq!(plan.run_name, "stage-data-51-jpb");
        assert_eq!(plan.volumes.len(), 1);
        assert_eq!(plan.volumes[0].name, "job-data-51-jpb");
        assert_eq!(plan.volumes[0].size_in_g, 10);
        assert_eq!(
            plan.spec.container.command,
            vec!["stage", "/bespin/config/stagedata.json"]
        );
        let secret = &plan.secrets[0];
        assert_eq!(secret.name, "stage-data-credentials-51-jpb");
        assert!(secret.data["config"].contains("agent_key: agent"));
        assert!(plan
            .spec
            .container
            .env
            .iter()
            .all(|env| !matches!(&env.value, EnvValue::Literal(v) if v.contains("agent"))));
    }

    #[test]
    fn run_workflow_applies_overrides_and_redirects_output() {
        let config = config();
        let mut job = job("https://host/exome.cwl", serde_json::json!({}));
        job.resource_requests.cpu = Some(8);
        job.resource_requests.memory_in_g = Some(32);
        let plan = StepBuilder::new(&config, &job).run_workflow();
        assert_eq!(plan.spec.cpu, 8);
        assert_eq!(plan.spec.memory_in_g, 32);
        let script = &plan.spec.container.command[2];
        assert!(script.starts_with("cwltool --no-container"));
        assert!(script.contains("--max-ram 32G --max-cores 8"));
        assert!(script.contains("/bespin/job-data/workflow/exome.cwl#main"));
        assert!(script.ends_with(&format!(
            "> {WORKFLOW_STDOUT_PATH} 2> {WORKFLOW_STDERR_PATH}"
        )));
        let job_data = plan
            .spec
            .container
            .mounts
            .iter()
            .find(|m| m.name == "job-data")
            .unwrap();
        assert!(job_data.read_only);
        let names: Vec<_> = plan.volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["output-data-51-jpb", "tmpout-51-jpb"]);
    }

    #[test]
    fn save_output_has_results_sidecar() {
        let config = config();
        let job = job("someurl", serde_json::json!({}));
        let plan = StepBuilder::new(&config, &job)
            .save_output(&ShareTargets::default(), &credentials())
            .unwrap();
        let sidecar = plan.spec.sidecar.as_ref().unwrap();
        assert_eq!(sidecar.name, RESULTS_CONTAINER);
        assert_eq!(plan.spec.container.name, "save-output");
        assert_eq!(plan.spec.container.name, main_container(StepType::SaveOutput));
        assert!(sidecar.command[2].contains(RESULTS_MANIFEST_PATH));
        assert_eq!(plan.spec.volumes().len(), 3);
    }

    #[test]
    fn teardown_sets() {
        let names = ResourceNames::new(JobId(51), "jpb");
        let exit = exit_teardown(&names, StepType::RunWorkflow);
        assert_eq!(exit.runs, ["run-workflow-51-jpb"]);
        assert!(exit.configs.is_empty());
        assert_eq!(exit.volumes, ["tmpout-51-jpb"]);

        let all = cleanup_all(&names);
        assert_eq!(all.runs.len(), 4);
        assert_eq!(all.configs.len(), 3);
        assert_eq!(all.secrets.len(), 2);
        assert_eq!(all.volumes.len(), 3);
    }

    #[test]
    fn shell_quoting() {
        assert_eq!(shell_quote("--outdir"), "--outdir");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn manifest_parses_into_output_location() {
        let location = parse_results_manifest(
            "{\"project_id\": \"p1\", \"readme_file_id\": \"r1\"}\n",
        )
        .unwrap();
        assert_eq!(location.project_id, "p1");
        assert_eq!(location.readme_file_id, "r1");
    }
}
