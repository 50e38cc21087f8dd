use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a job in the record store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Coarse lifecycle of a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    New,
    Authorized,
    Running,
    Finished,
    Errored,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "new",
            JobState::Authorized => "authorized",
            JobState::Running => "running",
            JobState::Finished => "finished",
            JobState::Errored => "errored",
            JobState::Canceled => "canceled",
        }
    }

    /// States from which `start_job` may launch a job.
    pub fn is_startable(&self) -> bool {
        matches!(self, JobState::New | JobState::Authorized)
    }

    /// States from which `restart_job` may resume a job.
    pub fn is_restartable(&self) -> bool {
        matches!(self, JobState::Errored | JobState::Canceled)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine grained position of a running job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStep {
    None,
    CreateResources,
    Staging,
    RunningWorkflow,
    OrganizeOutput,
    StoringOutput,
    RecordOutput,
    Terminate,
}

impl JobStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStep::None => "none",
            JobStep::CreateResources => "create_resources",
            JobStep::Staging => "staging",
            JobStep::RunningWorkflow => "running_workflow",
            JobStep::OrganizeOutput => "organize_output",
            JobStep::StoringOutput => "storing_output",
            JobStep::RecordOutput => "record_output",
            JobStep::Terminate => "terminate",
        }
    }

    /// The backend step type that runs while the job sits at this step.
    pub fn step_type(&self) -> Option<StepType> {
        match self {
            JobStep::Staging => Some(StepType::StageData),
            JobStep::RunningWorkflow => Some(StepType::RunWorkflow),
            JobStep::OrganizeOutput => Some(StepType::OrganizeOutput),
            JobStep::StoringOutput => Some(StepType::SaveOutput),
            _ => None,
        }
    }
}

impl Display for JobStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job's recorded (state, step) pair.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobPosition {
    pub state: JobState,
    pub step: JobStep,
}

impl JobPosition {
    pub fn new(state: JobState, step: JobStep) -> Self {
        Self { state, step }
    }
}

impl Display for JobPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.state, self.step)
    }
}

/// The four kinds of backend run a job goes through.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    StageData,
    RunWorkflow,
    OrganizeOutput,
    SaveOutput,
}

impl StepType {
    pub const ALL: [StepType; 4] = [
        StepType::StageData,
        StepType::RunWorkflow,
        StepType::OrganizeOutput,
        StepType::SaveOutput,
    ];

    /// Value used for the step-type label on backend resources.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::StageData => "stage_data",
            StepType::RunWorkflow => "run_workflow",
            StepType::OrganizeOutput => "organize_output",
            StepType::SaveOutput => "save_output",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        StepType::ALL.into_iter().find(|step| step.as_str() == value)
    }

    /// The job step recorded while a run of this type is active.
    pub fn job_step(&self) -> JobStep {
        match self {
            StepType::StageData => JobStep::Staging,
            StepType::RunWorkflow => JobStep::RunningWorkflow,
            StepType::OrganizeOutput => JobStep::OrganizeOutput,
            StepType::SaveOutput => JobStep::StoringOutput,
        }
    }
}

impl Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a workflow is packaged at its download URL.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowType {
    /// A single packed CWL document whose entry point is `#main`.
    Packed,
    /// A zip archive; `workflow_path` is the workflow file inside it.
    Zipped { workflow_path: String },
}

/// Immutable workflow definition attached to a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workflow {
    pub url: String,
    pub workflow_type: WorkflowType,
    /// Job order (workflow parameters) document.
    pub job_order: serde_json::Value,
}

impl Workflow {
    /// File name the workflow is downloaded to, taken from the last URL segment.
    pub fn download_file_name(&self) -> &str {
        let trimmed = self.url.trim_end_matches('/');
        match trimmed.rsplit('/').next() {
            Some(name) if !name.is_empty() => name,
            _ => "workflow",
        }
    }
}

/// Job specific settings for the run-workflow step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSettings {
    pub image: String,
    /// Workflow engine invocation, e.g. `["cwltool", "--no-container"]`.
    pub base_command: Vec<String>,
}

/// Job specific overrides of the static resource defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceRequests {
    pub cpu: Option<u32>,
    pub memory_in_g: Option<u32>,
    pub job_data_size_in_g: Option<u32>,
    pub output_data_size_in_g: Option<u32>,
}

/// A job as held by the job record store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub username: String,
    pub created: DateTime<Utc>,
    pub state: JobState,
    pub step: JobStep,
    pub workflow: Workflow,
    pub run_settings: RunSettings,
    #[serde(default)]
    pub resource_requests: ResourceRequests,
}

impl Job {
    pub fn position(&self) -> JobPosition {
        JobPosition::new(self.state, self.step)
    }

    /// True when the job is running at `step`.
    pub fn is_running_at(&self, step: JobStep) -> bool {
        self.state == JobState::Running && self.step == step
    }
}
