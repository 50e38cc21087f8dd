use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::job::{JobId, StepType};

/// Payload carrying only a job id.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_id: JobId,
}

/// Payload reporting a finished step.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StepCompletePayload {
    pub job_id: JobId,
    /// Backend name of the run that finished.
    pub run_reference: String,
}

/// Payload reporting a failed step.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StepErrorPayload {
    pub job_id: JobId,
    pub message: String,
}

/// Commands consumed by the orchestrator.
///
/// On the wire a command is `{"command": "<name>", "payload": {...}}`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
pub enum Command {
    StartJob(JobPayload),
    CancelJob(JobPayload),
    RestartJob(JobPayload),
    StageJobComplete(StepCompletePayload),
    StageJobError(StepErrorPayload),
    RunJobComplete(StepCompletePayload),
    RunJobError(StepErrorPayload),
    OrganizeOutputComplete(StepCompletePayload),
    OrganizeOutputError(StepErrorPayload),
    StoreJobOutputComplete(StepCompletePayload),
    StoreJobOutputError(StepErrorPayload),
}

impl Command {
    pub fn start_job(job_id: JobId) -> Self {
        Command::StartJob(JobPayload { job_id })
    }

    pub fn cancel_job(job_id: JobId) -> Self {
        Command::CancelJob(JobPayload { job_id })
    }

    pub fn restart_job(job_id: JobId) -> Self {
        Command::RestartJob(JobPayload { job_id })
    }

    /// Completion command for a step.
    pub fn step_complete(
        step: StepType,
        job_id: JobId,
        run_reference: impl Into<String>,
    ) -> Self {
        let payload = StepCompletePayload {
            job_id,
            run_reference: run_reference.into(),
        };
        match step {
            StepType::StageData => Command::StageJobComplete(payload),
            StepType::RunWorkflow => Command::RunJobComplete(payload),
            StepType::OrganizeOutput => Command::OrganizeOutputComplete(payload),
            StepType::SaveOutput => Command::StoreJobOutputComplete(payload),
        }
    }

    /// Error command for a step.
    pub fn step_error(
        step: StepType,
        job_id: JobId,
        message: impl Into<String>,
    ) -> Self {
        let payload = StepErrorPayload {
            job_id,
            message: message.into(),
        };
        match step {
            StepType::StageData => Command::StageJobError(payload),
            StepType::RunWorkflow => Command::RunJobError(payload),
            StepType::OrganizeOutput => Command::OrganizeOutputError(payload),
            StepType::SaveOutput => Command::StoreJobOutputError(payload),
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            Command::StartJob(p) | Command::CancelJob(p) | Command::RestartJob(p) => {
                p.job_id
            }
            Command::StageJobComplete(p)
            | Command::RunJobComplete(p)
            | Command::OrganizeOutputComplete(p)
            | Command::StoreJobOutputComplete(p) => p.job_id,
            Command::StageJobError(p)
            | Command::RunJobError(p)
            | Command::OrganizeOutputError(p)
            | Command::StoreJobOutputError(p) => p.job_id,
        }
    }

    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartJob(_) => "start_job",
            Command::CancelJob(_) => "cancel_job",
            Command::RestartJob(_) => "restart_job",
            Command::StageJobComplete(_) => "stage_job_complete",
            Command::StageJobError(_) => "stage_job_error",
            Command::RunJobComplete(_) => "run_job_complete",
            Command::RunJobError(_) => "run_job_error",
            Command::OrganizeOutputComplete(_) => "organize_output_complete",
            Command::OrganizeOutputError(_) => "organize_output_error",
            Command::StoreJobOutputComplete(_) => "store_job_output_complete",
            Command::StoreJobOutputError(_) => "store_job_output_error",
        }
    }

    /// The step a completion or error command refers to.
    pub fn step_type(&self) -> Option<StepType> {
        match self {
            Command::StartJob(_) | Command::CancelJob(_) | Command::RestartJob(_) => None,
            Command::StageJobComplete(_) | Command::StageJobError(_) => {
                Some(StepType::StageData)
            }
            Command::RunJobComplete(_) | Command::RunJobError(_) => {
                Some(StepType::RunWorkflow)
            }
            Command::OrganizeOutputComplete(_) | Command::OrganizeOutputError(_) => {
                Some(StepType::OrganizeOutput)
            }
            Command::StoreJobOutputComplete(_) | Command::StoreJobOutputError(_) => {
                Some(StepType::SaveOutput)
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ChannelError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ChannelError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(job {})", self.name(), self.job_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_command_and_payload() {
        let command = Command::step_complete(StepType::RunWorkflow, JobId(51), "run-workflow-51-jpb");
        let value: serde_json::Value =
            serde_json::from_slice(&command.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "command": "run_job_complete",
                "payload": { "job_id": 51, "run_reference": "run-workflow-51-jpb" }
            })
        );
    }

    #[test]
    fn decodes_error_commands() {
        let raw = br#"{"command":"stage_job_error","payload":{"job_id":3,"message":"boom"}}"#;
        let command = Command::decode(raw).unwrap();
        assert_eq!(command, Command::step_error(StepType::StageData, JobId(3), "boom"));
        assert_eq!(command.step_type(), Some(StepType::StageData));
        assert_eq!(command.name(), "stage_job_error");
    }

    #[test]
    fn unknown_commands_fail_to_decode() {
        let raw = br#"{"command":"launch_rockets","payload":{"job_id":3}}"#;
        assert!(matches!(Command::decode(raw), Err(ChannelError::Codec(_))));
    }

    #[test]
    fn names_match_serde_tags() {
        for command in [
            Command::start_job(JobId(1)),
            Command::cancel_job(JobId(1)),
            Command::restart_job(JobId(1)),
            Command::step_complete(StepType::SaveOutput, JobId(1), "x"),
            Command::step_error(StepType::OrganizeOutput, JobId(1), "x"),
        ] {
            let value = serde_json::to_value(&command).unwrap();
            assert_eq!(value["command"], command.name());
        }
    }
}
