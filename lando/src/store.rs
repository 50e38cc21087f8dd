use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::job::{Job, JobId, JobState, JobStep};

/// A remote file the stage data step downloads into job-data.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Content identifier in the remote data store.
    pub file_id: String,
    /// Destination relative to the job-data root.
    pub destination_path: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct InputFiles {
    pub remote_files: Vec<RemoteFile>,
}

/// Where results are uploaded and who they are shared with.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ShareTargets {
    pub destination_project_name: String,
    pub share_user_ids: Vec<String>,
}

/// Data store credential material for one job.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobCredentials {
    pub url: String,
    pub agent_key: String,
    pub user_key: String,
}

impl std::fmt::Debug for JobCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCredentials")
            .field("url", &self.url)
            .field("agent_key", &"<redacted>")
            .field("user_key", &"<redacted>")
            .finish()
    }
}

/// Result location reported by the save output step.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OutputLocation {
    pub project_id: String,
    pub readme_file_id: String,
}

/// Classification of a job-level failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// The step ran and the backend reported it failed.
    StepFailed,
    /// The backend refused to provision for lack of capacity.
    InsufficientCapacity,
    /// Any other failure while provisioning or tearing down.
    Provisioning,
    /// The save output results manifest could not be read back.
    OutputUnreadable,
}

impl JobErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobErrorKind::StepFailed => "step_failed",
            JobErrorKind::InsufficientCapacity => "insufficient_capacity",
            JobErrorKind::Provisioning => "provisioning",
            JobErrorKind::OutputUnreadable => "output_unreadable",
        }
    }
}

impl Display for JobErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error persisted against a job.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub step: JobStep,
    pub kind: JobErrorKind,
    pub message: String,
}

/// External system of record for jobs.
///
/// The orchestrator keeps no job state of its own: every handler reads the
/// job fresh from here and writes transitions back.
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    async fn get_job(&self, job_id: JobId) -> Result<Job, StoreError>;

    async fn set_job_state(
        &self,
        job_id: JobId,
        state: JobState,
    ) -> Result<(), StoreError>;

    async fn set_job_step(
        &self,
        job_id: JobId,
        step: JobStep,
    ) -> Result<(), StoreError>;

    async fn save_error(
        &self,
        job_id: JobId,
        error: JobError,
    ) -> Result<(), StoreError>;

    async fn save_output_location(
        &self,
        job_id: JobId,
        location: OutputLocation,
    ) -> Result<(), StoreError>;

    async fn get_input_files(
        &self,
        job_id: JobId,
    ) -> Result<InputFiles, StoreError>;

    async fn get_share_targets(
        &self,
        job_id: JobId,
    ) -> Result<ShareTargets, StoreError>;

    async fn get_credentials(
        &self,
        job_id: JobId,
    ) -> Result<JobCredentials, StoreError>;

    /// Rendered methods document describing how the workflow was run.
    async fn get_methods_document(
        &self,
        job_id: JobId,
    ) -> Result<String, StoreError>;
}

#[async_trait]
impl<T: JobRecordStore + ?Sized> JobRecordStore for Arc<T> {
    async fn get_job(&self, job_id: JobId) -> Result<Job, StoreError> {
        (**self).get_job(job_id).await
    }

    async fn set_job_state(
        &self,
        job_id: JobId,
        state: JobState,
    ) -> Result<(), StoreError> {
        (**self).set_job_state(job_id, state).await
    }

    async fn set_job_step(
        &self,
        job_id: JobId,
        step: JobStep,
    ) -> Result<(), StoreError> {
        (**self).set_job_step(job_id, step).await
    }

    async fn save_error(
        &self,
        job_id: JobId,
        error: JobError,
    ) -> Result<(), StoreError> {
        (**self).save_error(job_id, error).await
    }

    async fn save_output_location(
        &self,
        job_id: JobId,
        location: OutputLocation,
    ) -> Result<(), StoreError> {
        (**self).save_output_location(job_id, location).await
    }

    async fn get_input_files(
        &self,
        job_id: JobId,
    ) -> Result<InputFiles, StoreError> {
        (**self).get_input_files(job_id).await
    }

    async fn get_share_targets(
        &self,
        job_id: JobId,
    ) -> Result<ShareTargets, StoreError> {
        (**self).get_share_targets(job_id).await
    }

    async fn get_credentials(
        &self,
        job_id: JobId,
    ) -> Result<JobCredentials, StoreError> {
        (**self).get_credentials(job_id).await
    }

    async fn get_methods_document(
        &self,
        job_id: JobId,
    ) -> Result<String, StoreError> {
        (**self).get_methods_document(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = JobCredentials {
            url: "https://api.dataservice.duke.edu/api/v1".into(),
            agent_key: "agent-secret".into(),
            user_key: "user-secret".into(),
        };
        let debug = format!("{creds:?}");
        assert!(debug.contains("dataservice"));
        assert!(!debug.contains("agent-secret"));
        assert!(!debug.contains("user-secret"));
    }
}
