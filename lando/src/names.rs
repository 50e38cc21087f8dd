//! Deterministic names, paths and labels for a job's backend resources.
//!
//! Every resource a job owns is named `{purpose}-{job_id}-{username}`, so
//! cleanup and restart can rebuild the full set from the job record alone.

use std::collections::BTreeMap;

use crate::job::{JobId, StepType};

/// Mount point of the job-data volume inside every step.
pub const JOB_DATA_ROOT: &str = "/bespin/job-data";
/// Directory the workflow is downloaded (and unzipped) into.
pub const WORKFLOW_DIR: &str = "/bespin/job-data/workflow";
/// Where the job order document is written during staging.
pub const JOB_ORDER_PATH: &str = "/bespin/job-data/job-order.json";
/// Mount point of the output-data volume.
pub const OUTPUT_DATA_ROOT: &str = "/bespin/output-data";
/// Directory the workflow engine writes results into.
pub const RESULTS_DIR: &str = "/bespin/output-data/results";
pub const WORKFLOW_STDOUT_PATH: &str = "/bespin/output-data/bespin-workflow-output.json";
pub const WORKFLOW_STDERR_PATH: &str = "/bespin/output-data/bespin-workflow-output.log";
/// Mount point of the scratch volume used by the workflow engine.
pub const TMPOUT_ROOT: &str = "/bespin/tmpout";
/// Mount point of per-step config documents.
pub const CONFIG_DIR: &str = "/bespin/config";
/// Mount point of per-step credential secrets.
pub const CREDENTIALS_DIR: &str = "/bespin/credentials";
/// File the save-output step writes once the upload finished.
pub const RESULTS_MANIFEST_PATH: &str =
    "/bespin/output-data/annotate_project_details_results.json";

/// Label marking a resource as managed by lando.
pub const MANAGED_LABEL: &str = "bespin-job";
pub const JOB_ID_LABEL: &str = "bespin-job-id";
pub const STEP_TYPE_LABEL: &str = "bespin-job-step";

/// Persistent volumes a job may own.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum VolumePurpose {
    JobData,
    OutputData,
    Tmpout,
}

impl VolumePurpose {
    pub const ALL: [VolumePurpose; 3] = [
        VolumePurpose::JobData,
        VolumePurpose::OutputData,
        VolumePurpose::Tmpout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumePurpose::JobData => "job-data",
            VolumePurpose::OutputData => "output-data",
            VolumePurpose::Tmpout => "tmpout",
        }
    }
}

/// Names of every backend resource owned by one job.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ResourceNames {
    job_id: JobId,
    suffix: String,
}

impl ResourceNames {
    pub fn new(job_id: JobId, username: &str) -> Self {
        Self {
            job_id,
            suffix: format!("{}-{}", job_id, username),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// The `{job_id}-{username}` part shared by every name.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn volume(&self, purpose: VolumePurpose) -> String {
        format!("{}-{}", purpose.as_str(), self.suffix)
    }

    /// Name of the backend run for a step.
    pub fn run(&self, step: StepType) -> String {
        format!("{}-{}", step_purpose(step), self.suffix)
    }

    /// Name of the config document consumed by a step.
    pub fn config(&self, step: StepType) -> String {
        format!("{}-{}", step_purpose(step), self.suffix)
    }

    /// Name of the credentials secret mounted into a step.
    pub fn secret(&self, step: StepType) -> String {
        format!("{}-credentials-{}", step_purpose(step), self.suffix)
    }

    /// Labels attached to the run of `step`.
    pub fn labels(&self, step: StepType) -> BTreeMap<String, String> {
        run_labels(self.job_id, step)
    }
}

fn step_purpose(step: StepType) -> &'static str {
    match step {
        StepType::StageData => "stage-data",
        StepType::RunWorkflow => "run-workflow",
        StepType::OrganizeOutput => "organize-output",
        StepType::SaveOutput => "save-output",
    }
}

pub fn run_labels(job_id: JobId, step: StepType) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (JOB_ID_LABEL.to_string(), job_id.to_string()),
        (STEP_TYPE_LABEL.to_string(), step.as_str().to_string()),
    ])
}

/// Selector matching every run lando manages.
pub fn managed_selector() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])
}

/// Pull the job id and step type back out of a run's labels.
///
/// Returns `None` for runs that are not managed by lando or carry
/// malformed labels.
pub fn parse_run_labels(
    labels: &BTreeMap<String, String>,
) -> Option<(JobId, StepType)> {
    if labels.get(MANAGED_LABEL).map(String::as_str) != Some("true") {
        return None;
    }
    let job_id = labels.get(JOB_ID_LABEL)?.parse::<u64>().ok()?;
    let step = StepType::from_label(labels.get(STEP_TYPE_LABEL)?)?;
    Some((JobId(job_id), step))
}

/// True when every selector entry is present in `labels`.
pub fn labels_match(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_purpose_id_user() {
        let names = ResourceNames::new(JobId(51), "jpb");
        assert_eq!(names.volume(VolumePurpose::JobData), "job-data-51-jpb");
        assert_eq!(
            names.volume(VolumePurpose::OutputData),
            "output-data-51-jpb"
        );
        assert_eq!(names.volume(VolumePurpose::Tmpout), "tmpout-51-jpb");
        assert_eq!(names.run(StepType::StageData), "stage-data-51-jpb");
        assert_eq!(names.run(StepType::SaveOutput), "save-output-51-jpb");
        assert_eq!(
            names.secret(StepType::StageData),
            "stage-data-credentials-51-jpb"
        );
    }

    #[test]
    fn names_are_deterministic() {
        let a = ResourceNames::new(JobId(7), "alice");
        let b = ResourceNames::new(JobId(7), "alice");
        assert_eq!(a, b);
        for step in StepType::ALL {
            assert_eq!(a.run(step), b.run(step));
            assert_eq!(a.config(step), b.config(step));
        }
    }

    #[test]
    fn labels_parse_back() {
        let labels = run_labels(JobId(12), StepType::OrganizeOutput);
        assert_eq!(
            parse_run_labels(&labels),
            Some((JobId(12), StepType::OrganizeOutput))
        );
        assert!(labels_match(&managed_selector(), &labels));
    }

    #[test]
    fn unmanaged_or_partial_labels_are_rejected() {
        let mut labels = run_labels(JobId(12), StepType::StageData);
        labels.remove(STEP_TYPE_LABEL);
        assert_eq!(parse_run_labels(&labels), None);

        let mut labels = run_labels(JobId(12), StepType::StageData);
        labels.remove(MANAGED_LABEL);
        assert_eq!(parse_run_labels(&labels), None);

        let mut labels = run_labels(JobId(12), StepType::StageData);
        labels.insert(JOB_ID_LABEL.into(), "twelve".into());
        assert_eq!(parse_run_labels(&labels), None);
    }
}
