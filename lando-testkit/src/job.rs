use chrono::{TimeZone, Utc};
use lando::config::LandoConfig;
use lando::job::{
    Job, JobId, JobState, JobStep, ResourceRequests, RunSettings, Workflow,
    WorkflowType,
};
use lando::store::{InputFiles, JobCredentials, RemoteFile, ShareTargets};
use serde_json::json;

/// Configuration used across the test suites.
pub const TEST_CONFIG: &str = r#"
queue:
  name: lando
storage:
  storage_class: standard
  job_data_size_in_g: 2
  output_data_size_in_g: 3
  tmpout_size_in_g: 1
stage_data:
  image: lando-util:test
  command: [stagedata]
run_workflow:
  cpu: 2
  memory_in_g: 4
organize_output:
  image: lando-util:test
  command: [organize]
save_output:
  image: dds-util:test
  command: [upload]
  results_image: busybox:test
watcher:
  reconnect_backoff_ms: 5
  max_reconnect_backoff_ms: 20
  max_reconnect_attempts: 3
runtime:
  consumers: 2
  lease_retry_delay_ms: 5
  shutdown_timeout_secs: 2
"#;

pub fn test_config() -> LandoConfig {
    LandoConfig::from_yaml_str(TEST_CONFIG)
        .expect("test configuration should parse")
}

/// A NEW job running a packed workflow, owned by `jpb`.
pub fn sample_job(id: u64) -> Job {
    Job {
        id: JobId(id),
        name: format!("job {id}"),
        username: "jpb".to_string(),
        created: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        state: JobState::New,
        step: JobStep::None,
        workflow: Workflow {
            url: "https://example.org/workflows/exome.cwl".to_string(),
            workflow_type: WorkflowType::Packed,
            job_order: json!({ "threads": 2 }),
        },
        run_settings: RunSettings {
            image: "cwl-runner:test".to_string(),
            base_command: vec!["cwltool".to_string()],
        },
        resource_requests: ResourceRequests::default(),
    }
}

pub fn job_at(id: u64, state: JobState, step: JobStep) -> Job {
    Job {
        state,
        step,
        ..sample_job(id)
    }
}

pub fn zipped_job(id: u64, workflow_path: &str) -> Job {
    let mut job = sample_job(id);
    job.workflow.url = "https://example.org/workflows/exome.zip".to_string();
    job.workflow.workflow_type = WorkflowType::Zipped {
        workflow_path: workflow_path.to_string(),
    };
    job
}

pub fn sample_input_files() -> InputFiles {
    InputFiles {
        remote_files: vec![RemoteFile {
            file_id: "myid".to_string(),
            destination_path: "file1.txt".to_string(),
        }],
    }
}

pub fn sample_credentials() -> JobCredentials {
    JobCredentials {
        url: "https://dds.example.org/api/v1".to_string(),
        agent_key: "agent-key".to_string(),
        user_key: "user-key".to_string(),
    }
}

pub fn sample_share_targets() -> ShareTargets {
    ShareTargets {
        destination_project_name: "results-project".to_string(),
        share_user_ids: vec!["user-1".to_string()],
    }
}

/// Results manifest written by the save output step.
pub fn results_manifest(project_id: &str, readme_file_id: &str) -> String {
    json!({ "project_id": project_id, "readme_file_id": readme_file_id })
        .to_string()
}
