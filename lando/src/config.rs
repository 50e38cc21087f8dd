use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top level configuration for a lando deployment.
///
/// Loaded from YAML; every section except `queue` and the three step images
/// has usable defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LandoConfig {
    /// Inbox queue settings.
    pub queue: QueueConfig,
    /// Persistent volume sizing and class.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Data store (remote file service) settings.
    #[serde(default)]
    pub data_store: DataStoreConfig,
    /// Stage data step container.
    pub stage_data: StepImageConfig,
    /// Run workflow step resource defaults.
    #[serde(default)]
    pub run_workflow: RunWorkflowConfig,
    /// Organize output step container.
    pub organize_output: StepImageConfig,
    /// Save output step container and its results sidecar.
    pub save_output: SaveOutputConfig,
    /// Watcher reconnect policy.
    #[serde(default)]
    pub watcher: WatcherConfig,
    /// Consumer runtime settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl LandoConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: LandoConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw =
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_yaml_str(&raw)
    }

    /// Reject configurations that would produce unusable step specs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.name.trim().is_empty() {
            return Err(ConfigError::Invalid("queue.name is empty".into()));
        }
        self.stage_data.validate("stage_data")?;
        self.organize_output.validate("organize_output")?;
        self.save_output.step.validate("save_output")?;
        if self.save_output.results_image.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "save_output.results_image is empty".into(),
            ));
        }
        for (field, size) in [
            ("storage.job_data_size_in_g", self.storage.job_data_size_in_g),
            (
                "storage.output_data_size_in_g",
                self.storage.output_data_size_in_g,
            ),
            ("storage.tmpout_size_in_g", self.storage.tmpout_size_in_g),
        ] {
            if size == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{field} must be positive"
                )));
            }
        }
        if self.runtime.consumers == 0 {
            return Err(ConfigError::Invalid(
                "runtime.consumers must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Inbox queue settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Name of the orchestrator's inbox queue.
    pub name: String,
}

/// Persistent volume settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage class requested for every volume.
    pub storage_class: Option<String>,
    /// Default job-data volume size, overridable per job.
    pub job_data_size_in_g: u32,
    pub output_data_size_in_g: u32,
    pub tmpout_size_in_g: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_class: None,
            job_data_size_in_g: 10,
            output_data_size_in_g: 10,
            tmpout_size_in_g: 10,
        }
    }
}

/// Remote data store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataStoreConfig {
    /// Env var name the credentials path is exported under.
    pub credentials_env: String,
    /// Key of the credentials document inside the per-step secret.
    pub credentials_key: String,
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            credentials_env: "DDSCLIENT_CONF".into(),
            credentials_key: "config".into(),
        }
    }
}

/// Container settings for a fixed-image step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepImageConfig {
    pub image: String,
    /// Command prefix; the config document path is appended.
    pub command: Vec<String>,
    #[serde(default = "default_step_cpu")]
    pub cpu: u32,
    #[serde(default = "default_step_memory")]
    pub memory_in_g: u32,
}

impl StepImageConfig {
    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("{section}.image is empty")));
        }
        if self.command.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{section}.command is empty"
            )));
        }
        Ok(())
    }
}

fn default_step_cpu() -> u32 {
    1
}

fn default_step_memory() -> u32 {
    1
}

/// Save output step settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SaveOutputConfig {
    #[serde(flatten)]
    pub step: StepImageConfig,
    /// Image of the sidecar that waits for the results manifest.
    pub results_image: String,
}

/// Defaults for the run workflow step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunWorkflowConfig {
    pub cpu: u32,
    pub memory_in_g: u32,
    /// Optional read-only volume with shared reference data.
    #[serde(default)]
    pub system_data_volume: Option<SystemDataVolume>,
}

impl Default for RunWorkflowConfig {
    fn default() -> Self {
        Self {
            cpu: 1,
            memory_in_g: 1,
            system_data_volume: None,
        }
    }
}

/// Pre-existing claim mounted read-only into the workflow step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemDataVolume {
    pub volume_claim_name: String,
    pub mount_path: String,
}

/// Watcher reconnect policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Delay before the first reconnect attempt; doubled per failure.
    pub reconnect_backoff_ms: u64,
    pub max_reconnect_backoff_ms: u64,
    /// Consecutive failed reconnects before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_ms: 500,
            max_reconnect_backoff_ms: 30_000,
            max_reconnect_attempts: 5,
        }
    }
}

/// Orchestrator consumer settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of concurrent inbox consumers.
    pub consumers: usize,
    /// Delay before requeueing a message whose job is held by another consumer.
    pub lease_retry_delay_ms: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            consumers: 1,
            lease_retry_delay_ms: 50,
            shutdown_timeout_secs: 30,
        }
    }
}
