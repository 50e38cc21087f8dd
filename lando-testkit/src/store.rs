use async_trait::async_trait;
use lando::error::StoreError;
use lando::job::{Job, JobId, JobPosition, JobState, JobStep};
use lando::store::{
    InputFiles, JobCredentials, JobError, JobRecordStore, OutputLocation,
    ShareTargets,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::job::{sample_credentials, sample_share_targets};

#[derive(Clone, Debug)]
struct JobRecord {
    job: Job,
    input_files: InputFiles,
    errors: Vec<JobError>,
    output: Option<OutputLocation>,
    /// Every position the job was written to, in order.
    history: Vec<JobPosition>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, JobRecord>,
    unavailable: Option<String>,
    share_targets: ShareTargets,
    credentials: Option<JobCredentials>,
    methods_document: String,
    writes: usize,
}

/// Job record store backed by a map, with toggles for outage tests.
#[derive(Clone)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryJobStore")
            .field("jobs", &state.jobs.len())
            .field("unavailable", &state.unavailable)
            .finish()
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                share_targets: sample_share_targets(),
                credentials: Some(sample_credentials()),
                methods_document: "# Methods\n".to_string(),
                ..State::default()
            })),
        }
    }

    pub fn insert(&self, job: Job) {
        self.insert_with_files(job, InputFiles::default());
    }

    pub fn insert_with_files(&self, job: Job, input_files: InputFiles) {
        let history = vec![job.position()];
        self.state.lock().jobs.insert(
            job.id,
            JobRecord {
                job,
                input_files,
                errors: Vec::new(),
                output: None,
                history,
            },
        );
    }

    /// Overwrite a job's position without recording history.
    pub fn set_position(&self, job_id: JobId, state: JobState, step: JobStep) {
        if let Some(record) = self.state.lock().jobs.get_mut(&job_id) {
            record.job.state = state;
            record.job.step = step;
        }
    }

    pub fn position(&self, job_id: JobId) -> Option<JobPosition> {
        self.state.lock().jobs.get(&job_id).map(|r| r.job.position())
    }

    pub fn job(&self, job_id: JobId) -> Option<Job> {
        self.state.lock().jobs.get(&job_id).map(|r| r.job.clone())
    }

    pub fn history(&self, job_id: JobId) -> Vec<JobPosition> {
        self.state
            .lock()
            .jobs
            .get(&job_id)
            .map(|r| r.history.clone())
            .unwrap_or_default()
    }

    pub fn errors(&self, job_id: JobId) -> Vec<JobError> {
        self.state
            .lock()
            .jobs
            .get(&job_id)
            .map(|r| r.errors.clone())
            .unwrap_or_default()
    }

    pub fn last_error(&self, job_id: JobId) -> Option<JobError> {
        self.errors(job_id).pop()
    }

    pub fn output_location(&self, job_id: JobId) -> Option<OutputLocation> {
        self.state
            .lock()
            .jobs
            .get(&job_id)
            .and_then(|r| r.output.clone())
    }

    /// Count of state, step, error and output writes.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    /// Make every call fail with `StoreError::Unavailable` until cleared.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.state.lock().unavailable = reason.map(str::to_string);
    }

    pub fn set_share_targets(&self, targets: ShareTargets) {
        self.state.lock().share_targets = targets;
    }

    /// `None` makes `get_credentials` report the store as unavailable.
    pub fn set_credentials(&self, credentials: Option<JobCredentials>) {
        self.state.lock().credentials = credentials;
    }

    pub fn set_methods_document(&self, document: &str) {
        self.state.lock().methods_document = document.to_string();
    }

    fn with_record<T>(
        &self,
        job_id: JobId,
        write: bool,
        f: impl FnOnce(&mut JobRecord) -> T,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.unavailable {
            return Err(StoreError::Unavailable(reason.clone()));
        }
        if write {
            state.writes += 1;
        }
        let record = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        Ok(f(record))
    }
}

#[async_trait]
impl JobRecordStore for InMemoryJobStore {
    async fn get_job(&self, job_id: JobId) -> Result<Job, StoreError> {
        self.with_record(job_id, false, |r| r.job.clone())
    }

    async fn set_job_state(
        &self,
        job_id: JobId,
        state: JobState,
    ) -> Result<(), StoreError> {
        self.with_record(job_id, true, |r| {
            r.job.state = state;
            r.history.push(r.job.position());
        })
    }

    async fn set_job_step(
        &self,
        job_id: JobId,
        step: JobStep,
    ) -> Result<(), StoreError> {
        self.with_record(job_id, true, |r| {
            r.job.step = step;
            r.history.push(r.job.position());
        })
    }

    async fn save_error(
        &self,
        job_id: JobId,
        error: JobError,
    ) -> Result<(), StoreError> {
        self.with_record(job_id, true, |r| r.errors.push(error))
    }

    async fn save_output_location(
        &self,
        job_id: JobId,
        location: OutputLocation,
    ) -> Result<(), StoreError> {
        self.with_record(job_id, true, |r| r.output = Some(location))
    }

    async fn get_input_files(
        &self,
        job_id: JobId,
    ) -> Result<InputFiles, StoreError> {
        self.with_record(job_id, false, |r| r.input_files.clone())
    }

    async fn get_share_targets(
        &self,
        job_id: JobId,
    ) -> Result<ShareTargets, StoreError> {
        self.with_record(job_id, false, |_| ())?;
        Ok(self.state.lock().share_targets.clone())
    }

    async fn get_credentials(
        &self,
        job_id: JobId,
    ) -> Result<JobCredentials, StoreError> {
        self.with_record(job_id, false, |_| ())?;
        self.state.lock().credentials.clone().ok_or_else(|| {
            StoreError::Unavailable("no credentials configured".into())
        })
    }

    async fn get_methods_document(
        &self,
        job_id: JobId,
    ) -> Result<String, StoreError> {
        self.with_record(job_id, false, |_| ())?;
        Ok(self.state.lock().methods_document.clone())
    }
}
