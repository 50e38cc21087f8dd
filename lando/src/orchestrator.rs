//! The job state machine.
//!
//! Every handler reads the job's recorded (state, step) from the record
//! store, checks the command is legal for that position, calls the backend
//! and only then writes the new position. Commands that do not match the
//! recorded position are dropped, which makes duplicate and out-of-order
//! deliveries harmless.

use std::sync::Arc;

use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::backend::{apply_teardown, read_run_logs, ExecutionBackend};
use crate::config::LandoConfig;
use crate::error::{BackendError, Result};
use crate::events::{EventMeta, EventPublisher, JobEvent, JobEventPayload};
use crate::job::{Job, JobId, JobPosition, JobState, JobStep, StepType};
use crate::message::{Command, StepCompletePayload, StepErrorPayload};
use crate::names::ResourceNames;
use crate::steps::{
    cleanup_all, exit_teardown, parse_results_manifest, step_resources,
    StepBuilder, StepPlan, Teardown, RESULTS_CONTAINER,
};
use crate::store::{JobError, JobErrorKind, JobRecordStore, OutputLocation};
use crate::telemetry;

/// What a handler did with a command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandleOutcome {
    /// The job advanced.
    Applied,
    /// The command did not match the job's position and was dropped.
    Stale,
    /// The job moved to ERRORED.
    JobFailed,
}

impl HandleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleOutcome::Applied => "ok",
            HandleOutcome::Stale => "stale",
            HandleOutcome::JobFailed => "job_error",
        }
    }
}

struct CommandContext {
    job_id: JobId,
    command: &'static str,
    correlation_id: Uuid,
}

impl CommandContext {
    fn new(job_id: JobId, command: &'static str) -> Self {
        Self {
            job_id,
            command,
            correlation_id: Uuid::now_v7(),
        }
    }
}

/// Failure while launching a step, absorbed into the job record.
struct LaunchFailure {
    kind: JobErrorKind,
    message: String,
}

impl From<BackendError> for LaunchFailure {
    fn from(err: BackendError) -> Self {
        let kind = if err.is_capacity() {
            JobErrorKind::InsufficientCapacity
        } else {
            JobErrorKind::Provisioning
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

/// Stateless orchestrator over an execution backend and a record store.
pub struct JobOrchestrator<B, S> {
    backend: B,
    store: S,
    config: Arc<LandoConfig>,
    events: Option<Arc<dyn EventPublisher<JobEvent>>>,
}

impl<B, S> std::fmt::Debug for JobOrchestrator<B, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("backend", &std::any::type_name::<B>())
            .field("store", &std::any::type_name::<S>())
            .field("events", &self.events.is_some())
            .finish()
    }
}

impl<B, S> JobOrchestrator<B, S>
where
    B: ExecutionBackend,
    S: JobRecordStore,
{
    pub fn new(backend: B, store: S, config: Arc<LandoConfig>) -> Self {
        Self {
            backend,
            store,
            config,
            events: None,
        }
    }

    pub fn with_events(
        mut self,
        events: Arc<dyn EventPublisher<JobEvent>>,
    ) -> Self {
        self.events = Some(events);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Dispatch a command to its handler.
    ///
    /// Job-level failures are recorded on the job and reported as
    /// [`HandleOutcome::JobFailed`]; only record-store and other operational
    /// failures are returned as errors.
    pub async fn handle(&self, command: &Command) -> Result<HandleOutcome> {
        let job_id = command.job_id();
        let name = command.name();
        let timer = telemetry::record_command_start(name);
        let result = async {
            match command {
                Command::StartJob(p) => self.start_job(p.job_id).await,
                Command::CancelJob(p) => self.cancel_job(p.job_id).await,
                Command::RestartJob(p) => self.restart_job(p.job_id).await,
                Command::StageJobComplete(p) => self.stage_job_complete(p).await,
                Command::StageJobError(p) => self.stage_job_error(p).await,
                Command::RunJobComplete(p) => self.run_job_complete(p).await,
                Command::RunJobError(p) => self.run_job_error(p).await,
                Command::OrganizeOutputComplete(p) => {
                    self.organize_output_complete(p).await
                }
                Command::OrganizeOutputError(p) => {
                    self.organize_output_error(p).await
                }
                Command::StoreJobOutputComplete(p) => {
                    self.store_job_output_complete(p).await
                }
                Command::StoreJobOutputError(p) => {
                    self.store_job_output_error(p).await
                }
            }
        }
        .instrument(telemetry::command_span(job_id, name))
        .await;
        telemetry::record_command_end(timer);
        let outcome = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(_) => "operational_error",
        };
        telemetry::record_command_handled(job_id, name, outcome);
        result
    }

    /// Launch a NEW or AUTHORIZED job from scratch.
    pub async fn start_job(&self, job_id: JobId) -> Result<HandleOutcome> {
        let cx = CommandContext::new(job_id, "start_job");
        let job = self.store.get_job(job_id).await?;
        if !job.state.is_startable() {
            return self.stale(&cx, job.position()).await;
        }
        self.launch_from_scratch(&cx, &job, job.position()).await
    }

    /// Tear down every resource of the job and mark it CANCELED.
    ///
    /// Legal from any state and safe to repeat.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<HandleOutcome> {
        let cx = CommandContext::new(job_id, "cancel_job");
        let job = self.store.get_job(job_id).await?;
        let from = job.position();
        let names = names_for(&job);
        self.teardown(&names, cleanup_all(&names)).await;
        self.transition(
            &cx,
            from,
            JobPosition::new(JobState::Canceled, JobStep::None),
        )
        .await?;
        Ok(HandleOutcome::Applied)
    }

    /// Resume an ERRORED or CANCELED job.
    pub async fn restart_job(&self, job_id: JobId) -> Result<HandleOutcome> {
        let cx = CommandContext::new(job_id, "restart_job");
        let job = self.store.get_job(job_id).await?;
        let from = job.position();
        if !job.state.is_restartable() {
            return self.stale(&cx, from).await;
        }
        if job.state == JobState::Canceled {
            return self.full_reset(&cx, &job).await;
        }
        match job.step {
            JobStep::RecordOutput => {
                let run_name = names_for(&job).run(StepType::SaveOutput);
                self.record_output(&cx, &job, from, &run_name).await
            }
            other => match other.step_type() {
                Some(step) => self.enter_step(&cx, &job, from, step).await,
                None => self.full_reset(&cx, &job).await,
            },
        }
    }

    pub async fn stage_job_complete(
        &self,
        payload: &StepCompletePayload,
    ) -> Result<HandleOutcome> {
        self.advance(
            "stage_job_complete",
            payload,
            StepType::StageData,
            StepType::RunWorkflow,
        )
        .await
    }

    pub async fn run_job_complete(
        &self,
        payload: &StepCompletePayload,
    ) -> Result<HandleOutcome> {
        self.advance(
            "run_job_complete",
            payload,
            StepType::RunWorkflow,
            StepType::OrganizeOutput,
        )
        .await
    }

    pub async fn organize_output_complete(
        &self,
        payload: &StepCompletePayload,
    ) -> Result<HandleOutcome> {
        self.advance(
            "organize_output_complete",
            payload,
            StepType::OrganizeOutput,
            StepType::SaveOutput,
        )
        .await
    }

    /// Record where the results were stored and finish the job.
    pub async fn store_job_output_complete(
        &self,
        payload: &StepCompletePayload,
    ) -> Result<HandleOutcome> {
        let cx = CommandContext::new(payload.job_id, "store_job_output_complete");
        let job = self.store.get_job(payload.job_id).await?;
        let from = job.position();
        if !job.is_running_at(JobStep::StoringOutput) {
            return self.stale(&cx, from).await;
        }
        let names = names_for(&job);
        let run_name = if payload.run_reference.is_empty() {
            names.run(StepType::SaveOutput)
        } else {
            payload.run_reference.clone()
        };
        self.record_output(&cx, &job, from, &run_name).await
    }

    pub async fn stage_job_error(
        &self,
        payload: &StepErrorPayload,
    ) -> Result<HandleOutcome> {
        self.step_failed("stage_job_error", payload, StepType::StageData)
            .await
    }

    pub async fn run_job_error(
        &self,
        payload: &StepErrorPayload,
    ) -> Result<HandleOutcome> {
        self.step_failed("run_job_error", payload, StepType::RunWorkflow)
            .await
    }

    pub async fn organize_output_error(
        &self,
        payload: &StepErrorPayload,
    ) -> Result<HandleOutcome> {
        self.step_failed("organize_output_error", payload, StepType::OrganizeOutput)
            .await
    }

    pub async fn store_job_output_error(
        &self,
        payload: &StepErrorPayload,
    ) -> Result<HandleOutcome> {
        self.step_failed("store_job_output_error", payload, StepType::SaveOutput)
            .await
    }

    async fn advance(
        &self,
        command: &'static str,
        payload: &StepCompletePayload,
        finished: StepType,
        next: StepType,
    ) -> Result<HandleOutcome> {
        let cx = CommandContext::new(payload.job_id, command);
        let job = self.store.get_job(payload.job_id).await?;
        let from = job.position();
        if !job.is_running_at(finished.job_step()) {
            return self.stale(&cx, from).await;
        }
        let names = names_for(&job);
        if payload.run_reference != names.run(finished) {
            debug!(
                job_id = %job.id,
                run_reference = %payload.run_reference,
                "completion names an unexpected run"
            );
        }
        self.teardown(&names, exit_teardown(&names, finished)).await;
        self.enter_step(&cx, &job, from, next).await
    }

    async fn step_failed(
        &self,
        command: &'static str,
        payload: &StepErrorPayload,
        step: StepType,
    ) -> Result<HandleOutcome> {
        let cx = CommandContext::new(payload.job_id, command);
        let job = self.store.get_job(payload.job_id).await?;
        let from = job.position();
        if !job.is_running_at(step.job_step()) {
            return self.stale(&cx, from).await;
        }
        self.fail_job(
            &cx,
            from,
            Some(step),
            JobErrorKind::StepFailed,
            payload.message.clone(),
        )
        .await
    }

    /// Read the results manifest of `run_name`, save the output location
    /// and finish the job.
    ///
    /// An unreadable manifest leaves the job ERRORED at RECORD_OUTPUT with
    /// every resource in place, so a restart can read it again.
    async fn record_output(
        &self,
        cx: &CommandContext,
        job: &Job,
        from: JobPosition,
        run_name: &str,
    ) -> Result<HandleOutcome> {
        let recording = JobPosition::new(JobState::Running, JobStep::RecordOutput);
        self.transition(cx, from, recording).await?;
        let location = match self.read_output_location(run_name).await {
            Ok(location) => location,
            Err(message) => {
                return self
                    .fail_job(cx, recording, None, JobErrorKind::OutputUnreadable, message)
                    .await;
            }
        };
        self.store.save_output_location(cx.job_id, location).await?;
        self.finish_job(cx, job, recording).await
    }

    async fn read_output_location(
        &self,
        run_name: &str,
    ) -> std::result::Result<OutputLocation, String> {
        let raw = read_run_logs(&self.backend, run_name, Some(RESULTS_CONTAINER))
            .await
            .map_err(|err| format!("results manifest unavailable: {err}"))?;
        parse_results_manifest(&raw)
            .map_err(|err| format!("unreadable results manifest: {err}"))
    }

    async fn full_reset(
        &self,
        cx: &CommandContext,
        job: &Job,
    ) -> Result<HandleOutcome> {
        let names = names_for(job);
        self.teardown(&names, cleanup_all(&names)).await;
        self.launch_from_scratch(cx, job, job.position()).await
    }

    async fn launch_from_scratch(
        &self,
        cx: &CommandContext,
        job: &Job,
        from: JobPosition,
    ) -> Result<HandleOutcome> {
        let creating = JobPosition::new(JobState::Running, JobStep::CreateResources);
        self.transition(cx, from, creating).await?;
        self.enter_step(cx, job, creating, StepType::StageData).await
    }

    /// Provision and launch `step`, then record the job as running it.
    async fn enter_step(
        &self,
        cx: &CommandContext,
        job: &Job,
        from: JobPosition,
        step: StepType,
    ) -> Result<HandleOutcome> {
        let target = JobPosition::new(JobState::Running, step.job_step());
        let plan = match self.plan_step(job, step).await? {
            Ok(plan) => plan,
            Err(failure) => {
                self.transition(cx, from, target).await?;
                return self
                    .fail_job(cx, target, Some(step), failure.kind, failure.message)
                    .await;
            }
        };

        let names = names_for(job);
        self.teardown(&names, step_resources(&names, step)).await;
        if let Err(err) = self.launch(&plan).await {
            let failure = LaunchFailure::from(err);
            self.transition(cx, from, target).await?;
            return self
                .fail_job(cx, target, Some(step), failure.kind, failure.message)
                .await;
        }

        telemetry::record_step_launched(job.id, step.as_str(), &plan.run_name);
        self.emit(
            cx,
            JobEventPayload::StepLaunched {
                step_type: step,
                run_name: plan.run_name.clone(),
            },
        )
        .await;
        self.transition(cx, from, target).await?;
        Ok(HandleOutcome::Applied)
    }

    /// Gather record-store inputs and build the plan for `step`.
    ///
    /// Store failures are operational and bubble out; failures to render
    /// the plan are job-level.
    async fn plan_step(
        &self,
        job: &Job,
        step: StepType,
    ) -> Result<std::result::Result<StepPlan, LaunchFailure>> {
        let builder = StepBuilder::new(&self.config, job);
        let plan = match step {
            StepType::StageData => {
                let input_files = self.store.get_input_files(job.id).await?;
                let credentials = self.store.get_credentials(job.id).await?;
                builder.stage_data(&input_files, &credentials)
            }
            StepType::RunWorkflow => Ok(builder.run_workflow()),
            StepType::OrganizeOutput => {
                let methods = self.store.get_methods_document(job.id).await?;
                builder.organize_output(&methods)
            }
            StepType::SaveOutput => {
                let targets = self.store.get_share_targets(job.id).await?;
                let credentials = self.store.get_credentials(job.id).await?;
                builder.save_output(&targets, &credentials)
            }
        };
        Ok(plan.map_err(|err| LaunchFailure {
            kind: JobErrorKind::Provisioning,
            message: err.to_string(),
        }))
    }

    async fn launch(&self, plan: &StepPlan) -> std::result::Result<(), BackendError> {
        let backend = self.backend.name();
        for volume in &plan.volumes {
            let created = self
                .backend
                .create_persistent_volume(volume)
                .instrument(telemetry::backend_span(backend, "create_volume", &volume.name))
                .await;
            match created {
                Ok(_) => {}
                Err(err) if err.is_already_exists() => {
                    debug!(volume = %volume.name, "reusing existing volume");
                }
                Err(err) => return Err(err),
            }
        }
        for secret in &plan.secrets {
            self.backend
                .create_secret(secret)
                .instrument(telemetry::backend_span(backend, "create_secret", &secret.name))
                .await?;
        }
        for config in &plan.configs {
            self.backend
                .create_config(config)
                .instrument(telemetry::backend_span(backend, "create_config", &config.name))
                .await?;
        }
        self.backend
            .run(&plan.run_name, &plan.spec, &plan.labels)
            .instrument(telemetry::backend_span(backend, "run", &plan.run_name))
            .await?;
        Ok(())
    }

    async fn finish_job(
        &self,
        cx: &CommandContext,
        job: &Job,
        from: JobPosition,
    ) -> Result<HandleOutcome> {
        let names = names_for(job);
        self.teardown(&names, cleanup_all(&names)).await;
        self.transition(
            cx,
            from,
            JobPosition::new(JobState::Finished, JobStep::None),
        )
        .await?;
        Ok(HandleOutcome::Applied)
    }

    /// Move the job to ERRORED at the step in `at`, keeping the step.
    async fn fail_job(
        &self,
        cx: &CommandContext,
        at: JobPosition,
        step_type: Option<StepType>,
        kind: JobErrorKind,
        message: String,
    ) -> Result<HandleOutcome> {
        let errored = JobPosition::new(JobState::Errored, at.step);
        self.transition(cx, at, errored).await?;
        self.store
            .save_error(
                cx.job_id,
                JobError {
                    step: at.step,
                    kind,
                    message: message.clone(),
                },
            )
            .await?;
        telemetry::record_job_error(cx.job_id, at.step.as_str(), kind.as_str(), &message);
        self.emit(
            cx,
            JobEventPayload::Errored {
                step_type,
                kind,
                message,
            },
        )
        .await;
        Ok(HandleOutcome::JobFailed)
    }

    async fn stale(
        &self,
        cx: &CommandContext,
        position: JobPosition,
    ) -> Result<HandleOutcome> {
        telemetry::record_stale_message(cx.job_id, cx.command, position);
        self.emit(
            cx,
            JobEventPayload::StaleMessageDropped {
                command: cx.command.to_string(),
                position,
            },
        )
        .await;
        Ok(HandleOutcome::Stale)
    }

    /// Persist a position change: state first, then step.
    async fn transition(
        &self,
        cx: &CommandContext,
        from: JobPosition,
        to: JobPosition,
    ) -> Result<()> {
        if from == to {
            return Ok(());
        }
        if from.state != to.state {
            self.store.set_job_state(cx.job_id, to.state).await?;
        }
        if from.step != to.step {
            self.store.set_job_step(cx.job_id, to.step).await?;
        }
        debug!(job_id = %cx.job_id, %from, %to, "job transitioned");
        self.emit(cx, JobEventPayload::Transitioned { from, to }).await;
        Ok(())
    }

    async fn teardown(&self, names: &ResourceNames, teardown: Teardown) {
        let result = apply_teardown(&self.backend, &teardown)
            .instrument(telemetry::backend_span(
                self.backend.name(),
                "teardown",
                names.suffix(),
            ))
            .await;
        if let Err(err) = result {
            warn!(
                job_id = %names.job_id(),
                error = %err,
                "teardown incomplete; leftovers are removed on the next cleanup"
            );
        }
    }

    async fn emit(&self, cx: &CommandContext, payload: JobEventPayload) {
        let Some(events) = &self.events else {
            return;
        };
        let key = format!("{}:{}:{}", cx.job_id, cx.command, payload.kind());
        let event = JobEvent {
            meta: EventMeta::new(cx.job_id, Some(cx.correlation_id), key),
            payload,
        };
        if let Err(err) = events.publish(event).await {
            warn!(job_id = %cx.job_id, error = %err, "failed to publish job event");
        }
    }
}

fn names_for(job: &Job) -> ResourceNames {
    ResourceNames::new(job.id, &job.username)
}
