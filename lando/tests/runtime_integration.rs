//! Runtime integration tests for lando.
//!
//! Drives jobs end to end through the inbox queue, consumers, orchestrator
//! and watcher, and checks lease contention and process-level failures.

use std::sync::Arc;
use std::time::Duration;

use lando::channel::{InProcBroker, InProcConnection, LandoClient, MessageChannel};
use lando::error::{BackendError, LandoError, StoreError};
use lando::events::{InProcEventBus, JobEventPayload};
use lando::job::{JobId, JobPosition, JobState, JobStep, StepType};
use lando::lease::JobLeaseTable;
use lando::message::Command;
use lando::names::ResourceNames;
use lando::orchestrator::{HandleOutcome, JobOrchestrator};
use lando::runtime::{
    ConsumerConfig, DeliveryOutcome, OrchestratorRuntime, OrchestratorRuntimeBuilder,
};
use lando_testkit::{
    results_manifest, sample_input_files, sample_job, test_config, BackendOp,
    InMemoryBackend, InMemoryJobStore,
};
use tokio::time::{sleep, timeout};

const QUEUE: &str = "lando";

type Runtime = OrchestratorRuntime<InMemoryBackend, InMemoryJobStore>;

struct TestEnv {
    broker: InProcBroker,
    backend: InMemoryBackend,
    store: InMemoryJobStore,
    client: LandoClient,
}

impl TestEnv {
    fn new() -> Self {
        let broker = InProcBroker::new();
        let client = LandoClient::new(Arc::new(broker.connect()), QUEUE);
        Self {
            broker,
            backend: InMemoryBackend::new(),
            store: InMemoryJobStore::new(),
            client,
        }
    }

    fn builder(&self) -> OrchestratorRuntimeBuilder<InMemoryBackend, InMemoryJobStore> {
        OrchestratorRuntimeBuilder::new(test_config())
            .with_backend(self.backend.clone())
            .with_store(self.store.clone())
            .with_channel(Arc::new(self.broker.connect()))
    }

    async fn started(&self) -> Runtime {
        let runtime = self.builder().build().expect("runtime should build");
        runtime.start().await.unwrap();
        self.wait_until(|| self.backend.watch_count() > 0).await;
        runtime
    }

    async fn wait_until(&self, mut done: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !done() {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn wait_for_position(&self, job_id: JobId, position: JobPosition) {
        self.wait_until(|| self.store.position(job_id) == Some(position))
            .await;
    }
}

fn running(step: JobStep) -> JobPosition {
    JobPosition::new(JobState::Running, step)
}

#[tokio::test]
async fn job_runs_to_completion_through_the_queue() {
    let env = TestEnv::new();
    let job = sample_job(51);
    let names = ResourceNames::new(job.id, &job.username);
    env.store.insert_with_files(job.clone(), sample_input_files());
    let runtime = env.started().await;

    env.client.start_job(job.id).await.unwrap();

    let steps = [
        (StepType::StageData, JobStep::Staging),
        (StepType::RunWorkflow, JobStep::RunningWorkflow),
        (StepType::OrganizeOutput, JobStep::OrganizeOutput),
        (StepType::SaveOutput, JobStep::StoringOutput),
    ];
    for (step, job_step) in steps {
        env.wait_for_position(job.id, running(job_step)).await;
        let run = names.run(step);
        assert!(env.backend.has_run(&run), "{run} should be running");
        if step == StepType::SaveOutput {
            env.backend
                .set_logs(&run, "results", &results_manifest("p-9", "r-9"));
        }
        env.backend.complete_run(&run);
    }

    env.wait_for_position(job.id, JobPosition::new(JobState::Finished, JobStep::None))
        .await;
    assert_eq!(
        env.store.output_location(job.id).unwrap().project_id,
        "p-9"
    );
    assert!(env.backend.resources_for(&names).is_empty());
    assert_eq!(env.broker.queue_depth(QUEUE), 0);

    runtime.shutdown().await.unwrap();
    assert!(runtime.take_fatal_error().is_none());
}

#[tokio::test]
async fn failed_step_is_recorded_and_restart_resumes() {
    let env = TestEnv::new();
    let job = sample_job(52);
    let names = ResourceNames::new(job.id, &job.username);
    env.store.insert(job.clone());
    let runtime = env.started().await;

    env.client.start_job(job.id).await.unwrap();
    env.wait_for_position(job.id, running(JobStep::Staging)).await;
    env.backend.complete_run(&names.run(StepType::StageData));
    env.wait_for_position(job.id, running(JobStep::RunningWorkflow))
        .await;

    env.backend
        .fail_run(&names.run(StepType::RunWorkflow), "Final process status is permanentFail");
    env.wait_for_position(
        job.id,
        JobPosition::new(JobState::Errored, JobStep::RunningWorkflow),
    )
    .await;
    let error = env.store.last_error(job.id).unwrap();
    assert_eq!(error.message, "Final process status is permanentFail");

    env.client.restart_job(job.id).await.unwrap();
    env.wait_for_position(job.id, running(JobStep::RunningWorkflow))
        .await;
    assert!(env.backend.has_run(&names.run(StepType::RunWorkflow)));

    env.client.cancel_job(job.id).await.unwrap();
    env.wait_for_position(job.id, JobPosition::new(JobState::Canceled, JobStep::None))
        .await;
    assert!(env.backend.resources_for(&names).is_empty());

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn many_jobs_progress_independently() {
    let env = TestEnv::new();
    let ids: Vec<JobId> = (100..110).map(JobId).collect();
    for id in &ids {
        env.store.insert(sample_job(id.0));
    }
    let runtime = env.started().await;

    for id in &ids {
        env.client.start_job(*id).await.unwrap();
        env.client.start_job(*id).await.unwrap();
    }
    for id in &ids {
        env.wait_for_position(*id, running(JobStep::Staging)).await;
    }
    env.wait_until(|| env.broker.queue_depth(QUEUE) == 0).await;

    for id in &ids {
        let names = ResourceNames::new(*id, "jpb");
        env.backend.complete_run(&names.run(StepType::StageData));
    }
    for id in &ids {
        env.wait_for_position(*id, running(JobStep::RunningWorkflow))
            .await;
        let history = env.store.history(*id);
        let staged = history
            .iter()
            .filter(|p| **p == running(JobStep::Staging))
            .count();
        assert_eq!(staged, 1, "job {id} staged more than once");
    }

    runtime.shutdown().await.unwrap();
    assert!(env.backend.watch_count() >= 1);
}

#[tokio::test]
async fn events_are_published_while_running() {
    let env = TestEnv::new();
    env.store.insert(sample_job(53));
    let bus = Arc::new(InProcEventBus::new(256));
    let mut rx = bus.subscribe_job_events();
    let runtime = env
        .builder()
        .with_events(bus.clone())
        .without_watcher()
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    env.client.start_job(JobId(53)).await.unwrap();
    let launched = timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.unwrap();
            if let JobEventPayload::StepLaunched { step_type, run_name } = event.payload {
                return (step_type, run_name);
            }
        }
    })
    .await
    .expect("no launch event");
    assert_eq!(launched, (StepType::StageData, "stage-data-53-jpb".to_string()));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn contended_job_is_requeued_until_the_lease_frees() {
    let env = TestEnv::new();
    env.store.insert(sample_job(61));
    let orchestrator = JobOrchestrator::new(
        env.backend.clone(),
        env.store.clone(),
        Arc::new(test_config()),
    );
    let leases = JobLeaseTable::new();
    let consumer = ConsumerConfig::new("c-1", QUEUE).with_lease_retry_delay(1);
    let conn = env.broker.connect();

    env.client.start_job(JobId(61)).await.unwrap();
    let other = leases.try_acquire(JobId(61), "c-2").unwrap();

    let delivery = conn.next_delivery(QUEUE).await.unwrap();
    let outcome =
        Runtime::process_delivery(&consumer, &orchestrator, &conn, &leases, delivery)
            .await
            .unwrap();
    assert_eq!(outcome, DeliveryOutcome::Requeued);
    assert_eq!(env.broker.queue_depth(QUEUE), 1);
    assert_eq!(env.store.position(JobId(61)), Some(sample_job(61).position()));

    drop(other);
    let delivery = conn.next_delivery(QUEUE).await.unwrap();
    assert!(delivery.redelivered);
    let outcome =
        Runtime::process_delivery(&consumer, &orchestrator, &conn, &leases, delivery)
            .await
            .unwrap();
    assert_eq!(outcome, DeliveryOutcome::Handled(HandleOutcome::Applied));
    assert_eq!(conn.unacked_count(), 0);
    assert!(!leases.is_leased(JobId(61)));
}

#[tokio::test]
async fn store_outage_requeues_and_reports() {
    let env = TestEnv::new();
    env.store.insert(sample_job(62));
    env.store.set_unavailable(Some("connection refused"));
    let orchestrator = JobOrchestrator::new(
        env.backend.clone(),
        env.store.clone(),
        Arc::new(test_config()),
    );
    let leases = JobLeaseTable::new();
    let consumer = ConsumerConfig::new("c-1", QUEUE);
    let conn: InProcConnection = env.broker.connect();

    env.client.start_job(JobId(62)).await.unwrap();
    let delivery = conn.next_delivery(QUEUE).await.unwrap();
    let err = Runtime::process_delivery(&consumer, &orchestrator, &conn, &leases, delivery)
        .await
        .unwrap_err();
    assert!(matches!(err, LandoError::Store(StoreError::Unavailable(_))));
    assert_eq!(env.broker.queue_depth(QUEUE), 1);
    assert!(leases.is_empty());
}

#[tokio::test]
async fn operational_failure_stops_the_runtime() {
    let env = TestEnv::new();
    env.store.insert(sample_job(63));
    env.store.set_unavailable(Some("connection refused"));
    let runtime = env.builder().without_watcher().build().unwrap();
    runtime.start().await.unwrap();

    env.client.start_job(JobId(63)).await.unwrap();
    timeout(Duration::from_secs(2), runtime.shutdown_token().cancelled())
        .await
        .expect("runtime should stop itself");
    runtime.shutdown().await.unwrap();

    assert!(matches!(
        runtime.take_fatal_error(),
        Some(LandoError::Store(StoreError::Unavailable(_)))
    ));
    assert_eq!(env.broker.queue_depth(QUEUE), 1);
}

#[tokio::test]
async fn exhausted_watcher_stops_the_runtime() {
    let env = TestEnv::new();
    for _ in 0..4 {
        env.backend.fail_next(
            BackendOp::Watch,
            BackendError::Request("api server unreachable".into()),
        );
    }
    let runtime = env.builder().build().unwrap();
    runtime.start().await.unwrap();

    timeout(Duration::from_secs(2), runtime.shutdown_token().cancelled())
        .await
        .expect("runtime should stop itself");
    runtime.shutdown().await.unwrap();
    assert!(matches!(
        runtime.take_fatal_error(),
        Some(LandoError::WatchExhausted { attempts: 4, .. })
    ));
}

#[tokio::test]
async fn closed_channel_ends_consumers_quietly() {
    let env = TestEnv::new();
    let conn = Arc::new(env.broker.connect());
    let channel: Arc<dyn MessageChannel> = conn.clone();
    let runtime = OrchestratorRuntimeBuilder::new(test_config())
        .with_backend(env.backend.clone())
        .with_store(env.store.clone())
        .with_channel(channel)
        .without_watcher()
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    conn.close();
    timeout(Duration::from_secs(2), runtime.shutdown())
        .await
        .expect("shutdown should not hang")
        .unwrap();
    assert!(runtime.take_fatal_error().is_none());
}

#[tokio::test]
async fn builder_requires_every_dependency() {
    let env = TestEnv::new();
    let err = OrchestratorRuntimeBuilder::<InMemoryBackend, InMemoryJobStore>::new(
        test_config(),
    )
    .with_backend(env.backend.clone())
    .with_channel(Arc::new(env.broker.connect()))
    .build()
    .unwrap_err();
    assert!(err.to_string().contains("store dependency missing"));

    let mut config = test_config();
    config.queue.name.clear();
    let err = OrchestratorRuntimeBuilder::new(config)
        .with_backend(env.backend.clone())
        .with_store(env.store.clone())
        .with_channel(Arc::new(env.broker.connect()))
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("queue"));
}

#[tokio::test]
async fn unknown_commands_do_not_stall_the_queue() {
    let env = TestEnv::new();
    env.store.insert(sample_job(64));
    let runtime = env.builder().without_watcher().build().unwrap();
    runtime.start().await.unwrap();

    env.broker
        .publish_raw(QUEUE, br#"{"command":"launch_rockets","payload":{}}"#.to_vec());
    env.client.start_job(JobId(64)).await.unwrap();
    env.wait_for_position(JobId(64), running(JobStep::Staging)).await;

    let stray = Command::step_complete(StepType::SaveOutput, JobId(64), "save-output-64-jpb");
    env.broker.publish_raw(QUEUE, stray.encode().unwrap());
    env.wait_until(|| env.broker.queue_depth(QUEUE) == 0).await;
    assert_eq!(env.store.position(JobId(64)), Some(running(JobStep::Staging)));

    runtime.shutdown().await.unwrap();
}
