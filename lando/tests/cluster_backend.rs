use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::StreamExt;
use lando::backend::{
    read_run_logs, ClusterBackend, ExecutionBackend, ManifestKind, RunCondition,
    RunEvent, RunEventKind, RunStatus,
};
use lando::channel::{InProcBroker, StepNotifier};
use lando::error::BackendError;
use lando::job::{JobId, JobPosition, JobState, JobStep, StepType};
use lando::message::Command;
use lando::names::{managed_selector, ResourceNames};
use lando::orchestrator::{HandleOutcome, JobOrchestrator};
use lando::store::JobErrorKind;
use lando::watcher::Watcher;
use lando_testkit::{
    results_manifest, sample_input_files, sample_job, test_config, FakeClusterApi,
    InMemoryJobStore,
};
use tokio::time::timeout;

const NAMESPACE: &str = "bespin";

fn setup(id: u64) -> (
    FakeClusterApi,
    InMemoryJobStore,
    JobOrchestrator<ClusterBackend<FakeClusterApi>, InMemoryJobStore>,
    ResourceNames,
) {
    let api = FakeClusterApi::new();
    let store = InMemoryJobStore::new();
    let job = sample_job(id);
    let names = ResourceNames::new(job.id, &job.username);
    store.insert_with_files(job, sample_input_files());
    let backend = ClusterBackend::new(Arc::new(api.clone()), NAMESPACE);
    let orchestrator =
        JobOrchestrator::new(backend, store.clone(), Arc::new(test_config()));
    (api, store, orchestrator, names)
}

#[tokio::test]
async fn start_creates_cluster_objects_in_the_namespace() {
    let (api, store, orchestrator, names) = setup(51);

    let outcome = orchestrator
        .handle(&Command::start_job(JobId(51)))
        .await
        .unwrap();
    assert_eq!(outcome, HandleOutcome::Applied);
    assert_eq!(
        store.position(JobId(51)),
        Some(JobPosition::new(JobState::Running, JobStep::Staging))
    );

    let claim = api
        .object(ManifestKind::PersistentVolumeClaim, "job-data-51-jpb")
        .expect("job data claim");
    assert_eq!(
        claim["spec"]["resources"]["requests"]["storage"],
        "2Gi"
    );
    assert!(api
        .object(ManifestKind::Secret, "stage-data-credentials-51-jpb")
        .is_some());
    assert!(api
        .object(ManifestKind::ConfigMap, "stage-data-51-jpb")
        .is_some());

    let job = api
        .object(ManifestKind::Job, &names.run(StepType::StageData))
        .expect("stage data job");
    assert_eq!(job["metadata"]["labels"]["bespin-job"], "true");
    assert_eq!(job["metadata"]["labels"]["bespin-job-id"], "51");
    assert_eq!(job["metadata"]["labels"]["bespin-job-step"], "stage_data");
    assert_eq!(job["spec"]["backoffLimit"], 0);

    assert!(api.namespaces().iter().all(|ns| ns == NAMESPACE));
}

#[tokio::test]
async fn cancel_tolerates_missing_objects() {
    let (api, store, orchestrator, _) = setup(52);

    orchestrator
        .handle(&Command::cancel_job(JobId(52)))
        .await
        .unwrap();
    assert_eq!(
        store.position(JobId(52)),
        Some(JobPosition::new(JobState::Canceled, JobStep::None))
    );
    assert_eq!(api.object_count(), 0);

    orchestrator
        .handle(&Command::start_job(JobId(52)))
        .await
        .unwrap();
    assert!(api.object_count() > 0);
}

#[tokio::test]
async fn restart_reuses_existing_claims() {
    let (api, store, orchestrator, names) = setup(53);
    orchestrator
        .handle(&Command::start_job(JobId(53)))
        .await
        .unwrap();
    orchestrator
        .handle(&Command::step_error(StepType::StageData, JobId(53), "no such file"))
        .await
        .unwrap();

    let outcome = orchestrator
        .handle(&Command::restart_job(JobId(53)))
        .await
        .unwrap();
    assert_eq!(outcome, HandleOutcome::Applied);
    assert_eq!(
        store.position(JobId(53)),
        Some(JobPosition::new(JobState::Running, JobStep::Staging))
    );
    assert!(api
        .object(ManifestKind::PersistentVolumeClaim, "job-data-53-jpb")
        .is_some());
    assert!(api
        .object(ManifestKind::Job, &names.run(StepType::StageData))
        .is_some());
}

#[tokio::test]
async fn quota_rejection_marks_insufficient_capacity() {
    let (api, store, orchestrator, _) = setup(54);
    api.fail_next_create(BackendError::Capacity {
        resource: "persistentvolumeclaims".into(),
        message: "exceeded quota".into(),
    });

    let outcome = orchestrator
        .handle(&Command::start_job(JobId(54)))
        .await
        .unwrap();
    assert_eq!(outcome, HandleOutcome::JobFailed);
    let error = store.last_error(JobId(54)).unwrap();
    assert_eq!(error.kind, JobErrorKind::InsufficientCapacity);
    assert_eq!(error.step, JobStep::Staging);
}

#[tokio::test]
async fn results_are_read_from_the_newest_pod() {
    let (api, store, orchestrator, names) = setup(55);
    let run = names.run(StepType::SaveOutput);
    orchestrator
        .handle(&Command::start_job(JobId(55)))
        .await
        .unwrap();
    for step in [
        StepType::StageData,
        StepType::RunWorkflow,
        StepType::OrganizeOutput,
    ] {
        orchestrator
            .handle(&Command::step_complete(step, JobId(55), names.run(step)))
            .await
            .unwrap();
    }

    api.add_pod(
        &run,
        "save-output-55-jpb-old",
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        &[(Some("results"), "not json")],
    );
    api.add_pod(
        &run,
        "save-output-55-jpb-new",
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap(),
        &[(Some("results"), &results_manifest("proj-55", "readme-55"))],
    );

    let outcome = orchestrator
        .handle(&Command::step_complete(StepType::SaveOutput, JobId(55), run))
        .await
        .unwrap();
    assert_eq!(outcome, HandleOutcome::Applied);
    assert_eq!(
        store.position(JobId(55)),
        Some(JobPosition::new(JobState::Finished, JobStep::None))
    );
    assert_eq!(
        store.output_location(JobId(55)).unwrap().readme_file_id,
        "readme-55"
    );
    assert!(api
        .object(ManifestKind::PersistentVolumeClaim, "output-data-55-jpb")
        .is_none());
}

#[tokio::test]
async fn watch_maps_job_conditions() {
    let (api, _store, orchestrator, names) = setup(56);
    let backend = orchestrator.backend();
    let mut events = backend.watch_runs(&managed_selector()).await.unwrap();

    orchestrator
        .handle(&Command::start_job(JobId(56)))
        .await
        .unwrap();
    let run = names.run(StepType::StageData);
    api.add_pod(
        &run,
        "stage-data-56-jpb-x1",
        Utc::now(),
        &[(None, "download failed: 404")],
    );
    api.set_job_condition(&run, "Failed");

    let added = timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(added.kind, RunEventKind::Added);
    assert_eq!(added.run.condition, RunCondition::Pending);

    let failed = timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(failed.kind, RunEventKind::Modified);
    assert_eq!(failed.run.condition, RunCondition::Failed);
    assert_eq!(failed.run.name, run);

    let logs = read_run_logs(backend, &run, None).await.unwrap();
    assert_eq!(logs, "download failed: 404");
}

#[tokio::test]
async fn failed_upload_logs_come_from_the_step_container() {
    let (api, _store, orchestrator, names) = setup(57);
    orchestrator
        .handle(&Command::start_job(JobId(57)))
        .await
        .unwrap();
    for step in [
        StepType::StageData,
        StepType::RunWorkflow,
        StepType::OrganizeOutput,
    ] {
        orchestrator
            .handle(&Command::step_complete(step, JobId(57), names.run(step)))
            .await
            .unwrap();
    }
    let run = names.run(StepType::SaveOutput);
    api.add_pod(
        &run,
        "save-output-57-jpb-k2",
        Utc::now(),
        &[
            (Some("save-output"), "upload refused: 403 Forbidden"),
            (Some("results"), ""),
        ],
    );

    let err = read_run_logs(orchestrator.backend(), &run, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Request(_)));

    let broker = InProcBroker::new();
    let watcher = Watcher::new(
        ClusterBackend::new(Arc::new(api.clone()), NAMESPACE),
        StepNotifier::new(Arc::new(broker.connect()), "lando"),
        test_config().watcher,
    );
    let failed = RunEvent {
        kind: RunEventKind::Modified,
        run: RunStatus {
            name: run.clone(),
            labels: names.labels(StepType::SaveOutput),
            condition: RunCondition::Failed,
            reason: None,
        },
    };
    assert_eq!(
        watcher.translate(&failed).await,
        Some(Command::step_error(
            StepType::SaveOutput,
            JobId(57),
            "upload refused: 403 Forbidden"
        ))
    );
}
