//! Benchmarks for the hot paths of command handling using criterion.
//!
//! These benchmarks measure the performance of:
//! - Command encoding and decoding on the inbox queue
//! - Step plan construction for each pipeline step
//! - Backend manifest rendering for a workflow run

#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use lando::backend::cluster::job_manifest;
use lando::job::{JobId, StepType};
use lando::message::Command;
use lando::steps::{cleanup_all, StepBuilder};
use lando::store::{InputFiles, RemoteFile};
use lando::ResourceNames;
use lando_testkit::{sample_credentials, sample_job, sample_share_targets, test_config};

fn input_files(count: usize) -> InputFiles {
    InputFiles {
        remote_files: (0..count)
            .map(|i| RemoteFile {
                file_id: format!("file-{i:05}"),
                destination_path: format!("inputs/sample_{i}.fastq.gz"),
            })
            .collect(),
    }
}

fn bench_command_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_codec");
    group.sample_size(100);

    let small = Command::start_job(JobId(51));
    let error = Command::step_error(
        StepType::RunWorkflow,
        JobId(51),
        "Traceback (most recent call last):\n".repeat(200),
    );

    for (name, command) in [("start_job", &small), ("run_job_error", &error)] {
        let encoded = command.encode().unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_function(format!("encode/{name}"), |b| {
            b.iter(|| black_box(command).encode().unwrap())
        });
        group.bench_function(format!("decode/{name}"), |b| {
            b.iter(|| Command::decode(black_box(&encoded)).unwrap())
        });
    }

    group.finish();
}

fn bench_step_plans(c: &mut Criterion) {
    let mut group = c.benchmark_group("step_plans");
    group.sample_size(100);

    let config = test_config();
    let job = sample_job(51);
    let builder = StepBuilder::new(&config, &job);
    let credentials = sample_credentials();
    let targets = sample_share_targets();
    let methods = "# Methods\n".repeat(50);

    for files in [1, 100, 1000] {
        let inputs = input_files(files);
        group.throughput(Throughput::Elements(files as u64));
        group.bench_function(format!("stage_data/{files}_files"), |b| {
            b.iter(|| builder.stage_data(black_box(&inputs), &credentials).unwrap())
        });
    }
    group.throughput(Throughput::Elements(1));
    group.bench_function("run_workflow", |b| b.iter(|| builder.run_workflow()));
    group.bench_function("organize_output", |b| {
        b.iter(|| builder.organize_output(black_box(&methods)).unwrap())
    });
    group.bench_function("save_output", |b| {
        b.iter(|| builder.save_output(&targets, &credentials).unwrap())
    });
    group.bench_function("cleanup_all", |b| {
        let names = ResourceNames::new(job.id, &job.username);
        b.iter(|| cleanup_all(black_box(&names)))
    });

    group.finish();
}

fn bench_manifest_render(c: &mut Criterion) {
    let config = test_config();
    let job = sample_job(51);
    let plan = StepBuilder::new(&config, &job).run_workflow();

    c.bench_function("job_manifest/run_workflow", |b| {
        b.iter(|| job_manifest(&plan.run_name, black_box(&plan.spec), &plan.labels))
    });
}

criterion_group!(
    benches,
    bench_command_codec,
    bench_step_plans,
    bench_manifest_render
);
criterion_main!(benches);
