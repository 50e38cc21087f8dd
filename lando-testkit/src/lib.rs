//! Test support for lando: an in-memory execution backend and record store,
//! fakes for the cluster and cloud SDK seams, and job fixtures.

pub mod backend;
pub mod job;
pub mod mock;
pub mod store;

pub use backend::{BackendCall, BackendOp, InMemoryBackend, StoredRun};
pub use job::{
    job_at, results_manifest, sample_credentials, sample_input_files,
    sample_job, sample_share_targets, test_config, zipped_job, TEST_CONFIG,
};
pub use mock::{FakeCloudApi, FakeClusterApi};
pub use store::InMemoryJobStore;
