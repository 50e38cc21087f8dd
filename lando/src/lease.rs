use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::job::JobId;

/// Unique identifier for a job lease.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    /// Create a new lease ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who holds a job and since when.
#[derive(Clone, Debug)]
pub struct LeaseHolder {
    pub lease_id: LeaseId,
    pub consumer_id: String,
    pub acquired_at: DateTime<Utc>,
}

/// Per-job exclusive leases shared by the consumers of one runtime.
///
/// At most one consumer handles a given job id at a time. Leases are
/// released when their [`JobLease`] guard is dropped.
#[derive(Clone, Debug, Default)]
pub struct JobLeaseTable {
    held: Arc<Mutex<HashMap<JobId, LeaseHolder>>>,
}

impl JobLeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease `job_id` for `consumer_id`, or `None` if another consumer
    /// already holds it.
    pub fn try_acquire(
        &self,
        job_id: JobId,
        consumer_id: &str,
    ) -> Option<JobLease> {
        let mut held = self.held.lock();
        if held.contains_key(&job_id) {
            return None;
        }
        let lease_id = LeaseId::new();
        held.insert(
            job_id,
            LeaseHolder {
                lease_id,
                consumer_id: consumer_id.to_string(),
                acquired_at: Utc::now(),
            },
        );
        Some(JobLease {
            job_id,
            lease_id,
            table: self.clone(),
        })
    }

    pub fn holder(&self, job_id: JobId) -> Option<LeaseHolder> {
        self.held.lock().get(&job_id).cloned()
    }

    pub fn is_leased(&self, job_id: JobId) -> bool {
        self.held.lock().contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }

    fn release(&self, job_id: JobId, lease_id: LeaseId) {
        let mut held = self.held.lock();
        if held.get(&job_id).map(|h| h.lease_id) == Some(lease_id) {
            held.remove(&job_id);
        }
    }
}

/// Exclusive hold on one job id.
#[derive(Debug)]
pub struct JobLease {
    job_id: JobId,
    lease_id: LeaseId,
    table: JobLeaseTable,
}

impl JobLease {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        self.table.release(self.job_id, self.lease_id);
    }
}
