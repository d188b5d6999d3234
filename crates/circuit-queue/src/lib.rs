//! JobQueue: priority-queue semantics over the [`circuit_store::Store`].
//!
//! A thin wrapper that turns "insert a row" into "enqueue a unit of work",
//! with no actor-mailbox machinery: this repo's concurrency model is
//! `std::thread`, so there is no push/notify message, just a plain poll
//! loop owned by the Worker (see `circuit-worker`). Polling is the model
//! by default, since the backing store is a single sqlite file with no
//! LISTEN/NOTIFY equivalent.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use circuit_store::{ReclaimedLease, Store};
use circuit_types::{Job, JobMetadata, JobStatus};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] circuit_store::StoreError),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Priority job queue over a shared [`Store`]. Cheap to clone (an `Arc`
/// handle plus a local id counter); constructed once and handed to each
/// Ingest handler and each Worker as an explicit dependency rather than
/// a process-wide singleton.
pub struct JobQueue {
    store: Arc<dyn Store>,
    id_seq: AtomicU64,
}

impl JobQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, id_seq: AtomicU64::new(0) }
    }

    /// Inserts a `queued` row for `deployment_id` at `priority` and
    /// signals the worker loop. There is no push/notify mechanism beyond
    /// the row itself; the Worker's poll loop picks it up on its next
    /// `claim_next_job`.
    pub fn enqueue(&self, deployment_id: &str, metadata: JobMetadata, priority: i32) -> Result<String> {
        let queued_at = Utc::now();
        let seq = self.id_seq.fetch_add(1, Ordering::Relaxed);
        let job_id = generate_job_id(deployment_id, seq, queued_at);

        let job = Job {
            job_id: job_id.clone(),
            deployment_id: deployment_id.to_string(),
            status: JobStatus::Queued,
            priority,
            queued_at,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            worker_id: None,
            progress: 0,
            logs: String::new(),
            error_message: None,
            retry_not_before: None,
            metadata,
        };
        self.store.insert_job(&job)?;
        Ok(job_id)
    }

    pub fn status(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.store.get_job(job_id)?)
    }

    pub fn queued_count(&self) -> Result<u64> {
        Ok(self.store.queued_job_count()?)
    }

    /// Approximate 1-indexed position a freshly enqueued job would be
    /// claimed at, counting every row currently `queued` (including
    /// itself). Exact ordering is priority-desc then FIFO; this is good
    /// enough for the Ingest API's informational `queuePosition` field,
    /// not a claim guarantee.
    pub fn queue_position(&self) -> Result<u64> {
        self.queued_count()
    }

    /// Claim-and-lease protocol, for the Worker loop only — the Ingest
    /// API and status queries must never call this.
    pub fn claim_next(&self, worker_id: &str) -> Result<Option<Job>> {
        Ok(self.store.claim_next_job(worker_id)?)
    }

    /// Lease-reclaim sweep: the Worker loop calls this immediately before
    /// each `claim_next`, never on its own schedule.
    pub fn reclaim_expired_leases(&self, max_attempt_duration: Duration) -> Result<Vec<ReclaimedLease>> {
        Ok(self.store.reclaim_expired_leases(max_attempt_duration)?)
    }
}

/// Deterministic, collision-resistant job id: a sha256 digest of the
/// deployment id, a monotonic per-process sequence number, and the
/// enqueue timestamp, hex-encoded. Grounded in `plan.rs::compute_plan_id`
/// — this codebase's idiom for ids is "hash the inputs", not a random
/// UUID generator.
fn generate_job_id(deployment_id: &str, seq: u64, queued_at: chrono::DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(deployment_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(seq.to_le_bytes());
    hasher.update(b"\n");
    hasher.update(queued_at.to_rfc3339().as_bytes());
    let digest = hasher.finalize();
    format!("job_{}", hex::encode(&digest[..12]))
}
