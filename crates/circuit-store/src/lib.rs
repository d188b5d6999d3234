//! The durable Store: persistence for deployments, jobs, and
//! artifacts, plus the atomic job-claim primitive the rest of the core
//! builds on.
//!
//! `Store` is a narrow, mockable trait; `SqliteStore` is the one real
//! backend. The atomic claim selects a `queued` job and flips it to
//! `processing` inside a single `BEGIN IMMEDIATE` sqlite transaction, so
//! two workers backed by the same file never observe the same queued
//! row.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use circuit_types::{
    Artifact, Deployment, DeploymentStatus, EventKind, Job, JobMetadata, JobStatus, SnapshotMeta,
};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("deployment {0} already exists")]
    DuplicateDeployment(String),
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("deployment {0} not found")]
    DeploymentNotFound(String),
    #[error("store error: {0}")]
    Backend(#[from] rusqlite::Error),
    #[error("store data corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Transient backend failures are retryable; everything else (schema
    /// violations, not-found, duplicate keys) is fatal to the calling
    /// operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Partial update applied to a job row. `None` fields are left untouched.
#[derive(Debug, Default, Clone)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub worker_id: Option<Option<String>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub retry_count: Option<u32>,
    pub error_message: Option<Option<String>>,
    pub retry_not_before: Option<Option<DateTime<Utc>>>,
}

/// Partial update applied to a deployment row.
#[derive(Debug, Default, Clone)]
pub struct DeploymentUpdate {
    pub status: Option<DeploymentStatus>,
    pub build_duration_seconds: Option<f64>,
    pub build_completed_at: Option<DateTime<Utc>>,
    pub total_source_files: Option<u32>,
    pub snapshot: Option<SnapshotMeta>,
}

/// Snapshot of queue occupancy, for read-only diagnostics (`circuit-cli
/// doctor`). Never consulted by the claim/enqueue path itself.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub queued: u64,
    pub processing: u64,
    pub oldest_queued_at: Option<DateTime<Utc>>,
}

/// One job pulled back from `processing` by the lease sweep, carrying the
/// worker id it was claimed under so callers can record who lost it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedLease {
    pub job_id: String,
    pub previous_worker_id: String,
}

/// Durable persistence contract for deployments, jobs, and artifacts.
pub trait Store: Send + Sync {
    fn create_deployment(&self, deployment: &Deployment) -> Result<()>;
    fn insert_job(&self, job: &Job) -> Result<()>;
    fn claim_next_job(&self, worker_id: &str) -> Result<Option<Job>>;
    fn update_job(&self, job_id: &str, update: &JobUpdate) -> Result<()>;
    fn append_job_log(&self, job_id: &str, line: &str) -> Result<()>;
    fn update_deployment(&self, deployment_id: &str, update: &DeploymentUpdate) -> Result<()>;
    fn insert_artifacts(&self, artifacts: &[Artifact]) -> Result<()>;
    fn queued_job_count(&self) -> Result<u64>;
    fn get_job(&self, job_id: &str) -> Result<Option<Job>>;
    fn get_deployment(&self, deployment_id: &str) -> Result<Option<Deployment>>;
    fn artifacts_for_job(&self, job_id: &str) -> Result<Vec<Artifact>>;
    /// Move any job stuck in `processing` past `max_attempt_duration` back
    /// to `queued` with `retry_count` incremented; returns the reclaimed
    /// jobs along with the worker id each was claimed under.
    fn reclaim_expired_leases(&self, max_attempt_duration: Duration) -> Result<Vec<ReclaimedLease>>;
    /// Queued/processing counts plus the oldest still-queued job's
    /// `queued_at`, for `circuit-cli doctor`.
    fn queue_stats(&self) -> Result<QueueStats>;
}

/// sqlite-backed implementation. A single `Mutex<Connection>` serializes
/// access from multiple in-process worker threads; `BEGIN IMMEDIATE`
/// serializes against any other process sharing the same database
/// file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                deployment_id TEXT PRIMARY KEY,
                repo_owner TEXT NOT NULL,
                repo_name TEXT NOT NULL,
                commit_ref TEXT NOT NULL,
                event_kind TEXT NOT NULL,
                meta TEXT NOT NULL,
                status TEXT NOT NULL,
                build_duration_seconds REAL,
                build_completed_at TEXT,
                total_source_files INTEGER NOT NULL DEFAULT 0,
                snapshot TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                deployment_id TEXT NOT NULL REFERENCES deployments(deployment_id),
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                queued_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                worker_id TEXT,
                progress INTEGER NOT NULL DEFAULT 0,
                logs TEXT NOT NULL DEFAULT '',
                error_message TEXT,
                retry_not_before TEXT,
                metadata TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, priority DESC, queued_at ASC);
            CREATE TABLE IF NOT EXISTS artifacts (
                artifact_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(job_id),
                deployment_id TEXT NOT NULL,
                file_name TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_size_bytes INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
        let status: String = row.get("status")?;
        let metadata_json: String = row.get("metadata")?;
        Ok(Job {
            job_id: row.get("job_id")?,
            deployment_id: row.get("deployment_id")?,
            status: job_status_from_str(&status),
            priority: row.get("priority")?,
            queued_at: parse_ts(row.get::<_, String>("queued_at")?),
            started_at: row.get::<_, Option<String>>("started_at")?.map(parse_ts),
            completed_at: row.get::<_, Option<String>>("completed_at")?.map(parse_ts),
            retry_count: row.get::<_, i64>("retry_count")? as u32,
            worker_id: row.get("worker_id")?,
            progress: row.get::<_, i64>("progress")? as u8,
            logs: row.get("logs")?,
            error_message: row.get("error_message")?,
            retry_not_before: row.get::<_, Option<String>>("retry_not_before")?.map(parse_ts),
            metadata: serde_json::from_str::<JobMetadata>(&metadata_json)
                .unwrap_or_default(),
        })
    }

    fn row_to_deployment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Deployment> {
        let status: String = row.get("status")?;
        let event_kind: String = row.get("event_kind")?;
        let snapshot_json: Option<String> = row.get("snapshot")?;
        Ok(Deployment {
            deployment_id: row.get("deployment_id")?,
            repo_owner: row.get("repo_owner")?,
            repo_name: row.get("repo_name")?,
            commit_ref: row.get("commit_ref")?,
            event_kind: event_kind_from_str(&event_kind),
            meta: row.get("meta")?,
            status: deployment_status_from_str(&status),
            build_duration_seconds: row.get("build_duration_seconds")?,
            build_completed_at: row
                .get::<_, Option<String>>("build_completed_at")?
                .map(parse_ts),
            total_source_files: row.get::<_, i64>("total_source_files")? as u32,
            snapshot: snapshot_json
                .and_then(|s| serde_json::from_str::<SnapshotMeta>(&s).ok()),
            created_at: parse_ts(row.get::<_, String>("created_at")?),
        })
    }

    fn row_to_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Artifact> {
        let payload: String = row.get("payload")?;
        Ok(Artifact {
            artifact_id: row.get("artifact_id")?,
            job_id: row.get("job_id")?,
            deployment_id: row.get("deployment_id")?,
            file_name: row.get("file_name")?,
            file_path: row.get("file_path")?,
            file_size_bytes: row.get::<_, i64>("file_size_bytes")? as u64,
            created_at: parse_ts(row.get::<_, String>("created_at")?),
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        })
    }
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn job_status_to_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "queued",
        JobStatus::Processing => "processing",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

fn job_status_from_str(s: &str) -> JobStatus {
    match s {
        "processing" => JobStatus::Processing,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        _ => JobStatus::Queued,
    }
}

fn deployment_status_to_str(status: DeploymentStatus) -> &'static str {
    match status {
        DeploymentStatus::Pending => "pending",
        DeploymentStatus::Ready => "ready",
        DeploymentStatus::Error => "error",
        DeploymentStatus::Skipped => "skipped",
    }
}

fn deployment_status_from_str(s: &str) -> DeploymentStatus {
    match s {
        "ready" => DeploymentStatus::Ready,
        "error" => DeploymentStatus::Error,
        "skipped" => DeploymentStatus::Skipped,
        _ => DeploymentStatus::Pending,
    }
}

fn event_kind_to_str(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Push => "push",
        EventKind::PullRequest => "pull_request",
    }
}

fn event_kind_from_str(s: &str) -> EventKind {
    match s {
        "pull_request" => EventKind::PullRequest,
        _ => EventKind::Push,
    }
}

impl Store for SqliteStore {
    fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let existing: Option<String> = conn
            .query_row(
                "SELECT deployment_id FROM deployments WHERE deployment_id = ?1",
                params![deployment.deployment_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(StoreError::DuplicateDeployment(deployment.deployment_id.clone()));
        }

        conn.execute(
            "INSERT INTO deployments (deployment_id, repo_owner, repo_name, commit_ref, event_kind, meta, status, build_duration_seconds, build_completed_at, total_source_files, snapshot, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                deployment.deployment_id,
                deployment.repo_owner,
                deployment.repo_name,
                deployment.commit_ref,
                event_kind_to_str(deployment.event_kind),
                deployment.meta,
                deployment_status_to_str(deployment.status),
                deployment.build_duration_seconds,
                deployment.build_completed_at.map(|t| t.to_rfc3339()),
                deployment.total_source_files,
                deployment.snapshot.as_ref().map(|s| serde_json::to_string(s).unwrap_or_default()),
                deployment.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn insert_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO jobs (job_id, deployment_id, status, priority, queued_at, started_at, completed_at, retry_count, worker_id, progress, logs, error_message, retry_not_before, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                job.job_id,
                job.deployment_id,
                job_status_to_str(job.status),
                job.priority,
                job.queued_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
                job.retry_count,
                job.worker_id,
                job.progress,
                job.logs,
                job.error_message,
                job.retry_not_before.map(|t| t.to_rfc3339()),
                serde_json::to_string(&job.metadata).unwrap_or_default(),
            ],
        )?;
        Ok(())
    }

    fn claim_next_job(&self, worker_id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let now = Utc::now().to_rfc3339();
        // A job with a future `retry_not_before` is a requeued retry still
        // serving its backoff; it stays invisible to claim until that time
        // passes. This is the "defer the re-queue transition, don't sleep
        // in the claimed state" mechanism from the Worker's retry policy.
        let job_id: Option<String> = tx
            .query_row(
                "SELECT job_id FROM jobs WHERE status = 'queued'
                 AND (retry_not_before IS NULL OR retry_not_before <= ?1)
                 ORDER BY priority DESC, queued_at ASC LIMIT 1",
                params![now],
                |row| row.get(0),
            )
            .optional()?;

        let Some(job_id) = job_id else {
            tx.commit()?;
            return Ok(None);
        };

        let affected = tx.execute(
            "UPDATE jobs SET status = 'processing', worker_id = ?1, started_at = ?2, progress = 0
             WHERE job_id = ?3 AND status = 'queued'",
            params![worker_id, now, job_id],
        )?;
        if affected == 0 {
            // Claimed by someone else between the SELECT and UPDATE inside
            // this same transaction cannot happen under BEGIN IMMEDIATE,
            // but guard it anyway rather than assume.
            tx.commit()?;
            return Ok(None);
        }

        let job = tx.query_row("SELECT * FROM jobs WHERE job_id = ?1", params![job_id], |row| {
            Self::row_to_job(row)
        })?;
        tx.commit()?;
        Ok(Some(job))
    }

    fn update_job(&self, job_id: &str, update: &JobUpdate) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut sets = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = update.status {
            sets.push("status = ?");
            values.push(Box::new(job_status_to_str(status).to_string()));
        }
        if let Some(progress) = update.progress {
            sets.push("progress = ?");
            values.push(Box::new(progress));
        }
        if let Some(worker_id) = &update.worker_id {
            sets.push("worker_id = ?");
            values.push(Box::new(worker_id.clone()));
        }
        if let Some(started_at) = &update.started_at {
            sets.push("started_at = ?");
            values.push(Box::new(started_at.map(|t| t.to_rfc3339())));
        }
        if let Some(completed_at) = &update.completed_at {
            sets.push("completed_at = ?");
            values.push(Box::new(completed_at.map(|t| t.to_rfc3339())));
        }
        if let Some(retry_count) = update.retry_count {
            sets.push("retry_count = ?");
            values.push(Box::new(retry_count));
        }
        if let Some(error_message) = &update.error_message {
            sets.push("error_message = ?");
            values.push(Box::new(error_message.clone()));
        }
        if let Some(retry_not_before) = &update.retry_not_before {
            sets.push("retry_not_before = ?");
            values.push(Box::new(retry_not_before.map(|t| t.to_rfc3339())));
        }

        if sets.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "UPDATE jobs SET {} WHERE job_id = ?",
            sets.join(", ")
        );
        values.push(Box::new(job_id.to_string()));

        let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let affected = conn.execute(&sql, params.as_slice())?;
        if affected == 0 {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    fn append_job_log(&self, job_id: &str, line: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let stamped = format!("{} {}\n", Utc::now().to_rfc3339(), line);
        let affected = conn.execute(
            "UPDATE jobs SET logs = logs || ?1 WHERE job_id = ?2",
            params![stamped, job_id],
        )?;
        if affected == 0 {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    fn update_deployment(&self, deployment_id: &str, update: &DeploymentUpdate) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut sets = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = update.status {
            sets.push("status = ?");
            values.push(Box::new(deployment_status_to_str(status).to_string()));
        }
        if let Some(seconds) = update.build_duration_seconds {
            sets.push("build_duration_seconds = ?");
            values.push(Box::new(seconds));
        }
        if let Some(completed_at) = update.build_completed_at {
            sets.push("build_completed_at = ?");
            values.push(Box::new(completed_at.to_rfc3339()));
        }
        if let Some(files) = update.total_source_files {
            sets.push("total_source_files = ?");
            values.push(Box::new(files));
        }
        if let Some(snapshot) = &update.snapshot {
            sets.push("snapshot = ?");
            values.push(Box::new(serde_json::to_string(snapshot).unwrap_or_default()));
        }

        if sets.is_empty() {
            return Ok(());
        }

        let sql = format!("UPDATE deployments SET {} WHERE deployment_id = ?", sets.join(", "));
        values.push(Box::new(deployment_id.to_string()));
        let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let affected = conn.execute(&sql, params.as_slice())?;
        if affected == 0 {
            return Err(StoreError::DeploymentNotFound(deployment_id.to_string()));
        }
        Ok(())
    }

    fn insert_artifacts(&self, artifacts: &[Artifact]) -> Result<()> {
        if artifacts.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        for artifact in artifacts {
            tx.execute(
                "INSERT INTO artifacts (artifact_id, job_id, deployment_id, file_name, file_path, file_size_bytes, created_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    artifact.artifact_id,
                    artifact.job_id,
                    artifact.deployment_id,
                    artifact.file_name,
                    artifact.file_path,
                    artifact.file_size_bytes,
                    artifact.created_at.to_rfc3339(),
                    serde_json::to_string(&artifact.payload).unwrap_or_default(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn queued_job_count(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'queued'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let job = conn
            .query_row("SELECT * FROM jobs WHERE job_id = ?1", params![job_id], |row| {
                Self::row_to_job(row)
            })
            .optional()?;
        Ok(job)
    }

    fn get_deployment(&self, deployment_id: &str) -> Result<Option<Deployment>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let deployment = conn
            .query_row(
                "SELECT * FROM deployments WHERE deployment_id = ?1",
                params![deployment_id],
                |row| Self::row_to_deployment(row),
            )
            .optional()?;
        Ok(deployment)
    }

    fn artifacts_for_job(&self, job_id: &str) -> Result<Vec<Artifact>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare("SELECT * FROM artifacts WHERE job_id = ?1")?;
        let rows = stmt.query_map(params![job_id], |row| Self::row_to_artifact(row))?;
        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(row?);
        }
        Ok(artifacts)
    }

    fn reclaim_expired_leases(&self, max_attempt_duration: Duration) -> Result<Vec<ReclaimedLease>> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let cutoff = (Utc::now() - chrono::Duration::from_std(max_attempt_duration)
            .unwrap_or(chrono::Duration::zero()))
        .to_rfc3339();

        let mut stmt = tx.prepare(
            "SELECT job_id, worker_id FROM jobs WHERE status = 'processing' AND started_at < ?1",
        )?;
        let stuck: Vec<ReclaimedLease> = stmt
            .query_map(params![cutoff], |row| {
                Ok(ReclaimedLease {
                    job_id: row.get(0)?,
                    previous_worker_id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<ReclaimedLease>>>()?;
        drop(stmt);

        for lease in &stuck {
            tx.execute(
                "UPDATE jobs SET status = 'queued', worker_id = NULL, started_at = NULL,
                 retry_count = retry_count + 1, progress = 0
                 WHERE job_id = ?1",
                params![lease.job_id],
            )?;
        }
        tx.commit()?;
        Ok(stuck)
    }

    fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let queued: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'queued'",
            [],
            |row| row.get(0),
        )?;
        let processing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'processing'",
            [],
            |row| row.get(0),
        )?;
        let oldest_queued_at: Option<String> = conn
            .query_row(
                "SELECT queued_at FROM jobs WHERE status = 'queued' ORDER BY queued_at ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(QueueStats {
            queued: queued as u64,
            processing: processing as u64,
            oldest_queued_at: oldest_queued_at.map(parse_ts),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use circuit_types::EventKind as EK;
    use std::thread;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().expect("open")
    }

    fn sample_deployment(id: &str, kind: EK) -> Deployment {
        Deployment::new(id, "owner", "repo", "sha", kind, "main")
    }

    fn sample_job(deployment_id: &str, job_id: &str, priority: i32) -> Job {
        Job {
            job_id: job_id.to_string(),
            deployment_id: deployment_id.to_string(),
            status: JobStatus::Queued,
            priority,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            worker_id: None,
            progress: 0,
            logs: String::new(),
            error_message: None,
            retry_not_before: None,
            metadata: JobMetadata::default(),
        }
    }

    #[test]
    fn create_deployment_rejects_duplicate_id() {
        let store = store();
        let d = sample_deployment("d1", EK::Push);
        store.create_deployment(&d).expect("first insert");
        let err = store.create_deployment(&d).expect_err("duplicate should fail");
        assert!(matches!(err, StoreError::DuplicateDeployment(id) if id == "d1"));
    }

    #[test]
    fn claim_next_job_respects_priority_then_fifo() {
        let store = store();
        store.create_deployment(&sample_deployment("d_push", EK::Push)).unwrap();
        store.create_deployment(&sample_deployment("d_pr", EK::PullRequest)).unwrap();

        // Push enqueued first (earlier queued_at) but lower priority.
        let mut push_job = sample_job("d_push", "j_push", 0);
        push_job.queued_at = Utc::now() - chrono::Duration::seconds(10);
        store.insert_job(&push_job).unwrap();

        let pr_job = sample_job("d_pr", "j_pr", 1);
        store.insert_job(&pr_job).unwrap();

        let claimed = store.claim_next_job("worker-1").unwrap().expect("a job");
        assert_eq!(claimed.job_id, "j_pr");
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
        assert!(claimed.started_at.is_some());
    }

    #[test]
    fn claim_next_job_returns_none_when_empty() {
        let store = store();
        assert!(store.claim_next_job("worker-1").unwrap().is_none());
    }

    #[test]
    fn claim_next_job_skips_jobs_scheduled_in_the_future() {
        let store = store();
        store.create_deployment(&sample_deployment("d1", EK::Push)).unwrap();

        let mut deferred = sample_job("d1", "j_deferred", 0);
        deferred.retry_not_before = Some(Utc::now() + chrono::Duration::hours(1));
        store.insert_job(&deferred).unwrap();

        assert!(store.claim_next_job("worker-1").unwrap().is_none());

        store
            .update_job(
                "j_deferred",
                &JobUpdate { retry_not_before: Some(Some(Utc::now() - chrono::Duration::seconds(1))), ..Default::default() },
            )
            .unwrap();

        let claimed = store.claim_next_job("worker-1").unwrap().expect("now due");
        assert_eq!(claimed.job_id, "j_deferred");
    }

    #[test]
    fn claimed_jobs_are_never_claimed_twice_across_threads() {
        let store = std::sync::Arc::new(store());
        store.create_deployment(&sample_deployment("d1", EK::Push)).unwrap();
        for i in 0..20 {
            store.insert_job(&sample_job("d1", &format!("j{i}"), 0)).unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|w| {
                let store = store.clone();
                thread::spawn(move || {
                    let mut claimed = Vec::new();
                    loop {
                        match store.claim_next_job(&format!("worker-{w}")).unwrap() {
                            Some(job) => claimed.push(job.job_id),
                            None => break,
                        }
                    }
                    claimed
                })
            })
            .collect();

        let mut all_claimed: Vec<String> = Vec::new();
        for h in handles {
            all_claimed.extend(h.join().unwrap());
        }

        let mut sorted = all_claimed.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), all_claimed.len(), "no job claimed twice");
        assert_eq!(all_claimed.len(), 20);
    }

    #[test]
    fn append_job_log_accumulates_without_read_modify_write() {
        let store = store();
        store.create_deployment(&sample_deployment("d1", EK::Push)).unwrap();
        store.insert_job(&sample_job("d1", "j1", 0)).unwrap();

        store.append_job_log("j1", "fetching").unwrap();
        store.append_job_log("j1", "compiling").unwrap();

        let job = store.get_job("j1").unwrap().expect("job");
        assert!(job.logs.contains("fetching"));
        assert!(job.logs.contains("compiling"));
        assert!(job.logs.find("fetching").unwrap() < job.logs.find("compiling").unwrap());
    }

    #[test]
    fn update_job_partial_fields_leaves_others_untouched() {
        let store = store();
        store.create_deployment(&sample_deployment("d1", EK::Push)).unwrap();
        store.insert_job(&sample_job("d1", "j1", 0)).unwrap();

        store
            .update_job("j1", &JobUpdate { progress: Some(42), ..Default::default() })
            .unwrap();

        let job = store.get_job("j1").unwrap().expect("job");
        assert_eq!(job.progress, 42);
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn reclaim_expired_leases_requeues_stuck_jobs_with_incremented_retry() {
        let store = store();
        store.create_deployment(&sample_deployment("d1", EK::Push)).unwrap();
        store.insert_job(&sample_job("d1", "j1", 0)).unwrap();

        let claimed = store.claim_next_job("worker-1").unwrap().expect("claimed");
        assert_eq!(claimed.job_id, "j1");

        // Backdate started_at to simulate a stuck job.
        store
            .update_job(
                "j1",
                &JobUpdate {
                    started_at: Some(Some(Utc::now() - chrono::Duration::hours(1))),
                    ..Default::default()
                },
            )
            .unwrap();

        let reclaimed = store.reclaim_expired_leases(Duration::from_secs(60)).unwrap();
        assert_eq!(
            reclaimed,
            vec![ReclaimedLease { job_id: "j1".to_string(), previous_worker_id: "worker-1".to_string() }]
        );

        let job = store.get_job("j1").unwrap().expect("job");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert!(job.worker_id.is_none());
    }

    #[test]
    fn insert_artifacts_is_all_or_nothing_per_batch() {
        let store = store();
        store.create_deployment(&sample_deployment("d1", EK::Push)).unwrap();
        store.insert_job(&sample_job("d1", "j1", 0)).unwrap();

        let artifacts = vec![
            Artifact {
                artifact_id: "a1".into(),
                job_id: "j1".into(),
                deployment_id: "d1".into(),
                file_name: "x.circuit.tsx.json".into(),
                file_path: "x.circuit.tsx".into(),
                file_size_bytes: 10,
                created_at: Utc::now(),
                payload: serde_json::json!({"ok": true}),
            },
            Artifact {
                artifact_id: "a2".into(),
                job_id: "j1".into(),
                deployment_id: "d1".into(),
                file_name: "y.circuit.tsx.json".into(),
                file_path: "y.circuit.tsx".into(),
                file_size_bytes: 20,
                created_at: Utc::now(),
                payload: serde_json::json!({"ok": true}),
            },
        ];
        store.insert_artifacts(&artifacts).unwrap();

        let loaded = store.artifacts_for_job("j1").unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn queued_job_count_excludes_processing_and_terminal_jobs() {
        let store = store();
        store.create_deployment(&sample_deployment("d1", EK::Push)).unwrap();
        store.insert_job(&sample_job("d1", "j1", 0)).unwrap();
        store.insert_job(&sample_job("d1", "j2", 0)).unwrap();
        assert_eq!(store.queued_job_count().unwrap(), 2);

        store.claim_next_job("worker-1").unwrap();
        assert_eq!(store.queued_job_count().unwrap(), 1);
    }

    #[test]
    fn queue_stats_reports_queued_processing_and_oldest() {
        let store = store();
        store.create_deployment(&sample_deployment("d1", EK::Push)).unwrap();
        store.insert_job(&sample_job("d1", "j1", 0)).unwrap();
        store.insert_job(&sample_job("d1", "j2", 0)).unwrap();

        let stats = store.queue_stats().unwrap();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.processing, 0);
        assert!(stats.oldest_queued_at.is_some());

        store.claim_next_job("worker-1").unwrap();
        let stats = store.queue_stats().unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.processing, 1);
    }

    #[test]
    fn queue_stats_reports_none_when_empty() {
        let store = store();
        let stats = store.queue_stats().unwrap();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.processing, 0);
        assert!(stats.oldest_queued_at.is_none());
    }
}
