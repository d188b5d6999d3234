//! Domain types shared across the circuit build orchestrator.
//!
//! Mirrors the four entities of the build pipeline: `Deployment`, `Job`,
//! `Artifact`, and the transient in-memory `Workspace`. Status and error
//! enums are internally tagged so they round-trip through the Store's
//! JSON columns without an external discriminant.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which kind of upstream event produced this deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
}

/// Deployment lifecycle status. Moves `Pending -> {Ready, Error, Skipped}` and
/// is monotonic: once terminal, never re-opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Ready,
    Error,
    Skipped,
}

impl DeploymentStatus {
    /// Terminal statuses set `build_completed_at`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, DeploymentStatus::Pending)
    }
}

/// Metadata-only summary of a compile run. Per-file payloads live in the
/// `Artifact` table; this is intentionally not a copy of `files[]` (see
/// DESIGN.md, "Snapshot duplication").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub success: bool,
    pub build_time_seconds: f64,
    pub total_source_files: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One request to build a specific revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub deployment_id: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub commit_ref: String,
    pub event_kind: EventKind,
    /// PR number (as string) or branch name, per the event kind.
    pub meta: String,
    pub status: DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_completed_at: Option<DateTime<Utc>>,
    pub total_source_files: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotMeta>,
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(
        deployment_id: impl Into<String>,
        repo_owner: impl Into<String>,
        repo_name: impl Into<String>,
        commit_ref: impl Into<String>,
        event_kind: EventKind,
        meta: impl Into<String>,
    ) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            repo_owner: repo_owner.into(),
            repo_name: repo_name.into(),
            commit_ref: commit_ref.into(),
            event_kind,
            meta: meta.into(),
            status: DeploymentStatus::Pending,
            build_duration_seconds: None,
            build_completed_at: None,
            total_source_files: 0,
            snapshot: None,
            created_at: Utc::now(),
        }
    }

    /// Priority a fresh job for this deployment should enqueue at: PRs run
    /// ahead of pushes.
    pub fn default_priority(&self) -> i32 {
        match self.event_kind {
            EventKind::PullRequest => 1,
            EventKind::Push => 0,
        }
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Opaque build inputs carried on a job: fetch URL, credential handle,
/// and upstream event context. Credentials are handles, never raw
/// secrets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_archive_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_run_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_deployment_id: Option<i64>,
    #[serde(default)]
    pub create_release: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One attempt-capable unit of work realizing a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub deployment_id: String,
    pub status: JobStatus,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub progress: u8,
    #[serde(default)]
    pub logs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Earliest time this `queued` job may be claimed. `None` means
    /// claimable immediately. Set on a retryable requeue to the backoff
    /// bound computed from `retry_count`; this is how backoff is applied
    /// by deferring the re-queue transition rather than by sleeping in
    /// the claimed state (spec §4.6, §9 "Retry bookkeeping").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_not_before: Option<DateTime<Utc>>,
    pub metadata: JobMetadata,
}

impl Job {
    /// `true` if this job's invariants hold for its current status.
    pub fn invariants_hold(&self) -> bool {
        let processing_ok = self.status != JobStatus::Processing
            || (self.worker_id.is_some() && self.started_at.is_some());
        let terminal_ok = !self.status.is_terminal() || self.completed_at.is_some();
        processing_ok && terminal_ok
    }
}

/// One compiled output file attached to a successful job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub job_id: String,
    pub deployment_id: String,
    pub file_name: String,
    pub file_path: String,
    pub file_size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Transient on-disk extraction of a revision, owned by one job attempt.
/// Never persisted; destroyed unconditionally on attempt exit.
#[derive(Debug)]
pub struct Workspace {
    pub root: PathBuf,
    pub job_id: String,
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Common error classification: every component that can fail maps its
/// failure into one of these before the Worker sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request; 400-class at the Ingest boundary.
    Input,
    /// Missing/invalid credential; 401-class.
    Auth,
    /// Archive 404/403, oversized archive, invalid archive.
    NonRetryableFetch,
    /// Network/5xx/store timeouts.
    RetryableTransient,
    /// Compiler returned `success=false`, not otherwise classified non-retryable.
    Compile,
    /// Provider notification failure; logged, never fails the job.
    FinalizeProvider,
    /// Schema/configuration mismatch; process-level startup failure.
    Fatal,
}

impl ErrorKind {
    /// Whether the Worker's state machine should re-queue on this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::RetryableTransient | ErrorKind::Compile)
    }
}
