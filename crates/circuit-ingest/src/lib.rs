//! Ingest API adapter: the boundary between an upstream webhook
//! payload and the build pipeline. Single responsibility: validate a
//! request, create a `Deployment` row, enqueue a `Job`, hand back
//! `{deployment_id, job_id, queue_position}`.
//!
//! This crate never reads raw HTTP bytes or JSON off a socket; `circuit-cli`
//! deserializes the wire request and hands this crate an already-parsed
//! [`IngestRequest`].

use std::sync::Arc;

use circuit_queue::JobQueue;
use circuit_store::Store;
use circuit_types::{Deployment, EventKind, JobMetadata};
use serde::{Deserialize, Serialize};

/// Upstream webhook context carried alongside the core fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestContext {
    #[serde(rename = "serverUrl")]
    pub server_url: String,
    #[serde(rename = "runId")]
    pub run_id: String,
    pub sha: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A validated build request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub id: String,
    pub owner: String,
    pub repo: String,
    #[serde(rename = "ref")]
    pub commit_ref: String,
    pub environment: String,
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub meta: String,
    pub context: IngestContext,
    #[serde(rename = "deploymentId")]
    pub deployment_id: i64,
    #[serde(rename = "checkRunId", skip_serializing_if = "Option::is_none")]
    pub check_run_id: Option<i64>,
    #[serde(default)]
    pub create_release: bool,
    #[serde(rename = "repoArchiveUrl", skip_serializing_if = "Option::is_none")]
    pub repo_archive_url: Option<String>,
}

/// Response to a successful ingest.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub deployment_id: String,
    pub job_id: String,
    pub status: &'static str,
    pub queue_position: u64,
    pub message: String,
}

/// Response to a status query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub job_id: String,
    pub status: circuit_types::JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("unsupported eventType '{0}', expected 'push' or 'pull_request'")]
    UnknownEventKind(String),
    #[error("deployment id '{0}' exceeds 36 characters")]
    DeploymentIdTooLong(String),
    #[error("missing credential for caller")]
    MissingCredential,
    #[error("job '{0}' not found")]
    JobNotFound(String),
    #[error(transparent)]
    Store(#[from] circuit_store::StoreError),
    #[error(transparent)]
    Queue(#[from] circuit_queue::QueueError),
}

impl IngestError {
    /// 400 for malformed input, 401 for a missing credential, 500 for a
    /// persistence failure.
    pub fn error_kind(&self) -> circuit_types::ErrorKind {
        match self {
            IngestError::UnknownEventKind(_) | IngestError::DeploymentIdTooLong(_) => {
                circuit_types::ErrorKind::Input
            }
            IngestError::MissingCredential => circuit_types::ErrorKind::Auth,
            IngestError::JobNotFound(_) => circuit_types::ErrorKind::Input,
            IngestError::Store(_) | IngestError::Queue(_) => circuit_types::ErrorKind::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

const MAX_DEPLOYMENT_ID_LEN: usize = 36;

fn parse_event_kind(event_type: &str) -> Result<EventKind> {
    match event_type {
        "push" => Ok(EventKind::Push),
        "pull_request" => Ok(EventKind::PullRequest),
        other => Err(IngestError::UnknownEventKind(other.to_string())),
    }
}

/// Validates and admits one build request: creates the `Deployment` row
/// (status `pending`) and enqueues its `Job` at the priority its event
/// kind implies. `credential` is the caller's resolved provider credential
/// handle, extracted upstream of this adapter; no authentication
/// middleware lives here, only the check that a handle was supplied.
pub fn ingest(
    store: &Arc<dyn Store>,
    queue: &JobQueue,
    request: IngestRequest,
    credential: Option<String>,
) -> Result<IngestResponse> {
    if request.id.len() > MAX_DEPLOYMENT_ID_LEN {
        return Err(IngestError::DeploymentIdTooLong(request.id));
    }
    let event_kind = parse_event_kind(&request.event_type)?;
    let credential = credential.ok_or(IngestError::MissingCredential)?;

    let deployment = Deployment::new(
        request.id.clone(),
        request.owner,
        request.repo,
        request.commit_ref,
        event_kind,
        request.meta,
    );
    store.create_deployment(&deployment)?;

    let metadata = JobMetadata {
        repo_archive_url: request.repo_archive_url,
        credential_handle: Some(credential),
        check_run_id: request.check_run_id,
        upstream_deployment_id: Some(request.deployment_id),
        create_release: request.create_release,
        commit_message: request.context.message,
        extra: serde_json::Map::new(),
    };

    let priority = deployment.default_priority();
    let job_id = queue.enqueue(&deployment.deployment_id, metadata, priority)?;
    let queue_position = queue.queue_position()?;

    Ok(IngestResponse {
        deployment_id: deployment.deployment_id,
        job_id,
        status: "queued",
        queue_position,
        message: "build queued".to_string(),
    })
}

/// Current job state plus an
/// approximate queue position, valid only while the job is still queued.
pub fn status(queue: &JobQueue, job_id: &str) -> Result<StatusResponse> {
    let job = queue
        .status(job_id)?
        .ok_or_else(|| IngestError::JobNotFound(job_id.to_string()))?;

    let queue_position = if job.status == circuit_types::JobStatus::Queued {
        Some(queue.queue_position()?)
    } else {
        None
    };

    Ok(StatusResponse {
        job_id: job.job_id,
        status: job.status,
        progress: job.progress,
        message: if job.logs.is_empty() { None } else { Some(job.logs) },
        started_at: job.started_at,
        completed_at: job.completed_at,
        error_message: job.error_message,
        queue_position,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use circuit_store::SqliteStore;

    fn setup() -> (Arc<dyn Store>, JobQueue) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().expect("open"));
        let queue = JobQueue::new(Arc::clone(&store));
        (store, queue)
    }

    fn sample_request(id: &str, event_type: &str) -> IngestRequest {
        IngestRequest {
            id: id.to_string(),
            owner: "acme".to_string(),
            repo: "widgets".to_string(),
            commit_ref: "abc123".to_string(),
            environment: "production".to_string(),
            event_type: event_type.to_string(),
            meta: "main".to_string(),
            context: IngestContext {
                server_url: "https://ci.example.com".to_string(),
                run_id: "run-1".to_string(),
                sha: "abc123".to_string(),
                message: Some("fix: widget alignment".to_string()),
            },
            deployment_id: 42,
            check_run_id: Some(7),
            create_release: false,
            repo_archive_url: Some("https://example.com/archive.tar.gz".to_string()),
        }
    }

    #[test]
    fn push_request_queues_at_priority_zero() {
        let (store, queue) = setup();
        let response = ingest(
            &store,
            &queue,
            sample_request("d1", "push"),
            Some("tok".to_string()),
        )
        .expect("ingest");

        assert_eq!(response.deployment_id, "d1");
        assert_eq!(response.status, "queued");
        assert_eq!(response.queue_position, 1);

        let job = queue.status(&response.job_id).unwrap().expect("job");
        assert_eq!(job.priority, 0);
        assert_eq!(job.metadata.check_run_id, Some(7));
        assert_eq!(job.metadata.commit_message.as_deref(), Some("fix: widget alignment"));
    }

    #[test]
    fn pull_request_queues_at_priority_one() {
        let (store, queue) = setup();
        let response = ingest(
            &store,
            &queue,
            sample_request("d2", "pull_request"),
            Some("tok".to_string()),
        )
        .expect("ingest");

        let job = queue.status(&response.job_id).unwrap().expect("job");
        assert_eq!(job.priority, 1);
    }

    #[test]
    fn unknown_event_kind_is_rejected_as_input_error() {
        let (store, queue) = setup();
        let err = ingest(&store, &queue, sample_request("d3", "tag"), Some("tok".to_string()))
            .expect_err("should reject");
        assert!(matches!(err, IngestError::UnknownEventKind(ref s) if s == "tag"));
        assert_eq!(err.error_kind(), circuit_types::ErrorKind::Input);
    }

    #[test]
    fn missing_credential_is_rejected_as_auth_error() {
        let (store, queue) = setup();
        let err = ingest(&store, &queue, sample_request("d4", "push"), None).expect_err("should reject");
        assert!(matches!(err, IngestError::MissingCredential));
        assert_eq!(err.error_kind(), circuit_types::ErrorKind::Auth);
    }

    #[test]
    fn oversized_deployment_id_is_rejected() {
        let (store, queue) = setup();
        let long_id = "d".repeat(40);
        let err = ingest(&store, &queue, sample_request(&long_id, "push"), Some("tok".to_string()))
            .expect_err("should reject");
        assert!(matches!(err, IngestError::DeploymentIdTooLong(_)));
    }

    #[test]
    fn status_reports_queue_position_while_queued() {
        let (store, queue) = setup();
        let response = ingest(&store, &queue, sample_request("d5", "push"), Some("tok".to_string()))
            .expect("ingest");

        let status = status(&queue, &response.job_id).expect("status");
        assert_eq!(status.status, circuit_types::JobStatus::Queued);
        assert_eq!(status.queue_position, Some(1));
    }

    #[test]
    fn status_for_unknown_job_is_rejected() {
        let (_store, queue) = setup();
        let err = status(&queue, "nope").expect_err("should reject");
        assert!(matches!(err, IngestError::JobNotFound(_)));
    }
}
