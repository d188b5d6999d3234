//! ProviderClient: deployment-status, check-run, review-comment, and
//! tag/ref notifications sent to the upstream code-hosting provider.
//!
//! HTTP plumbing uses a blocking `reqwest::Client`, JSON payloads built
//! with `serde_json::json!`, and `StatusCode` match arms splitting
//! retryable network/5xx failures from non-retryable 4xx ones. Every
//! method takes a credential handle per call; nothing here reads ambient
//! process state.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider rejected request: {status} {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl ProviderError {
    /// 4xx is non-retryable (bad credential, missing resource, already
    /// exists); everything else (network, 5xx) is retryable. Finalize
    /// callers never propagate this as job failure regardless, but the
    /// distinction still matters for logging.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Rejected { status, .. } => status.is_server_error(),
            ProviderError::Network(_) => true,
            ProviderError::Decode(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Identifies the repository a call targets.
#[derive(Debug, Clone)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentState {
    Success,
    Failure,
    Error,
    Pending,
}

impl DeploymentState {
    fn as_str(self) -> &'static str {
        match self {
            DeploymentState::Success => "success",
            DeploymentState::Failure => "failure",
            DeploymentState::Error => "error",
            DeploymentState::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckConclusion {
    Success,
    Failure,
}

impl CheckConclusion {
    fn as_str(self) -> &'static str {
        match self {
            CheckConclusion::Success => "success",
            CheckConclusion::Failure => "failure",
        }
    }
}

/// Provider notification capability set. Each method is independent: a
/// failure in one must never prevent the Worker from attempting the others.
pub trait ProviderClient: Send + Sync {
    fn create_deployment_status(
        &self,
        credential: &str,
        repo: &RepoRef,
        deployment_id: i64,
        state: DeploymentState,
        description: &str,
    ) -> Result<()>;

    fn create_check_run(
        &self,
        credential: &str,
        repo: &RepoRef,
        commit_ref: &str,
        name: &str,
    ) -> Result<i64>;

    fn update_check_run(
        &self,
        credential: &str,
        repo: &RepoRef,
        check_run_id: i64,
        conclusion: CheckConclusion,
        summary: &str,
    ) -> Result<()>;

    fn post_review_comment(
        &self,
        credential: &str,
        repo: &RepoRef,
        pr_number: &str,
        body: &str,
    ) -> Result<()>;

    fn get_latest_tag(&self, credential: &str, repo: &RepoRef) -> Result<Option<String>>;

    fn create_tag(
        &self,
        credential: &str,
        repo: &RepoRef,
        tag: &str,
        target_sha: &str,
        message: &str,
    ) -> Result<()>;

    fn create_ref(
        &self,
        credential: &str,
        repo: &RepoRef,
        ref_name: &str,
        sha: &str,
    ) -> Result<()>;
}

/// Blocking HTTP implementation against a REST-shaped provider API.
/// `api_base` is combined with `{owner}`/`{repo}` path segments per call,
/// with the credential carried in the `Authorization` header.
pub struct HttpProviderClient {
    http: Client,
    api_base: String,
}

impl HttpProviderClient {
    pub fn new(api_base: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("circuit-ci/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, api_base: api_base.into() })
    }

    fn repo_url(&self, repo: &RepoRef, suffix: &str) -> String {
        format!("{}/repos/{}/{}{}", self.api_base, repo.owner, repo.repo, suffix)
    }

    fn classify(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().unwrap_or_default();
        Err(ProviderError::Rejected { status, body })
    }
}

impl ProviderClient for HttpProviderClient {
    fn create_deployment_status(
        &self,
        credential: &str,
        repo: &RepoRef,
        deployment_id: i64,
        state: DeploymentState,
        description: &str,
    ) -> Result<()> {
        let url = self.repo_url(repo, &format!("/deployments/{deployment_id}/statuses"));
        let response = self
            .http
            .post(&url)
            .header("Authorization", credential)
            .json(&json!({ "state": state.as_str(), "description": description }))
            .send()?;
        Self::classify(response)?;
        Ok(())
    }

    fn create_check_run(
        &self,
        credential: &str,
        repo: &RepoRef,
        commit_ref: &str,
        name: &str,
    ) -> Result<i64> {
        let url = self.repo_url(repo, "/check-runs");
        let response = self
            .http
            .post(&url)
            .header("Authorization", credential)
            .json(&json!({ "head_sha": commit_ref, "name": name, "status": "in_progress" }))
            .send()?;
        let response = Self::classify(response)?;
        let body: serde_json::Value =
            response.json().map_err(|e| ProviderError::Decode(e.to_string()))?;
        body["id"]
            .as_i64()
            .ok_or_else(|| ProviderError::Decode("missing check run id in response".to_string()))
    }

    fn update_check_run(
        &self,
        credential: &str,
        repo: &RepoRef,
        check_run_id: i64,
        conclusion: CheckConclusion,
        summary: &str,
    ) -> Result<()> {
        let url = self.repo_url(repo, &format!("/check-runs/{check_run_id}"));
        let response = self
            .http
            .patch(&url)
            .header("Authorization", credential)
            .json(&json!({
                "status": "completed",
                "conclusion": conclusion.as_str(),
                "output": { "summary": summary },
            }))
            .send()?;
        Self::classify(response)?;
        Ok(())
    }

    fn post_review_comment(
        &self,
        credential: &str,
        repo: &RepoRef,
        pr_number: &str,
        body: &str,
    ) -> Result<()> {
        let url = self.repo_url(repo, &format!("/issues/{pr_number}/comments"));
        let response = self
            .http
            .post(&url)
            .header("Authorization", credential)
            .json(&json!({ "body": body }))
            .send()?;
        Self::classify(response)?;
        Ok(())
    }

    fn get_latest_tag(&self, credential: &str, repo: &RepoRef) -> Result<Option<String>> {
        let url = self.repo_url(repo, "/tags?per_page=1");
        let response = self.http.get(&url).header("Authorization", credential).send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::classify(response)?;
        let body: serde_json::Value =
            response.json().map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(body
            .as_array()
            .and_then(|tags| tags.first())
            .and_then(|t| t["name"].as_str())
            .map(str::to_string))
    }

    fn create_tag(
        &self,
        credential: &str,
        repo: &RepoRef,
        tag: &str,
        target_sha: &str,
        message: &str,
    ) -> Result<()> {
        let url = self.repo_url(repo, "/git/tags");
        let response = self
            .http
            .post(&url)
            .header("Authorization", credential)
            .json(&json!({
                "tag": tag,
                "message": message,
                "object": target_sha,
                "type": "commit",
            }))
            .send()?;
        Self::classify(response)?;
        Ok(())
    }

    fn create_ref(
        &self,
        credential: &str,
        repo: &RepoRef,
        ref_name: &str,
        sha: &str,
    ) -> Result<()> {
        let url = self.repo_url(repo, "/git/refs");
        let response = self
            .http
            .post(&url)
            .header("Authorization", credential)
            .json(&json!({ "ref": ref_name, "sha": sha }))
            .send()?;
        Self::classify(response)?;
        Ok(())
    }
}

/// Parses `vMAJOR.MINOR.PATCH` or `MAJOR.MINOR.PATCH`. Returns `None` if
/// the tag doesn't match that shape.
fn parse_semver(tag: &str) -> Option<(u64, u64, u64)> {
    let stripped = tag.strip_prefix('v').unwrap_or(tag);
    let mut parts = stripped.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

/// Computes the next tag given the latest tag (or `None` for a fresh
/// repo, which starts at `v0.1.0`) and the triggering commit message.
/// Rule: `[major]`/`BREAKING CHANGE` in the message bumps major;
/// `[minor]`/a `feat:` prefix bumps minor; otherwise bump patch.
pub fn next_semver(latest_tag: Option<&str>, commit_message: &str) -> String {
    let (major, minor, patch) = latest_tag.and_then(parse_semver).unwrap_or((0, 0, 0));

    let (next_major, next_minor, next_patch) =
        if commit_message.contains("[major]") || commit_message.contains("BREAKING CHANGE") {
            (major + 1, 0, 0)
        } else if commit_message.contains("[minor]") || commit_message.starts_with("feat:") {
            (major, minor + 1, 0)
        } else {
            (major, minor, patch + 1)
        };

    format!("v{next_major}.{next_minor}.{next_patch}")
}

/// Formats a PR review comment linking each artifact's download URL.
/// `download_url_for` maps a file name to its artifact download URL.
pub fn format_review_comment(
    success: bool,
    total_source_files: u32,
    artifact_names: &[String],
    download_url_for: impl Fn(&str) -> String,
) -> String {
    let mut body = if success {
        format!("Build succeeded — {total_source_files} source file(s) compiled.\n\n")
    } else {
        "Build failed.\n\n".to_string()
    };

    if !artifact_names.is_empty() {
        body.push_str("Artifacts:\n");
        for name in artifact_names {
            body.push_str(&format!("- [{name}]({})\n", download_url_for(name)));
        }
    }

    body
}
