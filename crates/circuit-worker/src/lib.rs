//! Worker: the per-attempt build lifecycle state machine.
//!
//! Coordinates RevisionFetcher, CircuitCompiler, and ProviderClient
//! around a claimed [`Job`], following the progress
//! anchors and retry/backoff policy for a build attempt. The overall
//! shape — run a sequence of steps each independently fallible, record
//! an event per step, write the event log once at the end — keeps the
//! `Reporter` trait as the single sink for human-readable progress.
//! Retries are a first-class re-queue transition on the Store rather
//! than a loop inside one call.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use circuit_compiler::{CircuitCompiler, CompileError, Snapshot};
use circuit_events::{BuildEvent, EventKind as BuildEventKind, EventLog};
use circuit_fetch::{FetchRequest, RevisionFetcher};
use circuit_provider::{CheckConclusion, DeploymentState, ProviderClient, RepoRef};
use circuit_queue::JobQueue;
use circuit_store::{DeploymentUpdate, JobUpdate, Store};
use circuit_types::{Artifact, Deployment, DeploymentStatus, ErrorKind, EventKind, Job, JobStatus, SnapshotMeta};

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Worker-tunable limits, resolved from `circuit_config::Config` by the
/// CLI before constructing a [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub max_attempt_duration: Duration,
    pub idle_poll_interval: Duration,
    pub workspace_root: PathBuf,
    /// Credential used when a job carries none of its own.
    pub bot_credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Completed,
    Retried { backoff_ms: u64 },
    Failed,
}

pub struct Worker {
    store: Arc<dyn Store>,
    queue: JobQueue,
    fetcher: RevisionFetcher,
    compiler: CircuitCompiler,
    provider: Arc<dyn ProviderClient>,
    config: WorkerConfig,
    events_path: Option<PathBuf>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn Store>,
        queue: JobQueue,
        fetcher: RevisionFetcher,
        compiler: CircuitCompiler,
        provider: Arc<dyn ProviderClient>,
        config: WorkerConfig,
        events_path: Option<PathBuf>,
    ) -> Self {
        Self { store, queue, fetcher, compiler, provider, config, events_path }
    }

    /// Reclaims expired leases, then claims and fully runs one job
    /// attempt if one is available. Returns `Ok(None)` on an empty queue.
    pub fn run_once(&self, worker_id: &str, reporter: &mut dyn Reporter) -> anyhow::Result<Option<AttemptOutcome>> {
        let reclaimed = self.queue.reclaim_expired_leases(self.config.max_attempt_duration)?;
        if !reclaimed.is_empty() {
            let mut events = EventLog::new();
            for lease in &reclaimed {
                reporter.warn(&format!("[{}] lease expired, requeued by sweep", lease.job_id));
                events.record(event(
                    &lease.job_id,
                    BuildEventKind::LeaseReclaimed { previous_worker_id: lease.previous_worker_id.clone() },
                ));
            }
            self.flush_events(&mut events)?;
        }

        match self.queue.claim_next(worker_id)? {
            Some(job) => Ok(Some(self.run_attempt(job, reporter)?)),
            None => Ok(None),
        }
    }

    /// Runs the claim loop until `shutdown` is set, idling for
    /// `idle_poll_interval` between empty polls.
    pub fn run_forever(
        &self,
        worker_id: &str,
        reporter: &mut dyn Reporter,
        shutdown: &AtomicBool,
    ) -> anyhow::Result<()> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            if self.run_once(worker_id, reporter)?.is_none() {
                std::thread::sleep(self.config.idle_poll_interval);
            }
        }
    }

    fn run_attempt(&self, job: Job, reporter: &mut dyn Reporter) -> anyhow::Result<AttemptOutcome> {
        let mut events = EventLog::new();
        let job_id = job.job_id.clone();
        let worker_id = job.worker_id.clone().unwrap_or_default();

        reporter.info(&format!("[{job_id}] claimed by {worker_id}"));
        events.record(event(&job_id, BuildEventKind::JobClaimed { worker_id }));

        self.store.update_job(&job_id, &JobUpdate { progress: Some(5), ..Default::default() })?;
        self.store.append_job_log(&job_id, "worker initialized")?;

        let deployment = self
            .store
            .get_deployment(&job.deployment_id)?
            .ok_or_else(|| anyhow::anyhow!("deployment {} missing for job {job_id}", job.deployment_id))?;

        events.record(event(&job_id, BuildEventKind::FetchStarted));
        let fetch_request = FetchRequest {
            repo_owner: deployment.repo_owner.clone(),
            repo_name: deployment.repo_name.clone(),
            commit_ref: deployment.commit_ref.clone(),
            credential_handle: job.metadata.credential_handle.clone().unwrap_or_default(),
            explicit_archive_url: job.metadata.repo_archive_url.clone(),
        };

        let workspace = match self.fetcher.fetch(&fetch_request, &self.config.workspace_root, &job_id) {
            Ok(ws) => ws,
            Err(e) => {
                let kind = e.error_kind();
                return self.handle_step_error(&job, &deployment, kind, e.to_string(), &mut events, reporter);
            }
        };

        events.record(event(&job_id, BuildEventKind::FetchCompleted { bytes: 0 }));
        self.store.update_job(&job_id, &JobUpdate { progress: Some(20), ..Default::default() })?;
        self.store.append_job_log(&job_id, "fetch complete")?;

        let store_for_progress = Arc::clone(&self.store);
        let job_id_for_progress = job_id.clone();
        let compile_result = self.compiler.compile(&workspace.root, |p, msg| {
            let scaled = scale_compile_progress(p);
            let _ = store_for_progress.update_job(
                &job_id_for_progress,
                &JobUpdate { progress: Some(scaled), ..Default::default() },
            );
            let _ = store_for_progress.append_job_log(&job_id_for_progress, msg);
        });
        // `workspace` stays alive through compile and artifact persist;
        // its Drop impl removes the directory unconditionally once it
        // goes out of scope at the end of this function.

        let snapshot = match compile_result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let (kind, message) = classify_compile_error(&e);
                return self.handle_step_error(&job, &deployment, kind, message, &mut events, reporter);
            }
        };

        if !snapshot.success {
            let message = snapshot.error.clone().unwrap_or_else(|| "compile failed".to_string());
            let kind = classify_compile_message(&message);
            return self.handle_step_error(&job, &deployment, kind, message, &mut events, reporter);
        }

        events.record(event(
            &job_id,
            BuildEventKind::CompileCompleted { files: snapshot.files.len(), success: true },
        ));
        self.store.update_job(&job_id, &JobUpdate { progress: Some(90), ..Default::default() })?;
        self.store.append_job_log(&job_id, "compile complete")?;

        let artifacts = build_artifacts(&job_id, &deployment.deployment_id, &snapshot);
        if let Err(e) = self.store.insert_artifacts(&artifacts) {
            return self.handle_step_error(
                &job,
                &deployment,
                ErrorKind::RetryableTransient,
                e.to_string(),
                &mut events,
                reporter,
            );
        }
        events.record(event(&job_id, BuildEventKind::ArtifactsPersisted { count: artifacts.len() }));
        self.store.update_job(&job_id, &JobUpdate { progress: Some(95), ..Default::default() })?;

        self.complete_job(&job, &deployment, &snapshot, &mut events, reporter)?;
        Ok(AttemptOutcome::Completed)
    }

    fn handle_step_error(
        &self,
        job: &Job,
        deployment: &Deployment,
        kind: ErrorKind,
        message: String,
        events: &mut EventLog,
        reporter: &mut dyn Reporter,
    ) -> anyhow::Result<AttemptOutcome> {
        if kind.is_retryable() && job.retry_count < self.config.max_retries {
            let backoff_ms = self.requeue_with_backoff(job, &message, events, reporter)?;
            Ok(AttemptOutcome::Retried { backoff_ms })
        } else {
            self.fail_job(job, deployment, &message, events, reporter)?;
            Ok(AttemptOutcome::Failed)
        }
    }

    /// Defers the `processing -> queued` transition by the configured
    /// backoff bound instead of sleeping while the job is still claimed:
    /// the job is requeued immediately with `retry_not_before` set, so
    /// `Store::claim_next_job` skips it until the backoff has elapsed.
    /// Resets `progress` to 0, since progress may reset on re-queue.
    fn requeue_with_backoff(
        &self,
        job: &Job,
        message: &str,
        events: &mut EventLog,
        reporter: &mut dyn Reporter,
    ) -> anyhow::Result<u64> {
        let backoff_ms =
            circuit_retry::backoff_ms(job.retry_count, self.config.backoff_base_ms, self.config.backoff_cap_ms);
        reporter.warn(&format!("[{}] retrying in {backoff_ms}ms: {message}", job.job_id));
        self.store.append_job_log(&job.job_id, &format!("retry scheduled: {message}"))?;

        let retry_not_before = Utc::now() + chrono::Duration::from_std(Duration::from_millis(backoff_ms))
            .unwrap_or(chrono::Duration::milliseconds(i64::MAX));

        let next_retry_count = job.retry_count + 1;
        self.store.update_job(
            &job.job_id,
            &JobUpdate {
                status: Some(JobStatus::Queued),
                worker_id: Some(None),
                started_at: Some(None),
                progress: Some(0),
                retry_count: Some(next_retry_count),
                error_message: Some(Some(message.to_string())),
                retry_not_before: Some(Some(retry_not_before)),
                ..Default::default()
            },
        )?;
        events.record(event(
            &job.job_id,
            BuildEventKind::JobRetried { retry_count: next_retry_count, backoff_ms },
        ));
        self.flush_events(events)?;
        Ok(backoff_ms)
    }

    fn fail_job(
        &self,
        job: &Job,
        deployment: &Deployment,
        message: &str,
        events: &mut EventLog,
        reporter: &mut dyn Reporter,
    ) -> anyhow::Result<()> {
        reporter.error(&format!("[{}] failed: {message}", job.job_id));
        self.store.append_job_log(&job.job_id, &format!("job failed: {message}"))?;
        self.store.update_job(
            &job.job_id,
            &JobUpdate {
                status: Some(JobStatus::Failed),
                completed_at: Some(Some(Utc::now())),
                error_message: Some(Some(message.to_string())),
                progress: Some(100),
                ..Default::default()
            },
        )?;
        events.record(event(&job.job_id, BuildEventKind::JobFailed { message: message.to_string() }));

        self.finalize(job, deployment, None, false, Some(message), events, reporter);
        self.flush_events(events)?;
        Ok(())
    }

    fn complete_job(
        &self,
        job: &Job,
        deployment: &Deployment,
        snapshot: &Snapshot,
        events: &mut EventLog,
        reporter: &mut dyn Reporter,
    ) -> anyhow::Result<()> {
        reporter.info(&format!("[{}] completed", job.job_id));
        self.store.append_job_log(&job.job_id, "job completed")?;
        self.store.update_job(
            &job.job_id,
            &JobUpdate {
                status: Some(JobStatus::Completed),
                completed_at: Some(Some(Utc::now())),
                progress: Some(100),
                error_message: Some(None),
                ..Default::default()
            },
        )?;
        events.record(event(&job.job_id, BuildEventKind::JobCompleted));

        self.finalize(job, deployment, Some(snapshot), true, None, events, reporter);
        self.flush_events(events)?;
        Ok(())
    }

    /// Finalize: update the deployment row, then send every provider
    /// notification independently — each call is wrapped so one failure
    /// never prevents the rest, and none of them can turn a
    /// `completed`/`failed` job back into anything else.
    fn finalize(
        &self,
        job: &Job,
        deployment: &Deployment,
        snapshot: Option<&Snapshot>,
        success: bool,
        error_message: Option<&str>,
        events: &mut EventLog,
        reporter: &mut dyn Reporter,
    ) {
        let total_files = snapshot.map(|s| s.files.len() as u32).unwrap_or(deployment.total_source_files);
        let build_time = snapshot.map(|s| s.build_time_seconds).unwrap_or(0.0);
        let meta = SnapshotMeta {
            success,
            build_time_seconds: build_time,
            total_source_files: total_files,
            error: error_message.map(str::to_string),
        };
        let status = if success { DeploymentStatus::Ready } else { DeploymentStatus::Error };

        if let Err(e) = self.store.update_deployment(
            &deployment.deployment_id,
            &DeploymentUpdate {
                status: Some(status),
                build_duration_seconds: Some(build_time),
                build_completed_at: Some(Utc::now()),
                total_source_files: Some(total_files),
                snapshot: Some(meta),
            },
        ) {
            reporter.error(&format!("[{}] failed to persist deployment finalize: {e}", job.job_id));
        }

        let credential = job
            .metadata
            .credential_handle
            .clone()
            .or_else(|| self.config.bot_credential.clone())
            .unwrap_or_default();
        let repo = RepoRef { owner: deployment.repo_owner.clone(), repo: deployment.repo_name.clone() };

        if let Some(upstream_deployment_id) = job.metadata.upstream_deployment_id {
            let state = if success { DeploymentState::Success } else { DeploymentState::Failure };
            let description = error_message.unwrap_or("build completed").to_string();
            self.notify("deployment_status", &job.job_id, events, reporter, || {
                self.provider.create_deployment_status(&credential, &repo, upstream_deployment_id, state, &description)
            });
        }

        if deployment.event_kind == EventKind::PullRequest {
            let artifact_names: Vec<String> = snapshot
                .map(|s| s.files.iter().map(|f| format!("{}.json", f.name)).collect())
                .unwrap_or_default();
            let body = circuit_provider::format_review_comment(success, total_files, &artifact_names, |name| {
                format!("artifact://{}/{}", job.job_id, name)
            });
            self.notify("review_comment", &job.job_id, events, reporter, || {
                self.provider.post_review_comment(&credential, &repo, &deployment.meta, &body)
            });
        }

        if let Some(check_run_id) = job.metadata.check_run_id {
            let conclusion = if success { CheckConclusion::Success } else { CheckConclusion::Failure };
            let summary = error_message.unwrap_or("build completed").to_string();
            self.notify("check_run_update", &job.job_id, events, reporter, || {
                self.provider.update_check_run(&credential, &repo, check_run_id, conclusion, &summary)
            });
        }

        let targets_release_branch = matches!(deployment.meta.as_str(), "main" | "master");
        if success && deployment.event_kind == EventKind::Push && targets_release_branch && job.metadata.create_release
        {
            self.finalize_release(job, deployment, &credential, &repo, events, reporter);
        }
    }

    fn finalize_release(
        &self,
        job: &Job,
        deployment: &Deployment,
        credential: &str,
        repo: &RepoRef,
        events: &mut EventLog,
        reporter: &mut dyn Reporter,
    ) {
        let latest = match self.provider.get_latest_tag(credential, repo) {
            Ok(latest) => latest,
            Err(e) => {
                reporter.warn(&format!("[{}] unable to read latest tag: {e}", job.job_id));
                return;
            }
        };
        let commit_message = job.metadata.commit_message.clone().unwrap_or_default();
        let tag = circuit_provider::next_semver(latest.as_deref(), &commit_message);
        let tag_message = format!("Release {tag}");

        self.notify("create_tag", &job.job_id, events, reporter, || {
            self.provider.create_tag(credential, repo, &tag, &deployment.commit_ref, &tag_message)
        });
        self.notify("create_ref", &job.job_id, events, reporter, || {
            self.provider.create_ref(credential, repo, &format!("refs/tags/{tag}"), &deployment.commit_ref)
        });
    }

    fn notify(
        &self,
        capability: &str,
        job_id: &str,
        events: &mut EventLog,
        reporter: &mut dyn Reporter,
        call: impl FnOnce() -> circuit_provider::Result<()>,
    ) {
        match call() {
            Ok(()) => {
                events.record(event(
                    job_id,
                    BuildEventKind::ProviderNotified { capability: capability.to_string(), ok: true },
                ));
            }
            Err(e) => {
                reporter.warn(&format!("[{job_id}] provider {capability} notification failed: {e}"));
                let _ = self.store.append_job_log(job_id, &format!("provider {capability} failed: {e}"));
                events.record(event(
                    job_id,
                    BuildEventKind::ProviderNotified { capability: capability.to_string(), ok: false },
                ));
            }
        }
    }

    fn flush_events(&self, events: &mut EventLog) -> anyhow::Result<()> {
        if let Some(path) = &self.events_path {
            events.write_to_file(path)?;
            events.clear();
        }
        Ok(())
    }
}

fn event(job_id: &str, kind: BuildEventKind) -> BuildEvent {
    BuildEvent { timestamp: Utc::now(), job_id: job_id.to_string(), kind }
}

/// Maps `circuit_compiler`'s 0-100 sub-progress into this attempt's
/// 20-90 progress band: `20 + floor(70*compiler_progress/100)`.
fn scale_compile_progress(compiler_progress: u8) -> u8 {
    20u8.saturating_add(((70u32 * compiler_progress as u32) / 100) as u8)
}

fn build_artifacts(job_id: &str, deployment_id: &str, snapshot: &Snapshot) -> Vec<Artifact> {
    snapshot
        .files
        .iter()
        .map(|f| Artifact {
            artifact_id: artifact_id(job_id, &f.path),
            job_id: job_id.to_string(),
            deployment_id: deployment_id.to_string(),
            file_name: f.name.clone(),
            file_path: f.path.clone(),
            file_size_bytes: f.metadata.size,
            created_at: Utc::now(),
            payload: f.output_json.clone(),
        })
        .collect()
}

fn artifact_id(job_id: &str, path: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(job_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    format!("artifact_{}", hex::encode(&hasher.finalize()[..12]))
}

/// Compiler `Runner` failures and workspace-discovery failures are
/// distinguished the same way a "compile error" is split from "retryable
/// transient": a failed spawn/walk is an environment hiccup, a runner
/// message is classified by content exactly like a fetch failure.
fn classify_compile_error(e: &CompileError) -> (ErrorKind, String) {
    match e {
        CompileError::Discovery(msg) => (ErrorKind::RetryableTransient, msg.clone()),
        CompileError::Runner(msg) => (classify_compile_message(msg), msg.clone()),
        CompileError::Io(err) => (ErrorKind::RetryableTransient, err.to_string()),
    }
}

/// A compile failure is non-retryable only if its message names one of
/// these markers; otherwise it's an ordinary retryable `Compile` error.
fn classify_compile_message(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    let non_retryable = ["404", "403", "private", "invalid archive"];
    if non_retryable.iter().any(|marker| lower.contains(marker)) {
        ErrorKind::NonRetryableFetch
    } else {
        ErrorKind::Compile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use circuit_compiler::{CompileRequest, CompileRunner};
    use circuit_provider::RepoRef as PRepoRef;
    use circuit_store::SqliteStore;
    use circuit_types::{EventKind as EK, JobMetadata};
    use std::sync::Mutex;
    use std::thread;
    use tiny_http::{Response, Server};

    struct AlwaysOkRunner;
    impl CompileRunner for AlwaysOkRunner {
        fn compile(&self, _req: &CompileRequest<'_>, _timeout: Duration) -> circuit_compiler::Result<serde_json::Value> {
            Ok(serde_json::json!({"ok": true}))
        }
    }

    #[derive(Default)]
    struct RecordingProvider {
        calls: Mutex<Vec<String>>,
        fail_check_run_update: bool,
    }

    impl ProviderClient for RecordingProvider {
        fn create_deployment_status(
            &self,
            _credential: &str,
            _repo: &PRepoRef,
            _deployment_id: i64,
            _state: DeploymentState,
            _description: &str,
        ) -> circuit_provider::Result<()> {
            self.calls.lock().unwrap().push("deployment_status".to_string());
            Ok(())
        }

        fn create_check_run(
            &self,
            _credential: &str,
            _repo: &PRepoRef,
            _commit_ref: &str,
            _name: &str,
        ) -> circuit_provider::Result<i64> {
            Ok(1)
        }

        fn update_check_run(
            &self,
            _credential: &str,
            _repo: &PRepoRef,
            _check_run_id: i64,
            _conclusion: CheckConclusion,
            _summary: &str,
        ) -> circuit_provider::Result<()> {
            self.calls.lock().unwrap().push("check_run_update".to_string());
            if self.fail_check_run_update {
                return Err(circuit_provider::ProviderError::Rejected {
                    status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                    body: "boom".to_string(),
                });
            }
            Ok(())
        }

        fn post_review_comment(
            &self,
            _credential: &str,
            _repo: &PRepoRef,
            _pr_number: &str,
            _body: &str,
        ) -> circuit_provider::Result<()> {
            self.calls.lock().unwrap().push("review_comment".to_string());
            Ok(())
        }

        fn get_latest_tag(&self, _credential: &str, _repo: &PRepoRef) -> circuit_provider::Result<Option<String>> {
            Ok(Some("v1.2.3".to_string()))
        }

        fn create_tag(
            &self,
            _credential: &str,
            _repo: &PRepoRef,
            _tag: &str,
            _target_sha: &str,
            _message: &str,
        ) -> circuit_provider::Result<()> {
            self.calls.lock().unwrap().push("create_tag".to_string());
            Ok(())
        }

        fn create_ref(
            &self,
            _credential: &str,
            _repo: &PRepoRef,
            _ref_name: &str,
            _sha: &str,
        ) -> circuit_provider::Result<()> {
            self.calls.lock().unwrap().push("create_ref".to_string());
            Ok(())
        }
    }

    struct NoopReporter;
    impl Reporter for NoopReporter {
        fn info(&mut self, _msg: &str) {}
        fn warn(&mut self, _msg: &str) {}
        fn error(&mut self, _msg: &str) {}
    }

    fn with_server<F>(handler: F) -> (String, thread::JoinHandle<()>)
    where
        F: FnOnce(tiny_http::Request) + Send + 'static,
    {
        let server = Server::http("127.0.0.1:0").expect("server");
        let addr = format!("http://{}", server.server_addr());
        let handle = thread::spawn(move || {
            let req = server.recv().expect("request");
            handler(req);
        });
        (addr, handle)
    }

    fn gzip_tarball(files: &[(&str, &str)]) -> Vec<u8> {
        use std::io::Write;
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, name, content.as_bytes()).unwrap();
        }
        let tar_bytes = builder.into_inner().unwrap();
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn config(workspace_root: &std::path::Path) -> WorkerConfig {
        WorkerConfig {
            max_retries: 3,
            backoff_base_ms: 1,
            backoff_cap_ms: 5,
            max_attempt_duration: Duration::from_secs(1200),
            idle_poll_interval: Duration::from_millis(10),
            workspace_root: workspace_root.to_path_buf(),
            bot_credential: Some("bot-token".to_string()),
        }
    }

    fn worker(
        api_base: &str,
        provider: Arc<dyn ProviderClient>,
        workspace_root: &std::path::Path,
    ) -> (Worker, Arc<dyn Store>, JobQueue) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let queue = JobQueue::new(Arc::clone(&store));
        let fetcher = RevisionFetcher::new(format!("{api_base}/{{owner}}/{{repo}}/{{ref}}"), 10 * 1024 * 1024).unwrap();
        let compiler = CircuitCompiler::new(Box::new(AlwaysOkRunner), Duration::from_secs(5));
        let worker = Worker::new(
            Arc::clone(&store),
            JobQueue::new(Arc::clone(&store)),
            fetcher,
            compiler,
            provider,
            config(workspace_root),
            None,
        );
        (worker, store, queue)
    }

    #[test]
    fn happy_path_push_completes_with_artifacts_and_notifications() {
        let body = gzip_tarball(&[("src/a.circuit.tsx", "export {}")]);
        let (api_base, handle) = with_server(move |req| {
            req.respond(Response::from_data(body)).unwrap();
        });

        let ws_root = tempfile::tempdir().unwrap();
        let provider = Arc::new(RecordingProvider::default());
        let (worker, store, queue) = worker(&api_base, provider.clone(), ws_root.path());

        store
            .create_deployment(&Deployment::new("d1", "o", "r", "abc", EK::Push, "main"))
            .unwrap();
        let job_id = queue
            .enqueue(
                "d1",
                JobMetadata { credential_handle: Some("tok".into()), upstream_deployment_id: Some(42), ..Default::default() },
                0,
            )
            .unwrap();

        let mut reporter = NoopReporter;
        let outcome = worker.run_once("worker-1", &mut reporter).unwrap().expect("a job ran");
        assert_eq!(outcome, AttemptOutcome::Completed);

        let job = store.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);

        let deployment = store.get_deployment("d1").unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Ready);
        assert_eq!(deployment.total_source_files, 1);

        let artifacts = store.artifacts_for_job(&job_id).unwrap();
        assert_eq!(artifacts.len(), 1);

        assert!(provider.calls.lock().unwrap().contains(&"deployment_status".to_string()));
        handle.join().unwrap();
    }

    #[test]
    fn empty_workspace_completes_with_zero_artifacts_and_no_release() {
        let body = gzip_tarball(&[]);
        let (api_base, handle) = with_server(move |req| {
            req.respond(Response::from_data(body)).unwrap();
        });

        let ws_root = tempfile::tempdir().unwrap();
        let provider = Arc::new(RecordingProvider::default());
        let (worker, store, queue) = worker(&api_base, provider.clone(), ws_root.path());

        store
            .create_deployment(&Deployment::new("d1", "o", "r", "abc", EK::Push, "main"))
            .unwrap();
        let job_id = queue
            .enqueue("d1", JobMetadata { create_release: true, ..Default::default() }, 0)
            .unwrap();

        let mut reporter = NoopReporter;
        worker.run_once("worker-1", &mut reporter).unwrap();

        let deployment = store.get_deployment("d1").unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Ready);
        assert_eq!(deployment.total_source_files, 0);
        assert!(store.artifacts_for_job(&job_id).unwrap().is_empty());
        assert!(!provider.calls.lock().unwrap().contains(&"create_tag".to_string()));
        handle.join().unwrap();
    }

    #[test]
    fn release_to_main_creates_tag_and_ref_after_completion() {
        let body = gzip_tarball(&[("a.circuit.tsx", "x")]);
        let (api_base, handle) = with_server(move |req| {
            req.respond(Response::from_data(body)).unwrap();
        });

        let ws_root = tempfile::tempdir().unwrap();
        let provider = Arc::new(RecordingProvider::default());
        let (worker, store, queue) = worker(&api_base, provider.clone(), ws_root.path());

        store
            .create_deployment(&Deployment::new("d1", "o", "r", "abc", EK::Push, "main"))
            .unwrap();
        queue
            .enqueue(
                "d1",
                JobMetadata { create_release: true, commit_message: Some("feat: widget".into()), ..Default::default() },
                0,
            )
            .unwrap();

        let mut reporter = NoopReporter;
        worker.run_once("worker-1", &mut reporter).unwrap();

        let calls = provider.calls.lock().unwrap();
        assert!(calls.contains(&"create_tag".to_string()));
        assert!(calls.contains(&"create_ref".to_string()));
        handle.join().unwrap();
    }

    #[test]
    fn failed_provider_call_does_not_change_completed_job_status() {
        let body = gzip_tarball(&[("a.circuit.tsx", "x")]);
        let (api_base, handle) = with_server(move |req| {
            req.respond(Response::from_data(body)).unwrap();
        });

        let ws_root = tempfile::tempdir().unwrap();
        let provider = Arc::new(RecordingProvider { fail_check_run_update: true, ..Default::default() });
        let (worker, store, queue) = worker(&api_base, provider, ws_root.path());

        store
            .create_deployment(&Deployment::new("d1", "o", "r", "abc", EK::Push, "main"))
            .unwrap();
        let job_id = queue.enqueue("d1", JobMetadata { check_run_id: Some(7), ..Default::default() }, 0).unwrap();

        let mut reporter = NoopReporter;
        let outcome = worker.run_once("worker-1", &mut reporter).unwrap().unwrap();
        assert_eq!(outcome, AttemptOutcome::Completed);

        let job = store.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        handle.join().unwrap();
    }

    #[test]
    fn retryable_fetch_failure_requeues_with_incremented_retry_and_reset_progress() {
        let (api_base, handle) = with_server(|req| {
            req.respond(tiny_http::Response::empty(503)).unwrap();
        });

        let ws_root = tempfile::tempdir().unwrap();
        let provider = Arc::new(RecordingProvider::default());
        let (worker, store, queue) = worker(&api_base, provider, ws_root.path());

        store
            .create_deployment(&Deployment::new("d1", "o", "r", "abc", EK::Push, "main"))
            .unwrap();
        let job_id = queue.enqueue("d1", JobMetadata::default(), 0).unwrap();

        let mut reporter = NoopReporter;
        let outcome = worker.run_once("worker-1", &mut reporter).unwrap().unwrap();
        assert!(matches!(outcome, AttemptOutcome::Retried { .. }));

        let job = store.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.progress, 0);
        assert!(job.worker_id.is_none());
        assert!(job.retry_not_before.is_some());
        handle.join().unwrap();
    }

    #[test]
    fn requeued_job_is_not_claimable_until_backoff_elapses() {
        let (api_base, handle) = with_server(|req| {
            req.respond(tiny_http::Response::empty(503)).unwrap();
        });

        let ws_root = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let queue = JobQueue::new(Arc::clone(&store));
        let fetcher =
            RevisionFetcher::new(format!("{api_base}/{{owner}}/{{repo}}/{{ref}}"), 10 * 1024 * 1024).unwrap();
        let compiler = CircuitCompiler::new(Box::new(AlwaysOkRunner), Duration::from_secs(5));
        let mut cfg = config(ws_root.path());
        cfg.backoff_base_ms = 60_000;
        let worker = Worker::new(
            Arc::clone(&store),
            JobQueue::new(Arc::clone(&store)),
            fetcher,
            compiler,
            Arc::new(RecordingProvider::default()),
            cfg,
            None,
        );

        store
            .create_deployment(&Deployment::new("d1", "o", "r", "abc", EK::Push, "main"))
            .unwrap();
        queue.enqueue("d1", JobMetadata::default(), 0).unwrap();

        let mut reporter = NoopReporter;
        worker.run_once("worker-1", &mut reporter).unwrap().unwrap();

        // Backoff hasn't elapsed yet: the store must not hand the job back
        // out even though it is already `queued`.
        assert!(store.claim_next_job("worker-2").unwrap().is_none());
        handle.join().unwrap();
    }

    #[test]
    fn lease_reclaim_emits_event_with_previous_worker_id() {
        let (api_base, handle) = with_server(|req| {
            req.respond(tiny_http::Response::empty(503)).unwrap();
        });

        let ws_root = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let queue = JobQueue::new(Arc::clone(&store));
        let fetcher =
            RevisionFetcher::new(format!("{api_base}/{{owner}}/{{repo}}/{{ref}}"), 10 * 1024 * 1024).unwrap();
        let compiler = CircuitCompiler::new(Box::new(AlwaysOkRunner), Duration::from_secs(5));
        let events_path = ws_root.path().join("events.jsonl");
        let worker = Worker::new(
            Arc::clone(&store),
            JobQueue::new(Arc::clone(&store)),
            fetcher,
            compiler,
            Arc::new(RecordingProvider::default()),
            config(ws_root.path()),
            Some(events_path.clone()),
        );

        store
            .create_deployment(&Deployment::new("d1", "o", "r", "abc", EK::Push, "main"))
            .unwrap();
        let job_id = queue.enqueue("d1", JobMetadata::default(), 0).unwrap();

        // Simulate a worker that claimed the job and then vanished mid-attempt.
        let claimed = store.claim_next_job("dead-worker").unwrap().expect("claimed");
        assert_eq!(claimed.job_id, job_id);
        store
            .update_job(
                &job_id,
                &JobUpdate {
                    started_at: Some(Some(Utc::now() - chrono::Duration::hours(1))),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut reporter = NoopReporter;
        worker.run_once("worker-1", &mut reporter).unwrap();

        let log = EventLog::read_from_file(&events_path).unwrap();
        let found = log.events_for_job(&job_id).into_iter().any(|e| {
            matches!(
                &e.kind,
                BuildEventKind::LeaseReclaimed { previous_worker_id } if previous_worker_id == "dead-worker"
            )
        });
        assert!(found);
        handle.join().unwrap();
    }

    #[test]
    fn non_retryable_404_fails_job_and_marks_deployment_error_with_pr_comment() {
        let (api_base, handle) = with_server(|req| {
            req.respond(tiny_http::Response::empty(404)).unwrap();
        });

        let ws_root = tempfile::tempdir().unwrap();
        let provider = Arc::new(RecordingProvider::default());
        let (worker, store, queue) = worker(&api_base, provider.clone(), ws_root.path());

        store
            .create_deployment(&Deployment::new("d1", "o", "r", "abc", EK::PullRequest, "42"))
            .unwrap();
        let job_id = queue.enqueue("d1", JobMetadata::default(), 1).unwrap();

        let mut reporter = NoopReporter;
        let outcome = worker.run_once("worker-1", &mut reporter).unwrap().unwrap();
        assert_eq!(outcome, AttemptOutcome::Failed);

        let job = store.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);

        let deployment = store.get_deployment("d1").unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Error);
        assert!(provider.calls.lock().unwrap().contains(&"review_comment".to_string()));
        handle.join().unwrap();
    }

    #[test]
    fn exhausted_retries_transitions_to_failed_not_queued() {
        let (api_base, handle) = with_server(|req| {
            req.respond(tiny_http::Response::empty(503)).unwrap();
        });

        let ws_root = tempfile::tempdir().unwrap();
        let provider = Arc::new(RecordingProvider::default());
        let (worker, store, queue) = worker(&api_base, provider, ws_root.path());
        store
            .create_deployment(&Deployment::new("d1", "o", "r", "abc", EK::Push, "main"))
            .unwrap();
        let job_id = queue.enqueue("d1", JobMetadata::default(), 0).unwrap();

        store
            .update_job(&job_id, &JobUpdate { retry_count: Some(3), ..Default::default() })
            .unwrap();

        let mut reporter = NoopReporter;
        let outcome = worker.run_once("worker-1", &mut reporter).unwrap().unwrap();
        assert_eq!(outcome, AttemptOutcome::Failed);
        let job = store.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        handle.join().unwrap();
    }

    #[test]
    fn compile_message_classification_matches_spec_markers() {
        assert_eq!(classify_compile_message("private repository"), ErrorKind::NonRetryableFetch);
        assert_eq!(classify_compile_message("got 404 from upstream"), ErrorKind::NonRetryableFetch);
        assert_eq!(classify_compile_message("invalid archive contents"), ErrorKind::NonRetryableFetch);
        assert_eq!(classify_compile_message("syntax error at line 3"), ErrorKind::Compile);
    }

    /// `circuit_compiler::file_progress_anchor` and this crate's
    /// `scale_compile_progress` are two halves of one progress table
    /// (spec §4.3 per-file anchor, rescaled by §4.6's worker band); this
    /// asserts they agree at the discovery anchor and across every file
    /// anchor for both a single-file and a ten-file build.
    #[test]
    fn compile_progress_anchors_rescale_consistently_at_n1_and_n10() {
        assert_eq!(scale_compile_progress(20), 34);

        for total in [1usize, 10usize] {
            let mut previous = scale_compile_progress(20);
            for i in 1..=total {
                let compiler_progress = circuit_compiler::file_progress_anchor(i, total);
                let worker_progress = scale_compile_progress(compiler_progress);
                assert!(worker_progress >= previous, "progress must be non-decreasing across files");
                assert!(worker_progress <= 90, "per-attempt compile band caps at 90");
                previous = worker_progress;
            }
        }

        // Last file of any N reaches compiler_progress 95 (25 + floor(70*N/N)
        // is actually 95, not 100 - the explicit completion anchor is a
        // separate `progress(100, ...)` call), which rescales to 86, not 90.
        assert_eq!(circuit_compiler::file_progress_anchor(10, 10), 95);
        assert_eq!(scale_compile_progress(95), 86);
        // Only the compiler's dedicated completion anchor (100) rescales to
        // the band's true ceiling.
        assert_eq!(scale_compile_progress(100), 90);
    }
}
