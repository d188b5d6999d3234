use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::Term;
use indicatif::{ProgressBar, ProgressStyle};

use circuit_compiler::{CircuitCompiler, ExternalCompileRunner};
use circuit_config::{CliOverrides, Config};
use circuit_fetch::RevisionFetcher;
use circuit_ingest::IngestRequest;
use circuit_provider::HttpProviderClient;
use circuit_queue::JobQueue;
use circuit_store::{SqliteStore, Store};
use circuit_worker::{Reporter, Worker, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "circuit-cli", version)]
#[command(about = "Build orchestration core for circuit board design revisions")]
struct Cli {
    /// Directory holding `.circuit-ci.toml` and the sqlite store, unless overridden.
    #[arg(long, default_value = ".")]
    workspace_root: PathBuf,

    /// Override the sqlite database path.
    #[arg(long)]
    database_path: Option<PathBuf>,

    /// Override the retry ceiling.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Provider API base URL (e.g. `https://api.github.com`).
    #[arg(long, default_value = "https://api.github.com")]
    api_base: String,

    /// Archive URL template used when a request carries no explicit archive
    /// URL. Supports `{owner}`, `{repo}`, `{ref}` placeholders.
    #[arg(long, default_value = "https://codeload.github.com/{owner}/{repo}/tar.gz/{ref}")]
    archive_url_template: String,

    /// External compiler binary invoked by the CircuitCompiler.
    #[arg(long, default_value = "circuit-compile")]
    compiler_program: String,

    /// Compile step timeout.
    #[arg(long, default_value = "5m")]
    compile_timeout: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a build request and enqueue it.
    Ingest {
        /// Path to a JSON file holding the ingest request body.
        request_path: PathBuf,
        /// Credential handle for the triggering caller; falls back to
        /// `provider.bot_credential` from config when omitted.
        #[arg(long)]
        credential: Option<String>,
    },
    /// Print the current status of a queued or in-flight job.
    Status {
        job_id: String,
    },
    /// Run the worker loop, claiming and executing jobs until killed.
    Worker {
        /// Stable identifier for this worker process, used for lease ownership.
        #[arg(long, default_value = "worker-1")]
        worker_id: String,
    },
    /// Print configuration and environment diagnostics.
    Doctor,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_from_workspace(&cli.workspace_root)
        .context("failed to load .circuit-ci.toml")?
        .unwrap_or_default();
    config.apply_overrides(&CliOverrides {
        max_retries: cli.max_retries,
        workspace_root: None,
        database_path: cli.database_path.clone(),
    });
    config.validate().context("invalid configuration")?;

    let database_path = if config.store.database_path.is_absolute() {
        config.store.database_path.clone()
    } else {
        cli.workspace_root.join(&config.store.database_path)
    };

    let mut reporter = CliReporter;

    match &cli.cmd {
        Commands::Ingest { request_path, credential } => {
            let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&database_path)?);
            let queue = JobQueue::new(store.clone());
            let body = std::fs::read_to_string(request_path)
                .with_context(|| format!("failed to read {}", request_path.display()))?;
            let request: IngestRequest = serde_json::from_str(&body)
                .with_context(|| format!("failed to parse ingest request in {}", request_path.display()))?;
            let credential = credential.clone().or_else(|| config.provider.bot_credential.clone());

            match circuit_ingest::ingest(&store, &queue, request, credential) {
                Ok(response) => {
                    println!("{}", serde_json::to_string_pretty(&response)?);
                }
                Err(e) => {
                    reporter.error(&format!("ingest rejected: {e} ({:?})", e.error_kind()));
                    return Err(e.into());
                }
            }
        }
        Commands::Status { job_id } => {
            let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&database_path)?);
            let queue = JobQueue::new(store);
            let response = circuit_ingest::status(&queue, job_id)?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Worker { worker_id } => {
            run_worker(&cli, &config, &database_path, worker_id, &mut reporter)?;
        }
        Commands::Doctor => {
            run_doctor(&cli, &config, &database_path, &mut reporter)?;
        }
    }

    Ok(())
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))
}

fn build_worker(cli: &Cli, config: &Config, database_path: &PathBuf) -> Result<Worker> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(database_path)?);
    let queue = JobQueue::new(store.clone());
    let fetcher = RevisionFetcher::new(cli.archive_url_template.clone(), config.fetch.max_archive_bytes)?;
    let compiler = CircuitCompiler::new(
        Box::new(ExternalCompileRunner { program: cli.compiler_program.clone(), args: Vec::new() }),
        parse_duration(&cli.compile_timeout)?,
    );
    let provider: Arc<dyn circuit_provider::ProviderClient> = Arc::new(HttpProviderClient::new(cli.api_base.clone())?);

    let worker_config = WorkerConfig {
        max_retries: config.retry.max_retries,
        backoff_base_ms: config.retry.backoff_base.as_millis() as u64,
        backoff_cap_ms: config.retry.backoff_cap.as_millis() as u64,
        max_attempt_duration: config.worker.max_attempt_duration,
        idle_poll_interval: config.worker.idle_poll_interval,
        workspace_root: config.worker.workspace_root.clone(),
        bot_credential: config.provider.bot_credential.clone(),
    };

    let events_path = Some(circuit_events::events_path(&cli.workspace_root));

    Ok(Worker::new(store, queue, fetcher, compiler, provider, worker_config, events_path))
}

fn run_worker(
    cli: &Cli,
    config: &Config,
    database_path: &PathBuf,
    worker_id: &str,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let worker = build_worker(cli, config, database_path)?;

    // Multiple workers may share one Store concurrently; there is no
    // in-process coordination beyond it, so this loop just runs until killed.
    let spinner = if Term::stdout().is_term() {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(format!("{worker_id} polling for work..."));
        Some(pb)
    } else {
        reporter.info(&format!("{worker_id} polling for work..."));
        None
    };

    loop {
        match worker.run_once(worker_id, reporter)? {
            Some(outcome) => {
                let msg = format!("{worker_id} last attempt: {outcome:?}");
                match &spinner {
                    Some(pb) => pb.set_message(msg),
                    None => reporter.info(&msg),
                }
            }
            None => std::thread::sleep(config.worker.idle_poll_interval),
        }
    }
}

fn run_doctor(
    cli: &Cli,
    config: &Config,
    database_path: &PathBuf,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    println!("workspace_root: {}", cli.workspace_root.display());
    println!("database_path: {}", database_path.display());
    println!("api_base: {}", cli.api_base);
    println!("archive_url_template: {}", cli.archive_url_template);
    println!("bot_credential_configured: {}", config.provider.bot_credential.is_some());
    println!(
        "max_retries: {} backoff_base_ms: {} backoff_cap_ms: {}",
        config.retry.max_retries,
        config.retry.backoff_base.as_millis(),
        config.retry.backoff_cap.as_millis()
    );
    println!(
        "max_attempt_duration: {:?} idle_poll_interval: {:?}",
        config.worker.max_attempt_duration, config.worker.idle_poll_interval
    );

    match SqliteStore::open(database_path) {
        Ok(store) => {
            let stats = store.queue_stats()?;
            println!("store_readable: true");
            println!("queued_jobs: {} processing_jobs: {}", stats.queued, stats.processing);
            match stats.oldest_queued_at {
                Some(ts) => {
                    let age = chrono::Utc::now().signed_duration_since(ts);
                    println!("oldest_queued_job_age_seconds: {}", age.num_seconds().max(0));
                }
                None => println!("oldest_queued_job_age_seconds: none"),
            }
        }
        Err(e) => {
            reporter.warn(&format!("store at {} is not readable: {e}", database_path.display()));
            println!("store_readable: false");
        }
    }
    println!();

    print_cmd_version(&cli.compiler_program, reporter);

    Ok(())
}

fn print_cmd_version(cmd: &str, reporter: &mut dyn Reporter) {
    let out = Command::new(cmd).arg("--version").output();
    match out {
        Ok(o) if o.status.success() => {
            let s = String::from_utf8_lossy(&o.stdout).trim().to_string();
            println!("{cmd}: {s}");
        }
        Ok(o) => {
            reporter.warn(&format!(
                "{cmd} --version failed: {}",
                String::from_utf8_lossy(&o.stderr).trim()
            ));
        }
        Err(e) => {
            reporter.warn(&format!("unable to run {cmd} --version: {e}"));
        }
    }
}
