//! CircuitCompiler: discovers circuit source files in a workspace,
//! compiles each one, and reports progress at fixed anchors.
//!
//! The actual compile step is delegated to a [`CompileRunner`] so this
//! crate owns discovery, progress bookkeeping, and checksumming without
//! depending on a specific compiler toolchain; [`ExternalCompileRunner`]
//! shells out to the configured program and polls the child with
//! `try_wait` under a deadline rather than blocking on `wait`.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use walkdir::{DirEntry, WalkDir};

const SKIPPED_DIR_NAMES: [&str; 4] = ["node_modules", "dist", "build", ".tscircuit"];
const SOURCE_SUFFIXES: [&str; 3] = [".circuit.tsx", ".circuit.ts", ".board.tsx"];
const SIBLING_EXTENSIONS: [&str; 4] = [".ts", ".tsx", ".js", ".jsx"];
const MANIFEST_NAME: &str = "package.json";

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("failed to walk workspace: {0}")]
    Discovery(String),
    #[error("compile process failed: {0}")]
    Runner(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CompileError>;

#[derive(Debug, Clone, serde::Serialize)]
pub struct FileMetadata {
    pub size: u64,
    pub mtime_unix: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FileOutput {
    pub path: String,
    pub name: String,
    pub output_json: serde_json::Value,
    pub metadata: FileMetadata,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Snapshot {
    pub success: bool,
    pub files: Vec<FileOutput>,
    pub build_time_seconds: f64,
    pub error: Option<String>,
}

/// One compile invocation's input: the selected source file plus its
/// resolved virtual file map (siblings plus the project manifest).
pub struct CompileRequest<'a> {
    pub entry_path: &'a Path,
    pub virtual_files: &'a BTreeMap<String, String>,
}

pub trait CompileRunner: Send + Sync {
    fn compile(&self, request: &CompileRequest<'_>, timeout: Duration) -> Result<serde_json::Value>;
}

/// Shells out to an external compiler binary, sending `{entry, files}` as
/// JSON on stdin and reading a JSON result from stdout.
pub struct ExternalCompileRunner {
    pub program: String,
    pub args: Vec<String>,
}

impl CompileRunner for ExternalCompileRunner {
    fn compile(&self, request: &CompileRequest<'_>, timeout: Duration) -> Result<serde_json::Value> {
        let payload = serde_json::json!({
            "entry": request.entry_path.to_string_lossy(),
            "files": request.virtual_files,
        });

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CompileError::Runner(format!("failed to spawn {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(payload.to_string().as_bytes());
        }

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait().map_err(|e| CompileError::Runner(e.to_string()))? {
                Some(status) => {
                    let output = child
                        .wait_with_output()
                        .map_err(|e| CompileError::Runner(e.to_string()))?;
                    if !status.success() {
                        return Err(CompileError::Runner(
                            String::from_utf8_lossy(&output.stderr).to_string(),
                        ));
                    }
                    return serde_json::from_slice(&output.stdout)
                        .map_err(|e| CompileError::Runner(format!("invalid compiler output: {e}")));
                }
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(CompileError::Runner("compile timed out".to_string()));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

pub struct CircuitCompiler {
    runner: Box<dyn CompileRunner>,
    timeout: Duration,
}

impl CircuitCompiler {
    pub fn new(runner: Box<dyn CompileRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Runs discovery + compile, invoking `progress` with `(stage_progress, message)`
    /// at the anchors specified in the per-attempt progress table: 20 at
    /// discovery end, [`file_progress_anchor`] per file, 100 at completion.
    pub fn compile(
        &self,
        workspace_root: &Path,
        mut progress: impl FnMut(u8, &str),
    ) -> Result<Snapshot> {
        let start = Instant::now();
        let files = discover_source_files(workspace_root)?;
        progress(20, "discovery complete");

        if files.is_empty() {
            progress(100, "no source files found");
            return Ok(Snapshot {
                success: true,
                files: Vec::new(),
                build_time_seconds: start.elapsed().as_secs_f64(),
                error: None,
            });
        }

        let total = files.len();
        let mut outputs = Vec::with_capacity(total);
        let mut failure: Option<String> = None;

        for (i, entry) in files.iter().enumerate() {
            let virtual_files = resolve_virtual_files(workspace_root, entry)?;
            let request = CompileRequest { entry_path: entry, virtual_files: &virtual_files };

            match self.runner.compile(&request, self.timeout) {
                Ok(output_json) => {
                    let metadata = file_metadata(entry)?;
                    let relative = entry
                        .strip_prefix(workspace_root)
                        .unwrap_or(entry)
                        .to_string_lossy()
                        .replace('\\', "/");
                    outputs.push(FileOutput {
                        path: relative.clone(),
                        name: entry.file_name().unwrap_or_default().to_string_lossy().to_string(),
                        output_json,
                        metadata,
                    });
                }
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }

            progress(file_progress_anchor(i + 1, total), &entry.to_string_lossy());
        }

        progress(100, "compile complete");

        Ok(Snapshot {
            success: failure.is_none(),
            files: outputs,
            build_time_seconds: start.elapsed().as_secs_f64(),
            error: failure,
        })
    }
}

/// Per-file progress anchor after compiling the `index_one_based`-th of
/// `total` discovered files: `25 + floor(70*(index_one_based/total))`.
/// Exported so callers that rescale this into a wider band (the Worker's
/// per-attempt progress) can be tested against the exact values this
/// crate emits.
pub fn file_progress_anchor(index_one_based: usize, total: usize) -> u8 {
    25 + ((70 * index_one_based) / total) as u8
}

fn is_skipped(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    if entry.depth() == 0 {
        return false;
    }
    name.starts_with('.') || SKIPPED_DIR_NAMES.contains(&name.as_ref())
}

fn discover_source_files(workspace_root: &Path) -> Result<Vec<PathBuf>> {
    if !workspace_root.exists() {
        return Ok(Vec::new());
    }

    let mut matches = Vec::new();
    let walker = WalkDir::new(workspace_root).into_iter().filter_entry(|e| !is_skipped(e));
    for entry in walker {
        let entry = entry.map_err(|e| CompileError::Discovery(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if SOURCE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            matches.push(entry.into_path());
        }
    }
    matches.sort();
    Ok(matches)
}

/// Builds the virtual file map a single entry point compiles against:
/// sibling files sharing its directory with a recognized extension, plus
/// the nearest `package.json` manifest, keyed by path relative to the
/// workspace root.
fn resolve_virtual_files(
    workspace_root: &Path,
    entry_path: &Path,
) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    let dir = entry_path.parent().unwrap_or(workspace_root);

    for sibling in std::fs::read_dir(dir)? {
        let sibling = sibling?;
        let path = sibling.path();
        if !path.is_file() {
            continue;
        }
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        if SIBLING_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
            insert_relative(workspace_root, &path, &mut files);
        }
    }

    if let Some(manifest) = find_manifest(workspace_root, dir) {
        insert_relative(workspace_root, &manifest, &mut files);
    }

    Ok(files)
}

fn insert_relative(workspace_root: &Path, path: &Path, files: &mut BTreeMap<String, String>) {
    let Ok(content) = std::fs::read_to_string(path) else { return };
    let relative = path.strip_prefix(workspace_root).unwrap_or(path).to_string_lossy().replace('\\', "/");
    files.insert(relative, content);
}

fn find_manifest(workspace_root: &Path, start_dir: &Path) -> Option<PathBuf> {
    let mut dir = Some(start_dir);
    while let Some(d) = dir {
        let candidate = d.join(MANIFEST_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if d == workspace_root {
            break;
        }
        dir = d.parent();
    }
    None
}

fn file_metadata(path: &Path) -> Result<FileMetadata> {
    let bytes = std::fs::read(path)?;
    let metadata = std::fs::metadata(path)?;
    let mtime_unix = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let checksum = hex::encode(hasher.finalize());

    Ok(FileMetadata { size: bytes.len() as u64, mtime_unix, checksum })
}
