//! RevisionFetcher: downloads and extracts a source revision archive
//! into a scratch [`circuit_types::Workspace`].
//!
//! HTTP plumbing uses a blocking `reqwest::Client` built once, with
//! status codes matched into retryable vs. non-retryable outcomes. The
//! response body is streamed to disk and then unpacked in place rather
//! than buffered in memory.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use circuit_types::{ErrorKind, Workspace};
use flate2::read::GzDecoder;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use tar::Archive;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("archive not found or access denied: {0}")]
    NotFound(String),
    #[error("archive exceeds maximum size of {max} bytes")]
    TooLarge { max: u64 },
    #[error("archive could not be extracted: {0}")]
    InvalidArchive(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            FetchError::NotFound(_) | FetchError::TooLarge { .. } | FetchError::InvalidArchive(_) => {
                ErrorKind::NonRetryableFetch
            }
            FetchError::Network(_) | FetchError::Io(_) => ErrorKind::RetryableTransient,
        }
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;

/// Everything needed to locate and authenticate an archive request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub repo_owner: String,
    pub repo_name: String,
    pub commit_ref: String,
    pub credential_handle: String,
    pub explicit_archive_url: Option<String>,
}

pub struct RevisionFetcher {
    http: Client,
    /// Base used to derive an archive URL when no explicit one is given;
    /// e.g. `https://codeload.example.com` for a codeload-style tarball
    /// endpoint. `{owner}`, `{repo}`, `{ref}` are substituted.
    archive_url_template: String,
    max_archive_bytes: u64,
}

impl RevisionFetcher {
    pub fn new(archive_url_template: impl Into<String>, max_archive_bytes: u64) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("circuit-ci/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self { http, archive_url_template: archive_url_template.into(), max_archive_bytes })
    }

    fn resolve_url(&self, request: &FetchRequest) -> String {
        if let Some(url) = &request.explicit_archive_url {
            return url.clone();
        }
        self.archive_url_template
            .replace("{owner}", &request.repo_owner)
            .replace("{repo}", &request.repo_name)
            .replace("{ref}", &request.commit_ref)
    }

    /// Downloads and extracts the archive, returning a [`Workspace`] rooted
    /// at a fresh subdirectory of `workspace_root`, with any single
    /// top-level wrapper directory stripped.
    pub fn fetch(
        &self,
        request: &FetchRequest,
        workspace_root: &Path,
        job_id: &str,
    ) -> Result<Workspace> {
        let url = self.resolve_url(request);

        let response = self
            .http
            .get(&url)
            .header("Authorization", &request.credential_handle)
            .send()?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => {
                return Err(FetchError::NotFound(format!("{url} returned {}", response.status())));
            }
            s if s.is_server_error() => {
                return Err(FetchError::Network(response.error_for_status().unwrap_err()));
            }
            s => {
                return Err(FetchError::InvalidArchive(format!("unexpected status {s} from {url}")));
            }
        }

        if let Some(len) = response.content_length() {
            if len > self.max_archive_bytes {
                return Err(FetchError::TooLarge { max: self.max_archive_bytes });
            }
        }

        let bytes = response.bytes()?;
        if bytes.len() as u64 > self.max_archive_bytes {
            return Err(FetchError::TooLarge { max: self.max_archive_bytes });
        }

        let mut tmp = tempfile::NamedTempFile::new_in(workspace_root)?;
        tmp.write_all(&bytes)?;
        tmp.flush()?;

        let root = workspace_root.join(format!("circuit-ws-{job_id}"));
        std::fs::create_dir_all(&root)?;

        extract_tar_gz(tmp.path(), &root)
            .map_err(|e| FetchError::InvalidArchive(e.to_string()))?;
        normalize_single_wrapper(&root)?;

        Ok(Workspace { root, job_id: job_id.to_string() })
    }
}

fn extract_tar_gz(archive_path: &Path, dest: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::open(archive_path)?;
    let decoder = GzDecoder::new(file);
    let mut archive = Archive::new(decoder);
    archive.unpack(dest)?;
    Ok(())
}

/// If `dir` contains exactly one entry and it is itself a directory (the
/// common "reponame-sha/" wrapper produced by tarball endpoints), hoist
/// its contents up one level and remove the now-empty wrapper.
fn normalize_single_wrapper(dir: &Path) -> Result<()> {
    let entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();

    if entries.len() != 1 || !entries[0].is_dir() {
        return Ok(());
    }

    let wrapper = &entries[0];
    for child in std::fs::read_dir(wrapper)? {
        let child = child?.path();
        let target = dir.join(child.file_name().expect("entry has a file name"));
        std::fs::rename(&child, &target)?;
    }
    std::fs::remove_dir(wrapper)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tiny_http::{Response, Server};

    fn gzip_tarball_with_wrapper(wrapper: &str, files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let path = format!("{wrapper}/{name}");
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, path, content.as_bytes()).expect("append");
        }
        let tar_bytes = builder.into_inner().expect("finish tar");

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar_bytes).expect("write gz");
        encoder.finish().expect("finish gz")
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

    fn request_for(url: String) -> FetchRequest {
        FetchRequest {
            repo_owner: "o".into(),
            repo_name: "r".into(),
            commit_ref: "abc".into(),
            credential_handle: "token".into(),
            explicit_archive_url: Some(url),
        }
    }

    #[test]
    fn fetch_extracts_and_strips_single_wrapper_directory() {
        let body = gzip_tarball_with_wrapper("r-abc", &[("src/main.circuit.tsx", "export {}")]);
        let (api_base, handle) = with_server(move |req| {
            req.respond(Response::from_data(body)).expect("respond");
        });

        let fetcher = RevisionFetcher::new("unused/{owner}/{repo}/{ref}", 10 * 1024 * 1024).unwrap();
        let workspace_root = tempfile::tempdir().unwrap();
        let workspace = fetcher
            .fetch(&request_for(format!("{api_base}/archive.tar.gz")), workspace_root.path(), "job-1")
            .expect("fetch");

        assert!(workspace.root.join("src/main.circuit.tsx").exists());
        assert!(!workspace.root.join("r-abc").exists());
        handle.join().expect("join");
    }

    #[test]
    fn fetch_returns_not_found_for_404() {
        let (api_base, handle) = with_server(|req| {
            req.respond(tiny_http::Response::empty(404)).expect("respond");
        });

        let fetcher = RevisionFetcher::new("unused", 10 * 1024 * 1024).unwrap();
        let workspace_root = tempfile::tempdir().unwrap();
        let err = fetcher
            .fetch(&request_for(format!("{api_base}/missing.tar.gz")), workspace_root.path(), "job-1")
            .expect_err("404 must fail");

        assert_eq!(err.error_kind(), ErrorKind::NonRetryableFetch);
        handle.join().expect("join");
    }

    #[test]
    fn fetch_returns_not_found_for_403() {
        let (api_base, handle) = with_server(|req| {
            req.respond(tiny_http::Response::empty(403)).expect("respond");
        });

        let fetcher = RevisionFetcher::new("unused", 10 * 1024 * 1024).unwrap();
        let workspace_root = tempfile::tempdir().unwrap();
        let err = fetcher
            .fetch(&request_for(format!("{api_base}/private.tar.gz")), workspace_root.path(), "job-1")
            .expect_err("403 must fail");

        assert_eq!(err.error_kind(), ErrorKind::NonRetryableFetch);
        handle.join().expect("join");
    }

    #[test]
    fn fetch_treats_5xx_as_retryable() {
        let (api_base, handle) = with_server(|req| {
            req.respond(tiny_http::Response::empty(503)).expect("respond");
        });

        let fetcher = RevisionFetcher::new("unused", 10 * 1024 * 1024).unwrap();
        let workspace_root = tempfile::tempdir().unwrap();
        let err = fetcher
            .fetch(&request_for(format!("{api_base}/flaky.tar.gz")), workspace_root.path(), "job-1")
            .expect_err("503 must fail");

        assert_eq!(err.error_kind(), ErrorKind::RetryableTransient);
        handle.join().expect("join");
    }

    #[test]
    fn fetch_rejects_oversized_body_even_without_content_length() {
        let body = vec![0u8; 64];
        let (api_base, handle) = with_server(move |req| {
            req.respond(Response::from_data(body)).expect("respond");
        });

        let fetcher = RevisionFetcher::new("unused", 32).unwrap();
        let workspace_root = tempfile::tempdir().unwrap();
        let err = fetcher
            .fetch(&request_for(format!("{api_base}/big.tar.gz")), workspace_root.path(), "job-1")
            .expect_err("oversized body must fail");

        assert!(matches!(err, FetchError::TooLarge { max: 32 }));
        handle.join().expect("join");
    }

    #[test]
    fn resolve_url_substitutes_owner_repo_ref_when_no_explicit_url() {
        let fetcher = RevisionFetcher::new("https://codeload.example.com/{owner}/{repo}/tar.gz/{ref}", 1).unwrap();
        let request = FetchRequest {
            repo_owner: "acme".into(),
            repo_name: "widgets".into(),
            commit_ref: "deadbeef".into(),
            credential_handle: "token".into(),
            explicit_archive_url: None,
        };
        assert_eq!(
            fetcher.resolve_url(&request),
            "https://codeload.example.com/acme/widgets/tar.gz/deadbeef"
        );
    }

    #[test]
    fn normalize_single_wrapper_leaves_multi_entry_roots_untouched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        normalize_single_wrapper(dir.path()).unwrap();
        assert!(dir.path().join("a.txt").exists());
        assert!(dir.path().join("b.txt").exists());
    }

    #[test]
    fn extract_tar_gz_handles_empty_archive() {
        let body = gzip_tarball_with_wrapper("empty", &[]);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), &body).unwrap();
        let dest = tempfile::tempdir().unwrap();
        extract_tar_gz(tmp.path(), dest.path()).expect("extract");
        let mut entries = std::fs::read_dir(dest.path()).unwrap();
        assert!(entries.next().is_some());
    }

    #[test]
    fn extract_tar_gz_rejects_garbage_input() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"not a gzip stream").unwrap();
        let dest = tempfile::tempdir().unwrap();
        assert!(extract_tar_gz(tmp.path(), dest.path()).is_err());
    }
}
