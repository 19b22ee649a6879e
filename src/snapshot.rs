//! Repository snapshot acquisition.
//!
//! Downloads a zip archive of one pinned revision from the repository host
//! and extracts it into a per-run session directory:
//!
//! ```text
//! <work_dir>/<uuid>/archive.zip
//! <work_dir>/<uuid>/extract/<owner>-<repo>-<sha>/...
//! ```
//!
//! Two hard guarantees:
//!
//! - **Byte ceiling.** The declared `Content-Length` is checked before the
//!   body is read, and the streamed total is checked before every write.
//!   The same ceiling bounds each decompressed entry.
//! - **Containment.** Every entry path is normalized against the extraction
//!   directory. An entry that would land outside it rejects the whole
//!   archive and the partially written directory is removed. Symbolic-link
//!   entries are never extracted.
//!
//! The session directory is removed by [`Snapshot::cleanup`], or by `Drop`
//! if a run unwinds before reaching it.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SnapshotConfig;
use crate::error::{IndexError, Result};
use crate::models::RepoReference;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Archive URL for a pinned revision.
///
/// GitHub answers with a redirect to a short-lived download URL; the
/// client follows it.
pub fn build_archive_url(api_base: &str, repo: &RepoReference) -> String {
    format!(
        "{}/repos/{}/{}/zipball/{}",
        api_base.trim_end_matches('/'),
        repo.owner,
        repo.repo,
        repo.revision
    )
}

/// HTTP client for the repository host, built once at startup.
pub struct RepositoryHost {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
    work_dir: PathBuf,
    max_bytes: u64,
}

impl RepositoryHost {
    pub fn new(config: &SnapshotConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("subidx/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| IndexError::Fetch(e.to_string()))?;

        let token = std::env::var(&config.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());

        Ok(Self {
            client,
            api_base: config.api_base.clone(),
            token,
            work_dir: config.work_dir.clone(),
            max_bytes: config.max_archive_bytes,
        })
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Stream the archive at `url` into `dest`.
    ///
    /// Returns the number of bytes written. On any error after the file was
    /// created, the partial file is removed.
    pub async fn download_archive(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| IndexError::Fetch(format!("{}: {}", url, e)))?;

        let status = response.status();
        match status.as_u16() {
            404 => return Err(IndexError::NotFound(url.to_string())),
            403 | 429 => {
                return Err(IndexError::RateLimited(format!("HTTP {} from {}", status, url)))
            }
            _ if !status.is_success() => {
                return Err(IndexError::Fetch(format!("HTTP {} from {}", status, url)))
            }
            _ => {}
        }

        if let Some(declared) = response.content_length() {
            if declared > self.max_bytes {
                return Err(IndexError::SizeLimitExceeded {
                    what: format!("archive (declared {} bytes)", declared),
                    limit: self.max_bytes,
                });
            }
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut total: u64 = 0;

        let result: Result<u64> = async {
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| IndexError::Fetch(format!("{}: {}", url, e)))?
            {
                total += chunk.len() as u64;
                if total > self.max_bytes {
                    return Err(IndexError::SizeLimitExceeded {
                        what: "archive download".to_string(),
                        limit: self.max_bytes,
                    });
                }
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok(total)
        }
        .await;

        if result.is_err() {
            drop(file);
            if let Err(e) = tokio::fs::remove_file(dest).await {
                warn!(path = %dest.display(), error = %e, "failed to remove partial archive");
            }
        }
        result
    }

    /// Download and extract `repo` into a fresh session directory.
    pub async fn acquire(&self, repo: &RepoReference) -> Result<Snapshot> {
        let session = Session::create(&self.work_dir).await?;
        let url = build_archive_url(&self.api_base, repo);

        info!(%repo, %url, "downloading repository archive");
        let bytes_downloaded = self.download_archive(&url, &session.archive_path).await?;
        debug!(%repo, bytes_downloaded, "archive downloaded");

        let archive = session.archive_path.clone();
        let extract_dir = session.extract_dir.clone();
        let limit = self.max_bytes;
        let top_level_dir =
            tokio::task::spawn_blocking(move || extract_archive(&archive, &extract_dir, limit))
                .await
                .map_err(|e| IndexError::Other(format!("extraction task failed: {}", e)))??;

        let root_path = match top_level_dir {
            Some(ref dir) => session.extract_dir.join(dir),
            None => session.extract_dir.clone(),
        };
        info!(%repo, root = %root_path.display(), "snapshot extracted");

        Ok(Snapshot {
            root_path,
            bytes_downloaded,
            top_level_dir,
            session,
        })
    }
}

/// A local extraction of one repository revision.
#[derive(Debug)]
pub struct Snapshot {
    pub root_path: PathBuf,
    pub bytes_downloaded: u64,
    /// Single top-level directory of the archive, if it has exactly one.
    pub top_level_dir: Option<String>,
    session: Session,
}

impl Snapshot {
    pub fn archive_path(&self) -> &Path {
        &self.session.archive_path
    }

    /// Remove the archive, the extraction directory and the session
    /// directory if it is left empty. Runs on the blocking pool. Never
    /// fails; problems are logged.
    pub async fn cleanup(mut self) {
        self.session.armed = false;
        let dirs = self.session.dirs.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || dirs.remove()).await {
            warn!(error = %e, "snapshot cleanup task failed");
        }
    }
}

#[derive(Debug, Clone)]
struct SessionDirs {
    dir: PathBuf,
    archive_path: PathBuf,
    extract_dir: PathBuf,
}

impl SessionDirs {
    fn remove(&self) {
        if let Err(e) = fs::remove_file(&self.archive_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.archive_path.display(), error = %e, "failed to remove archive");
            }
        }
        if let Err(e) = fs::remove_dir_all(&self.extract_dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.extract_dir.display(), error = %e, "failed to remove extraction directory");
            }
        }
        // Only succeeds when nothing else was left behind.
        if let Err(e) = fs::remove_dir(&self.dir) {
            debug!(path = %self.dir.display(), error = %e, "session directory not removed");
        }
    }
}

/// Session directories, removed on drop unless disarmed by
/// [`Snapshot::cleanup`].
#[derive(Debug)]
struct Session {
    dirs: SessionDirs,
    armed: bool,
}

impl Session {
    async fn create(work_dir: &Path) -> Result<Self> {
        let dir = work_dir.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dirs: SessionDirs {
                archive_path: dir.join("archive.zip"),
                extract_dir: dir.join("extract"),
                dir,
            },
            armed: true,
        })
    }
}

impl std::ops::Deref for Session {
    type Target = SessionDirs;

    fn deref(&self) -> &SessionDirs {
        &self.dirs
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.armed {
            self.dirs.remove();
        }
    }
}

/// Extract every regular file of a zip archive into `dest_dir`.
///
/// Returns the archive's single top-level directory name, if any. On error
/// `dest_dir` is removed before the error is returned.
pub fn extract_archive(archive_path: &Path, dest_dir: &Path, max_entry_bytes: u64) -> Result<Option<String>> {
    fs::create_dir_all(dest_dir)?;
    let dest = dest_dir.canonicalize()?;

    let result = extract_entries(archive_path, &dest, max_entry_bytes);
    if result.is_err() {
        if let Err(e) = fs::remove_dir_all(&dest) {
            warn!(path = %dest.display(), error = %e, "failed to remove rejected extraction");
        }
    }
    result
}

fn extract_entries(archive_path: &Path, dest: &Path, max_entry_bytes: u64) -> Result<Option<String>> {
    let file = fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut top_level: BTreeSet<String> = BTreeSet::new();
    let mut top_level_files = false;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();

        let is_symlink = entry
            .unix_mode()
            .is_some_and(|mode| mode & S_IFMT == S_IFLNK);
        if is_symlink {
            warn!(entry = %name, "skipping symbolic link entry");
            continue;
        }

        let relative = match normalize_entry_path(&name) {
            Some(p) => p,
            None => {
                warn!(entry = %name, "rejecting archive: entry escapes extraction directory");
                return Err(IndexError::PathSecurity { entry: name });
            }
        };
        if relative.as_os_str().is_empty() {
            continue;
        }

        let target = dest.join(&relative);
        if !target.starts_with(dest) {
            warn!(entry = %name, "rejecting archive: entry escapes extraction directory");
            return Err(IndexError::PathSecurity { entry: name });
        }

        let mut components = relative.components();
        if let Some(first) = components.next() {
            top_level.insert(first.as_os_str().to_string_lossy().into_owned());
            if components.next().is_none() && !entry.is_dir() {
                top_level_files = true;
            }
        }

        if entry.is_dir() {
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&target)?;
        let copied = io::copy(&mut (&mut entry).take(max_entry_bytes + 1), &mut out)?;
        if copied > max_entry_bytes {
            return Err(IndexError::SizeLimitExceeded {
                what: format!("archive entry {}", name),
                limit: max_entry_bytes,
            });
        }
    }

    if top_level.len() == 1 && !top_level_files {
        Ok(top_level.into_iter().next())
    } else {
        Ok(None)
    }
}

/// Lexically normalize a zip entry name into a relative path.
///
/// `.` and empty segments are dropped and `..` pops the previous segment.
/// Returns `None` for absolute paths, drive prefixes, and any `..` that
/// would climb above the root.
fn normalize_entry_path(name: &str) -> Option<PathBuf> {
    let name = name.replace('\\', "/");
    if name.starts_with('/') {
        return None;
    }

    let mut parts: Vec<&str> = Vec::new();
    for segment in name.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            s if parts.is_empty() && is_drive_prefix(s) => return None,
            s => parts.push(s),
        }
    }

    Some(parts.iter().collect())
}

/// `C:`-style drive prefix.
fn is_drive_prefix(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
