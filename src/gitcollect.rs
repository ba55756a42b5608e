//! Git history collection.
//!
//! Maintains bare, blobless clones under the repos directory and enumerates
//! commits from them. One walk serves every downstream window: the stream is
//! already filtered to `author_time <= as_of` and sorted author-time
//! descending, and the aggregator partitions it.

use std::{
   collections::HashMap,
   fs,
   path::{Path, PathBuf},
   process::Command,
   sync::Arc,
   thread,
   time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{
   error::{OssuaryError, Result},
   style,
   types::{RawCommit, RepositoryRef},
};

/// A fetch that succeeded within this window is considered fresh.
const FETCH_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
/// Marker file updated after each successful clone/fetch.
const FETCH_MARKER: &str = "ossuary-fetch-marker";
/// A lock file older than this is treated as abandoned and taken over.
const LOCK_STALE_AGE: Duration = Duration::from_secs(10 * 60);

/// Store of bare clones, one per `(host, owner, repo)`.
pub struct RepoStore {
   root:  PathBuf,
   locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl RepoStore {
   pub fn new(root: impl Into<PathBuf>) -> Self {
      Self { root: root.into(), locks: Mutex::new(HashMap::new()) }
   }

   /// `<root>/<host>/<owner>/<repo>.git`
   pub fn local_path(&self, repo: &RepositoryRef) -> PathBuf {
      self
         .root
         .join(&repo.host)
         .join(&repo.owner)
         .join(format!("{}.git", repo.repo))
   }

   /// Ensure a fresh local clone exists: clone on first sight, fetch when the
   /// last successful fetch is older than 24 hours. Fetches on the same repo
   /// are serialized so concurrent tasks don't clobber each other.
   pub fn ensure_fresh(&self, repo: &RepositoryRef) -> Result<PathBuf> {
      let path = self.local_path(repo);

      let repo_lock = {
         let mut locks = self.locks.lock();
         Arc::clone(locks.entry(path.clone()).or_default())
      };
      let _guard = repo_lock.lock();
      let _file_guard = LockFile::acquire(&path)?;

      if path.join("HEAD").exists() {
         if fetch_is_fresh(&path) {
            return Ok(path);
         }
         self.fetch(repo, &path)?;
      } else {
         self.clone_blobless(repo, &path)?;
      }
      Ok(path)
   }

   fn clone_blobless(&self, repo: &RepositoryRef, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let output = Command::new("git")
         .args(["clone", "--bare", "--filter=blob:none", &repo.url])
         .arg(path)
         .output()
         .map_err(|e| OssuaryError::Git(format!("failed to run git clone: {e}")))?;

      if !output.status.success() {
         let stderr = String::from_utf8_lossy(&output.stderr);
         return Err(classify_remote_failure(&repo.url, &stderr));
      }

      touch_marker(path)?;
      Ok(())
   }

   fn fetch(&self, repo: &RepositoryRef, path: &Path) -> Result<()> {
      let old_head = head_sha(path).ok();

      let output = Command::new("git")
         .arg("-C")
         .arg(path)
         .args(["fetch", "--force", "origin", "+refs/heads/*:refs/heads/*"])
         .output()
         .map_err(|e| OssuaryError::Git(format!("failed to run git fetch: {e}")))?;

      if !output.status.success() {
         let stderr = String::from_utf8_lossy(&output.stderr);
         return Err(classify_remote_failure(&repo.url, &stderr));
      }

      // History rewrite between runs: old HEAD ancestry no longer present.
      // The forced refspec above already replaced the refs; just warn.
      if let Some(old) = old_head
         && !is_ancestor_of_head(path, &old)
      {
         eprintln!(
            "{}",
            style::warning(&format!("history rewrite detected in {}, refs replaced", repo.slug()))
         );
      }

      touch_marker(path)?;
      Ok(())
   }

   /// Enumerate commits on the default branch, author-time descending,
   /// filtered to `author_time <= as_of` when a cutoff is given.
   pub fn list_commits(
      &self,
      path: &Path,
      as_of: Option<DateTime<Utc>>,
   ) -> Result<Vec<RawCommit>> {
      let output = Command::new("git")
         .arg("-C")
         .arg(path)
         .args(["log", "HEAD", "--format=%H%x00%an%x00%ae%x00%aI%x00%B%x1e"])
         .output()
         .map_err(|e| OssuaryError::Git(format!("failed to run git log: {e}")))?;

      if !output.status.success() {
         let stderr = String::from_utf8_lossy(&output.stderr);
         return Err(OssuaryError::Git(format!("git log failed: {stderr}")));
      }

      let stdout = String::from_utf8_lossy(&output.stdout);
      let mut commits = parse_log_records(&stdout)?;
      if let Some(cutoff) = as_of {
         commits.retain(|c| c.author_time <= cutoff);
      }
      commits.sort_by(|a, b| b.author_time.cmp(&a.author_time).then(a.sha.cmp(&b.sha)));
      Ok(commits)
   }
}

/// Parse `%H%x00%an%x00%ae%x00%aI%x00%B%x1e`-delimited log output.
fn parse_log_records(stdout: &str) -> Result<Vec<RawCommit>> {
   let mut commits = Vec::new();
   for record in stdout.split('\u{1e}') {
      let record = record.trim_matches(['\n', ' ']);
      if record.is_empty() {
         continue;
      }
      let parts: Vec<&str> = record.splitn(5, '\0').collect();
      if parts.len() < 5 {
         let snippet: String = record.chars().take(80).collect();
         return Err(OssuaryError::Git(format!(
            "malformed log record ({} fields): {snippet}",
            parts.len()
         )));
      }
      let author_time = DateTime::parse_from_rfc3339(parts[3])
         .map_err(|e| OssuaryError::Git(format!("bad author date {}: {e}", parts[3])))?
         .with_timezone(&Utc);
      commits.push(RawCommit {
         sha:          parts[0].to_string(),
         author_name:  parts[1].to_string(),
         author_email: parts[2].to_string(),
         author_time,
         message:      parts[4].trim_end().to_string(),
      });
   }
   Ok(commits)
}

fn head_sha(path: &Path) -> Result<String> {
   let output = Command::new("git")
      .arg("-C")
      .arg(path)
      .args(["rev-parse", "HEAD"])
      .output()
      .map_err(|e| OssuaryError::Git(format!("failed to run git rev-parse: {e}")))?;
   if !output.status.success() {
      return Err(OssuaryError::Git("git rev-parse HEAD failed".to_string()));
   }
   Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn is_ancestor_of_head(path: &Path, sha: &str) -> bool {
   Command::new("git")
      .arg("-C")
      .arg(path)
      .args(["merge-base", "--is-ancestor", sha, "HEAD"])
      .status()
      .map(|s| s.success())
      .unwrap_or(false)
}

fn fetch_is_fresh(path: &Path) -> bool {
   fs::metadata(path.join(FETCH_MARKER))
      .and_then(|m| m.modified())
      .ok()
      .and_then(|t| t.elapsed().ok())
      .is_some_and(|age| age < FETCH_MAX_AGE)
}

fn touch_marker(path: &Path) -> Result<()> {
   fs::write(path.join(FETCH_MARKER), Utc::now().to_rfc3339())?;
   Ok(())
}

/// Sort network failures into the error taxonomy: gone repositories are
/// terminal, transport problems are transient, everything else is a plain
/// git failure.
fn classify_remote_failure(url: &str, stderr: &str) -> OssuaryError {
   let lower = stderr.to_ascii_lowercase();
   if lower.contains("repository not found")
      || lower.contains("not found")
      || lower.contains("dmca")
      || lower.contains("access blocked")
      || lower.contains("403")
   {
      return OssuaryError::RepoGone(format!("{url}: {}", stderr.trim()));
   }
   if lower.contains("could not resolve host")
      || lower.contains("failed to connect")
      || lower.contains("timed out")
      || lower.contains("connection reset")
      || lower.contains("early eof")
      || lower.contains("remote end hung up")
   {
      return OssuaryError::Transient(format!("{url}: {}", stderr.trim()));
   }
   OssuaryError::Git(format!("{url}: {}", stderr.trim()))
}

/// Exclusive marker file serializing fetches across processes. A stale lock
/// (older than 10 minutes) is treated as abandoned and taken over.
struct LockFile {
   path: PathBuf,
}

impl LockFile {
   fn acquire(repo_path: &Path) -> Result<Self> {
      let path = repo_path.with_extension("git.lock");
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }
      loop {
         match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => return Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
               let stale = fs::metadata(&path)
                  .and_then(|m| m.modified())
                  .ok()
                  .and_then(|t| t.elapsed().ok())
                  .is_some_and(|age| age > LOCK_STALE_AGE);
               if stale {
                  let _ = fs::remove_file(&path);
                  continue;
               }
               thread::sleep(Duration::from_millis(250));
            },
            Err(e) => return Err(e.into()),
         }
      }
   }
}

impl Drop for LockFile {
   fn drop(&mut self) {
      let _ = fs::remove_file(&self.path);
   }
}
