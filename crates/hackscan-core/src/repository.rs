//! Repository providers
//!
//! Turn a submitted URL/branch into a local file tree. Failures here are
//! fatal to the job.

use crate::error::RepositoryError;
use crate::workspace::RepoWorkspace;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;

/// Checked-out repository
///
/// When the snapshot owns a scratch directory, dropping it removes the clone.
#[derive(Debug)]
pub struct RepoSnapshot {
    root: PathBuf,
    source_url: String,
    branch: Option<String>,
    _scratch: Option<TempDir>,
}

impl RepoSnapshot {
    /// Snapshot over an existing directory
    #[must_use]
    pub fn borrowed(root: impl Into<PathBuf>, source_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            source_url: source_url.into(),
            branch: None,
            _scratch: None,
        }
    }

    /// Snapshot that owns its scratch directory
    #[must_use]
    pub fn owned(scratch: TempDir, root: PathBuf, source_url: impl Into<String>) -> Self {
        Self {
            root,
            source_url: source_url.into(),
            branch: None,
            _scratch: Some(scratch),
        }
    }

    /// With branch
    #[inline]
    #[must_use]
    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self
    }

    /// Checkout root
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// URL this snapshot was fetched from
    #[inline]
    #[must_use]
    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// Branch, if one was requested
    #[inline]
    #[must_use]
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    /// Read-only query surface over the checkout
    #[inline]
    #[must_use]
    pub fn workspace(&self) -> RepoWorkspace {
        RepoWorkspace::new(self.root.clone())
    }
}

/// Source of repository checkouts
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    /// Fetch `url` at `branch` (default branch when `None`)
    async fn fetch(&self, url: &str, branch: Option<&str>) -> Result<RepoSnapshot, RepositoryError>;
}

/// Shallow `git clone` into a temporary directory
#[derive(Debug, Clone)]
pub struct GitRepositoryProvider {
    git_binary: String,
    clone_timeout: Duration,
}

impl GitRepositoryProvider {
    /// Create provider using `git` from `PATH`
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With clone timeout
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.clone_timeout = timeout;
        self
    }

    /// With a specific git binary
    #[inline]
    #[must_use]
    pub fn with_git_binary(mut self, binary: impl Into<String>) -> Self {
        self.git_binary = binary.into();
        self
    }
}

impl Default for GitRepositoryProvider {
    fn default() -> Self {
        Self {
            git_binary: "git".to_string(),
            clone_timeout: Duration::from_secs(120),
        }
    }
}

#[async_trait]
impl RepositoryProvider for GitRepositoryProvider {
    async fn fetch(&self, url: &str, branch: Option<&str>) -> Result<RepoSnapshot, RepositoryError> {
        let scratch = tempfile::Builder::new().prefix("hackscan-repo-").tempdir()?;
        let target = scratch.path().join("repo");

        let mut command = Command::new(&self.git_binary);
        command
            .arg("clone")
            .arg("--depth")
            .arg("1")
            .arg("--single-branch");
        if let Some(branch) = branch {
            command.arg("--branch").arg(branch);
        }
        command
            .arg("--")
            .arg(url)
            .arg(&target)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        tracing::debug!(url, ?branch, "cloning repository");
        let output = tokio::time::timeout(self.clone_timeout, command.output())
            .await
            .map_err(|_| RepositoryError::Timeout {
                secs: self.clone_timeout.as_secs(),
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_clone_failure(url, &stderr));
        }

        Ok(RepoSnapshot::owned(scratch, target, url).with_branch(branch.map(str::to_string)))
    }
}

/// Map git's stderr onto the repository error taxonomy
fn classify_clone_failure(url: &str, stderr: &str) -> RepositoryError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("rate limit") || lower.contains("429") {
        RepositoryError::RateLimited(url.to_string())
    } else if lower.contains("authentication failed")
        || lower.contains("could not read username")
        || lower.contains("permission denied")
        || lower.contains("403")
    {
        RepositoryError::AccessDenied(url.to_string())
    } else if lower.contains("not found") || lower.contains("does not exist") {
        RepositoryError::NotFound(url.to_string())
    } else {
        RepositoryError::CloneFailed(stderr.trim().lines().last().unwrap_or("git clone failed").to_string())
    }
}

/// Serves an existing local directory (`/path` or `file:///path`)
#[derive(Debug, Clone, Default)]
pub struct LocalRepositoryProvider;

#[async_trait]
impl RepositoryProvider for LocalRepositoryProvider {
    async fn fetch(&self, url: &str, branch: Option<&str>) -> Result<RepoSnapshot, RepositoryError> {
        let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| RepositoryError::NotFound(url.to_string()))?;
        if !metadata.is_dir() {
            return Err(RepositoryError::NotFound(url.to_string()));
        }
        Ok(RepoSnapshot::borrowed(path, url).with_branch(branch.map(str::to_string)))
    }
}

/// Chooses local or git by the shape of the URL
#[derive(Debug, Clone, Default)]
pub struct AutoRepositoryProvider {
    git: GitRepositoryProvider,
    local: LocalRepositoryProvider,
}

impl AutoRepositoryProvider {
    /// With a configured git provider
    #[inline]
    #[must_use]
    pub fn new(git: GitRepositoryProvider) -> Self {
        Self {
            git,
            local: LocalRepositoryProvider,
        }
    }
}

#[async_trait]
impl RepositoryProvider for AutoRepositoryProvider {
    async fn fetch(&self, url: &str, branch: Option<&str>) -> Result<RepoSnapshot, RepositoryError> {
        if url.starts_with("file://") || url.starts_with('/') || url.starts_with('.') {
            self.local.fetch(url, branch).await
        } else {
            self.git.fetch(url, branch).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_failures_are_classified() {
        let url = "https://github.com/a/b";
        assert!(matches!(
            classify_clone_failure(url, "remote: Repository not found.\nfatal: repository 'x' not found"),
            RepositoryError::NotFound(_)
        ));
        assert!(matches!(
            classify_clone_failure(url, "fatal: could not read Username for 'https://github.com'"),
            RepositoryError::AccessDenied(_)
        ));
        assert!(matches!(
            classify_clone_failure(url, "error: API rate limit exceeded"),
            RepositoryError::RateLimited(_)
        ));
        assert!(matches!(
            classify_clone_failure(url, "fatal: early EOF"),
            RepositoryError::CloneFailed(_)
        ));
    }

    #[tokio::test]
    async fn local_provider_serves_directory() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("file://{}", dir.path().display());
        let snapshot = LocalRepositoryProvider.fetch(&url, None).await.unwrap();
        assert_eq!(snapshot.root(), dir.path());
        assert_eq!(snapshot.source_url(), url);
    }

    #[tokio::test]
    async fn local_provider_rejects_missing_path() {
        let err = LocalRepositoryProvider
            .fetch("/definitely/not/here/hackscan", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }
}
