//! Local process sandbox
//!
//! Copies the snapshot into a scratch directory and runs commands there
//! with `sh -c`. Commands start from an empty environment: only the
//! variables in [`PASSTHROUGH_ENV`] are copied from the host, and `HOME`
//! points at the session's scratch directory. Processes still share the
//! host's file system and network, so this is meant for development.

use super::{CommandOutput, ProcessHandle, SandboxProvider};
use crate::error::SandboxError;
use crate::repository::RepoSnapshot;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use ulid::Ulid;
use walkdir::WalkDir;

/// Host variables a project may see
pub const PASSTHROUGH_ENV: &[&str] = &["PATH", "LANG", "LC_ALL", "TZ"];

struct BackgroundProcess {
    id: String,
    child: Child,
    log_path: PathBuf,
}

struct LocalSession {
    scratch: TempDir,
    workdir: PathBuf,
    processes: Mutex<Vec<BackgroundProcess>>,
}

/// Sandbox backed by local child processes
#[derive(Default)]
pub struct LocalSandbox {
    sessions: DashMap<String, LocalSession>,
}

impl LocalSandbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live session count
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn workdir(&self, session: &str) -> Result<PathBuf, SandboxError> {
        self.sessions
            .get(session)
            .map(|s| s.workdir.clone())
            .ok_or_else(|| SandboxError::UnknownSession(session.to_string()))
    }
}

/// `sh -c command` in `workdir` with a scrubbed environment
fn shell(workdir: &Path, command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(workdir)
        .env_clear()
        .env("HOME", workdir.parent().unwrap_or(workdir))
        .stdin(Stdio::null())
        .kill_on_drop(true);
    for key in PASSTHROUGH_ENV {
        if let Some(value) = std::env::var_os(key) {
            cmd.env(key, value);
        }
    }
    cmd
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(from)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git")
    {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry.path().strip_prefix(from).map_err(std::io::Error::other)?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl SandboxProvider for LocalSandbox {
    fn platform(&self) -> &str {
        "local"
    }

    async fn create(&self, snapshot: &RepoSnapshot, name: &str) -> Result<String, SandboxError> {
        let scratch = tempfile::Builder::new()
            .prefix("hackscan-sandbox-")
            .tempdir()
            .map_err(|e| SandboxError::Provision(e.to_string()))?;
        let workdir = scratch.path().join("repo");
        let source = snapshot.root().to_path_buf();
        let target = workdir.clone();
        tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(|e| SandboxError::Provision(e.to_string()))?
            .map_err(|e| SandboxError::Provision(format!("copying repository: {e}")))?;

        let id = format!("{name}-{}", Ulid::new().to_string().to_lowercase());
        self.sessions.insert(
            id.clone(),
            LocalSession {
                scratch,
                workdir,
                processes: Mutex::new(Vec::new()),
            },
        );
        tracing::debug!(session = %id, "local sandbox created");
        Ok(id)
    }

    async fn run(
        &self,
        session: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, SandboxError> {
        let workdir = self.workdir(session)?;
        let child = shell(&workdir, command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::Command(format!("{command}: {e}")))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                timed_out: false,
            }),
            Ok(Err(e)) => Err(SandboxError::Command(format!("{command}: {e}"))),
            // dropping the future kills the child
            Err(_) => Ok(CommandOutput::timed_out(timeout)),
        }
    }

    async fn start_background(&self, session: &str, command: &str) -> Result<ProcessHandle, SandboxError> {
        let workdir = self.workdir(session)?;
        let id = format!("proc-{}", Ulid::new().to_string().to_lowercase());
        let log_path = workdir
            .parent()
            .unwrap_or(&workdir)
            .join(format!("{id}.log"));
        let log = File::create(&log_path)?;
        let log_err = log.try_clone()?;

        let child = shell(&workdir, command)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| SandboxError::Background(format!("{command}: {e}")))?;

        let entry = self
            .sessions
            .get(session)
            .ok_or_else(|| SandboxError::UnknownSession(session.to_string()))?;
        entry.processes.lock().push(BackgroundProcess {
            id: id.clone(),
            child,
            log_path,
        });
        Ok(ProcessHandle { id })
    }

    async fn background_logs(&self, session: &str, handle: &ProcessHandle) -> Result<String, SandboxError> {
        let log_path = self
            .sessions
            .get(session)
            .ok_or_else(|| SandboxError::UnknownSession(session.to_string()))?
            .processes
            .lock()
            .iter()
            .find(|p| p.id == handle.id)
            .map(|p| p.log_path.clone())
            .ok_or_else(|| SandboxError::Background(format!("unknown process {}", handle.id)))?;
        Ok(tokio::fs::read_to_string(&log_path).await.unwrap_or_default())
    }

    async fn public_url(&self, session: &str, port: u16) -> Result<String, SandboxError> {
        if !self.sessions.contains_key(session) {
            return Err(SandboxError::UnknownSession(session.to_string()));
        }
        Ok(format!("http://127.0.0.1:{port}"))
    }

    async fn destroy(&self, session: &str) -> Result<(), SandboxError> {
        let (_, local) = self
            .sessions
            .remove(session)
            .ok_or_else(|| SandboxError::UnknownSession(session.to_string()))?;
        let mut processes = local.processes.into_inner();
        for process in &mut processes {
            if let Err(e) = process.child.kill().await {
                tracing::debug!(process = %process.id, error = %e, "background process already exited");
            }
        }
        let path = local.scratch.path().to_path_buf();
        local
            .scratch
            .close()
            .map_err(|e| SandboxError::Teardown(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sandbox_with_repo() -> (tempfile::TempDir, LocalSandbox, String) {
        let repo = tempfile::tempdir().unwrap();
        std::fs::write(repo.path().join("hello.txt"), "hi there").unwrap();
        std::fs::create_dir(repo.path().join(".git")).unwrap();
        let sandbox = LocalSandbox::new();
        let snapshot = RepoSnapshot::borrowed(repo.path(), "file://repo");
        let id = sandbox.create(&snapshot, "proj-repo").await.unwrap();
        (repo, sandbox, id)
    }

    #[tokio::test]
    async fn runs_commands_in_copy() {
        let (_repo, sandbox, id) = sandbox_with_repo().await;
        assert!(id.starts_with("proj-repo-"));

        let out = sandbox.run(&id, "cat hello.txt; test -d .git || echo nogit", Duration::from_secs(5)).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hi therenogit\n");

        let out = sandbox.run(&id, "exit 3", Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn host_environment_is_not_inherited() {
        std::env::set_var("HACKSCAN_SANDBOX_SECRET", "sk-host-secret");
        let (_repo, sandbox, id) = sandbox_with_repo().await;

        let out = sandbox
            .run(
                &id,
                "echo key=$HACKSCAN_SANDBOX_SECRET; echo path=${PATH:+set}; case \"$HOME\" in *hackscan-sandbox-*) echo home=scratch;; esac",
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, "key=\npath=set\nhome=scratch\n");

        let out = sandbox.run(&id, "PORT=4100 sh -c 'echo $PORT'", Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.stdout, "4100\n");

        let handle = sandbox.start_background(&id, "echo bg=$HACKSCAN_SANDBOX_SECRET").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let logs = sandbox.background_logs(&id, &handle).await.unwrap();
        assert_eq!(logs, "bg=\n");
        sandbox.destroy(&id).await.unwrap();
    }

    #[tokio::test]
    async fn timeout_yields_124() {
        let (_repo, sandbox, id) = sandbox_with_repo().await;
        let out = sandbox.run(&id, "sleep 5", Duration::from_millis(100)).await.unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, super::super::TIMEOUT_EXIT_CODE);
    }

    #[tokio::test]
    async fn background_and_destroy() {
        let (_repo, sandbox, id) = sandbox_with_repo().await;
        let handle = sandbox.start_background(&id, "echo started; sleep 30").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let logs = sandbox.background_logs(&id, &handle).await.unwrap();
        assert!(logs.contains("started"));

        assert_eq!(sandbox.public_url(&id, 3000).await.unwrap(), "http://127.0.0.1:3000");
        sandbox.destroy(&id).await.unwrap();
        assert_eq!(sandbox.session_count(), 0);
        assert!(matches!(
            sandbox.run(&id, "true", Duration::from_secs(1)).await,
            Err(SandboxError::UnknownSession(_))
        ));
    }
}
