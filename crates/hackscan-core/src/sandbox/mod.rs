//! Remote sandbox seam
//!
//! Every call is fallible and none is fatal to a job: the execution agent
//! turns each error into a step outcome where it happens.

pub mod fallback;
pub mod local;

pub use fallback::FallbackSandbox;
pub use local::LocalSandbox;

use crate::error::SandboxError;
use crate::repository::RepoSnapshot;
use async_trait::async_trait;
use std::time::Duration;

/// Conventional exit code of a command killed by its timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Command a fresh session must run before it is trusted with work
pub const LIVENESS_COMMAND: &str = "echo ready";

/// Longest session name providers are asked to accept
const MAX_SESSION_NAME: usize = 50;

/// Finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    #[inline]
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Output for a command stopped by its timeout
    #[must_use]
    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            exit_code: TIMEOUT_EXIT_CODE,
            stdout: String::new(),
            stderr: format!("command timed out after {}s", timeout.as_secs()),
            timed_out: true,
        }
    }

    /// stdout followed by stderr
    #[must_use]
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Handle to a background process inside a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub id: String,
}

/// Isolated compute sessions
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Platform name reported in execution summaries
    fn platform(&self) -> &str;

    /// Platform actually serving `session`; providers that route sessions
    /// to other providers override this
    fn session_platform(&self, _session: &str) -> String {
        self.platform().to_string()
    }

    /// Provision a session holding a copy of the snapshot; returns the session id
    async fn create(&self, snapshot: &RepoSnapshot, name: &str) -> Result<String, SandboxError>;

    /// Run a command to completion in the repository directory
    ///
    /// Exceeding `timeout` is not an error: the output carries
    /// [`TIMEOUT_EXIT_CODE`] and `timed_out`.
    async fn run(
        &self,
        session: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, SandboxError>;

    /// Start a long-running process
    async fn start_background(&self, session: &str, command: &str) -> Result<ProcessHandle, SandboxError>;

    /// Output captured from a background process so far
    async fn background_logs(
        &self,
        _session: &str,
        _handle: &ProcessHandle,
    ) -> Result<String, SandboxError> {
        Ok(String::new())
    }

    /// Externally reachable URL for a port
    async fn public_url(&self, session: &str, port: u16) -> Result<String, SandboxError>;

    /// Release the session and everything running in it
    async fn destroy(&self, session: &str) -> Result<(), SandboxError>;
}

/// Check that `session` answers [`LIVENESS_COMMAND`] within `timeout`
///
/// # Errors
/// `SandboxError::Unresponsive` when the command errors, exits non-zero or
/// does not return in time
pub async fn check_liveness(
    provider: &dyn SandboxProvider,
    session: &str,
    timeout: Duration,
) -> Result<(), SandboxError> {
    match tokio::time::timeout(timeout, provider.run(session, LIVENESS_COMMAND, timeout)).await {
        Ok(Ok(out)) if out.success() => Ok(()),
        Ok(Ok(out)) => Err(SandboxError::Unresponsive(format!(
            "liveness check exited with {}",
            out.exit_code
        ))),
        Ok(Err(e)) => Err(SandboxError::Unresponsive(e.to_string())),
        Err(_) => Err(SandboxError::Unresponsive(format!(
            "no answer within {}s",
            timeout.as_secs()
        ))),
    }
}

/// Session name from project and repository names
///
/// Lowercase, whitespace to hyphens, other punctuation dropped, at most 50
/// characters.
#[must_use]
pub fn session_name(project: &str, repository: &str) -> String {
    let raw = format!("{project}-{repository}").to_lowercase();
    let mut name = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_whitespace() {
            name.push('-');
        } else if c.is_ascii_alphanumeric() || c == '-' {
            name.push(c);
        }
    }
    let name: String = name.chars().take(MAX_SESSION_NAME).collect();
    let name = name.trim_matches('-');
    if name.is_empty() {
        "hackscan".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_names() {
        assert_eq!(session_name("My Cool App", "cool-app"), "my-cool-app-cool-app");
        assert_eq!(session_name("Ünïcode!", "repo"), "ncode-repo");
        let long = session_name(&"x".repeat(80), "repo");
        assert_eq!(long.len(), 50);
        assert_eq!(session_name("!!!", ""), "hackscan");
    }

    #[test]
    fn command_output_helpers() {
        let out = CommandOutput::timed_out(Duration::from_secs(3));
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(!out.success());
        let out = CommandOutput {
            stdout: "a".into(),
            stderr: "b".into(),
            ..CommandOutput::default()
        };
        assert!(out.success());
        assert_eq!(out.combined(), "a\nb");
    }
}
