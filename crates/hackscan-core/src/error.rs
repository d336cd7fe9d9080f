//! Error types for the analysis pipeline
//!
//! Errors are layered by concern:
//! - `PipelineError` is what a job run surfaces; `is_fatal` decides whether
//!   the job ends up `failed`
//! - collaborator errors (`RepositoryError`, `ReasoningError`, `SandboxError`,
//!   `PublishError`) describe failures at a single external boundary
//! - `StoreError` guards the job record state machine
//!
//! Execution-stage errors never become a `PipelineError`: the execution agent
//! turns them into step outcomes where they occur.

use crate::types::{JobId, JobStatus};
use std::path::PathBuf;

/// Top-level error for a job run
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The submitted request is malformed
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Repository could not be fetched
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Reasoning provider failed
    #[error("reasoning provider error: {0}")]
    Reasoning(#[from] ReasoningError),

    /// Job store rejected an update
    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    /// Pipeline was assembled with an invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Another run already owns this job
    #[error("job {0} is already running")]
    AlreadyRunning(JobId),
}

impl PipelineError {
    /// Whether this error aborts the job (status becomes `failed`)
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_) | Self::Repository(_) | Self::Reasoning(_)
        )
    }
}

/// Job store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record for this job
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Record already exists
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// Status change violates pending -> analyzing -> {complete|failed}
    #[error("job {job}: illegal transition {from} -> {to}")]
    InvalidTransition {
        job: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// Terminal states carry a payload and must go through `set_result`/`fail`
    #[error("job {job}: status {status} must be set with its payload")]
    PayloadRequired { job: JobId, status: JobStatus },
}

/// Repository provider errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Repository does not exist
    #[error("repository not found: {0}")]
    NotFound(String),

    /// Repository is private or credentials were rejected
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Hosting provider rate-limited the request
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Clone failed for another reason
    #[error("clone failed: {0}")]
    CloneFailed(String),

    /// Clone did not finish in time
    #[error("clone timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Path escapes the repository or does not exist
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasoning provider errors
#[derive(Debug, thiserror::Error)]
pub enum ReasoningError {
    /// Provider cannot be reached
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// No API key configured
    #[error("missing API key for {0}")]
    MissingApiKey(&'static str),

    /// Provider answered with a non-success status
    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Response could not be interpreted
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Model asked for a tool we do not offer
    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

impl ReasoningError {
    /// Errors that mean the provider itself is unusable, as opposed to a single
    /// bad answer the loop can recover from
    #[inline]
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::MissingApiKey(_) => true,
            Self::Http { status, .. } => *status == 401 || *status == 403 || *status >= 500,
            Self::MalformedResponse(_) | Self::UnknownTool(_) => false,
        }
    }
}

/// Tool execution errors, reported back to the model as tool output
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Repository query failed
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Web search backend failed
    #[error("web search failed: {0}")]
    Search(String),
}

/// Remote sandbox errors
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Session could not be created
    #[error("provisioning failed: {0}")]
    Provision(String),

    /// Command could not be launched
    #[error("command failed to launch: {0}")]
    Command(String),

    /// Background process could not be started
    #[error("background process failed: {0}")]
    Background(String),

    /// No public URL for the requested port
    #[error("no public url: {0}")]
    Url(String),

    /// Session was created but does not run commands
    #[error("session not responsive: {0}")]
    Unresponsive(String),

    /// Session teardown failed
    #[error("teardown failed: {0}")]
    Teardown(String),

    /// Session id is unknown to the provider
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result persistence errors
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Document could not be encoded
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Backend rejected the document
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid value: {0}")]
    Invalid(String),

    /// A required collaborator was not supplied
    #[error("missing component: {0}")]
    MissingComponent(&'static str),
}
