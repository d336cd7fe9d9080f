//! hackscan core - analysis job pipeline for hackathon submissions
//!
//! Turns a repository URL into a scored report of which sponsor
//! technologies a project integrates:
//! - a tool-using static analyzer inspects the checkout
//! - an optional execution stage runs the project in a sandbox and probes
//!   its endpoints
//! - a synthesizer folds runtime evidence back into the scores
//!
//! Jobs run in the background; clients poll the [`JobStore`] for progress.
//!
//! # Example
//!
//! ```rust,ignore
//! use hackscan_core::prelude::*;
//! use hackscan_core::GitRepositoryProvider;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = AnalysisPipeline::builder(PipelineConfig::default())
//!     .repositories(Arc::new(AutoRepositoryProvider::new(GitRepositoryProvider::new())))
//!     .reasoner(Arc::new(AnthropicReasoner::from_env()?))
//!     .publisher(Arc::new(JsonFilePublisher::new("reports")))
//!     .build()?;
//!
//! let request = AnalysisRequest::new("https://github.com/team/app", "Team", "App");
//! if let Submission::Queued(job_id) = pipeline.submit(request).await? {
//!     println!("queued {job_id}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod analyzer;
pub mod config;
pub mod error;
pub mod execution;
pub mod job_store;
pub mod pipeline;
pub mod planner;
pub mod progress;
pub mod publish;
pub mod reasoning;
pub mod repository;
pub mod sandbox;
pub mod synthesis;
pub mod tools;
pub mod types;
pub mod workspace;

pub use analyzer::{AnalyzerOutcome, StaticAnalyzer, Termination};
pub use config::{ExecutionTimeouts, OutputLimits, PipelineConfig};
pub use error::{
    ConfigError, PipelineError, PublishError, ReasoningError, RepositoryError, SandboxError,
    StoreError, ToolError,
};
pub use execution::{
    EndpointProber, ExecutionAgent, ExecutionReport, HttpProber, HttpResponse, RuleBasedJudge,
    StepOutcome, VerificationFacts, VerificationJudge,
};
pub use job_store::{InMemoryJobStore, JobStore};
pub use pipeline::{AnalysisPipeline, PipelineBuilder};
pub use planner::{EndpointProbe, ExecutionPlan, ExecutionPlanner, Runtime, SponsorVerdict};
pub use progress::{JobProgress, NoProgress, ProgressSink};
pub use publish::{JsonFilePublisher, PublishReceipt, ResultPublisher};
pub use reasoning::{
    AnthropicReasoner, ReasoningProvider, ReasoningRequest, ReasoningStep, StaticFindings,
    TranscriptEntry,
};
pub use repository::{
    AutoRepositoryProvider, GitRepositoryProvider, LocalRepositoryProvider, RepoSnapshot,
    RepositoryProvider,
};
pub use sandbox::{CommandOutput, FallbackSandbox, LocalSandbox, ProcessHandle, SandboxProvider};
pub use synthesis::{Adjustment, Synthesizer};
pub use tools::{
    InMemoryPatternMemory, LearnedPattern, PatternMemory, ToolCall, ToolDispatcher, ToolOutput,
    WebResult, WebSearch,
};
pub use types::{
    AnalysisRequest, AnalysisResult, EndpointTestResult, Evidence, ExecutionResults,
    ExecutionSummary, Fingerprint, JobId, JobRecord, JobStatus, PerformanceMetrics,
    RepositoryStats, Sponsor, SponsorAnalysis, Submission, TeamMember,
};
pub use workspace::RepoWorkspace;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for wiring and driving a pipeline
    pub use crate::{
        AnalysisPipeline, AnalysisRequest, AnalysisResult, AnthropicReasoner,
        AutoRepositoryProvider, FallbackSandbox, JobId, JobStatus, JobStore, JsonFilePublisher,
        LocalSandbox, PipelineConfig, Sponsor, Submission, TeamMember,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
