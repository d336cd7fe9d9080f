//! Static analyzer
//!
//! Bounded tool-calling loop over a checkout. Each iteration asks the
//! reasoning provider for one step and either dispatches the requested tool
//! or stops on final findings. Reaching the iteration cap is a degradation:
//! one last request is made with only the final-answer tool offered, and if
//! that yields nothing the analyzer still returns a partial result.

use crate::error::PipelineError;
use crate::progress::ProgressSink;
use crate::reasoning::{
    system_prompt, task_prompt, ReasoningProvider, ReasoningRequest, ReasoningStep,
    StaticFindings, TranscriptEntry,
};
use crate::repository::RepoSnapshot;
use crate::tools::{PatternMemory, ToolCall, ToolDispatcher, WebSearch};
use crate::types::{AnalysisRequest, AnalysisResult, RepositoryStats};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Provider submitted findings within the cap
    Final,
    /// Cap reached and the forced final request produced findings
    CapRecovered,
    /// Cap reached without findings; the result is partial
    IterationCap,
}

/// Analyzer output
#[derive(Debug, Clone)]
pub struct AnalyzerOutcome {
    pub result: AnalysisResult,
    pub iterations: u32,
    pub termination: Termination,
    pub files_examined: Vec<String>,
}

/// Loop state carried between iterations
#[derive(Debug, Default)]
struct LoopState {
    iteration: u32,
    transcript: Vec<TranscriptEntry>,
    files_examined: BTreeSet<String>,
}

/// Tool-using static analyzer
#[derive(Clone)]
pub struct StaticAnalyzer {
    reasoner: Arc<dyn ReasoningProvider>,
    memory: Option<Arc<dyn PatternMemory>>,
    web: Option<Arc<dyn WebSearch>>,
    max_iterations: u32,
    tool_output_limit: usize,
}

impl StaticAnalyzer {
    #[must_use]
    pub fn new(reasoner: Arc<dyn ReasoningProvider>, max_iterations: u32, tool_output_limit: usize) -> Self {
        Self {
            reasoner,
            memory: None,
            web: None,
            max_iterations,
            tool_output_limit,
        }
    }

    #[must_use]
    pub fn with_memory(mut self, memory: Option<Arc<dyn PatternMemory>>) -> Self {
        self.memory = memory;
        self
    }

    #[must_use]
    pub fn with_web_search(mut self, web: Option<Arc<dyn WebSearch>>) -> Self {
        self.web = web;
        self
    }

    /// Run the loop to completion
    ///
    /// # Errors
    /// `PipelineError::Repository` when the checkout cannot be scanned and
    /// `PipelineError::Reasoning` when the provider is unavailable; both are
    /// fatal to the job
    pub async fn analyze(
        &self,
        request: &AnalysisRequest,
        snapshot: &RepoSnapshot,
        progress: &dyn ProgressSink,
    ) -> Result<AnalyzerOutcome, PipelineError> {
        progress.report("Scanning repository structure".to_string()).await;
        let workspace = snapshot.workspace();
        let stats = workspace.stats().await?;
        tracing::info!(
            language = %stats.main_language,
            files = stats.file_count,
            dependencies = stats.dependencies.len(),
            "repository scanned"
        );

        let tools = ToolDispatcher::new(workspace, self.tool_output_limit)
            .with_memory(self.memory.clone())
            .with_web_search(self.web.clone());
        let system = system_prompt();
        let task = task_prompt(request, &stats);
        let mut state = LoopState::default();

        while state.iteration < self.max_iterations {
            state.iteration += 1;
            let step = self
                .reasoner
                .next_step(ReasoningRequest {
                    system: &system,
                    task: &task,
                    transcript: &state.transcript,
                    tools_enabled: true,
                    iteration: state.iteration,
                })
                .await;

            match step {
                Ok(ReasoningStep::Final(findings)) => {
                    return Ok(finish(findings, request, stats, state, Termination::Final));
                }
                Ok(ReasoningStep::ToolUse { id, call }) => {
                    progress
                        .report(format!("[Iteration {}] {}", state.iteration, call.describe()))
                        .await;
                    if let ToolCall::ReadFile { path } = &call {
                        state.files_examined.insert(path.clone());
                    }
                    let output = tools.dispatch(&call).await;
                    tracing::debug!(
                        iteration = state.iteration,
                        tool = call.name(),
                        is_error = output.is_error,
                        bytes = output.content.len(),
                        "tool call"
                    );
                    state.transcript.push(TranscriptEntry::ToolUse { id: id.clone(), call });
                    state.transcript.push(TranscriptEntry::ToolResult { id, output });
                }
                Err(e) if e.is_unavailable() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(iteration = state.iteration, error = %e, "unusable reasoning step");
                    state.transcript.push(TranscriptEntry::Correction(format!(
                        "Your last reply could not be used ({e}). Call one of the provided tools, \
                         or submit_analysis when you are done."
                    )));
                }
            }
        }

        tracing::warn!(iterations = state.iteration, "iteration cap reached");
        progress
            .report(format!(
                "Iteration cap ({}) reached, requesting final analysis",
                self.max_iterations
            ))
            .await;

        let forced = self
            .reasoner
            .next_step(ReasoningRequest {
                system: &system,
                task: &task,
                transcript: &state.transcript,
                tools_enabled: false,
                iteration: state.iteration + 1,
            })
            .await;

        match forced {
            Ok(ReasoningStep::Final(findings)) => {
                Ok(finish(findings, request, stats, state, Termination::CapRecovered))
            }
            Err(e) if e.is_unavailable() => Err(e.into()),
            other => {
                if let Err(e) = other {
                    tracing::warn!(error = %e, "forced final request failed");
                }
                Ok(partial(request, stats, state))
            }
        }
    }
}

fn finish(
    findings: StaticFindings,
    request: &AnalysisRequest,
    stats: RepositoryStats,
    state: LoopState,
    termination: Termination,
) -> AnalyzerOutcome {
    tracing::info!(iterations = state.iteration, ?termination, "static analysis finished");
    AnalyzerOutcome {
        result: findings.into_result(request, stats),
        iterations: state.iteration,
        termination,
        files_examined: state.files_examined.into_iter().collect(),
    }
}

fn partial(request: &AnalysisRequest, stats: RepositoryStats, state: LoopState) -> AnalyzerOutcome {
    let files_examined: Vec<String> = state.files_examined.into_iter().collect();
    let mut result = AnalysisResult::empty(request, stats);
    result.overall_summary = if files_examined.is_empty() {
        format!(
            "Analysis was cut short after {} iterations before findings were submitted.",
            state.iteration
        )
    } else {
        format!(
            "Analysis was cut short after {} iterations before findings were submitted. \
             Files examined: {}.",
            state.iteration,
            files_examined.join(", ")
        )
    };
    AnalyzerOutcome {
        result,
        iterations: state.iteration,
        termination: Termination::IterationCap,
        files_examined,
    }
}
