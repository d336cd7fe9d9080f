//! Reasoning provider seam
//!
//! A provider sees the system prompt, the task, and the transcript so far,
//! and answers with exactly one [`ReasoningStep`]: either a tool invocation
//! or the final structured findings.

pub mod anthropic;

pub use anthropic::AnthropicReasoner;

use crate::error::ReasoningError;
use crate::tools::{ToolCall, ToolOutput};
use crate::types::{AnalysisRequest, AnalysisResult, RepositoryStats, Sponsor, SponsorAnalysis};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// One exchange in the analyzer transcript
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEntry {
    /// The model asked for a tool
    ToolUse { id: String, call: ToolCall },
    /// What the tool answered
    ToolResult { id: String, output: ToolOutput },
    /// Loop-issued note after an unusable step (bad tool name, bad arguments)
    Correction(String),
}

/// Input for one reasoning step
#[derive(Debug, Clone, Copy)]
pub struct ReasoningRequest<'a> {
    pub system: &'a str,
    pub task: &'a str,
    pub transcript: &'a [TranscriptEntry],
    /// When false only the final-answer tool is offered
    pub tools_enabled: bool,
    pub iteration: u32,
}

/// What the provider decided to do next
#[derive(Debug, Clone, PartialEq)]
pub enum ReasoningStep {
    ToolUse { id: String, call: ToolCall },
    Final(StaticFindings),
}

/// Tool-calling model behind the static analyzer
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &'static str;

    /// Produce the next step
    async fn next_step(&self, request: ReasoningRequest<'_>) -> Result<ReasoningStep, ReasoningError>;
}

/// Structured answer of the static analysis
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticFindings {
    pub sponsors: BTreeMap<Sponsor, SponsorAnalysis>,
    pub overall_summary: String,
    pub innovative_aspects: Vec<String>,
}

impl StaticFindings {
    /// Decode the `submit_analysis` payload
    ///
    /// Unknown sponsor keys are dropped; scores given as floats are rounded
    /// and clamped.
    ///
    /// # Errors
    /// `MalformedResponse` when the payload is not an object or a sponsor
    /// entry does not decode
    pub fn from_value(value: &Value) -> Result<Self, ReasoningError> {
        let object = value
            .as_object()
            .ok_or_else(|| ReasoningError::MalformedResponse("findings must be an object".into()))?;

        let mut sponsors = BTreeMap::new();
        if let Some(entries) = object.get("sponsors").and_then(Value::as_object) {
            for (key, raw) in entries {
                let Ok(sponsor) = key.parse::<Sponsor>() else {
                    tracing::debug!(sponsor = %key, "dropping unknown sponsor from findings");
                    continue;
                };
                let mut raw = raw.clone();
                coerce_score(&mut raw);
                let analysis: SponsorAnalysis = serde_json::from_value(raw).map_err(|e| {
                    ReasoningError::MalformedResponse(format!("sponsor {key}: {e}"))
                })?;
                sponsors.insert(sponsor, analysis);
            }
        }

        Ok(Self {
            sponsors,
            overall_summary: object
                .get("overallSummary")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            innovative_aspects: object
                .get("innovativeAspects")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }

    /// Build the first-pass result; every sponsor is present afterwards
    #[must_use]
    pub fn into_result(self, request: &AnalysisRequest, stats: RepositoryStats) -> AnalysisResult {
        let mut result = AnalysisResult::empty(request, stats);
        result.sponsors.extend(self.sponsors);
        result.overall_summary = self.overall_summary;
        result.innovative_aspects = self.innovative_aspects;
        result.normalize();
        result
    }
}

fn coerce_score(raw: &mut Value) {
    let Some(score) = raw.get_mut("integrationScore") else {
        return;
    };
    if let Some(f) = score.as_f64() {
        // clamped to 0..=10 first, so the cast is lossless
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let clamped = f.round().clamp(0.0, 10.0) as u8;
        *score = Value::from(clamped);
    }
}

/// System prompt for the static analyzer
#[must_use]
pub fn system_prompt() -> String {
    let mut prompt = String::from(
        "You are a senior engineer judging a hackathon. Inspect the repository with the \
         tools provided and decide, for each sponsor technology, whether the project \
         integrates it and how deeply.\n\nSponsors:\n",
    );
    for sponsor in Sponsor::ALL {
        let _ = writeln!(prompt, "- {} (key `{}`)", sponsor.display_name(), sponsor.as_str());
    }
    prompt.push_str(
        "\nScoring: 0 means absent, 1-3 a dependency or trivial call, 4-6 a working \
         integration on a secondary path, 7-10 a central, well-built integration. \
         Confidence is your certainty in the verdict, 0.0 to 1.0. Cite files and short \
         snippets as evidence. Prefer reading code over guessing from names.\n\n\
         When you are done, call `submit_analysis` exactly once with an entry for every \
         sponsor key.",
    );
    prompt
}

/// Task prompt describing the submission
#[must_use]
pub fn task_prompt(request: &AnalysisRequest, stats: &RepositoryStats) -> String {
    let mut task = format!(
        "Analyze the project \"{}\" by team \"{}\".\nRepository: {}\n",
        request.project_name, request.team_name, request.repository_url
    );
    if let Some(branch) = &request.branch {
        let _ = writeln!(task, "Branch: {branch}");
    }
    let _ = writeln!(
        task,
        "Main language: {}. Files: {}. Tests present: {}.",
        stats.main_language,
        stats.file_count,
        if stats.has_tests { "yes" } else { "no" }
    );
    if stats.dependencies.is_empty() {
        task.push_str("No dependency manifest was found.\n");
    } else {
        let _ = writeln!(task, "Dependencies: {}", stats.dependencies.join(", "));
    }
    task
}
