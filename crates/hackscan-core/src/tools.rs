//! Analyzer tools
//!
//! The reasoning loop may only call the fixed set of capabilities in
//! [`ToolCall`]. Every call goes through [`ToolDispatcher::dispatch`], which
//! never fails: errors come back as tool output flagged `is_error` so the
//! model can correct itself.

use crate::config::truncate;
use crate::error::{ReasoningError, ToolError};
use crate::types::Sponsor;
use crate::workspace::RepoWorkspace;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

/// Name of the pseudo-tool the model uses to hand back its findings
pub const SUBMIT_ANALYSIS: &str = "submit_analysis";

/// Most patterns kept per sponsor
const MAX_PATTERNS_PER_SPONSOR: usize = 20;

/// Most code search hits returned to the model
const MAX_SEARCH_HITS: usize = 50;

/// Repository and knowledge queries available to the analyzer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    ReadFile { path: String },
    ListDirectory { path: String },
    SearchCode { pattern: String },
    ReadDependencies,
    RecallPattern { sponsor: Sponsor },
    SearchWeb { query: String },
}

impl ToolCall {
    /// Wire name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadFile { .. } => "read_file",
            Self::ListDirectory { .. } => "list_directory",
            Self::SearchCode { .. } => "search_code",
            Self::ReadDependencies => "read_dependencies",
            Self::RecallPattern { .. } => "recall_pattern",
            Self::SearchWeb { .. } => "search_web",
        }
    }

    /// Progress text for this call
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::ReadFile { path } => format!("reading file {path}"),
            Self::ListDirectory { path } => format!("listing directory {path}"),
            Self::SearchCode { pattern } => format!("searching code for `{pattern}`"),
            Self::ReadDependencies => "reading dependency manifests".to_string(),
            Self::RecallPattern { sponsor } => format!("recalling patterns for {sponsor}"),
            Self::SearchWeb { query } => format!("searching the web for \"{query}\""),
        }
    }

    /// Arguments as sent on the wire
    #[must_use]
    pub fn input(&self) -> Value {
        match self {
            Self::ReadFile { path } | Self::ListDirectory { path } => json!({ "path": path }),
            Self::SearchCode { pattern } => json!({ "pattern": pattern }),
            Self::ReadDependencies => json!({}),
            Self::RecallPattern { sponsor } => json!({ "sponsor": sponsor.as_str() }),
            Self::SearchWeb { query } => json!({ "query": query }),
        }
    }

    /// Decode a named tool invocation
    ///
    /// # Errors
    /// `UnknownTool` for names outside the set, `MalformedResponse` for
    /// missing or mistyped arguments
    pub fn from_named(name: &str, input: &Value) -> Result<Self, ReasoningError> {
        let arg = |key: &str| {
            input
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    ReasoningError::MalformedResponse(format!("{name}: missing string `{key}`"))
                })
        };
        match name {
            "read_file" => Ok(Self::ReadFile { path: arg("path")? }),
            "list_directory" => Ok(Self::ListDirectory {
                path: input
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or(".")
                    .to_string(),
            }),
            "search_code" => Ok(Self::SearchCode {
                pattern: arg("pattern")?,
            }),
            "read_dependencies" => Ok(Self::ReadDependencies),
            "recall_pattern" => {
                let raw = arg("sponsor")?;
                let sponsor = raw.parse().map_err(ReasoningError::MalformedResponse)?;
                Ok(Self::RecallPattern { sponsor })
            }
            "search_web" => Ok(Self::SearchWeb {
                query: arg("query")?,
            }),
            other => Err(ReasoningError::UnknownTool(other.to_string())),
        }
    }
}

/// Tool result fed back to the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    fn ok(content: String) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    fn error(content: impl ToString) -> Self {
        Self {
            content: content.to_string(),
            is_error: true,
        }
    }
}

/// Tool schema offered to the model
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

/// Schemas for every repository/knowledge tool
#[must_use]
pub fn tool_definitions() -> Vec<ToolDefinition> {
    let string_arg = |key: &str, description: &str| {
        json!({
            "type": "object",
            "properties": { key: { "type": "string", "description": description } },
            "required": [key],
        })
    };
    vec![
        ToolDefinition {
            name: "read_file",
            description: "Read a text file from the repository",
            input_schema: string_arg("path", "Path relative to the repository root"),
        },
        ToolDefinition {
            name: "list_directory",
            description: "List entries of a repository directory",
            input_schema: string_arg("path", "Directory relative to the repository root, `.` for the root"),
        },
        ToolDefinition {
            name: "search_code",
            description: "Search repository source files for a regular expression",
            input_schema: string_arg("pattern", "Regular expression matched line by line"),
        },
        ToolDefinition {
            name: "read_dependencies",
            description: "Read parsed dependency manifests (package.json, requirements.txt, pyproject.toml, go.mod, Cargo.toml)",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDefinition {
            name: "recall_pattern",
            description: "Recall integration patterns learned from earlier analyses of a sponsor",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "sponsor": { "type": "string", "enum": Sponsor::ALL.map(Sponsor::as_str) }
                },
                "required": ["sponsor"],
            }),
        },
        ToolDefinition {
            name: "search_web",
            description: "Search the web for sponsor SDK documentation",
            input_schema: string_arg("query", "Search query"),
        },
    ]
}

/// Schema of the final-answer tool
#[must_use]
pub fn submit_analysis_definition() -> ToolDefinition {
    let analysis = json!({
        "type": "object",
        "properties": {
            "detected": { "type": "boolean" },
            "integrationScore": { "type": "integer", "minimum": 0, "maximum": 10 },
            "technicalSummary": { "type": "string" },
            "plainEnglishSummary": { "type": "string" },
            "evidence": {
                "type": "object",
                "properties": {
                    "files": { "type": "array", "items": { "type": "string" } },
                    "codeSnippets": { "type": "array", "items": { "type": "string" } },
                    "keyFindings": { "type": "array", "items": { "type": "string" } }
                }
            },
            "prizeEligible": { "type": "boolean" },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
            "suggestions": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["detected", "integrationScore", "confidence"],
    });
    let sponsors: serde_json::Map<String, Value> = Sponsor::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), analysis.clone()))
        .collect();
    ToolDefinition {
        name: SUBMIT_ANALYSIS,
        description: "Submit the final per-sponsor analysis. Call exactly once when done.",
        input_schema: json!({
            "type": "object",
            "properties": {
                "sponsors": { "type": "object", "properties": sponsors },
                "overallSummary": { "type": "string" },
                "innovativeAspects": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["sponsors", "overallSummary"],
        }),
    }
}

/// A pattern remembered for a sponsor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearnedPattern {
    pub pattern: String,
    pub confidence: f64,
    pub occurrences: u32,
}

/// Cross-job memory of how sponsors tend to be integrated
#[async_trait]
pub trait PatternMemory: Send + Sync {
    /// Patterns for a sponsor, highest confidence first
    async fn recall(&self, sponsor: Sponsor) -> Vec<LearnedPattern>;

    /// Record a pattern observed with the given confidence
    async fn learn(&self, sponsor: Sponsor, pattern: String, confidence: f64);
}

/// Process-local pattern memory
#[derive(Debug, Default)]
pub struct InMemoryPatternMemory {
    patterns: RwLock<HashMap<Sponsor, Vec<LearnedPattern>>>,
}

impl InMemoryPatternMemory {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PatternMemory for InMemoryPatternMemory {
    async fn recall(&self, sponsor: Sponsor) -> Vec<LearnedPattern> {
        self.patterns.read().get(&sponsor).cloned().unwrap_or_default()
    }

    async fn learn(&self, sponsor: Sponsor, pattern: String, confidence: f64) {
        let confidence = confidence.clamp(0.0, 1.0);
        let mut guard = self.patterns.write();
        let list = guard.entry(sponsor).or_default();
        if let Some(existing) = list.iter_mut().find(|p| p.pattern == pattern) {
            existing.confidence = existing.confidence.max(confidence);
            existing.occurrences += 1;
        } else {
            list.push(LearnedPattern {
                pattern,
                confidence,
                occurrences: 1,
            });
        }
        list.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        list.truncate(MAX_PATTERNS_PER_SPONSOR);
    }
}

/// One web search hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// External web search backend
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<WebResult>, ToolError>;
}

/// Executes tool calls against one checkout
#[derive(Clone)]
pub struct ToolDispatcher {
    workspace: RepoWorkspace,
    memory: Option<Arc<dyn PatternMemory>>,
    web: Option<Arc<dyn WebSearch>>,
    output_limit: usize,
}

impl ToolDispatcher {
    /// Dispatcher over a workspace, truncating output to `output_limit` bytes
    #[must_use]
    pub fn new(workspace: RepoWorkspace, output_limit: usize) -> Self {
        Self {
            workspace,
            memory: None,
            web: None,
            output_limit,
        }
    }

    /// With pattern memory
    #[must_use]
    pub fn with_memory(mut self, memory: Option<Arc<dyn PatternMemory>>) -> Self {
        self.memory = memory;
        self
    }

    /// With web search backend
    #[must_use]
    pub fn with_web_search(mut self, web: Option<Arc<dyn WebSearch>>) -> Self {
        self.web = web;
        self
    }

    /// Run one tool call
    pub async fn dispatch(&self, call: &ToolCall) -> ToolOutput {
        let result = match call {
            ToolCall::ReadFile { path } => self
                .workspace
                .read_file(path)
                .await
                .map_err(ToolError::from),
            ToolCall::ListDirectory { path } => self.list(path).await,
            ToolCall::SearchCode { pattern } => self.search(pattern).await,
            ToolCall::ReadDependencies => self.dependencies().await,
            ToolCall::RecallPattern { sponsor } => Ok(self.recall(*sponsor).await),
            ToolCall::SearchWeb { query } => self.web_search(query).await,
        };
        match result {
            Ok(content) => ToolOutput::ok(truncate(&content, self.output_limit)),
            Err(e) => {
                tracing::debug!(tool = call.name(), error = %e, "tool call failed");
                ToolOutput::error(e)
            }
        }
    }

    async fn list(&self, path: &str) -> Result<String, ToolError> {
        let entries = self.workspace.list_dir(path).await?;
        if entries.is_empty() {
            return Ok("(empty directory)".to_string());
        }
        Ok(entries
            .iter()
            .map(|e| if e.is_dir { format!("{}/", e.name) } else { e.name.clone() })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn search(&self, pattern: &str) -> Result<String, ToolError> {
        let hits = self.workspace.search_code(pattern, MAX_SEARCH_HITS).await?;
        if hits.is_empty() {
            return Ok(format!("no matches for `{pattern}`"));
        }
        let mut out = String::new();
        for hit in &hits {
            let _ = writeln!(out, "{}:{}: {}", hit.path, hit.line, hit.text);
        }
        Ok(out)
    }

    async fn dependencies(&self) -> Result<String, ToolError> {
        let manifests = self.workspace.manifests().await?;
        if manifests.is_empty() {
            return Ok("no dependency manifest found".to_string());
        }
        serde_json::to_string_pretty(&manifests).map_err(|e| ToolError::Search(e.to_string()))
    }

    async fn recall(&self, sponsor: Sponsor) -> String {
        let Some(memory) = &self.memory else {
            return "pattern memory is not configured".to_string();
        };
        let patterns = memory.recall(sponsor).await;
        if patterns.is_empty() {
            return format!("no learned patterns for {sponsor}");
        }
        let mut out = String::new();
        for p in &patterns {
            let _ = writeln!(
                out,
                "- {} (confidence {:.2}, seen {}x)",
                p.pattern, p.confidence, p.occurrences
            );
        }
        out
    }

    async fn web_search(&self, query: &str) -> Result<String, ToolError> {
        let Some(web) = &self.web else {
            return Ok("web search is not configured".to_string());
        };
        let results = web.search(query).await?;
        if results.is_empty() {
            return Ok(format!("no results for \"{query}\""));
        }
        let mut out = String::new();
        for r in &results {
            let _ = writeln!(out, "{} <{}>\n  {}", r.title, r.url, r.snippet);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn dispatcher() -> (tempfile::TempDir, ToolDispatcher) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/app.py"), "import redis\nr = redis.Redis()\n").unwrap();
        fs::write(dir.path().join("requirements.txt"), "redis==5\n").unwrap();
        let ws = RepoWorkspace::new(dir.path().to_path_buf());
        (dir, ToolDispatcher::new(ws, 8_000))
    }

    #[test]
    fn decode_named_calls() {
        let call = ToolCall::from_named("read_file", &json!({"path": "a.js"})).unwrap();
        assert_eq!(call, ToolCall::ReadFile { path: "a.js".into() });
        assert_eq!(call.input(), json!({"path": "a.js"}));

        let call = ToolCall::from_named("recall_pattern", &json!({"sponsor": "Lightning AI"})).unwrap();
        assert_eq!(call, ToolCall::RecallPattern { sponsor: Sponsor::LightningAi });

        assert!(matches!(
            ToolCall::from_named("rm_rf", &json!({})),
            Err(ReasoningError::UnknownTool(_))
        ));
        assert!(matches!(
            ToolCall::from_named("search_code", &json!({"regex": "x"})),
            Err(ReasoningError::MalformedResponse(_))
        ));
    }

    #[test]
    fn definitions_cover_every_tool() {
        let names: Vec<_> = tool_definitions().iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            ["read_file", "list_directory", "search_code", "read_dependencies", "recall_pattern", "search_web"]
        );
        let submit = serde_json::to_value(submit_analysis_definition()).unwrap();
        assert!(submit["input_schema"]["properties"]["sponsors"]["properties"]["lightning_ai"].is_object());
    }

    #[tokio::test]
    async fn dispatch_repository_tools() {
        let (_dir, tools) = dispatcher();

        let out = tools.dispatch(&ToolCall::ListDirectory { path: ".".into() }).await;
        assert_eq!(out.content, "src/\nrequirements.txt");

        let out = tools.dispatch(&ToolCall::SearchCode { pattern: "redis\\.Redis".into() }).await;
        assert!(out.content.starts_with("src/app.py:2:"));

        let out = tools.dispatch(&ToolCall::ReadDependencies).await;
        assert!(out.content.contains("\"redis\""));

        let out = tools.dispatch(&ToolCall::ReadFile { path: "../secret".into() }).await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn unconfigured_knowledge_tools_answer_plainly() {
        let (_dir, tools) = dispatcher();
        let out = tools.dispatch(&ToolCall::SearchWeb { query: "redis sdk".into() }).await;
        assert!(!out.is_error);
        assert_eq!(out.content, "web search is not configured");
    }

    #[tokio::test]
    async fn pattern_memory_ranks_by_confidence() {
        let memory = InMemoryPatternMemory::new();
        memory.learn(Sponsor::Redis, "redis.createClient".into(), 0.4).await;
        memory.learn(Sponsor::Redis, "new Redis(".into(), 0.9).await;
        memory.learn(Sponsor::Redis, "redis.createClient".into(), 0.6).await;

        let recalled = memory.recall(Sponsor::Redis).await;
        assert_eq!(recalled[0].pattern, "new Redis(");
        assert_eq!(recalled[1].occurrences, 2);
        assert!((recalled[1].confidence - 0.6).abs() < f64::EPSILON);
        assert!(memory.recall(Sponsor::Vercel).await.is_empty());

        let (_dir, tools) = dispatcher();
        let tools = tools.with_memory(Some(Arc::new(memory)));
        let out = tools.dispatch(&ToolCall::RecallPattern { sponsor: Sponsor::Redis }).await;
        assert!(out.content.starts_with("- new Redis("));
    }
}
