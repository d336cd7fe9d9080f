//! Testing utilities for the hackscan workspace
//!
//! Scripted collaborators, fixture repositories and polling helpers shared
//! by the integration tests.

#![allow(missing_docs)]

use async_trait::async_trait;
use hackscan_core::error::{PublishError, ReasoningError, SandboxError};
use hackscan_core::execution::{EndpointProber, HttpResponse};
use hackscan_core::progress::ProgressSink;
use hackscan_core::publish::{PublishReceipt, ResultPublisher};
use hackscan_core::reasoning::{ReasoningProvider, ReasoningRequest, ReasoningStep, StaticFindings};
use hackscan_core::repository::RepoSnapshot;
use hackscan_core::sandbox::{CommandOutput, ProcessHandle, SandboxProvider};
use hackscan_core::tools::ToolCall;
use hackscan_core::types::{
    AnalysisResult, Evidence, JobId, JobRecord, Sponsor, SponsorAnalysis, TeamMember,
};
use hackscan_core::JobStore;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Reasoning
// ---------------------------------------------------------------------------

/// What a [`ScriptedReasoner`] answers once its script runs out
#[derive(Debug, Clone)]
pub enum Exhausted {
    Final(StaticFindings),
    Unavailable,
    /// Keep asking to list the root directory
    KeepExploring,
}

/// Replays a fixed list of steps
pub struct ScriptedReasoner {
    script: Mutex<VecDeque<Result<ReasoningStep, ReasoningError>>>,
    exhausted: Exhausted,
    /// (iteration, tools_enabled) per call
    calls: Mutex<Vec<(u32, bool)>>,
}

impl ScriptedReasoner {
    pub fn new(script: Vec<Result<ReasoningStep, ReasoningError>>, exhausted: Exhausted) -> Self {
        Self {
            script: Mutex::new(script.into()),
            exhausted,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answers with `findings` on the first call
    pub fn finals(findings: StaticFindings) -> Self {
        Self::new(Vec::new(), Exhausted::Final(findings))
    }

    /// Reads one file, then answers with `findings`
    pub fn reads_then_finals(path: &str, findings: StaticFindings) -> Self {
        Self::new(
            vec![Ok(tool_use(1, ToolCall::ReadFile { path: path.to_string() }))],
            Exhausted::Final(findings),
        )
    }

    pub fn unavailable() -> Self {
        Self::new(Vec::new(), Exhausted::Unavailable)
    }

    /// Never submits findings on its own
    pub fn explorer() -> Self {
        Self::new(Vec::new(), Exhausted::KeepExploring)
    }

    pub fn calls(&self) -> Vec<(u32, bool)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ReasoningProvider for ScriptedReasoner {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn next_step(&self, request: ReasoningRequest<'_>) -> Result<ReasoningStep, ReasoningError> {
        let call_no = {
            let mut calls = self.calls.lock();
            calls.push((request.iteration, request.tools_enabled));
            calls.len()
        };
        if let Some(step) = self.script.lock().pop_front() {
            return step;
        }
        match &self.exhausted {
            Exhausted::Final(findings) => Ok(ReasoningStep::Final(findings.clone())),
            Exhausted::Unavailable => Err(ReasoningError::Unavailable("scripted outage".into())),
            Exhausted::KeepExploring => Ok(tool_use(call_no, ToolCall::ListDirectory { path: ".".into() })),
        }
    }
}

pub fn tool_use(n: usize, call: ToolCall) -> ReasoningStep {
    ReasoningStep::ToolUse {
        id: format!("toolu_{n:02}"),
        call,
    }
}

/// Findings with the given detected sponsors: (sponsor, score, confidence, evidence file)
pub fn findings(detected: &[(Sponsor, u8, f64, &str)]) -> StaticFindings {
    let mut out = StaticFindings {
        overall_summary: "Scripted analysis".to_string(),
        ..StaticFindings::default()
    };
    for &(sponsor, score, confidence, file) in detected {
        let mut analysis = SponsorAnalysis::detected(score, confidence).with_evidence(Evidence {
            files: vec![file.to_string()],
            code_snippets: Vec::new(),
            key_findings: vec![format!("{sponsor} client constructed")],
        });
        analysis.technical_summary = format!("{sponsor} is used directly.");
        analysis.prize_eligible = score >= 5;
        out.sponsors.insert(sponsor, analysis);
    }
    out
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// In-memory sandbox answering commands from a table
#[derive(Default)]
pub struct ScriptedSandbox {
    provision_error: Option<String>,
    /// (substring of command, output); first match wins
    responses: Vec<(String, CommandOutput)>,
    /// Commands containing one of these never finish
    hangs: Vec<String>,
    /// Commands containing one of these panic inside the provider
    panics: Vec<String>,
    destroy_error: Option<String>,
    commands: Mutex<Vec<String>>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `create` fails with `reason`
    pub fn failing_provision(reason: &str) -> Self {
        Self {
            provision_error: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// Commands containing `needle` produce `output`
    pub fn on(mut self, needle: &str, output: CommandOutput) -> Self {
        self.responses.push((needle.to_string(), output));
        self
    }

    /// Commands containing `needle` never return
    pub fn hang_on(mut self, needle: &str) -> Self {
        self.hangs.push(needle.to_string());
        self
    }

    /// Commands containing `needle` panic
    pub fn panic_on(mut self, needle: &str) -> Self {
        self.panics.push(needle.to_string());
        self
    }

    /// `destroy` is counted but reports a teardown failure
    pub fn failing_destroy(mut self, reason: &str) -> Self {
        self.destroy_error = Some(reason.to_string());
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Successful command output
pub fn ok_output(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        ..CommandOutput::default()
    }
}

/// Failed command output
pub fn failed_output(exit_code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        stderr: stderr.to_string(),
        ..CommandOutput::default()
    }
}

#[async_trait]
impl SandboxProvider for ScriptedSandbox {
    fn platform(&self) -> &str {
        "scripted"
    }

    async fn create(&self, _snapshot: &RepoSnapshot, name: &str) -> Result<String, SandboxError> {
        if let Some(reason) = &self.provision_error {
            return Err(SandboxError::Provision(reason.clone()));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{name}-{n}"))
    }

    async fn run(&self, _session: &str, command: &str, _timeout: Duration) -> Result<CommandOutput, SandboxError> {
        self.commands.lock().push(command.to_string());
        if self.panics.iter().any(|needle| command.contains(needle.as_str())) {
            panic!("scripted panic in `{command}`");
        }
        if self.hangs.iter().any(|needle| command.contains(needle.as_str())) {
            std::future::pending::<()>().await;
        }
        Ok(self
            .responses
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map_or_else(|| ok_output(""), |(_, out)| out.clone()))
    }

    async fn start_background(&self, _session: &str, command: &str) -> Result<ProcessHandle, SandboxError> {
        self.commands.lock().push(command.to_string());
        Ok(ProcessHandle { id: "proc-1".into() })
    }

    async fn background_logs(&self, _session: &str, _handle: &ProcessHandle) -> Result<String, SandboxError> {
        Ok("listening on 3000\n".to_string())
    }

    async fn public_url(&self, session: &str, port: u16) -> Result<String, SandboxError> {
        Ok(format!("https://{session}-{port}.sandbox.test"))
    }

    async fn destroy(&self, _session: &str) -> Result<(), SandboxError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        match &self.destroy_error {
            Some(reason) => Err(SandboxError::Teardown(reason.clone())),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Answers probes from a route table
///
/// When `up`, the health check (`GET /`) succeeds unless a rule overrides it.
/// Unknown routes and every route while down are refused connections.
pub struct ScriptedProber {
    up: bool,
    routes: Vec<(String, String, Result<u16, String>)>,
    sent: Mutex<Vec<(String, String)>>,
}

impl ScriptedProber {
    pub fn up() -> Self {
        Self {
            up: true,
            routes: Vec::new(),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// The application never answers
    pub fn down() -> Self {
        Self {
            up: false,
            ..Self::up()
        }
    }

    pub fn respond(mut self, method: &str, path: &str, status: u16) -> Self {
        self.routes.push((method.to_string(), path.to_string(), Ok(status)));
        self
    }

    pub fn refuse(mut self, method: &str, path: &str, error: &str) -> Self {
        self.routes.push((method.to_string(), path.to_string(), Err(error.to_string())));
        self
    }

    /// (method, path) of every request, health checks included
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

fn path_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.find('/').map_or("/", |i| &rest[i..])
}

#[async_trait]
impl EndpointProber for ScriptedProber {
    async fn send(&self, method: &str, url: &str, _body: Option<&Value>, _timeout: Duration) -> Result<HttpResponse, String> {
        let path = path_of(url);
        self.sent.lock().push((method.to_string(), path.to_string()));
        if !self.up {
            return Err("connection refused".into());
        }
        let rule = self
            .routes
            .iter()
            .find(|(m, p, _)| m.eq_ignore_ascii_case(method) && p == path)
            .map(|(_, _, outcome)| outcome.clone());
        let outcome = match rule {
            Some(outcome) => outcome,
            None if path == "/" => Ok(200),
            None => Err("connection refused".into()),
        };
        outcome.map(|status| HttpResponse {
            status,
            body: format!("{{\"path\":\"{path}\"}}"),
            elapsed_ms: 12,
        })
    }
}

// ---------------------------------------------------------------------------
// Publishing and progress
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(AnalysisResult, Vec<TeamMember>)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(AnalysisResult, Vec<TeamMember>)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl ResultPublisher for RecordingPublisher {
    async fn publish(&self, result: &AnalysisResult, members: &[TeamMember]) -> Result<PublishReceipt, PublishError> {
        self.published.lock().push((result.clone(), members.to_vec()));
        Ok(PublishReceipt {
            document_id: result.project_name.to_lowercase(),
            location: None,
        })
    }
}

/// Rejects every document
pub struct FailingPublisher;

#[async_trait]
impl ResultPublisher for FailingPublisher {
    async fn publish(&self, _result: &AnalysisResult, _members: &[TeamMember]) -> Result<PublishReceipt, PublishError> {
        Err(PublishError::Rejected("content store offline".into()))
    }
}

#[derive(Default)]
pub struct RecordingProgress {
    steps: Mutex<Vec<String>>,
}

impl RecordingProgress {
    pub fn steps(&self) -> Vec<String> {
        self.steps.lock().clone()
    }
}

#[async_trait]
impl ProgressSink for RecordingProgress {
    async fn report(&self, text: String) {
        self.steps.lock().push(text);
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Temporary repository holding `files` (path, contents)
pub fn fixture_repo(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_files(dir.path(), files);
    dir
}

pub fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (path, text) in files {
        let full = root.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, text).unwrap();
    }
}

/// Plain scripts, no dependency manifest, no tests
pub fn manifestless_repo() -> TempDir {
    fixture_repo(&[
        ("README.md", "# Tiny\nA weekend hack.\n"),
        ("main.py", "print('hello hackathon')\n"),
        ("util.py", "def add(a, b):\n    return a + b\n"),
    ])
}

/// Express app using the Anthropic SDK and a Redis client
///
/// Routes: `GET /api/cache` (cache.js), `POST /api/chat` (chat.js),
/// `GET /api/status` (server.js).
pub fn node_sponsor_repo() -> TempDir {
    fixture_repo(&[
        (
            "package.json",
            r#"{"name":"demo","dependencies":{"@anthropic-ai/sdk":"^0.30.0","redis":"^4.6.0","express":"^4.19.0"},"scripts":{"start":"node src/server.js","test":"jest"}}"#,
        ),
        ("package-lock.json", "{}"),
        (
            "src/server.js",
            "const express = require('express');\nconst app = express();\napp.get('/api/status', (req, res) => res.json({ ok: true }));\napp.listen(process.env.PORT || 3000);\n",
        ),
        (
            "src/chat.js",
            "const Anthropic = require('@anthropic-ai/sdk');\nconst client = new Anthropic();\nrouter.post('/api/chat', async (req, res) => res.json(await client.messages.create(req.body)));\n",
        ),
        (
            "src/cache.js",
            "const { createClient } = require('redis');\nconst redis = createClient();\nrouter.get('/api/cache', async (req, res) => res.json(await redis.get('k')));\n",
        ),
        ("src/chat.test.js", "test('chat', () => expect(1).toBe(1));\n"),
    ])
}

/// Findings for [`node_sponsor_repo`]: Anthropic 8, Redis 7
pub fn node_sponsor_findings() -> StaticFindings {
    findings(&[
        (Sponsor::Anthropic, 8, 0.6, "src/chat.js"),
        (Sponsor::Redis, 7, 0.5, "src/cache.js"),
    ])
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

/// Poll until the job is terminal; panics after `limit`
pub async fn wait_for_terminal(store: &dyn JobStore, job_id: &JobId, limit: Duration) -> JobRecord {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let record = store.get(job_id).await.unwrap();
        if record.status.is_terminal() {
            return record;
        }
        assert!(tokio::time::Instant::now() < deadline, "job {job_id} still {:?} after {limit:?}", record.status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
