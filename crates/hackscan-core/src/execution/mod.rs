//! Execution agent
//!
//! Runs one [`ExecutionPlan`] inside a sandbox session: install, test,
//! start, probe, verify, tear down. Each provider call is wrapped by
//! [`guarded`] so a failing or hanging step becomes a [`StepOutcome`] and
//! the remaining steps decide for themselves whether to continue. Teardown
//! runs after the session work whether it returned or panicked.

pub mod judge;
pub mod outcome;
pub mod probe;
pub mod test_report;

pub use judge::{RuleBasedJudge, VerificationFacts, VerificationJudge};
pub use outcome::{guarded, StepOutcome};
pub use probe::{EndpointProber, HttpProber, HttpResponse};
pub use test_report::{parse_test_counts, TestCounts};

use crate::config::{truncate, ExecutionTimeouts, OutputLimits};
use crate::planner::{EndpointProbe, ExecutionPlan};
use crate::progress::ProgressSink;
use crate::repository::RepoSnapshot;
use crate::sandbox::{check_liveness, session_name, SandboxProvider};
use crate::types::{
    AnalysisRequest, EndpointTestResult, ExecutionResults, ExecutionSummary, PerformanceMetrics,
    Sponsor,
};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Interval between readiness checks
const READY_POLL: Duration = Duration::from_millis(500);

/// What one execution run produced
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    /// Sandbox platform, absent when no session was created
    pub platform: Option<String>,
    /// Results for every sponsor the plan covered, refused ones included
    pub per_sponsor: BTreeMap<Sponsor, ExecutionResults>,
    /// No provider call failed and nothing panicked
    pub success: bool,
    /// Set only when the stage could not run at all
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Outcome of the test step, when one ran
    pub tests_passed: Option<bool>,
}

impl ExecutionReport {
    /// Mark every runnable sponsor untested because no usable session exists
    fn abandon(&mut self, runnable: &[Sponsor], reason: &str, started: Instant) {
        for &sponsor in runnable {
            self.per_sponsor.insert(sponsor, ExecutionResults::not_tested(reason));
        }
        self.success = false;
        let mut error = reason.to_string();
        if let Some(first) = error.get_mut(..1) {
            first.make_ascii_lowercase();
        }
        self.error = Some(error);
        self.duration_ms = elapsed_ms(started);
    }

    /// Job-level summary for the result
    #[must_use]
    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            enabled: true,
            success: self.success,
            cloud_platform: self.platform.clone(),
            duration_ms: self.duration_ms,
            error: self.error.clone(),
        }
    }
}

/// Facts collected inside one session
#[derive(Debug, Default)]
struct SessionRun {
    install_success: bool,
    install_logs: String,
    test_logs: String,
    counts: TestCounts,
    tests_passed: Option<bool>,
    app_started: bool,
    app_url: Option<String>,
    app_logs: String,
    probes: Vec<(EndpointProbe, EndpointTestResult)>,
    /// Provider calls that did not complete
    faults: Vec<String>,
    notes: BTreeMap<Sponsor, String>,
}

impl SessionRun {
    fn fault(&mut self, step: &str, reason: String) {
        tracing::warn!(step, %reason, "execution step did not complete");
        self.faults.push(format!("{step}: {reason}"));
    }

    fn facts(&self, sponsor: Sponsor) -> VerificationFacts {
        let relevant = self.probes.iter().filter(|(p, _)| p.is_relevant_to(sponsor));
        VerificationFacts {
            install_success: self.install_success,
            tests_run: self.counts.run,
            tests_passed: self.counts.passed,
            tests_failed: self.counts.failed,
            app_started: self.app_started,
            relevant_probes: relevant.clone().count(),
            relevant_successes: relevant.filter(|(_, r)| r.success).count(),
            failures: self.faults.clone(),
        }
    }

    fn performance(&self) -> PerformanceMetrics {
        let times: Vec<u64> = self
            .probes
            .iter()
            .filter(|(_, r)| r.status.is_some())
            .map(|(_, r)| r.response_time_ms)
            .collect();
        #[allow(clippy::cast_precision_loss)]
        let avg = (!times.is_empty()).then(|| times.iter().sum::<u64>() as f64 / times.len() as f64);
        PerformanceMetrics {
            avg_response_time_ms: avg,
            ..PerformanceMetrics::default()
        }
    }
}

/// Drives a plan through a sandbox provider
#[derive(Clone)]
pub struct ExecutionAgent {
    sandbox: Arc<dyn SandboxProvider>,
    prober: Arc<dyn EndpointProber>,
    judge: Arc<dyn VerificationJudge>,
    timeouts: ExecutionTimeouts,
    limits: OutputLimits,
}

impl ExecutionAgent {
    #[must_use]
    pub fn new(sandbox: Arc<dyn SandboxProvider>, timeouts: ExecutionTimeouts, limits: OutputLimits) -> Self {
        Self {
            sandbox,
            prober: Arc::new(HttpProber::new()),
            judge: Arc::new(RuleBasedJudge),
            timeouts,
            limits,
        }
    }

    #[must_use]
    pub fn with_prober(mut self, prober: Arc<dyn EndpointProber>) -> Self {
        self.prober = prober;
        self
    }

    #[must_use]
    pub fn with_judge(mut self, judge: Arc<dyn VerificationJudge>) -> Self {
        self.judge = judge;
        self
    }

    /// Execute `plan`; never fails, every problem lands in the report
    pub async fn execute(
        &self,
        request: &AnalysisRequest,
        snapshot: &RepoSnapshot,
        plan: &ExecutionPlan,
        progress: &dyn ProgressSink,
    ) -> ExecutionReport {
        let started = Instant::now();
        let mut report = ExecutionReport {
            platform: None,
            per_sponsor: BTreeMap::new(),
            success: true,
            error: None,
            duration_ms: 0,
            tests_passed: None,
        };
        for verdict in plan.verdicts.iter().filter(|v| !v.should_execute) {
            let reason = verdict.reason.clone().unwrap_or_else(|| "Execution skipped".to_string());
            report.per_sponsor.insert(verdict.sponsor, ExecutionResults::not_tested(reason));
        }
        let runnable: Vec<Sponsor> = plan.runnable().collect();
        if runnable.is_empty() {
            return report;
        }

        report.platform = Some(self.sandbox.platform().to_string());
        progress.report("Creating cloud studio".to_string()).await;
        let name = session_name(&request.project_name, request.repository_name());
        let session = match guarded(self.timeouts.provision(), self.sandbox.create(snapshot, &name)).await {
            StepOutcome::Completed(id) => id,
            outcome => {
                let reason = outcome.failure().unwrap_or_default();
                tracing::warn!(%reason, "sandbox provisioning failed");
                report.abandon(&runnable, &format!("Sandbox provisioning failed: {reason}"), started);
                return report;
            }
        };
        let platform = self.sandbox.session_platform(&session);
        report.platform = Some(platform.clone());
        tracing::info!(%session, platform = %platform, "sandbox session created");

        progress.report("Checking cloud studio".to_string()).await;
        let liveness = self.timeouts.liveness();
        if let Some(reason) = guarded(
            liveness + self.timeouts.call_slack(),
            check_liveness(self.sandbox.as_ref(), &session, liveness),
        )
        .await
        .failure()
        {
            tracing::warn!(%session, %reason, "sandbox session is not responsive");
            self.teardown(&session, progress).await;
            report.abandon(&runnable, &format!("Sandbox not responsive: {reason}"), started);
            return report;
        }

        let run = AssertUnwindSafe(self.run_session(&session, plan, &runnable, progress))
            .catch_unwind()
            .await;

        self.teardown(&session, progress).await;

        match run {
            Ok(run) => {
                report.success = run.faults.is_empty();
                report.tests_passed = run.tests_passed;
                let performance = run.performance();
                for sponsor in runnable {
                    let endpoint_tests = run
                        .probes
                        .iter()
                        .filter(|(p, _)| p.is_relevant_to(sponsor))
                        .map(|(_, r)| r.clone())
                        .collect();
                    report.per_sponsor.insert(
                        sponsor,
                        ExecutionResults {
                            tested: true,
                            cloud_environment: Some(platform.clone()),
                            studio_id: Some(session.clone()),
                            install_success: run.install_success,
                            install_logs: run.install_logs.clone(),
                            test_logs: run.test_logs.clone(),
                            app_logs: run.app_logs.clone(),
                            tests_run: run.counts.run,
                            tests_passed: run.counts.passed,
                            tests_failed: run.counts.failed,
                            app_started: run.app_started,
                            app_url: run.app_url.clone(),
                            endpoint_tests,
                            performance: performance.clone(),
                            verification_notes: run.notes.get(&sponsor).cloned().unwrap_or_default(),
                        },
                    );
                }
            }
            Err(_) => {
                tracing::error!(%session, "execution session panicked");
                report.success = false;
                for sponsor in runnable {
                    report
                        .per_sponsor
                        .insert(sponsor, ExecutionResults::not_tested("Execution aborted unexpectedly"));
                }
            }
        }
        report.duration_ms = elapsed_ms(started);
        report
    }

    /// Destroy `session`; a failure is logged and goes no further
    async fn teardown(&self, session: &str, progress: &dyn ProgressSink) {
        progress.report("Tearing down cloud studio".to_string()).await;
        if let Some(reason) = guarded(self.timeouts.teardown(), self.sandbox.destroy(session))
            .await
            .failure()
        {
            tracing::warn!(%session, %reason, "sandbox teardown failed");
        }
    }

    async fn run_session(
        &self,
        session: &str,
        plan: &ExecutionPlan,
        runnable: &[Sponsor],
        progress: &dyn ProgressSink,
    ) -> SessionRun {
        let mut run = SessionRun {
            install_success: true,
            ..SessionRun::default()
        };

        if !plan.install.is_empty() {
            progress.report("Installing dependencies".to_string()).await;
            let mut logs = String::new();
            for command in &plan.install {
                let limit = self.timeouts.install();
                match guarded(limit + self.timeouts.call_slack(), self.sandbox.run(session, command, limit)).await {
                    StepOutcome::Completed(out) => {
                        append_log(&mut logs, command, &out.combined());
                        if !out.success() {
                            tracing::info!(%command, exit_code = out.exit_code, "install command failed");
                            run.install_success = false;
                            break;
                        }
                    }
                    outcome => {
                        run.fault("install", outcome.failure().unwrap_or_default());
                        run.install_success = false;
                        break;
                    }
                }
            }
            run.install_logs = truncate(&logs, self.limits.log_bytes);
        }

        if run.install_success {
            self.run_tests(session, plan, &mut run, progress).await;
            self.start_app(session, plan, &mut run, progress).await;
            if run.app_started {
                self.probe_endpoints(plan, &mut run, progress).await;
            }
        }

        progress.report("Verifying results".to_string()).await;
        for &sponsor in runnable {
            let facts = run.facts(sponsor);
            let note = match guarded(self.timeouts.command(), self.judge.judge(sponsor, &facts)).await {
                StepOutcome::Completed(text) if !text.trim().is_empty() => text,
                outcome => {
                    if let Some(reason) = outcome.failure() {
                        tracing::debug!(%sponsor, %reason, "verification judge unavailable, using rules");
                    }
                    RuleBasedJudge::verdict(sponsor, &facts)
                }
            };
            run.notes.insert(sponsor, note);
        }
        run
    }

    async fn run_tests(&self, session: &str, plan: &ExecutionPlan, run: &mut SessionRun, progress: &dyn ProgressSink) {
        if plan.test.is_empty() {
            return;
        }
        progress.report("Running tests".to_string()).await;
        let mut logs = String::new();
        let mut all_passed = true;
        let mut ran_any = false;
        for command in &plan.test {
            let limit = self.timeouts.test();
            match guarded(limit + self.timeouts.call_slack(), self.sandbox.run(session, command, limit)).await {
                StepOutcome::Completed(out) => {
                    ran_any = true;
                    let combined = out.combined();
                    append_log(&mut logs, command, &combined);
                    if let Some(counts) = parse_test_counts(&combined) {
                        run.counts.run += counts.run;
                        run.counts.passed += counts.passed;
                        run.counts.failed += counts.failed;
                    }
                    all_passed &= out.success();
                }
                outcome => run.fault("test", outcome.failure().unwrap_or_default()),
            }
        }
        run.test_logs = truncate(&logs, self.limits.log_bytes);
        if ran_any {
            run.tests_passed = Some(all_passed && run.counts.failed == 0);
        }
    }

    async fn start_app(&self, session: &str, plan: &ExecutionPlan, run: &mut SessionRun, progress: &dyn ProgressSink) {
        let Some(command) = plan.start.as_deref() else {
            return;
        };
        progress.report("Starting application".to_string()).await;
        let limit = self.timeouts.command();
        let handle = match guarded(limit, self.sandbox.start_background(session, command)).await {
            StepOutcome::Completed(handle) => handle,
            outcome => {
                run.fault("start", outcome.failure().unwrap_or_default());
                return;
            }
        };
        let url = match guarded(limit, self.sandbox.public_url(session, plan.port)).await {
            StepOutcome::Completed(url) => url,
            outcome => {
                run.fault("public url", outcome.failure().unwrap_or_default());
                return;
            }
        };

        run.app_started = self.wait_ready(&probe::join_url(&url, &plan.health_path)).await;
        if run.app_started {
            tracing::info!(%url, "application is up");
        } else {
            tracing::info!(%url, secs = self.timeouts.startup_secs, "application did not become ready");
        }
        run.app_url = Some(url);

        if let StepOutcome::Completed(logs) = guarded(limit, self.sandbox.background_logs(session, &handle)).await {
            run.app_logs = truncate(&logs, self.limits.log_bytes);
        }
    }

    /// Any HTTP status from the health URL counts as ready
    async fn wait_ready(&self, url: &str) -> bool {
        let deadline = tokio::time::Instant::now() + self.timeouts.startup();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let attempt = remaining.min(self.timeouts.probe());
            if let Ok(Ok(_)) = tokio::time::timeout(attempt, self.prober.send("GET", url, None, attempt)).await {
                return true;
            }
            if tokio::time::Instant::now() + READY_POLL >= deadline {
                return false;
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    async fn probe_endpoints(&self, plan: &ExecutionPlan, run: &mut SessionRun, progress: &dyn ProgressSink) {
        let Some(base) = run.app_url.clone() else {
            return;
        };
        let limit = self.timeouts.probe();
        for endpoint in &plan.endpoints {
            progress
                .report(format!("Testing endpoint {} {}", endpoint.method, endpoint.path))
                .await;
            let url = probe::join_url(&base, &endpoint.path);
            let sent = tokio::time::timeout(
                limit + Duration::from_secs(1),
                self.prober.send(&endpoint.method, &url, endpoint.body.as_ref(), limit),
            )
            .await
            .unwrap_or_else(|_| Err(format!("no response within {}s", limit.as_secs())));

            let result = match sent {
                Ok(response) => {
                    let success = endpoint.accept.contains(&response.status);
                    EndpointTestResult {
                        endpoint: endpoint.path.clone(),
                        method: endpoint.method.clone(),
                        status: Some(response.status),
                        response_time_ms: response.elapsed_ms,
                        success,
                        error: (!success).then(|| format!("unexpected status {}", response.status)),
                        body: (!response.body.is_empty())
                            .then(|| truncate(&response.body, self.limits.body_bytes)),
                    }
                }
                Err(reason) => EndpointTestResult {
                    endpoint: endpoint.path.clone(),
                    method: endpoint.method.clone(),
                    status: None,
                    response_time_ms: 0,
                    success: false,
                    error: Some(reason),
                    body: None,
                },
            };
            tracing::debug!(
                method = %result.method,
                endpoint = %result.endpoint,
                status = ?result.status,
                success = result.success,
                "endpoint probed"
            );
            run.probes.push((endpoint.clone(), result));
        }
    }
}

fn append_log(logs: &mut String, command: &str, output: &str) {
    if !logs.is_empty() {
        logs.push('\n');
    }
    logs.push_str("$ ");
    logs.push_str(command);
    logs.push('\n');
    logs.push_str(output);
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{Runtime, SponsorVerdict};
    use crate::error::SandboxError;
    use crate::sandbox::{CommandOutput, LocalSandbox, ProcessHandle};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    #[async_trait]
    impl ProgressSink for Collect {
        async fn report(&self, text: String) {
            self.0.lock().push(text);
        }
    }

    /// Answers 200 everywhere except paths containing "broken"
    struct StubProber;

    #[async_trait]
    impl EndpointProber for StubProber {
        async fn send(&self, _method: &str, url: &str, _body: Option<&Value>, _timeout: Duration) -> Result<HttpResponse, String> {
            let status = if url.contains("broken") { 500 } else { 200 };
            Ok(HttpResponse {
                status,
                body: "ok".into(),
                elapsed_ms: 4,
            })
        }
    }

    fn probe(method: &str, path: &str, sponsors: &[Sponsor]) -> EndpointProbe {
        EndpointProbe {
            method: method.into(),
            path: path.into(),
            body: None,
            accept: 200..400,
            sponsors: sponsors.to_vec(),
            source: "server.js".into(),
        }
    }

    fn plan(install: &str) -> ExecutionPlan {
        ExecutionPlan {
            runtime: Runtime::Node,
            install: vec![install.to_string()],
            test: vec!["echo 'Tests:       2 passed, 2 total'".to_string()],
            start: Some("sleep 30".to_string()),
            port: 3000,
            health_path: "/".into(),
            endpoints: vec![
                probe("GET", "/api/cache", &[Sponsor::Redis]),
                probe("GET", "/api/broken", &[Sponsor::Anthropic]),
            ],
            verdicts: vec![
                SponsorVerdict {
                    sponsor: Sponsor::Redis,
                    should_execute: true,
                    reason: None,
                },
                SponsorVerdict {
                    sponsor: Sponsor::Anthropic,
                    should_execute: true,
                    reason: None,
                },
            ],
        }
    }

    fn agent(sandbox: Arc<LocalSandbox>) -> ExecutionAgent {
        let timeouts = ExecutionTimeouts {
            startup_secs: 2,
            ..ExecutionTimeouts::default()
        };
        ExecutionAgent::new(sandbox, timeouts, OutputLimits::default()).with_prober(Arc::new(StubProber))
    }

    #[tokio::test]
    async fn full_run_in_local_sandbox() {
        let repo = tempfile::tempdir().unwrap();
        std::fs::write(repo.path().join("server.js"), "// app").unwrap();
        let sandbox = Arc::new(LocalSandbox::new());
        let progress = Collect::default();
        let request = AnalysisRequest::new("https://github.com/t/app", "Team", "App");
        let snapshot = RepoSnapshot::borrowed(repo.path(), "file://app");

        let report = agent(sandbox.clone())
            .execute(&request, &snapshot, &plan("true"), &progress)
            .await;

        assert!(report.success);
        assert_eq!(report.platform.as_deref(), Some("local"));
        assert_eq!(report.tests_passed, Some(true));
        assert_eq!(sandbox.session_count(), 0);

        let redis = &report.per_sponsor[&Sponsor::Redis];
        assert!(redis.tested && redis.install_success && redis.app_started);
        assert_eq!(redis.tests_run, 2);
        assert_eq!(redis.endpoint_tests.len(), 1);
        assert!(redis.endpoint_tests[0].success);
        assert!(redis.verification_notes.contains("verified at runtime"));

        let anthropic = &report.per_sponsor[&Sponsor::Anthropic];
        assert_eq!(anthropic.endpoint_tests[0].status, Some(500));
        assert!(!anthropic.endpoint_tests[0].success);

        let steps = progress.0.lock().clone();
        assert_eq!(steps.first().map(String::as_str), Some("Creating cloud studio"));
        assert!(steps.contains(&"Testing endpoint GET /api/cache".to_string()));
        assert_eq!(steps.last().map(String::as_str), Some("Tearing down cloud studio"));
    }

    #[tokio::test]
    async fn install_failure_stops_remaining_steps() {
        let repo = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(LocalSandbox::new());
        let progress = Collect::default();
        let request = AnalysisRequest::new("https://github.com/t/app", "Team", "App");
        let snapshot = RepoSnapshot::borrowed(repo.path(), "file://app");

        let report = agent(sandbox.clone())
            .execute(&request, &snapshot, &plan("echo boom >&2; exit 1"), &progress)
            .await;

        assert!(report.success, "a failing install is a project outcome");
        let redis = &report.per_sponsor[&Sponsor::Redis];
        assert!(!redis.install_success);
        assert!(redis.install_logs.contains("boom"));
        assert!(!redis.app_started);
        assert!(redis.endpoint_tests.is_empty());
        assert!(!progress.0.lock().contains(&"Running tests".to_string()));
        assert_eq!(sandbox.session_count(), 0);
    }

    #[tokio::test]
    async fn refused_plan_runs_nothing() {
        let repo = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(LocalSandbox::new());
        let mut plan = plan("true");
        for verdict in &mut plan.verdicts {
            verdict.should_execute = false;
            verdict.reason = Some("Execution skipped: wallet or financial operations detected in pay.js:3".into());
        }
        let request = AnalysisRequest::new("https://github.com/t/app", "Team", "App");
        let report = agent(sandbox)
            .execute(&request, &RepoSnapshot::borrowed(repo.path(), "file://app"), &plan, &Collect::default())
            .await;

        assert!(report.success);
        assert!(report.platform.is_none());
        let redis = &report.per_sponsor[&Sponsor::Redis];
        assert!(!redis.tested);
        assert!(redis.verification_notes.contains("wallet"));
    }

    /// Creates sessions whose shell exits non-zero on every command
    #[derive(Default)]
    struct Mute {
        destroyed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SandboxProvider for Mute {
        fn platform(&self) -> &str {
            "mute"
        }

        async fn create(&self, _snapshot: &RepoSnapshot, name: &str) -> Result<String, SandboxError> {
            Ok(format!("mute-{name}"))
        }

        async fn run(
            &self,
            _session: &str,
            _command: &str,
            _timeout: Duration,
        ) -> Result<CommandOutput, SandboxError> {
            Ok(CommandOutput {
                exit_code: 127,
                ..Default::default()
            })
        }

        async fn start_background(
            &self,
            _session: &str,
            _command: &str,
        ) -> Result<ProcessHandle, SandboxError> {
            Err(SandboxError::Command("not reached".into()))
        }

        async fn public_url(&self, _session: &str, _port: u16) -> Result<String, SandboxError> {
            Err(SandboxError::Command("not reached".into()))
        }

        async fn destroy(&self, session: &str) -> Result<(), SandboxError> {
            self.destroyed.lock().push(session.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn unresponsive_session_is_torn_down_before_any_step() {
        let repo = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(Mute::default());
        let progress = Collect::default();
        let request = AnalysisRequest::new("https://github.com/t/app", "Team", "App");
        let agent = ExecutionAgent::new(sandbox.clone(), ExecutionTimeouts::default(), OutputLimits::default())
            .with_prober(Arc::new(StubProber));

        let report = agent
            .execute(&request, &RepoSnapshot::borrowed(repo.path(), "file://app"), &plan("true"), &progress)
            .await;

        assert!(!report.success);
        assert_eq!(report.platform.as_deref(), Some("mute"));
        assert!(report.error.as_deref().unwrap_or_default().starts_with("sandbox not responsive"));
        assert_eq!(sandbox.destroyed.lock().len(), 1);
        let redis = &report.per_sponsor[&Sponsor::Redis];
        assert!(!redis.tested);
        assert!(redis.verification_notes.starts_with("Sandbox not responsive"));
        let steps = progress.0.lock().clone();
        assert!(!steps.contains(&"Installing dependencies".to_string()));
        assert_eq!(steps.last().map(String::as_str), Some("Tearing down cloud studio"));
    }
}
