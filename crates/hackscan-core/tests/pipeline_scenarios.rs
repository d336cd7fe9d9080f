//! End-to-end job scenarios against scripted collaborators.
//!
//! Every job here goes through `submit` and is observed only through the
//! job store, the way a polling client sees it. Guarantees exercised:
//! - results always cover the whole sponsor enumeration
//! - runtime verification adjusts scores once, and only when it saw evidence
//! - execution failures degrade the result instead of failing the job
//! - the sandbox session is torn down whatever happened inside it
//! - completed fingerprints are served from cache without a new job

use hackscan_core::config::{ExecutionTimeouts, PipelineConfig};
use hackscan_core::repository::LocalRepositoryProvider;
use hackscan_core::{
    AnalysisPipeline, AnalysisRequest, JobRecord, JobStatus, ResultPublisher, SandboxProvider, Sponsor,
    Submission, TeamMember,
};
use hackscan_test_utils::{
    findings, manifestless_repo, node_sponsor_findings, node_sponsor_repo, ok_output, wait_for_terminal,
    FailingPublisher, RecordingPublisher, ScriptedProber, ScriptedReasoner, ScriptedSandbox,
};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(15);

fn execution_config() -> PipelineConfig {
    PipelineConfig::default()
        .with_execution(true)
        .with_score_threshold(5)
        .with_timeouts(ExecutionTimeouts {
            startup_secs: 1,
            probe_secs: 1,
            ..ExecutionTimeouts::default()
        })
}

fn request_for(dir: &Path) -> AnalysisRequest {
    AnalysisRequest::new(dir.to_string_lossy(), "Night Owls", "Sponsor Demo")
        .with_member(TeamMember::new("Ada").with_email("ada@example.com"))
}

struct Harness {
    pipeline: AnalysisPipeline,
    sandbox: Arc<ScriptedSandbox>,
    prober: Arc<ScriptedProber>,
    reasoner: Arc<ScriptedReasoner>,
}

fn harness(
    config: PipelineConfig,
    reasoner: ScriptedReasoner,
    sandbox: ScriptedSandbox,
    prober: ScriptedProber,
    publisher: Arc<dyn ResultPublisher>,
) -> Harness {
    let sandbox = Arc::new(sandbox);
    let prober = Arc::new(prober);
    let reasoner = Arc::new(reasoner);
    let pipeline = AnalysisPipeline::builder(config)
        .repositories(Arc::new(LocalRepositoryProvider))
        .reasoner(reasoner.clone())
        .sandbox(sandbox.clone())
        .prober(prober.clone())
        .publisher(publisher)
        .build()
        .unwrap();
    Harness {
        pipeline,
        sandbox,
        prober,
        reasoner,
    }
}

async fn run_to_end(pipeline: &AnalysisPipeline, request: AnalysisRequest) -> JobRecord {
    let submission = pipeline.submit(request).await.unwrap();
    let job_id = submission.job_id().expect("fresh submission is queued");
    wait_for_terminal(pipeline.store().as_ref(), &job_id, WAIT).await
}

fn sandbox_for_node_app() -> ScriptedSandbox {
    ScriptedSandbox::new().on("npm test", ok_output("Tests:       1 passed, 1 total\n"))
}

/// A repository without manifests never reaches the sandbox, even with
/// execution switched on: nothing crosses the score threshold.
#[tokio::test]
async fn manifestless_repository_completes_without_execution() {
    let repo = manifestless_repo();
    let publisher = Arc::new(RecordingPublisher::new());
    let h = harness(
        execution_config(),
        ScriptedReasoner::finals(findings(&[])),
        ScriptedSandbox::new(),
        ScriptedProber::up(),
        publisher.clone(),
    );

    let record = run_to_end(&h.pipeline, request_for(repo.path())).await;
    assert_eq!(record.status, JobStatus::Complete);
    let result = record.result.unwrap();

    assert!(!result.repository_stats.has_tests);
    assert!(result.covers_all_sponsors());
    assert!(result.sponsors.values().all(|s| !s.detected && s.integration_score == 0));
    assert_eq!(h.sandbox.created(), 0);

    let summary = result.execution_summary.unwrap();
    assert!(summary.enabled && summary.success);
    assert_eq!(publisher.published().len(), 1);
}

/// Runtime verification of both sponsors lifts each score by one and raises
/// confidence, while the failing unrelated endpoint costs nothing.
#[tokio::test]
async fn verified_integrations_gain_score() {
    let repo = node_sponsor_repo();
    let publisher = Arc::new(RecordingPublisher::new());
    let h = harness(
        execution_config(),
        ScriptedReasoner::reads_then_finals("src/chat.js", node_sponsor_findings()),
        sandbox_for_node_app(),
        ScriptedProber::up()
            .respond("GET", "/api/cache", 200)
            .respond("POST", "/api/chat", 201)
            .respond("GET", "/api/status", 500),
        publisher.clone(),
    );

    let record = run_to_end(&h.pipeline, request_for(repo.path())).await;
    assert_eq!(record.status, JobStatus::Complete);
    assert!(record.warning.is_none());
    let result = record.result.unwrap();

    let anthropic = &result.sponsors[&Sponsor::Anthropic];
    let redis = &result.sponsors[&Sponsor::Redis];
    assert_eq!(anthropic.integration_score, 9);
    assert_eq!(redis.integration_score, 8);
    assert!(anthropic.confidence > 0.6);
    assert!(redis.confidence > 0.5);
    assert!(anthropic.technical_summary.contains("Runtime verification:"));

    let runtime = anthropic.execution_results.as_ref().unwrap();
    assert!(runtime.tested && runtime.install_success && runtime.app_started);
    assert_eq!(runtime.tests_run, 1);
    assert_eq!(runtime.endpoint_tests.len(), 1);
    assert_eq!(runtime.endpoint_tests[0].endpoint, "/api/chat");
    assert_eq!(runtime.endpoint_tests[0].status, Some(201));
    assert!(runtime.performance.avg_response_time_ms.is_some());

    let summary = result.execution_summary.as_ref().unwrap();
    assert!(summary.enabled && summary.success);
    assert_eq!(summary.cloud_platform.as_deref(), Some("scripted"));
    assert_eq!(result.repository_stats.tests_passed, Some(true));

    for undetected in [Sponsor::LightningAi, Sponsor::Sanity, Sponsor::Postman, Sponsor::Vercel] {
        assert!(result.sponsors[&undetected].execution_results.is_none());
    }

    let probed: Vec<_> = h.prober.sent().into_iter().filter(|(_, p)| p != "/").collect();
    assert_eq!(probed.len(), 3);
    assert_eq!(h.sandbox.destroyed(), 1);
    assert_eq!(
        h.sandbox.commands(),
        vec![
            "echo ready".to_string(),
            "npm ci".to_string(),
            "npm test".to_string(),
            "PORT=3000 npm start".to_string()
        ]
    );
    assert_eq!(publisher.published()[0].1[0].name, "Ada");
}

/// An application that never becomes ready is neutral: no probes, no
/// penalty, static scores survive.
#[tokio::test]
async fn startup_timeout_keeps_static_scores() {
    let repo = node_sponsor_repo();
    let h = harness(
        execution_config(),
        ScriptedReasoner::finals(node_sponsor_findings()),
        sandbox_for_node_app(),
        ScriptedProber::down(),
        Arc::new(RecordingPublisher::new()),
    );

    let record = run_to_end(&h.pipeline, request_for(repo.path())).await;
    let result = record.result.unwrap();

    assert_eq!(result.sponsors[&Sponsor::Anthropic].integration_score, 8);
    assert_eq!(result.sponsors[&Sponsor::Redis].integration_score, 7);
    let runtime = result.sponsors[&Sponsor::Redis].execution_results.as_ref().unwrap();
    assert!(!runtime.app_started);
    assert!(runtime.endpoint_tests.is_empty());
    assert!(h.prober.sent().iter().all(|(_, path)| path == "/"));
    assert!(result.execution_summary.unwrap().success);
    assert_eq!(h.sandbox.destroyed(), 1);
}

/// Provisioning failure leaves static scores intact and is reported on the
/// execution summary, never on the job.
#[tokio::test]
async fn provisioning_failure_degrades_gracefully() {
    let repo = node_sponsor_repo();
    let h = harness(
        execution_config(),
        ScriptedReasoner::finals(node_sponsor_findings()),
        ScriptedSandbox::failing_provision("quota exceeded"),
        ScriptedProber::up(),
        Arc::new(RecordingPublisher::new()),
    );

    let record = run_to_end(&h.pipeline, request_for(repo.path())).await;
    assert_eq!(record.status, JobStatus::Complete);
    let result = record.result.unwrap();

    assert_eq!(result.sponsors[&Sponsor::Anthropic].integration_score, 8);
    assert_eq!(result.sponsors[&Sponsor::Redis].integration_score, 7);
    let summary = result.execution_summary.unwrap();
    assert!(summary.enabled);
    assert!(!summary.success);
    assert!(summary.error.unwrap().contains("quota exceeded"));
    let runtime = result.sponsors[&Sponsor::Redis].execution_results.as_ref().unwrap();
    assert!(!runtime.tested);
    assert!(runtime.verification_notes.contains("provisioning failed"));
}

/// A relevant endpoint answering with an error status after a clean start
/// costs that sponsor two points; a refused connection costs nothing.
#[tokio::test]
async fn failed_runtime_verification_costs_score() {
    let repo = node_sponsor_repo();
    let h = harness(
        execution_config(),
        ScriptedReasoner::finals(node_sponsor_findings()),
        sandbox_for_node_app(),
        ScriptedProber::up()
            .respond("POST", "/api/chat", 500)
            .refuse("GET", "/api/cache", "connection refused")
            .respond("GET", "/api/status", 200),
        Arc::new(RecordingPublisher::new()),
    );

    let record = run_to_end(&h.pipeline, request_for(repo.path())).await;
    assert_eq!(record.status, JobStatus::Complete);
    let result = record.result.unwrap();

    let anthropic = &result.sponsors[&Sponsor::Anthropic];
    assert_eq!(anthropic.integration_score, 6);
    assert!(anthropic.technical_summary.contains("Runtime verification:"));
    let runtime = anthropic.execution_results.as_ref().unwrap();
    assert!(runtime.app_started);
    assert_eq!(runtime.endpoint_tests.len(), 1);
    assert_eq!(runtime.endpoint_tests[0].status, Some(500));
    assert!(!runtime.endpoint_tests[0].success);

    let redis = &result.sponsors[&Sponsor::Redis];
    assert_eq!(redis.integration_score, 7);
    let runtime = redis.execution_results.as_ref().unwrap();
    assert_eq!(runtime.endpoint_tests[0].status, None);
    assert!(result.execution_summary.unwrap().success);
    assert_eq!(h.sandbox.destroyed(), 1);
}

/// A teardown error is logged only: the job completes with the runtime
/// adjustments already made.
#[tokio::test]
async fn teardown_failure_does_not_fail_the_job() {
    let repo = node_sponsor_repo();
    let h = harness(
        execution_config(),
        ScriptedReasoner::finals(node_sponsor_findings()),
        sandbox_for_node_app().failing_destroy("studio busy"),
        ScriptedProber::up()
            .respond("GET", "/api/cache", 200)
            .respond("POST", "/api/chat", 201),
        Arc::new(RecordingPublisher::new()),
    );

    let record = run_to_end(&h.pipeline, request_for(repo.path())).await;
    assert_eq!(record.status, JobStatus::Complete);
    assert!(record.error.is_none());
    let result = record.result.unwrap();
    assert_eq!(result.sponsors[&Sponsor::Anthropic].integration_score, 9);
    assert_eq!(result.sponsors[&Sponsor::Redis].integration_score, 8);
    let summary = result.execution_summary.unwrap();
    assert!(summary.success);
    assert!(summary.error.is_none());
    assert_eq!(h.sandbox.destroyed(), 1);
}

/// A call that never returns times out as one step; the app is still
/// started and the session is still torn down.
#[tokio::test]
async fn hanging_test_step_times_out_and_execution_continues() {
    let repo = node_sponsor_repo();
    let config = execution_config().with_timeouts(ExecutionTimeouts {
        test_secs: 1,
        call_slack_secs: 0,
        startup_secs: 1,
        probe_secs: 1,
        ..ExecutionTimeouts::default()
    });
    let h = harness(
        config,
        ScriptedReasoner::finals(node_sponsor_findings()),
        ScriptedSandbox::new().hang_on("npm test"),
        ScriptedProber::up()
            .respond("GET", "/api/cache", 200)
            .respond("POST", "/api/chat", 201),
        Arc::new(RecordingPublisher::new()),
    );

    let record = run_to_end(&h.pipeline, request_for(repo.path())).await;
    assert_eq!(record.status, JobStatus::Complete);
    let result = record.result.unwrap();

    let summary = result.execution_summary.as_ref().unwrap();
    assert!(!summary.success);
    assert_eq!(result.repository_stats.tests_passed, None);

    let runtime = result.sponsors[&Sponsor::Anthropic].execution_results.as_ref().unwrap();
    assert!(runtime.tested && runtime.install_success && runtime.app_started);
    assert_eq!(runtime.tests_run, 0);
    assert_eq!(runtime.endpoint_tests.len(), 1);
    assert_eq!(result.sponsors[&Sponsor::Anthropic].integration_score, 9);

    assert!(h.sandbox.commands().contains(&"PORT=3000 npm start".to_string()));
    assert_eq!(h.sandbox.destroyed(), 1);
}

/// A provider that panics mid-session still has its session destroyed,
/// and every sponsor is reported untested.
#[tokio::test]
async fn panicking_provider_still_tears_down() {
    let repo = node_sponsor_repo();
    let h = harness(
        execution_config(),
        ScriptedReasoner::finals(node_sponsor_findings()),
        ScriptedSandbox::new().panic_on("npm ci"),
        ScriptedProber::up(),
        Arc::new(RecordingPublisher::new()),
    );

    let record = run_to_end(&h.pipeline, request_for(repo.path())).await;
    assert_eq!(record.status, JobStatus::Complete);
    let result = record.result.unwrap();

    assert!(!result.execution_summary.unwrap().success);
    assert_eq!(result.sponsors[&Sponsor::Anthropic].integration_score, 8);
    assert_eq!(result.sponsors[&Sponsor::Redis].integration_score, 7);
    let runtime = result.sponsors[&Sponsor::Redis].execution_results.as_ref().unwrap();
    assert!(!runtime.tested);
    assert_eq!(runtime.verification_notes, "Execution aborted unexpectedly");
    assert!(!h.sandbox.commands().contains(&"npm test".to_string()));
    assert_eq!(h.sandbox.created(), 1);
    assert_eq!(h.sandbox.destroyed(), 1);
}

/// With the flag off nothing runs and no sponsor carries runtime results,
/// however high the static scores.
#[tokio::test]
async fn disabled_execution_attaches_nothing() {
    let repo = node_sponsor_repo();
    let h = harness(
        PipelineConfig::default(),
        ScriptedReasoner::finals(findings(&[(Sponsor::Anthropic, 10, 0.9, "src/chat.js")])),
        ScriptedSandbox::new(),
        ScriptedProber::up(),
        Arc::new(RecordingPublisher::new()),
    );

    let record = run_to_end(&h.pipeline, request_for(repo.path())).await;
    let result = record.result.unwrap();
    assert!(!result.execution_summary.unwrap().enabled);
    assert!(result.sponsors.values().all(|s| s.execution_results.is_none()));
    assert_eq!(h.sandbox.created(), 0);
}

/// A second submission of the same repository and branch is answered from
/// cache with the identical result and creates no job.
#[tokio::test]
async fn resubmission_is_served_from_cache() {
    let repo = node_sponsor_repo();
    let h = harness(
        PipelineConfig::default(),
        ScriptedReasoner::finals(node_sponsor_findings()),
        ScriptedSandbox::new(),
        ScriptedProber::up(),
        Arc::new(RecordingPublisher::new()),
    );

    let first = run_to_end(&h.pipeline, request_for(repo.path())).await.result.unwrap();
    let calls = h.reasoner.calls().len();

    match h.pipeline.submit(request_for(repo.path())).await.unwrap() {
        Submission::Cached(cached) => assert_eq!(*cached, first),
        Submission::Queued(id) => panic!("expected a cache hit, got job {id}"),
    }
    assert_eq!(h.reasoner.calls().len(), calls);
}

/// A repository that cannot be fetched fails the job with a readable cause.
#[tokio::test]
async fn missing_repository_fails_the_job() {
    let h = harness(
        PipelineConfig::default(),
        ScriptedReasoner::finals(findings(&[])),
        ScriptedSandbox::new(),
        ScriptedProber::up(),
        Arc::new(RecordingPublisher::new()),
    );

    let request = AnalysisRequest::new("/definitely/not/here", "Team", "Ghost");
    let record = run_to_end(&h.pipeline, request).await;
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.unwrap().contains("repository"));
    assert!(record.result.is_none());
    assert!(h.reasoner.calls().is_empty());
}

/// An unreachable reasoning provider is fatal as well.
#[tokio::test]
async fn unavailable_reasoner_fails_the_job() {
    let repo = manifestless_repo();
    let h = harness(
        PipelineConfig::default(),
        ScriptedReasoner::unavailable(),
        ScriptedSandbox::new(),
        ScriptedProber::up(),
        Arc::new(RecordingPublisher::new()),
    );

    let record = run_to_end(&h.pipeline, request_for(repo.path())).await;
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.unwrap().contains("unavailable"));
}

/// A malformed request becomes a failed job rather than a rejected submit.
#[tokio::test]
async fn malformed_request_fails_the_job() {
    let h = harness(
        PipelineConfig::default(),
        ScriptedReasoner::finals(findings(&[])),
        ScriptedSandbox::new(),
        ScriptedProber::up(),
        Arc::new(RecordingPublisher::new()),
    );

    let record = run_to_end(&h.pipeline, AnalysisRequest::new("https://github.com/t/app", " ", "App")).await;
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.unwrap().contains("team name"));
}

/// Losing the publish step still completes the job with the result attached.
#[tokio::test]
async fn publish_failure_becomes_a_warning() {
    let repo = manifestless_repo();
    let h = harness(
        PipelineConfig::default(),
        ScriptedReasoner::finals(findings(&[])),
        ScriptedSandbox::new(),
        ScriptedProber::up(),
        Arc::new(FailingPublisher),
    );

    let record = run_to_end(&h.pipeline, request_for(repo.path())).await;
    assert_eq!(record.status, JobStatus::Complete);
    assert!(record.result.is_some());
    assert!(record.warning.unwrap().contains("content store offline"));
}

/// Hitting the iteration cap yields a complete job with a partial result.
#[tokio::test]
async fn iteration_cap_yields_partial_result() {
    let repo = node_sponsor_repo();
    let h = harness(
        PipelineConfig::default().with_max_iterations(3),
        ScriptedReasoner::explorer(),
        ScriptedSandbox::new(),
        ScriptedProber::up(),
        Arc::new(RecordingPublisher::new()),
    );

    let record = run_to_end(&h.pipeline, request_for(repo.path())).await;
    assert_eq!(record.status, JobStatus::Complete);
    let result = record.result.unwrap();
    assert!(result.covers_all_sponsors());
    assert!(result.overall_summary.contains("cut short after 3 iterations"));

    let calls = h.reasoner.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls.last(), Some(&(4, false)));
}

/// The builder refuses execution without a sandbox.
#[test]
fn execution_requires_a_sandbox() {
    let built = AnalysisPipeline::builder(PipelineConfig::default().with_execution(true))
        .repositories(Arc::new(LocalRepositoryProvider))
        .reasoner(Arc::new(ScriptedReasoner::finals(findings(&[]))))
        .publisher(Arc::new(RecordingPublisher::new()))
        .build();
    assert!(built.is_err());
}

/// Scripted sandbox sanity: the platform label flows into summaries.
#[test]
fn scripted_platform_label() {
    assert_eq!(ScriptedSandbox::new().platform(), "scripted");
}
