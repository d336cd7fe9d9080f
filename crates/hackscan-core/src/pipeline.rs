//! Pipeline controller
//!
//! Drives one job through fetch, static analysis, the optional execution
//! stage, synthesis and publishing, and writes every transition into the
//! job store. Only static-analysis errors fail a job; everything past that
//! point degrades into the result instead.

use crate::analyzer::StaticAnalyzer;
use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError};
use crate::execution::{EndpointProber, ExecutionAgent, ExecutionReport, VerificationJudge};
use crate::job_store::{InMemoryJobStore, JobStore};
use crate::planner::ExecutionPlanner;
use crate::progress::{JobProgress, ProgressSink};
use crate::publish::ResultPublisher;
use crate::reasoning::ReasoningProvider;
use crate::repository::{RepoSnapshot, RepositoryProvider};
use crate::sandbox::SandboxProvider;
use crate::synthesis::Synthesizer;
use crate::tools::{PatternMemory, WebSearch};
use crate::types::{AnalysisRequest, AnalysisResult, ExecutionSummary, JobId, JobRecord, JobStatus, Submission};
use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// How the execution stage ended for one job
#[derive(Debug)]
enum ExecutionStage {
    Disabled,
    NothingToRun,
    Ran(ExecutionReport),
    Unavailable(String),
}

struct Inner {
    config: PipelineConfig,
    store: Arc<dyn JobStore>,
    repositories: Arc<dyn RepositoryProvider>,
    analyzer: StaticAnalyzer,
    planner: ExecutionPlanner,
    executor: Option<ExecutionAgent>,
    synthesizer: Synthesizer,
    publisher: Arc<dyn ResultPublisher>,
    memory: Option<Arc<dyn PatternMemory>>,
    /// Jobs with a live `run`
    active: DashMap<JobId, ()>,
}

/// Releases a job's single-flight slot
struct ActiveRun<'a> {
    active: &'a DashMap<JobId, ()>,
    job_id: JobId,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.job_id);
    }
}

/// Analysis job pipeline; cheap to clone
#[derive(Clone)]
pub struct AnalysisPipeline {
    inner: Arc<Inner>,
}

impl AnalysisPipeline {
    #[must_use]
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.inner.store)
    }

    /// Current job record
    ///
    /// # Errors
    /// `PipelineError::Store` for unknown jobs
    pub async fn status(&self, job_id: &JobId) -> Result<JobRecord, PipelineError> {
        Ok(self.inner.store.get(job_id).await?)
    }

    /// Accept a request
    ///
    /// A cached result for the same fingerprint is returned at once and no
    /// job is created. Otherwise a pending job is created and run in the
    /// background.
    ///
    /// # Errors
    /// `PipelineError::Store` when the job record cannot be created
    pub async fn submit(&self, request: AnalysisRequest) -> Result<Submission, PipelineError> {
        let fingerprint = request.fingerprint();
        if let Some(result) = self.inner.store.get_cached(&fingerprint).await {
            tracing::info!(fingerprint = %fingerprint.as_str(), "serving cached analysis");
            return Ok(Submission::Cached(Box::new(result)));
        }

        let job_id = JobId::new();
        self.inner.store.create(job_id).await?;
        tracing::info!(%job_id, repo = %request.repository_url, "job queued");

        let pipeline = self.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.run(job_id, request).await {
                tracing::debug!(%job_id, error = %e, "background run ended with error");
            }
        });
        Ok(Submission::Queued(job_id))
    }

    /// Run a job to a terminal state
    ///
    /// Failures are recorded on the job before being returned.
    ///
    /// # Errors
    /// `PipelineError::AlreadyRunning` if another run owns the job; otherwise
    /// the error that failed the job
    pub async fn run(&self, job_id: JobId, request: AnalysisRequest) -> Result<(), PipelineError> {
        if self.inner.active.insert(job_id, ()).is_some() {
            return Err(PipelineError::AlreadyRunning(job_id));
        }
        let _slot = ActiveRun {
            active: &self.inner.active,
            job_id,
        };

        match self.drive(job_id, &request).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(%job_id, error = %e, fatal = e.is_fatal(), "job failed");
                if let Err(store_err) = self.inner.store.fail(&job_id, e.to_string()).await {
                    tracing::warn!(%job_id, error = %store_err, "could not record job failure");
                }
                Err(e)
            }
        }
    }

    async fn drive(&self, job_id: JobId, request: &AnalysisRequest) -> Result<(), PipelineError> {
        let inner = &*self.inner;
        inner
            .store
            .set_status(&job_id, JobStatus::Analyzing, Some("Validating request".to_string()))
            .await?;
        request.validate()?;

        inner
            .store
            .set_status(&job_id, JobStatus::Analyzing, Some("Cloning repository".to_string()))
            .await?;
        let snapshot = inner
            .repositories
            .fetch(&request.repository_url, request.branch.as_deref())
            .await?;

        let progress = JobProgress::new(Arc::clone(&inner.store), job_id);
        let outcome = inner.analyzer.analyze(request, &snapshot, &progress).await?;
        tracing::info!(
            %job_id,
            iterations = outcome.iterations,
            termination = ?outcome.termination,
            detected = outcome.result.detected().count(),
            "static stage complete"
        );
        let mut result = outcome.result;

        let stage = AssertUnwindSafe(self.execution_stage(request, &snapshot, &result, &progress))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| ExecutionStage::Unavailable("execution stage panicked".to_string()));
        match stage {
            ExecutionStage::Disabled => result.execution_summary = Some(ExecutionSummary::disabled()),
            ExecutionStage::NothingToRun => result.execution_summary = Some(ExecutionSummary::nothing_to_run()),
            ExecutionStage::Ran(report) => {
                let adjustments = inner.synthesizer.synthesize(&mut result, &report);
                tracing::info!(%job_id, success = report.success, ?adjustments, "execution synthesized");
            }
            ExecutionStage::Unavailable(reason) => {
                tracing::warn!(%job_id, %reason, "execution stage unavailable, keeping static results");
                result.execution_summary = Some(ExecutionSummary {
                    enabled: true,
                    success: false,
                    cloud_platform: None,
                    duration_ms: 0,
                    error: Some(reason),
                });
            }
        }
        result.normalize();

        progress.report("Saving results".to_string()).await;
        let warning = match inner.publisher.publish(&result, &request.team_members).await {
            Ok(receipt) => {
                tracing::debug!(%job_id, document = %receipt.document_id, "result published");
                None
            }
            Err(e) => {
                tracing::warn!(%job_id, error = %e, "publishing failed, result kept on the job");
                Some(format!("analysis completed but could not be published: {e}"))
            }
        };

        inner.store.set_result(&job_id, result.clone(), warning).await?;
        inner
            .store
            .put_cached(request.fingerprint(), result.clone(), inner.config.cache_ttl())
            .await;
        self.learn_patterns(&result).await;
        tracing::info!(%job_id, "job complete");
        Ok(())
    }

    async fn execution_stage(
        &self,
        request: &AnalysisRequest,
        snapshot: &RepoSnapshot,
        result: &AnalysisResult,
        progress: &dyn ProgressSink,
    ) -> ExecutionStage {
        let inner = &*self.inner;
        let Some(agent) = inner.executor.as_ref().filter(|_| inner.config.execution_enabled) else {
            return ExecutionStage::Disabled;
        };
        match inner.planner.plan(result, snapshot).await {
            Ok(None) => {
                tracing::info!(threshold = inner.config.score_threshold, "no sponsor meets the execution threshold");
                ExecutionStage::NothingToRun
            }
            Ok(Some(plan)) => {
                tracing::info!(runtime = %plan.runtime, runnable = plan.runnable().count(), "execution planned");
                ExecutionStage::Ran(agent.execute(request, snapshot, &plan, progress).await)
            }
            Err(e) => ExecutionStage::Unavailable(format!("execution planning failed: {e}")),
        }
    }

    async fn learn_patterns(&self, result: &AnalysisResult) {
        let Some(memory) = &self.inner.memory else {
            return;
        };
        for (sponsor, analysis) in result.detected() {
            for finding in &analysis.evidence.key_findings {
                memory.learn(sponsor, finding.clone(), analysis.confidence).await;
            }
        }
    }
}

/// Assembles an [`AnalysisPipeline`]
pub struct PipelineBuilder {
    config: PipelineConfig,
    store: Option<Arc<dyn JobStore>>,
    repositories: Option<Arc<dyn RepositoryProvider>>,
    reasoner: Option<Arc<dyn ReasoningProvider>>,
    sandbox: Option<Arc<dyn SandboxProvider>>,
    prober: Option<Arc<dyn EndpointProber>>,
    judge: Option<Arc<dyn VerificationJudge>>,
    publisher: Option<Arc<dyn ResultPublisher>>,
    memory: Option<Arc<dyn PatternMemory>>,
    web: Option<Arc<dyn WebSearch>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            store: None,
            repositories: None,
            reasoner: None,
            sandbox: None,
            prober: None,
            judge: None,
            publisher: None,
            memory: None,
            web: None,
        }
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn repositories(mut self, provider: Arc<dyn RepositoryProvider>) -> Self {
        self.repositories = Some(provider);
        self
    }

    #[must_use]
    pub fn reasoner(mut self, reasoner: Arc<dyn ReasoningProvider>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    #[must_use]
    pub fn sandbox(mut self, sandbox: Arc<dyn SandboxProvider>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    #[must_use]
    pub fn prober(mut self, prober: Arc<dyn EndpointProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    #[must_use]
    pub fn judge(mut self, judge: Arc<dyn VerificationJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    #[must_use]
    pub fn publisher(mut self, publisher: Arc<dyn ResultPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    #[must_use]
    pub fn memory(mut self, memory: Arc<dyn PatternMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    #[must_use]
    pub fn web_search(mut self, web: Arc<dyn WebSearch>) -> Self {
        self.web = Some(web);
        self
    }

    /// # Errors
    /// `ConfigError::Invalid` for out-of-range settings and
    /// `ConfigError::MissingComponent` when a required collaborator is absent
    /// (the sandbox is required only with execution enabled)
    pub fn build(self) -> Result<AnalysisPipeline, ConfigError> {
        let config = self.config;
        config.validate()?;

        let repositories = self.repositories.ok_or(ConfigError::MissingComponent("repository provider"))?;
        let reasoner = self.reasoner.ok_or(ConfigError::MissingComponent("reasoning provider"))?;
        let publisher = self.publisher.ok_or(ConfigError::MissingComponent("result publisher"))?;

        let executor = match self.sandbox {
            Some(sandbox) => {
                let mut agent = ExecutionAgent::new(sandbox, config.timeouts, config.limits);
                if let Some(prober) = self.prober {
                    agent = agent.with_prober(prober);
                }
                if let Some(judge) = self.judge {
                    agent = agent.with_judge(judge);
                }
                Some(agent)
            }
            None if config.execution_enabled => return Err(ConfigError::MissingComponent("sandbox provider")),
            None => None,
        };

        let analyzer = StaticAnalyzer::new(reasoner, config.max_iterations, config.limits.tool_output_bytes)
            .with_memory(self.memory.clone())
            .with_web_search(self.web);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new(config.cache_capacity)));

        Ok(AnalysisPipeline {
            inner: Arc::new(Inner {
                planner: ExecutionPlanner::new(config.score_threshold),
                synthesizer: Synthesizer::from_config(&config),
                config,
                store,
                repositories,
                analyzer,
                executor,
                publisher,
                memory: self.memory,
                active: DashMap::new(),
            }),
        })
    }
}
