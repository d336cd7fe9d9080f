//! Core types for the analysis pipeline
//!
//! Defines:
//! - job identity and status
//! - the submitted `AnalysisRequest` and its cache fingerprint
//! - the `AnalysisResult` artifact with per-sponsor analyses
//! - runtime `ExecutionResults` attached by the synthesizer

use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Unique job identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Generate new job ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Job status as seen by polling clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet picked up
    Pending,
    /// Pipeline is running (static analysis, execution or synthesis)
    Analyzing,
    /// Result is available
    Complete,
    /// Job aborted with an error
    Failed,
}

impl JobStatus {
    /// Terminal states accept no further transitions
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Monotonic transition check; re-entering `Analyzing` updates progress only
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending | Self::Analyzing, Self::Analyzing)
                | (Self::Analyzing, Self::Complete | Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Durable job record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    /// Latest progress text, overwritten on each sub-step
    pub progress: Option<String>,
    /// Present iff `status == Failed`
    pub error: Option<String>,
    /// Set when the job completed but something non-fatal went wrong
    pub warning: Option<String>,
    pub result: Option<AnalysisResult>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Fresh pending record
    #[must_use]
    pub fn pending(id: JobId) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            progress: None,
            error: None,
            warning: None,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Sponsors whose integrations are scored
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sponsor {
    Anthropic,
    Redis,
    LightningAi,
    Sanity,
    Postman,
    Vercel,
}

impl Sponsor {
    /// The fixed sponsor enumeration; every result covers all of these
    pub const ALL: [Sponsor; 6] = [
        Sponsor::Anthropic,
        Sponsor::Redis,
        Sponsor::LightningAi,
        Sponsor::Sanity,
        Sponsor::Postman,
        Sponsor::Vercel,
    ];

    /// Stable key used in serialized results
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Redis => "redis",
            Self::LightningAi => "lightning_ai",
            Self::Sanity => "sanity",
            Self::Postman => "postman",
            Self::Vercel => "vercel",
        }
    }

    /// Human-readable name
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Anthropic => "Anthropic",
            Self::Redis => "Redis",
            Self::LightningAi => "Lightning AI",
            Self::Sanity => "Sanity",
            Self::Postman => "Postman",
            Self::Vercel => "Vercel",
        }
    }
}

impl fmt::Display for Sponsor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Sponsor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        Sponsor::ALL
            .into_iter()
            .find(|sponsor| sponsor.as_str().replace('_', "") == key)
            .ok_or_else(|| format!("unknown sponsor: {s}"))
    }
}

/// Team member attached to a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

impl TeamMember {
    /// Member with only a name
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: None,
            handle: None,
            bio: None,
        }
    }

    /// With email
    #[inline]
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Submitted analysis request (immutable once submitted)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub repository_url: String,
    pub team_name: String,
    pub project_name: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub team_members: Vec<TeamMember>,
    #[serde(default)]
    pub hackathon_id: Option<String>,
}

impl AnalysisRequest {
    /// Create new request
    #[inline]
    #[must_use]
    pub fn new(
        repository_url: impl Into<String>,
        team_name: impl Into<String>,
        project_name: impl Into<String>,
    ) -> Self {
        Self {
            repository_url: repository_url.into(),
            team_name: team_name.into(),
            project_name: project_name.into(),
            branch: None,
            team_members: Vec::new(),
            hackathon_id: None,
        }
    }

    /// With branch
    #[inline]
    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// With team member
    #[inline]
    #[must_use]
    pub fn with_member(mut self, member: TeamMember) -> Self {
        self.team_members.push(member);
        self
    }

    /// With hackathon identifier
    #[inline]
    #[must_use]
    pub fn with_hackathon(mut self, id: impl Into<String>) -> Self {
        self.hackathon_id = Some(id.into());
        self
    }

    /// Reject requests the pipeline cannot act on
    ///
    /// # Errors
    /// `PipelineError::InvalidRequest` naming the offending field
    pub fn validate(&self) -> Result<(), PipelineError> {
        let url = self.repository_url.trim();
        if url.is_empty() {
            return Err(PipelineError::InvalidRequest("repository url is empty".into()));
        }
        if url.chars().any(char::is_whitespace) {
            return Err(PipelineError::InvalidRequest(format!(
                "repository url contains whitespace: {url:?}"
            )));
        }
        if self.team_name.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("team name is empty".into()));
        }
        if self.project_name.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("project name is empty".into()));
        }
        if let Some(branch) = &self.branch {
            let branch = branch.trim();
            if branch.is_empty()
                || branch.starts_with('-')
                || branch.contains("..")
                || branch.chars().any(char::is_whitespace)
            {
                return Err(PipelineError::InvalidRequest(format!(
                    "invalid branch name: {branch:?}"
                )));
            }
        }
        if let Some(member) = self.team_members.iter().find(|m| m.name.trim().is_empty()) {
            return Err(PipelineError::InvalidRequest(format!(
                "team member without a name: {member:?}"
            )));
        }
        Ok(())
    }

    /// Cache key for this submission
    #[inline]
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(&self.repository_url, self.branch.as_deref())
    }

    /// Repository name taken from the last URL segment
    #[must_use]
    pub fn repository_name(&self) -> &str {
        self.repository_url
            .trim()
            .trim_end_matches('/')
            .rsplit(|c| c == '/' || c == ':')
            .next()
            .map(|name| name.trim_end_matches(".git"))
            .unwrap_or_default()
    }
}

/// Deterministic cache key derived from repository URL and branch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash the normalized URL and branch
    ///
    /// `https://GitHub.com/a/b.git/` and `github.com/a/b` fingerprint the same;
    /// a missing branch is the default branch.
    #[must_use]
    pub fn compute(repository_url: &str, branch: Option<&str>) -> Self {
        let mut url = repository_url.trim().to_ascii_lowercase();
        for prefix in ["https://", "http://", "git://", "ssh://"] {
            if let Some(rest) = url.strip_prefix(prefix) {
                url = rest.to_string();
                break;
            }
        }
        if let Some(rest) = url.strip_prefix("git@") {
            url = rest.replacen(':', "/", 1);
        }
        if let Some(rest) = url.strip_prefix("www.") {
            url = rest.to_string();
        }
        let url = url.trim_end_matches('/').trim_end_matches(".git");
        let branch = branch.map(str::trim).filter(|b| !b.is_empty()).unwrap_or("HEAD");

        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update([0]);
        hasher.update(branch.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Hex digest
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Facts derived from the cloned repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStats {
    pub main_language: String,
    pub file_count: usize,
    pub has_tests: bool,
    /// `None` until a test run is observed
    pub tests_passed: Option<bool>,
    pub dependencies: Vec<String>,
}

/// Evidence backing a sponsor verdict
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Evidence {
    pub files: Vec<String>,
    pub code_snippets: Vec<String>,
    pub key_findings: Vec<String>,
}

/// Per-sponsor analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SponsorAnalysis {
    pub detected: bool,
    /// 0..=10
    pub integration_score: u8,
    pub technical_summary: String,
    pub plain_english_summary: String,
    pub evidence: Evidence,
    pub prize_eligible: bool,
    /// 0.0..=1.0
    pub confidence: f64,
    pub suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_results: Option<ExecutionResults>,
}

impl Default for SponsorAnalysis {
    fn default() -> Self {
        Self::undetected()
    }
}

impl SponsorAnalysis {
    /// No evidence found
    #[must_use]
    pub fn undetected() -> Self {
        Self {
            detected: false,
            integration_score: 0,
            technical_summary: String::new(),
            plain_english_summary: String::new(),
            evidence: Evidence::default(),
            prize_eligible: false,
            confidence: 0.0,
            suggestions: Vec::new(),
            execution_results: None,
        }
    }

    /// Detected integration with a static score
    #[must_use]
    pub fn detected(score: u8, confidence: f64) -> Self {
        Self {
            detected: true,
            integration_score: score.min(10),
            confidence: confidence.clamp(0.0, 1.0),
            ..Self::undetected()
        }
    }

    /// With evidence
    #[inline]
    #[must_use]
    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = evidence;
        self
    }

    /// Clamp ranges and enforce: not detected => score 0, no execution results
    pub fn normalize(&mut self) {
        self.integration_score = self.integration_score.min(10);
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if !self.detected {
            self.integration_score = 0;
            self.prize_eligible = false;
            self.execution_results = None;
        }
    }
}

/// Outcome of probing one HTTP endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointTestResult {
    pub endpoint: String,
    pub method: String,
    /// `None` when no HTTP response arrived
    pub status: Option<u16>,
    pub response_time_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Runtime metrics collected during execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub avg_response_time_ms: Option<f64>,
    pub memory_mb: Option<f64>,
    pub cpu_percent: Option<f64>,
}

/// Runtime verification record for one sponsor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionResults {
    pub tested: bool,
    pub cloud_environment: Option<String>,
    pub studio_id: Option<String>,
    pub install_success: bool,
    pub install_logs: String,
    pub test_logs: String,
    pub app_logs: String,
    pub tests_run: u32,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub app_started: bool,
    pub app_url: Option<String>,
    pub endpoint_tests: Vec<EndpointTestResult>,
    pub performance: PerformanceMetrics,
    pub verification_notes: String,
}

impl ExecutionResults {
    /// Sponsor was not run; `reason` explains why
    #[must_use]
    pub fn not_tested(reason: impl Into<String>) -> Self {
        Self {
            tested: false,
            verification_notes: reason.into(),
            ..Self::default()
        }
    }
}

/// Job-level execution summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub enabled: bool,
    pub success: bool,
    pub cloud_platform: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionSummary {
    /// Execution switched off by configuration
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            success: false,
            cloud_platform: None,
            duration_ms: 0,
            error: None,
        }
    }

    /// Execution enabled but no sponsor qualified
    #[must_use]
    pub fn nothing_to_run() -> Self {
        Self {
            enabled: true,
            success: true,
            cloud_platform: None,
            duration_ms: 0,
            error: None,
        }
    }
}

/// Final artifact of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub team_name: String,
    pub project_name: String,
    pub github_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hackathon_id: Option<String>,
    pub analyzed_at: DateTime<Utc>,
    pub repository_stats: RepositoryStats,
    pub sponsors: BTreeMap<Sponsor, SponsorAnalysis>,
    pub overall_summary: String,
    pub innovative_aspects: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_summary: Option<ExecutionSummary>,
}

impl AnalysisResult {
    /// Empty result for a request: every sponsor undetected
    #[must_use]
    pub fn empty(request: &AnalysisRequest, stats: RepositoryStats) -> Self {
        Self {
            team_name: request.team_name.clone(),
            project_name: request.project_name.clone(),
            github_url: request.repository_url.clone(),
            branch: request.branch.clone(),
            hackathon_id: request.hackathon_id.clone(),
            analyzed_at: Utc::now(),
            repository_stats: stats,
            sponsors: Sponsor::ALL
                .into_iter()
                .map(|s| (s, SponsorAnalysis::undetected()))
                .collect(),
            overall_summary: String::new(),
            innovative_aspects: Vec::new(),
            execution_summary: None,
        }
    }

    /// Fill in missing sponsors and normalize every analysis
    pub fn normalize(&mut self) {
        for sponsor in Sponsor::ALL {
            self.sponsors.entry(sponsor).or_default();
        }
        for analysis in self.sponsors.values_mut() {
            analysis.normalize();
        }
    }

    /// Every sponsor in the enumeration is present
    #[must_use]
    pub fn covers_all_sponsors(&self) -> bool {
        self.sponsors.len() == Sponsor::ALL.len()
            && Sponsor::ALL.iter().all(|s| self.sponsors.contains_key(s))
    }

    /// Sponsor analysis (always present after `normalize`)
    #[must_use]
    pub fn sponsor(&self, sponsor: Sponsor) -> Option<&SponsorAnalysis> {
        self.sponsors.get(&sponsor)
    }

    /// Detected sponsors
    pub fn detected(&self) -> impl Iterator<Item = (Sponsor, &SponsorAnalysis)> {
        self.sponsors
            .iter()
            .filter(|(_, a)| a.detected)
            .map(|(s, a)| (*s, a))
    }
}

/// What `submit` hands back
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// New job accepted; poll the store for progress
    Queued(JobId),
    /// Identical fingerprint already analyzed; no job created
    Cached(Box<AnalysisResult>),
}

impl Submission {
    /// The `cached: true` marker
    #[inline]
    #[must_use]
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }

    /// Job id for queued submissions
    #[inline]
    #[must_use]
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Queued(id) => Some(*id),
            Self::Cached(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_generation() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);
        assert_eq!(id1.to_string().parse::<JobId>().unwrap(), id1);
    }

    #[test]
    fn status_transitions_are_monotonic() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(Complete));
        assert!(Analyzing.can_transition_to(Failed));
        assert!(!Complete.can_transition_to(Analyzing));
        assert!(!Failed.can_transition_to(Complete));
        assert!(!Analyzing.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Complete));
        assert!(!Pending.can_transition_to(Failed));
    }

    #[test]
    fn fingerprint_normalizes_url() {
        let a = Fingerprint::compute("https://GitHub.com/team/app.git/", None);
        let b = Fingerprint::compute("github.com/team/app", Some("HEAD"));
        let c = Fingerprint::compute("git@github.com:team/app.git", None);
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, Fingerprint::compute("github.com/team/app", Some("dev")));
    }

    #[test]
    fn sponsor_parsing() {
        assert_eq!("Lightning AI".parse::<Sponsor>().unwrap(), Sponsor::LightningAi);
        assert_eq!("lightning_ai".parse::<Sponsor>().unwrap(), Sponsor::LightningAi);
        assert_eq!("REDIS".parse::<Sponsor>().unwrap(), Sponsor::Redis);
        assert!("acme".parse::<Sponsor>().is_err());
    }

    #[test]
    fn request_validation() {
        let ok = AnalysisRequest::new("https://github.com/a/b", "Team", "Proj");
        assert!(ok.validate().is_ok());
        assert!(AnalysisRequest::new("", "Team", "Proj").validate().is_err());
        assert!(AnalysisRequest::new("https://x y", "Team", "Proj").validate().is_err());
        assert!(ok.clone().with_branch("../etc").validate().is_err());
        assert!(ok.with_member(TeamMember::new(" ")).validate().is_err());
    }

    #[test]
    fn repository_name_from_url() {
        let req = AnalysisRequest::new("https://github.com/team/cool-app.git", "T", "P");
        assert_eq!(req.repository_name(), "cool-app");
        let req = AnalysisRequest::new("git@github.com:team/other", "T", "P");
        assert_eq!(req.repository_name(), "other");
    }

    #[test]
    fn undetected_sponsor_is_normalized() {
        let mut analysis = SponsorAnalysis::detected(7, 1.4);
        assert_eq!(analysis.confidence, 1.0);
        analysis.detected = false;
        analysis.execution_results = Some(ExecutionResults::not_tested("x"));
        analysis.normalize();
        assert_eq!(analysis.integration_score, 0);
        assert!(analysis.execution_results.is_none());
    }

    #[test]
    fn result_covers_all_sponsors() {
        let req = AnalysisRequest::new("https://github.com/a/b", "Team", "Proj");
        let mut result = AnalysisResult::empty(&req, RepositoryStats::default());
        result.sponsors.remove(&Sponsor::Redis);
        assert!(!result.covers_all_sponsors());
        result.normalize();
        assert!(result.covers_all_sponsors());
    }

    #[test]
    fn result_serializes_sponsor_keys() {
        let req = AnalysisRequest::new("https://github.com/a/b", "Team", "Proj");
        let result = AnalysisResult::empty(&req, RepositoryStats::default());
        let json = serde_json::to_value(&result).unwrap();
        assert!(json["sponsors"]["lightning_ai"].is_object());
        assert_eq!(json["sponsors"]["anthropic"]["integrationScore"], 0);
    }
}
