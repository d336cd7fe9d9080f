//! Synthesis of static and runtime findings
//!
//! Score rules, applied at most once per sponsor:
//! - verified (app started, a relevant probe succeeded): `+boost`, capped at 10,
//!   and confidence moves `gain` of the way toward 1.0
//! - penalized (app started, relevant probes answered, none succeeded):
//!   `-penalty`, floored at 0
//! - anything else is neutral

use crate::config::PipelineConfig;
use crate::execution::ExecutionReport;
use crate::types::{AnalysisResult, ExecutionResults, Sponsor, SponsorAnalysis};
use std::collections::BTreeMap;

/// What synthesis did to one sponsor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Verified,
    Penalized,
    Neutral,
    /// Execution results were already attached; nothing changed
    AlreadyApplied,
    /// Undetected sponsors never carry execution results
    NotDetected,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Synthesizer {
    boost: u8,
    penalty: u8,
    confidence_gain: f64,
}

impl Synthesizer {
    #[must_use]
    pub fn new(boost: u8, penalty: u8, confidence_gain: f64) -> Self {
        Self {
            boost,
            penalty,
            confidence_gain: confidence_gain.clamp(0.0, 1.0),
        }
    }

    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.score_boost, config.score_penalty, config.confidence_gain)
    }

    /// Classify runtime results without applying them
    #[must_use]
    pub fn classify(results: &ExecutionResults) -> Adjustment {
        if !results.tested || !results.app_started || results.endpoint_tests.is_empty() {
            return Adjustment::Neutral;
        }
        if results.endpoint_tests.iter().any(|t| t.success) {
            Adjustment::Verified
        } else if results.endpoint_tests.iter().any(|t| t.status.is_some()) {
            Adjustment::Penalized
        } else {
            Adjustment::Neutral
        }
    }

    /// Merge one sponsor's runtime results into its static analysis
    pub fn apply(&self, analysis: &mut SponsorAnalysis, results: ExecutionResults) -> Adjustment {
        if !analysis.detected {
            return Adjustment::NotDetected;
        }
        if analysis.execution_results.is_some() {
            return Adjustment::AlreadyApplied;
        }

        let adjustment = Self::classify(&results);
        match adjustment {
            Adjustment::Verified => {
                analysis.integration_score = analysis.integration_score.saturating_add(self.boost).min(10);
                analysis.confidence =
                    (analysis.confidence + (1.0 - analysis.confidence) * self.confidence_gain).clamp(0.0, 1.0);
            }
            Adjustment::Penalized => {
                analysis.integration_score = analysis.integration_score.saturating_sub(self.penalty);
            }
            _ => {}
        }

        let note = results.verification_notes.trim();
        if !note.is_empty() {
            let label = if results.tested {
                "Runtime verification"
            } else {
                "Runtime verification skipped"
            };
            if !analysis.technical_summary.is_empty() {
                analysis.technical_summary.push(' ');
            }
            analysis.technical_summary.push_str(&format!("{label}: {note}"));
        }
        analysis.execution_results = Some(results);
        adjustment
    }

    /// Merge a whole execution report into the result
    pub fn synthesize(&self, result: &mut AnalysisResult, report: &ExecutionReport) -> BTreeMap<Sponsor, Adjustment> {
        let mut applied = BTreeMap::new();
        for (sponsor, results) in &report.per_sponsor {
            if let Some(analysis) = result.sponsors.get_mut(sponsor) {
                let adjustment = self.apply(analysis, results.clone());
                tracing::debug!(%sponsor, ?adjustment, score = analysis.integration_score, "sponsor synthesized");
                applied.insert(*sponsor, adjustment);
            }
        }
        if report.tests_passed.is_some() {
            result.repository_stats.tests_passed = report.tests_passed;
        }
        result.execution_summary = Some(report.summary());
        applied
    }
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}
