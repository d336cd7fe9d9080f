//! Verification verdicts
//!
//! Turns the facts collected for one sponsor into a short judgment. A
//! model-backed judge can be plugged in; any failure falls back to
//! [`RuleBasedJudge`].

use crate::error::ReasoningError;
use crate::types::Sponsor;
use async_trait::async_trait;

/// Facts gathered while running the project
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationFacts {
    pub install_success: bool,
    pub tests_run: u32,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub app_started: bool,
    pub relevant_probes: usize,
    pub relevant_successes: usize,
    /// Steps that could not complete
    pub failures: Vec<String>,
}

#[async_trait]
pub trait VerificationJudge: Send + Sync {
    async fn judge(&self, sponsor: Sponsor, facts: &VerificationFacts) -> Result<String, ReasoningError>;
}

/// Deterministic one-sentence verdict
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedJudge;

impl RuleBasedJudge {
    #[must_use]
    pub fn verdict(sponsor: Sponsor, facts: &VerificationFacts) -> String {
        if !facts.install_success {
            let cause = facts.failures.first().map_or(String::new(), |f| format!(" ({f})"));
            return format!(
                "{sponsor} integration could not be verified: dependency installation failed{cause}."
            );
        }
        let tests = if facts.tests_run > 0 {
            format!(
                " {} of {} tests passed.",
                facts.tests_passed, facts.tests_run
            )
        } else {
            String::new()
        };
        if !facts.app_started {
            return format!(
                "{sponsor} integration could not be verified: the application did not start.{tests}"
            );
        }
        match (facts.relevant_probes, facts.relevant_successes) {
            (0, _) => format!(
                "Application started, but no endpoint tied to {sponsor} was found to probe.{tests}"
            ),
            (total, 0) => format!(
                "{sponsor} integration failed verification: none of {total} related endpoints succeeded.{tests}"
            ),
            (total, ok) => format!(
                "{sponsor} integration verified at runtime: {ok} of {total} related endpoints responded successfully.{tests}"
            ),
        }
    }
}

#[async_trait]
impl VerificationJudge for RuleBasedJudge {
    async fn judge(&self, sponsor: Sponsor, facts: &VerificationFacts) -> Result<String, ReasoningError> {
        Ok(Self::verdict(sponsor, facts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdicts() {
        let mut facts = VerificationFacts {
            install_success: true,
            app_started: true,
            relevant_probes: 2,
            relevant_successes: 1,
            ..VerificationFacts::default()
        };
        let text = RuleBasedJudge::verdict(Sponsor::Redis, &facts);
        assert!(text.starts_with("Redis integration verified at runtime: 1 of 2"));

        facts.relevant_successes = 0;
        assert!(RuleBasedJudge::verdict(Sponsor::Redis, &facts).contains("failed verification"));

        facts.app_started = false;
        facts.tests_run = 3;
        facts.tests_passed = 3;
        let text = RuleBasedJudge::verdict(Sponsor::Redis, &facts);
        assert!(text.contains("did not start"));
        assert!(text.ends_with("3 of 3 tests passed."));

        facts.install_success = false;
        facts.failures.push("npm ERR! 404".into());
        assert!(RuleBasedJudge::verdict(Sponsor::Redis, &facts).contains("(npm ERR! 404)"));
    }
}
