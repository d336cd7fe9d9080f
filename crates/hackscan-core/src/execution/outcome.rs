//! Step outcomes
//!
//! Every execution step resolves to a [`StepOutcome`] at its call site so
//! no sandbox error unwinds past the step that caused it.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Result of one guarded step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome<T> {
    Completed(T),
    /// The provider call returned an error
    Failed(String),
    /// The provider call did not return within its limit
    TimedOut(Duration),
}

impl<T> StepOutcome<T> {
    #[inline]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Value of a completed step
    #[inline]
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Failed(_) | Self::TimedOut(_) => None,
        }
    }

    /// Human-readable reason for a step that did not complete
    pub fn failure(&self) -> Option<String> {
        match self {
            Self::Completed(_) => None,
            Self::Failed(reason) => Some(reason.clone()),
            Self::TimedOut(limit) => Some(format!("timed out after {}s", limit.as_secs())),
        }
    }
}

/// Await `step` under `limit`, folding errors and timeouts into the outcome
pub async fn guarded<T, E, F>(limit: Duration, step: F) -> StepOutcome<T>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, step).await {
        Ok(Ok(value)) => StepOutcome::Completed(value),
        Ok(Err(e)) => StepOutcome::Failed(e.to_string()),
        Err(_) => StepOutcome::TimedOut(limit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;

    #[tokio::test]
    async fn guarded_folds_every_case() {
        let ok = guarded(Duration::from_secs(1), async { Ok::<_, SandboxError>(7) }).await;
        assert_eq!(ok, StepOutcome::Completed(7));

        let failed: StepOutcome<()> = guarded(Duration::from_secs(1), async {
            Err(SandboxError::Command("npm: not found".into()))
        })
        .await;
        assert_eq!(failed.failure().as_deref(), Some("command failed to launch: npm: not found"));

        let slow: StepOutcome<()> = guarded(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, SandboxError>(())
        })
        .await;
        assert!(matches!(slow, StepOutcome::TimedOut(_)));
        assert!(!slow.is_completed());
        assert!(slow.completed().is_none());
    }
}
