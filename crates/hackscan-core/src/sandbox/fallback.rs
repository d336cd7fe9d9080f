//! Provider chain
//!
//! Tries each provider's `create` in order and keeps the first session that
//! passes a liveness check. A session that comes up but does not answer is
//! destroyed before the next provider is tried. Every later call is routed
//! to the provider that owns the session.

use super::{check_liveness, CommandOutput, ProcessHandle, SandboxProvider};
use crate::error::SandboxError;
use crate::repository::RepoSnapshot;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Sandbox that falls back through a list of providers
pub struct FallbackSandbox {
    providers: Vec<Arc<dyn SandboxProvider>>,
    liveness_timeout: Duration,
    /// session id -> index into `providers`
    owners: DashMap<String, usize>,
}

impl FallbackSandbox {
    /// Chain over `providers`, most preferred first
    #[must_use]
    pub fn new(providers: Vec<Arc<dyn SandboxProvider>>) -> Self {
        Self {
            providers,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            owners: DashMap::new(),
        }
    }

    #[must_use]
    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    /// Number of providers in the chain
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    fn owner(&self, session: &str) -> Result<&Arc<dyn SandboxProvider>, SandboxError> {
        self.owners
            .get(session)
            .and_then(|index| self.providers.get(*index))
            .ok_or_else(|| SandboxError::UnknownSession(session.to_string()))
    }
}

#[async_trait]
impl SandboxProvider for FallbackSandbox {
    fn platform(&self) -> &str {
        self.providers.first().map_or("none", |p| p.platform())
    }

    fn session_platform(&self, session: &str) -> String {
        self.owner(session)
            .map_or_else(|_| self.platform().to_string(), |p| p.session_platform(session))
    }

    async fn create(&self, snapshot: &RepoSnapshot, name: &str) -> Result<String, SandboxError> {
        let mut failures = Vec::new();
        for (index, provider) in self.providers.iter().enumerate() {
            let platform = provider.platform();
            let session = match provider.create(snapshot, name).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::info!(%platform, error = %e, "sandbox provider unavailable, trying the next one");
                    failures.push(format!("{platform}: {e}"));
                    continue;
                }
            };
            match check_liveness(provider.as_ref(), &session, self.liveness_timeout).await {
                Ok(()) => {
                    tracing::debug!(%platform, %session, "sandbox session is responsive");
                    self.owners.insert(session.clone(), index);
                    return Ok(session);
                }
                Err(e) => {
                    tracing::info!(%platform, %session, error = %e, "discarding unresponsive session");
                    if let Err(teardown) = provider.destroy(&session).await {
                        tracing::warn!(%platform, %session, error = %teardown, "could not discard session");
                    }
                    failures.push(format!("{platform}: {e}"));
                }
            }
        }
        if failures.is_empty() {
            return Err(SandboxError::Provision("no sandbox providers configured".into()));
        }
        Err(SandboxError::Provision(failures.join("; ")))
    }

    async fn run(&self, session: &str, command: &str, timeout: Duration) -> Result<CommandOutput, SandboxError> {
        self.owner(session)?.run(session, command, timeout).await
    }

    async fn start_background(&self, session: &str, command: &str) -> Result<ProcessHandle, SandboxError> {
        self.owner(session)?.start_background(session, command).await
    }

    async fn background_logs(&self, session: &str, handle: &ProcessHandle) -> Result<String, SandboxError> {
        self.owner(session)?.background_logs(session, handle).await
    }

    async fn public_url(&self, session: &str, port: u16) -> Result<String, SandboxError> {
        self.owner(session)?.public_url(session, port).await
    }

    async fn destroy(&self, session: &str) -> Result<(), SandboxError> {
        let provider = Arc::clone(self.owner(session)?);
        self.owners.remove(session);
        provider.destroy(session).await
    }
}
