//! Pipeline configuration
//!
//! Passed into the controller at construction so job runs never read
//! ambient state. Loadable from TOML; a handful of switches can be
//! overridden from the environment.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Global switch for runtime verification
    pub execution_enabled: bool,
    /// Minimum static score a sponsor needs to be executed
    pub score_threshold: u8,
    /// Hard cap on static analyzer iterations
    pub max_iterations: u32,
    /// Score added when execution verifies an integration
    pub score_boost: u8,
    /// Score removed when reachable endpoints all failed
    pub score_penalty: u8,
    /// Fraction of the remaining gap to 1.0 closed on verified success
    pub confidence_gain: f64,
    /// Lifetime of fingerprint cache entries
    pub cache_ttl_secs: u64,
    /// Maximum cached results
    pub cache_capacity: u64,
    /// Per-step execution timeouts
    pub timeouts: ExecutionTimeouts,
    /// Output truncation limits
    pub limits: OutputLimits,
}

impl PipelineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML document
    ///
    /// # Errors
    /// `ConfigError::Parse` on malformed TOML, `ConfigError::Invalid` on
    /// out-of-range values
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// See [`PipelineConfig::from_toml_str`]; also `ConfigError::Read`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Apply `HACKSCAN_*` environment overrides
    ///
    /// # Errors
    /// `ConfigError::Invalid` when a variable is set but unparsable
    pub fn apply_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (env in production, a map in tests)
    ///
    /// # Errors
    /// `ConfigError::Invalid` when a value is set but unparsable
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(raw) = lookup("HACKSCAN_EXECUTION_ENABLED") {
            self.execution_enabled = parse_flag(&raw).ok_or_else(|| {
                ConfigError::Invalid(format!("HACKSCAN_EXECUTION_ENABLED={raw}"))
            })?;
        }
        if let Some(raw) = lookup("HACKSCAN_SCORE_THRESHOLD") {
            self.score_threshold = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("HACKSCAN_SCORE_THRESHOLD={raw}")))?;
        }
        if let Some(raw) = lookup("HACKSCAN_MAX_ITERATIONS") {
            self.max_iterations = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("HACKSCAN_MAX_ITERATIONS={raw}")))?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Range checks
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.score_threshold > 10 {
            return Err(ConfigError::Invalid(format!(
                "score_threshold must be 0..=10, got {}",
                self.score_threshold
            )));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid("max_iterations must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence_gain) {
            return Err(ConfigError::Invalid(format!(
                "confidence_gain must be 0..=1, got {}",
                self.confidence_gain
            )));
        }
        if self.score_boost > 10 || self.score_penalty > 10 {
            return Err(ConfigError::Invalid("score deltas must be 0..=10".into()));
        }
        Ok(())
    }

    /// With execution switch
    #[inline]
    #[must_use]
    pub fn with_execution(mut self, enabled: bool) -> Self {
        self.execution_enabled = enabled;
        self
    }

    /// With score threshold
    #[inline]
    #[must_use]
    pub fn with_score_threshold(mut self, threshold: u8) -> Self {
        self.score_threshold = threshold;
        self
    }

    /// With iteration cap
    #[inline]
    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// With timeouts
    #[inline]
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: ExecutionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Cache TTL
    #[inline]
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            execution_enabled: false,
            score_threshold: 5,
            max_iterations: 25,
            score_boost: 1,
            score_penalty: 2,
            confidence_gain: 0.5,
            cache_ttl_secs: 24 * 60 * 60,
            cache_capacity: 1_000,
            timeouts: ExecutionTimeouts::default(),
            limits: OutputLimits::default(),
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Per-step execution timeouts, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionTimeouts {
    pub provision_secs: u64,
    /// Responsiveness check right after a session is created
    pub liveness_secs: u64,
    pub install_secs: u64,
    pub test_secs: u64,
    /// Any command that is neither install nor test
    pub command_secs: u64,
    pub startup_secs: u64,
    pub probe_secs: u64,
    pub teardown_secs: u64,
    /// Grace period on top of a command's own timeout before the provider
    /// call itself is abandoned
    pub call_slack_secs: u64,
}

impl ExecutionTimeouts {
    #[inline]
    #[must_use]
    pub fn provision(&self) -> Duration {
        Duration::from_secs(self.provision_secs)
    }

    #[inline]
    #[must_use]
    pub fn liveness(&self) -> Duration {
        Duration::from_secs(self.liveness_secs)
    }

    #[inline]
    #[must_use]
    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install_secs)
    }

    #[inline]
    #[must_use]
    pub fn test(&self) -> Duration {
        Duration::from_secs(self.test_secs)
    }

    #[inline]
    #[must_use]
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    #[inline]
    #[must_use]
    pub fn startup(&self) -> Duration {
        Duration::from_secs(self.startup_secs)
    }

    #[inline]
    #[must_use]
    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }

    #[inline]
    #[must_use]
    pub fn teardown(&self) -> Duration {
        Duration::from_secs(self.teardown_secs)
    }

    #[inline]
    #[must_use]
    pub fn call_slack(&self) -> Duration {
        Duration::from_secs(self.call_slack_secs)
    }
}

impl Default for ExecutionTimeouts {
    fn default() -> Self {
        Self {
            provision_secs: 120,
            liveness_secs: 30,
            install_secs: 600,
            test_secs: 300,
            command_secs: 180,
            startup_secs: 120,
            probe_secs: 10,
            teardown_secs: 60,
            call_slack_secs: 30,
        }
    }
}

/// Output truncation limits, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputLimits {
    pub log_bytes: usize,
    pub body_bytes: usize,
    pub tool_output_bytes: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            log_bytes: 5_000,
            body_bytes: 1_000,
            tool_output_bytes: 8_000,
        }
    }
}

/// Truncate to at most `max` bytes on a char boundary, marking the cut
#[must_use]
pub fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…[truncated {} bytes]", &text[..end], text.len() - end)
}
