use crate::core::{BootError, Result};
use crate::guard::GuardPolicy;
use std::time::Duration;

pub const ENV_GATEWAY_URL: &str = "SHARDSTRAP_GATEWAY_URL";
pub const ENV_STEP_TIMEOUT_MS: &str = "SHARDSTRAP_STEP_TIMEOUT_MS";
pub const ENV_RUN_TIMEOUT_MS: &str = "SHARDSTRAP_RUN_TIMEOUT_MS";
pub const ENV_MAX_CONCURRENCY: &str = "SHARDSTRAP_MAX_CONCURRENCY";
pub const ENV_TRUST_ENGINE_IDEMPOTENCE: &str = "SHARDSTRAP_TRUST_ENGINE_IDEMPOTENCE";

/// Runtime settings of a bootstrap run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapSettings {
    /// Base URL of the HTTP command gateway
    pub gateway_url: String,

    /// Bound on every probe and every mutation
    pub step_timeout: Duration,

    /// Deadline after which no new step is launched
    pub run_timeout: Option<Duration>,

    /// Steps of one stage running at the same time
    pub max_concurrency: usize,

    pub guard_policy: GuardPolicy,
}

impl BootstrapSettings {
    pub fn new(gateway_url: &str) -> Self {
        Self {
            gateway_url: gateway_url.to_string(),
            step_timeout: Duration::from_secs(10),
            run_timeout: None,
            max_concurrency: 4,
            guard_policy: GuardPolicy::default(),
        }
    }

    /// Set the per-step timeout
    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Set the whole-run deadline
    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Set maximum concurrent steps per stage
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Skip sharding probes and rely on the engine's idempotence
    pub fn trust_engine_idempotence(mut self, trust: bool) -> Self {
        self.guard_policy.trust_engine_idempotence = trust;
        self
    }

    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`, falling back to defaults for unset keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(url) = lookup(ENV_GATEWAY_URL) {
            settings.gateway_url = url;
        }
        if let Some(ms) = parse_number(&lookup, ENV_STEP_TIMEOUT_MS)? {
            settings.step_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number(&lookup, ENV_RUN_TIMEOUT_MS)? {
            settings.run_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(max) = parse_number(&lookup, ENV_MAX_CONCURRENCY)? {
            settings.max_concurrency = max as usize;
        }
        if let Some(raw) = lookup(ENV_TRUST_ENGINE_IDEMPOTENCE) {
            settings.guard_policy.trust_engine_idempotence = match raw.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                other => {
                    return Err(BootError::config(format!(
                        "{} must be true or false, got '{}'",
                        ENV_TRUST_ENGINE_IDEMPOTENCE, other
                    )));
                }
            };
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.gateway_url.starts_with("http://") || self.gateway_url.starts_with("https://")) {
            return Err(BootError::config(format!(
                "gateway url '{}' must start with http:// or https://",
                self.gateway_url
            )));
        }
        if self.max_concurrency == 0 {
            return Err(BootError::config("max_concurrency must be > 0"));
        }
        if self.step_timeout.is_zero() {
            return Err(BootError::config("step_timeout must be > 0"));
        }
        if self.run_timeout.is_some_and(|t| t.is_zero()) {
            return Err(BootError::config("run_timeout must be > 0"));
        }
        Ok(())
    }
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self::new("http://localhost:8080")
    }
}

fn parse_number<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<u64>().map_err(|_| {
                BootError::config(format!("{} must be a non-negative integer, got '{}'", key, raw))
            })
        })
        .transpose()
}
