//! Scheduler and runtime configuration, from JSON or the environment.

use serde::{Deserialize, Serialize};

use crate::config::pool::WorkerPoolConfig;
use crate::util::clock::ClockMode;

/// Environment variable holding the worker count.
pub const ENV_WORKERS: &str = "COOP_WORKERS";
/// Environment variable holding the pool queue depth.
pub const ENV_QUEUE_DEPTH: &str = "COOP_QUEUE_DEPTH";
/// Environment variable selecting the scheduler clock (`virtual` or `wall`).
pub const ENV_CLOCK: &str = "COOP_CLOCK";
/// Environment variable naming the scheduler.
pub const ENV_SCHEDULER_NAME: &str = "COOP_SCHEDULER_NAME";

/// Cooperative scheduler configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Name used in log events. Generated when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Time source for sleeps and timeouts.
    #[serde(default)]
    pub clock: ClockMode,
}

impl SchedulerConfig {
    /// Set the scheduler name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the clock mode.
    #[must_use]
    pub const fn with_clock(mut self, clock: ClockMode) -> Self {
        self.clock = clock;
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// A description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err("scheduler name must not be empty when set".into());
        }
        Ok(())
    }
}

/// Root configuration for both runtimes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Cooperative scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Worker pool settings.
    #[serde(default)]
    pub pool: WorkerPoolConfig,
}

impl RuntimeConfig {
    /// Validate both sections.
    ///
    /// # Errors
    ///
    /// A description of the first invalid field, prefixed with its section.
    pub fn validate(&self) -> Result<(), String> {
        self.scheduler
            .validate()
            .map_err(|e| format!("scheduler invalid: {e}"))?;
        self.pool.validate().map_err(|e| format!("pool invalid: {e}"))?;
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `COOP_*` environment variables, after loading a
    /// `.env` file if one is present.
    ///
    /// # Errors
    ///
    /// A variable that does not parse, or validation failure.
    pub fn from_env() -> Result<Self, String> {
        // A missing .env file is not an error.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `COOP_*` keys.
    ///
    /// # Errors
    ///
    /// A value that does not parse, or validation failure.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(raw) = lookup(ENV_WORKERS) {
            cfg.pool.worker_count = parse_number(ENV_WORKERS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_QUEUE_DEPTH) {
            cfg.pool.max_queue_depth = Some(parse_number(ENV_QUEUE_DEPTH, &raw)?);
        }
        if let Some(raw) = lookup(ENV_CLOCK) {
            cfg.scheduler.clock = raw
                .parse()
                .map_err(|e| format!("{ENV_CLOCK}: {e}"))?;
        }
        if let Some(name) = lookup(ENV_SCHEDULER_NAME) {
            cfg.scheduler.name = Some(name);
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_number(key: &str, raw: &str) -> Result<usize, String> {
    raw.trim()
        .parse()
        .map_err(|e| format!("{key}: `{raw}` is not a valid count: {e}"))
}
