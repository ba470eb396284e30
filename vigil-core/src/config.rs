//! Engine configuration types

use crate::{AuditLevel, ConfigError, Usd, VigilError, VigilResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How controller calls drive the step loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Run the loop to its next suspension point before returning.
    #[default]
    Inline,
    /// Run the loop on a background task and return immediately.
    Spawn,
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Inline => f.write_str("inline"),
            DispatchMode::Spawn => f.write_str("spawn"),
        }
    }
}

impl FromStr for DispatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inline" => Ok(DispatchMode::Inline),
            "spawn" => Ok(DispatchMode::Spawn),
            _ => Err(ConfigError::InvalidValue {
                field: "dispatch_mode".to_string(),
                value: s.to_string(),
                reason: "expected inline or spawn".to_string(),
            }),
        }
    }
}

/// Retry configuration for the opt-in retrying invoker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f32,
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Price of one million tokens for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: Usd,
    pub output_per_million: Usd,
}

/// Model prices used when the tool does not report a cost itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingConfig {
    pub default: ModelPrice,
    #[serde(default)]
    pub models: BTreeMap<String, ModelPrice>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default: ModelPrice {
                input_per_million: Usd::from_micros(3_000_000),
                output_per_million: Usd::from_micros(15_000_000),
            },
            models: BTreeMap::new(),
        }
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub dispatch_mode: DispatchMode,
    /// Take an automatic checkpoint every N completed steps.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub audit_min_level: AuditLevel,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
}

fn default_checkpoint_interval() -> u32 {
    1
}

fn default_model() -> String {
    "default".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::default_engine()
    }
}

impl EngineConfig {
    /// Build the default engine configuration: inline dispatch, a checkpoint
    /// after every completed step, info-level auditing.
    pub fn default_engine() -> Self {
        Self {
            dispatch_mode: DispatchMode::Inline,
            checkpoint_interval: default_checkpoint_interval(),
            default_model: default_model(),
            max_tokens: default_max_tokens(),
            audit_min_level: AuditLevel::Info,
            retry: RetryConfig::default(),
            pricing: PricingConfig::default(),
        }
    }

    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: u32) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Load defaults overridden by `VIGIL_*` environment variables.
    pub fn from_env() -> VigilResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> VigilResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default_engine();

        if let Some(mode) = lookup("VIGIL_DISPATCH_MODE") {
            config.dispatch_mode = mode.parse()?;
        }
        if let Some(interval) = parse_var(&lookup, "VIGIL_CHECKPOINT_INTERVAL")? {
            config.checkpoint_interval = interval;
        }
        if let Some(model) = lookup("VIGIL_DEFAULT_MODEL") {
            config.default_model = model;
        }
        if let Some(max_tokens) = parse_var(&lookup, "VIGIL_MAX_TOKENS")? {
            config.max_tokens = max_tokens;
        }
        if let Some(level) = lookup("VIGIL_AUDIT_MIN_LEVEL") {
            config.audit_min_level =
                AuditLevel::from_db_str(&level).map_err(|e| ConfigError::InvalidValue {
                    field: "VIGIL_AUDIT_MIN_LEVEL".to_string(),
                    value: level.clone(),
                    reason: e.to_string(),
                })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - checkpoint_interval > 0
    /// - max_tokens > 0
    /// - default_model is not empty
    /// - retry backoff is positive and bounded
    pub fn validate(&self) -> VigilResult<()> {
        if self.checkpoint_interval == 0 {
            return Err(invalid(
                "checkpoint_interval",
                self.checkpoint_interval,
                "checkpoint_interval must be greater than 0",
            ));
        }

        if self.max_tokens == 0 {
            return Err(invalid(
                "max_tokens",
                self.max_tokens,
                "max_tokens must be greater than 0",
            ));
        }

        if self.default_model.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "default_model".to_string(),
            }
            .into());
        }

        if self.retry.initial_backoff_ms == 0 {
            return Err(invalid(
                "retry.initial_backoff_ms",
                self.retry.initial_backoff_ms,
                "initial backoff must be positive",
            ));
        }

        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(invalid(
                "retry.max_backoff_ms",
                self.retry.max_backoff_ms,
                "max backoff must not be below the initial backoff",
            ));
        }

        if self.retry.backoff_multiplier < 1.0 {
            return Err(invalid(
                "retry.backoff_multiplier",
                self.retry.backoff_multiplier,
                "backoff_multiplier must be at least 1.0",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, value: impl fmt::Display, reason: &str) -> VigilError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                field: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}
