//! Configuration for the dispatch engine.
//!
//! Everything is set via environment variables:
//! - `SWITCHYARD_API_KEY` - Optional. API key for the OpenAI-compatible backend.
//!   When absent the demo binary falls back to a local scripted provider.
//! - `SWITCHYARD_BASE_URL` - Optional. Backend base URL. Defaults to `https://api.openai.com/v1`.
//! - `SWITCHYARD_MODEL` - Optional. Primary model identifier. Defaults to `gpt-4o-mini`.
//! - `SWITCHYARD_FALLBACK_MODEL` - Optional. Second chain link on the same backend.
//! - `SWITCHYARD_AGENTS_PATH` - Optional. Agent catalog JSON file. Defaults to `agents.json`.
//! - `SWITCHYARD_MAX_ITERATIONS` - Optional. Provider attempts per request. Defaults to `20`.
//! - `SWITCHYARD_MAX_ATTEMPTS_PER_PROVIDER` - Optional. Retries within one link. Defaults to `3`.
//! - `SWITCHYARD_MAX_WALL_TIME_SECS` - Optional. Wall-time budget per request. Defaults to `120`.
//! - `SWITCHYARD_MAX_TOKENS` - Optional. Token-event cap per request. Unlimited when unset.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::request::{Budget, BudgetError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error(transparent)]
    Budget(#[from] BudgetError),
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API key for the OpenAI-compatible backend, if any
    pub api_key: Option<String>,

    /// Backend base URL
    pub base_url: String,

    /// Primary model identifier
    pub model: String,

    /// Optional fallback model on the same backend
    pub fallback_model: Option<String>,

    /// Agent catalog storage path
    pub agents_path: PathBuf,

    /// Provider attempts per request, across the whole chain
    pub max_iterations: u32,

    /// Retries within a single chain link
    pub max_attempts_per_provider: u32,

    /// Wall-time budget per request
    pub max_wall_time: Duration,

    /// Token-event cap per request
    pub max_tokens: Option<u64>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric variable fails to
    /// parse. A missing API key is not an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("SWITCHYARD_API_KEY").ok().filter(|k| !k.is_empty());

        let base_url = std::env::var("SWITCHYARD_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        let model =
            std::env::var("SWITCHYARD_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let fallback_model = std::env::var("SWITCHYARD_FALLBACK_MODEL").ok();

        let agents_path = std::env::var("SWITCHYARD_AGENTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("agents.json"));

        let max_iterations = parse_env("SWITCHYARD_MAX_ITERATIONS", 20)?;
        let max_attempts_per_provider = parse_env("SWITCHYARD_MAX_ATTEMPTS_PER_PROVIDER", 3)?;
        let max_wall_time_secs: u64 = parse_env("SWITCHYARD_MAX_WALL_TIME_SECS", 120)?;

        let max_tokens = match std::env::var("SWITCHYARD_MAX_TOKENS") {
            Ok(raw) => Some(raw.parse().map_err(|e| {
                ConfigError::InvalidValue("SWITCHYARD_MAX_TOKENS".to_string(), format!("{e}"))
            })?),
            Err(_) => None,
        };

        Ok(Self {
            api_key,
            base_url,
            model,
            fallback_model,
            agents_path,
            max_iterations,
            max_attempts_per_provider,
            max_wall_time: Duration::from_secs(max_wall_time_secs),
            max_tokens,
        })
    }

    /// Budget derived from the configured limits.
    pub fn budget(&self) -> Result<Budget, ConfigError> {
        Ok(Budget::new(
            self.max_iterations,
            self.max_attempts_per_provider,
            self.max_wall_time,
            self.max_tokens,
        )?)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_environment() {
        // Env-var reads race with other tests that set them; this exercises
        // only the derived budget, which is pure.
        let config = Config {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            fallback_model: None,
            agents_path: PathBuf::from("agents.json"),
            max_iterations: 20,
            max_attempts_per_provider: 3,
            max_wall_time: Duration::from_secs(120),
            max_tokens: None,
        };
        let budget = config.budget().unwrap();
        assert_eq!(budget.max_total_iterations, 20);
        assert_eq!(budget.max_attempts_per_provider, 3);
        assert_eq!(budget.max_wall_time, Duration::from_secs(120));
        assert!(budget.max_tokens.is_none());
    }

    #[test]
    fn zero_iteration_limit_is_rejected() {
        let config = Config {
            api_key: None,
            base_url: String::new(),
            model: String::new(),
            fallback_model: None,
            agents_path: PathBuf::new(),
            max_iterations: 0,
            max_attempts_per_provider: 3,
            max_wall_time: Duration::from_secs(120),
            max_tokens: None,
        };
        assert!(config.budget().is_err());
    }
}
