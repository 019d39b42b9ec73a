//! Configuration system for ResearchOps.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/researchops/config.toml` and/or
//! `.researchops/config.toml` in the workspace directory.

use crate::error::{ConfigError, ErrorKind};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for a ResearchOps deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchOpsConfig {
    pub reasoning: EndpointConfig,
    pub embedding: EndpointConfig,
    pub breakers: BreakersConfig,
    pub rate_limit: RateLimitConfig,
    pub batcher: BatcherConfig,
    pub pipeline: PipelineConfig,
    pub query: QueryLimits,
    /// Entries kept by the embedding LRU cache (0 disables caching).
    pub embedding_cache_capacity: usize,
    /// Paper corpus files served by the local JSON source.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paper_files: Vec<PathBuf>,
}

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base URL of the API (e.g. `https://api.openai.com/v1`).
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Use the offline local implementation instead of the HTTP endpoint.
    pub local: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            timeout_secs: 60,
            local: false,
        }
    }
}

/// Circuit breaker settings for each guarded dependency.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakersConfig {
    pub reasoning: CircuitBreakerConfig,
    pub embedding: CircuitBreakerConfig,
}

/// Settings for a single circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub fail_max: u32,
    /// Seconds the circuit stays open before a trial call is allowed.
    pub timeout_secs: f64,
    /// Consecutive half-open successes required to close the circuit.
    pub success_threshold: u32,
    /// Error kinds that propagate without counting as dependency failures.
    pub excluded_kinds: Vec<ErrorKind>,
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            fail_max: 5,
            timeout_secs: 60.0,
            success_threshold: 2,
            excluded_kinds: vec![ErrorKind::Validation],
        }
    }
}

/// Per-window request limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per window when no endpoint override matches.
    pub default_limit: u32,
    /// Window length in seconds.
    pub default_window_secs: u64,
    /// Multiplier applied to a limit to derive the burst ceiling.
    pub burst_multiplier: f64,
    /// Explicit number of requests admitted beyond the limit. Takes
    /// precedence over `burst_multiplier` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_allowance: Option<u32>,
    /// Endpoint-specific limits, keyed by endpoint path.
    pub endpoints: HashMap<String, EndpointLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "/research".to_string(),
            EndpointLimit {
                limit: 10,
                window_secs: 60,
            },
        );
        endpoints.insert(
            "/health".to_string(),
            EndpointLimit {
                limit: 100,
                window_secs: 60,
            },
        );
        Self {
            default_limit: 60,
            default_window_secs: 60,
            burst_multiplier: 1.0,
            burst_allowance: None,
            endpoints,
        }
    }
}

/// A `(limit, window)` override for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLimit {
    pub limit: u32,
    pub window_secs: u64,
}

/// Request batcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Maximum requests per batch.
    pub batch_size: usize,
    /// How long to wait for each further request before flushing a partial batch.
    pub batch_timeout_ms: u64,
    /// Requests that already waited this long are flushed on their own.
    pub max_wait_ms: u64,
    /// Finished results nobody collected are dropped after this long.
    pub result_ttl_ms: u64,
}

impl BatcherConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_millis(self.result_ttl_ms)
    }
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_timeout_ms: 500,
            max_wait_ms: 2_000,
            result_ttl_ms: 30_000,
        }
    }
}

/// Agent pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum refinement iterations after the first synthesis.
    pub max_iterations: usize,
    /// Maximum additional search rounds the coordinator may request.
    pub max_search_rounds: usize,
    /// Upper bound on concurrently running paper analyses.
    pub max_concurrent_analyses: usize,
    /// Similarity between query and paper at which a paper counts as relevant.
    pub relevance_threshold: f32,
    /// Similarity at which two findings join the same cluster.
    pub cluster_threshold: f32,
    /// Analyses below this confidence are revisited during refinement.
    pub low_confidence_threshold: f64,
    /// Sampling parameters for coordinator judgments.
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2,
            max_search_rounds: 2,
            max_concurrent_analyses: 4,
            relevance_threshold: 0.3,
            cluster_threshold: 0.75,
            low_confidence_threshold: 0.5,
            max_tokens: 512,
            temperature: 0.2,
            top_p: 0.9,
        }
    }
}

/// Bounds applied when validating a research query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryLimits {
    pub max_query_length: usize,
    pub max_papers_ceiling: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_query_length: 1000,
            max_papers_ceiling: 100,
        }
    }
}

impl ResearchOpsConfig {
    /// Check cross-field invariants. Any failure is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, breaker) in [
            ("reasoning", &self.breakers.reasoning),
            ("embedding", &self.breakers.embedding),
        ] {
            if breaker.fail_max == 0 {
                return Err(invalid(format!("breakers.{name}.fail_max must be > 0")));
            }
            if breaker.success_threshold == 0 {
                return Err(invalid(format!(
                    "breakers.{name}.success_threshold must be > 0"
                )));
            }
            if !breaker.timeout_secs.is_finite() || breaker.timeout_secs < 0.0 {
                return Err(invalid(format!(
                    "breakers.{name}.timeout_secs must be a non-negative number"
                )));
            }
        }

        if self.reasoning.local {
            return Err(invalid(
                "reasoning.local is not supported: only embeddings have an offline implementation",
            ));
        }

        if self.rate_limit.default_limit == 0 || self.rate_limit.default_window_secs == 0 {
            return Err(invalid(
                "rate_limit.default_limit and default_window_secs must be > 0",
            ));
        }
        if !self.rate_limit.burst_multiplier.is_finite() || self.rate_limit.burst_multiplier < 1.0
        {
            return Err(invalid("rate_limit.burst_multiplier must be >= 1.0"));
        }
        for (endpoint, limit) in &self.rate_limit.endpoints {
            if limit.limit == 0 || limit.window_secs == 0 {
                return Err(invalid(format!(
                    "rate_limit.endpoints.{endpoint} must have a non-zero limit and window"
                )));
            }
        }

        if self.batcher.batch_size == 0 {
            return Err(invalid("batcher.batch_size must be > 0"));
        }
        if self.batcher.result_ttl_ms == 0 {
            return Err(invalid("batcher.result_ttl_ms must be > 0"));
        }
        if self.pipeline.max_concurrent_analyses == 0 {
            return Err(invalid("pipeline.max_concurrent_analyses must be > 0"));
        }
        if self.query.max_papers_ceiling == 0 || self.query.max_query_length == 0 {
            return Err(invalid("query limits must be > 0"));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `RESEARCHOPS_`)
/// 3. Explicit config file, or workspace-local config (`.researchops/config.toml`)
/// 4. User config (`~/.config/researchops/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
    overrides: Option<&ResearchOpsConfig>,
) -> Result<ResearchOpsConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(ResearchOpsConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "researchops", "researchops") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".researchops").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = config_file {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    // Environment variables (RESEARCHOPS_PIPELINE__MAX_ITERATIONS, etc.)
    figment = figment.merge(Env::prefixed("RESEARCHOPS_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: ResearchOpsConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ResearchOpsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.breakers.reasoning.fail_max, 5);
        assert_eq!(
            config.breakers.reasoning.excluded_kinds,
            vec![ErrorKind::Validation]
        );
        assert_eq!(config.rate_limit.endpoints["/research"].limit, 10);
        assert_eq!(config.rate_limit.endpoints["/health"].limit, 100);
    }

    #[test]
    fn test_validate_rejects_zero_fail_max() {
        let mut config = ResearchOpsConfig::default();
        config.breakers.embedding.fail_max = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("breakers.embedding.fail_max"));
    }

    #[test]
    fn test_validate_rejects_sub_unit_burst_multiplier() {
        let mut config = ResearchOpsConfig::default();
        config.rate_limit.burst_multiplier = 0.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_load_config_from_workspace_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join(".researchops");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.toml"),
            r#"
[pipeline]
max_iterations = 4

[breakers.reasoning]
fail_max = 3
timeout_secs = 1.5

[rate_limit.endpoints."/custom"]
limit = 7
window_secs = 30
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None, None).unwrap();
        assert_eq!(config.pipeline.max_iterations, 4);
        assert_eq!(config.breakers.reasoning.fail_max, 3);
        assert_eq!(
            config.breakers.reasoning.timeout(),
            Duration::from_millis(1500)
        );
        // Untouched sections keep their defaults.
        assert_eq!(config.breakers.embedding.fail_max, 5);
        assert_eq!(config.rate_limit.endpoints["/custom"].limit, 7);
    }

    #[test]
    fn test_load_config_missing_explicit_file() {
        let err = load_config(None, Some(Path::new("/nonexistent/researchops.toml")), None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[batcher]\nbatch_size = 0\n").unwrap();
        let err = load_config(None, Some(&path), None).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_to_toml_round_trips_through_figment() {
        let config = ResearchOpsConfig::default();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("[pipeline]"));
        let parsed: ResearchOpsConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.batcher.batch_size, config.batcher.batch_size);
    }
}
