//! Error types for the ResearchOps core.
//!
//! Uses `thiserror` for public API error types. Every error carries a closed
//! [`ErrorKind`] tag so circuit breakers can decide which failures count
//! against a dependency, and so the boundary layer can serialize errors into
//! a uniform `{error, message, details}` shape.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Top-level error type for the ResearchOps core library.
#[derive(Debug, thiserror::Error)]
pub enum ResearchOpsError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    CircuitOpen(#[from] CircuitBreakerOpen),

    #[error("{0}")]
    RateLimited(#[from] RateLimitError),

    #[error("Paper source error: {0}")]
    PaperSource(#[from] PaperSourceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Closed set of error categories.
///
/// Circuit breakers are configured with a list of excluded kinds; any error
/// whose kind is in that list propagates without touching breaker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    CircuitOpen,
    RateLimited,
    PaperSource,
    Configuration,
    Cache,
    Dependency,
    ResponseParse,
    Batch,
    Agent,
    Serialization,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::PaperSource => "paper_source",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Cache => "cache",
            ErrorKind::Dependency => "dependency",
            ErrorKind::ResponseParse => "response_parse",
            ErrorKind::Batch => "batch",
            ErrorKind::Agent => "agent",
            ErrorKind::Serialization => "serialization",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from validating caller input.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("Query must not be empty")]
    EmptyQuery,

    #[error("Query is {length} characters, maximum is {max}")]
    QueryTooLong { length: usize, max: usize },

    #[error("max_papers must be between 1 and {max}, got {value}")]
    MaxPapersOutOfRange { value: usize, max: usize },

    #[error("Query contains disallowed content: {pattern}")]
    DisallowedContent { pattern: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidField { field: String, reason: String },
}

impl ValidationError {
    /// The input field this error refers to.
    pub fn field(&self) -> &str {
        match self {
            ValidationError::EmptyQuery
            | ValidationError::QueryTooLong { .. }
            | ValidationError::DisallowedContent { .. } => "query",
            ValidationError::MaxPapersOutOfRange { .. } => "max_papers",
            ValidationError::InvalidField { field, .. } => field,
        }
    }
}

/// A guarded dependency is unavailable because its circuit is open.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Circuit breaker '{name}' is open, retry after {}s", .retry_after.as_secs_f64())]
pub struct CircuitBreakerOpen {
    /// Name of the protected dependency.
    pub name: String,
    /// How long until the breaker will admit a trial call.
    pub retry_after: Duration,
}

/// A caller exceeded its request quota.
#[derive(Debug, Clone, thiserror::Error)]
#[error(
    "Rate limit of {limit} requests exceeded for '{identifier}' on {endpoint}, resets in {}s",
    .reset_after.as_secs()
)]
pub struct RateLimitError {
    pub identifier: String,
    pub endpoint: String,
    pub limit: u32,
    pub reset_after: Duration,
}

/// A single external paper database failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Source '{source_name}' failed: {message}")]
pub struct PaperSourceError {
    pub source_name: String,
    pub message: String,
}

impl PaperSourceError {
    pub fn new(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from in-memory caches. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache '{name}' is unavailable: {message}")]
    Unavailable { name: String, message: String },
}

/// Errors from reasoning and embedding dependencies.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DependencyError {
    #[error("Request to {dependency} failed: {message}")]
    Request { dependency: String, message: String },

    #[error("Could not parse response from {dependency}: {message}")]
    ResponseParse { dependency: String, message: String },

    #[error("Request to {dependency} timed out after {timeout_secs}s")]
    Timeout {
        dependency: String,
        timeout_secs: u64,
    },

    #[error("Authentication failed for {dependency}")]
    AuthFailed { dependency: String },
}

impl DependencyError {
    pub fn request(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        DependencyError::Request {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    pub fn parse(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        DependencyError::ResponseParse {
            dependency: dependency.into(),
            message: message.into(),
        }
    }
}

/// Errors from the request batcher. Each one belongs to a single request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BatchError {
    #[error("Timed out after {}ms waiting for request {request_id}", .timeout.as_millis())]
    Timeout { request_id: Uuid, timeout: Duration },

    #[error("Unknown request id: {request_id}")]
    UnknownRequest { request_id: Uuid },

    #[error("No processor configured for request {request_id}")]
    NotImplemented { request_id: Uuid },

    #[error("Request {request_id} was cancelled before completion")]
    Cancelled { request_id: Uuid },

    #[error("Request {request_id} failed: {message}")]
    Failed {
        request_id: Uuid,
        kind: ErrorKind,
        message: String,
    },

    #[error("Batcher is not running")]
    NotRunning,
}

/// Errors from the research pipeline orchestration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("No papers could be analyzed for query '{query}'")]
    NothingToSynthesize { query: String },
}

impl ResearchOpsError {
    /// The closed category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResearchOpsError::Validation(_) => ErrorKind::Validation,
            ResearchOpsError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            ResearchOpsError::RateLimited(_) => ErrorKind::RateLimited,
            ResearchOpsError::PaperSource(_) => ErrorKind::PaperSource,
            ResearchOpsError::Config(_) => ErrorKind::Configuration,
            ResearchOpsError::Cache(_) => ErrorKind::Cache,
            ResearchOpsError::Dependency(DependencyError::ResponseParse { .. }) => {
                ErrorKind::ResponseParse
            }
            ResearchOpsError::Dependency(_) => ErrorKind::Dependency,
            ResearchOpsError::Batch(_) => ErrorKind::Batch,
            ResearchOpsError::Agent(_) => ErrorKind::Agent,
            ResearchOpsError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Suggested delay before retrying, when one is known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ResearchOpsError::CircuitOpen(e) => Some(e.retry_after),
            ResearchOpsError::RateLimited(e) => Some(e.reset_after),
            _ => None,
        }
    }

    /// Serialize into the boundary-layer shape `{error, message, details}`.
    pub fn to_response(&self) -> ErrorResponse {
        let details = match self {
            ResearchOpsError::Validation(e) => serde_json::json!({ "field": e.field() }),
            ResearchOpsError::CircuitOpen(e) => serde_json::json!({
                "dependency": e.name,
                "retry_after_secs": e.retry_after.as_secs_f64(),
            }),
            ResearchOpsError::RateLimited(e) => serde_json::json!({
                "identifier": e.identifier,
                "endpoint": e.endpoint,
                "limit": e.limit,
                "retry_after_secs": e.reset_after.as_secs(),
            }),
            ResearchOpsError::PaperSource(e) => serde_json::json!({ "source": e.source_name }),
            ResearchOpsError::Dependency(
                DependencyError::Request { dependency, .. }
                | DependencyError::ResponseParse { dependency, .. }
                | DependencyError::Timeout { dependency, .. }
                | DependencyError::AuthFailed { dependency },
            ) => serde_json::json!({ "dependency": dependency }),
            ResearchOpsError::Batch(
                BatchError::Timeout { request_id, .. }
                | BatchError::UnknownRequest { request_id }
                | BatchError::NotImplemented { request_id }
                | BatchError::Cancelled { request_id }
                | BatchError::Failed { request_id, .. },
            ) => serde_json::json!({ "request_id": request_id }),
            _ => serde_json::Value::Object(serde_json::Map::new()),
        };

        ErrorResponse {
            error: self.kind(),
            message: self.to_string(),
            details,
        }
    }
}

/// Structured error returned to API/CLI callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorKind,
    pub message: String,
    pub details: serde_json::Value,
}

/// A type alias for results using the top-level `ResearchOpsError`.
pub type Result<T> = std::result::Result<T, ResearchOpsError>;
