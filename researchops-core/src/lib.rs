//! # ResearchOps Core
//!
//! Core library for ResearchOps, an automated literature-review pipeline.
//! Provides the research agents and their orchestrator, the resilience
//! primitives guarding external dependencies (circuit breaker, rate limiter,
//! request batcher), the per-run decision log, configuration, and the
//! collaborator traits with their adapters.

pub mod config;
pub mod decision_log;
pub mod error;
pub mod providers;
pub mod research;
pub mod resilience;
pub mod service;
pub mod types;

// Re-export commonly used types at the crate root.
pub use config::{ResearchOpsConfig, load_config};
pub use decision_log::{Decision, DecisionEntry, DecisionLog, DecisionType};
pub use error::{ErrorKind, ErrorResponse, ResearchOpsError, Result};
pub use providers::{
    Dependencies, DependencyKind, EmbeddingClient, PaperSource, ReasoningClient,
};
pub use research::{ResearchOpsAgent, RunPhase};
pub use resilience::{
    BreakerOutcome, CircuitBreaker, CircuitState, Fallback, RateLimiter, RequestBatcher,
};
pub use service::{HealthReport, HealthStatus, ResearchService};
pub use types::{Analysis, Paper, ResearchOutcome, ResearchQuery, Synthesis};
