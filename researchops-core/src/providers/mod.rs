//! External collaborators of the research pipeline.
//!
//! Defines the three dependency traits the agents talk to:
//! - [`ReasoningClient`]: completions and structured extraction (an LLM)
//! - [`EmbeddingClient`]: text embeddings
//! - [`PaperSource`]: a paper database
//!
//! and the [`Dependencies`] bundle that pairs each guarded dependency with its
//! own circuit breaker. Concrete adapters live in the submodules; use
//! [`Dependencies::from_config`] to build the default wiring.

pub mod cache;
pub mod local;
pub mod mock;
pub mod openai_compat;

use crate::config::{BreakersConfig, ResearchOpsConfig};
use crate::error::{ConfigError, PaperSourceError, Result};
use crate::resilience::CircuitBreaker;
use crate::types::Paper;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub use cache::CachedEmbedder;
pub use local::{JsonPaperSource, LocalEmbedder};
pub use mock::{MockEmbeddingClient, MockPaperSource, MockReasoningClient};
pub use openai_compat::OpenAiCompatibleClient;

/// Which dependency informed a decision or produced a result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Reasoning,
    Embedding,
    /// A local rule stood in for an unavailable dependency.
    Heuristic,
    /// No dependency was consulted.
    #[default]
    #[serde(rename = "none")]
    NotUsed,
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DependencyKind::Reasoning => "reasoning",
            DependencyKind::Embedding => "embedding",
            DependencyKind::Heuristic => "heuristic",
            DependencyKind::NotUsed => "none",
        };
        f.write_str(s)
    }
}

/// Sampling parameters for a free-text completion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletionParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.2,
            top_p: 0.9,
        }
    }
}

/// The role of a message in a chat exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A language model used for judgments and structured extraction.
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    /// Complete a single prompt.
    async fn complete(&self, prompt: &str, params: CompletionParams) -> Result<String>;

    /// Extract a JSON value from `text` that conforms to `schema`.
    async fn extract_structured(
        &self,
        text: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value>;

    /// Continue a multi-turn conversation.
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// A text embedding model.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts; results are in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Similarity of two embeddings in `[0, 1]`.
    fn cosine_similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        cosine_similarity(a, b)
    }
}

/// A searchable paper database.
#[async_trait]
pub trait PaperSource: Send + Sync {
    fn name(&self) -> &str;

    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> std::result::Result<Vec<Paper>, PaperSourceError>;
}

/// Cosine similarity clamped to `[0, 1]`.
///
/// Mismatched lengths, empty vectors and zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

/// Every external collaborator of a research run, with one circuit breaker
/// per guarded dependency.
#[derive(Clone)]
pub struct Dependencies {
    pub reasoning: Arc<dyn ReasoningClient>,
    pub reasoning_breaker: Arc<CircuitBreaker>,
    pub embedding: Arc<dyn EmbeddingClient>,
    pub embedding_breaker: Arc<CircuitBreaker>,
    pub sources: Vec<Arc<dyn PaperSource>>,
}

impl Dependencies {
    pub fn new(
        reasoning: Arc<dyn ReasoningClient>,
        embedding: Arc<dyn EmbeddingClient>,
        sources: Vec<Arc<dyn PaperSource>>,
        breakers: &BreakersConfig,
    ) -> Self {
        Self {
            reasoning,
            reasoning_breaker: Arc::new(CircuitBreaker::new("reasoning", &breakers.reasoning)),
            embedding,
            embedding_breaker: Arc::new(CircuitBreaker::new("embedding", &breakers.embedding)),
            sources,
        }
    }

    /// Build the default adapters described by `config`.
    ///
    /// The reasoning dependency always talks to an OpenAI-compatible endpoint.
    /// The embedding dependency does too, unless `embedding.local` is set.
    /// Embeddings are cached when `embedding_cache_capacity > 0`.
    pub fn from_config(config: &ResearchOpsConfig) -> std::result::Result<Self, ConfigError> {
        let reasoning: Arc<dyn ReasoningClient> =
            Arc::new(OpenAiCompatibleClient::new(&config.reasoning)?);

        let embedding: Arc<dyn EmbeddingClient> = if config.embedding.local {
            Arc::new(LocalEmbedder::default())
        } else {
            Arc::new(OpenAiCompatibleClient::new(&config.embedding)?)
        };
        let embedding = match config.embedding_cache_capacity {
            0 => embedding,
            capacity => {
                Arc::new(CachedEmbedder::new(embedding, capacity)) as Arc<dyn EmbeddingClient>
            }
        };

        let mut sources: Vec<Arc<dyn PaperSource>> = Vec::new();
        for path in &config.paper_files {
            sources.push(Arc::new(JsonPaperSource::from_file(path)?));
        }

        let embedding_model = if config.embedding.local {
            "local"
        } else {
            config.embedding.model.as_str()
        };
        info!(
            reasoning = %config.reasoning.model,
            embedding = embedding_model,
            sources = sources.len(),
            "Dependencies initialized"
        );

        Ok(Self::new(reasoning, embedding, sources, &config.breakers))
    }
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies")
            .field("reasoning_breaker", &self.reasoning_breaker.get_state())
            .field("embedding_breaker", &self.embedding_breaker.get_state())
            .field(
                "sources",
                &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
