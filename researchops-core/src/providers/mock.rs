//! In-memory collaborators for tests and development.

use super::local::LocalEmbedder;
use super::{ChatMessage, CompletionParams, EmbeddingClient, PaperSource, ReasoningClient};
use crate::error::{DependencyError, PaperSourceError, ResearchOpsError, Result};
use crate::types::Paper;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type StructuredHandler = Box<dyn Fn(&str, &Value) -> Result<Value> + Send + Sync>;

/// A mock reasoning client.
///
/// `complete`/`chat` pop queued completions (falling back to a fixed reply);
/// `extract_structured` pops queued values, then consults an optional handler.
/// When set to fail, every call returns a dependency error.
pub struct MockReasoningClient {
    completions: Mutex<VecDeque<Result<String>>>,
    structured: Mutex<VecDeque<Result<Value>>>,
    handler: Option<StructuredHandler>,
    failing: AtomicBool,
    complete_calls: AtomicUsize,
    structured_calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockReasoningClient {
    /// Reply used when no completion is queued.
    pub const DEFAULT_COMPLETION: &'static str = "NO: mock reasoning has no queued response";

    pub fn new() -> Self {
        Self {
            completions: Mutex::new(VecDeque::new()),
            structured: Mutex::new(VecDeque::new()),
            handler: None,
            failing: AtomicBool::new(false),
            complete_calls: AtomicUsize::new(0),
            structured_calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A client whose every call fails.
    pub fn failing() -> Self {
        let client = Self::new();
        client.set_failing(true);
        client
    }

    /// Answer `extract_structured` calls with `handler(text, schema)` once the
    /// queue is empty.
    pub fn with_structured_handler(
        mut self,
        handler: impl Fn(&str, &Value) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn queue_completion(&self, text: impl Into<String>) {
        locked(&self.completions).push_back(Ok(text.into()));
    }

    pub fn queue_completion_error(&self, err: ResearchOpsError) {
        locked(&self.completions).push_back(Err(err));
    }

    pub fn queue_structured(&self, value: Value) {
        locked(&self.structured).push_back(Ok(value));
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `complete` and `chat` calls.
    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn structured_calls(&self) -> usize {
        self.structured_calls.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> usize {
        self.complete_calls() + self.structured_calls()
    }

    /// Every prompt passed to `complete` or `chat`, in order.
    pub fn prompts(&self) -> Vec<String> {
        locked(&self.prompts).clone()
    }

    fn unavailable() -> ResearchOpsError {
        DependencyError::request("mock-reasoning", "service unavailable").into()
    }

    fn next_completion(&self, prompt: &str) -> Result<String> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        locked(&self.prompts).push(prompt.to_string());
        if self.failing.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        locked(&self.completions)
            .pop_front()
            .unwrap_or_else(|| Ok(Self::DEFAULT_COMPLETION.to_string()))
    }
}

impl Default for MockReasoningClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReasoningClient for MockReasoningClient {
    async fn complete(&self, prompt: &str, _params: CompletionParams) -> Result<String> {
        self.next_completion(prompt)
    }

    async fn extract_structured(&self, text: &str, schema: &Value) -> Result<Value> {
        self.structured_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        if let Some(queued) = locked(&self.structured).pop_front() {
            return queued;
        }
        match &self.handler {
            Some(handler) => handler(text, schema),
            None => Err(
                DependencyError::parse("mock-reasoning", "no structured response queued").into(),
            ),
        }
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let prompt = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        self.next_completion(prompt)
    }
}

/// A mock embedding client backed by [`LocalEmbedder`].
pub struct MockEmbeddingClient {
    embedder: LocalEmbedder,
    failing: AtomicBool,
    calls: AtomicUsize,
    texts: AtomicUsize,
}

impl MockEmbeddingClient {
    pub fn new() -> Self {
        Self {
            embedder: LocalEmbedder::new(64),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        let client = Self::new();
        client.set_failing(true);
        client
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `embed` and `embed_batch` calls.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of individual texts embedded.
    pub fn texts_embedded(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }

    fn check(&self, count: usize) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(DependencyError::request("mock-embedding", "service unavailable").into());
        }
        self.texts.fetch_add(count, Ordering::SeqCst);
        Ok(())
    }
}

impl Default for MockEmbeddingClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingClient for MockEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.check(1)?;
        Ok(self.embedder.embed_text(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.check(texts.len())?;
        Ok(texts.iter().map(|t| self.embedder.embed_text(t)).collect())
    }
}

/// A mock paper source returning a fixed list of papers.
pub struct MockPaperSource {
    name: String,
    papers: Vec<Paper>,
    failure: Option<String>,
    limits: Mutex<Vec<usize>>,
}

impl MockPaperSource {
    pub fn new(name: impl Into<String>, papers: Vec<Paper>) -> Self {
        Self {
            name: name.into(),
            papers,
            failure: None,
            limits: Mutex::new(Vec::new()),
        }
    }

    /// A source whose every search fails with `message`.
    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::new(name, Vec::new())
        }
    }

    /// The `limit` of every search, in call order.
    pub fn limits(&self) -> Vec<usize> {
        locked(&self.limits).clone()
    }

    pub fn call_count(&self) -> usize {
        locked(&self.limits).len()
    }
}

#[async_trait]
impl PaperSource for MockPaperSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(
        &self,
        _query: &str,
        limit: usize,
    ) -> std::result::Result<Vec<Paper>, PaperSourceError> {
        locked(&self.limits).push(limit);
        if let Some(message) = &self.failure {
            return Err(PaperSourceError::new(&self.name, message.clone()));
        }
        Ok(self
            .papers
            .iter()
            .take(limit)
            .cloned()
            .map(|mut p| {
                if p.source.is_empty() {
                    p.source = self.name.clone();
                }
                p
            })
            .collect())
    }
}
