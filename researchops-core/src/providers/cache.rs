//! LRU embedding cache.

use super::EmbeddingClient;
use crate::error::{CacheError, DependencyError, Result};
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Hit/miss counters of a [`CachedEmbedder`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Wraps any [`EmbeddingClient`] with an in-memory LRU cache keyed by text.
///
/// The cache is an optimization only: when it cannot be used the wrapper
/// logs a [`CacheError`] and goes straight to the inner client.
pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingClient>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingClient>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.cache().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cache(&self) -> std::result::Result<MutexGuard<'_, LruCache<String, Vec<f32>>>, CacheError> {
        self.cache.lock().map_err(|_| CacheError::Unavailable {
            name: "embedding".into(),
            message: "cache lock poisoned".into(),
        })
    }

    fn lookup(&self, text: &str) -> Option<Vec<f32>> {
        match self.cache() {
            Ok(mut cache) => {
                let hit = cache.get(text).cloned();
                let counter = if hit.is_some() { &self.hits } else { &self.misses };
                counter.fetch_add(1, Ordering::Relaxed);
                hit
            }
            Err(e) => {
                warn!(error = %e, "Bypassing embedding cache");
                None
            }
        }
    }

    fn store(&self, text: &str, embedding: &[f32]) {
        match self.cache() {
            Ok(mut cache) => {
                cache.put(text.to_string(), embedding.to_vec());
            }
            Err(e) => warn!(error = %e, "Embedding not cached"),
        }
    }
}

#[async_trait]
impl EmbeddingClient for CachedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(hit) = self.lookup(text) {
            return Ok(hit);
        }
        let embedding = self.inner.embed(text).await?;
        self.store(text, &embedding);
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out: Vec<Option<Vec<f32>>> = texts.iter().map(|t| self.lookup(t)).collect();

        let missing: Vec<usize> = out
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.is_none().then_some(i))
            .collect();
        if !missing.is_empty() {
            let to_embed: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let fresh = self.inner.embed_batch(&to_embed).await?;
            if fresh.len() != missing.len() {
                return Err(DependencyError::parse(
                    "embedding",
                    format!(
                        "batch returned {} vectors for {} texts",
                        fresh.len(),
                        missing.len()
                    ),
                )
                .into());
            }
            for (i, embedding) in missing.into_iter().zip(fresh) {
                self.store(&texts[i], &embedding);
                out[i] = Some(embedding);
            }
        }

        Ok(out.into_iter().flatten().collect())
    }

    fn cosine_similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        self.inner.cosine_similarity(a, b)
    }
}
