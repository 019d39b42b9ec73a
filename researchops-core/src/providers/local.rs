//! Offline adapters: a hashing embedder and a JSON-file paper source.

use super::{EmbeddingClient, PaperSource};
use crate::error::{ConfigError, PaperSourceError, Result};
use crate::types::Paper;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

/// Default dimensionality of [`LocalEmbedder`] vectors.
pub const DEFAULT_DIMENSIONS: usize = 256;

/// Deterministic hashed term-frequency embedder. No network access.
///
/// Each lowercased alphanumeric term is hashed into one of `dimensions`
/// buckets; the vector is L2-normalized.
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dimensions: usize,
}

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed synchronously.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        let mut tf: HashMap<&str, usize> = HashMap::new();
        let lowered = text.to_lowercase();
        for term in terms(&lowered) {
            *tf.entry(term).or_insert(0) += 1;
        }
        if tf.is_empty() {
            return vector;
        }

        for (term, count) in &tf {
            vector[djb2(term) % self.dimensions] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for LocalEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

fn djb2(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

fn terms(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
}

#[async_trait]
impl EmbeddingClient for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Serves papers from a JSON array on disk, ranked by naive term overlap.
#[derive(Debug, Clone)]
pub struct JsonPaperSource {
    name: String,
    papers: Vec<Paper>,
}

impl JsonPaperSource {
    pub fn new(name: impl Into<String>, papers: Vec<Paper>) -> Self {
        let name = name.into();
        let papers = papers
            .into_iter()
            .map(|mut p| {
                if p.source.is_empty() {
                    p.source = name.clone();
                }
                p
            })
            .collect();
        Self { name, papers }
    }

    /// Load a corpus file. The source is named after the file stem.
    pub fn from_file(path: &Path) -> std::result::Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.to_path_buf(),
        })?;
        let papers: Vec<Paper> =
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
                message: format!("{}: {e}", path.display()),
            })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "papers".to_string());
        debug!(source = %name, papers = papers.len(), "Loaded paper corpus");
        Ok(Self::new(name, papers))
    }

    pub fn len(&self) -> usize {
        self.papers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.papers.is_empty()
    }
}

#[async_trait]
impl PaperSource for JsonPaperSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> std::result::Result<Vec<Paper>, PaperSourceError> {
        let lowered = query.to_lowercase();
        let wanted: HashSet<&str> = terms(&lowered).collect();

        let mut scored: Vec<(usize, &Paper)> = self
            .papers
            .iter()
            .filter_map(|paper| {
                let text = paper.text().to_lowercase();
                let hits = terms(&text)
                    .collect::<HashSet<_>>()
                    .intersection(&wanted)
                    .count();
                (hits > 0).then_some((hits, paper))
            })
            .collect();
        // Stable sort keeps file order among equal scores.
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, paper)| paper.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::cosine_similarity;

    #[test]
    fn test_local_embedder_is_normalized_and_deterministic() {
        let embedder = LocalEmbedder::new(64);
        let a = embedder.embed_text("Sleep consolidates memory");
        let b = embedder.embed_text("sleep CONSOLIDATES memory!");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_local_embedder_similarity_tracks_overlap() {
        let embedder = LocalEmbedder::default();
        let query = embedder.embed_text("sleep memory consolidation");
        let close = embedder.embed_text("memory consolidation during sleep");
        let far = embedder.embed_text("protein folding kinetics");
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let v = LocalEmbedder::new(8).embed_text("  ...  ");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    fn corpus() -> JsonPaperSource {
        JsonPaperSource::new(
            "corpus",
            vec![
                Paper::new("p1", "Protein folding with deep learning"),
                Paper::new("p2", "Sleep and memory consolidation")
                    .with_abstract("We study memory replay during sleep."),
                Paper::new("p3", "Memory allocators").with_source("arxiv"),
            ],
        )
    }

    #[tokio::test]
    async fn test_json_source_ranks_by_overlap() {
        let source = corpus();
        let papers = source.search("sleep memory", 10).await.unwrap();
        let ids: Vec<&str> = papers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p2", "p3"]);
        assert_eq!(papers[0].source, "corpus");
        assert_eq!(papers[1].source, "arxiv");

        let limited = source.search("sleep memory", 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("neuro.json");
        std::fs::write(
            &path,
            r#"[{"id": "n1", "title": "Hippocampal replay",
                 "abstract": "Replay in rats.", "authors": ["A. Author"]}]"#,
        )
        .unwrap();

        let source = JsonPaperSource::from_file(&path).unwrap();
        assert_eq!(source.name(), "neuro");
        assert_eq!(source.len(), 1);

        let missing = JsonPaperSource::from_file(&dir.path().join("nope.json"));
        assert!(matches!(missing, Err(ConfigError::FileNotFound { .. })));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            JsonPaperSource::from_file(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
