//! Scout agent: collects candidate papers from every source.

use crate::decision_log::{Decision, DecisionLog, DecisionType};
use crate::providers::PaperSource;
use crate::types::{Paper, ResearchQuery};
use futures::future::join_all;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Queries all paper sources concurrently and deduplicates the results.
pub struct Scout {
    sources: Vec<Arc<dyn PaperSource>>,
}

impl Scout {
    pub const NAME: &'static str = "Scout";

    pub fn new(sources: Vec<Arc<dyn PaperSource>>) -> Self {
        Self { sources }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Ask every source for up to `per_source_limit` papers.
    ///
    /// A failing source is logged and skipped. The result is deduplicated and
    /// bounded to the query's `max_papers`. Records one decision.
    pub async fn search(
        &self,
        query: &ResearchQuery,
        per_source_limit: usize,
        log: &mut DecisionLog,
    ) -> Vec<Paper> {
        let results = join_all(self.sources.iter().map(|source| async move {
            (
                source.name().to_string(),
                source.search(query.text(), per_source_limit).await,
            )
        }))
        .await;

        let mut per_source = serde_json::Map::new();
        let mut failures = Vec::new();
        let mut collected = Vec::new();
        for (name, result) in results {
            match result {
                Ok(papers) => {
                    debug!(source = %name, count = papers.len(), "Source returned papers");
                    per_source.insert(name, json!(papers.len()));
                    collected.extend(papers);
                }
                Err(e) => {
                    warn!(source = %name, error = %e, "Paper source failed, continuing without it");
                    failures.push(json!({ "source": name, "error": e.message }));
                }
            }
        }

        let returned = collected.len();
        let papers = Self::merge(Vec::new(), collected, query.max_papers());

        let mut reasoning = format!(
            "{} of {} sources answered with {} papers ({} after deduplication, limit {})",
            per_source.len(),
            self.sources.len(),
            returned,
            papers.len(),
            query.max_papers(),
        );
        if !failures.is_empty() {
            reasoning.push_str(&format!("; {} source(s) failed", failures.len()));
        }

        log.record(
            Decision::new(
                Self::NAME,
                DecisionType::PaperSearch,
                format!("Collected {} papers", papers.len()),
                reasoning,
            )
            .meta("per_source_limit", per_source_limit)
            .meta("per_source", per_source)
            .meta("failures", failures)
            .meta("returned", returned),
        );
        papers
    }

    /// Append `incoming` to `existing`, skipping papers already present by id
    /// or normalized title, and stop at `max` papers. Existing papers keep
    /// their position and any embedding already attached.
    pub fn merge(existing: Vec<Paper>, incoming: Vec<Paper>, max: usize) -> Vec<Paper> {
        let mut ids: HashSet<String> = existing.iter().map(|p| p.id.clone()).collect();
        let mut titles: HashSet<String> = existing.iter().map(Paper::dedup_key).collect();
        let mut merged = existing;
        merged.truncate(max);

        for paper in incoming {
            if merged.len() >= max {
                break;
            }
            let key = paper.dedup_key();
            if ids.contains(&paper.id) || (!key.is_empty() && titles.contains(&key)) {
                continue;
            }
            ids.insert(paper.id.clone());
            titles.insert(key);
            merged.push(paper);
        }
        merged
    }
}
