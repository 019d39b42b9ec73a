//! Analyst agent: structured extraction of findings from a paper.

use crate::error::{DependencyError, Result};
use crate::providers::ReasoningClient;
use crate::resilience::CircuitBreaker;
use crate::types::{Analysis, Paper};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// JSON schema handed to the reasoning dependency for paper extraction.
pub static ANALYSIS_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    json!({
        "type": "object",
        "properties": {
            "research_question": { "type": "string" },
            "methodology": { "type": "string" },
            "key_findings": { "type": "array", "items": { "type": "string" } },
            "limitations": { "type": "array", "items": { "type": "string" } },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
        },
        "required": [
            "research_question",
            "methodology",
            "key_findings",
            "limitations",
            "confidence"
        ]
    })
});

#[derive(Debug, Deserialize)]
struct Extracted {
    #[serde(default)]
    research_question: String,
    #[serde(default)]
    methodology: String,
    key_findings: Vec<String>,
    #[serde(default)]
    limitations: Vec<String>,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

/// Extracts an [`Analysis`] from each paper through the reasoning dependency.
pub struct Analyst {
    reasoning: Arc<dyn ReasoningClient>,
    breaker: Arc<CircuitBreaker>,
    max_concurrent: usize,
}

impl Analyst {
    pub const NAME: &'static str = "Analyst";

    pub fn new(
        reasoning: Arc<dyn ReasoningClient>,
        breaker: Arc<CircuitBreaker>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            reasoning,
            breaker,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Analyze one paper, optionally steering extraction toward `focus` topics.
    pub async fn analyze(&self, paper: &Paper, focus: &[String]) -> Result<Analysis> {
        let text = extraction_text(paper, focus);
        let value = self
            .breaker
            .call_guarded(|| self.reasoning.extract_structured(&text, &ANALYSIS_SCHEMA))
            .await?;
        let analysis = parse_analysis(&paper.id, value)?;
        debug!(
            paper = %paper.id,
            findings = analysis.key_findings.len(),
            confidence = analysis.confidence,
            "Paper analyzed"
        );
        Ok(analysis)
    }

    /// Analyze papers concurrently, at most `max_concurrent` at a time.
    ///
    /// Results are returned in input order, one per paper.
    pub async fn analyze_all(
        &self,
        papers: &[Paper],
        focus: &[String],
    ) -> Vec<(String, Result<Analysis>)> {
        // The stream must not own a closure over `&Paper`, or the run future loses `Send`.
        let pending: Vec<_> = papers
            .iter()
            .map(|paper| async move { (paper.id.clone(), self.analyze(paper, focus).await) })
            .collect();
        futures::stream::iter(pending)
            .buffered(self.max_concurrent)
            .collect()
            .await
    }
}

fn extraction_text(paper: &Paper, focus: &[String]) -> String {
    let mut text = format!("Title: {}\n", paper.title);
    if !paper.authors.is_empty() {
        text.push_str(&format!("Authors: {}\n", paper.authors.join(", ")));
    }
    if !paper.abstract_text.is_empty() {
        text.push_str(&format!("\nAbstract:\n{}\n", paper.abstract_text));
    }
    if !focus.is_empty() {
        text.push_str("\nPay particular attention to:\n");
        for topic in focus {
            text.push_str(&format!("- {topic}\n"));
        }
    }
    text
}

fn parse_analysis(paper_id: &str, value: Value) -> Result<Analysis> {
    let extracted: Extracted = serde_json::from_value(value).map_err(|e| {
        DependencyError::parse("reasoning", format!("analysis of {paper_id}: {e}"))
    })?;
    if !extracted.confidence.is_finite() {
        return Err(DependencyError::parse(
            "reasoning",
            format!("analysis of {paper_id}: confidence is not a number"),
        )
        .into());
    }
    Ok(Analysis {
        paper_id: paper_id.to_string(),
        research_question: extracted.research_question,
        methodology: extracted.methodology,
        key_findings: extracted.key_findings,
        limitations: extracted.limitations,
        confidence: extracted.confidence.clamp(0.0, 1.0),
    })
}
