//! Core data types shared by the research agents.

use crate::config::QueryLimits;
use crate::decision_log::DecisionEntry;
use crate::error::ValidationError;
use crate::providers::DependencyKind;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// A candidate paper returned by a paper source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default, rename = "abstract")]
    pub abstract_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Name of the source that returned this paper.
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Paper {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            authors: Vec::new(),
            abstract_text: String::new(),
            url: None,
            source: String::new(),
            embedding: None,
        }
    }

    pub fn with_abstract(mut self, abstract_text: impl Into<String>) -> Self {
        self.abstract_text = abstract_text.into();
        self
    }

    pub fn with_authors(mut self, authors: Vec<String>) -> Self {
        self.authors = authors;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Title and abstract joined, as fed to embedding and extraction.
    pub fn text(&self) -> String {
        if self.abstract_text.is_empty() {
            self.title.clone()
        } else {
            format!("{}\n\n{}", self.title, self.abstract_text)
        }
    }

    /// Key used to recognise the same paper reported by different sources.
    pub fn dedup_key(&self) -> String {
        self.title
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Structured findings extracted from one paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub paper_id: String,
    pub research_question: String,
    pub methodology: String,
    pub key_findings: Vec<String>,
    pub limitations: Vec<String>,
    /// Extraction confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Findings grouped by embedding similarity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingCluster {
    /// The first finding that seeded the cluster.
    pub representative: String,
    pub findings: Vec<String>,
    /// Papers contributing at least one finding.
    pub paper_ids: Vec<String>,
}

/// Cross-paper synthesis for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub common_themes: Vec<String>,
    pub contradictions: Vec<String>,
    pub gaps: Vec<String>,
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub clusters: Vec<FindingCluster>,
    /// Which dependency produced the themes/contradictions.
    pub produced_by: DependencyKind,
}

static DISALLOWED_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("script tag", r"(?i)<\s*/?\s*script\b"),
        ("iframe tag", r"(?i)<\s*/?\s*iframe\b"),
        ("javascript url", r"(?i)javascript\s*:"),
        ("vbscript url", r"(?i)vbscript\s*:"),
        ("html data url", r"(?i)data\s*:\s*text/html"),
        // A handler needs a quoted or called value, so prose like "one = two" passes.
        (
            "inline event handler",
            r#"(?i)\bon[a-z]{3,}\s*=\s*(["'`]|[a-z_$][\w$.]*\s*\()"#,
        ),
        ("inline event handler", r"(?i)<[a-z][^>]*\bon[a-z]+\s*="),
        ("markup tag", r"<\s*/?\s*[a-zA-Z][a-zA-Z0-9]*(\s[^>]*)?/?\s*>"),
    ]
    .into_iter()
    .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|re| (name, re)))
    .collect()
});

/// A validated research request.
///
/// Construction is the only way to obtain one, so any `ResearchQuery` in hand
/// has already passed validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResearchQuery {
    text: String,
    max_papers: usize,
}

impl ResearchQuery {
    /// Validate and build a query. Offending input is rejected, never sanitized.
    pub fn new(
        text: &str,
        max_papers: usize,
        limits: &QueryLimits,
    ) -> Result<Self, ValidationError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyQuery);
        }

        let length = trimmed.chars().count();
        if length > limits.max_query_length {
            return Err(ValidationError::QueryTooLong {
                length,
                max: limits.max_query_length,
            });
        }

        if max_papers == 0 || max_papers > limits.max_papers_ceiling {
            return Err(ValidationError::MaxPapersOutOfRange {
                value: max_papers,
                max: limits.max_papers_ceiling,
            });
        }

        if let Some((name, _)) = DISALLOWED_PATTERNS
            .iter()
            .find(|(_, re)| re.is_match(trimmed))
        {
            return Err(ValidationError::DisallowedContent {
                pattern: (*name).to_string(),
            });
        }

        Ok(Self {
            text: trimmed.to_string(),
            max_papers,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn max_papers(&self) -> usize {
        self.max_papers
    }
}

/// Final result of a research run.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchOutcome {
    pub query: String,
    pub papers_found: usize,
    pub papers_analyzed: usize,
    /// Papers whose analysis failed, with the error message.
    pub failed_papers: Vec<FailedPaper>,
    /// Refinement iterations performed after the first synthesis.
    pub iterations: usize,
    pub synthesis: Synthesis,
    /// Every automated decision of the run, in the order it was made.
    pub decisions: Vec<DecisionEntry>,
}

/// A paper excluded from synthesis because its analysis failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedPaper {
    pub paper_id: String,
    pub error: String,
}
