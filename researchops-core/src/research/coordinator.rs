//! Coordinator agent: judges coverage, search expansion and completion.
//!
//! Each judgment produces exactly one decision entry naming the dependency
//! that informed it. When the reasoning circuit is open the coordinator falls
//! back to simple local rules and records the decision as `heuristic`.

use crate::config::PipelineConfig;
use crate::decision_log::{Decision, DecisionLog, DecisionType};
use crate::providers::{CompletionParams, DependencyKind, EmbeddingClient, ReasoningClient};
use crate::resilience::{BreakerOutcome, CircuitBreaker, Fallback};
use crate::types::{Paper, ResearchQuery, Synthesis};
use std::sync::Arc;
use tracing::{debug, warn};

/// Below this coverage the heuristic asks for a wider search.
const HEURISTIC_COVERAGE_TARGET: f64 = 0.5;

/// A parsed `YES|NO: reasoning` answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub yes: bool,
    pub reasoning: String,
}

/// Parse a `YES: ...` / `NO: ...` reply. Returns `None` when the reply does
/// not start with a recognizable answer.
pub fn parse_verdict(reply: &str) -> Option<Verdict> {
    let trimmed = reply.trim();
    let (answer, rest) = match trimmed.split_once(':') {
        Some((answer, rest)) => (answer.trim(), rest.trim()),
        None => (trimmed, ""),
    };
    let answer = answer
        .trim_matches(|c: char| !c.is_alphabetic())
        .to_ascii_uppercase();
    let yes = match answer.as_str() {
        "YES" => true,
        "NO" => false,
        _ => return None,
    };
    let reasoning = if rest.is_empty() {
        "no reason given".to_string()
    } else {
        rest.to_string()
    };
    Some(Verdict { yes, reasoning })
}

/// The pipeline's decision maker.
pub struct Coordinator {
    reasoning: Arc<dyn ReasoningClient>,
    reasoning_breaker: Arc<CircuitBreaker>,
    embedding: Arc<dyn EmbeddingClient>,
    embedding_breaker: Arc<CircuitBreaker>,
    config: PipelineConfig,
}

impl Coordinator {
    pub const NAME: &'static str = "Coordinator";

    pub fn new(
        reasoning: Arc<dyn ReasoningClient>,
        reasoning_breaker: Arc<CircuitBreaker>,
        embedding: Arc<dyn EmbeddingClient>,
        embedding_breaker: Arc<CircuitBreaker>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            reasoning,
            reasoning_breaker,
            embedding,
            embedding_breaker,
            config,
        }
    }

    fn params(&self) -> CompletionParams {
        CompletionParams {
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
        }
    }

    /// Measure how much of the requested paper budget is relevant to the query.
    ///
    /// Embeds the query and any paper without an embedding, storing the
    /// vectors on the papers. Coverage is the fraction of `max_papers` whose
    /// similarity to the query reaches `relevance_threshold`. Without the
    /// embedding dependency it is simply `papers / max_papers`.
    pub async fn assess_coverage(
        &self,
        query: &ResearchQuery,
        papers: &mut [Paper],
        log: &mut DecisionLog,
    ) -> f64 {
        let max_papers = query.max_papers() as f64;
        let missing: Vec<usize> = papers
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.embedding.is_none().then_some(i))
            .collect();
        let mut texts = Vec::with_capacity(missing.len() + 1);
        texts.push(query.text().to_string());
        texts.extend(missing.iter().map(|&i| papers[i].text()));

        let outcome = self
            .embedding_breaker
            .call(
                || async { self.embedding.embed_batch(&texts).await.map(Some) },
                Some(Fallback::value(None)),
            )
            .await;

        let vectors = match outcome {
            BreakerOutcome::Success(Some(vectors)) if vectors.len() == texts.len() => Some(vectors),
            BreakerOutcome::Failed(e) => {
                warn!(error = %e, "Embedding failed during coverage assessment");
                None
            }
            _ => None,
        };

        let (coverage, relevant, dependency, reasoning) = match vectors {
            Some(mut vectors) => {
                let query_vec = vectors.remove(0);
                for (&i, vector) in missing.iter().zip(vectors) {
                    papers[i].embedding = Some(vector);
                }
                let relevant = papers
                    .iter()
                    .filter_map(|p| p.embedding.as_deref())
                    .filter(|e| {
                        self.embedding.cosine_similarity(&query_vec, e)
                            >= self.config.relevance_threshold
                    })
                    .count();
                let coverage = (relevant as f64 / max_papers).min(1.0);
                (
                    coverage,
                    relevant,
                    DependencyKind::Embedding,
                    format!(
                        "{relevant} of {} papers reach similarity {:.2} against a target of {}",
                        papers.len(),
                        self.config.relevance_threshold,
                        query.max_papers()
                    ),
                )
            }
            None => {
                let coverage = (papers.len() as f64 / max_papers).min(1.0);
                (
                    coverage,
                    papers.len(),
                    DependencyKind::Heuristic,
                    format!(
                        "Embeddings unavailable; {} papers found against a target of {}",
                        papers.len(),
                        query.max_papers()
                    ),
                )
            }
        };

        log.record(
            Decision::new(
                Self::NAME,
                DecisionType::CoverageAssessment,
                format!("Coverage {:.0}%", coverage * 100.0),
                reasoning,
            )
            .dependency(dependency)
            .meta("coverage", coverage)
            .meta("relevant", relevant)
            .meta("papers_found", papers.len()),
        );
        coverage
    }

    /// Decide whether another, wider search round is worthwhile.
    pub async fn should_search_more(
        &self,
        query: &ResearchQuery,
        papers_found: usize,
        coverage: f64,
        round: usize,
        log: &mut DecisionLog,
    ) -> bool {
        let target = query.max_papers();
        let (expand, reasoning, dependency) = if papers_found >= target {
            (
                false,
                format!("Found {papers_found} papers, target of {target} reached"),
                DependencyKind::NotUsed,
            )
        } else if round >= self.config.max_search_rounds {
            (
                false,
                format!(
                    "Search round limit of {} reached with {papers_found} papers",
                    self.config.max_search_rounds
                ),
                DependencyKind::NotUsed,
            )
        } else {
            let prompt = format!(
                "You are coordinating a literature review.\n\
                 Research query: {}\n\
                 Papers found: {papers_found} of {target} requested.\n\
                 Estimated coverage of the query: {:.0}%.\n\
                 Search round: {} of {}.\n\n\
                 Should the search be expanded to find more papers? Answer YES or NO, \
                 then a colon and a one-sentence reason.",
                query.text(),
                coverage * 100.0,
                round + 1,
                self.config.max_search_rounds,
            );
            match self.ask(&prompt).await {
                Some(verdict) => (verdict.yes, verdict.reasoning, DependencyKind::Reasoning),
                None => {
                    let expand = coverage < HEURISTIC_COVERAGE_TARGET;
                    (
                        expand,
                        format!(
                            "Reasoning unavailable; coverage {:.0}% is {} the {:.0}% target",
                            coverage * 100.0,
                            if expand { "below" } else { "at or above" },
                            HEURISTIC_COVERAGE_TARGET * 100.0
                        ),
                        DependencyKind::Heuristic,
                    )
                }
            }
        };

        log.record(
            Decision::new(
                Self::NAME,
                DecisionType::SearchExpansion,
                if expand { "Expand search" } else { "Stop searching" },
                reasoning,
            )
            .dependency(dependency)
            .meta("papers_found", papers_found)
            .meta("coverage", coverage)
            .meta("round", round),
        );
        expand
    }

    /// Decide whether the synthesis is good enough to finish the run.
    ///
    /// `iteration` counts refinement passes already performed.
    pub async fn is_synthesis_complete(
        &self,
        query: &ResearchQuery,
        synthesis: &Synthesis,
        iteration: usize,
        log: &mut DecisionLog,
    ) -> bool {
        let (complete, reasoning, dependency) = if iteration >= self.config.max_iterations {
            (
                true,
                format!(
                    "Refinement limit of {} iterations reached",
                    self.config.max_iterations
                ),
                DependencyKind::NotUsed,
            )
        } else {
            let prompt = format!(
                "You are reviewing a literature synthesis.\n\
                 Research query: {}\n\
                 Common themes:\n{}\n\
                 Contradictions:\n{}\n\
                 Open gaps:\n{}\n\n\
                 Is this synthesis sufficient to answer the query? Answer YES or NO, \
                 then a colon and a one-sentence reason.",
                query.text(),
                bullet_list(&synthesis.common_themes),
                bullet_list(&synthesis.contradictions),
                bullet_list(&synthesis.gaps),
            );
            match self.ask(&prompt).await {
                Some(verdict) => (verdict.yes, verdict.reasoning, DependencyKind::Reasoning),
                None => {
                    let complete = synthesis.gaps.is_empty();
                    (
                        complete,
                        if complete {
                            "Reasoning unavailable; no open gaps remain".to_string()
                        } else {
                            format!(
                                "Reasoning unavailable; {} open gaps remain",
                                synthesis.gaps.len()
                            )
                        },
                        DependencyKind::Heuristic,
                    )
                }
            }
        };

        log.record(
            Decision::new(
                Self::NAME,
                DecisionType::SynthesisCompletion,
                if complete { "Synthesis complete" } else { "Refine synthesis" },
                reasoning,
            )
            .dependency(dependency)
            .meta("iteration", iteration)
            .meta("gaps", synthesis.gaps.len()),
        );
        complete
    }

    /// Ask the reasoning dependency a yes/no question through its breaker.
    /// `None` means the caller should fall back to its heuristic.
    async fn ask(&self, prompt: &str) -> Option<Verdict> {
        let params = self.params();
        let outcome = self
            .reasoning_breaker
            .call(
                || async { self.reasoning.complete(prompt, params).await.map(Some) },
                Some(Fallback::value(None)),
            )
            .await;

        match outcome {
            BreakerOutcome::Success(Some(reply)) => {
                let parsed = parse_verdict(&reply);
                if parsed.is_none() {
                    debug!(reply = %reply, "Unrecognized coordinator reply");
                }
                parsed
            }
            BreakerOutcome::Failed(e) => {
                warn!(error = %e, "Coordinator judgment failed");
                None
            }
            _ => None,
        }
    }
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none)".to_string();
    }
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}
