//! Synthesizer agent: clusters findings and produces the cross-paper synthesis.

use crate::decision_log::{Decision, DecisionLog, DecisionType};
use crate::providers::{DependencyKind, EmbeddingClient, ReasoningClient};
use crate::resilience::{BreakerOutcome, CircuitBreaker, Fallback};
use crate::types::{Analysis, FindingCluster, ResearchQuery, Synthesis};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

/// JSON schema handed to the reasoning dependency for synthesis.
pub static SYNTHESIS_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    let list = json!({ "type": "array", "items": { "type": "string" } });
    json!({
        "type": "object",
        "properties": {
            "common_themes": list,
            "contradictions": list,
            "gaps": list,
            "recommendations": list
        },
        "required": ["common_themes", "contradictions", "gaps", "recommendations"]
    })
});

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SynthesisReply {
    common_themes: Vec<String>,
    contradictions: Vec<String>,
    gaps: Vec<String>,
    recommendations: Vec<String>,
}

/// One finding with the paper it came from.
#[derive(Debug, Clone)]
struct Finding {
    text: String,
    paper_id: String,
}

/// Builds a [`Synthesis`] from per-paper analyses.
pub struct Synthesizer {
    reasoning: Arc<dyn ReasoningClient>,
    reasoning_breaker: Arc<CircuitBreaker>,
    embedding: Arc<dyn EmbeddingClient>,
    embedding_breaker: Arc<CircuitBreaker>,
    cluster_threshold: f32,
}

impl Synthesizer {
    pub const NAME: &'static str = "Synthesizer";

    pub fn new(
        reasoning: Arc<dyn ReasoningClient>,
        reasoning_breaker: Arc<CircuitBreaker>,
        embedding: Arc<dyn EmbeddingClient>,
        embedding_breaker: Arc<CircuitBreaker>,
        cluster_threshold: f32,
    ) -> Self {
        Self {
            reasoning,
            reasoning_breaker,
            embedding,
            embedding_breaker,
            cluster_threshold,
        }
    }

    /// Cluster the findings of `analyses` and summarize them.
    ///
    /// `focus` carries the gaps of the previous pass during refinement.
    /// Records one `SynthesisProduced` decision.
    pub async fn synthesize(
        &self,
        query: &ResearchQuery,
        analyses: &[Analysis],
        focus: &[String],
        log: &mut DecisionLog,
    ) -> Synthesis {
        let findings: Vec<Finding> = analyses
            .iter()
            .flat_map(|a| {
                a.key_findings.iter().map(|f| Finding {
                    text: f.clone(),
                    paper_id: a.paper_id.clone(),
                })
            })
            .collect();

        let (clusters, clustered_by) = self.cluster(&findings).await;

        let prompt = synthesis_prompt(query, analyses, &clusters, focus);
        let outcome = self
            .reasoning_breaker
            .call(
                || async {
                    self.reasoning
                        .extract_structured(&prompt, &SYNTHESIS_SCHEMA)
                        .await
                        .map(Some)
                },
                Some(Fallback::value(None)),
            )
            .await;

        let reply = match outcome {
            BreakerOutcome::Success(Some(value)) => {
                match serde_json::from_value::<SynthesisReply>(value) {
                    Ok(reply) => Some(reply),
                    Err(e) => {
                        warn!(error = %e, "Unusable synthesis reply, using heuristic");
                        None
                    }
                }
            }
            BreakerOutcome::Failed(e) => {
                warn!(error = %e, "Synthesis reasoning failed, using heuristic");
                None
            }
            _ => None,
        };

        let synthesis = match reply {
            Some(reply) => Synthesis {
                common_themes: reply.common_themes,
                contradictions: reply.contradictions,
                gaps: reply.gaps,
                recommendations: reply.recommendations,
                clusters,
                produced_by: DependencyKind::Reasoning,
            },
            None => heuristic_synthesis(analyses, clusters),
        };

        log.record(
            Decision::new(
                Self::NAME,
                DecisionType::SynthesisProduced,
                format!(
                    "{} themes, {} contradictions, {} gaps",
                    synthesis.common_themes.len(),
                    synthesis.contradictions.len(),
                    synthesis.gaps.len()
                ),
                format!(
                    "Synthesized {} findings from {} analyses into {} clusters (clustered by {})",
                    findings.len(),
                    analyses.len(),
                    synthesis.clusters.len(),
                    clustered_by
                ),
            )
            .dependency(synthesis.produced_by)
            .meta("findings", findings.len())
            .meta("clusters", synthesis.clusters.len())
            .meta("clustered_by", clustered_by.to_string())
            .meta("focus", focus.to_vec()),
        );
        synthesis
    }

    /// Group findings greedily: each finding joins the most similar existing
    /// cluster at or above `cluster_threshold` (compared with the cluster's
    /// seed), otherwise it seeds a new cluster. Without embeddings every
    /// finding is its own cluster.
    async fn cluster(&self, findings: &[Finding]) -> (Vec<FindingCluster>, DependencyKind) {
        if findings.is_empty() {
            return (Vec::new(), DependencyKind::NotUsed);
        }

        let texts: Vec<String> = findings.iter().map(|f| f.text.clone()).collect();
        let outcome = self
            .embedding_breaker
            .call(
                || async { self.embedding.embed_batch(&texts).await.map(Some) },
                Some(Fallback::value(None)),
            )
            .await;

        let vectors = match outcome {
            BreakerOutcome::Success(Some(vectors)) if vectors.len() == findings.len() => vectors,
            BreakerOutcome::Failed(e) => {
                warn!(error = %e, "Finding embedding failed, clustering disabled");
                return (singletons(findings), DependencyKind::Heuristic);
            }
            _ => return (singletons(findings), DependencyKind::Heuristic),
        };

        let mut clusters: Vec<FindingCluster> = Vec::new();
        let mut seeds: Vec<&[f32]> = Vec::new();
        for (finding, vector) in findings.iter().zip(&vectors) {
            let best = seeds
                .iter()
                .enumerate()
                .map(|(i, seed)| (i, self.embedding.cosine_similarity(seed, vector)))
                .filter(|(_, sim)| *sim >= self.cluster_threshold)
                .max_by(|a, b| a.1.total_cmp(&b.1));
            match best {
                Some((i, _)) => add_to_cluster(&mut clusters[i], finding),
                None => {
                    clusters.push(new_cluster(finding));
                    seeds.push(vector.as_slice());
                }
            }
        }
        debug!(
            findings = findings.len(),
            clusters = clusters.len(),
            "Findings clustered"
        );
        (clusters, DependencyKind::Embedding)
    }
}

fn new_cluster(finding: &Finding) -> FindingCluster {
    FindingCluster {
        representative: finding.text.clone(),
        findings: vec![finding.text.clone()],
        paper_ids: vec![finding.paper_id.clone()],
    }
}

fn add_to_cluster(cluster: &mut FindingCluster, finding: &Finding) {
    cluster.findings.push(finding.text.clone());
    if !cluster.paper_ids.contains(&finding.paper_id) {
        cluster.paper_ids.push(finding.paper_id.clone());
    }
}

fn singletons(findings: &[Finding]) -> Vec<FindingCluster> {
    findings.iter().map(new_cluster).collect()
}

/// Synthesis without the reasoning dependency: clusters shared by more than
/// one finding become themes and reported limitations become gaps.
fn heuristic_synthesis(analyses: &[Analysis], clusters: Vec<FindingCluster>) -> Synthesis {
    let common_themes = clusters
        .iter()
        .filter(|c| c.findings.len() > 1)
        .map(|c| c.representative.clone())
        .collect();

    let mut seen = HashSet::new();
    let gaps: Vec<String> = analyses
        .iter()
        .flat_map(|a| a.limitations.iter())
        .filter(|l| seen.insert(l.trim().to_lowercase()))
        .cloned()
        .collect();
    let recommendations = gaps.iter().map(|g| format!("Investigate: {g}")).collect();

    Synthesis {
        common_themes,
        contradictions: Vec::new(),
        gaps,
        recommendations,
        clusters,
        produced_by: DependencyKind::Heuristic,
    }
}

fn synthesis_prompt(
    query: &ResearchQuery,
    analyses: &[Analysis],
    clusters: &[FindingCluster],
    focus: &[String],
) -> String {
    let mut prompt = format!(
        "Synthesize the literature for the research query: {}\n\n\
         Identify common themes, contradictions between papers, open research gaps, \
         and recommendations for further work.\n\nFinding clusters:\n",
        query.text()
    );
    for (i, cluster) in clusters.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. [{} papers] {}\n",
            i + 1,
            cluster.paper_ids.len(),
            cluster.findings.join(" | ")
        ));
    }

    prompt.push_str("\nPer-paper summaries:\n");
    for analysis in analyses {
        prompt.push_str(&format!(
            "- {} (method: {}, confidence {:.2}); limitations: {}\n",
            analysis.paper_id,
            if analysis.methodology.is_empty() {
                "unspecified"
            } else {
                &analysis.methodology
            },
            analysis.confidence,
            if analysis.limitations.is_empty() {
                "none reported".to_string()
            } else {
                analysis.limitations.join("; ")
            }
        ));
    }

    if !focus.is_empty() {
        prompt.push_str(
            "\nThe previous synthesis left these gaps; address them if the evidence allows:\n",
        );
        for gap in focus {
            prompt.push_str(&format!("- {gap}\n"));
        }
    }
    prompt
}
