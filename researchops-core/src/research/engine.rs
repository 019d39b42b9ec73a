//! Research pipeline orchestrator.
//!
//! Drives one run through search, analysis and synthesis, letting the
//! coordinator decide when to widen the search and when the synthesis is
//! done. Every transition and judgment lands in the run's decision log,
//! which is returned with the outcome.

use super::analyst::Analyst;
use super::coordinator::Coordinator;
use super::scout::Scout;
use super::session::{ResearchRun, RunPhase};
use super::synthesizer::Synthesizer;
use crate::config::{PipelineConfig, QueryLimits, ResearchOpsConfig};
use crate::decision_log::{Decision, DecisionLog, DecisionType};
use crate::error::{AgentError, ResearchOpsError, Result};
use crate::providers::{Dependencies, DependencyKind};
use crate::resilience::{CircuitBreaker, CircuitBreakerSnapshot};
use crate::types::{Analysis, FailedPaper, Paper, ResearchOutcome, ResearchQuery, Synthesis};
use std::sync::Arc;
use tracing::{info, warn};

/// The multi-agent research pipeline.
pub struct ResearchOpsAgent {
    scout: Scout,
    analyst: Analyst,
    synthesizer: Synthesizer,
    coordinator: Coordinator,
    reasoning_breaker: Arc<CircuitBreaker>,
    embedding_breaker: Arc<CircuitBreaker>,
    pipeline: PipelineConfig,
    limits: QueryLimits,
}

/// Analyses and failures of the papers of one run, keyed by paper id.
#[derive(Debug, Default)]
struct AnalysisSet {
    analyses: Vec<Analysis>,
    failed: Vec<FailedPaper>,
}

impl AnalysisSet {
    fn is_failed(&self, paper_id: &str) -> bool {
        self.failed.iter().any(|f| f.paper_id == paper_id)
    }

    fn is_low_confidence(&self, paper_id: &str, threshold: f64) -> bool {
        self.analyses
            .iter()
            .any(|a| a.paper_id == paper_id && a.confidence < threshold)
    }

    /// Store a fresh analysis, replacing an earlier one or clearing a failure.
    fn accept(&mut self, analysis: Analysis) {
        self.failed.retain(|f| f.paper_id != analysis.paper_id);
        match self
            .analyses
            .iter_mut()
            .find(|a| a.paper_id == analysis.paper_id)
        {
            Some(existing) => *existing = analysis,
            None => self.analyses.push(analysis),
        }
    }

    /// Record a failure. Returns `true` if an earlier analysis was kept.
    fn reject(&mut self, paper_id: &str, error: String) -> bool {
        if self.analyses.iter().any(|a| a.paper_id == paper_id) {
            return true;
        }
        match self.failed.iter_mut().find(|f| f.paper_id == paper_id) {
            Some(existing) => existing.error = error,
            None => self.failed.push(FailedPaper {
                paper_id: paper_id.to_string(),
                error,
            }),
        }
        false
    }
}

impl ResearchOpsAgent {
    pub fn new(deps: Dependencies, pipeline: PipelineConfig, limits: QueryLimits) -> Self {
        let Dependencies {
            reasoning,
            reasoning_breaker,
            embedding,
            embedding_breaker,
            sources,
        } = deps;

        Self {
            scout: Scout::new(sources),
            analyst: Analyst::new(
                reasoning.clone(),
                reasoning_breaker.clone(),
                pipeline.max_concurrent_analyses,
            ),
            synthesizer: Synthesizer::new(
                reasoning.clone(),
                reasoning_breaker.clone(),
                embedding.clone(),
                embedding_breaker.clone(),
                pipeline.cluster_threshold,
            ),
            coordinator: Coordinator::new(
                reasoning,
                reasoning_breaker.clone(),
                embedding,
                embedding_breaker.clone(),
                pipeline.clone(),
            ),
            reasoning_breaker,
            embedding_breaker,
            pipeline,
            limits,
        }
    }

    pub fn from_config(deps: Dependencies, config: &ResearchOpsConfig) -> Self {
        Self::new(deps, config.pipeline.clone(), config.query.clone())
    }

    pub fn limits(&self) -> &QueryLimits {
        &self.limits
    }

    /// Snapshots of the reasoning and embedding breakers.
    pub fn breaker_states(&self) -> Vec<CircuitBreakerSnapshot> {
        vec![
            self.reasoning_breaker.get_state(),
            self.embedding_breaker.get_state(),
        ]
    }

    /// Validate `query` and run the full pipeline.
    ///
    /// Invalid input is rejected before any dependency is called.
    pub async fn run(&self, query: &str, max_papers: usize) -> Result<ResearchOutcome> {
        let query = ResearchQuery::new(query, max_papers, &self.limits)?;
        self.run_query(query).await
    }

    /// Run the pipeline for an already validated query.
    pub async fn run_query(&self, query: ResearchQuery) -> Result<ResearchOutcome> {
        let mut log = DecisionLog::new();
        let mut run = ResearchRun::new(query.text());
        info!(
            run_id = %run.id,
            query = %query.text(),
            max_papers = query.max_papers(),
            "Research run started"
        );

        match self.execute(&query, &mut run, &mut log).await {
            Ok(mut outcome) => {
                info!(
                    run_id = %run.id,
                    papers_analyzed = outcome.papers_analyzed,
                    failed = outcome.failed_papers.len(),
                    iterations = outcome.iterations,
                    decisions = log.len(),
                    "Research run complete"
                );
                outcome.decisions = log.into_entries();
                Ok(outcome)
            }
            Err(e) => {
                run.fail(e.to_string(), &mut log);
                warn!(
                    run_id = %run.id,
                    error = %e,
                    decisions = log.len(),
                    "Research run failed"
                );
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        query: &ResearchQuery,
        run: &mut ResearchRun,
        log: &mut DecisionLog,
    ) -> Result<ResearchOutcome> {
        run.transition(
            RunPhase::Searching,
            format!(
                "Query validated; searching {} sources for up to {} papers",
                self.scout.source_count(),
                query.max_papers()
            ),
            log,
        )?;
        let papers = self.collect_papers(query, log).await;

        run.transition(
            RunPhase::Analyzing,
            format!("Analyzing {} papers", papers.len()),
            log,
        )?;
        let mut set = AnalysisSet::default();
        self.analyze(&papers, &[], &mut set, log).await;
        if set.analyses.is_empty() {
            return Err(AgentError::NothingToSynthesize {
                query: query.text().to_string(),
            }
            .into());
        }

        run.transition(
            RunPhase::Synthesizing,
            format!(
                "{} of {} papers analyzed",
                set.analyses.len(),
                papers.len()
            ),
            log,
        )?;
        let mut synthesis = self
            .synthesizer
            .synthesize(query, &set.analyses, &[], log)
            .await;

        let mut iterations = 0;
        while !self
            .coordinator
            .is_synthesis_complete(query, &synthesis, iterations, log)
            .await
        {
            iterations += 1;
            log.set_iteration(iterations);
            synthesis = self
                .refine(query, run, &papers, &mut set, &synthesis, log)
                .await?;
        }

        run.transition(
            RunPhase::Complete,
            format!("Synthesis accepted after {iterations} refinement iterations"),
            log,
        )?;

        Ok(ResearchOutcome {
            query: query.text().to_string(),
            papers_found: papers.len(),
            papers_analyzed: set.analyses.len(),
            failed_papers: set.failed,
            iterations,
            synthesis,
            decisions: Vec::new(),
        })
    }

    /// Initial search plus any expansion rounds the coordinator asks for.
    async fn collect_papers(&self, query: &ResearchQuery, log: &mut DecisionLog) -> Vec<Paper> {
        let mut per_source_limit = query.max_papers();
        let mut papers = self.scout.search(query, per_source_limit, log).await;

        let mut round = 0;
        loop {
            let coverage = self
                .coordinator
                .assess_coverage(query, &mut papers, log)
                .await;
            if !self
                .coordinator
                .should_search_more(query, papers.len(), coverage, round, log)
                .await
            {
                break;
            }
            round += 1;
            per_source_limit = per_source_limit.saturating_mul(2);
            let more = self.scout.search(query, per_source_limit, log).await;
            papers = Scout::merge(papers, more, query.max_papers());
        }
        papers
    }

    /// One refinement pass: re-analyze weak papers against the open gaps,
    /// then synthesize again.
    async fn refine(
        &self,
        query: &ResearchQuery,
        run: &mut ResearchRun,
        papers: &[Paper],
        set: &mut AnalysisSet,
        previous: &Synthesis,
        log: &mut DecisionLog,
    ) -> Result<Synthesis> {
        let threshold = self.pipeline.low_confidence_threshold;
        let targets: Vec<Paper> = papers
            .iter()
            .filter(|p| set.is_failed(&p.id) || set.is_low_confidence(&p.id, threshold))
            .cloned()
            .collect();
        let focus = previous.gaps.clone();

        run.transition(
            RunPhase::Refining,
            format!(
                "{} gaps open; {} papers failed or below confidence {:.2}",
                focus.len(),
                targets.len(),
                threshold
            ),
            log,
        )?;

        if !targets.is_empty() {
            run.transition(
                RunPhase::Analyzing,
                format!("Re-analyzing {} papers with the open gaps as focus", targets.len()),
                log,
            )?;
            self.analyze(&targets, &focus, set, log).await;
        }

        run.transition(
            RunPhase::Synthesizing,
            format!("Re-synthesizing {} analyses", set.analyses.len()),
            log,
        )?;
        Ok(self
            .synthesizer
            .synthesize(query, &set.analyses, &focus, log)
            .await)
    }

    async fn analyze(
        &self,
        papers: &[Paper],
        focus: &[String],
        set: &mut AnalysisSet,
        log: &mut DecisionLog,
    ) {
        for (paper_id, result) in self.analyst.analyze_all(papers, focus).await {
            match result {
                Ok(analysis) => set.accept(analysis),
                Err(e) => {
                    let kept_previous = set.reject(&paper_id, e.to_string());
                    record_analysis_failure(log, &paper_id, &e, kept_previous);
                }
            }
        }
    }
}

fn record_analysis_failure(
    log: &mut DecisionLog,
    paper_id: &str,
    error: &ResearchOpsError,
    kept_previous: bool,
) {
    warn!(paper = %paper_id, error = %error, "Paper analysis failed");
    let decision = if kept_previous {
        format!("Keep earlier analysis of {paper_id}")
    } else {
        format!("Exclude {paper_id} from synthesis")
    };
    log.record(
        Decision::new(
            Analyst::NAME,
            DecisionType::AnalysisFailure,
            decision,
            error.to_string(),
        )
        .dependency(DependencyKind::Reasoning)
        .meta("paper_id", paper_id)
        .meta("error_kind", error.kind().as_str())
        .meta("kept_previous", kept_previous),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakersConfig;
    use crate::providers::{
        MockEmbeddingClient, MockPaperSource, MockReasoningClient, PaperSource,
    };
    use serde_json::json;

    fn deps(
        reasoning: Arc<MockReasoningClient>,
        sources: Vec<Arc<MockPaperSource>>,
    ) -> Dependencies {
        Dependencies::new(
            reasoning,
            Arc::new(MockEmbeddingClient::new()),
            sources
                .into_iter()
                .map(|s| s as Arc<dyn PaperSource>)
                .collect(),
            &BreakersConfig::default(),
        )
    }

    fn papers(n: usize) -> Vec<Paper> {
        (0..n)
            .map(|i| Paper::new(format!("p{i}"), format!("sleep memory study {i}")))
            .collect()
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_run_futures_are_send() {
        let agent = ResearchOpsAgent::new(
            deps(Arc::new(MockReasoningClient::new()), vec![]),
            PipelineConfig::default(),
            QueryLimits::default(),
        );
        let query = ResearchQuery::new("sleep memory", 3, agent.limits()).unwrap();
        // Batched runs are spawned onto the runtime.
        assert_send(&agent.run_query(query));
        assert_send(&agent.run("sleep memory", 3));
    }

    #[test]
    fn test_analysis_set_bookkeeping() {
        let mut set = AnalysisSet::default();
        assert!(!set.reject("p1", "boom".into()));
        assert!(set.is_failed("p1"));
        assert!(!set.reject("p1", "boom again".into()));
        assert_eq!(set.failed.len(), 1);
        assert_eq!(set.failed[0].error, "boom again");

        set.accept(Analysis {
            paper_id: "p1".into(),
            research_question: String::new(),
            methodology: String::new(),
            key_findings: vec!["f".into()],
            limitations: Vec::new(),
            confidence: 0.2,
        });
        assert!(!set.is_failed("p1"));
        assert!(set.is_low_confidence("p1", 0.5));
        assert!(set.reject("p1", "later failure".into()));
        assert_eq!(set.analyses.len(), 1);
        assert!(set.failed.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_query_makes_no_calls() {
        let reasoning = Arc::new(MockReasoningClient::new());
        let source = Arc::new(MockPaperSource::new("arxiv", papers(3)));
        let agent = ResearchOpsAgent::new(
            deps(reasoning.clone(), vec![source.clone()]),
            PipelineConfig::default(),
            QueryLimits::default(),
        );

        let err = agent.run("<script>alert(1)</script>", 5).await.unwrap_err();
        assert!(matches!(err, ResearchOpsError::Validation(_)));
        assert_eq!(source.call_count(), 0);
        assert_eq!(reasoning.call_count(), 0);
    }

    #[tokio::test]
    async fn test_no_analyzable_papers_fails_run() {
        let reasoning = Arc::new(MockReasoningClient::failing());
        let source = Arc::new(MockPaperSource::new("arxiv", papers(2)));
        let agent = ResearchOpsAgent::new(
            deps(reasoning, vec![source]),
            PipelineConfig::default(),
            QueryLimits::default(),
        );

        let err = agent.run("sleep memory", 2).await.unwrap_err();
        assert!(matches!(
            err,
            ResearchOpsError::Agent(AgentError::NothingToSynthesize { .. })
        ));
    }

    #[tokio::test]
    async fn test_single_pass_when_reasoning_accepts() {
        let reasoning = Arc::new(
            MockReasoningClient::new().with_structured_handler(|text, schema| {
                if schema["required"][0] == "common_themes" {
                    Ok(json!({ "common_themes": ["sleep helps"], "gaps": [] }))
                } else {
                    Ok(json!({
                        "key_findings": [text.lines().next().unwrap_or_default()],
                        "confidence": 0.9
                    }))
                }
            }),
        );
        reasoning.queue_completion("YES: the synthesis answers the query");
        let source = Arc::new(MockPaperSource::new("arxiv", papers(3)));
        let agent = ResearchOpsAgent::new(
            deps(reasoning, vec![source]),
            PipelineConfig::default(),
            QueryLimits::default(),
        );

        let outcome = agent.run("sleep memory", 3).await.unwrap();
        assert_eq!(outcome.papers_found, 3);
        assert_eq!(outcome.papers_analyzed, 3);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(outcome.synthesis.common_themes, vec!["sleep helps"]);
        assert_eq!(outcome.synthesis.produced_by, DependencyKind::Reasoning);

        let phases: Vec<&str> = outcome
            .decisions
            .iter()
            .filter(|d| d.decision_type == DecisionType::StateTransition)
            .map(|d| d.decision.as_str())
            .collect();
        assert_eq!(
            phases,
            vec![
                "validating -> searching",
                "searching -> analyzing",
                "analyzing -> synthesizing",
                "synthesizing -> complete"
            ]
        );
        let ids: Vec<usize> = outcome.decisions.iter().map(|d| d.id).collect();
        assert_eq!(ids, (0..outcome.decisions.len()).collect::<Vec<_>>());
    }
}
