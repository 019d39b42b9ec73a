//! Research run decision log.
//!
//! Records every automated decision made during one research run (state
//! transitions, search expansion, completion judgments, per-paper failures)
//! with human-readable reasoning and the dependency that informed it. The log
//! is the explainability record of a run, so it is append-only and unbounded
//! for the lifetime of the run.

use crate::providers::DependencyKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of an automated decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    /// The run moved to a new phase.
    StateTransition,
    /// Papers were collected from the sources.
    PaperSearch,
    /// Query coverage was measured.
    CoverageAssessment,
    /// Whether to widen the search.
    SearchExpansion,
    /// A paper's analysis failed and it was excluded.
    AnalysisFailure,
    /// A synthesis was produced.
    SynthesisProduced,
    /// Whether the synthesis is good enough to finish.
    SynthesisCompletion,
}

impl std::fmt::Display for DecisionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DecisionType::StateTransition => "state-transition",
            DecisionType::PaperSearch => "paper-search",
            DecisionType::CoverageAssessment => "coverage-assessment",
            DecisionType::SearchExpansion => "search-expansion",
            DecisionType::AnalysisFailure => "analysis-failure",
            DecisionType::SynthesisProduced => "synthesis-produced",
            DecisionType::SynthesisCompletion => "synthesis-completion",
        };
        f.write_str(s)
    }
}

/// A single recorded decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEntry {
    /// Monotonically increasing within a run.
    pub id: usize,
    pub timestamp: DateTime<Utc>,
    /// Refinement iteration the decision belongs to (0 = initial pass).
    pub iteration: usize,
    /// Agent that made the decision (e.g. "Coordinator").
    pub agent_name: String,
    pub decision_type: DecisionType,
    /// What was decided.
    pub decision: String,
    /// Why it was decided.
    pub reasoning: String,
    /// Which dependency informed the decision.
    pub dependency_used: DependencyKind,
    /// Free-form structured context (counts, scores, ids).
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Builder-style draft of a decision, completed by [`DecisionLog::record`].
#[derive(Debug, Clone)]
pub struct Decision {
    agent_name: String,
    decision_type: DecisionType,
    decision: String,
    reasoning: String,
    dependency_used: DependencyKind,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl Decision {
    pub fn new(
        agent_name: impl Into<String>,
        decision_type: DecisionType,
        decision: impl Into<String>,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            decision_type,
            decision: decision.into(),
            reasoning: reasoning.into(),
            dependency_used: DependencyKind::NotUsed,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn dependency(mut self, dependency: DependencyKind) -> Self {
        self.dependency_used = dependency;
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Ordered log of the decisions of one run.
#[derive(Debug, Default)]
pub struct DecisionLog {
    entries: Vec<DecisionEntry>,
    iteration: usize,
}

impl DecisionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the iteration stamped onto subsequent entries.
    pub fn set_iteration(&mut self, iteration: usize) {
        self.iteration = iteration;
    }

    /// Append a decision and return its id.
    pub fn record(&mut self, decision: Decision) -> usize {
        let id = self.entries.len();
        tracing::debug!(
            id,
            agent = %decision.agent_name,
            decision_type = %decision.decision_type,
            dependency = %decision.dependency_used,
            "{}",
            decision.decision
        );
        self.entries.push(DecisionEntry {
            id,
            timestamp: Utc::now(),
            iteration: self.iteration,
            agent_name: decision.agent_name,
            decision_type: decision.decision_type,
            decision: decision.decision,
            reasoning: decision.reasoning,
            dependency_used: decision.dependency_used,
            metadata: decision.metadata,
        });
        id
    }

    pub fn entries(&self) -> &[DecisionEntry] {
        &self.entries
    }

    pub fn get(&self, id: usize) -> Option<&DecisionEntry> {
        self.entries.get(id)
    }

    /// All entries of the given type, in order.
    pub fn of_type(&self, decision_type: DecisionType) -> Vec<&DecisionEntry> {
        self.entries
            .iter()
            .filter(|e| e.decision_type == decision_type)
            .collect()
    }

    /// All entries made by the named agent, in order.
    pub fn by_agent(&self, agent_name: &str) -> Vec<&DecisionEntry> {
        self.entries
            .iter()
            .filter(|e| e.agent_name == agent_name)
            .collect()
    }

    /// Get the most recent N decisions, newest first.
    pub fn recent(&self, n: usize) -> Vec<&DecisionEntry> {
        self.entries.iter().rev().take(n).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<DecisionEntry> {
        self.entries
    }

    /// Format recent decisions as a human-readable trace.
    pub fn format_recent(&self, n: usize) -> String {
        let recent = self.recent(n);
        if recent.is_empty() {
            return "No decisions recorded yet.".to_string();
        }

        let mut output = String::new();
        for entry in recent.iter().rev() {
            output.push_str(&format!(
                "[#{} iter={} {}] {} {}: {}\n",
                entry.id,
                entry.iteration,
                entry.timestamp.format("%H:%M:%S"),
                entry.agent_name,
                entry.decision_type,
                entry.decision,
            ));
            output.push_str(&format!("  Reasoning: {}\n", entry.reasoning));
            if entry.dependency_used != DependencyKind::NotUsed {
                output.push_str(&format!("  Dependency: {}\n", entry.dependency_used));
            }
            output.push('\n');
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_query() {
        let mut log = DecisionLog::new();

        let id = log.record(
            Decision::new(
                "Coordinator",
                DecisionType::SearchExpansion,
                "search more",
                "only 3 of 10 papers found",
            )
            .dependency(DependencyKind::Reasoning)
            .meta("papers_found", 3),
        );
        assert_eq!(id, 0);
        assert_eq!(log.len(), 1);

        let entry = log.get(0).unwrap();
        assert_eq!(entry.agent_name, "Coordinator");
        assert_eq!(entry.dependency_used, DependencyKind::Reasoning);
        assert_eq!(entry.metadata["papers_found"], 3);
    }

    #[test]
    fn test_ids_and_timestamps_are_ordered() {
        let mut log = DecisionLog::new();
        for i in 0..20 {
            log.record(Decision::new(
                "Engine",
                DecisionType::StateTransition,
                format!("step {i}"),
                "next phase",
            ));
        }
        let entries = log.entries();
        for pair in entries.windows(2) {
            assert_eq!(pair[1].id, pair[0].id + 1);
            assert!(pair[1].timestamp >= pair[0].timestamp);
        }
    }

    #[test]
    fn test_log_is_unbounded() {
        let mut log = DecisionLog::new();
        for i in 0..1_000 {
            log.record(Decision::new(
                "Analyst",
                DecisionType::AnalysisFailure,
                format!("skip paper {i}"),
                "parse error",
            ));
        }
        assert_eq!(log.len(), 1_000);
    }

    #[test]
    fn test_iteration_stamping_and_filters() {
        let mut log = DecisionLog::new();
        log.record(Decision::new(
            "Scout",
            DecisionType::PaperSearch,
            "found 4",
            "2 sources",
        ));
        log.set_iteration(1);
        log.record(Decision::new(
            "Coordinator",
            DecisionType::SynthesisCompletion,
            "refine",
            "gaps remain",
        ));

        assert_eq!(log.get(0).unwrap().iteration, 0);
        assert_eq!(log.get(1).unwrap().iteration, 1);
        assert_eq!(log.by_agent("Coordinator").len(), 1);
        assert_eq!(log.of_type(DecisionType::PaperSearch).len(), 1);
    }

    #[test]
    fn test_format_recent() {
        let mut log = DecisionLog::new();
        assert_eq!(log.format_recent(5), "No decisions recorded yet.");

        log.record(
            Decision::new(
                "Coordinator",
                DecisionType::SynthesisCompletion,
                "complete",
                "no gaps remain",
            )
            .dependency(DependencyKind::Heuristic),
        );

        let formatted = log.format_recent(5);
        assert!(formatted.contains("synthesis-completion"));
        assert!(formatted.contains("no gaps remain"));
        assert!(formatted.contains("Dependency: heuristic"));
    }

    #[test]
    fn test_entry_serializes_snake_case() {
        let mut log = DecisionLog::new();
        log.record(Decision::new(
            "Engine",
            DecisionType::StateTransition,
            "searching",
            "query validated",
        ));
        let json = serde_json::to_value(log.get(0).unwrap()).unwrap();
        assert_eq!(json["decision_type"], "state_transition");
        assert_eq!(json["dependency_used"], "none");
    }
}
