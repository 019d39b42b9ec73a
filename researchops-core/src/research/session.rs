//! Run state machine.
//!
//! Tracks the phase of one research run and rejects transitions outside the
//! pipeline graph. Every accepted transition is recorded in the run's
//! decision log.

use crate::decision_log::{Decision, DecisionLog, DecisionType};
use crate::error::AgentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current phase of a research run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Checking the query.
    Validating,
    /// Collecting papers from the sources.
    Searching,
    /// Extracting structured findings from papers.
    Analyzing,
    /// Clustering findings and producing the synthesis.
    Synthesizing,
    /// Preparing another analysis/synthesis pass.
    Refining,
    Complete,
    Failed,
}

impl RunPhase {
    /// Whether the pipeline graph has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (Complete | Failed, _) => false,
            (_, Failed) => true,
            (Validating, Searching)
            | (Searching, Analyzing)
            | (Analyzing, Synthesizing)
            | (Synthesizing, Refining)
            | (Synthesizing, Complete)
            | (Refining, Analyzing)
            | (Refining, Synthesizing) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Complete | RunPhase::Failed)
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunPhase::Validating => "validating",
            RunPhase::Searching => "searching",
            RunPhase::Analyzing => "analyzing",
            RunPhase::Synthesizing => "synthesizing",
            RunPhase::Refining => "refining",
            RunPhase::Complete => "complete",
            RunPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One research run.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchRun {
    pub id: Uuid,
    pub query: String,
    pub phase: RunPhase,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Error message if failed.
    pub error: Option<String>,
}

impl ResearchRun {
    /// Agent name stamped on transition entries.
    pub const AGENT: &'static str = "ResearchOpsAgent";

    pub fn new(query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            query: query.into(),
            phase: RunPhase::Validating,
            started_at: now,
            updated_at: now,
            error: None,
        }
    }

    /// Move to `next`, recording the transition and why it happened.
    pub fn transition(
        &mut self,
        next: RunPhase,
        reasoning: impl Into<String>,
        log: &mut DecisionLog,
    ) -> Result<(), AgentError> {
        if !self.phase.can_transition_to(next) {
            return Err(AgentError::InvalidStateTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }

        log.record(
            Decision::new(
                Self::AGENT,
                DecisionType::StateTransition,
                format!("{} -> {}", self.phase, next),
                reasoning,
            )
            .meta("run_id", self.id.to_string())
            .meta("from", self.phase.to_string())
            .meta("to", next.to_string()),
        );
        self.phase = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark the run as failed. A run that already ended is left untouched.
    pub fn fail(&mut self, error: impl Into<String>, log: &mut DecisionLog) {
        let error = error.into();
        if self.transition(RunPhase::Failed, error.clone(), log).is_ok() {
            self.error = Some(error);
        }
    }
}
