//! Multi-agent research pipeline.
//!
//! A run moves through four cooperating agents:
//! 1. **Scout**: collects and deduplicates papers from every source
//! 2. **Analyst**: extracts structured findings per paper
//! 3. **Synthesizer**: clusters findings and writes the synthesis
//! 4. **Coordinator**: judges coverage, search expansion and completion
//!
//! [`ResearchOpsAgent`] drives them through the [`RunPhase`] state machine.

pub mod analyst;
pub mod coordinator;
pub mod engine;
pub mod scout;
pub mod session;
pub mod synthesizer;

pub use analyst::Analyst;
pub use coordinator::{Coordinator, Verdict, parse_verdict};
pub use engine::ResearchOpsAgent;
pub use scout::Scout;
pub use session::{ResearchRun, RunPhase};
pub use synthesizer::Synthesizer;
