//! Swival agent runtime: the turn loop plus the session-scoped state it
//! carries — knowledge channels, snapshot controller, guardrail, proactive
//! summarization, and the reviewer pipeline.

pub mod channels;
pub mod guardrail;
pub mod proactive;
pub mod reviewer;
pub mod runner;
pub mod session;
pub mod skills;
pub mod snapshot;

pub use channels::KnowledgeChannels;
pub use guardrail::{Guardrail, GuardrailLevel};
pub use runner::{Outcome, RunOutcome, TurnRunner};
pub use session::{RunRecord, Session, SessionConfig};
pub use skills::SkillSet;
pub use snapshot::SnapshotState;
