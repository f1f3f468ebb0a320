pub mod compaction;
pub mod context;
pub mod error;
pub mod router;
pub mod runner;
pub mod skills;
pub mod subagent;
pub mod tokens;

pub use context::ConversationContext;
pub use error::EngineError;
pub use runner::{
    ContinuationPolicy, ContinueDecision, OutputMode, RunOutcome, Runner, RunnerConfig,
    StopOnMarker, StopReason,
};
pub use skills::{Skill, SkillSet};
pub use subagent::{SubagentPool, SubagentTask, TaskStatus};
