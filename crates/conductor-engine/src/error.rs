use std::time::Duration;

use conductor_core::errors::ProviderError;
use conductor_core::ids::TaskId;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task {id} did not finish within {timeout:?}")]
    TaskTimeout { id: TaskId, timeout: Duration },

    #[error("cancelled")]
    Cancelled,
}
