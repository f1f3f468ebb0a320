use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const TASK_PREFIX: &str = "task";

/// Identifier handed out for each background task. UUIDv7 under a `task_`
/// prefix, so ids sort by creation time.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new() -> Self {
        Self(format!("{TASK_PREFIX}_{}", Uuid::now_v7()))
    }

    /// Wrap an id received from elsewhere without validating it.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
