use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conductor_core::ids::TaskId;
use conductor_core::provider::Provider;
use conductor_core::settings::ConductorSettings;

use crate::context::ConversationContext;
use crate::error::EngineError;
use crate::runner::{OutputMode, Runner, RunnerConfig};
use crate::skills::SkillSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Snapshot of one background task.
#[derive(Clone, Debug, Serialize)]
pub struct SubagentTask {
    pub id: TaskId,
    pub prompt: String,
    pub model: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct SubagentConfig {
    /// Tasks allowed in `Running` at once. Never below 1.
    pub max_concurrent: usize,
    pub max_turns: u32,
    pub default_model: String,
    /// How often `wait_for` re-checks a task.
    pub poll_interval: Duration,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self::from_settings(&ConductorSettings::default())
    }
}

impl SubagentConfig {
    pub fn from_settings(settings: &ConductorSettings) -> Self {
        Self {
            max_concurrent: settings.subagents.max_concurrent.max(1),
            max_turns: settings.subagents.max_turns,
            default_model: settings.subagent_model().to_string(),
            poll_interval: Duration::from_millis(settings.subagents.poll_interval_ms.max(1)),
        }
    }
}

struct TaskEntry {
    task: SubagentTask,
    cancel: CancellationToken,
}

#[derive(Default)]
struct PoolState {
    tasks: HashMap<TaskId, TaskEntry>,
    /// Creation order, for listing.
    order: Vec<TaskId>,
    pending: VecDeque<TaskId>,
    running: HashSet<TaskId>,
}

struct PoolInner {
    state: Mutex<PoolState>,
    provider: Arc<dyn Provider>,
    settings: Arc<ConductorSettings>,
    skills: Arc<SkillSet>,
    config: SubagentConfig,
    shutdown: CancellationToken,
}

/// A task ready to start, taken out of the lock.
struct Launch {
    id: TaskId,
    prompt: String,
    model: String,
    cancel: CancellationToken,
}

/// Bounded pool of background conversations. At most `max_concurrent`
/// tasks run; the rest wait FIFO and are promoted as running tasks finish.
/// Cloning shares the pool.
#[derive(Clone)]
pub struct SubagentPool {
    inner: Arc<PoolInner>,
}

impl SubagentPool {
    pub fn new(
        provider: Arc<dyn Provider>,
        settings: Arc<ConductorSettings>,
        skills: Arc<SkillSet>,
    ) -> Self {
        let config = SubagentConfig::from_settings(&settings);
        Self::with_config(provider, settings, skills, config)
    }

    pub fn with_config(
        provider: Arc<dyn Provider>,
        settings: Arc<ConductorSettings>,
        skills: Arc<SkillSet>,
        mut config: SubagentConfig,
    ) -> Self {
        config.max_concurrent = config.max_concurrent.max(1);
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                provider,
                settings,
                skills,
                config,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &SubagentConfig {
        &self.inner.config
    }

    /// Queue a prompt. The task starts immediately when a slot is free and
    /// is `Running` by the time this returns; otherwise it is `Pending`.
    /// Must be called inside a Tokio runtime.
    pub fn spawn(&self, prompt: impl Into<String>, model: Option<&str>) -> TaskId {
        let id = TaskId::new();
        let prompt = prompt.into();
        let model = model
            .map(str::to_string)
            .unwrap_or_else(|| self.inner.config.default_model.clone());
        let cancel = self.inner.shutdown.child_token();

        let launch = {
            let mut state = self.inner.state.lock();
            let start = state.running.len() < self.inner.config.max_concurrent;
            let status = if start {
                TaskStatus::Running
            } else {
                TaskStatus::Pending
            };
            state.tasks.insert(
                id.clone(),
                TaskEntry {
                    task: SubagentTask {
                        id: id.clone(),
                        prompt: prompt.clone(),
                        model: model.clone(),
                        status,
                        result: None,
                        error: None,
                        created_at: Utc::now(),
                        finished_at: None,
                    },
                    cancel: cancel.clone(),
                },
            );
            state.order.push(id.clone());
            if start {
                state.running.insert(id.clone());
                Some(Launch {
                    id: id.clone(),
                    prompt,
                    model,
                    cancel,
                })
            } else {
                state.pending.push_back(id.clone());
                None
            }
        };

        match launch {
            Some(launch) => {
                info!(task = %id, "subagent started");
                self.launch(launch);
            }
            None => debug!(task = %id, "subagent queued"),
        }
        id
    }

    fn launch(&self, launch: Launch) {
        let pool = self.clone();
        tokio::spawn(async move {
            let Launch {
                id,
                prompt,
                model,
                cancel,
            } = launch;
            let result = pool.run_task(&prompt, &model, &cancel).await;
            pool.finish(&id, result);
        });
    }

    async fn run_task(
        &self,
        prompt: &str,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let config = RunnerConfig {
            model: model.to_string(),
            max_turns: self.inner.config.max_turns,
            ..RunnerConfig::from_settings(&self.inner.settings)
        };
        let mut runner = Runner::new(Arc::clone(&self.inner.provider), config, OutputMode::Silent);
        let context = ConversationContext::new(
            Arc::clone(&self.inner.settings),
            Arc::clone(&self.inner.skills),
        );
        let outcome = runner.run_with_cancel(context, prompt, None, cancel).await?;
        Ok(outcome.reply().unwrap_or_default().to_string())
    }

    /// Record the outcome and promote queued tasks into the freed slot. Both
    /// happen under one lock so `running` never exceeds the limit.
    fn finish(&self, id: &TaskId, result: Result<String, EngineError>) {
        let launches = {
            let mut state = self.inner.state.lock();
            state.running.remove(id);
            if let Some(entry) = state.tasks.get_mut(id) {
                let task = &mut entry.task;
                task.finished_at = Some(Utc::now());
                match result {
                    Ok(text) => {
                        info!(task = %id, "subagent completed");
                        task.status = TaskStatus::Completed;
                        task.result = Some(text);
                    }
                    Err(e) => {
                        warn!(task = %id, error = %e, "subagent failed");
                        task.status = TaskStatus::Failed;
                        task.error = Some(e.to_string());
                    }
                }
            }
            self.promote(&mut state)
        };
        for launch in launches {
            debug!(task = %launch.id, "subagent promoted");
            self.launch(launch);
        }
    }

    fn promote(&self, state: &mut PoolState) -> Vec<Launch> {
        let mut launches = Vec::new();
        while state.running.len() < self.inner.config.max_concurrent {
            let Some(id) = state.pending.pop_front() else {
                break;
            };
            let Some(entry) = state.tasks.get_mut(&id) else {
                continue;
            };
            if entry.task.status != TaskStatus::Pending {
                continue;
            }
            entry.task.status = TaskStatus::Running;
            launches.push(Launch {
                id: id.clone(),
                prompt: entry.task.prompt.clone(),
                model: entry.task.model.clone(),
                cancel: entry.cancel.clone(),
            });
            state.running.insert(id);
        }
        launches
    }

    pub fn get_task(&self, id: &TaskId) -> Option<SubagentTask> {
        self.inner
            .state
            .lock()
            .tasks
            .get(id)
            .map(|e| e.task.clone())
    }

    /// Every task, oldest first.
    pub fn tasks(&self) -> Vec<SubagentTask> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .map(|e| e.task.clone())
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.inner.state.lock().running.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Poll until the task is terminal. The task keeps running after a
    /// timeout.
    pub async fn wait_for(
        &self,
        id: &TaskId,
        timeout: Duration,
    ) -> Result<SubagentTask, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            let task = self
                .get_task(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.clone()))?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::TaskTimeout {
                    id: id.clone(),
                    timeout,
                });
            }
            tokio::time::sleep(self.inner.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Cancel a task. A pending task fails immediately; a running one fails
    /// once its turn unwinds. Returns false when the task already finished.
    pub fn cancel(&self, id: &TaskId) -> Result<bool, EngineError> {
        let mut state = self.inner.state.lock();
        let entry = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.clone()))?;
        match entry.task.status {
            TaskStatus::Completed | TaskStatus::Failed => Ok(false),
            TaskStatus::Running => {
                entry.cancel.cancel();
                info!(task = %id, "cancelling running subagent");
                Ok(true)
            }
            TaskStatus::Pending => {
                entry.cancel.cancel();
                fail_cancelled(&mut entry.task);
                state.pending.retain(|p| p != id);
                info!(task = %id, "cancelled queued subagent");
                Ok(true)
            }
        }
    }

    /// Cancel everything. Queued tasks fail at once; running tasks fail as
    /// they observe the cancellation.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut state = self.inner.state.lock();
        let queued: Vec<TaskId> = state.pending.drain(..).collect();
        for id in &queued {
            if let Some(entry) = state.tasks.get_mut(id) {
                fail_cancelled(&mut entry.task);
            }
        }
        info!(
            queued = queued.len(),
            running = state.running.len(),
            "subagent pool shut down"
        );
    }
}

fn fail_cancelled(task: &mut SubagentTask) {
    task.status = TaskStatus::Failed;
    task.error = Some(EngineError::Cancelled.to_string());
    task.finished_at = Some(Utc::now());
}
