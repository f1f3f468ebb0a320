use std::collections::VecDeque;
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use conductor_core::messages::Message;
use conductor_core::provider::{ChatOptions, Provider};
use conductor_core::settings::{CompactionSettings, ConductorSettings};
use conductor_core::stream::collect_chunks;

use crate::compaction::{CompactionEngine, HeuristicSummarizer, LlmSummarizer, Summarizer};
use crate::context::ConversationContext;
use crate::error::EngineError;
use crate::router;
use crate::tokens::{BudgetStatus, ContextUsage, HeuristicEstimator, TokenEstimator, UsageTracker};

/// Stop decisions inside this window count towards the breaker.
pub const STOP_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Stop decisions within [`STOP_WINDOW`] that trip the breaker.
pub const STOP_LIMIT: usize = 3;

/// Where streamed chunks go.
#[derive(Clone, Default)]
pub enum OutputMode {
    #[default]
    Stdout,
    Silent,
    Callback(Arc<dyn Fn(&str) + Send + Sync>),
}

impl OutputMode {
    pub fn callback(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self::Callback(Arc::new(f))
    }

    fn emit(&self, chunk: &str) {
        match self {
            Self::Stdout => {
                let mut out = std::io::stdout().lock();
                if out.write_all(chunk.as_bytes()).and_then(|_| out.flush()).is_err() {
                    debug!("stdout closed, chunk dropped");
                }
            }
            Self::Silent => {}
            Self::Callback(f) => f(chunk),
        }
    }
}

impl fmt::Debug for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("Stdout"),
            Self::Silent => f.write_str("Silent"),
            Self::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContinueDecision {
    pub should_continue: bool,
    pub reason: String,
}

impl ContinueDecision {
    pub fn proceed(reason: impl Into<String>) -> Self {
        Self {
            should_continue: true,
            reason: reason.into(),
        }
    }

    pub fn stop(reason: impl Into<String>) -> Self {
        Self {
            should_continue: false,
            reason: reason.into(),
        }
    }
}

/// Asked once per turn, after the assistant reply is appended.
pub trait ContinuationPolicy: Send + Sync {
    fn decide(&self, context: &ConversationContext) -> ContinueDecision;
}

impl<F> ContinuationPolicy for F
where
    F: Fn(&ConversationContext) -> ContinueDecision + Send + Sync,
{
    fn decide(&self, context: &ConversationContext) -> ContinueDecision {
        self(context)
    }
}

/// Keeps going until an assistant reply contains `marker` (case-insensitive).
/// The turn loop's `max_turns` bound still applies.
#[derive(Clone, Debug)]
pub struct StopOnMarker {
    marker: String,
}

impl StopOnMarker {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into().to_lowercase(),
        }
    }
}

impl ContinuationPolicy for StopOnMarker {
    fn decide(&self, context: &ConversationContext) -> ContinueDecision {
        let done = context
            .last_assistant_message()
            .is_some_and(|reply| reply.to_lowercase().contains(&self.marker));
        if done {
            ContinueDecision::stop(format!("reply contained \"{}\"", self.marker))
        } else {
            ContinueDecision::proceed("no completion marker yet")
        }
    }
}

/// Trips when [`STOP_LIMIT`] stop decisions land inside a rolling
/// [`STOP_WINDOW`]. Guards against agents that oscillate between stopping
/// and being restarted.
#[derive(Clone, Debug)]
pub struct StopBreaker {
    window: Duration,
    limit: usize,
    stops: VecDeque<Instant>,
}

impl Default for StopBreaker {
    fn default() -> Self {
        Self::new(STOP_WINDOW, STOP_LIMIT)
    }
}

impl StopBreaker {
    pub fn new(window: Duration, limit: usize) -> Self {
        Self {
            window,
            limit: limit.max(1),
            stops: VecDeque::new(),
        }
    }

    /// Record a stop decision. Returns true when the breaker trips.
    pub fn record_stop(&mut self) -> bool {
        self.record_stop_at(Instant::now())
    }

    pub fn record_stop_at(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.stops.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                self.stops.pop_front();
            } else {
                break;
            }
        }
        self.stops.push_back(now);
        self.stops.len() >= self.limit
    }

    /// Stops currently inside the window.
    pub fn recent_stops(&self) -> usize {
        self.stops.len()
    }

    pub fn reset(&mut self) {
        self.stops.clear();
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// No continuation policy: exactly one turn.
    SinglePass,
    /// The policy declined to continue.
    Policy(String),
    CircuitBreaker { stops: usize },
    MaxTurns,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SinglePass => f.write_str("single pass"),
            Self::Policy(reason) => write!(f, "stopped: {reason}"),
            Self::CircuitBreaker { stops } => {
                write!(f, "circuit breaker tripped after {stops} stop decisions")
            }
            Self::MaxTurns => f.write_str("max turns reached"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub context: ConversationContext,
    pub turns: u32,
    pub stop: StopReason,
}

impl RunOutcome {
    /// Last assistant message of the run.
    pub fn reply(&self) -> Option<&str> {
        self.context.last_assistant_message()
    }
}

/// Configuration for the runner.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub model: String,
    /// Hard bound on turns per run.
    pub max_turns: u32,
    pub history_max_tokens: u32,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub max_spend_usd: Option<f64>,
    /// Fraction of the context window at which compaction runs.
    pub compaction_threshold: f64,
    pub compaction: CompactionSettings,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from_settings(&ConductorSettings::default())
    }
}

impl RunnerConfig {
    pub fn from_settings(settings: &ConductorSettings) -> Self {
        Self {
            model: settings.default_model.clone(),
            max_turns: settings.runner.max_turns,
            history_max_tokens: settings.runner.history_max_tokens,
            system_prompt: settings.runner.system_prompt.clone(),
            temperature: settings.runner.temperature,
            max_tokens: settings.runner.max_tokens,
            max_spend_usd: settings.budget.max_spend_usd,
            compaction_threshold: settings.budget.compaction_threshold,
            compaction: settings.compaction.clone(),
        }
    }

    fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            ..ChatOptions::for_model(&self.model)
        }
    }
}

struct TurnReply {
    text: String,
    input_tokens: u32,
    skill: Option<String>,
}

/// Drives one conversation at a time. Turns are strictly sequential; the
/// stop breaker and usage tally persist across runs on the same runner.
pub struct Runner {
    provider: Arc<dyn Provider>,
    config: RunnerConfig,
    output: OutputMode,
    estimator: Arc<dyn TokenEstimator>,
    summarizer: Arc<dyn Summarizer>,
    breaker: StopBreaker,
    usage: UsageTracker,
    budget_status: BudgetStatus,
}

impl Runner {
    pub fn new(provider: Arc<dyn Provider>, config: RunnerConfig, output: OutputMode) -> Self {
        let summarizer: Arc<dyn Summarizer> = if config.compaction.use_llm {
            Arc::new(LlmSummarizer::new(Arc::clone(&provider), config.model.clone()))
        } else {
            Arc::new(HeuristicSummarizer)
        };
        Self {
            provider,
            config,
            output,
            estimator: Arc::new(HeuristicEstimator),
            summarizer,
            breaker: StopBreaker::default(),
            usage: UsageTracker::new(),
            budget_status: BudgetStatus::Ok,
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_breaker(mut self, breaker: StopBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn breaker(&self) -> &StopBreaker {
        &self.breaker
    }

    pub async fn run(
        &mut self,
        context: ConversationContext,
        prompt: &str,
        policy: Option<&dyn ContinuationPolicy>,
    ) -> Result<RunOutcome, EngineError> {
        self.run_with_cancel(context, prompt, policy, &CancellationToken::new())
            .await
    }

    /// Run the turn loop for one prompt. Provider errors end the run and
    /// propagate; they are never retried here.
    #[instrument(skip_all, fields(model = %self.config.model, max_turns = self.config.max_turns))]
    pub async fn run_with_cancel(
        &mut self,
        context: ConversationContext,
        prompt: &str,
        policy: Option<&dyn ContinuationPolicy>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let max_turns = self.config.max_turns.max(1);
        let mut ctx = context;
        if let Some(system) = &self.config.system_prompt {
            if !ctx.has_system_message() {
                ctx = ctx.add_message(Message::system(system.clone()));
            }
        }
        ctx = ctx.add_message(Message::user(prompt));

        let mut turns = 0u32;
        let stop = loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            turns += 1;

            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                reply = self.execute_turn(&ctx, turns) => reply?,
            };

            ctx = ctx.add_message(Message::assistant(reply.text.clone()));
            ctx = ctx.update_progress(i64::from(turns) * 100 / i64::from(max_turns));
            self.track_usage(&reply);
            ctx = self.maybe_compact(ctx).await;

            let Some(policy) = policy else {
                break StopReason::SinglePass;
            };

            let decision = policy.decide(&ctx);
            if !decision.should_continue {
                if self.breaker.record_stop() {
                    let stops = self.breaker.recent_stops();
                    warn!(stops, reason = %decision.reason, "stop circuit breaker tripped");
                    break StopReason::CircuitBreaker { stops };
                }
                break StopReason::Policy(decision.reason);
            }
            if turns >= max_turns {
                info!(turns, "max turns reached");
                break StopReason::MaxTurns;
            }
            debug!(turn = turns, reason = %decision.reason, "continuing");
        };

        info!(turns, stop = %stop, "run finished");
        Ok(RunOutcome {
            context: ctx,
            turns,
            stop,
        })
    }

    /// One turn: an auto-invoked skill when the latest user message routes
    /// to one, a plain windowed chat otherwise.
    #[instrument(skip(self, ctx))]
    async fn execute_turn(
        &self,
        ctx: &ConversationContext,
        turn: u32,
    ) -> Result<TurnReply, EngineError> {
        let options = self.config.chat_options();
        let latest = ctx.last_user_message().map(Message::content).unwrap_or("");

        let (request, skill) = match router::best_skill(latest, ctx.skills().iter()) {
            Some(m) if m.auto_invoke() => {
                info!(skill = %m.skill.name, score = m.score, reason = %m.reason, "invoking skill");
                let request = vec![
                    Message::system(m.skill.render_input(latest)),
                    Message::user(latest),
                ];
                (request, Some(m.skill.name.clone()))
            }
            _ => {
                let request = ctx.history_for(
                    self.config.history_max_tokens,
                    self.estimator.as_ref(),
                    &self.config.model,
                );
                (request, None)
            }
        };

        let input_tokens = self
            .estimator
            .estimate_messages_tokens(&request, &self.config.model);
        debug!(messages = request.len(), input_tokens, "sending turn");

        let stream = self.provider.chat(&request, &options).await?;
        let text = collect_chunks(stream, |chunk| self.output.emit(chunk)).await?;

        Ok(TurnReply {
            text,
            input_tokens,
            skill,
        })
    }

    fn track_usage(&mut self, reply: &TurnReply) {
        let output_tokens = self.estimator.estimate_tokens(&reply.text, &self.config.model);
        let entry = self.usage.record(
            u64::from(reply.input_tokens),
            u64::from(output_tokens),
            &self.config.model,
            Some(self.provider.name()),
        );
        debug!(
            input_tokens = entry.input_tokens,
            output_tokens = entry.output_tokens,
            cost = entry.cost,
            skill = reply.skill.as_deref().unwrap_or("-"),
            "turn usage"
        );
        if let Some(status) = self
            .usage
            .check_budget(self.config.max_spend_usd, self.budget_status)
        {
            self.budget_status = status;
        }
    }

    async fn maybe_compact(&self, ctx: ConversationContext) -> ConversationContext {
        let usage = ContextUsage::measure(self.estimator.as_ref(), ctx.messages(), &self.config.model);
        if !usage.needs_compaction(self.config.compaction_threshold) {
            return ctx;
        }
        let engine = CompactionEngine::new(
            Arc::clone(&self.estimator),
            self.config.model.clone(),
            &self.config.compaction,
        );
        let result = engine.compact(ctx.messages(), self.summarizer.as_ref()).await;
        if result.was_compacted() {
            ctx.replace_messages(result.messages)
        } else {
            ctx
        }
    }
}
