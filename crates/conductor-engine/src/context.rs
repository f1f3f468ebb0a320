use std::sync::Arc;

use conductor_core::messages::{Message, Role};
use conductor_core::settings::ConductorSettings;

use crate::skills::SkillSet;
use crate::tokens::{HeuristicEstimator, TokenEstimator};

/// One conversation's state as a value. Mutating operations return a new
/// context and leave the receiver untouched; thread the result forward.
#[derive(Clone, Debug)]
pub struct ConversationContext {
    messages: Vec<Message>,
    task_progress: u8,
    last_message: Option<String>,
    skills: Arc<SkillSet>,
    settings: Arc<ConductorSettings>,
}

impl ConversationContext {
    pub fn new(settings: Arc<ConductorSettings>, skills: Arc<SkillSet>) -> Self {
        Self {
            messages: Vec::new(),
            task_progress: 0,
            last_message: None,
            skills,
            settings,
        }
    }

    #[must_use]
    pub fn add_message(&self, message: Message) -> Self {
        let mut next = self.clone();
        next.last_message = Some(message.content().to_string());
        next.messages.push(message);
        next
    }

    /// Set progress, clamped to `0..=100`.
    #[must_use]
    pub fn update_progress(&self, percent: i64) -> Self {
        Self {
            task_progress: percent.clamp(0, 100) as u8,
            ..self.clone()
        }
    }

    /// Replace the whole message log (used after compaction).
    #[must_use]
    pub fn replace_messages(&self, messages: Vec<Message>) -> Self {
        Self {
            last_message: messages.last().map(|m| m.content().to_string()),
            messages,
            ..self.clone()
        }
    }

    /// Windowed history using the default model's estimate.
    pub fn history(&self, max_tokens: u32) -> Vec<Message> {
        self.history_for(max_tokens, &HeuristicEstimator, &self.settings.default_model)
    }

    /// Windowed view of the log: every system message first (original
    /// order), then the newest non-system messages that fit in
    /// `max_tokens`, in conversation order. System messages are kept even
    /// when they alone exceed the budget. The full log is not modified.
    pub fn history_for(
        &self,
        max_tokens: u32,
        estimator: &dyn TokenEstimator,
        model: &str,
    ) -> Vec<Message> {
        let system: Vec<&Message> = self.messages.iter().filter(|m| m.is_system()).collect();
        let mut used: u32 = system
            .iter()
            .map(|m| estimator.estimate_message_tokens(m, model))
            .sum();

        let mut recent = Vec::new();
        for message in self.messages.iter().rev().filter(|m| !m.is_system()) {
            let cost = estimator.estimate_message_tokens(message, model);
            if used.saturating_add(cost) > max_tokens {
                break;
            }
            used += cost;
            recent.push(message);
        }

        system
            .into_iter()
            .chain(recent.into_iter().rev())
            .cloned()
            .collect()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn task_progress(&self) -> u8 {
        self.task_progress
    }

    pub fn last_message(&self) -> Option<&str> {
        self.last_message.as_deref()
    }

    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role() == Role::User)
    }

    pub fn last_assistant_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role() == Role::Assistant)
            .map(Message::content)
    }

    pub fn has_system_message(&self) -> bool {
        self.messages.iter().any(Message::is_system)
    }

    pub fn skills(&self) -> &Arc<SkillSet> {
        &self.skills
    }

    pub fn settings(&self) -> &Arc<ConductorSettings> {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::estimate_message_tokens;

    fn empty() -> ConversationContext {
        ConversationContext::new(
            Arc::new(ConductorSettings::default()),
            Arc::new(SkillSet::new()),
        )
    }

    #[test]
    fn add_message_is_pure() {
        let ctx = empty().add_message(Message::user("one"));
        let next = ctx.add_message(Message::assistant("two"));
        assert_eq!(ctx.messages().len(), 1);
        assert_eq!(next.messages().len(), 2);
        assert_eq!(ctx.last_message(), Some("one"));
        assert_eq!(next.last_message(), Some("two"));
    }

    #[test]
    fn progress_is_clamped() {
        let ctx = empty();
        assert_eq!(ctx.update_progress(-10).task_progress(), 0);
        assert_eq!(ctx.update_progress(150).task_progress(), 100);
        assert_eq!(ctx.update_progress(42).task_progress(), 42);
        assert_eq!(ctx.task_progress(), 0);
    }

    #[test]
    fn history_puts_system_first_regardless_of_position() {
        let ctx = empty()
            .add_message(Message::user("hi"))
            .add_message(Message::assistant("hello"))
            .add_message(Message::system("be terse"));
        let history = ctx.history(10_000);
        assert_eq!(history[0], Message::system("be terse"));
        assert_eq!(history[1], Message::user("hi"));
        assert_eq!(history[2], Message::assistant("hello"));
    }

    #[test]
    fn history_keeps_system_under_tiny_budget() {
        let ctx = empty()
            .add_message(Message::system("a long system prompt that costs tokens"))
            .add_message(Message::user("question"));
        assert_eq!(ctx.history(1), vec![Message::system("a long system prompt that costs tokens")]);
        assert_eq!(ctx.history(0).len(), 1);
    }

    #[test]
    fn history_keeps_newest_that_fit() {
        let model = "gpt-4o";
        let msgs = [
            Message::user("a".repeat(400)),
            Message::assistant("b".repeat(400)),
            Message::user("c".repeat(40)),
            Message::assistant("d".repeat(40)),
        ];
        let ctx = msgs.iter().cloned().fold(empty(), |c, m| c.add_message(m));
        let last_two = estimate_message_tokens(&msgs[2], model) + estimate_message_tokens(&msgs[3], model);

        let history = ctx.history(last_two);
        assert_eq!(history, msgs[2..].to_vec());
        // full log untouched
        assert_eq!(ctx.messages().len(), 4);

        // one token short of the second-newest: only the newest survives
        let history = ctx.history(last_two - 1);
        assert_eq!(history, msgs[3..].to_vec());
    }

    #[test]
    fn history_stops_at_first_message_that_does_not_fit() {
        let ctx = empty()
            .add_message(Message::user("x"))
            .add_message(Message::assistant("y".repeat(4_000)))
            .add_message(Message::user("z"));
        let history = ctx.history(50);
        assert_eq!(history, vec![Message::user("z")]);
    }

    #[test]
    fn replace_messages_updates_last_message() {
        let ctx = empty().add_message(Message::user("old"));
        let replaced = ctx.replace_messages(vec![Message::system("summary"), Message::user("new")]);
        assert_eq!(replaced.last_message(), Some("new"));
        assert_eq!(replaced.messages().len(), 2);
        assert_eq!(ctx.messages().len(), 1);
    }

    #[test]
    fn last_role_lookups() {
        let ctx = empty()
            .add_message(Message::user("q1"))
            .add_message(Message::assistant("a1"))
            .add_message(Message::user("q2"));
        assert_eq!(ctx.last_user_message().map(Message::content), Some("q2"));
        assert_eq!(ctx.last_assistant_message(), Some("a1"));
        assert!(!ctx.has_system_message());
    }
}
