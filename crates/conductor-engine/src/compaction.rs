//! Conversation compaction.
//!
//! Older turns are folded into one synthetic system message while the
//! system prompt and the most recent turns are kept verbatim.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use conductor_core::messages::{Message, Role};
use conductor_core::provider::{ChatOptions, Provider};
use conductor_core::settings::CompactionSettings;
use conductor_core::stream::collect_chunks;

use crate::tokens::TokenEstimator;

pub const SUMMARY_HEADER: &str = "Summary of earlier conversation:";

const MAX_ENTRIES: usize = 5;
const MAX_CLAUSE_CHARS: usize = 100;
const MAX_LABEL_CHARS: usize = 40;

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> String;
}

/// Local, LLM-free summary: the first clause of each user message plus
/// bullet or `Label:` lines from assistant messages, deduplicated and capped
/// at five per category.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicSummarizer;

impl HeuristicSummarizer {
    pub fn summarize_sync(&self, messages: &[Message]) -> String {
        let mut requests: Vec<String> = Vec::new();
        let mut points: Vec<String> = Vec::new();

        for message in messages {
            match message.role() {
                Role::User => {
                    if let Some(clause) = first_clause(message.content()) {
                        push_unique(&mut requests, clause);
                    }
                }
                Role::Assistant => {
                    for line in message.content().lines().filter_map(key_point) {
                        push_unique(&mut points, line);
                    }
                }
                Role::System => {
                    if let Some(body) = message.content().strip_prefix(SUMMARY_HEADER) {
                        carry_forward(body, &mut requests, &mut points);
                    }
                }
            }
        }

        if requests.is_empty() && points.is_empty() {
            return format!("{} earlier messages omitted.", messages.len());
        }

        let mut out = String::new();
        if !requests.is_empty() {
            out.push_str("User requests:\n");
            for r in &requests {
                out.push_str(&format!("- {r}\n"));
            }
        }
        if !points.is_empty() {
            out.push_str("Key points:\n");
            for p in &points {
                out.push_str(&format!("- {p}\n"));
            }
        }
        out.trim_end().to_string()
    }
}

#[async_trait]
impl Summarizer for HeuristicSummarizer {
    async fn summarize(&self, messages: &[Message]) -> String {
        self.summarize_sync(messages)
    }
}

/// True for the synthetic message a previous compaction produced.
pub fn is_summary(message: &Message) -> bool {
    message.is_system() && message.content().starts_with(SUMMARY_HEADER)
}

/// Re-read an earlier summary's entries so they survive the next fold.
/// Free-form text (an LLM summary) is kept as key points.
fn carry_forward(body: &str, requests: &mut Vec<String>, points: &mut Vec<String>) {
    let mut in_requests = false;
    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match line {
            "User requests:" => in_requests = true,
            "Key points:" => in_requests = false,
            _ => {
                let item = line.strip_prefix("- ").unwrap_or(line);
                let item = truncate_chars(item, MAX_CLAUSE_CHARS);
                if in_requests {
                    push_unique(requests, item);
                } else {
                    push_unique(points, item);
                }
            }
        }
    }
}

fn push_unique(list: &mut Vec<String>, item: String) {
    if list.len() < MAX_ENTRIES && !list.contains(&item) {
        list.push(item);
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", text[..idx].trim_end()),
        None => text.to_string(),
    }
}

fn first_clause(text: &str) -> Option<String> {
    let clause = text
        .split(['.', '?', '!', '\n', ';'])
        .map(str::trim)
        .find(|c| !c.is_empty())?;
    Some(truncate_chars(clause, MAX_CLAUSE_CHARS))
}

fn key_point(line: &str) -> Option<String> {
    let line = line.trim();
    for bullet in ["- ", "* ", "• "] {
        if let Some(rest) = line.strip_prefix(bullet) {
            let rest = rest.trim();
            return (!rest.is_empty()).then(|| truncate_chars(rest, MAX_CLAUSE_CHARS));
        }
    }
    let (label, value) = line.split_once(':')?;
    let label_len = label.chars().count();
    if label_len == 0 || label_len > MAX_LABEL_CHARS || value.trim().is_empty() {
        return None;
    }
    Some(truncate_chars(line, MAX_CLAUSE_CHARS))
}

/// Asks the provider for a short summary; any failure (or an empty reply)
/// falls back to [`HeuristicSummarizer`].
pub struct LlmSummarizer {
    provider: Arc<dyn Provider>,
    options: ChatOptions,
}

impl LlmSummarizer {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            options: ChatOptions {
                temperature: Some(0.2),
                ..ChatOptions::for_model(model)
            },
        }
    }

    fn request(messages: &[Message]) -> Vec<Message> {
        let transcript: String = messages
            .iter()
            .map(|m| format!("{}: {}\n", m.role(), m.content()))
            .collect();
        vec![
            Message::system(
                "Summarize the conversation below in at most 200 words. Keep decisions, \
                 open questions and facts needed to continue the work. Reply with the summary only.",
            ),
            Message::user(transcript),
        ]
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, messages: &[Message]) -> String {
        let request = Self::request(messages);
        let reply = match self.provider.chat(&request, &self.options).await {
            Ok(stream) => collect_chunks(stream, |_| {}).await,
            Err(e) => Err(e),
        };
        match reply {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                warn!("summarizer returned empty text, using heuristic summary");
                HeuristicSummarizer.summarize_sync(messages)
            }
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "summarizer failed, using heuristic summary");
                HeuristicSummarizer.summarize_sync(messages)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompactionResult {
    pub messages: Vec<Message>,
    pub original_tokens: u32,
    pub compacted_tokens: u32,
    /// Number of messages folded into the summary.
    pub summarized: usize,
}

impl CompactionResult {
    fn unchanged(messages: &[Message], tokens: u32) -> Self {
        Self {
            messages: messages.to_vec(),
            original_tokens: tokens,
            compacted_tokens: tokens,
            summarized: 0,
        }
    }

    pub fn saved_tokens(&self) -> u32 {
        self.original_tokens.saturating_sub(self.compacted_tokens)
    }

    pub fn saved_percent(&self) -> f64 {
        if self.original_tokens == 0 {
            return 0.0;
        }
        self.saved_tokens() as f64 / self.original_tokens as f64 * 100.0
    }

    pub fn was_compacted(&self) -> bool {
        self.summarized > 0
    }
}

pub struct CompactionEngine {
    estimator: Arc<dyn TokenEstimator>,
    model: String,
    keep_recent: usize,
    target_ratio: f64,
}

impl CompactionEngine {
    pub fn new(
        estimator: Arc<dyn TokenEstimator>,
        model: impl Into<String>,
        settings: &CompactionSettings,
    ) -> Self {
        Self {
            estimator,
            model: model.into(),
            keep_recent: settings.keep_recent,
            target_ratio: settings.target_ratio,
        }
    }

    /// Default budget: `target_ratio` of the model's context window.
    pub fn target_tokens(&self) -> u32 {
        (self.estimator.context_limit(&self.model) as f64 * self.target_ratio) as u32
    }

    pub async fn compact(&self, messages: &[Message], summarizer: &dyn Summarizer) -> CompactionResult {
        self.compact_to(messages, self.target_tokens(), summarizer).await
    }

    /// No-op when already within `target_tokens` or when there is nothing
    /// older than the `keep_recent` window. A summary left by an earlier
    /// compaction is folded into the new one, so the result never holds
    /// more than one.
    pub async fn compact_to(
        &self,
        messages: &[Message],
        target_tokens: u32,
        summarizer: &dyn Summarizer,
    ) -> CompactionResult {
        let original = self.estimator.estimate_messages_tokens(messages, &self.model);
        if original <= target_tokens {
            return CompactionResult::unchanged(messages, original);
        }

        // an earlier summary is old content, not part of the pinned prompt
        let (system, rest): (Vec<&Message>, Vec<&Message>) = messages
            .iter()
            .partition(|m| m.is_system() && !is_summary(m));
        if rest.len() <= self.keep_recent {
            return CompactionResult::unchanged(messages, original);
        }

        let split = rest.len() - self.keep_recent;
        let old: Vec<Message> = rest[..split].iter().map(|m| (*m).clone()).collect();
        let summary = summarizer.summarize(&old).await;

        let compacted: Vec<Message> = system
            .into_iter()
            .cloned()
            .chain(std::iter::once(Message::system(format!(
                "{SUMMARY_HEADER}\n{summary}"
            ))))
            .chain(rest[split..].iter().map(|m| (*m).clone()))
            .collect();
        let compacted_tokens = self.estimator.estimate_messages_tokens(&compacted, &self.model);

        let result = CompactionResult {
            messages: compacted,
            original_tokens: original,
            compacted_tokens,
            summarized: old.len(),
        };
        info!(
            summarized = result.summarized,
            original_tokens = original,
            compacted_tokens,
            saved_percent = result.saved_percent(),
            "conversation compacted"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::HeuristicEstimator;
    use conductor_core::errors::ProviderError;
    use conductor_llm::mock::{MockProvider, MockResponse};

    fn engine(keep_recent: usize) -> CompactionEngine {
        CompactionEngine::new(
            Arc::new(HeuristicEstimator),
            "gpt-4",
            &CompactionSettings {
                keep_recent,
                ..Default::default()
            },
        )
    }

    fn long_conversation() -> Vec<Message> {
        let mut messages = vec![Message::system("You are helpful.")];
        for i in 0..6 {
            messages.push(Message::user(format!(
                "Please fix bug {i} in the parser. It crashes on empty input {}",
                "x".repeat(500)
            )));
            messages.push(Message::assistant(format!(
                "Done.\n- Fixed bug {i}\nRoot cause: missing bounds check\n{}",
                "y".repeat(500)
            )));
        }
        messages
    }

    #[test]
    fn heuristic_summary_extracts_requests_and_points() {
        let summary = HeuristicSummarizer.summarize_sync(&[
            Message::user("Add retries to the client. Also log failures"),
            Message::assistant("Sure.\n- Added backoff\n* Logged at warn\nNote: jitter is 20%\nplain prose line"),
            Message::user("Add retries to the client! Again"),
        ]);
        assert_eq!(
            summary,
            "User requests:\n- Add retries to the client\nKey points:\n- Added backoff\n- Logged at warn\n- Note: jitter is 20%"
        );
    }

    #[test]
    fn heuristic_summary_caps_each_category() {
        let messages: Vec<Message> = (0..8).map(|i| Message::user(format!("request {i}"))).collect();
        let summary = HeuristicSummarizer.summarize_sync(&messages);
        assert_eq!(summary.lines().filter(|l| l.starts_with("- ")).count(), 5);
    }

    #[test]
    fn long_label_is_not_a_key_point() {
        let label = "a".repeat(41);
        assert!(key_point(&format!("{label}: value")).is_none());
        assert!(key_point("Status:").is_none());
        assert_eq!(key_point("• shipped"), Some("shipped".into()));
    }

    #[test]
    fn first_clause_truncates() {
        let long = "w".repeat(150);
        let clause = first_clause(&long).unwrap();
        assert_eq!(clause.chars().count(), 103);
        assert!(clause.ends_with("..."));
        assert_eq!(first_clause("  ;; hi there; more"), Some("hi there".into()));
        assert_eq!(first_clause("..."), None);
    }

    #[tokio::test]
    async fn under_target_is_noop() {
        let messages = vec![Message::system("s"), Message::user("hi")];
        let result = engine(4).compact(&messages, &HeuristicSummarizer).await;
        assert_eq!(result.messages, messages);
        assert_eq!(result.saved_tokens(), 0);
        assert_eq!(result.saved_percent(), 0.0);
        assert!(!result.was_compacted());
    }

    #[tokio::test]
    async fn compacts_old_messages_into_summary() {
        let messages = long_conversation();
        let result = engine(4).compact_to(&messages, 500, &HeuristicSummarizer).await;

        assert!(result.was_compacted());
        assert_eq!(result.summarized, 8);
        // system + summary + 4 recent
        assert_eq!(result.messages.len(), 6);
        assert_eq!(result.messages[0], Message::system("You are helpful."));
        assert!(result.messages[1].is_system());
        assert!(result.messages[1].content().starts_with(SUMMARY_HEADER));
        assert!(result.messages[1].content().contains("Please fix bug 0 in the parser"));
        assert_eq!(&result.messages[2..], &messages[9..]);
        assert!(result.saved_tokens() > 0);
        let expected = result.saved_tokens() as f64 / result.original_tokens as f64 * 100.0;
        assert!((result.saved_percent() - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn compacting_twice_under_target_is_stable() {
        let e = engine(4);
        let first = e.compact_to(&long_conversation(), 500, &HeuristicSummarizer).await;
        let target = first.compacted_tokens;
        let second = e.compact_to(&first.messages, target, &HeuristicSummarizer).await;
        assert_eq!(second.messages, first.messages);
        assert_eq!(second.saved_tokens(), 0);
    }

    #[tokio::test]
    async fn repeated_compaction_keeps_single_summary() {
        let e = engine(2);
        let mut messages = vec![Message::system("You are helpful.")];
        for round in 0..3 {
            for i in 0..3 {
                messages.push(Message::user(format!("Round {round} task {i}. {}", "x".repeat(400))));
                messages.push(Message::assistant(format!("- finished {round}-{i}\n{}", "y".repeat(400))));
            }
            let result = e.compact_to(&messages, 300, &HeuristicSummarizer).await;
            assert!(result.was_compacted());
            messages = result.messages;
        }

        let summaries: Vec<&Message> = messages.iter().filter(|m| is_summary(m)).collect();
        assert_eq!(summaries.len(), 1);
        // system + summary + 2 recent
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], Message::system("You are helpful."));
        assert!(is_summary(&messages[1]));
        // first-round request carried through the intermediate summaries
        assert!(summaries[0].content().contains("Round 0 task 0"));
        assert!(summaries[0].content().contains("finished 0-0"));
    }

    #[test]
    fn earlier_summary_entries_are_carried_forward() {
        let previous = Message::system(format!(
            "{SUMMARY_HEADER}\nUser requests:\n- Add caching\nKey points:\n- Cache is LRU"
        ));
        let summary = HeuristicSummarizer.summarize_sync(&[
            previous,
            Message::user("Now add metrics"),
            Message::assistant("- Added counters"),
        ]);
        assert_eq!(
            summary,
            "User requests:\n- Add caching\n- Now add metrics\nKey points:\n- Cache is LRU\n- Added counters"
        );

        let prose = Message::system(format!("{SUMMARY_HEADER}\nWe agreed on an LRU cache."));
        assert_eq!(
            HeuristicSummarizer.summarize_sync(&[prose]),
            "Key points:\n- We agreed on an LRU cache."
        );
    }

    #[tokio::test]
    async fn nothing_older_than_keep_recent() {
        let messages = long_conversation();
        let result = engine(20).compact_to(&messages, 10, &HeuristicSummarizer).await;
        assert_eq!(result.messages, messages);
        assert!(!result.was_compacted());
    }

    #[tokio::test]
    async fn llm_summarizer_uses_provider_reply() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text("Fixed six parser bugs.")]));
        let summarizer = LlmSummarizer::new(provider.clone(), "gpt-4o");
        let result = engine(4).compact_to(&long_conversation(), 500, &summarizer).await;

        assert_eq!(
            result.messages[1].content(),
            format!("{SUMMARY_HEADER}\nFixed six parser bugs.")
        );
        let request = &provider.requests()[0];
        assert!(request.messages[0].content().contains("200 words"));
        assert!(request.messages[1].content().starts_with("user: Please fix bug 0"));
    }

    #[tokio::test]
    async fn llm_summarizer_falls_back_on_error() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::Error(
            ProviderError::Overloaded,
        )]));
        let summarizer = LlmSummarizer::new(provider, "gpt-4o");
        let old = vec![Message::user("Rename the module")];
        assert_eq!(
            summarizer.summarize(&old).await,
            HeuristicSummarizer.summarize_sync(&old)
        );
    }

    #[tokio::test]
    async fn llm_summarizer_falls_back_on_empty_reply() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text("   ")]));
        let summarizer = LlmSummarizer::new(provider, "gpt-4o");
        let old = vec![Message::user("Rename the module")];
        assert!(summarizer.summarize(&old).await.contains("Rename the module"));
    }
}
