//! Token and cost estimation.
//!
//! Counts are a character-based heuristic, not a tokenizer: expect them to
//! be off by 10-20% against a real model. They are good enough for
//! windowing, compaction triggers and budget warnings, never for billing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use conductor_core::messages::Message;
use conductor_llm::pricing::{self, CostBreakdown};

/// Fixed cost of a message's role and framing.
pub const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Pluggable estimation strategy.
pub trait TokenEstimator: Send + Sync {
    fn estimate_tokens(&self, text: &str, model: &str) -> u32;

    fn estimate_message_tokens(&self, message: &Message, model: &str) -> u32 {
        MESSAGE_OVERHEAD_TOKENS + self.estimate_tokens(message.content(), model)
    }

    fn estimate_messages_tokens(&self, messages: &[Message], model: &str) -> u32 {
        messages
            .iter()
            .map(|m| self.estimate_message_tokens(m, model))
            .sum()
    }

    fn context_limit(&self, model: &str) -> u32 {
        pricing::context_limit(model)
    }
}

/// `ceil(chars / ratio)` plus 10% for special tokens and formatting.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicEstimator;

impl HeuristicEstimator {
    /// Characters per token for a model family.
    pub fn chars_per_token(model: &str) -> f64 {
        let model = model.to_lowercase();
        if model.contains("claude") {
            3.5
        } else if ["llama", "mistral", "mixtral", "qwen"]
            .iter()
            .any(|f| model.contains(f))
        {
            3.8
        } else {
            4.0
        }
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate_tokens(&self, text: &str, model: &str) -> u32 {
        let chars = text.chars().count();
        if chars == 0 {
            return 0;
        }
        let base = (chars as f64 / Self::chars_per_token(model)).ceil() as u32;
        (base * 11).div_ceil(10)
    }
}

pub fn estimate_tokens(text: &str, model: &str) -> u32 {
    HeuristicEstimator.estimate_tokens(text, model)
}

pub fn estimate_message_tokens(message: &Message, model: &str) -> u32 {
    HeuristicEstimator.estimate_message_tokens(message, model)
}

/// How full a model's context window is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ContextUsage {
    pub used: u32,
    pub limit: u32,
}

impl ContextUsage {
    pub fn measure(estimator: &dyn TokenEstimator, messages: &[Message], model: &str) -> Self {
        Self {
            used: estimator.estimate_messages_tokens(messages, model),
            limit: estimator.context_limit(model),
        }
    }

    pub fn ratio(&self) -> f64 {
        if self.limit == 0 {
            return 1.0;
        }
        self.used as f64 / self.limit as f64
    }

    pub fn needs_compaction(&self, threshold: f64) -> bool {
        self.ratio() >= threshold
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CostEntry {
    pub timestamp: DateTime<Utc>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub model: String,
    pub is_local: bool,
}

/// Spend relative to a configured maximum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum BudgetStatus {
    Ok,       // < 70%
    Warning,  // 70-90%
    Critical, // 90-100%
    Exceeded, // >= 100%
}

impl BudgetStatus {
    pub fn from_spend(spent: f64, max_spend: f64) -> Self {
        if max_spend <= 0.0 {
            return if spent > 0.0 { Self::Exceeded } else { Self::Ok };
        }
        let ratio = spent / max_spend;
        if ratio >= 1.0 {
            Self::Exceeded
        } else if ratio >= 0.9 {
            Self::Critical
        } else if ratio >= 0.7 {
            Self::Warning
        } else {
            Self::Ok
        }
    }
}

/// Per-session running tally. Append-only until [`UsageTracker::reset`].
#[derive(Clone, Debug, Default)]
pub struct UsageTracker {
    entries: Vec<CostEntry>,
    input_tokens: u64,
    output_tokens: u64,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        input_tokens: u64,
        output_tokens: u64,
        model: &str,
        provider: Option<&str>,
    ) -> &CostEntry {
        let CostBreakdown {
            total, is_local, ..
        } = pricing::calculate_cost(input_tokens, output_tokens, model, provider);
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.entries.push(CostEntry {
            timestamp: Utc::now(),
            input_tokens,
            output_tokens,
            cost: total,
            model: model.to_string(),
            is_local,
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[CostEntry] {
        &self.entries
    }

    pub fn total_input_tokens(&self) -> u64 {
        self.input_tokens
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.output_tokens
    }

    pub fn total_cost(&self) -> f64 {
        self.entries.iter().map(|e| e.cost).sum()
    }

    /// No configured maximum means no budget pressure.
    pub fn budget_status(&self, max_spend: Option<f64>) -> BudgetStatus {
        match max_spend {
            Some(max) => BudgetStatus::from_spend(self.total_cost(), max),
            None => BudgetStatus::Ok,
        }
    }

    /// Returns the new status when it is worse than `previous`, logging it.
    pub fn check_budget(&self, max_spend: Option<f64>, previous: BudgetStatus) -> Option<BudgetStatus> {
        let status = self.budget_status(max_spend);
        if status <= previous {
            return None;
        }
        if status != BudgetStatus::Ok {
            warn!(
                ?status,
                spent = %pricing::format_cost(self.total_cost()),
                max = %pricing::format_cost(max_spend.unwrap_or_default()),
                "budget threshold crossed"
            );
        }
        Some(status)
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.input_tokens = 0;
        self.output_tokens = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(estimate_tokens("", "gpt-4o"), 0);
    }

    #[test]
    fn default_ratio_with_overhead() {
        // 400 chars / 4 = 100, +10% = 110
        assert_eq!(estimate_tokens(&"a".repeat(400), "gpt-4o"), 110);
        // 11 chars / 4 = 2.75 -> 3, +10% = 3.3 -> 4
        assert_eq!(estimate_tokens("hello world", "gpt-4o"), 4);
    }

    #[test]
    fn family_ratios() {
        assert_eq!(HeuristicEstimator::chars_per_token("claude-3-5-sonnet"), 3.5);
        assert_eq!(HeuristicEstimator::chars_per_token("llama3.3:70b"), 3.8);
        assert_eq!(HeuristicEstimator::chars_per_token("gpt-4o"), 4.0);
        // 350 chars / 3.5 = 100, +10% = 110
        assert_eq!(estimate_tokens(&"a".repeat(350), "claude-3-5-sonnet"), 110);
    }

    #[test]
    fn counts_chars_not_bytes() {
        assert_eq!(estimate_tokens("éééé", "gpt-4o"), estimate_tokens("aaaa", "gpt-4o"));
    }

    #[test]
    fn message_overhead() {
        let msg = Message::user("a".repeat(400));
        assert_eq!(estimate_message_tokens(&msg, "gpt-4o"), 114);
        assert_eq!(estimate_message_tokens(&Message::user(""), "gpt-4o"), 4);
    }

    #[test]
    fn context_usage_ratio() {
        let usage = ContextUsage { used: 6_600, limit: 8_192 };
        assert!(usage.needs_compaction(0.8));
        assert!(!ContextUsage { used: 100, limit: 8_192 }.needs_compaction(0.8));
        assert!(ContextUsage { used: 0, limit: 0 }.needs_compaction(0.8));
    }

    #[test]
    fn budget_thresholds() {
        assert_eq!(BudgetStatus::from_spend(0.5, 1.0), BudgetStatus::Ok);
        assert_eq!(BudgetStatus::from_spend(0.7, 1.0), BudgetStatus::Warning);
        assert_eq!(BudgetStatus::from_spend(0.95, 1.0), BudgetStatus::Critical);
        assert_eq!(BudgetStatus::from_spend(1.0, 1.0), BudgetStatus::Exceeded);
        assert_eq!(BudgetStatus::from_spend(3.0, 1.0), BudgetStatus::Exceeded);
    }

    #[test]
    fn tracker_accumulates_and_resets() {
        let mut tracker = UsageTracker::new();
        let entry = tracker.record(1_000_000, 0, "gpt-4o", Some("openai"));
        assert!((entry.cost - 2.50).abs() < 1e-9);
        tracker.record(500, 200, "llama3.3:70b", Some("ollama"));

        assert_eq!(tracker.entries().len(), 2);
        assert!(tracker.entries()[1].is_local);
        assert_eq!(tracker.total_input_tokens(), 1_000_500);
        assert_eq!(tracker.total_output_tokens(), 200);
        assert!((tracker.total_cost() - 2.50).abs() < 1e-9);
        assert_eq!(tracker.budget_status(Some(3.0)), BudgetStatus::Warning);
        assert_eq!(tracker.budget_status(None), BudgetStatus::Ok);

        tracker.reset();
        assert!(tracker.entries().is_empty());
        assert_eq!(tracker.total_cost(), 0.0);
        assert_eq!(tracker.total_input_tokens(), 0);
    }

    #[test]
    fn check_budget_reports_escalation_once() {
        let mut tracker = UsageTracker::new();
        tracker.record(1_000_000, 0, "gpt-4o", None);
        let status = tracker.check_budget(Some(3.0), BudgetStatus::Ok);
        assert_eq!(status, Some(BudgetStatus::Warning));
        assert_eq!(tracker.check_budget(Some(3.0), BudgetStatus::Warning), None);
    }
}
