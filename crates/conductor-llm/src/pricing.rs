//! Static per-model pricing and context window tables.
//!
//! These tables drift from real provider pricing over time; treat them as
//! estimates. Lookups are by case-insensitive substring, longest key wins,
//! so `gpt-4o-mini-2024-07-18` resolves to `gpt-4o-mini` rather than `gpt-4o`.

use serde::Serialize;

/// USD per million tokens.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub const FREE: Self = Self::new(0.0, 0.0);

    pub fn is_free(&self) -> bool {
        self.input_per_million == 0.0 && self.output_per_million == 0.0
    }
}

/// Fallback for paid models missing from the table.
pub const DEFAULT_PRICING: ModelPricing = ModelPricing::new(1.00, 3.00);

pub const DEFAULT_CONTEXT_LIMIT: u32 = 8_192;

const PRICING: &[(&str, ModelPricing)] = &[
    ("gpt-4o", ModelPricing::new(2.50, 10.00)),
    ("gpt-4o-mini", ModelPricing::new(0.15, 0.60)),
    ("gpt-4-turbo", ModelPricing::new(10.00, 30.00)),
    ("gpt-4", ModelPricing::new(30.00, 60.00)),
    ("gpt-3.5-turbo", ModelPricing::new(0.50, 1.50)),
    ("o1", ModelPricing::new(15.00, 60.00)),
    ("o1-mini", ModelPricing::new(3.00, 12.00)),
    ("o3-mini", ModelPricing::new(1.10, 4.40)),
    ("claude-3-5-sonnet", ModelPricing::new(3.00, 15.00)),
    ("claude-3-5-haiku", ModelPricing::new(0.80, 4.00)),
    ("claude-3-opus", ModelPricing::new(15.00, 75.00)),
    ("claude-3-haiku", ModelPricing::new(0.25, 1.25)),
    ("gemini-1.5-pro", ModelPricing::new(1.25, 5.00)),
    ("gemini-1.5-flash", ModelPricing::new(0.075, 0.30)),
    ("mistral-large", ModelPricing::new(2.00, 6.00)),
];

/// Model families normally served locally (Ollama, LM Studio, llama.cpp).
const LOCAL_FAMILIES: &[&str] = &[
    "llama", "mistral", "mixtral", "qwen", "phi", "gemma", "deepseek", "codellama", "starcoder",
];

/// Providers that never bill per token.
const LOCAL_PROVIDERS: &[&str] = &["ollama", "lmstudio", "local", "llamacpp"];

const CONTEXT_LIMITS: &[(&str, u32)] = &[
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
    ("o1", 200_000),
    ("o3-mini", 200_000),
    ("claude", 200_000),
    ("gemini-1.5-pro", 2_000_000),
    ("gemini-1.5-flash", 1_000_000),
    ("llama2", 4_096),
    ("llama3", 8_192),
    ("llama3.1", 131_072),
    ("llama3.2", 131_072),
    ("llama3.3", 131_072),
    ("mistral", 32_768),
    ("mixtral", 32_768),
    ("qwen2.5", 32_768),
    ("gemma2", 8_192),
    ("phi3", 4_096),
    ("deepseek", 65_536),
];

fn best_match<'t, T>(table: &'t [(&'static str, T)], model: &str) -> Option<&'t T> {
    let model = model.to_lowercase();
    table
        .iter()
        .filter(|(key, _)| model.contains(key))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, value)| value)
}

fn is_local_provider(provider: Option<&str>) -> bool {
    provider.is_some_and(|p| LOCAL_PROVIDERS.contains(&p.to_lowercase().as_str()))
}

fn is_local_family(model: &str) -> bool {
    let model = model.to_lowercase();
    LOCAL_FAMILIES.iter().any(|f| model.contains(f))
}

/// Resolve pricing for a model, optionally qualified by the provider serving it.
pub fn pricing_for(model: &str, provider: Option<&str>) -> ModelPricing {
    if is_local_provider(provider) {
        return ModelPricing::FREE;
    }
    if let Some(pricing) = best_match(PRICING, model) {
        return *pricing;
    }
    if is_local_family(model) {
        return ModelPricing::FREE;
    }
    DEFAULT_PRICING
}

/// Context window for a model, or [`DEFAULT_CONTEXT_LIMIT`] when unknown.
pub fn context_limit(model: &str) -> u32 {
    best_match(CONTEXT_LIMITS, model)
        .copied()
        .unwrap_or(DEFAULT_CONTEXT_LIMIT)
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total: f64,
    pub is_local: bool,
}

pub fn calculate_cost(
    input_tokens: u64,
    output_tokens: u64,
    model: &str,
    provider: Option<&str>,
) -> CostBreakdown {
    let pricing = pricing_for(model, provider);
    let input_cost = input_tokens as f64 / 1_000_000.0 * pricing.input_per_million;
    let output_cost = output_tokens as f64 / 1_000_000.0 * pricing.output_per_million;
    CostBreakdown {
        input_cost,
        output_cost,
        total: input_cost + output_cost,
        is_local: pricing.is_free(),
    }
}

/// `$0.00`, `$0.0042`, `$1.25`.
pub fn format_cost(usd: f64) -> String {
    if usd == 0.0 {
        "$0.00".into()
    } else if usd < 0.01 {
        format!("${usd:.4}")
    } else {
        format!("${usd:.2}")
    }
}

/// `950`, `12.3k`, `1.2M`.
pub fn format_tokens(tokens: u64) -> String {
    if tokens < 1_000 {
        tokens.to_string()
    } else if tokens < 1_000_000 {
        format!("{:.1}k", tokens as f64 / 1_000.0)
    } else {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    }
}
