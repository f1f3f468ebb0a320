//! Settings shared by every conductor component.
//!
//! Three layers resolve a value, the later one winning: compiled defaults,
//! the user's JSON file, and a handful of environment variables. The file
//! only has to name the keys it changes; [`deep_merge`] fills in the rest.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid settings json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorSettings {
    pub default_provider: String,
    pub default_model: String,
    pub runner: RunnerSettings,
    pub subagents: SubagentSettings,
    pub budget: BudgetSettings,
    pub compaction: CompactionSettings,
    pub providers: ProviderSettings,
    pub logging: LoggingSettings,
}

impl Default for ConductorSettings {
    fn default() -> Self {
        Self {
            default_provider: "openai".into(),
            default_model: "gpt-4o".into(),
            runner: RunnerSettings::default(),
            subagents: SubagentSettings::default(),
            budget: BudgetSettings::default(),
            compaction: CompactionSettings::default(),
            providers: ProviderSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl ConductorSettings {
    /// Model used by subagents when `spawn` is not given one.
    pub fn subagent_model(&self) -> &str {
        self.subagents
            .default_model
            .as_deref()
            .unwrap_or(&self.default_model)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    pub max_turns: u32,
    /// Token budget for the history window sent on each chat turn.
    pub history_max_tokens: u32,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_turns: 10,
            history_max_tokens: 8_000,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubagentSettings {
    pub max_concurrent: usize,
    pub max_turns: u32,
    pub default_model: Option<String>,
    pub poll_interval_ms: u64,
}

impl Default for SubagentSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_turns: 5,
            default_model: None,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    pub max_spend_usd: Option<f64>,
    /// Fraction of the model's context limit at which compaction kicks in.
    pub compaction_threshold: f64,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            max_spend_usd: None,
            compaction_threshold: 0.8,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    pub keep_recent: usize,
    /// Target size after compaction, as a fraction of the context limit.
    pub target_ratio: f64,
    pub use_llm: bool,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            keep_recent: 4,
            target_ratio: 0.5,
            use_llm: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub openai_base_url: String,
    pub ollama_base_url: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            openai_base_url: "https://api.openai.com/v1".into(),
            ollama_base_url: "http://localhost:11434".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

/// `$HOME/.conductor/settings.json`, or under the temp dir when `HOME` is
/// unset.
pub fn settings_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".conductor")
        .join("settings.json")
}

pub fn load_settings() -> Result<ConductorSettings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Resolve all three layers against `path`. Only a file that exists but
/// cannot be read or parsed is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ConductorSettings, SettingsError> {
    let mut settings = load_file(path)?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn load_file(path: &Path) -> Result<ConductorSettings, SettingsError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(ConductorSettings::default());
        }
        Err(e) => return Err(e.into()),
    };

    let overlay: Value = serde_json::from_str(&raw)?;
    let mut merged = serde_json::to_value(ConductorSettings::default())?;
    deep_merge(&mut merged, overlay);
    debug!(path = %path.display(), "settings file applied");
    Ok(serde_json::from_value(merged)?)
}

/// Lay `overlay` over `base` in place. Objects combine key by key; any
/// other overlay value replaces the base value outright, except `null`,
/// which leaves the base untouched.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None if value.is_null() => {}
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply environment overrides. `lookup` is injected so tests don't touch
/// the process environment. Unparseable values are ignored.
pub fn apply_env_overrides(
    settings: &mut ConductorSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let string = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = string("CONDUCTOR_PROVIDER") {
        settings.default_provider = v;
    }
    if let Some(v) = string("CONDUCTOR_MODEL") {
        settings.default_model = v;
    }
    if let Some(v) = string("CONDUCTOR_MAX_TURNS").and_then(|v| parse_in_range(&v, 1, 1_000)) {
        settings.runner.max_turns = v;
    }
    if let Some(v) = string("CONDUCTOR_MAX_CONCURRENT").and_then(|v| parse_in_range(&v, 1, 256)) {
        settings.subagents.max_concurrent = v;
    }
    if let Some(v) = string("CONDUCTOR_MAX_SPEND").and_then(|v| v.trim().parse::<f64>().ok()) {
        if v.is_finite() && v > 0.0 {
            settings.budget.max_spend_usd = Some(v);
        }
    }
    if let Some(v) = string("CONDUCTOR_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = string("OPENAI_BASE_URL") {
        settings.providers.openai_base_url = v;
    }
    if let Some(v) = string("OLLAMA_HOST") {
        settings.providers.ollama_base_url = v;
    }
}

fn parse_in_range<T>(raw: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    raw.trim()
        .parse::<T>()
        .ok()
        .filter(|v| *v >= min && *v <= max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "conductor_settings_test_{}",
            uuid::Uuid::now_v7()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let s = ConductorSettings::default();
        assert_eq!(s.subagents.max_concurrent, 3);
        assert_eq!(s.subagents.max_turns, 5);
        assert_eq!(s.compaction.keep_recent, 4);
        assert!((s.budget.compaction_threshold - 0.8).abs() < f64::EPSILON);
        assert!((s.compaction.target_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(s.subagent_model(), "gpt-4o");
    }

    #[test]
    fn missing_file_gives_defaults() {
        let s = load_file(Path::new("/nonexistent/conductor/settings.json")).unwrap();
        assert_eq!(s, ConductorSettings::default());
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let path = temp_file(
            "settings.json",
            r#"{"default_model": "llama3.3:70b", "subagents": {"max_concurrent": 5}}"#,
        );
        let s = load_file(&path).unwrap();
        assert_eq!(s.default_model, "llama3.3:70b");
        assert_eq!(s.subagents.max_concurrent, 5);
        // untouched sibling keeps its default
        assert_eq!(s.subagents.max_turns, 5);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn invalid_json_is_an_error() {
        let path = temp_file("settings.json", "{not json");
        assert!(matches!(load_file(&path), Err(SettingsError::Json(_))));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn deep_merge_rules() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "list": [1, 2], "keep": true});
        deep_merge(
            &mut base,
            json!({"a": {"b": 10}, "list": [3], "keep": null, "extra": "x", "gone": null}),
        );
        assert_eq!(
            base,
            json!({"a": {"b": 10, "c": 2}, "list": [3], "keep": true, "extra": "x"})
        );
    }

    #[test]
    fn env_overrides_apply() {
        let mut s = ConductorSettings::default();
        apply_env_overrides(
            &mut s,
            env(&[
                ("CONDUCTOR_PROVIDER", "ollama"),
                ("CONDUCTOR_MAX_TURNS", "7"),
                ("CONDUCTOR_MAX_SPEND", "2.5"),
                ("OLLAMA_HOST", "http://gpu-box:11434"),
            ]),
        );
        assert_eq!(s.default_provider, "ollama");
        assert_eq!(s.runner.max_turns, 7);
        assert_eq!(s.budget.max_spend_usd, Some(2.5));
        assert_eq!(s.providers.ollama_base_url, "http://gpu-box:11434");
    }

    #[test]
    fn invalid_env_values_ignored() {
        let mut s = ConductorSettings::default();
        apply_env_overrides(
            &mut s,
            env(&[
                ("CONDUCTOR_MAX_TURNS", "zero"),
                ("CONDUCTOR_MAX_CONCURRENT", "0"),
                ("CONDUCTOR_MAX_SPEND", "-1"),
                ("CONDUCTOR_MODEL", "   "),
            ]),
        );
        assert_eq!(s, ConductorSettings::default());
    }
}
