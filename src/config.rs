use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::rules::{Rule, TriggerTiming};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub structure: StructureConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Settings handed to the generation client. Opaque to the scheduler.
#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            temperature: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Copy of this config with the model replaced, for per-rule overrides.
    pub fn with_model(&self, model: Option<&str>) -> Self {
        let mut cfg = self.clone();
        if let Some(m) = model {
            cfg.model = Some(m.to_string());
        }
        cfg
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_trigger_batch_ms")]
    pub trigger_batch_ms: u64,
    #[serde(default = "default_min_settle_ms")]
    pub min_settle_ms: u64,
    #[serde(default = "default_custom_ms")]
    pub default_custom_ms: u64,
    #[serde(default = "default_batch_rerun_delay_ms")]
    pub batch_rerun_delay_ms: u64,
    #[serde(default = "default_countdown_tick_ms")]
    pub countdown_tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            trigger_batch_ms: default_trigger_batch_ms(),
            min_settle_ms: default_min_settle_ms(),
            default_custom_ms: default_custom_ms(),
            batch_rerun_delay_ms: default_batch_rerun_delay_ms(),
            countdown_tick_ms: default_countdown_tick_ms(),
        }
    }
}

fn default_trigger_batch_ms() -> u64 {
    100
}
fn default_min_settle_ms() -> u64 {
    1000
}
fn default_custom_ms() -> u64 {
    1000
}
fn default_batch_rerun_delay_ms() -> u64 {
    100
}
fn default_countdown_tick_ms() -> u64 {
    100
}

impl SchedulerConfig {
    pub fn trigger_batch(&self) -> Duration {
        Duration::from_millis(self.trigger_batch_ms)
    }
    pub fn min_settle(&self) -> Duration {
        Duration::from_millis(self.min_settle_ms)
    }
    pub fn default_custom(&self) -> Duration {
        Duration::from_millis(self.default_custom_ms)
    }
    pub fn batch_rerun_delay(&self) -> Duration {
        Duration::from_millis(self.batch_rerun_delay_ms)
    }
    pub fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StructureConfig {
    #[serde(default = "default_word_tolerance")]
    pub word_position_tolerance: usize,
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            word_position_tolerance: default_word_tolerance(),
        }
    }
}

fn default_word_tolerance() -> usize {
    crate::structure::DEFAULT_WORD_TOLERANCE
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    #[serde(default = "default_sentence_threshold")]
    pub sentence_threshold: f64,
    #[serde(default = "default_paragraph_threshold")]
    pub paragraph_threshold: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            sentence_threshold: default_sentence_threshold(),
            paragraph_threshold: default_paragraph_threshold(),
        }
    }
}

fn default_sentence_threshold() -> f64 {
    crate::associations::DEFAULT_SENTENCE_THRESHOLD
}
fn default_paragraph_threshold() -> f64 {
    crate::associations::DEFAULT_PARAGRAPH_THRESHOLD
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_store_key")]
    pub key: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
            key: default_store_key(),
        }
    }
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_store_key() -> String {
    "associations".to_string()
}

impl Config {
    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn enabled_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.enabled)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Like [`load_config`], but a missing file yields `Config::default()`.
/// A file that exists and fails to parse or validate is still an error.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    load_config(path)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate generation
    match config.generation.provider.as_str() {
        "disabled" => {}
        "openai" | "ollama" => {
            if config.generation.model.is_none() {
                anyhow::bail!(
                    "generation.model must be specified when provider is '{}'",
                    config.generation.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    // Validate scheduler
    if config.scheduler.min_settle_ms == 0 {
        anyhow::bail!("scheduler.min_settle_ms must be > 0");
    }
    if config.scheduler.countdown_tick_ms == 0 {
        anyhow::bail!("scheduler.countdown_tick_ms must be > 0");
    }

    // Validate thresholds
    for (name, value) in [
        ("validation.sentence_threshold", config.validation.sentence_threshold),
        ("validation.paragraph_threshold", config.validation.paragraph_threshold),
    ] {
        if !(value > 0.0 && value <= 1.0) {
            anyhow::bail!("{} must be in (0.0, 1.0]", name);
        }
    }

    // Validate rules
    let mut seen = HashSet::new();
    for rule in &config.rules {
        if rule.id.trim().is_empty() {
            anyhow::bail!("rules: every rule needs a non-empty id");
        }
        if !seen.insert(rule.id.as_str()) {
            anyhow::bail!("rules: duplicate rule id '{}'", rule.id);
        }
        if rule.delay.is_some() && rule.trigger != TriggerTiming::Custom {
            anyhow::bail!(
                "rules.{}: delay is only valid for trigger = \"custom\"",
                rule.id
            );
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_config() {
        let cfg = parse_config("").unwrap();
        assert!(!cfg.generation.is_enabled());
        assert_eq!(cfg.scheduler.min_settle_ms, 1000);
        assert_eq!(cfg.scheduler.trigger_batch_ms, 100);
        assert_eq!(cfg.structure.word_position_tolerance, 10);
        assert!((cfg.validation.sentence_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(cfg.store.key, "associations");
        assert!(cfg.rules.is_empty());
    }

    #[test]
    fn test_full_config() {
        let cfg = parse_config(
            r#"
[generation]
provider = "openai"
model = "gpt-4o-mini"
max_retries = 1

[scheduler]
min_settle_ms = 500

[[rules]]
id = "grammar"
name = "Grammar"
prompt = "Fix grammar: {{unit}}"
trigger = "sentence"

[[rules]]
id = "tone"
name = "Tone"
prompt = "Tone of: {{content}}"
trigger = "custom"
delay = "2m"
enabled = false
"#,
        )
        .unwrap();
        assert_eq!(cfg.generation.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(cfg.scheduler.min_settle(), Duration::from_millis(500));
        assert_eq!(cfg.rules.len(), 2);
        assert_eq!(cfg.enabled_rules().count(), 1);
        assert_eq!(cfg.rule("tone").unwrap().trigger, TriggerTiming::Custom);
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(parse_config("[generation]\nprovider = \"bogus\"").is_err());
        assert!(parse_config("[generation]\nprovider = \"openai\"").is_err());
        assert!(parse_config("[validation]\nsentence_threshold = 1.5").is_err());
        assert!(parse_config("[scheduler]\nmin_settle_ms = 0").is_err());

        let dup = r#"
[[rules]]
id = "a"
name = "A"
prompt = "p"
trigger = "word"

[[rules]]
id = "a"
name = "A again"
prompt = "p"
trigger = "word"
"#;
        assert!(parse_config(dup).is_err());

        let bad_delay = r#"
[[rules]]
id = "a"
name = "A"
prompt = "p"
trigger = "word"
delay = "5s"
"#;
        assert!(parse_config(bad_delay).is_err());
    }

    #[test]
    fn test_example_config_parses() {
        let cfg = parse_config(include_str!("../config/draft.example.toml")).unwrap();
        assert_eq!(cfg.rules.len(), 4);
        assert_eq!(cfg.rule("summary").unwrap().model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert!(cfg.rules.is_empty());

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[generation]\nprovider = 7").unwrap();
        assert!(load_or_default(&bad).is_err());
    }

    #[test]
    fn test_with_model_override() {
        let cfg = GenerationConfig::default();
        assert_eq!(cfg.with_model(Some("m2")).model.as_deref(), Some("m2"));
        assert_eq!(cfg.with_model(None).model, None);
    }
}
