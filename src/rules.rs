//! Analysis rules: a prompt plus the policy deciding when it runs.

use serde::{Deserialize, Serialize};

/// When a rule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerTiming {
    /// Shortly after a word is completed.
    Word,
    /// Shortly after a sentence is completed.
    Sentence,
    /// On a configurable elapsed-time interval while the text changes.
    Custom,
    /// Only when explicitly requested.
    Manual,
}

impl TriggerTiming {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerTiming::Word => "word",
            TriggerTiming::Sentence => "sentence",
            TriggerTiming::Custom => "custom",
            TriggerTiming::Manual => "manual",
        }
    }
}

impl std::fmt::Display for TriggerTiming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// A user-configured analysis directive, as read from `[[rules]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    /// Prompt template. `{{content}}` is replaced by the full text and
    /// `{{unit}}` by the word or sentence that triggered the run.
    pub prompt: String,
    pub trigger: TriggerTiming,
    /// Interval for `custom` rules, e.g. `"1m30s"`.
    #[serde(default)]
    pub delay: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-rule model override.
    #[serde(default)]
    pub model: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    /// Fill the prompt template. Templates without `{{content}}` get the
    /// text appended after a blank line.
    pub fn render_prompt(&self, content: &str, unit: Option<&str>) -> String {
        let mut prompt = self
            .prompt
            .replace("{{unit}}", unit.unwrap_or(content));
        if prompt.contains("{{content}}") {
            prompt = prompt.replace("{{content}}", content);
        } else {
            prompt.push_str("\n\n");
            prompt.push_str(content);
        }
        prompt
    }
}
