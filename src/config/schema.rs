//! TOML configuration schema for the engine.
//!
//! All fields have `#[serde(default)]` so a partially-filled `config.toml`
//! works correctly.  Missing sections fall back to their `Default` impl.
//!
//! Example `~/.conductor/config.toml`:
//! ```toml
//! [provider]
//! default_provider = "openai"
//! default_model = "gpt-4o-mini"
//!
//! [runner]
//! max_steps = 12
//!
//! [scheduler]
//! max_concurrent_runs = 8
//!
//! [tools]
//! default_timeout_secs = 30
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ai::LlmConfig;
use crate::scheduler::SchedulerConfig;

// ─── DatabaseConfig ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite file.  `None` uses the platform data directory.
    pub path: Option<String>,
}

// ─── ProviderConfig ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    /// ID of the default LLM provider (e.g. `"openai"`, `"anthropic"`).
    pub default_provider: String,
    /// Default model identifier.
    pub default_model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub base_url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default_provider: "openai".to_owned(),
            default_model: "gpt-4o-mini".to_owned(),
            temperature: None,
            max_tokens: None,
            base_url: None,
        }
    }
}

// ─── RunnerSettings ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerSettings {
    /// Maximum reason-act iterations per run.
    pub max_steps: u32,
    /// Trailing history messages included in the prompt.
    pub history_tail: usize,
    /// Memory hits retrieved per step.
    pub memory_hits: usize,
    /// System prompt for runs without a role.
    pub default_system_prompt: String,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            max_steps: defaults.runner.max_steps,
            history_tail: defaults.runner.history_tail,
            memory_hits: defaults.runner.memory_hits,
            default_system_prompt: defaults.default_system_prompt,
        }
    }
}

// ─── SchedulerSettings ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerSettings {
    pub max_concurrent_runs: usize,
    pub token_batch_size: usize,
    pub cancel_grace_secs: u64,
    /// Optional wall-clock limit per run, in seconds.
    pub run_timeout_secs: Option<u64>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            max_concurrent_runs: defaults.max_concurrent_runs,
            token_batch_size: defaults.token_batch_size,
            cancel_grace_secs: defaults.cancel_grace.as_secs(),
            run_timeout_secs: None,
        }
    }
}

// ─── ToolSettings ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolSettings {
    /// Execution timeout raced against every tool handler.
    pub default_timeout_secs: u64,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
        }
    }
}

// ─── RuntimeConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    pub runner: RunnerSettings,
    pub scheduler: SchedulerSettings,
    pub tools: ToolSettings,
}

impl RuntimeConfig {
    /// Executor-level config derived from the file settings.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let mut llm = LlmConfig::new(
            self.provider.default_provider.clone(),
            self.provider.default_model.clone(),
        );
        llm.temperature = self.provider.temperature;
        llm.max_tokens = self.provider.max_tokens;
        llm.base_url = self.provider.base_url.clone();

        SchedulerConfig {
            token_batch_size: self.scheduler.token_batch_size.max(1),
            max_concurrent_runs: self.scheduler.max_concurrent_runs.max(1),
            cancel_grace: Duration::from_secs(self.scheduler.cancel_grace_secs),
            run_timeout: self.scheduler.run_timeout_secs.map(Duration::from_secs),
            default_llm: llm,
            default_system_prompt: self.runner.default_system_prompt.clone(),
            runner: crate::agent::RunnerConfig {
                max_steps: self.runner.max_steps,
                history_tail: self.runner.history_tail,
                memory_hits: self.runner.memory_hits,
            },
        }
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.default_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert_eq!(config.provider.default_provider, "openai");
        assert_eq!(config.scheduler.token_batch_size, 24);
        assert_eq!(config.tools.default_timeout_secs, 30);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let raw = r#"
            [provider]
            default_model = "gpt-4o"
        "#;
        let config: RuntimeConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.provider.default_model, "gpt-4o");
        assert_eq!(config.provider.default_provider, "openai");
        assert_eq!(config.runner.max_steps, RunnerSettings::default().max_steps);
    }

    #[test]
    fn scheduler_config_carries_provider() {
        let mut config = RuntimeConfig::default();
        config.provider.default_model = "claude-3-haiku".to_string();
        config.provider.default_provider = "anthropic".to_string();
        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.default_llm.provider, "anthropic");
        assert_eq!(scheduler.default_llm.model, "claude-3-haiku");
    }
}
