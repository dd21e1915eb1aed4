//! Run scheduling: the per-run executor and the queue-driven engine.

pub mod engine;
pub mod executor;

use std::time::Duration;

use crate::agent::RunnerConfig;
use crate::ai::LlmConfig;

pub use engine::Engine;
pub use executor::{ExecutorDeps, RunExecutor, SchedulerError, TOKEN_EVENT_BATCH_SIZE};

/// Executor-level tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tokens buffered before a durable batch flush.
    pub token_batch_size: usize,
    /// Cross-run parallelism cap.
    pub max_concurrent_runs: usize,
    /// How long a cancelled run may keep running before the scheduler
    /// records the terminal state regardless.
    pub cancel_grace: Duration,
    /// Optional wall-clock limit per run; `None` disables it.
    pub run_timeout: Option<Duration>,
    pub default_llm: LlmConfig,
    pub default_system_prompt: String,
    pub runner: RunnerConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            token_batch_size: TOKEN_EVENT_BATCH_SIZE,
            max_concurrent_runs: 4,
            cancel_grace: Duration::from_secs(5),
            run_timeout: None,
            default_llm: LlmConfig::new("openai", "gpt-4o-mini"),
            default_system_prompt:
                "You are a capable autonomous agent. Use the available tools when they help, \
                 and answer directly when they do not."
                    .to_string(),
            runner: RunnerConfig::default(),
        }
    }
}
