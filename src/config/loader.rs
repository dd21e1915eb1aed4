//! TOML configuration loading, env-var overrides, and atomic saves.
//!
//! # Loading order
//! 1. Parse `~/.conductor/config.toml` (or the path in `CONDUCTOR_CONFIG`)
//! 2. Apply `CONDUCTOR_*` environment variable overrides
//! 3. Fall back to [`RuntimeConfig::default()`] if the file is missing
//!
//! # Atomic save
//! Writes to `<path>.tmp`, backs up the existing file, then renames so a
//! partial write can never corrupt the config file.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use super::schema::RuntimeConfig;

// ─── default_config_path ─────────────────────────────────────────────────────

/// Return the default config file path: `~/.conductor/config.toml`.
pub fn default_config_path() -> Result<PathBuf, String> {
    dirs::home_dir()
        .map(|h| h.join(".conductor").join("config.toml"))
        .ok_or_else(|| "could not determine home directory".to_string())
}

// ─── load_config ─────────────────────────────────────────────────────────────

/// Load [`RuntimeConfig`] from the given path, falling back to defaults if
/// the file does not exist, then applying environment variable overrides.
pub fn load_config(path: &Path) -> Result<RuntimeConfig, String> {
    let mut config = match fs::read_to_string(path) {
        Ok(content) => toml::from_str::<RuntimeConfig>(&content)
            .map_err(|e| format!("failed to parse config at {path:?}: {e}"))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => RuntimeConfig::default(),
        Err(e) => return Err(format!("failed to read config at {path:?}: {e}")),
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load config from the default path (or `CONDUCTOR_CONFIG`).
pub fn load_default_config() -> RuntimeConfig {
    let path = env::var("CONDUCTOR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            default_config_path().unwrap_or_else(|_| PathBuf::from("config.toml"))
        });

    load_config(&path).unwrap_or_default()
}

// ─── apply_env_overrides ─────────────────────────────────────────────────────

/// Apply `CONDUCTOR_*` environment variable overrides to `config`.
///
/// Supported overrides:
/// - `CONDUCTOR_PROVIDER`             → `provider.default_provider`
/// - `CONDUCTOR_MODEL`                → `provider.default_model`
/// - `CONDUCTOR_DB_PATH`              → `database.path`
/// - `CONDUCTOR_MAX_STEPS`            → `runner.max_steps`
/// - `CONDUCTOR_MAX_CONCURRENT_RUNS`  → `scheduler.max_concurrent_runs`
/// - `CONDUCTOR_TOOL_TIMEOUT_SECS`    → `tools.default_timeout_secs`
fn apply_env_overrides(config: &mut RuntimeConfig) {
    if let Ok(v) = env::var("CONDUCTOR_PROVIDER") {
        config.provider.default_provider = v;
    }
    if let Ok(v) = env::var("CONDUCTOR_MODEL") {
        config.provider.default_model = v;
    }
    if let Ok(v) = env::var("CONDUCTOR_DB_PATH") {
        config.database.path = Some(v);
    }
    if let Ok(v) = env::var("CONDUCTOR_MAX_STEPS")
        && let Ok(steps) = v.parse::<u32>()
    {
        config.runner.max_steps = steps;
    }
    if let Ok(v) = env::var("CONDUCTOR_MAX_CONCURRENT_RUNS")
        && let Ok(n) = v.parse::<usize>()
    {
        config.scheduler.max_concurrent_runs = n;
    }
    if let Ok(v) = env::var("CONDUCTOR_TOOL_TIMEOUT_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        config.tools.default_timeout_secs = secs;
    }
}

// ─── save_config ─────────────────────────────────────────────────────────────

/// Atomically save `config` to `path`.
///
/// Writes to `<path>.tmp`, creates a backup of the existing file as
/// `<path>.bak`, then renames the temp file to `<path>`.
pub fn save_config(path: &Path, config: &RuntimeConfig) -> Result<(), String> {
    let content =
        toml::to_string_pretty(config).map_err(|e| format!("failed to serialise config: {e}"))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("failed to create config dir: {e}"))?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &content).map_err(|e| format!("failed to write temp config: {e}"))?;

    if path.exists() {
        let bak_path = path.with_extension("toml.bak");
        fs::copy(path, &bak_path).map_err(|e| format!("failed to backup config: {e}"))?;
    }

    fs::rename(&tmp_path, path).map_err(|e| format!("failed to replace config file: {e}"))?;
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
