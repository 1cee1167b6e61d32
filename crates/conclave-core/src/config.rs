//! Configuration resolution for Conclave.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults (the standard member set)
//! 2. User config (~/.config/conclave/settings.json)
//! 3. Environment variables
//!
//! Per-invocation CLI flags override the result at the call site.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// One external command-line agent participating in jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSpec {
    pub name: String,
    /// Shell command line, run via `sh -c` with the prompt on stdin.
    pub command: String,
    /// Alternate command substituted after a detected rate-limit failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(default)]
    pub emoji: String,
    #[serde(default)]
    pub color: String,
}

/// Complete Conclave configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Members dispatched on `start` (the chairman's entry may be
    /// filtered out at job creation).
    pub members: Vec<MemberSpec>,
    /// Per-member execution timeout in seconds.
    pub timeout_secs: u64,
    /// Exclude the chairman's own member entry from the dispatched set.
    pub exclude_chairman: bool,
    /// Cache entry time-to-live in seconds.
    pub cache_ttl_secs: u64,
    /// Root directory for job state. Defaults to the platform data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            members: default_members(),
            timeout_secs: 300,
            exclude_chairman: true,
            cache_ttl_secs: 24 * 60 * 60,
            data_dir: None,
        }
    }
}

/// Built-in member set used when no config file exists.
pub fn default_members() -> Vec<MemberSpec> {
    vec![
        MemberSpec {
            name: "claude".to_string(),
            command: "claude -p".to_string(),
            fallback: Some("claude --model claude-sonnet-4-5 -p".to_string()),
            emoji: "\u{1f7e0}".to_string(),
            color: "orange".to_string(),
        },
        MemberSpec {
            name: "gemini".to_string(),
            command: "gemini -p".to_string(),
            fallback: Some("gemini -m gemini-2.5-flash -p".to_string()),
            emoji: "\u{1f535}".to_string(),
            color: "blue".to_string(),
        },
        MemberSpec {
            name: "codex".to_string(),
            command: "codex exec".to_string(),
            fallback: None,
            emoji: "\u{26aa}".to_string(),
            color: "white".to_string(),
        },
    ]
}

/// Path of the user settings file, if a config dir can be determined.
pub fn settings_path() -> Option<PathBuf> {
    std::env::var_os("CONCLAVE_CONFIG").map_or_else(
        || dirs::config_dir().map(|d| d.join("conclave").join("settings.json")),
        |p| Some(PathBuf::from(p)),
    )
}

/// Root directory for jobs and the cache.
///
/// Resolution order: `CONCLAVE_HOME` env var, the configured `data_dir`,
/// the platform data dir, and finally the temp dir.
pub fn data_dir(config: &Config) -> PathBuf {
    if let Some(home) = std::env::var_os("CONCLAVE_HOME") {
        return PathBuf::from(home);
    }
    if let Some(dir) = &config.data_dir {
        return dir.clone();
    }
    dirs::data_dir()
        .map_or_else(std::env::temp_dir, |d| d.join("conclave"))
}

/// Directory containing per-job state.
pub fn jobs_dir(config: &Config) -> PathBuf {
    data_dir(config).join("jobs")
}

/// Directory containing cache entries.
pub fn cache_dir(config: &Config) -> PathBuf {
    data_dir(config).join("cache")
}

/// Load configuration with hierarchical resolution.
///
/// A missing settings file falls back to built-in defaults; an unreadable
/// or unparseable file is a `Config` error (the user asked for something
/// specific and we could not honor it).
pub fn load_config() -> Result<Config> {
    let mut config = match settings_path() {
        Some(path) if path.exists() => load_config_file(&path)?,
        _ => Config::default(),
    };
    apply_env_overrides(&mut config);
    if config.members.is_empty() {
        config.members = default_members();
    }
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("CONCLAVE_TIMEOUT_SECS") {
        if let Ok(n) = val.parse() {
            config.timeout_secs = n;
        }
    }
    if let Ok(val) = std::env::var("CONCLAVE_CACHE_TTL_SECS") {
        if let Ok(n) = val.parse() {
            config.cache_ttl_secs = n;
        }
    }
}

/// Resolve the chairman role.
///
/// An explicit value wins; otherwise infer from which host agent
/// environment invoked us; otherwise default to `claude`.
pub fn resolve_chairman(explicit: Option<&str>) -> String {
    if let Some(name) = explicit {
        return name.to_string();
    }
    if std::env::var_os("CLAUDECODE").is_some()
        || std::env::var_os("CLAUDE_CODE_ENTRYPOINT").is_some()
    {
        return "claude".to_string();
    }
    if std::env::var_os("GEMINI_CLI").is_some() {
        return "gemini".to_string();
    }
    if std::env::var_os("CODEX_SANDBOX").is_some() {
        return "codex".to_string();
    }
    "claude".to_string()
}
