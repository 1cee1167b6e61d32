//! Result cache keyed by (scenario, prompt) fingerprint.
//!
//! A hit points at the originating job directory so `start` can
//! short-circuit without dispatching anything. Entries expire by TTL and
//! are implicitly invalidated when the orchestrator binary or its
//! settings file is newer than the entry — checked lazily on read, never
//! swept eagerly.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::aggregate::aggregate;
use crate::config::{Config, cache_dir, settings_path};
use crate::error::Result;
use crate::job::JobPaths;
use crate::status::{MemberState, unix_now};
use crate::store::{read_json, write_json};

const PREVIEW_MEMBERS: usize = 2;
const PREVIEW_CHARS: usize = 200;

/// One cached job pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    /// Unix epoch seconds.
    pub created_at: u64,
    pub job_path: PathBuf,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    pub member_count: usize,
    /// First lines of the first two completed members' output.
    #[serde(default)]
    pub preview: Vec<MemberPreview>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberPreview {
    pub member: String,
    pub snippet: String,
}

/// Hex SHA-256 over `scenario \0 prompt`.
pub fn fingerprint(scenario: Option<&str>, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scenario.unwrap_or_default().as_bytes());
    hasher.update(b"\0");
    hasher.update(prompt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Files whose modification invalidates every cache entry older than the
/// touch: the orchestrator binary itself and the settings file.
fn invalidation_sources() -> Vec<PathBuf> {
    let mut sources = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        sources.push(exe);
    }
    if let Some(settings) = settings_path() {
        sources.push(settings);
    }
    sources
}

fn newest_mtime(sources: &[PathBuf]) -> Option<u64> {
    sources
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .filter_map(|m| m.modified().ok())
        .filter_map(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .max()
}

fn entry_path(dir: &Path, fingerprint: &str) -> PathBuf {
    dir.join(format!("{fingerprint}.json"))
}

/// Look up a valid cache entry for (scenario, prompt).
pub fn lookup(config: &Config, scenario: Option<&str>, prompt: &str) -> Option<CacheEntry> {
    lookup_in(
        &cache_dir(config),
        config.cache_ttl_secs,
        scenario,
        prompt,
        &invalidation_sources(),
    )
}

/// Testable lookup with explicit cache dir, TTL, and invalidation sources.
pub fn lookup_in(
    dir: &Path,
    ttl_secs: u64,
    scenario: Option<&str>,
    prompt: &str,
    sources: &[PathBuf],
) -> Option<CacheEntry> {
    let entry: CacheEntry = read_json(&entry_path(dir, &fingerprint(scenario, prompt)))?;
    let now = unix_now();

    if now.saturating_sub(entry.created_at) >= ttl_secs {
        return None;
    }
    // Any post-cache edit of the orchestration binary or config makes the
    // entry stale.
    if let Some(mtime) = newest_mtime(sources) {
        if entry.created_at < mtime {
            return None;
        }
    }
    // A cleaned job leaves a dangling pointer.
    if !entry.job_path.join(crate::job::META_FILE).exists() {
        return None;
    }
    Some(entry)
}

/// Record a finished job under the fingerprint computed at its creation.
///
/// The entry's `prompt` field is the persisted (masked) prompt text; the
/// unmasked prompt only ever contributed to the fingerprint digest.
pub fn store(config: &Config, job: &JobPaths) -> Result<CacheEntry> {
    store_in(&cache_dir(config), job)
}

/// Testable store with an explicit cache dir.
pub fn store_in(dir: &Path, job: &JobPaths) -> Result<CacheEntry> {
    std::fs::create_dir_all(dir)?;
    let meta = job.read_meta()?;
    let prompt = std::fs::read_to_string(job.prompt()).unwrap_or_default();
    let summary = aggregate(job);

    let preview = summary
        .members
        .iter()
        .filter(|m| m.state == MemberState::Done)
        .take(PREVIEW_MEMBERS)
        .map(|m| {
            let output = std::fs::read_to_string(
                job.member_output(&crate::status::safe_member_name(&m.name)),
            )
            .unwrap_or_default();
            MemberPreview {
                member: m.name.clone(),
                snippet: output.chars().take(PREVIEW_CHARS).collect(),
            }
        })
        .collect();

    let entry = CacheEntry {
        fingerprint: meta.fingerprint,
        created_at: unix_now(),
        job_path: job.root.clone(),
        prompt,
        scenario: meta.scenario,
        member_count: summary.total,
        preview,
    };
    write_json(&entry_path(dir, &entry.fingerprint), &entry)?;
    Ok(entry)
}

/// All entries currently on disk, newest first. Corrupt files are skipped.
pub fn list(dir: &Path) -> Vec<CacheEntry> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut all: Vec<CacheEntry> = entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .filter_map(|p| read_json(&p))
        .collect();
    all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    all
}

/// Delete every cache entry. Returns how many were removed.
pub fn clear(dir: &Path) -> Result<usize> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(0);
    };
    let mut removed = 0;
    for entry in entries.filter_map(std::result::Result::ok) {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
