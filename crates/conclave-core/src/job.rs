//! Job identity and on-disk layout.
//!
//! One job directory fully describes one orchestration run:
//!
//! ```text
//! jobs/<id>/
//!   meta.json                  job metadata (immutable after creation)
//!   prompt.md                  the masked user prompt
//!   .wait_cursor               last cursor emitted by the wait protocol
//!   members/<safe-name>/
//!     status.json              member status record (worker-owned)
//!     prompt.md                the member's full dispatched prompt
//!     output.log               streamed stdout
//!     error.log                streamed stderr
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::MemberSpec;
use crate::error::{Error, Result};
use crate::status::safe_member_name;

pub const META_FILE: &str = "meta.json";
pub const PROMPT_FILE: &str = "prompt.md";
pub const MEMBERS_DIR: &str = "members";
pub const STATUS_FILE: &str = "status.json";
pub const OUTPUT_FILE: &str = "output.log";
pub const ERROR_FILE: &str = "error.log";
pub const CURSOR_FILE: &str = ".wait_cursor";

/// One member as resolved into a job: spec plus assigned role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMember {
    #[serde(flatten)]
    pub spec: MemberSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Job metadata, written once at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMeta {
    pub id: String,
    /// Unix epoch seconds.
    pub created_at: u64,
    pub chairman: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    pub timeout_secs: u64,
    pub exclude_chairman: bool,
    /// Cache fingerprint of (scenario, original prompt), computed at
    /// creation so a finished job can be cached without the unmasked
    /// prompt ever being persisted.
    #[serde(default)]
    pub fingerprint: String,
    pub members: Vec<JobMember>,
}

/// Generate a job id from the creation time plus a random suffix.
pub fn new_job_id(now: u64) -> String {
    let suffix: u32 = rand::thread_rng().r#gen();
    format!("job-{now}-{:06x}", suffix & 0x00ff_ffff)
}

/// Paths inside one job directory.
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub root: PathBuf,
}

impl JobPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn meta(&self) -> PathBuf {
        self.root.join(META_FILE)
    }

    pub fn prompt(&self) -> PathBuf {
        self.root.join(PROMPT_FILE)
    }

    pub fn cursor(&self) -> PathBuf {
        self.root.join(CURSOR_FILE)
    }

    pub fn members_dir(&self) -> PathBuf {
        self.root.join(MEMBERS_DIR)
    }

    pub fn member_dir(&self, member_name: &str) -> PathBuf {
        self.members_dir().join(safe_member_name(member_name))
    }

    pub fn member_status(&self, member_name: &str) -> PathBuf {
        self.member_dir(member_name).join(STATUS_FILE)
    }

    pub fn member_prompt(&self, member_name: &str) -> PathBuf {
        self.member_dir(member_name).join(PROMPT_FILE)
    }

    pub fn member_output(&self, member_name: &str) -> PathBuf {
        self.member_dir(member_name).join(OUTPUT_FILE)
    }

    pub fn member_error(&self, member_name: &str) -> PathBuf {
        self.member_dir(member_name).join(ERROR_FILE)
    }

    /// Read this job's metadata record.
    pub fn read_meta(&self) -> Result<JobMeta> {
        crate::store::read_json(&self.meta())
            .ok_or_else(|| Error::JobNotFound(self.root.display().to_string()))
    }

    /// Enumerate member subdirectories (safe names) in sorted order.
    pub fn member_names(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.members_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }
}

/// Resolve a job directory from an id (or a literal path) under `jobs_dir`.
///
/// `latest` picks the most recently created job.
pub fn resolve_job(jobs_dir: &Path, id: Option<&str>) -> Result<JobPaths> {
    match id {
        Some(id) => {
            let as_path = Path::new(id);
            let root = if as_path.is_dir() {
                as_path.to_path_buf()
            } else {
                jobs_dir.join(id)
            };
            if root.join(META_FILE).exists() {
                Ok(JobPaths::new(root))
            } else {
                Err(Error::JobNotFound(id.to_string()))
            }
        }
        None => latest_job(jobs_dir)
            .ok_or_else(|| Error::JobNotFound("no jobs have been created".to_string())),
    }
}

/// The most recently created job under `jobs_dir`, by metadata timestamp.
pub fn latest_job(jobs_dir: &Path) -> Option<JobPaths> {
    let entries = std::fs::read_dir(jobs_dir).ok()?;
    let mut jobs: Vec<(u64, PathBuf)> = entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| p.join(META_FILE).exists())
        .filter_map(|p| {
            let meta: JobMeta = crate::store::read_json(&p.join(META_FILE))?;
            Some((meta.created_at, p))
        })
        .collect();
    jobs.sort_by_key(|(created, _)| *created);
    jobs.pop().map(|(_, p)| JobPaths::new(p))
}

/// Delete a job's entire directory subtree.
pub fn clean_job(paths: &JobPaths) -> Result<()> {
    std::fs::remove_dir_all(&paths.root)?;
    Ok(())
}
