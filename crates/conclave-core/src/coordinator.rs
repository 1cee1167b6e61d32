//! Job creation and worker launch.
//!
//! The coordinator validates the request, resolves members/chairman/
//! scenario, lays the job directory out in full, then launches one
//! detached OS worker process per member and returns without waiting.
//! After it returns, the job directory alone describes the job: metadata
//! plus a queued-or-further status per member — even if every worker
//! were to crash immediately.

use std::path::Path;
use std::process::Stdio;

use tracing::{info, warn};

use crate::cache::{self, CacheEntry};
use crate::config::{Config, jobs_dir, resolve_chairman};
use crate::error::{Error, Result};
use crate::job::{JobMember, JobMeta, JobPaths, new_job_id};
use crate::mask::mask_secrets;
use crate::scenario::{self, build_member_prompt};
use crate::status::{MemberState, MemberStatus, safe_member_name, unix_now};
use crate::store::{merge_status, write_json};

/// One `start` invocation.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub prompt: String,
    pub scenario: Option<String>,
    /// Explicit chairman role; otherwise inferred from the host
    /// environment, defaulting to `claude`.
    pub chairman: Option<String>,
    pub timeout_secs: Option<u64>,
    /// Dispatch to the chairman's member too, overriding the configured
    /// exclusion.
    pub include_chairman: bool,
    pub no_cache: bool,
}

/// What `start` produced.
#[derive(Debug)]
pub enum StartOutcome {
    /// A valid cache entry short-circuited the request; no job was created.
    Cached(CacheEntry),
    /// A new job was created and its workers launched.
    Started(JobPaths),
}

/// Create and launch a job (or short-circuit via the cache).
pub fn start_job(config: &Config, req: &StartRequest) -> Result<StartOutcome> {
    if req.prompt.trim().is_empty() {
        return Err(Error::Usage("a prompt is required".to_string()));
    }

    if !req.no_cache {
        if let Some(entry) = cache::lookup(config, req.scenario.as_deref(), &req.prompt) {
            info!(job = %entry.job_path.display(), "cache hit, reusing previous job");
            return Ok(StartOutcome::Cached(entry));
        }
    }

    let job = create_job(config, req, &jobs_dir(config))?;
    launch_workers(&job)?;
    Ok(StartOutcome::Started(job))
}

/// Lay out the job directory: metadata, masked prompt, and per member a
/// role-specific prompt plus an initial `queued` status record.
///
/// Does not launch anything; separated so the layout guarantee is
/// testable without spawning processes.
pub fn create_job(config: &Config, req: &StartRequest, jobs_root: &Path) -> Result<JobPaths> {
    let chairman = resolve_chairman(req.chairman.as_deref());
    let exclude_chairman = config.exclude_chairman && !req.include_chairman;

    // Unknown scenario names are not an error: dispatch the bare prompt.
    let scenario = req.scenario.as_deref().and_then(|name| {
        let found = scenario::find(name);
        if found.is_none() {
            warn!(scenario = name, "unknown scenario, dispatching bare prompt");
        }
        found
    });

    let dispatched: Vec<JobMember> = config
        .members
        .iter()
        .filter(|m| !(exclude_chairman && m.name == chairman))
        .enumerate()
        .map(|(i, spec)| {
            let role = scenario.map(|s| s.roles[i % s.roles.len()].title.to_string());
            JobMember {
                spec: spec.clone(),
                role,
            }
        })
        .collect();

    if dispatched.is_empty() {
        return Err(Error::Usage(
            "no members to dispatch to (all excluded?)".to_string(),
        ));
    }

    let now = unix_now();
    let meta = JobMeta {
        id: new_job_id(now),
        created_at: now,
        chairman,
        scenario: scenario.map(|s| s.name.to_string()),
        timeout_secs: req.timeout_secs.unwrap_or(config.timeout_secs),
        exclude_chairman,
        fingerprint: cache::fingerprint(req.scenario.as_deref(), &req.prompt),
        members: dispatched,
    };

    let job = JobPaths::new(jobs_root.join(&meta.id));
    std::fs::create_dir_all(&job.root)?;
    write_json(&job.meta(), &meta)?;
    std::fs::write(job.prompt(), mask_secrets(&req.prompt))?;

    for member in &meta.members {
        let safe = safe_member_name(&member.spec.name);
        std::fs::create_dir_all(job.member_dir(&safe))?;

        let role = member.role.as_deref().and_then(|title| {
            scenario.and_then(|s| s.roles.iter().find(|r| r.title == title))
        });
        let member_prompt = build_member_prompt(scenario, role, &req.prompt);
        std::fs::write(job.member_prompt(&safe), member_prompt)?;

        write_json(
            &job.member_status(&safe),
            &MemberStatus::queued(member.spec.name.clone(), member.role.clone(), now),
        )?;
    }

    info!(job = %meta.id, members = meta.members.len(), "job created");
    Ok(job)
}

/// Launch one detached worker process per member.
///
/// Workers are re-execs of the current executable with the hidden
/// `worker` subcommand; they must outlive this process, so stdio is
/// nulled and the children are never awaited. A member whose worker
/// cannot even be spawned is marked `error` right here — nobody else
/// will ever own its record.
pub fn launch_workers(job: &JobPaths) -> Result<()> {
    let meta = job.read_meta()?;
    let exe = std::env::current_exe()?;

    for member in &meta.members {
        let safe = safe_member_name(&member.spec.name);
        let spawned = std::process::Command::new(&exe)
            .arg("worker")
            .arg("--job")
            .arg(&job.root)
            .arg("--member")
            .arg(&safe)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match spawned {
            Ok(child) => {
                info!(job = %meta.id, member = %member.spec.name, pid = child.id(), "worker launched");
            }
            Err(e) => {
                warn!(job = %meta.id, member = %member.spec.name, error = %e, "failed to launch worker");
                merge_status(
                    &job.member_status(&safe),
                    MemberStatus {
                        state: MemberState::Error,
                        finished_at: Some(unix_now()),
                        message: Some(format!("failed to launch worker: {e}")),
                        ..MemberStatus::queued(member.spec.name.clone(), None, unix_now())
                    },
                )?;
            }
        }
    }
    Ok(())
}
