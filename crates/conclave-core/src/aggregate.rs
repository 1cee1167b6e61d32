//! Aggregate status over a job directory.
//!
//! A pure fold over `members/*/status.json`. Safe to call arbitrarily
//! often while workers are still writing: a record mid-write reads as
//! absent for that pass and shows up on the next one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::job::JobPaths;
use crate::status::{MemberState, MemberStatus};

/// Overall job state derived from member states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallState {
    Queued,
    Running,
    Done,
}

impl std::fmt::Display for OverallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
        })
    }
}

/// Snapshot of every member's state plus the derived overall state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSummary {
    pub overall: OverallState,
    pub total: usize,
    /// Count per state, keyed by the persisted snake_case state name.
    pub counts: BTreeMap<String, usize>,
    pub members: Vec<MemberStatus>,
}

impl StatusSummary {
    pub fn count(&self, state: MemberState) -> usize {
        self.counts.get(state.as_str()).copied().unwrap_or(0)
    }

    /// Members in any terminal state.
    pub fn terminal_count(&self) -> usize {
        self.members.iter().filter(|m| m.state.is_terminal()).count()
    }
}

/// Tally every member status under `job` into a summary.
///
/// Member directories whose record is missing or unparseable are counted
/// as `queued` — the initial record simply has not landed (or has been
/// half-replaced) yet.
pub fn aggregate(job: &JobPaths) -> StatusSummary {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for state in MemberState::ALL {
        counts.insert(state.as_str().to_string(), 0);
    }

    let mut members = Vec::new();
    for safe_name in job.member_names() {
        let status = crate::store::read_json::<MemberStatus>(&job.member_status(&safe_name))
            .unwrap_or_else(|| MemberStatus::queued(safe_name.clone(), None, 0));
        if let Some(n) = counts.get_mut(status.state.as_str()) {
            *n += 1;
        }
        members.push(status);
    }

    // `retrying` is between attempts, not terminal: treat it as running.
    let any_active = members
        .iter()
        .any(|m| matches!(m.state, MemberState::Running | MemberState::Retrying));
    let any_queued = members.iter().any(|m| m.state == MemberState::Queued);

    let overall = if any_active {
        OverallState::Running
    } else if any_queued || members.is_empty() {
        OverallState::Queued
    } else {
        OverallState::Done
    };

    StatusSummary {
        overall,
        total: members.len(),
        counts,
        members,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::status::unix_now;

    fn job_with(states: &[(&str, MemberState)]) -> (tempfile::TempDir, JobPaths) {
        let dir = tempfile::tempdir().unwrap();
        let job = JobPaths::new(dir.path().join("job-t"));
        for (name, state) in states {
            let member_dir = job.member_dir(name);
            std::fs::create_dir_all(&member_dir).unwrap();
            let record = MemberStatus {
                state: *state,
                ..MemberStatus::queued(*name, None, unix_now())
            };
            crate::store::write_json(&job.member_status(name), &record).unwrap();
        }
        (dir, job)
    }

    #[test]
    fn all_queued_is_queued() {
        let (_dir, job) = job_with(&[
            ("claude", MemberState::Queued),
            ("gemini", MemberState::Queued),
        ]);
        let summary = aggregate(&job);
        assert_eq!(summary.overall, OverallState::Queued);
        assert_eq!(summary.count(MemberState::Queued), 2);
        assert_eq!(summary.total, 2);
    }

    #[test]
    fn any_running_is_running() {
        let (_dir, job) = job_with(&[
            ("claude", MemberState::Done),
            ("gemini", MemberState::Running),
        ]);
        assert_eq!(aggregate(&job).overall, OverallState::Running);
    }

    #[test]
    fn retrying_counts_as_active() {
        let (_dir, job) = job_with(&[
            ("claude", MemberState::Done),
            ("gemini", MemberState::Retrying),
        ]);
        assert_eq!(aggregate(&job).overall, OverallState::Running);
    }

    #[test]
    fn all_terminal_is_done_even_with_failures() {
        let (_dir, job) = job_with(&[
            ("claude", MemberState::MissingCli),
            ("gemini", MemberState::MissingCli),
            ("codex", MemberState::MissingCli),
        ]);
        let summary = aggregate(&job);
        assert_eq!(summary.overall, OverallState::Done);
        assert_eq!(summary.count(MemberState::MissingCli), 3);
        assert_eq!(summary.count(MemberState::Done), 0);
        assert_eq!(summary.terminal_count(), 3);
    }

    #[test]
    fn mixed_terminal_states_are_done() {
        let (_dir, job) = job_with(&[
            ("fast", MemberState::Done),
            ("slow", MemberState::TimedOut),
        ]);
        let summary = aggregate(&job);
        assert_eq!(summary.overall, OverallState::Done);
        assert_eq!(summary.count(MemberState::Done), 1);
        assert_eq!(summary.count(MemberState::TimedOut), 1);
    }

    #[test]
    fn corrupt_record_reads_as_queued() {
        let (_dir, job) = job_with(&[("claude", MemberState::Done)]);
        let gemini_dir = job.member_dir("gemini");
        std::fs::create_dir_all(&gemini_dir).unwrap();
        std::fs::write(job.member_status("gemini"), b"{trunc").unwrap();

        let summary = aggregate(&job);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.count(MemberState::Queued), 1);
        assert_eq!(summary.overall, OverallState::Queued);
    }
}
