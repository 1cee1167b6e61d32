//! On-disk member status model.
//!
//! One `MemberStatus` record lives at `members/<safe-name>/status.json`
//! inside a job directory. The record has exactly one writer (the worker
//! process that owns that member); everyone else only reads it.

use serde::{Deserialize, Serialize};

/// State machine for a single member.
///
/// `queued → running → {done, error, missing_cli, timed_out, canceled}`
/// with a single optional `running → retrying → running` loop when a
/// rate-limited attempt is retried on the fallback command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Queued,
    Running,
    Retrying,
    Done,
    Error,
    MissingCli,
    TimedOut,
    Canceled,
}

impl MemberState {
    /// All states, in the order summaries report them.
    pub const ALL: [Self; 8] = [
        Self::Queued,
        Self::Running,
        Self::Retrying,
        Self::Done,
        Self::Error,
        Self::MissingCli,
        Self::TimedOut,
        Self::Canceled,
    ];

    /// Terminal states admit no further transition (except the one
    /// modeled `retrying` loop, which never leaves a terminal state).
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::Error | Self::MissingCli | Self::TimedOut | Self::Canceled
        )
    }

    /// Stable snake_case name, as persisted.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Done => "done",
            Self::Error => "error",
            Self::MissingCli => "missing_cli",
            Self::TimedOut => "timed_out",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted status record for one member of a job.
///
/// Every field except `name` and `state` is optional so that partial
/// records can be merge-written without clobbering what an earlier
/// transition recorded (in particular `role`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub name: String,
    pub state: MemberState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Unix epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
    /// OS process id of the member's command while it runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Signal number that terminated the process, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Human-readable note about the current state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Command actually in effect (replaced by the fallback on retry).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_command: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub used_fallback: bool,
}

impl MemberStatus {
    /// A fresh record in `queued` state.
    pub fn queued(name: impl Into<String>, role: Option<String>, now: u64) -> Self {
        Self {
            name: name.into(),
            state: MemberState::Queued,
            role,
            queued_at: Some(now),
            started_at: None,
            finished_at: None,
            pid: None,
            exit_code: None,
            signal: None,
            message: None,
            command: None,
            original_command: None,
            fallback_command: None,
            used_fallback: false,
        }
    }

    /// Overlay `patch` onto `self`, keeping any field the patch does not
    /// set. `name` is identity: once recorded it never changes. `role`
    /// likewise must survive every overwrite.
    pub fn merged_with(mut self, patch: Self) -> Self {
        self.state = patch.state;
        self.used_fallback = self.used_fallback || patch.used_fallback;
        if self.name.is_empty() {
            self.name = patch.name;
        }
        self.role = patch.role.or(self.role);
        self.queued_at = patch.queued_at.or(self.queued_at);
        self.started_at = patch.started_at.or(self.started_at);
        self.finished_at = patch.finished_at.or(self.finished_at);
        self.pid = patch.pid.or(self.pid);
        self.exit_code = patch.exit_code.or(self.exit_code);
        self.signal = patch.signal.or(self.signal);
        self.message = patch.message.or(self.message);
        self.command = patch.command.or(self.command);
        self.original_command = patch.original_command.or(self.original_command);
        self.fallback_command = patch.fallback_command.or(self.fallback_command);
        self
    }
}

/// Filesystem-safe directory name for a member.
///
/// Lowercases and keeps `[a-z0-9_-]`; everything else becomes `_`.
pub fn safe_member_name(name: &str) -> String {
    let safe: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() { "_".to_string() } else { safe }
}

/// Current unix time in whole seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn states_serialize_snake_case() {
        let json = serde_json::to_string(&MemberState::MissingCli).unwrap();
        assert_eq!(json, "\"missing_cli\"");
        let back: MemberState = serde_json::from_str("\"timed_out\"").unwrap();
        assert_eq!(back, MemberState::TimedOut);
    }

    #[test]
    fn terminal_states() {
        assert!(MemberState::Done.is_terminal());
        assert!(MemberState::MissingCli.is_terminal());
        assert!(MemberState::Canceled.is_terminal());
        assert!(!MemberState::Queued.is_terminal());
        assert!(!MemberState::Running.is_terminal());
        assert!(!MemberState::Retrying.is_terminal());
    }

    #[test]
    fn merge_preserves_role() {
        let base = MemberStatus::queued("claude", Some("The Pragmatist".into()), 100);
        let patch = MemberStatus {
            state: MemberState::Running,
            started_at: Some(101),
            pid: Some(4242),
            ..MemberStatus::queued("claude", None, 100)
        };
        let merged = base.merged_with(patch);
        assert_eq!(merged.state, MemberState::Running);
        assert_eq!(merged.role.as_deref(), Some("The Pragmatist"));
        assert_eq!(merged.pid, Some(4242));
        assert_eq!(merged.queued_at, Some(100));
    }

    #[test]
    fn merge_never_renames_an_existing_record() {
        let base = MemberStatus::queued("Fancy Agent", Some("The Judge".into()), 5);
        let patch = MemberStatus {
            state: MemberState::Running,
            pid: Some(101),
            ..MemberStatus::queued("fancy_agent", None, 5)
        };
        let merged = base.merged_with(patch);
        assert_eq!(merged.name, "Fancy Agent");
        assert_eq!(merged.state, MemberState::Running);
    }

    #[test]
    fn merge_keeps_used_fallback_sticky() {
        let mut base = MemberStatus::queued("gemini", None, 1);
        base.used_fallback = true;
        let patch = MemberStatus {
            state: MemberState::Done,
            ..MemberStatus::queued("gemini", None, 1)
        };
        assert!(base.merged_with(patch).used_fallback);
    }

    #[test]
    fn safe_names() {
        assert_eq!(safe_member_name("Claude"), "claude");
        assert_eq!(safe_member_name("gpt 4.1/turbo"), "gpt_4_1_turbo");
        assert_eq!(safe_member_name("codex-cli"), "codex-cli");
        assert_eq!(safe_member_name(""), "_");
    }
}
