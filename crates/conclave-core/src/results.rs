//! Markdown rendering of job results.
//!
//! Renders per-member output with failures called out per member; zero
//! successes is surfaced prominently but is still a render, not an
//! error. Diagnostic statistics are carried in an explicit [`RunStats`]
//! context object threaded through this path — no ambient state.

use std::fmt::Write as _;

use crate::aggregate::{StatusSummary, aggregate};
use crate::error::Result;
use crate::job::JobPaths;
use crate::status::{MemberState, MemberStatus};

/// Diagnostic counters for one reporting invocation.
#[derive(Debug, Default, Clone)]
pub struct RunStats {
    pub members_total: usize,
    pub members_succeeded: usize,
    pub fallback_retries: usize,
    /// Wall-clock seconds per member, where both timestamps exist.
    pub durations: Vec<(String, u64)>,
}

impl RunStats {
    fn collect(summary: &StatusSummary) -> Self {
        let mut stats = Self {
            members_total: summary.total,
            ..Self::default()
        };
        for member in &summary.members {
            if member.state == MemberState::Done {
                stats.members_succeeded += 1;
            }
            if member.used_fallback {
                stats.fallback_retries += 1;
            }
            if let (Some(start), Some(end)) = (member.started_at, member.finished_at) {
                stats
                    .durations
                    .push((member.name.clone(), end.saturating_sub(start)));
            }
        }
        stats
    }
}

/// Render the job's results as markdown. Also returns the stats context
/// for callers that print diagnostics.
pub fn render(job: &JobPaths) -> Result<(String, RunStats)> {
    let meta = job.read_meta()?;
    let summary = aggregate(job);
    let stats = RunStats::collect(&summary);

    let mut out = String::new();
    let _ = writeln!(out, "# Conclave results — {}", meta.id);
    if let Some(scenario) = &meta.scenario {
        let _ = writeln!(out, "\nScenario: `{scenario}`");
    }
    let _ = writeln!(
        out,
        "\nOverall: **{}** ({}/{} members succeeded)",
        summary.overall, stats.members_succeeded, stats.members_total
    );

    if stats.members_succeeded == 0 && summary.total > 0 {
        let _ = writeln!(
            out,
            "\n> **No member produced a successful answer.** Per-member failures follow."
        );
    }

    for member in &summary.members {
        let _ = writeln!(out, "\n---\n");
        let _ = writeln!(out, "## {}{}", member.name, role_suffix(member));
        let _ = writeln!(out, "\nState: `{}`{}", member.state, annotations(member));
        match member.state {
            MemberState::Done => {
                let output = read_member_file(job, &member.name, true);
                let _ = writeln!(out, "\n{}", output.trim_end());
            }
            _ => {
                if let Some(message) = &member.message {
                    let _ = writeln!(out, "\n> {message}");
                }
                let stderr = read_member_file(job, &member.name, false);
                let tail = tail_lines(&stderr, 10);
                if !tail.is_empty() {
                    let _ = writeln!(out, "\n```\n{tail}\n```");
                }
            }
        }
    }

    Ok((out, stats))
}

/// Render and write to `path`.
pub fn export(job: &JobPaths, path: &std::path::Path) -> Result<RunStats> {
    let (markdown, stats) = render(job)?;
    std::fs::write(path, markdown)?;
    Ok(stats)
}

fn role_suffix(member: &MemberStatus) -> String {
    member
        .role
        .as_deref()
        .map(|r| format!(" — {r}"))
        .unwrap_or_default()
}

fn annotations(member: &MemberStatus) -> String {
    let mut notes = Vec::new();
    if member.used_fallback {
        notes.push("used fallback command".to_string());
    }
    if let Some(code) = member.exit_code {
        if code != 0 {
            notes.push(format!("exit code {code}"));
        }
    }
    if notes.is_empty() {
        String::new()
    } else {
        format!(" ({})", notes.join(", "))
    }
}

fn read_member_file(job: &JobPaths, member_name: &str, output: bool) -> String {
    let safe = crate::status::safe_member_name(member_name);
    let path = if output {
        job.member_output(&safe)
    } else {
        job.member_error(&safe)
    };
    std::fs::read_to_string(path).unwrap_or_default()
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::status::unix_now;
    use crate::store::write_json;

    fn job_with_outcomes(outcomes: &[(&str, MemberState, &str, &str)]) -> (tempfile::TempDir, JobPaths) {
        let dir = tempfile::tempdir().unwrap();
        let job = JobPaths::new(dir.path().join("job-r"));
        std::fs::create_dir_all(&job.root).unwrap();
        write_json(
            &job.meta(),
            &crate::job::JobMeta {
                id: "job-r".to_string(),
                created_at: unix_now(),
                chairman: "claude".to_string(),
                scenario: Some("review".to_string()),
                timeout_secs: 300,
                exclude_chairman: true,
                fingerprint: String::new(),
                members: Vec::new(),
            },
        )
        .unwrap();
        for (name, state, output, stderr) in outcomes {
            std::fs::create_dir_all(job.member_dir(name)).unwrap();
            let record = MemberStatus {
                state: *state,
                started_at: Some(100),
                finished_at: Some(130),
                exit_code: Some(i32::from(*state != MemberState::Done)),
                message: (*state != MemberState::Done).then(|| "failed".to_string()),
                ..MemberStatus::queued(*name, Some("The Skeptic".to_string()), 90)
            };
            write_json(&job.member_status(name), &record).unwrap();
            std::fs::write(job.member_output(name), output).unwrap();
            std::fs::write(job.member_error(name), stderr).unwrap();
        }
        (dir, job)
    }

    #[test]
    fn render_includes_successful_output_and_failures() {
        let (_dir, job) = job_with_outcomes(&[
            ("gemini", MemberState::Done, "a fine answer", ""),
            ("codex", MemberState::Error, "", "boom\n"),
        ]);
        let (markdown, stats) = render(&job).unwrap();

        assert!(markdown.contains("# Conclave results — job-r"));
        assert!(markdown.contains("a fine answer"));
        assert!(markdown.contains("`error`"));
        assert!(markdown.contains("boom"));
        assert_eq!(stats.members_succeeded, 1);
        assert_eq!(stats.members_total, 2);
        assert_eq!(stats.durations.len(), 2);
        assert_eq!(stats.durations[0].1, 30);
    }

    #[test]
    fn zero_successes_is_called_out_not_an_error() {
        let (_dir, job) = job_with_outcomes(&[
            ("gemini", MemberState::MissingCli, "", ""),
            ("codex", MemberState::TimedOut, "", ""),
        ]);
        let (markdown, stats) = render(&job).unwrap();
        assert!(markdown.contains("No member produced a successful answer"));
        assert_eq!(stats.members_succeeded, 0);
    }

    #[test]
    fn export_writes_the_markdown() {
        let (dir, job) = job_with_outcomes(&[("gemini", MemberState::Done, "answer", "")]);
        let path = dir.path().join("out.md");
        export(&job, &path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("answer"));
    }
}
