//! Single-member worker execution.
//!
//! A worker owns exactly one member of one job: it runs the member's
//! command against the dispatched prompt, streams stdout/stderr to the
//! member's output files, enforces the job timeout, classifies
//! rate-limited failures and retries once on the fallback command, and
//! records every state transition in the member's status record. It is
//! the sole writer of that record.

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::job::JobPaths;
use crate::status::{MemberState, MemberStatus, unix_now};
use crate::store::merge_status;

/// Signal used for both timeouts and external stop requests. The two are
/// disambiguated by whether this worker's own timer had already fired.
pub const TERM_SIGNAL: i32 = libc::SIGTERM;

/// Best-effort textual classifier for rate-limited failures. This is a
/// heuristic over captured stderr, not a protocol-level error code.
#[allow(clippy::unwrap_used)] // pattern is a compile-time constant
static RATE_LIMIT: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b429\b|rate limit|too many requests|resource_exhausted|quota exceeded")
        .unwrap()
});

/// Whether captured stderr looks like a rate-limit rejection.
pub fn is_rate_limited(stderr: &str) -> bool {
    RATE_LIMIT.is_match(stderr)
}

/// Outcome of one command attempt.
#[derive(Debug)]
struct AttemptOutcome {
    state: MemberState,
    exit_code: Option<i32>,
    signal: Option<i32>,
    message: Option<String>,
}

/// Run one member of `job` to a terminal outcome.
///
/// `safe_name` is the member's directory name under `members/`. Returns
/// the terminal state reached; the status record on disk is authoritative.
pub async fn run_member(job: &JobPaths, safe_name: &str) -> Result<MemberState> {
    let meta = job.read_meta()?;
    let member = meta
        .members
        .iter()
        .find(|m| crate::status::safe_member_name(&m.spec.name) == safe_name)
        .ok_or_else(|| Error::Worker(format!("member {safe_name} not in job {}", meta.id)))?
        .clone();

    let prompt = std::fs::read_to_string(job.member_prompt(safe_name))?;
    let status_path = job.member_status(safe_name);
    let timeout = meta.timeout_secs;

    info!(job = %meta.id, member = %member.spec.name, "worker starting");

    let name = &member.spec.name;
    let first = run_attempt(job, safe_name, name, &member.spec.command, &prompt, timeout).await;

    let fallback = member
        .spec
        .fallback
        .clone()
        .filter(|f| retryable(&first, Some(f.as_str()), job, safe_name));

    let outcome = if let Some(fallback) = fallback {
        info!(member = %member.spec.name, "rate limit detected, retrying on fallback command");

        // Prior output belongs to the abandoned attempt.
        truncate_outputs(job, safe_name);
        merge_status(
            &status_path,
            MemberStatus {
                state: MemberState::Retrying,
                message: Some("rate limited, retrying with fallback command".to_string()),
                original_command: Some(member.spec.command.clone()),
                fallback_command: Some(fallback.clone()),
                used_fallback: true,
                ..blank(&member.spec.name)
            },
        )?;

        // Fresh timeout budget for the second attempt; at most one retry.
        let mut second = run_attempt(job, safe_name, name, &fallback, &prompt, timeout).await;
        if second.state == MemberState::MissingCli {
            // A missing fallback binary is an execution failure of the
            // retry, not a fresh install hint.
            second.state = MemberState::Error;
        }
        second
    } else {
        first
    };

    let finished = merge_status(
        &status_path,
        MemberStatus {
            state: outcome.state,
            finished_at: Some(unix_now()),
            exit_code: outcome.exit_code,
            signal: outcome.signal,
            message: outcome.message,
            ..blank(&member.spec.name)
        },
    )?;

    info!(
        job = %meta.id,
        member = %member.spec.name,
        state = %finished.state,
        used_fallback = finished.used_fallback,
        "worker finished"
    );
    Ok(finished.state)
}

/// An attempt is retried iff it failed with a non-zero exit (not a
/// timeout or cancellation), its stderr matches the rate-limit patterns,
/// and a fallback command is configured.
fn retryable(
    outcome: &AttemptOutcome,
    fallback: Option<&str>,
    job: &JobPaths,
    safe_name: &str,
) -> bool {
    if fallback.is_none() || outcome.state != MemberState::Error {
        return false;
    }
    let stderr = std::fs::read_to_string(job.member_error(safe_name)).unwrap_or_default();
    is_rate_limited(&stderr)
}

/// Run one command attempt: spawn, stream output, enforce the deadline,
/// and map the exit to a member state. Never touches the fallback logic.
async fn run_attempt(
    job: &JobPaths,
    safe_name: &str,
    name: &str,
    command: &str,
    prompt: &str,
    timeout_secs: u64,
) -> AttemptOutcome {
    let status_path = job.member_status(safe_name);

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return AttemptOutcome {
                state: MemberState::MissingCli,
                exit_code: None,
                signal: None,
                message: Some(format!("command not found: {command}")),
            };
        }
        Err(e) => {
            return AttemptOutcome {
                state: MemberState::Error,
                exit_code: None,
                signal: None,
                message: Some(format!("failed to launch: {e}")),
            };
        }
    };

    let pid = child.id();
    let record = merge_status(
        &status_path,
        MemberStatus {
            state: MemberState::Running,
            started_at: Some(unix_now()),
            pid,
            command: Some(command.to_string()),
            ..blank(name)
        },
    );
    if let Err(e) = record {
        warn!(member = safe_name, error = %e, "failed to persist running status");
    }

    // Feed the prompt on stdin, then close it so the tool knows input is done.
    if let Some(mut stdin) = child.stdin.take() {
        let payload = prompt.as_bytes().to_vec();
        let err_path = job.member_error(safe_name);
        tokio::spawn(async move {
            // A tool that never reads stdin closes the pipe early; that is
            // normal, not a diagnostic.
            if let Err(e) = stdin.write_all(&payload).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    append_diagnostic(&err_path, &format!("stdin write failed: {e}"));
                }
            }
            drop(stdin);
        });
    }

    // Stream stdout/stderr to the member's files as bytes arrive.
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(
            stdout,
            job.member_output(safe_name).into_boxed_path(),
            job.member_error(safe_name).into_boxed_path(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(
            stderr,
            job.member_error(safe_name).into_boxed_path(),
            job.member_error(safe_name).into_boxed_path(),
        )));
    }

    // Wait for exit, arming the deadline only when a timeout is configured.
    let (status, timer_fired) = if timeout_secs > 0 {
        match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()).await {
            Ok(status) => (status, false),
            Err(_elapsed) => {
                if let Some(pid) = child.id() {
                    send_signal(pid, TERM_SIGNAL);
                }
                (child.wait().await, true)
            }
        }
    } else {
        (child.wait().await, false)
    };

    for pump in pumps {
        let _ = pump.await;
    }

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            return AttemptOutcome {
                state: MemberState::Error,
                exit_code: None,
                signal: None,
                message: Some(format!("failed waiting for process: {e}")),
            };
        }
    };

    map_exit(status, timer_fired, command)
}

/// Map a process exit to a member state.
///
/// A signal exit is `timed_out` only when this worker's own timer fired;
/// the same signal arriving from outside (a `stop` request) is `canceled`.
fn map_exit(status: std::process::ExitStatus, timer_fired: bool, command: &str) -> AttemptOutcome {
    use std::os::unix::process::ExitStatusExt;

    if let Some(sig) = status.signal() {
        let (state, message) = if timer_fired {
            (MemberState::TimedOut, "timed out".to_string())
        } else {
            (MemberState::Canceled, format!("terminated by signal {sig}"))
        };
        return AttemptOutcome {
            state,
            exit_code: None,
            signal: Some(sig),
            message: Some(message),
        };
    }

    match status.code() {
        Some(0) => AttemptOutcome {
            state: MemberState::Done,
            exit_code: Some(0),
            signal: None,
            message: None,
        },
        // The shell reports an unresolvable command as exit 127.
        Some(127) => AttemptOutcome {
            state: MemberState::MissingCli,
            exit_code: Some(127),
            signal: None,
            message: Some(format!("command not found: {command}")),
        },
        Some(code) => AttemptOutcome {
            state: MemberState::Error,
            exit_code: Some(code),
            signal: None,
            message: Some(format!("exited with code {code}")),
        },
        None => AttemptOutcome {
            state: MemberState::Error,
            exit_code: None,
            signal: None,
            message: Some("exited without a status".to_string()),
        },
    }
}

/// Copy a child stream to `path`. Stream-level I/O failures append a
/// diagnostic line to the member's error log and never abort the run.
async fn pump(
    mut src: impl AsyncRead + Unpin + Send + 'static,
    path: Box<Path>,
    diag_path: Box<Path>,
) {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await;
    match file {
        Ok(mut file) => {
            if let Err(e) = tokio::io::copy(&mut src, &mut file).await {
                append_diagnostic(&diag_path, &format!("output stream error: {e}"));
            }
        }
        Err(e) => {
            append_diagnostic(&diag_path, &format!("cannot open {}: {e}", path.display()));
        }
    }
}

fn append_diagnostic(error_log: &Path, message: &str) {
    use std::io::Write;
    let line = format!("[conclave] {message}\n");
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(error_log)
        .and_then(|mut f| f.write_all(line.as_bytes()));
    if let Err(e) = result {
        debug!(error = %e, "failed to append diagnostic to error log");
    }
}

fn truncate_outputs(job: &JobPaths, safe_name: &str) {
    for path in [job.member_output(safe_name), job.member_error(safe_name)] {
        if let Err(e) = std::fs::write(&path, b"") {
            debug!(path = %path.display(), error = %e, "failed to truncate output");
        }
    }
}

/// Send `signal` to `pid`.
pub fn send_signal(pid: u32, signal: i32) {
    // SAFETY: pid is a process ID we recorded from our own child handle or
    // a status record; kill(2) on an arbitrary pid is memory-safe.
    #[allow(unsafe_code)]
    #[allow(clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(pid as i32, signal) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!(pid, signal, error = %err, "failed to send signal");
    }
}

/// Blank status patch for merge-writes: `queued` fields all unset so the
/// existing record shows through.
fn blank(name: &str) -> MemberStatus {
    MemberStatus {
        name: name.to_string(),
        state: MemberState::Queued,
        role: None,
        queued_at: None,
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::MemberSpec;
    use crate::job::{JobMember, JobMeta, JobPaths};
    use crate::store::read_json;

    fn make_job(members: &[(&str, &str, Option<&str>)], timeout_secs: u64) -> (tempfile::TempDir, JobPaths) {
        let dir = tempfile::tempdir().unwrap();
        let job = JobPaths::new(dir.path().join("job-w"));
        let meta = JobMeta {
            id: "job-w".to_string(),
            created_at: unix_now(),
            chairman: "claude".to_string(),
            scenario: None,
            timeout_secs,
            exclude_chairman: true,
            fingerprint: String::new(),
            members: members
                .iter()
                .map(|(name, command, fallback)| JobMember {
                    spec: MemberSpec {
                        name: (*name).to_string(),
                        command: (*command).to_string(),
                        fallback: fallback.map(str::to_string),
                        emoji: String::new(),
                        color: String::new(),
                    },
                    role: Some("Reviewer".to_string()),
                })
                .collect(),
        };
        std::fs::create_dir_all(&job.root).unwrap();
        crate::store::write_json(&job.meta(), &meta).unwrap();
        for (name, _, _) in members {
            let safe = crate::status::safe_member_name(name);
            std::fs::create_dir_all(job.member_dir(&safe)).unwrap();
            std::fs::write(job.member_prompt(&safe), "say hi").unwrap();
            crate::store::write_json(
                &job.member_status(&safe),
                &MemberStatus::queued(*name, Some("Reviewer".to_string()), unix_now()),
            )
            .unwrap();
        }
        (dir, job)
    }

    #[tokio::test]
    async fn exit_zero_is_done() {
        let (_dir, job) = make_job(&[("ok", "cat > /dev/null; exit 0", None)], 30);
        let state = run_member(&job, "ok").await.unwrap();
        assert_eq!(state, MemberState::Done);

        let status: MemberStatus = read_json(&job.member_status("ok")).unwrap();
        assert_eq!(status.exit_code, Some(0));
        assert!(status.finished_at.is_some());
        assert_eq!(status.role.as_deref(), Some("Reviewer"));
        assert!(!status.used_fallback);
    }

    #[tokio::test]
    async fn output_is_streamed_to_files() {
        let (_dir, job) = make_job(&[("echoer", "echo hello; echo oops >&2", None)], 30);
        run_member(&job, "echoer").await.unwrap();
        let out = std::fs::read_to_string(job.member_output("echoer")).unwrap();
        let err = std::fs::read_to_string(job.member_error("echoer")).unwrap();
        assert_eq!(out, "hello\n");
        assert_eq!(err, "oops\n");
    }

    #[tokio::test]
    async fn worker_reads_the_dispatched_prompt() {
        let (_dir, job) = make_job(&[("cat", "cat", None)], 30);
        std::fs::write(job.member_prompt("cat"), "the actual prompt").unwrap();
        run_member(&job, "cat").await.unwrap();
        let out = std::fs::read_to_string(job.member_output("cat")).unwrap();
        assert_eq!(out, "the actual prompt");
    }

    #[tokio::test]
    async fn nonzero_exit_is_error() {
        let (_dir, job) = make_job(&[("bad", "exit 3", None)], 30);
        let state = run_member(&job, "bad").await.unwrap();
        assert_eq!(state, MemberState::Error);
        let status: MemberStatus = read_json(&job.member_status("bad")).unwrap();
        assert_eq!(status.exit_code, Some(3));
    }

    #[tokio::test]
    async fn unresolvable_command_is_missing_cli() {
        let (_dir, job) = make_job(
            &[("ghost", "definitely-not-a-real-cli-2719", None)],
            30,
        );
        let state = run_member(&job, "ghost").await.unwrap();
        assert_eq!(state, MemberState::MissingCli);
    }

    #[tokio::test]
    async fn timeout_is_timed_out_not_error() {
        let (_dir, job) = make_job(&[("slow", "sleep 30", None)], 1);
        let state = run_member(&job, "slow").await.unwrap();
        assert_eq!(state, MemberState::TimedOut);
        let status: MemberStatus = read_json(&job.member_status("slow")).unwrap();
        assert_eq!(status.signal, Some(TERM_SIGNAL));
    }

    #[tokio::test]
    async fn external_signal_without_timeout_is_canceled() {
        let (_dir, job) = make_job(&[("stopped", "sleep 30", None)], 0);
        let job_clone = JobPaths::new(job.root.clone());
        let runner = tokio::spawn(async move { run_member(&job_clone, "stopped").await });

        // Wait for the worker to record a pid, then stop it externally.
        let status_path = job.member_status("stopped");
        let pid = loop {
            if let Some(status) = read_json::<MemberStatus>(&status_path) {
                if let Some(pid) = status.pid {
                    break pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        send_signal(pid, TERM_SIGNAL);

        let state = runner.await.unwrap().unwrap();
        assert_eq!(state, MemberState::Canceled);
    }

    #[tokio::test]
    async fn external_signal_before_timeout_is_canceled() {
        // The deadline is armed but far away; the external signal must win
        // and report canceled, not timed_out.
        let (_dir, job) = make_job(&[("stopped", "sleep 30", None)], 30);
        let job_clone = JobPaths::new(job.root.clone());
        let runner = tokio::spawn(async move { run_member(&job_clone, "stopped").await });

        let status_path = job.member_status("stopped");
        let pid = loop {
            if let Some(status) = read_json::<MemberStatus>(&status_path) {
                if let Some(pid) = status.pid {
                    break pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        send_signal(pid, TERM_SIGNAL);

        let state = runner.await.unwrap().unwrap();
        assert_eq!(state, MemberState::Canceled);
    }

    #[tokio::test]
    async fn running_record_keeps_the_configured_name() {
        // A display name that differs from its directory name must never
        // leak the mangled form into the status record.
        let (_dir, job) = make_job(&[("Fancy Agent", "sleep 30", None)], 0);
        let job_clone = JobPaths::new(job.root.clone());
        let runner = tokio::spawn(async move { run_member(&job_clone, "fancy_agent").await });

        let status_path = job.member_status("fancy_agent");
        let running = loop {
            if let Some(status) = read_json::<MemberStatus>(&status_path) {
                if status.state == MemberState::Running {
                    break status;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!(running.name, "Fancy Agent");

        send_signal(running.pid.unwrap(), TERM_SIGNAL);
        let state = runner.await.unwrap().unwrap();
        assert_eq!(state, MemberState::Canceled);
        let finished: MemberStatus = read_json(&status_path).unwrap();
        assert_eq!(finished.name, "Fancy Agent");
    }

    #[tokio::test]
    async fn rate_limited_with_fallback_retries_once_to_done() {
        let (_dir, job) = make_job(
            &[(
                "limited",
                "echo '429 Too Many Requests' >&2; exit 1",
                Some("echo recovered; exit 0"),
            )],
            30,
        );
        let state = run_member(&job, "limited").await.unwrap();
        assert_eq!(state, MemberState::Done);

        let status: MemberStatus = read_json(&job.member_status("limited")).unwrap();
        assert!(status.used_fallback);
        assert_eq!(status.command.as_deref(), Some("echo recovered; exit 0"));
        assert_eq!(
            status.original_command.as_deref(),
            Some("echo '429 Too Many Requests' >&2; exit 1")
        );

        // First attempt's output was cleared before the retry.
        let out = std::fs::read_to_string(job.member_output("limited")).unwrap();
        assert_eq!(out, "recovered\n");
        let err = std::fs::read_to_string(job.member_error("limited")).unwrap();
        assert!(!err.contains("429"));
    }

    #[tokio::test]
    async fn rate_limited_without_fallback_is_error() {
        let (_dir, job) = make_job(&[("limited", "echo 'rate limit exceeded' >&2; exit 1", None)], 30);
        let state = run_member(&job, "limited").await.unwrap();
        assert_eq!(state, MemberState::Error);
        let status: MemberStatus = read_json(&job.member_status("limited")).unwrap();
        assert!(!status.used_fallback);
    }

    #[tokio::test]
    async fn failing_fallback_is_terminal_error_not_second_retry() {
        let (_dir, job) = make_job(
            &[(
                "limited",
                "echo 'quota exceeded' >&2; exit 1",
                Some("echo 'quota exceeded' >&2; exit 1"),
            )],
            30,
        );
        let state = run_member(&job, "limited").await.unwrap();
        assert_eq!(state, MemberState::Error);
        let status: MemberStatus = read_json(&job.member_status("limited")).unwrap();
        assert!(status.used_fallback);
    }

    #[test]
    fn rate_limit_classifier_patterns() {
        assert!(is_rate_limited("HTTP 429 returned"));
        assert!(is_rate_limited("Rate Limit reached, try later"));
        assert!(is_rate_limited("too many requests"));
        assert!(is_rate_limited("grpc: RESOURCE_EXHAUSTED"));
        assert!(is_rate_limited("Quota exceeded for model"));
        assert!(!is_rate_limited("connection refused"));
        assert!(!is_rate_limited("error 4290 in module"));
    }
}
