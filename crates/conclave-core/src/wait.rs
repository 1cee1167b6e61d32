//! Cursor-based long-poll over aggregate job status.
//!
//! Progress is quantized into buckets so a caller polling a 15-member job
//! sees roughly five meaningful updates instead of fifteen. The cursor is
//! an opaque resumption token; callers pass back the last one they saw
//! (or nothing, to resume from the per-job bookkeeping file) and the wait
//! call blocks until the freshly computed cursor differs.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::aggregate::{OverallState, StatusSummary, aggregate};
use crate::error::Result;
use crate::job::JobPaths;
use crate::status::MemberState;

/// Floor for the poll interval; callers cannot spin faster than this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Number of meaningful updates to aim for over a whole job when the
/// caller does not pick a bucket size.
const TARGET_UPDATES: usize = 5;

/// Opaque progress token for the wait protocol.
///
/// Two cursors compare equal iff all four fields match; equality means
/// "no meaningful change".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitCursor {
    /// Bucket size the done-bucket was computed with.
    pub bucket_size: usize,
    /// Set once no member remains `queued`. Deliberately binary: it never
    /// reflects partial dispatch progress.
    pub dispatched: bool,
    /// `floor(terminal member count / bucket_size)`.
    pub done_bucket: usize,
    /// Set once the overall state is `done`.
    pub terminal: bool,
}

impl WaitCursor {
    /// Compute the cursor for a status snapshot at a given bucket size.
    pub fn from_summary(summary: &StatusSummary, bucket_size: usize) -> Self {
        let bucket_size = bucket_size.max(1);
        Self {
            bucket_size,
            dispatched: summary.count(MemberState::Queued) == 0,
            done_bucket: summary.terminal_count() / bucket_size,
            terminal: summary.overall == OverallState::Done,
        }
    }

    /// Auto-sized bucket: roughly [`TARGET_UPDATES`] updates per job,
    /// minimum 1.
    pub fn default_bucket_size(total_members: usize) -> usize {
        total_members.div_ceil(TARGET_UPDATES).max(1)
    }

    /// Serialize to the token form `c1.<bucket>.<dispatch>.<done>.<term>`.
    pub fn encode(&self) -> String {
        format!(
            "c1.{}.{}.{}.{}",
            self.bucket_size,
            u8::from(self.dispatched),
            self.done_bucket,
            u8::from(self.terminal),
        )
    }

    /// Parse a token. Anything unrecognisable is `None` — the protocol
    /// treats a bad token the same as no token at all.
    pub fn parse(token: &str) -> Option<Self> {
        let rest = token.strip_prefix("c1.")?;
        let mut parts = rest.split('.');
        let bucket_size: usize = parts.next()?.parse().ok()?;
        let dispatched = match parts.next()? {
            "0" => false,
            "1" => true,
            _ => return None,
        };
        let done_bucket: usize = parts.next()?.parse().ok()?;
        let terminal = match parts.next()? {
            "0" => false,
            "1" => true,
            _ => return None,
        };
        if parts.next().is_some() || bucket_size == 0 {
            return None;
        }
        Some(Self {
            bucket_size,
            dispatched,
            done_bucket,
            terminal,
        })
    }
}

/// Options for one wait call.
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// Cursor from a previous call. `None` resumes from the job's
    /// bookkeeping file (or returns immediately on a true first call).
    pub cursor: Option<String>,
    /// Poll interval; floored to [`MIN_POLL_INTERVAL`].
    pub poll_interval: Option<Duration>,
    /// Overall deadline; when it elapses the latest snapshot is returned
    /// even if nothing changed.
    pub timeout: Option<Duration>,
}

/// Block until the aggregate status changes meaningfully relative to the
/// supplied (or persisted) cursor, then return the latest snapshot and a
/// fresh cursor.
///
/// Performs no mutation of the job beyond rewriting the bookkeeping
/// cursor file.
pub async fn wait_for_change(
    job: &JobPaths,
    opts: &WaitOptions,
) -> Result<(StatusSummary, WaitCursor)> {
    let previous = opts
        .cursor
        .as_deref()
        .and_then(WaitCursor::parse)
        .or_else(|| read_persisted_cursor(job));

    let summary = aggregate(job);
    let bucket_size = previous.map_or_else(
        || WaitCursor::default_bucket_size(summary.total),
        |c| c.bucket_size,
    );
    let current = WaitCursor::from_summary(&summary, bucket_size);

    // First call, or the world already moved past the caller's cursor.
    let Some(previous) = previous else {
        persist_cursor(job, current);
        return Ok((summary, current));
    };
    if current != previous {
        persist_cursor(job, current);
        return Ok((summary, current));
    }

    let interval = opts
        .poll_interval
        .unwrap_or(MIN_POLL_INTERVAL)
        .max(MIN_POLL_INTERVAL);
    let deadline = opts.timeout.map(|t| Instant::now() + t);

    loop {
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                debug!(job = %job.root.display(), "wait deadline elapsed without change");
                break;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        } else {
            tokio::time::sleep(interval).await;
        }

        let summary = aggregate(job);
        let cursor = WaitCursor::from_summary(&summary, bucket_size);
        if cursor != previous {
            persist_cursor(job, cursor);
            return Ok((summary, cursor));
        }
    }

    let summary = aggregate(job);
    let cursor = WaitCursor::from_summary(&summary, bucket_size);
    persist_cursor(job, cursor);
    Ok((summary, cursor))
}

fn read_persisted_cursor(job: &JobPaths) -> Option<WaitCursor> {
    let token = std::fs::read_to_string(job.cursor()).ok()?;
    WaitCursor::parse(token.trim())
}

fn persist_cursor(job: &JobPaths, cursor: WaitCursor) {
    if let Err(e) = std::fs::write(job.cursor(), cursor.encode()) {
        debug!(job = %job.root.display(), error = %e, "failed to persist wait cursor");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::status::{MemberStatus, unix_now};

    fn job_with(states: &[(&str, MemberState)]) -> (tempfile::TempDir, JobPaths) {
        let dir = tempfile::tempdir().unwrap();
        let job = JobPaths::new(dir.path().join("job-t"));
        std::fs::create_dir_all(&job.root).unwrap();
        for (name, state) in states {
            set_state(&job, name, *state);
        }
        (dir, job)
    }

    fn set_state(job: &JobPaths, name: &str, state: MemberState) {
        std::fs::create_dir_all(job.member_dir(name)).unwrap();
        let record = MemberStatus {
            state,
            ..MemberStatus::queued(name, None, unix_now())
        };
        crate::store::write_json(&job.member_status(name), &record).unwrap();
    }

    #[test]
    fn bucket_sizing_targets_five_updates() {
        assert_eq!(WaitCursor::default_bucket_size(0), 1);
        assert_eq!(WaitCursor::default_bucket_size(3), 1);
        assert_eq!(WaitCursor::default_bucket_size(5), 1);
        assert_eq!(WaitCursor::default_bucket_size(6), 2);
        assert_eq!(WaitCursor::default_bucket_size(12), 3);
    }

    #[test]
    fn token_round_trip() {
        let cursor = WaitCursor {
            bucket_size: 2,
            dispatched: true,
            done_bucket: 3,
            terminal: false,
        };
        assert_eq!(cursor.encode(), "c1.2.1.3.0");
        assert_eq!(WaitCursor::parse("c1.2.1.3.0"), Some(cursor));
    }

    #[test]
    fn bad_tokens_parse_as_none() {
        for token in ["", "c1", "c1.2.1.3", "c2.2.1.3.0", "c1.0.1.3.0", "c1.2.9.3.0", "c1.2.1.3.0.9", "junk"] {
            assert_eq!(WaitCursor::parse(token), None, "token {token:?}");
        }
    }

    #[tokio::test]
    async fn first_call_returns_immediately() {
        let (_dir, job) = job_with(&[("a", MemberState::Queued), ("b", MemberState::Queued)]);
        let started = Instant::now();
        let (summary, cursor) = wait_for_change(&job, &WaitOptions::default()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(summary.total, 2);
        assert!(!cursor.dispatched);
        assert!(!cursor.terminal);
        // The cursor is now persisted for cursor-less resumption.
        assert!(job.cursor().exists());
    }

    #[tokio::test]
    async fn stale_cursor_returns_immediately() {
        let (_dir, job) = job_with(&[("a", MemberState::Done)]);
        let stale = WaitCursor {
            bucket_size: 1,
            dispatched: false,
            done_bucket: 0,
            terminal: false,
        };
        let opts = WaitOptions {
            cursor: Some(stale.encode()),
            ..WaitOptions::default()
        };
        let started = Instant::now();
        let (_, cursor) = wait_for_change(&job, &opts).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(cursor.terminal);
        assert_ne!(cursor, stale);
    }

    #[tokio::test]
    async fn unchanged_job_waits_until_deadline_and_is_idempotent() {
        let (_dir, job) = job_with(&[("a", MemberState::Running)]);
        let (_, first) = wait_for_change(&job, &WaitOptions::default()).await.unwrap();

        let opts = WaitOptions {
            cursor: Some(first.encode()),
            timeout: Some(Duration::from_millis(300)),
            ..WaitOptions::default()
        };
        let (_, second) = wait_for_change(&job, &opts).await.unwrap();
        let (_, third) = wait_for_change(&job, &opts).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(third, second);
    }

    #[tokio::test]
    async fn wait_unblocks_on_state_transition() {
        let (_dir, job) = job_with(&[("a", MemberState::Running)]);
        let (_, cursor) = wait_for_change(&job, &WaitOptions::default()).await.unwrap();
        assert!(!cursor.terminal);

        let mover = JobPaths::new(job.root.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            set_state(&mover, "a", MemberState::Done);
        });

        let opts = WaitOptions {
            cursor: Some(cursor.encode()),
            timeout: Some(Duration::from_secs(5)),
            ..WaitOptions::default()
        };
        let (summary, cursor) = wait_for_change(&job, &opts).await.unwrap();
        assert!(cursor.terminal);
        assert_eq!(summary.count(MemberState::Done), 1);
    }

    #[tokio::test]
    async fn omitted_cursor_resumes_from_persisted_token() {
        let (_dir, job) = job_with(&[("a", MemberState::Running)]);
        let (_, first) = wait_for_change(&job, &WaitOptions::default()).await.unwrap();

        // No cursor supplied: the persisted one keeps us blocked until the
        // deadline, and the result still compares equal (nothing moved).
        let opts = WaitOptions {
            timeout: Some(Duration::from_millis(300)),
            ..WaitOptions::default()
        };
        let started = Instant::now();
        let (_, second) = wait_for_change(&job, &opts).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(second, first);
    }
}
