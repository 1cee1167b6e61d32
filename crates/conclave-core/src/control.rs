//! External stop control.
//!
//! `stop` signals the pid recorded in each running member's status. It
//! never touches the status records themselves: the worker owning each
//! member observes the signal-exit of its child and records `canceled`
//! (its own timer has not fired, which is exactly how a stop is told
//! apart from a timeout).

use tracing::info;

use crate::error::Result;
use crate::job::JobPaths;
use crate::status::MemberState;
use crate::worker::{TERM_SIGNAL, send_signal};

/// Send the termination signal to every running member of `job`.
///
/// Returns the member names that were signalled. Absent or corrupt
/// status records are skipped.
pub fn stop_job(job: &JobPaths) -> Result<Vec<String>> {
    let summary = crate::aggregate::aggregate(job);
    let mut signalled = Vec::new();
    for member in &summary.members {
        if member.state != MemberState::Running {
            continue;
        }
        if let Some(pid) = member.pid {
            info!(member = %member.name, pid, "sending stop signal");
            send_signal(pid, TERM_SIGNAL);
            signalled.push(member.name.clone());
        }
    }
    Ok(signalled)
}
