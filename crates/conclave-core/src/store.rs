//! Crash-safe status persistence.
//!
//! A record is serialized to a temp path unique to the writing process,
//! then renamed onto the target. Readers either see the previous complete
//! record or the new complete record, never a partial write. A reader that
//! finds a corrupt or missing file reports "absent" instead of failing —
//! workers may crash mid-write and the rest of the system must keep going.

use std::path::Path;

use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::status::MemberStatus;

/// Atomically write `record` as pretty JSON to `path`.
pub fn write_json<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(record)?;
    let suffix: u32 = rand::thread_rng().r#gen();
    let tmp = path.with_extension(format!("tmp.{}.{suffix:08x}", std::process::id()));
    std::fs::write(&tmp, &data)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Read a JSON record, treating missing, unreadable, or unparseable files
/// as absent.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let data = std::fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

/// Read the current status at `path` (if any), overlay `patch` on it
/// preserving unset fields, and atomically write the union back.
///
/// This is how in-flight state transitions avoid clobbering long-lived
/// metadata such as the member's assigned role.
pub fn merge_status(path: &Path, patch: MemberStatus) -> Result<MemberStatus> {
    let merged = match read_json::<MemberStatus>(path) {
        Some(existing) => existing.merged_with(patch),
        None => patch,
    };
    write_json(path, &merged)?;
    Ok(merged)
}
