//! Rolling backups of the state file.
//!
//! Backups live in `<state dir>/backups/` and are named
//! `<stem>-<UTC timestamp>-<6 hex>.json`. The timestamp in the name is the
//! source of truth for ordering and age.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::fs;
use trellis_engine::Timestamp;

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

/// A backup file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub path: PathBuf,
    /// Milliseconds since the Unix epoch
    pub created_at: Timestamp,
}

fn backup_name(stem: &str, at: DateTime<Utc>) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("{stem}-{}-{suffix:06x}.json", at.format(TIMESTAMP_FORMAT))
}

/// Parse the creation time out of a backup file name.
fn parse_created_at(stem: &str, file_name: &str) -> Option<Timestamp> {
    let rest = file_name.strip_prefix(stem)?.strip_prefix('-')?;
    let rest = rest.strip_suffix(".json")?;
    let (timestamp, suffix) = rest.rsplit_once('-')?;
    if suffix.len() != 6 || !suffix.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let parsed = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
    u64::try_from(parsed.and_utc().timestamp_millis()).ok()
}

/// Copy `source` into `dir` as a new backup.
pub(crate) async fn create(dir: &Path, stem: &str, source: &Path) -> io::Result<BackupEntry> {
    fs::create_dir_all(dir).await?;
    let now = Utc::now();
    let path = dir.join(backup_name(stem, now));
    fs::copy(source, &path).await?;
    Ok(BackupEntry {
        path,
        created_at: u64::try_from(now.timestamp_millis()).unwrap_or(0),
    })
}

/// Backups for `stem`, newest first. A missing directory means no backups.
pub(crate) async fn list(dir: &Path, stem: &str) -> io::Result<Vec<BackupEntry>> {
    let mut read = match fs::read_dir(dir).await {
        Ok(read) => read,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut backups = Vec::new();
    while let Some(entry) = read.next_entry().await? {
        let name = entry.file_name();
        let Some(created_at) = name.to_str().and_then(|n| parse_created_at(stem, n)) else {
            continue;
        };
        backups.push(BackupEntry {
            path: entry.path(),
            created_at,
        });
    }

    backups.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.path.cmp(&a.path))
    });
    Ok(backups)
}

/// Delete backups beyond `max_count` or older than `max_age`.
///
/// Returns how many were removed.
pub(crate) async fn prune(
    dir: &Path,
    stem: &str,
    max_count: usize,
    max_age: Duration,
    now: Timestamp,
) -> io::Result<usize> {
    let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
    let mut removed = 0;

    for (index, backup) in list(dir, stem).await?.into_iter().enumerate() {
        let too_old = now.saturating_sub(backup.created_at) > max_age_ms;
        if index >= max_count || too_old {
            fs::remove_file(&backup.path).await?;
            tracing::debug!(backup = %backup.path.display(), "Pruned backup");
            removed += 1;
        }
    }

    Ok(removed)
}
