//! Offline spool
//!
//! Posts written while the store is unreachable are appended to a local
//! JSON-lines file and later synced into the store as `offline` posts. The
//! spool only ever creates posts; it never publishes anything itself.

use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::SpoolConfig;
use crate::error::{CrosspostError, Result};
use crate::types::{NewPost, Source};
use crate::Database;

/// One captured post waiting to be synced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoolEntry {
    /// Becomes the post ID, so a repeated sync cannot duplicate a post
    pub id: String,
    pub captured_at: i64,
    pub post: NewPost,
}

/// Result of a sync run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub synced: usize,
    /// Already present in the store from an earlier, interrupted sync
    pub already_present: usize,
    /// Unreadable lines and posts the store refused, set aside in the
    /// rejected file
    pub rejected: Vec<String>,
    /// Entries left in the syncing file after a store failure
    pub remaining: usize,
}

pub struct Spool {
    path: PathBuf,
}

impl Spool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_config(config: &SpoolConfig) -> Self {
        Self::new(shellexpand::tilde(&config.path).to_string())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate and append a post to the spool
    pub fn push(&self, mut post: NewPost, now: i64) -> Result<SpoolEntry> {
        post.validate()?;
        post.source = Source::Offline;

        let entry = SpoolEntry {
            id: Uuid::new_v4().to_string(),
            captured_at: now,
            post,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let line = serde_json::to_string(&entry)
            .map_err(|e| CrosspostError::InvalidInput(format!("cannot spool post: {}", e)))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;

        tracing::info!(entry_id = %entry.id, "Spooled post for later sync");
        Ok(entry)
    }

    /// Spooled posts that are being synced right now, or whose sync was
    /// interrupted
    pub fn syncing_path(&self) -> PathBuf {
        self.sibling(".syncing")
    }

    /// Lines and posts that could not be synced; kept for manual repair
    pub fn rejected_path(&self) -> PathBuf {
        self.sibling(".rejected")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// All spooled entries, oldest first. Unreadable lines are skipped.
    pub fn entries(&self) -> Result<Vec<SpoolEntry>> {
        let mut entries = Vec::new();
        for path in [self.syncing_path(), self.path.clone()] {
            if let Some(content) = read_optional(&path)? {
                let (parsed, unreadable) = parse_lines(&content);
                for (number, _, error) in unreadable {
                    tracing::warn!(
                        "Skipping unreadable spool line {} in {}: {}",
                        number,
                        path.display(),
                        error
                    );
                }
                entries.extend(parsed.into_iter().map(|(_, entry)| entry));
            }
        }
        Ok(entries)
    }

    /// Move every spooled post into the store.
    ///
    /// The spool file is renamed aside before it is read, so posts pushed
    /// while a sync runs land in a fresh spool for the next sync. Lines that
    /// cannot be parsed and posts the store refuses are appended to
    /// [`Spool::rejected_path`]. If the store fails midway the unsynced rest
    /// stays in [`Spool::syncing_path`] and the error is returned.
    pub async fn sync(&self, db: &Database, now: i64) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();
        let syncing = self.syncing_path();

        // Leftovers from an interrupted sync go first
        if syncing.exists() {
            self.sync_file(db, &syncing, now, &mut summary).await?;
        }

        match fs::rename(&self.path, &syncing) {
            Ok(()) => self.sync_file(db, &syncing, now, &mut summary).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if !summary.rejected.is_empty() {
            tracing::warn!(
                count = summary.rejected.len(),
                "Kept unsyncable spool lines in {}",
                self.rejected_path().display()
            );
        }
        Ok(summary)
    }

    async fn sync_file(
        &self,
        db: &Database,
        file: &Path,
        now: i64,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        let content = read_optional(file)?.unwrap_or_default();
        let (entries, unreadable) = parse_lines(&content);

        for (number, line, error) in unreadable {
            self.reject(line)?;
            summary
                .rejected
                .push(format!("line {}: unreadable ({})", number, error));
        }

        for (index, (line, entry)) in entries.iter().enumerate() {
            match self.sync_entry(db, entry, now).await {
                Ok(true) => summary.synced += 1,
                Ok(false) => summary.already_present += 1,
                Err(CrosspostError::InvalidInput(reason)) => {
                    tracing::warn!(entry_id = %entry.id, "Setting spooled post aside: {}", reason);
                    self.reject(line)?;
                    summary.rejected.push(format!("{}: {}", entry.id, reason));
                }
                Err(e) => {
                    let rest: Vec<SpoolEntry> =
                        entries[index..].iter().map(|(_, e)| e.clone()).collect();
                    summary.remaining = rest.len();
                    rewrite(file, &rest)?;
                    return Err(e);
                }
            }
        }

        // A writer that opened the spool just before the rename may have
        // appended after the read; hand those lines back to the spool
        let latest = read_optional(file)?.unwrap_or_default();
        if let Some(tail) = latest.get(content.len()..) {
            if !tail.trim().is_empty() {
                append(&self.path, tail)?;
            }
        }

        match fs::remove_file(file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn reject(&self, line: &str) -> Result<()> {
        append(&self.rejected_path(), &format!("{}\n", line))
    }

    async fn sync_entry(&self, db: &Database, entry: &SpoolEntry, now: i64) -> Result<bool> {
        if db.get(&entry.id).await?.is_some() {
            return Ok(false);
        }

        entry.post.validate()?;
        let mut post = entry.post.clone().into_post(now);
        post.id = entry.id.clone();
        post.source = Source::Offline;
        post.created_at = entry.captured_at;
        db.insert(&post).await?;

        tracing::info!(post_id = %post.id, status = %post.status, "Synced spooled post");
        Ok(true)
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

type Unreadable<'a> = (usize, &'a str, String);

/// Parsed entries with their raw line, and unreadable lines with their
/// 1-based line number and parse error
fn parse_lines(content: &str) -> (Vec<(&str, SpoolEntry)>, Vec<Unreadable<'_>>) {
    let mut entries = Vec::new();
    let mut unreadable = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SpoolEntry>(line) {
            Ok(entry) => entries.push((line, entry)),
            Err(e) => unreadable.push((index + 1, line, e.to_string())),
        }
    }
    (entries, unreadable)
}

fn append(path: &Path, text: &str) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(text.as_bytes())?;
    Ok(())
}

/// Replace a spool file's contents atomically
fn rewrite(path: &Path, entries: &[SpoolEntry]) -> Result<()> {
    let mut tmp = path.to_path_buf().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = fs::File::create(&tmp)?;
        for entry in entries {
            let line = serde_json::to_string(entry)
                .map_err(|e| CrosspostError::InvalidInput(format!("cannot spool post: {}", e)))?;
            writeln!(file, "{}", line)?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PlatformKind, PostStatus};
    use tempfile::TempDir;

    const NOW: i64 = 1_750_000_000;

    fn spool_in(temp: &TempDir) -> Spool {
        Spool::new(temp.path().join("nested").join("spool.jsonl"))
    }

    #[test]
    fn test_push_and_read_back() {
        let temp = TempDir::new().unwrap();
        let spool = spool_in(&temp);
        assert!(spool.entries().unwrap().is_empty());

        let first = spool
            .push(NewPost::new("first", PlatformKind::X), NOW)
            .unwrap();
        spool
            .push(NewPost::new("second", PlatformKind::Note).scheduled_for(NOW + 60), NOW + 1)
            .unwrap();

        let entries = spool.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], first);
        assert_eq!(entries[0].post.source, Source::Offline);
        assert_eq!(entries[1].post.scheduled_for, Some(NOW + 60));
    }

    #[test]
    fn test_push_rejects_invalid_post() {
        let temp = TempDir::new().unwrap();
        let spool = spool_in(&temp);
        assert!(spool
            .push(NewPost::new("a".repeat(281), PlatformKind::X), NOW)
            .is_err());
        assert!(!spool.path().exists());
    }

    #[test]
    fn test_unreadable_lines_are_skipped() {
        let temp = TempDir::new().unwrap();
        let spool = spool_in(&temp);
        spool.push(NewPost::new("ok", PlatformKind::X), NOW).unwrap();

        let mut file = OpenOptions::new().append(true).open(spool.path()).unwrap();
        writeln!(file, "{{not json").unwrap();

        assert_eq!(spool.entries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_moves_entries_into_store() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("posts.db").to_string_lossy())
            .await
            .unwrap();
        let spool = spool_in(&temp);

        let draft = spool.push(NewPost::new("draft", PlatformKind::Wordpress), NOW).unwrap();
        let scheduled = spool
            .push(NewPost::new("scheduled", PlatformKind::X).scheduled_for(NOW + 60), NOW)
            .unwrap();

        let summary = spool.sync(&db, NOW + 5).await.unwrap();
        assert_eq!(summary.synced, 2);
        assert!(summary.rejected.is_empty());
        assert!(!spool.path().exists());

        let stored = db.get(&draft.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Draft);
        assert_eq!(stored.source, Source::Offline);
        assert_eq!(stored.created_at, NOW);

        let stored = db.get(&scheduled.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Pending);

        // Nothing left to do on a second run
        let again = spool.sync(&db, NOW + 10).await.unwrap();
        assert_eq!(again, SyncSummary::default());
    }

    #[tokio::test]
    async fn test_sync_skips_entries_already_in_store() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("posts.db").to_string_lossy())
            .await
            .unwrap();
        let spool = spool_in(&temp);
        let entry = spool.push(NewPost::new("once", PlatformKind::Note), NOW).unwrap();

        // Simulate a sync that stored the post but died before clearing the spool
        let mut post = entry.post.clone().into_post(NOW);
        post.id = entry.id.clone();
        db.insert(&post).await.unwrap();

        let summary = spool.sync(&db, NOW).await.unwrap();
        assert_eq!(summary.synced, 0);
        assert_eq!(summary.already_present, 1);
        assert_eq!(db.stats().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_sync_keeps_corrupt_lines_aside() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("posts.db").to_string_lossy())
            .await
            .unwrap();
        let spool = spool_in(&temp);
        let good = spool.push(NewPost::new("good", PlatformKind::X), NOW).unwrap();

        let mut file = OpenOptions::new().append(true).open(spool.path()).unwrap();
        writeln!(file, "{{\"id\": \"half-written").unwrap();
        drop(file);
        let after = spool.push(NewPost::new("after", PlatformKind::Note), NOW).unwrap();

        let summary = spool.sync(&db, NOW).await.unwrap();
        assert_eq!(summary.synced, 2);
        assert_eq!(summary.rejected.len(), 1);
        assert!(summary.rejected[0].starts_with("line 2:"));
        assert!(db.get(&good.id).await.unwrap().is_some());
        assert!(db.get(&after.id).await.unwrap().is_some());

        // The corrupt line survives the sync verbatim
        let rejected = fs::read_to_string(spool.rejected_path()).unwrap();
        assert_eq!(rejected, "{\"id\": \"half-written\n");
        assert!(!spool.path().exists());
        assert!(!spool.syncing_path().exists());
    }

    #[tokio::test]
    async fn test_sync_resumes_interrupted_sync_and_keeps_new_pushes() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("posts.db").to_string_lossy())
            .await
            .unwrap();
        let spool = spool_in(&temp);

        // An earlier sync moved the spool aside and died
        let leftover = spool.push(NewPost::new("leftover", PlatformKind::X), NOW).unwrap();
        fs::rename(spool.path(), spool.syncing_path()).unwrap();
        let fresh = spool.push(NewPost::new("fresh", PlatformKind::X), NOW + 1).unwrap();

        let pending = spool.entries().unwrap();
        assert_eq!(pending, vec![leftover.clone(), fresh.clone()]);

        let summary = spool.sync(&db, NOW + 2).await.unwrap();
        assert_eq!(summary.synced, 2);
        assert!(db.get(&leftover.id).await.unwrap().is_some());
        assert!(db.get(&fresh.id).await.unwrap().is_some());
        assert!(spool.entries().unwrap().is_empty());
    }
}
