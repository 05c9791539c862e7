// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! File-backed counter store.
//!
//! Layout under the state directory:
//!
//! ```text
//! content/<key>            content fingerprint counters
//! identity/<key>           identity cadence counters
//! identity/<key>_hourly    hourly quota windows
//! <ns>/<key>.lock          per-key lock files (advisory OS locks)
//! journal/<uuid>.json      commits in flight
//! journal/<uuid>.<n>.bak   pre-commit links to the records a commit replaces
//! ```
//!
//! Records are replaced with write-to-temp + rename, and each record's
//! mtime is set to the logical time of the write. A commit first lands a
//! journal entry naming every update; a journal found at open belongs to a
//! crashed process and is replayed. A commit that fails while its writer is
//! alive is rolled back from the `.bak` links instead.
//!
//! A lock file only outlives its guard while the key has a record, so keys
//! that were checked but never written leave nothing behind.

use super::{
    ensure_covered, lock_order, CounterStore, KeyGuard, Namespace, Record, Result, StoreError,
    StoreKey,
};
use crate::config::StoreConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const JOURNAL_DIR: &str = "journal";
const JOURNAL_EXT: &str = "json";
const LOCK_EXT: &str = "lock";
const BACKUP_EXT: &str = "bak";
const LOCK_RETRY: Duration = Duration::from_millis(5);

/// One accepted submission's updates, written before any record changes.
#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    modified_at: i64,
    updates: Vec<(StoreKey, Record)>,
}

/// Counter store keeping one small text file per key.
#[derive(Debug, Clone)]
pub struct FileCounterStore {
    root: PathBuf,
    lock_timeout: Duration,
}

/// Locks held on a [`FileCounterStore`]. Closing the files releases them.
#[derive(Debug)]
pub struct FileGuard {
    keys: Vec<StoreKey>,
    held: Vec<HeldLock>,
}

#[derive(Debug)]
struct HeldLock {
    file: File,
    lock_path: PathBuf,
    record_path: PathBuf,
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        for held in &self.held {
            if held.record_path.exists() {
                continue;
            }
            // Only the holder of the inode at `lock_path` may unlink it.
            match is_same_file(&held.file, &held.lock_path) {
                Ok(true) => {
                    if let Err(e) = fs::remove_file(&held.lock_path) {
                        if e.kind() != io::ErrorKind::NotFound {
                            warn!(path = %held.lock_path.display(), error = %e, "Could not remove lock file");
                        }
                    }
                }
                Ok(false) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %held.lock_path.display(), error = %e, "Could not stat lock file"),
            }
        }
    }
}

impl KeyGuard for FileGuard {
    fn covers(&self, key: &StoreKey) -> bool {
        self.keys.binary_search(key).is_ok()
    }
}

impl FileCounterStore {
    /// Open the store, creating its directories and replaying any journal
    /// left behind by a crashed writer.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let store = Self {
            root: config.state_dir.clone(),
            lock_timeout: config.lock_timeout(),
        };

        for ns in Namespace::ALL {
            tokio::fs::create_dir_all(store.root.join(ns.dir_name())).await?;
        }
        tokio::fs::create_dir_all(store.journal_dir()).await?;

        let replayed = store.recover().await?;
        if replayed > 0 {
            info!(replayed, "Replayed interrupted commits");
        }

        Ok(store)
    }

    fn record_path(&self, key: &StoreKey) -> PathBuf {
        self.root.join(key.namespace().dir_name()).join(key.name())
    }

    fn lock_path(&self, key: &StoreKey) -> PathBuf {
        self.record_path(key).with_extension(LOCK_EXT)
    }

    fn journal_dir(&self) -> PathBuf {
        self.root.join(JOURNAL_DIR)
    }

    fn backup_path(journal: &Path, index: usize) -> PathBuf {
        journal.with_extension(format!("{index}.{BACKUP_EXT}"))
    }

    /// Link the record a commit is about to replace next to its journal.
    /// Returns whether there was a record to keep.
    async fn backup_record(&self, key: &StoreKey, backup: &Path) -> Result<bool> {
        let record = self.record_path(key);
        let backup = backup.to_path_buf();
        blocking(move || match fs::hard_link(&record, &backup) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        })
        .await
    }

    /// Undo the first `applied` updates of a failed commit.
    async fn roll_back(
        &self,
        journal: &Path,
        updates: &[(StoreKey, Record)],
        backups: &[bool],
    ) -> Result<()> {
        for (index, (key, _)) in updates.iter().enumerate().take(backups.len()).rev() {
            let backup = Self::backup_path(journal, index);
            if backups[index] {
                tokio::fs::rename(&backup, self.record_path(key)).await?;
            } else {
                remove_if_exists(&self.record_path(key)).await?;
            }
        }
        Ok(())
    }

    async fn remove_backups(journal: &Path, count: usize) -> Result<()> {
        for index in 0..count {
            remove_if_exists(&Self::backup_path(journal, index)).await?;
        }
        Ok(())
    }

    async fn lock_key(&self, key: &StoreKey, deadline: Instant) -> Result<File> {
        let path = self.lock_path(key);
        loop {
            let attempt = path.clone();
            if let Some(file) = blocking(move || try_lock_file(&attempt)).await? {
                return Ok(file);
            }
            if Instant::now() >= deadline {
                return Err(StoreError::LockTimeout(key.clone()));
            }
            tokio::time::sleep(LOCK_RETRY).await;
        }
    }

    async fn write_record(&self, key: &StoreKey, record: Record, modified_at: i64) -> Result<()> {
        let path = self.record_path(key);
        blocking(move || write_file_atomic(&path, record.to_string().as_bytes(), modified_at)).await
    }

    async fn write_journal(&self, entry: &JournalEntry) -> Result<PathBuf> {
        let payload = serde_json::to_vec(entry).map_err(|e| StoreError::CorruptJournal {
            path: self.journal_dir().display().to_string(),
            reason: e.to_string(),
        })?;
        let path = self
            .journal_dir()
            .join(format!("{}.{}", Uuid::new_v4().simple(), JOURNAL_EXT));
        let target = path.clone();
        let modified_at = entry.modified_at;
        blocking(move || write_file_atomic(&target, &payload, modified_at)).await?;
        Ok(path)
    }

    /// Replay journals whose writers died before finishing.
    ///
    /// A live writer holds the locks of every key in its journal until the
    /// journal is removed, so a journal that still exists once those locks
    /// are ours is orphaned. Replay only writes records that are at least
    /// as recent as what is stored.
    async fn recover(&self) -> Result<usize> {
        let mut replayed = 0;
        let mut dir = tokio::fs::read_dir(self.journal_dir()).await?;

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXT) {
                continue;
            }

            let entry: JournalEntry = match tokio::fs::read(&path).await {
                Ok(raw) => match serde_json::from_slice(&raw) {
                    Ok(entry) => entry,
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "Skipping unreadable journal");
                        continue;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let keys: Vec<StoreKey> = entry.updates.iter().map(|(k, _)| k.clone()).collect();
            let guard = match self.lock(&keys, self.lock_timeout).await {
                Ok(guard) => guard,
                Err(StoreError::LockTimeout(key)) => {
                    warn!(path = %path.display(), %key, "Journal keys busy, leaving for next open");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !tokio::fs::try_exists(&path).await? {
                continue;
            }

            for (key, record) in &entry.updates {
                let current = match self.read(key).await {
                    Ok(current) => current,
                    Err(StoreError::CorruptRecord { .. }) => None,
                    Err(e) => return Err(e),
                };
                if current.map_or(true, |c| record.supersedes(&c)) {
                    self.write_record(key, *record, entry.modified_at).await?;
                }
            }
            Self::remove_backups(&path, entry.updates.len()).await?;
            remove_if_exists(&path).await?;
            drop(guard);
            replayed += 1;
        }

        Ok(replayed)
    }
}

#[async_trait]
impl CounterStore for FileCounterStore {
    type Guard = FileGuard;

    async fn lock(&self, keys: &[StoreKey], timeout: Duration) -> Result<FileGuard> {
        let keys = lock_order(keys);
        let deadline = Instant::now() + timeout;
        let mut held = Vec::with_capacity(keys.len());
        for key in &keys {
            held.push(HeldLock {
                file: self.lock_key(key, deadline).await?,
                lock_path: self.lock_path(key),
                record_path: self.record_path(key),
            });
        }
        Ok(FileGuard { keys, held })
    }

    async fn read(&self, key: &StoreKey) -> Result<Option<Record>> {
        let raw = match tokio::fs::read_to_string(self.record_path(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        raw.parse()
            .map(Some)
            .map_err(|_| StoreError::CorruptRecord {
                key: key.clone(),
                raw,
            })
    }

    async fn last_modified(&self, key: &StoreKey) -> Result<Option<i64>> {
        match tokio::fs::metadata(self.record_path(key)).await {
            Ok(meta) => Ok(Some(unix_secs(meta.modified()?))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_atomic(&self, key: &StoreKey, record: Record, modified_at: i64) -> Result<()> {
        let _guard = self.lock(std::slice::from_ref(key), self.lock_timeout).await?;
        self.write_record(key, record, modified_at).await
    }

    async fn transactional_accept(
        &self,
        guard: &FileGuard,
        updates: &[(StoreKey, Record)],
        modified_at: i64,
    ) -> Result<()> {
        ensure_covered(guard, updates)?;

        let entry = JournalEntry {
            modified_at,
            updates: updates.to_vec(),
        };
        let journal = self.write_journal(&entry).await?;

        // backups[i] records whether update i replaced an existing record
        let mut backups = Vec::with_capacity(updates.len());
        for (index, (key, record)) in updates.iter().enumerate() {
            let applied = match self
                .backup_record(key, &Self::backup_path(&journal, index))
                .await
            {
                Ok(existed) => {
                    backups.push(existed);
                    self.write_record(key, *record, modified_at).await
                }
                Err(e) => Err(e),
            };

            if let Err(e) = applied {
                error!(%key, error = %e, journal = %journal.display(), "Commit failed, rolling back");
                if let Err(rollback) = self.roll_back(&journal, updates, &backups).await {
                    error!(error = %rollback, journal = %journal.display(), "Rollback failed, journal kept for replay");
                    return Err(e);
                }
                Self::remove_backups(&journal, updates.len()).await?;
                remove_if_exists(&journal).await?;
                return Err(e);
            }
        }

        Self::remove_backups(&journal, updates.len()).await?;
        remove_if_exists(&journal).await?;
        debug!(updates = updates.len(), "Commit applied");
        Ok(())
    }

    async fn delete(&self, key: &StoreKey) -> Result<()> {
        let guard = self.lock(std::slice::from_ref(key), self.lock_timeout).await?;
        self.delete_locked(&guard, key).await
    }

    async fn delete_locked(&self, guard: &FileGuard, key: &StoreKey) -> Result<()> {
        if !guard.covers(key) {
            return Err(StoreError::NotLocked(key.clone()));
        }
        // The lock file goes when the guard drops.
        remove_if_exists(&self.record_path(key)).await

    }

    async fn entries(&self) -> Result<Vec<(StoreKey, i64)>> {
        let mut found = Vec::new();
        for ns in Namespace::ALL {
            let mut dir = match tokio::fs::read_dir(self.root.join(ns.dir_name())).await {
                Ok(dir) => dir,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(item) = dir.next_entry().await? {
                let Some(name) = item.file_name().to_str().map(str::to_owned) else {
                    continue;
                };
                // Lock and temp files carry an extension; keys never do.
                if name.contains('.') {
                    continue;
                }
                let meta = match item.metadata().await {
                    Ok(meta) => meta,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                if meta.is_file() {
                    found.push((StoreKey::new(ns, name), unix_secs(meta.modified()?)));
                }
            }
        }
        Ok(found)
    }
}

/// Run blocking filesystem work off the async executor.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
        .map_err(StoreError::from)
}

/// Try to take the lock file at `path` without waiting.
///
/// Returns `None` when the lock is busy, or when the file was unlinked by a
/// sweeper between our open and our lock, in which case the caller retries
/// against the fresh file.
fn try_lock_file(path: &Path) -> io::Result<Option<File>> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;

    match file.try_lock() {
        Ok(()) => {}
        Err(TryLockError::WouldBlock) => return Ok(None),
        Err(TryLockError::Error(e)) => return Err(e),
    }

    match is_same_file(&file, path) {
        Ok(true) => Ok(Some(file)),
        Ok(false) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Whether `path` still names the inode `file` has open.
fn is_same_file(file: &File, path: &Path) -> io::Result<bool> {
    let held = file.metadata()?;
    let current = fs::metadata(path)?;
    Ok(current.dev() == held.dev() && current.ino() == held.ino())
}

/// Replace `path` with `contents` so readers see either the old or the new
/// file, never a partial one.
fn write_file_atomic(path: &Path, contents: &[u8], modified_at: i64) -> io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = path.with_file_name(format!("{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result = (|| -> io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.set_modified(system_time(modified_at))?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn system_time(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

fn unix_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}
