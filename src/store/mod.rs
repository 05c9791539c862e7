// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Persistent counter storage.
//!
//! A [`CounterStore`] maps [`StoreKey`]s to [`Record`]s and serialises every
//! operation on a key through a per-key lock. The rate limit engine holds
//! the locks of all keys it touches for the whole read-evaluate-commit
//! cycle, so two concurrent submissions sharing a fingerprint or an
//! identity can never both observe "not limited".
//!
//! Two implementations are provided:
//! - [`FileCounterStore`]: one file per key, OS file locks, crash-safe commits
//! - [`MemoryCounterStore`]: process-local maps, for tests and embedding

mod file;
mod memory;

pub use file::{FileCounterStore, FileGuard};
pub use memory::{MemoryCounterStore, MemoryGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Storage error types.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(StoreKey),

    #[error("Corrupt record for {key}: {raw:?}")]
    CorruptRecord { key: StoreKey, raw: String },

    #[error("Corrupt journal {path}: {reason}")]
    CorruptJournal { path: String, reason: String },

    #[error("Key {0} is not covered by the held lock")]
    NotLocked(StoreKey),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StoreError>;

/// Logical namespace of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Content fingerprint counters
    Content,
    /// Identity cadence and hourly quota counters
    Identity,
}

impl Namespace {
    /// Directory name used by file-backed stores.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Identity => "identity",
        }
    }

    pub const ALL: [Namespace; 2] = [Namespace::Content, Namespace::Identity];
}

/// A storage key: a namespace plus a store-safe name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreKey {
    namespace: Namespace,
    name: String,
}

impl StoreKey {
    pub fn new(namespace: Namespace, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace.dir_name(), self.name)
    }
}

/// A persisted counter value.
///
/// Serialised as `"<ts>"` or `"<window_start>:<count>"`. The text matches
/// what the legacy filter wrote, and content files keep its names. Identity
/// files do not: it hashed every user name, while short alphanumeric
/// identities are stored verbatim here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Record {
    /// Timestamp of the last accepted submission
    Timestamp(i64),
    /// Hourly quota window
    Window { start: i64, count: u32 },
}

impl Record {
    /// Timestamp carried by a `Timestamp` record.
    pub fn timestamp(&self) -> Option<i64> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            Self::Window { .. } => None,
        }
    }

    /// Window start and count carried by a `Window` record.
    pub fn window(&self) -> Option<(i64, u32)> {
        match self {
            Self::Window { start, count } => Some((*start, *count)),
            Self::Timestamp(_) => None,
        }
    }

    /// Whether `self` is at least as recent as `other`. Used when replaying
    /// journals so a replay never moves a counter backwards.
    pub fn supersedes(&self, other: &Record) -> bool {
        match (self, other) {
            (Self::Timestamp(a), Self::Timestamp(b)) => a >= b,
            (
                Self::Window { start: a, count: ac },
                Self::Window { start: b, count: bc },
            ) => (a, ac) >= (b, bc),
            _ => true,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timestamp(ts) => write!(f, "{ts}"),
            Self::Window { start, count } => write!(f, "{start}:{count}"),
        }
    }
}

/// Error returned when a record's text cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed record")]
pub struct ParseRecordError;

impl FromStr for Record {
    type Err = ParseRecordError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once(':') {
            Some((start, count)) => Ok(Self::Window {
                start: start.trim().parse().map_err(|_| ParseRecordError)?,
                count: count.trim().parse().map_err(|_| ParseRecordError)?,
            }),
            None => Ok(Self::Timestamp(s.parse().map_err(|_| ParseRecordError)?)),
        }
    }
}

/// Proof that a set of keys is locked.
pub trait KeyGuard {
    /// Whether `key` is covered by this guard.
    fn covers(&self, key: &StoreKey) -> bool;
}

/// A key-value store of rate limit counters with per-key atomicity.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Lock guard returned by [`CounterStore::lock`]. Dropping it releases
    /// every key it covers.
    type Guard: KeyGuard + Send + Sync;

    /// Acquire exclusive locks on `keys`, waiting at most `timeout`.
    ///
    /// Keys are locked in sorted order so that overlapping callers cannot
    /// deadlock. Duplicates are ignored.
    async fn lock(
        &self,
        keys: &[StoreKey],
        timeout: std::time::Duration,
    ) -> Result<Self::Guard>;

    /// Read the current record for a key.
    async fn read(&self, key: &StoreKey) -> Result<Option<Record>>;

    /// Time of the last write to a key, in Unix seconds.
    async fn last_modified(&self, key: &StoreKey) -> Result<Option<i64>>;

    /// Replace the record for a key under its own lock.
    async fn write_atomic(&self, key: &StoreKey, record: Record, modified_at: i64) -> Result<()>;

    /// Apply the updates of one accepted submission as a single unit.
    ///
    /// Every key must be covered by `guard`. Either all updates become
    /// visible or, after a crash and reopen, none are lost.
    async fn transactional_accept(
        &self,
        guard: &Self::Guard,
        updates: &[(StoreKey, Record)],
        modified_at: i64,
    ) -> Result<()>;

    /// Remove a key under its own lock.
    async fn delete(&self, key: &StoreKey) -> Result<()>;

    /// Remove a key whose lock is already held.
    async fn delete_locked(&self, guard: &Self::Guard, key: &StoreKey) -> Result<()>;

    /// Every stored key with its last modification time.
    async fn entries(&self) -> Result<Vec<(StoreKey, i64)>>;
}

/// Sort and deduplicate keys into lock order.
pub(crate) fn lock_order(keys: &[StoreKey]) -> Vec<StoreKey> {
    let mut ordered = keys.to_vec();
    ordered.sort();
    ordered.dedup();
    ordered
}

/// Check that a guard covers every key of an update set.
pub(crate) fn ensure_covered<G: KeyGuard>(guard: &G, updates: &[(StoreKey, Record)]) -> Result<()> {
    match updates.iter().find(|(key, _)| !guard.covers(key)) {
        Some((key, _)) => Err(StoreError::NotLocked(key.clone())),
        None => Ok(()),
    }
}
