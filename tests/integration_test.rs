// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Integration tests for the posting rate limiter on the file store.

use post_rate_limiter::{
    config::{RateLimitConfig, StoreConfig},
    keys::derive_content_key,
    store::{CounterStore, FileCounterStore, Namespace, Record, StoreKey},
    Decision, RateLimitEngine, RejectReason, RetentionSweeper, SubmissionAttempt,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const START: i64 = 1_700_000_000;

fn fingerprint(n: u8) -> String {
    format!("{:02x}", n).repeat(64)
}

fn attempt(identity: &str, fingerprint: &str, arrived_at: i64) -> SubmissionAttempt {
    SubmissionAttempt {
        identity: identity.to_string(),
        fingerprint: fingerprint.to_string(),
        message_id: format!("<{arrived_at}@news.example>"),
        from: "Poster <poster@example.com>".to_string(),
        subject: "Test".to_string(),
        newsgroups: "alt.test".to_string(),
        arrived_at,
    }
}

async fn open_store(dir: &Path) -> Arc<FileCounterStore> {
    let config = StoreConfig {
        state_dir: dir.to_path_buf(),
        lock_timeout_ms: 10_000,
    };
    Arc::new(FileCounterStore::open(&config).await.unwrap())
}

fn reason(decision: &Decision) -> Option<RejectReason> {
    decision.rejection().map(|r| r.reason)
}

#[tokio::test]
async fn test_full_admission_flow() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path()).await;
    let engine = RateLimitEngine::new(store, RateLimitConfig::default());
    let fp = fingerprint(0xab);

    let decision = engine.decide(&attempt("alice", &fp, START)).await;
    assert!(decision.is_accept());

    // Counters land as plain text
    let content_key = derive_content_key(&fp).unwrap();
    let content = fs::read_to_string(dir.path().join("content").join(content_key.name())).unwrap();
    assert_eq!(content, START.to_string());
    let identity = fs::read_to_string(dir.path().join("identity/alice")).unwrap();
    assert_eq!(identity, START.to_string());
    let hourly = fs::read_to_string(dir.path().join("identity/alice_hourly")).unwrap();
    assert_eq!(hourly, format!("{START}:1"));

    let repeat = engine.decide(&attempt("alice", &fp, START + 90)).await;
    assert_eq!(reason(&repeat), Some(RejectReason::ContentRateLimited));
    assert_eq!(
        repeat.rejection().map(|r| r.message.as_str()),
        Some("Content Rate Limit Reached (wait 03:30)")
    );
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let fp = fingerprint(1);

    {
        let engine = RateLimitEngine::new(open_store(dir.path()).await, RateLimitConfig::default());
        assert!(engine.decide(&attempt("alice", &fp, START)).await.is_accept());
    }

    // A new process sees what the previous one committed
    let engine = RateLimitEngine::new(open_store(dir.path()).await, RateLimitConfig::default());
    let decision = engine
        .decide(&attempt("alice", &fingerprint(2), START + 30))
        .await;
    assert_eq!(reason(&decision), Some(RejectReason::IdentityRateLimited));
    assert_eq!(decision.rejection().and_then(|r| r.retry_after_secs), Some(30));
}

#[tokio::test]
async fn test_reads_plain_text_counter_files() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path()).await;
    fs::write(dir.path().join("identity/bob"), (START - 10).to_string()).unwrap();
    fs::write(dir.path().join("identity/bob_hourly"), format!("{}:50", START - 100)).unwrap();
    let engine = RateLimitEngine::new(store, RateLimitConfig::default());

    let early = engine.decide(&attempt("bob", &fingerprint(3), START)).await;
    assert_eq!(reason(&early), Some(RejectReason::IdentityRateLimited));

    let later = engine.decide(&attempt("bob", &fingerprint(3), START + 60)).await;
    assert_eq!(reason(&later), Some(RejectReason::HourlyQuotaExceeded));
    assert_eq!(later.rejection().and_then(|r| r.retry_after_secs), Some(3440));
}

#[tokio::test]
async fn test_concurrent_submissions_do_not_lose_updates() {
    let dir = TempDir::new().unwrap();
    let config = RateLimitConfig {
        identity_window_secs: 0,
        hourly_cap: 10,
        ..Default::default()
    };

    // Two independent store handles stand in for two filter processes
    let stores = [open_store(dir.path()).await, open_store(dir.path()).await];
    let mut tasks = Vec::new();
    for i in 0..24u8 {
        let engine = RateLimitEngine::new(stores[i as usize % 2].clone(), config.clone())
            .with_lock_timeout(Duration::from_secs(30));
        tasks.push(tokio::spawn(async move {
            engine
                .decide(&attempt("carol", &fingerprint(i), START))
                .await
        }));
    }

    let mut accepted = 0;
    for task in tasks {
        let decision = task.await.unwrap();
        match reason(&decision) {
            None => accepted += 1,
            Some(r) => assert_eq!(r, RejectReason::HourlyQuotaExceeded),
        }
    }

    assert_eq!(accepted, 10);
    let hourly = stores[0]
        .read(&StoreKey::new(Namespace::Identity, "carol_hourly"))
        .await
        .unwrap();
    assert_eq!(hourly, Some(Record::Window { start: START, count: 10 }));
}

#[tokio::test]
async fn test_same_content_raced_by_two_posters() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path()).await;
    let fp = fingerprint(7);

    let mut tasks = Vec::new();
    for identity in ["dave", "erin", "frank", "grace"] {
        let engine = RateLimitEngine::new(store.clone(), RateLimitConfig::default())
            .with_lock_timeout(Duration::from_secs(30));
        let submission = attempt(identity, &fp, START);
        tasks.push(tokio::spawn(async move { engine.decide(&submission).await }));
    }

    let mut accepted = 0;
    for task in tasks {
        if task.await.unwrap().is_accept() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);
}

#[tokio::test]
async fn test_corrupt_counter_fails_safe_until_swept() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path()).await;
    fs::write(dir.path().join("identity/mallory"), "not a number").unwrap();
    let engine = RateLimitEngine::new(store.clone(), RateLimitConfig::default());

    let decision = engine.decide(&attempt("mallory", &fingerprint(9), START)).await;
    assert_eq!(reason(&decision), Some(RejectReason::StorageUnavailable));

    // Written with the real clock, so sweep a day past now
    let sweep_at = chrono::Utc::now().timestamp() + 86_400;
    let report = RetentionSweeper::new(store, 86_400)
        .sweep(sweep_at)
        .await
        .unwrap();
    assert_eq!(report.removed, 1);

    let retry = engine
        .decide(&attempt("mallory", &fingerprint(9), sweep_at))
        .await;
    assert!(retry.is_accept());
}

#[tokio::test]
async fn test_sweep_removes_expired_counters() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path()).await;
    let engine = RateLimitEngine::new(store.clone(), RateLimitConfig::default());
    let sweeper = RetentionSweeper::new(store.clone(), 86_400);

    assert!(engine.decide(&attempt("alice", &fingerprint(1), START)).await.is_accept());
    assert!(engine
        .decide(&attempt("bob", &fingerprint(2), START + 3600))
        .await
        .is_accept());

    // alice's three counters are a day old, bob's are not
    let report = sweeper.sweep(START + 86_400).await.unwrap();
    assert_eq!(report.scanned, 6);
    assert_eq!(report.removed, 3);
    assert!(!dir.path().join("identity/alice").exists());
    assert!(!dir.path().join("identity/alice_hourly").exists());
    assert!(dir.path().join("identity/bob").exists());

    let entries = store.entries().await.unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|(_, modified)| *modified == START + 3600));
}

#[tokio::test]
async fn test_rejected_unique_content_leaves_no_files_behind() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path()).await;
    let engine = RateLimitEngine::new(store.clone(), RateLimitConfig::default());

    for i in 0..200u8 {
        engine
            .decide(&attempt("spammer", &fingerprint(i), START + i as i64))
            .await;
    }

    let report = RetentionSweeper::new(store, 86_400)
        .sweep(START + 10 * 86_400)
        .await
        .unwrap();
    assert_eq!(report.removed, 6);

    let leftover: Vec<_> = ["content", "identity"]
        .iter()
        .flat_map(|ns| fs::read_dir(dir.path().join(ns)).unwrap())
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert!(leftover.is_empty(), "left behind: {leftover:?}");
}
