// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Posting admission rules.
//!
//! Every submission passes through four rules, in order, stopping at the
//! first one that fails:
//! 1. Content duplicate: same fingerprint accepted within 5 minutes
//! 2. Identity cadence: same user accepted within 1 minute
//! 3. Hourly quota: at most 50 accepted posts per user per window
//! 4. Cross-post: posts to more than 3 groups need 30 minutes between
//!    repeats of the same fingerprint
//!
//! Rule 4 reuses the content counter read by rule 1. All counters are
//! updated together, and only when the post is accepted.

use crate::config::RateLimitConfig;
use crate::keys::{KeyError, SubmissionKeys};
use crate::metrics::Metrics;
use crate::store::{CounterStore, Record, StoreError, StoreKey};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// A candidate post, as handed over by the news server filter.
#[derive(Debug, Clone, Default)]
pub struct SubmissionAttempt {
    /// Authenticated poster
    pub identity: String,
    /// Hex-encoded HMAC-SHA512 over the post content
    pub fingerprint: String,
    /// Message-ID header
    pub message_id: String,
    /// From header
    pub from: String,
    /// Subject header
    pub subject: String,
    /// Raw Newsgroups header
    pub newsgroups: String,
    /// Arrival time in Unix seconds
    pub arrived_at: i64,
}

impl SubmissionAttempt {
    /// Number of destination groups in the Newsgroups header.
    pub fn destination_count(&self) -> usize {
        count_groups(&self.newsgroups)
    }
}

/// Count groups in a Newsgroups header, split on commas and whitespace.
pub fn count_groups(newsgroups: &str) -> usize {
    newsgroups
        .trim()
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|group| !group.is_empty())
        .count()
}

/// Reason a submission was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// Same fingerprint accepted too recently
    ContentRateLimited,
    /// Same user posted too recently
    IdentityRateLimited,
    /// User exhausted the hourly quota
    HourlyQuotaExceeded,
    /// Cross-post repeated too soon
    CrossPostRateLimited,
    /// Upstream sent a malformed fingerprint
    InvalidFingerprintFormat,
    /// Upstream sent an unusable identity
    InvalidIdentity,
    /// Counter state could not be checked
    StorageUnavailable,
}

impl RejectReason {
    /// Stable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ContentRateLimited => "CONTENT_RATE_LIMITED",
            Self::IdentityRateLimited => "IDENTITY_RATE_LIMITED",
            Self::HourlyQuotaExceeded => "HOURLY_QUOTA_EXCEEDED",
            Self::CrossPostRateLimited => "CROSS_POST_RATE_LIMITED",
            Self::InvalidFingerprintFormat => "INVALID_FINGERPRINT_FORMAT",
            Self::InvalidIdentity => "INVALID_IDENTITY",
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
        }
    }

    /// Whether this is an ordinary abuse-rate rejection.
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            Self::ContentRateLimited
                | Self::IdentityRateLimited
                | Self::HourlyQuotaExceeded
                | Self::CrossPostRateLimited
        )
    }

    /// Whether the upstream filter broke the input contract.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::InvalidFingerprintFormat | Self::InvalidIdentity)
    }

    /// Coarse class used in logs and metrics.
    pub fn class(&self) -> &'static str {
        if self.is_rate_limit() {
            "rate_limited"
        } else if self.is_contract_violation() {
            "contract_violation"
        } else {
            "storage_error"
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl From<&KeyError> for RejectReason {
    fn from(err: &KeyError) -> Self {
        match err {
            KeyError::InvalidFingerprintFormat { .. } => Self::InvalidFingerprintFormat,
            KeyError::InvalidIdentity(_) => Self::InvalidIdentity,
        }
    }
}

/// Details of a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub reason: RejectReason,
    /// Message shown to the poster
    pub message: String,
    /// Seconds until the failing rule would pass
    pub retry_after_secs: Option<u64>,
}

/// Outcome of an admission decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject(Rejection),
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Decision::Accept)
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Decision::Accept => None,
            Decision::Reject(r) => Some(r),
        }
    }

    fn rate_limited(reason: RejectReason, retry_after: i64) -> Self {
        let retry_after = retry_after.max(0) as u64;
        let wait = format_wait(retry_after);
        let message = match reason {
            RejectReason::ContentRateLimited => format!("Content Rate Limit Reached (wait {wait})"),
            RejectReason::IdentityRateLimited => format!("User Rate Limit Reached (wait {wait})"),
            RejectReason::HourlyQuotaExceeded => {
                format!("Hourly Post Limit Exceeded (resets in {wait})")
            }
            RejectReason::CrossPostRateLimited => format!("Cross-posting Rate Limit (wait {wait})"),
            other => other.code().to_string(),
        };
        Decision::Reject(Rejection {
            reason,
            message,
            retry_after_secs: Some(retry_after),
        })
    }

    fn contract_violation(err: &KeyError) -> Self {
        Decision::Reject(Rejection {
            reason: err.into(),
            message: err.to_string(),
            retry_after_secs: None,
        })
    }

    fn storage_unavailable() -> Self {
        Decision::Reject(Rejection {
            reason: RejectReason::StorageUnavailable,
            message: "Posting temporarily unavailable, please try again later".to_string(),
            retry_after_secs: None,
        })
    }
}

/// Format a wait as `MM:SS`.
pub fn format_wait(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// Evaluates the admission rules against a counter store.
pub struct RateLimitEngine<S> {
    store: Arc<S>,
    config: RateLimitConfig,
    lock_timeout: Duration,
    metrics: Option<Metrics>,
}

impl<S: CounterStore> RateLimitEngine<S> {
    /// Create an engine over `store` with the given thresholds.
    pub fn new(store: Arc<S>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config,
            lock_timeout: Duration::from_secs(2),
            metrics: None,
        }
    }

    /// How long a decision waits for its key locks before failing safe.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Record decisions in `metrics`.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Decide whether to accept a submission.
    ///
    /// Never fails: contract violations and storage failures become
    /// rejections with their own reason codes.
    pub async fn decide(&self, attempt: &SubmissionAttempt) -> Decision {
        let started = Instant::now();
        let decision = self.evaluate(attempt).await;

        if let Some(metrics) = &self.metrics {
            metrics.observe_decision(&decision, started.elapsed());
        }
        decision
    }

    async fn evaluate(&self, attempt: &SubmissionAttempt) -> Decision {
        let keys = match SubmissionKeys::derive(&attempt.identity, &attempt.fingerprint) {
            Ok(keys) => keys,
            Err(err) => {
                error!(
                    message_id = %attempt.message_id,
                    reason = RejectReason::from(&err).code(),
                    error = %err,
                    "Contract violation from upstream filter"
                );
                return Decision::contract_violation(&err);
            }
        };

        match self.check_and_commit(&keys, attempt).await {
            Ok(decision) => {
                match &decision {
                    Decision::Accept => debug!(
                        message_id = %attempt.message_id,
                        identity_key = %keys.identity,
                        "Post accepted"
                    ),
                    Decision::Reject(r) => info!(
                        message_id = %attempt.message_id,
                        identity_key = %keys.identity,
                        reason = r.reason.code(),
                        retry_after_secs = r.retry_after_secs,
                        "Post rate limited"
                    ),
                }
                decision
            }
            Err(err) => {
                error!(
                    message_id = %attempt.message_id,
                    identity_key = %keys.identity,
                    error = %err,
                    "Rate limit state unavailable, rejecting post"
                );
                Decision::storage_unavailable()
            }
        }
    }

    /// Run the four rules with every touched key locked, committing on
    /// acceptance.
    async fn check_and_commit(
        &self,
        keys: &SubmissionKeys,
        attempt: &SubmissionAttempt,
    ) -> Result<Decision, StoreError> {
        let cfg = &self.config;
        let now = attempt.arrived_at;
        let guard = self.store.lock(&keys.all(), self.lock_timeout).await?;

        // 1. Content duplicate
        let content_last = self.read_timestamp(&keys.content).await?;
        if let Some(last) = content_last {
            let elapsed = elapsed_since(now, last);
            if elapsed < cfg.content_window_secs {
                return Ok(Decision::rate_limited(
                    RejectReason::ContentRateLimited,
                    cfg.content_window_secs - elapsed,
                ));
            }
        }

        // 2. Identity cadence
        if let Some(last) = self.read_timestamp(&keys.identity).await? {
            let elapsed = elapsed_since(now, last);
            if elapsed < cfg.identity_window_secs {
                return Ok(Decision::rate_limited(
                    RejectReason::IdentityRateLimited,
                    cfg.identity_window_secs - elapsed,
                ));
            }
        }

        // 3. Hourly quota
        let (window_start, effective_count) = match self.read_window(&keys.hourly).await? {
            Some((start, count)) if elapsed_since(now, start) < cfg.hourly_window_secs => {
                (start, count)
            }
            _ => (now, 0),
        };
        if effective_count >= cfg.hourly_cap {
            return Ok(Decision::rate_limited(
                RejectReason::HourlyQuotaExceeded,
                cfg.hourly_window_secs - elapsed_since(now, window_start),
            ));
        }

        // 4. Cross-post, against the content counter read in rule 1
        if attempt.destination_count() > cfg.cross_post_threshold {
            if let Some(last) = content_last {
                let elapsed = elapsed_since(now, last);
                if elapsed < cfg.cross_post_window_secs {
                    return Ok(Decision::rate_limited(
                        RejectReason::CrossPostRateLimited,
                        cfg.cross_post_window_secs - elapsed,
                    ));
                }
            }
        }

        let updates = [
            (keys.content.clone(), Record::Timestamp(now)),
            (keys.identity.clone(), Record::Timestamp(now)),
            (
                keys.hourly.clone(),
                Record::Window {
                    start: window_start,
                    count: effective_count + 1,
                },
            ),
        ];
        self.store
            .transactional_accept(&guard, &updates, now)
            .await?;

        Ok(Decision::Accept)
    }

    async fn read_timestamp(&self, key: &StoreKey) -> Result<Option<i64>, StoreError> {
        match self.store.read(key).await? {
            None => Ok(None),
            Some(record) => record
                .timestamp()
                .map(Some)
                .ok_or_else(|| StoreError::CorruptRecord {
                    key: key.clone(),
                    raw: record.to_string(),
                }),
        }
    }

    async fn read_window(&self, key: &StoreKey) -> Result<Option<(i64, u32)>, StoreError> {
        match self.store.read(key).await? {
            None => Ok(None),
            Some(record) => record
                .window()
                .map(Some)
                .ok_or_else(|| StoreError::CorruptRecord {
                    key: key.clone(),
                    raw: record.to_string(),
                }),
        }
    }
}

/// Seconds elapsed since `then`. A timestamp in the future counts as zero.
fn elapsed_since(now: i64, then: i64) -> i64 {
    now.saturating_sub(then).max(0)
}
