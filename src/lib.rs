// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Post Rate Limiter
//!
//! Admission control for a news server's posting path. Each submission is
//! checked against four rules before the server accepts it:
//!
//! - Content duplicate: same content fingerprint within 5 minutes
//! - Identity cadence: same user within 1 minute
//! - Hourly quota: at most 50 posts per user per hour
//! - Cross-post: more than 3 groups needs 30 minutes between repeats
//!
//! Counters live in a [`store::CounterStore`]; the file-backed store keeps
//! one small file per key so that independent filter processes share state.
//! A [`sweeper::RetentionSweeper`] removes counters older than 24 hours.

pub mod config;
pub mod handlers;
pub mod keys;
pub mod limiter;
pub mod metrics;
pub mod store;
pub mod sweeper;

pub use config::Config;
pub use keys::SubmissionKeys;
pub use limiter::{Decision, RateLimitEngine, RejectReason, Rejection, SubmissionAttempt};
pub use store::{CounterStore, FileCounterStore, MemoryCounterStore};
pub use sweeper::{RetentionSweeper, SweepReport};
