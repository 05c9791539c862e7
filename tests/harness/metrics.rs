// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Outcome collection for flood simulation results.

use post_rate_limiter::{Decision, RejectReason};
use std::collections::HashMap;
use std::time::Duration;

/// Collects outcomes during a flood simulation.
#[derive(Debug, Default)]
pub struct FloodMetrics {
    /// Count of submissions by outcome
    outcomes: HashMap<Outcome, usize>,
    /// Accepted submissions per identity
    accepted_per_identity: HashMap<String, usize>,
    /// Submissions per identity
    submissions_per_identity: HashMap<String, usize>,
    /// Decision latency samples (microseconds)
    latencies: Vec<u64>,
}

/// Possible outcomes for a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Allowed,
    ContentLimited,
    IdentityLimited,
    HourlyQuota,
    CrossPostLimited,
    InvalidFingerprint,
    InvalidIdentity,
    StorageUnavailable,
}

impl From<&Decision> for Outcome {
    fn from(decision: &Decision) -> Self {
        match decision {
            Decision::Accept => Outcome::Allowed,
            Decision::Reject(r) => match r.reason {
                RejectReason::ContentRateLimited => Outcome::ContentLimited,
                RejectReason::IdentityRateLimited => Outcome::IdentityLimited,
                RejectReason::HourlyQuotaExceeded => Outcome::HourlyQuota,
                RejectReason::CrossPostRateLimited => Outcome::CrossPostLimited,
                RejectReason::InvalidFingerprintFormat => Outcome::InvalidFingerprint,
                RejectReason::InvalidIdentity => Outcome::InvalidIdentity,
                RejectReason::StorageUnavailable => Outcome::StorageUnavailable,
            },
        }
    }
}

impl FloodMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a submission outcome.
    pub fn record(&mut self, outcome: Outcome, identity: &str, latency: Duration) {
        *self.outcomes.entry(outcome).or_insert(0) += 1;
        *self
            .submissions_per_identity
            .entry(identity.to_string())
            .or_insert(0) += 1;
        if outcome == Outcome::Allowed {
            *self
                .accepted_per_identity
                .entry(identity.to_string())
                .or_insert(0) += 1;
        }
        self.latencies.push(latency.as_micros() as u64);
    }

    /// Get total submission count.
    pub fn total(&self) -> usize {
        self.outcomes.values().sum()
    }

    /// Get count for a specific outcome.
    pub fn count(&self, outcome: Outcome) -> usize {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    /// Get block rate (ratio of rejected to total).
    pub fn block_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (total - self.count(Outcome::Allowed)) as f64 / total as f64
    }

    /// Largest number of accepted submissions for any one identity.
    pub fn max_accepted_per_identity(&self) -> usize {
        self.accepted_per_identity.values().copied().max().unwrap_or(0)
    }

    /// Get number of unique identities that submitted.
    pub fn unique_identities(&self) -> usize {
        self.submissions_per_identity.len()
    }

    /// Get p99 latency in microseconds.
    pub fn p99_latency_us(&self) -> u64 {
        if self.latencies.is_empty() {
            return 0;
        }
        let mut sorted = self.latencies.clone();
        sorted.sort_unstable();
        let idx = (sorted.len() as f64 * 0.99) as usize;
        sorted[idx.min(sorted.len() - 1)]
    }
}

impl std::fmt::Display for FloodMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Flood Metrics Report ===")?;
        writeln!(f, "Total Submissions: {}", self.total())?;
        writeln!(f, "Allowed:           {}", self.count(Outcome::Allowed))?;
        writeln!(f, "Content Limited:   {}", self.count(Outcome::ContentLimited))?;
        writeln!(f, "Identity Limited:  {}", self.count(Outcome::IdentityLimited))?;
        writeln!(f, "Hourly Quota:      {}", self.count(Outcome::HourlyQuota))?;
        writeln!(f, "Cross-post:        {}", self.count(Outcome::CrossPostLimited))?;
        writeln!(
            f,
            "Contract Failures: {}",
            self.count(Outcome::InvalidFingerprint) + self.count(Outcome::InvalidIdentity)
        )?;
        writeln!(f, "Block Rate:        {:.1}%", self.block_rate() * 100.0)?;
        writeln!(f, "P99 Latency:       {} us", self.p99_latency_us())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_rate() {
        let mut metrics = FloodMetrics::new();
        for _ in 0..3 {
            metrics.record(Outcome::Allowed, "alice", Duration::ZERO);
        }
        for _ in 0..7 {
            metrics.record(Outcome::IdentityLimited, "alice", Duration::ZERO);
        }

        assert!((metrics.block_rate() - 0.7).abs() < 0.01);
        assert_eq!(metrics.max_accepted_per_identity(), 3);
        assert_eq!(metrics.unique_identities(), 1);
    }
}
