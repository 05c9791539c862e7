// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Posting flood patterns for abuse testing.
//!
//! Floods run on a simulated clock: submission `i` arrives
//! `i * seconds_between_posts` after the start of the flood.

use super::generators;
use post_rate_limiter::SubmissionAttempt;

/// Flood pattern configuration.
#[derive(Debug, Clone)]
pub struct FloodConfig {
    /// Total number of submissions
    pub total_posts: usize,
    /// Simulated seconds between consecutive submissions
    pub seconds_between_posts: i64,
    /// Number of poster identities to rotate through
    pub unique_identities: usize,
    /// Number of distinct article bodies to rotate through
    pub unique_fingerprints: usize,
    /// Groups named in every Newsgroups header
    pub groups_per_post: usize,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            total_posts: 100,
            seconds_between_posts: 1,
            unique_identities: 1,
            unique_fingerprints: 1,
            groups_per_post: 1,
        }
    }
}

/// Predefined flood patterns.
impl FloodConfig {
    /// One poster resubmitting the same article every second.
    pub fn duplicate_flood() -> Self {
        Self {
            total_posts: 600,
            seconds_between_posts: 1,
            ..Default::default()
        }
    }

    /// One poster sending a fresh article every 5 seconds.
    pub fn cadence_flood() -> Self {
        Self {
            total_posts: 240,
            seconds_between_posts: 5,
            unique_fingerprints: 240,
            ..Default::default()
        }
    }

    /// One poster pacing fresh articles just above the cadence window.
    pub fn slow_drip() -> Self {
        Self {
            total_posts: 120,
            seconds_between_posts: 61,
            unique_fingerprints: 120,
            ..Default::default()
        }
    }

    /// The same article spread over many groups by rotating accounts.
    pub fn cross_post_spam() -> Self {
        Self {
            total_posts: 200,
            seconds_between_posts: 30,
            unique_identities: 50,
            groups_per_post: 12,
            ..Default::default()
        }
    }

    /// Many accounts each posting their own articles.
    pub fn distributed_posters() -> Self {
        Self {
            total_posts: 500,
            seconds_between_posts: 1,
            unique_identities: 100,
            unique_fingerprints: 500,
            ..Default::default()
        }
    }

    /// Simulated length of the flood in seconds.
    pub fn span_secs(&self) -> i64 {
        self.total_posts as i64 * self.seconds_between_posts
    }

    /// Build every submission of the flood, starting at `start`.
    pub fn submissions(&self, start: i64) -> Vec<SubmissionAttempt> {
        let identities = generators::generate_identities(self.unique_identities);
        let fingerprints = generators::generate_fingerprints(self.unique_fingerprints);
        let newsgroups = generators::generate_newsgroups(self.groups_per_post);

        (0..self.total_posts)
            .map(|i| SubmissionAttempt {
                identity: identities[i % identities.len()].clone(),
                fingerprint: fingerprints[i % fingerprints.len()].clone(),
                message_id: format!("<flood.{i}@news.example>"),
                from: format!("{} <poster@example.com>", identities[i % identities.len()]),
                subject: format!("Flood {i}"),
                newsgroups: newsgroups.clone(),
                arrived_at: start + i as i64 * self.seconds_between_posts,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submissions_follow_clock() {
        let config = FloodConfig::cadence_flood();
        let submissions = config.submissions(1_000);
        assert_eq!(submissions.len(), 240);
        assert_eq!(submissions[0].arrived_at, 1_000);
        assert_eq!(submissions[2].arrived_at, 1_010);
        assert_ne!(submissions[0].fingerprint, submissions[1].fingerprint);
    }
}
