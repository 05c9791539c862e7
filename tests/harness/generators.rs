// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Test data generators for flood simulation.

use sha2::{Digest, Sha512};

/// Generate a pool of poster identities.
pub fn generate_identities(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("poster{i}")).collect()
}

/// Generate a pool of distinct, well-formed content fingerprints.
pub fn generate_fingerprints(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| hex::encode(Sha512::digest(format!("article body {i}").as_bytes())))
        .collect()
}

/// Generate a Newsgroups header naming `count` groups.
pub fn generate_newsgroups(count: usize) -> String {
    (0..count)
        .map(|i| format!("alt.test.group{i}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Fingerprints the upstream filter should never hand over.
pub fn generate_malformed_fingerprints() -> Vec<String> {
    vec![
        String::new(),
        "   ".to_string(),
        "a".repeat(127),
        "a".repeat(129),
        "g".repeat(128),
        format!("{}--", "0".repeat(126)),
        // SHA-256 length, not SHA-512
        "ab".repeat(32),
        format!("../../{}", "a".repeat(122)),
    ]
}

/// Identities that cannot be stored verbatim.
pub fn generate_awkward_identities() -> Vec<String> {
    vec![
        "../../etc/passwd".to_string(),
        "user name".to_string(),
        "user@example.com".to_string(),
        "x".repeat(200),
        "Ünïcödé".to_string(),
        "a_hourly".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_fingerprints() {
        let fingerprints = generate_fingerprints(64);
        assert_eq!(fingerprints.len(), 64);
        assert!(fingerprints.iter().all(|f| f.len() == 128));
        let unique: std::collections::HashSet<_> = fingerprints.iter().collect();
        assert_eq!(unique.len(), 64);
    }

    #[test]
    fn test_generate_newsgroups() {
        assert_eq!(generate_newsgroups(1), "alt.test.group0");
        assert_eq!(generate_newsgroups(4).split(',').count(), 4);
    }
}
