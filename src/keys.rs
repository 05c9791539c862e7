// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Derivation of storage keys from submission fields.
//!
//! Fingerprints arrive already hashed by the upstream filter and must be
//! exactly one SHA-512 hex digest. Identities are used verbatim when they
//! are short and alphanumeric; anything else is replaced by its SHA-256
//! digest so no key can carry path separators or control characters.

use crate::store::{Namespace, StoreKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Length of a hex-encoded SHA-512 fingerprint.
pub const FINGERPRINT_HEX_LEN: usize = 128;

/// Longest identity used verbatim as a key. Kept below the 64-character
/// digest length so verbatim and hashed keys never share a value.
pub const MAX_VERBATIM_IDENTITY_LEN: usize = 32;

/// Suffix distinguishing the hourly quota record of an identity.
pub const HOURLY_SUFFIX: &str = "_hourly";

/// Contract violations in the fields handed over by the upstream filter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid fingerprint format: expected {FINGERPRINT_HEX_LEN} hex digits, got {len} characters")]
    InvalidFingerprintFormat { len: usize },

    #[error("Invalid identity: {0}")]
    InvalidIdentity(&'static str),
}

/// All keys touched by one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionKeys {
    pub content: StoreKey,
    pub identity: StoreKey,
    pub hourly: StoreKey,
}

impl SubmissionKeys {
    /// Derive every key for a submission. The fingerprint is checked first.
    pub fn derive(identity: &str, fingerprint: &str) -> Result<Self, KeyError> {
        let content = derive_content_key(fingerprint)?;
        let identity = derive_identity_key(identity)?;
        let hourly = hourly_key(&identity);
        Ok(Self {
            content,
            identity,
            hourly,
        })
    }

    /// Keys in the order they are locked.
    pub fn all(&self) -> [StoreKey; 3] {
        [
            self.content.clone(),
            self.identity.clone(),
            self.hourly.clone(),
        ]
    }
}

/// Check a fingerprint against the fixed hex-digest format.
pub fn is_valid_fingerprint(fingerprint: &str) -> bool {
    fingerprint.len() == FINGERPRINT_HEX_LEN
        && fingerprint.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Derive the content counter key for a fingerprint.
///
/// The key is the SHA-256 digest of the lower-cased fingerprint, which is
/// also how the legacy filter named its content files.
pub fn derive_content_key(fingerprint: &str) -> Result<StoreKey, KeyError> {
    if !is_valid_fingerprint(fingerprint) {
        debug!(len = fingerprint.len(), "Fingerprint failed format check");
        return Err(KeyError::InvalidFingerprintFormat {
            len: fingerprint.chars().count(),
        });
    }

    let normalized = fingerprint.to_ascii_lowercase();
    Ok(StoreKey::new(Namespace::Content, sha256_hex(&normalized)))
}

/// Derive the identity counter key for a submitter.
pub fn derive_identity_key(identity: &str) -> Result<StoreKey, KeyError> {
    if identity.trim().is_empty() {
        return Err(KeyError::InvalidIdentity("identity is empty"));
    }

    let name = if is_safe_identity(identity) {
        identity.to_string()
    } else {
        sha256_hex(identity)
    };
    Ok(StoreKey::new(Namespace::Identity, name))
}

/// The hourly quota key paired with an identity key.
pub fn hourly_key(identity: &StoreKey) -> StoreKey {
    StoreKey::new(
        Namespace::Identity,
        format!("{}{}", identity.name(), HOURLY_SUFFIX),
    )
}

fn is_safe_identity(identity: &str) -> bool {
    (1..=MAX_VERBATIM_IDENTITY_LEN).contains(&identity.len())
        && identity.bytes().all(|b| b.is_ascii_alphanumeric())
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}
