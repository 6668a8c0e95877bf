// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed hashing for tool artifacts.
//!
//! This crate is the bottom of the integrity stack: it reduces any artifact
//! to a stable 64-hex-character SHA-256 identity and verifies files against
//! an expected hash.  Canonicalization (signature stripping, frontmatter
//! removal, …) is the caller's responsibility; this layer hashes exactly
//! the bytes it is given.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Errors from hashing or verifying artifacts.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    /// The artifact could not be read.
    #[error("unreadable artifact: {path}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The recomputed hash does not match the expected hash.
    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    Mismatch {
        /// Path whose content drifted.
        path: PathBuf,
        /// Hash recorded at freeze time.
        expected: String,
        /// Hash recomputed from the current content.
        actual: String,
    },
}

/// Compute the hex-encoded SHA-256 hash of `content`.
///
/// # Examples
///
/// ```
/// let h = kiwi_integrity::content_hash("hello");
/// assert_eq!(h.len(), 64);
/// assert_eq!(h, kiwi_integrity::content_hash("hello"));
/// ```
#[must_use]
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Compute the hex-encoded SHA-256 hash of raw bytes.
#[must_use]
pub fn bytes_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Hash the contents of a file on disk.
///
/// # Errors
///
/// Returns [`IntegrityError::Io`] if the file cannot be read.
pub fn file_hash(path: &Path) -> Result<String, IntegrityError> {
    let content = std::fs::read(path).map_err(|source| IntegrityError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(bytes_hash(&content))
}

/// Verify that a file's content matches `expected`.
///
/// The comparison is constant-time over the hex digests so verification
/// timing reveals nothing about where the hashes diverge.
///
/// # Errors
///
/// Returns [`IntegrityError::Io`] for unreadable files and
/// [`IntegrityError::Mismatch`] when the hashes differ.
pub fn verify_file(path: &Path, expected: &str) -> Result<(), IntegrityError> {
    let actual = file_hash(path)?;
    if constant_time_eq(actual.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(IntegrityError::Mismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Return a shortened hash for display purposes.
///
/// # Examples
///
/// ```
/// let h = kiwi_integrity::content_hash("x");
/// assert_eq!(kiwi_integrity::short_hash(&h, 12).len(), 12);
/// ```
#[must_use]
pub fn short_hash(full_hash: &str, length: usize) -> &str {
    &full_hash[..length.min(full_hash.len())]
}

/// Constant-time byte-slice equality.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
