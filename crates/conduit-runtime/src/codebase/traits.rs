// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Codebase source trait definitions.

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::status::Status;

/// Errors from codebase operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodebaseError {
    /// The entry file was not found.
    #[error("Entry not found: {0}")]
    NotFound(String),

    /// The remote answered with an unexpected status.
    #[error("Fetch of {url} failed with HTTP {status}")]
    HttpStatus {
        /// Requested URL.
        url: String,
        /// Status code returned.
        status: u16,
    },

    /// HTTP transport failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// TLS material could not be loaded.
    #[error("TLS error: {0}")]
    Tls(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for codebase operations.
pub type Result<T> = std::result::Result<T, CodebaseError>;

/// The entry module of a codebase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Resolved entry path (a file path, URL path or `<eval>`).
    pub path: String,
    /// Entry module source.
    pub source: Bytes,
}

/// Result of a successful synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// New content is available (always the case for a forced sync).
    Updated,
    /// Nothing changed since the previous sync.
    Unchanged,
}

/// Trait for codebase sources.
///
/// A source keeps the most recently synchronized entry and version. Sync is
/// the only suspending operation; `entry` and `version` just read the cached
/// result of the last successful sync.
#[async_trait]
pub trait CodebaseSource: Send + Sync {
    /// Source type identifier (e.g., "fs", "eval", "http").
    fn kind(&self) -> &'static str;

    /// Synchronize against the origin.
    ///
    /// With `force` the entry is refreshed and [`SyncOutcome::Updated`] is
    /// reported on success. Without it, `Updated` is reported only when the
    /// version differs from the previous sync.
    async fn sync(&mut self, status: &Status, force: bool) -> Result<SyncOutcome>;

    /// Entry module from the last successful sync.
    fn entry(&self) -> Option<&Entry>;

    /// Version from the last successful sync (empty before the first one).
    fn version(&self) -> &str;

    /// Resolved entry path, if synchronized.
    fn entry_path(&self) -> Option<&str> {
        self.entry().map(|entry| entry.path.as_str())
    }
}

/// Hex SHA-256 digest used as a content version.
pub fn content_version(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_version_is_stable_hex() {
        let a = content_version(b"pipeline()");
        let b = content_version(b"pipeline()");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, content_version(b"pipeline(1)"));
    }

    #[test]
    fn test_error_display() {
        let err = CodebaseError::HttpStatus {
            url: "http://repo/app".to_string(),
            status: 503,
        };
        assert_eq!(
            err.to_string(),
            "Fetch of http://repo/app failed with HTTP 503"
        );
    }
}
