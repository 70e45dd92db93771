// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for conduit-runtime.

use thiserror::Error;

/// Runtime errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading or mode resolution failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Codebase synchronization failed.
    #[error("Codebase error: {0}")]
    Codebase(#[from] crate::codebase::CodebaseError),

    /// Worker construction, load or start failed.
    #[error("Worker error: {0}")]
    Worker(#[from] crate::worker::WorkerError),

    /// Admin service, proxy or link failed.
    #[error("Admin error: {0}")]
    Admin(#[from] crate::admin::AdminError),

    /// Codebase store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] crate::repo::StoreError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the runtime Error.
pub type Result<T> = std::result::Result<T, Error>;
