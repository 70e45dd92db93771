// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker trait definitions.
//!
//! A worker is one instantiation of the execution runtime. The orchestrator
//! owns at most one active worker and replaces it on every successful reload.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::codebase::Entry;
use crate::signals::ProcessSignal;

/// Errors from worker operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// The entry module could not be loaded.
    #[error("Failed to load {path}: {reason}")]
    LoadFailed {
        /// Entry path.
        path: String,
        /// Why loading failed.
        reason: String,
    },

    /// Start was called before a module was loaded.
    #[error("No entry module loaded")]
    NotLoaded,

    /// The worker failed to start.
    #[error("Worker start failed: {0}")]
    StartFailed(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Process-wide exit request.
///
/// Any component may request exit with a code; the most recent request wins.
/// The orchestrator watches it to leave its event loop.
#[derive(Debug, Clone)]
pub struct ExitHandle {
    tx: Arc<watch::Sender<Option<i32>>>,
}

impl Default for ExitHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitHandle {
    /// Create a handle with no exit requested.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request process exit with `code`.
    pub fn request_exit(&self, code: i32) {
        self.tx.send_replace(Some(code));
    }

    /// Whether exit has been requested.
    pub fn has_exited(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Most recently requested exit code.
    pub fn exit_code(&self) -> Option<i32> {
        *self.tx.borrow()
    }

    /// Subscribe to exit requests.
    pub fn subscribe(&self) -> watch::Receiver<Option<i32>> {
        self.tx.subscribe()
    }
}

/// Trait for workers.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Worker type identifier (e.g., "process", "mock").
    fn worker_type(&self) -> &'static str;

    /// Load the entry module.
    async fn load_entry(&mut self, entry: &Entry) -> Result<()>;

    /// Start serving with the loaded module.
    async fn start(&mut self) -> Result<()>;

    /// Stop and release everything the worker holds.
    async fn stop(&mut self);

    /// Whether the worker handles `signal` itself, in which case the
    /// orchestrator's default handling is skipped for that delivery.
    fn handles_signal(&self, _signal: ProcessSignal) -> bool {
        false
    }
}

/// Constructs fresh workers.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Construct a new, unloaded worker. The worker requests process exit
    /// through `exit` when it terminates on its own.
    fn construct(&self, exit: ExitHandle) -> Box<dyn Worker>;

    /// Release resources left behind by workers that are gone.
    async fn sweep(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_handle_latest_request_wins() {
        let exit = ExitHandle::new();
        assert!(!exit.has_exited());
        assert_eq!(exit.exit_code(), None);

        exit.request_exit(-1);
        exit.clone().request_exit(3);
        assert!(exit.has_exited());
        assert_eq!(exit.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_exit_handle_notifies_subscribers() {
        let exit = ExitHandle::new();
        let mut rx = exit.subscribe();

        let requester = exit.clone();
        tokio::spawn(async move { requester.request_exit(0) });

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(0));
    }
}
