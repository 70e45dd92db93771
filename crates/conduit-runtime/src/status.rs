// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-wide status record.
//!
//! Exactly one [`StatusHandle`] exists per process. The orchestrator is its only
//! writer; everything else (admin service, telemetry, codebase sync) reads
//! snapshots through a `watch` receiver.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

/// Descriptor of this process instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    /// Instance name.
    pub name: String,
    /// Instance UUID.
    pub uuid: String,
    /// Deployment mode name.
    pub mode: String,
    /// When the process started.
    pub since: DateTime<Utc>,
    /// Last successful sync or poll.
    pub timestamp: DateTime<Utc>,
    /// Version of the codebase currently running.
    pub version: String,
}

/// Writer side of the status record.
#[derive(Debug)]
pub struct StatusHandle {
    tx: watch::Sender<Status>,
}

impl StatusHandle {
    /// Create the status record for this process.
    pub fn new(name: impl Into<String>, uuid: impl Into<String>, mode: &str) -> Self {
        let now = Utc::now();
        let (tx, _) = watch::channel(Status {
            name: name.into(),
            uuid: uuid.into(),
            mode: mode.to_string(),
            since: now,
            timestamp: now,
            version: String::new(),
        });
        Self { tx }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Status {
        self.tx.borrow().clone()
    }

    /// Instance UUID.
    pub fn uuid(&self) -> String {
        self.tx.borrow().uuid.clone()
    }

    /// Subscribe to status updates.
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.tx.subscribe()
    }

    /// Stamp the current time.
    pub fn touch(&self) {
        self.tx.send_modify(|status| status.timestamp = Utc::now());
    }

    /// Record a newly running codebase version.
    pub fn update_version(&self, version: impl Into<String>) {
        let version = version.into();
        self.tx.send_modify(|status| {
            status.version = version;
            status.timestamp = Utc::now();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_status() {
        let handle = StatusHandle::new("edge-1", "uuid-1", "local");
        let status = handle.snapshot();
        assert_eq!(status.name, "edge-1");
        assert_eq!(status.uuid, "uuid-1");
        assert_eq!(status.mode, "local");
        assert_eq!(status.since, status.timestamp);
        assert!(status.version.is_empty());
    }

    #[test]
    fn test_update_version_is_visible_to_subscribers() {
        let handle = StatusHandle::new("", "uuid-1", "remote");
        let rx = handle.subscribe();
        let before = handle.snapshot().timestamp;

        handle.update_version("abc123");

        let status = rx.borrow().clone();
        assert_eq!(status.version, "abc123");
        assert!(status.timestamp >= before);
    }

    #[test]
    fn test_touch_keeps_version() {
        let handle = StatusHandle::new("", "uuid-1", "local");
        handle.update_version("v1");
        handle.touch();
        assert_eq!(handle.snapshot().version, "v1");
    }

    #[test]
    fn test_serializes_to_json() {
        let handle = StatusHandle::new("edge", "u", "local");
        let json = serde_json::to_value(handle.snapshot()).unwrap();
        assert_eq!(json["name"], "edge");
        assert_eq!(json["uuid"], "u");
        assert!(json["since"].is_string());
    }
}
