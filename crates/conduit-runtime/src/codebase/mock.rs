// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock codebase for testing.
//!
//! Serves an in-memory entry whose version is controlled through a
//! [`MockCodebaseProbe`]. Failures and sync latency can be scripted so the
//! orchestrator's retry and single-flight behavior can be exercised without
//! touching the network.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::traits::*;
use crate::status::Status;

/// Entry path reported by the mock.
pub const MOCK_ENTRY_PATH: &str = "mock://main";

#[derive(Debug, Default)]
struct MockState {
    version: String,
    fail_remaining: u32,
    fail_always: bool,
    syncs: u32,
    forced_syncs: u32,
    failures: u32,
}

/// Mock codebase source.
#[derive(Debug)]
pub struct MockCodebase {
    state: Arc<Mutex<MockState>>,
    /// Simulated sync latency.
    pub sync_delay: Duration,
    entry: Option<Entry>,
    version: String,
}

/// Shared view into a [`MockCodebase`], usable after the codebase has been
/// handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct MockCodebaseProbe {
    state: Arc<Mutex<MockState>>,
}

impl MockCodebase {
    /// Create a mock whose origin currently holds `version`.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                version: version.into(),
                ..Default::default()
            })),
            sync_delay: Duration::ZERO,
            entry: None,
            version: String::new(),
        }
    }

    /// Fail the first `n` syncs.
    pub fn fail_first(self, n: u32) -> Self {
        lock(&self.state).fail_remaining = n;
        self
    }

    /// Delay every sync by `delay`.
    pub fn with_sync_delay(mut self, delay: Duration) -> Self {
        self.sync_delay = delay;
        self
    }

    /// Probe sharing this mock's state.
    pub fn probe(&self) -> MockCodebaseProbe {
        MockCodebaseProbe {
            state: self.state.clone(),
        }
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockCodebaseProbe {
    /// Publish a new version at the origin.
    pub async fn set_version(&self, version: impl Into<String>) {
        lock(&self.state).version = version.into();
    }

    /// Make every subsequent sync fail (or succeed again).
    pub async fn set_failing(&self, failing: bool) {
        lock(&self.state).fail_always = failing;
    }

    /// Number of syncs started.
    pub async fn sync_count(&self) -> u32 {
        lock(&self.state).syncs
    }

    /// Number of forced syncs started.
    pub async fn forced_sync_count(&self) -> u32 {
        lock(&self.state).forced_syncs
    }

    /// Number of syncs that failed.
    pub async fn failure_count(&self) -> u32 {
        lock(&self.state).failures
    }
}

#[async_trait]
impl CodebaseSource for MockCodebase {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn sync(&mut self, _status: &Status, force: bool) -> Result<SyncOutcome> {
        {
            let mut state = lock(&self.state);
            state.syncs += 1;
            if force {
                state.forced_syncs += 1;
            }
        }

        if !self.sync_delay.is_zero() {
            tokio::time::sleep(self.sync_delay).await;
        }

        let version = {
            let mut state = lock(&self.state);
            if state.fail_always || state.fail_remaining > 0 {
                state.fail_remaining = state.fail_remaining.saturating_sub(1);
                state.failures += 1;
                return Err(CodebaseError::Other("mock sync failure".to_string()));
            }
            state.version.clone()
        };

        if !force && version == self.version {
            return Ok(SyncOutcome::Unchanged);
        }

        self.entry = Some(Entry {
            path: MOCK_ENTRY_PATH.to_string(),
            source: Bytes::from(version.clone()),
        });
        self.version = version;
        Ok(SyncOutcome::Updated)
    }

    fn entry(&self) -> Option<&Entry> {
        self.entry.as_ref()
    }

    fn version(&self) -> &str {
        &self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusHandle;

    fn status() -> Status {
        StatusHandle::new("", "uuid", "remote").snapshot()
    }

    #[tokio::test]
    async fn test_mock_scripted_failures() {
        let mut codebase = MockCodebase::new("v1").fail_first(2);
        let probe = codebase.probe();

        assert!(codebase.sync(&status(), true).await.is_err());
        assert!(codebase.sync(&status(), true).await.is_err());
        assert_eq!(
            codebase.sync(&status(), true).await.unwrap(),
            SyncOutcome::Updated
        );
        assert_eq!(codebase.version(), "v1");
        assert_eq!(codebase.entry_path(), Some(MOCK_ENTRY_PATH));
        assert_eq!(probe.sync_count().await, 3);
        assert_eq!(probe.failure_count().await, 2);
    }

    #[tokio::test]
    async fn test_fail_first_applies_with_probe_outstanding() {
        let codebase = MockCodebase::new("v1");
        let probe = codebase.probe();
        let mut codebase = codebase.fail_first(1);

        assert!(codebase.sync(&status(), true).await.is_err());
        assert!(codebase.sync(&status(), true).await.is_ok());
        assert_eq!(probe.failure_count().await, 1);
    }

    #[tokio::test]
    async fn test_mock_version_changes() {
        let mut codebase = MockCodebase::new("v1");
        let probe = codebase.probe();

        codebase.sync(&status(), true).await.unwrap();
        assert_eq!(
            codebase.sync(&status(), false).await.unwrap(),
            SyncOutcome::Unchanged
        );

        probe.set_version("v2").await;
        assert_eq!(
            codebase.sync(&status(), false).await.unwrap(),
            SyncOutcome::Updated
        );
        assert_eq!(codebase.version(), "v2");
        assert_eq!(probe.forced_sync_count().await, 1);
    }

    #[tokio::test]
    async fn test_mock_failing_keeps_previous_entry() {
        let mut codebase = MockCodebase::new("v1");
        let probe = codebase.probe();
        codebase.sync(&status(), true).await.unwrap();

        probe.set_failing(true).await;
        assert!(codebase.sync(&status(), false).await.is_err());
        assert_eq!(codebase.version(), "v1");
        assert!(codebase.entry().is_some());
    }
}
