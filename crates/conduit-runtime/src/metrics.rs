// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Telemetry collection.
//!
//! The orchestrator records lifecycle counters into a [`MetricsRegistry`].
//! Reports pushed over the admin link are either full (every metric) or
//! deltas (only metrics whose value changed since the previous report). The
//! receiver asks for a full report implicitly by being a new connection.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde_json::Value;

/// Pipeline runs started.
pub const PIPELINE_RUNS: &str = "conduit_pipeline_runs_total";
/// Pipeline runs that failed.
pub const PIPELINE_FAILURES: &str = "conduit_pipeline_failures_total";
/// Workers started.
pub const WORKER_STARTS: &str = "conduit_worker_starts_total";
/// Reload poll ticks.
pub const RELOAD_POLLS: &str = "conduit_reload_polls_total";
/// Triggers coalesced into an in-flight run.
pub const COALESCED_TRIGGERS: &str = "conduit_coalesced_triggers_total";
/// Retries scheduled after failed runs.
pub const RETRIES: &str = "conduit_retries_total";
/// Seconds since the registry was created.
pub const UPTIME_SECONDS: &str = "conduit_uptime_seconds";

/// Telemetry collector contract.
pub trait MetricsCollector: Send + Sync {
    /// Refresh sampled values.
    fn collect_all(&self);

    /// Append one report for `instance` to `buf`. With `full` every metric is
    /// included, otherwise only those changed since the previous report.
    fn serialize(&self, buf: &mut BytesMut, instance: &str, full: bool);

    /// All current values.
    fn snapshot(&self) -> Value;
}

#[derive(Debug, Default)]
struct Inner {
    values: BTreeMap<&'static str, i64>,
    reported: BTreeMap<&'static str, i64>,
}

/// In-process metrics registry.
#[derive(Debug)]
pub struct MetricsRegistry {
    started: Instant,
    inner: Mutex<Inner>,
}

#[derive(Serialize)]
struct Report<'a> {
    instance: &'a str,
    full: bool,
    metrics: BTreeMap<&'static str, i64>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `n` to a counter.
    pub fn add(&self, name: &'static str, n: i64) {
        *self.lock().values.entry(name).or_default() += n;
    }

    /// Increment a counter.
    pub fn increment(&self, name: &'static str) {
        self.add(name, 1);
    }

    /// Set a gauge.
    pub fn set(&self, name: &'static str, value: i64) {
        self.lock().values.insert(name, value);
    }

    /// Current value of a metric.
    pub fn get(&self, name: &str) -> Option<i64> {
        self.lock().values.get(name).copied()
    }
}

impl MetricsCollector for MetricsRegistry {
    fn collect_all(&self) {
        let uptime = i64::try_from(self.started.elapsed().as_secs()).unwrap_or(i64::MAX);
        self.set(UPTIME_SECONDS, uptime);
    }

    fn serialize(&self, buf: &mut BytesMut, instance: &str, full: bool) {
        let mut inner = self.lock();
        let metrics: BTreeMap<_, _> = inner
            .values
            .iter()
            .filter(|(name, value)| full || inner.reported.get(*name) != Some(*value))
            .map(|(name, value)| (*name, *value))
            .collect();
        inner.reported = inner.values.clone();
        drop(inner);

        let report = Report {
            instance,
            full,
            metrics,
        };
        let mut writer = buf.writer();
        // Serializing string keys and integers into memory cannot fail.
        let _ = serde_json::to_writer(&mut writer, &report);
        writer.into_inner().put_u8(b'\n');
    }

    fn snapshot(&self) -> Value {
        let inner = self.lock();
        Value::Object(
            inner
                .values
                .iter()
                .map(|(name, value)| (name.to_string(), Value::from(*value)))
                .collect(),
        )
    }
}
