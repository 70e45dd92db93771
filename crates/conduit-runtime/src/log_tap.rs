// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log mirroring for the admin service and the admin link.
//!
//! [`LogTap`] is a `tracing_subscriber` layer registered next to the fmt
//! layer. While attached it keeps the most recent lines in a bounded buffer
//! that the admin service exposes at `GET /api/log`. Toggling the admin port
//! attaches and detaches it.
//!
//! Independently, [`LogTap::forward`] streams every line to a channel; the
//! orchestrator drains it onto the admin link so the origin repository sees
//! the worker's log. [`LogTap::shutdown_all`] stops both for the rest of the
//! process.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{SecondsFormat, Utc};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Lines kept by default.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct TapInner {
    capacity: usize,
    attached: AtomicBool,
    shut_down: AtomicBool,
    lines: Mutex<VecDeque<String>>,
    forward: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

/// Handle to the log mirror. Clones share the same buffer.
#[derive(Debug, Clone)]
pub struct LogTap {
    inner: Arc<TapInner>,
}

impl Default for LogTap {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LogTap {
    /// Create a detached tap keeping up to `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(TapInner {
                capacity: capacity.max(1),
                attached: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                lines: Mutex::new(VecDeque::new()),
                forward: Mutex::new(None),
            }),
        }
    }

    fn lines_mut(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.inner
            .lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start mirroring. Returns false once the tap has been shut down.
    pub fn attach(&self) -> bool {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.attached.store(true, Ordering::SeqCst);
        true
    }

    /// Stop mirroring and drop buffered lines.
    pub fn detach(&self) {
        self.inner.attached.store(false, Ordering::SeqCst);
        self.lines_mut().clear();
    }

    fn forward_mut(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<String>>> {
        self.inner
            .forward
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Stream every subsequent line to the returned receiver, replacing any
    /// previous forward. `None` once the tap has been shut down.
    pub fn forward(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.forward_mut() = Some(tx);
        Some(rx)
    }

    /// Stop streaming lines.
    pub fn stop_forwarding(&self) {
        self.forward_mut().take();
    }

    /// Whether lines are currently streamed.
    pub fn is_forwarding(&self) -> bool {
        self.forward_mut().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Stop mirroring and forwarding permanently.
    pub fn shutdown_all(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.stop_forwarding();
        self.detach();
    }

    /// Whether lines are currently mirrored.
    pub fn is_attached(&self) -> bool {
        self.inner.attached.load(Ordering::SeqCst)
    }

    /// Buffered lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines_mut().iter().cloned().collect()
    }

    fn push(&self, line: String) {
        let mut lines = self.lines_mut();
        while lines.len() >= self.inner.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for LogTap {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let attached = self.is_attached();
        let mut forward = self.forward_mut();
        if !attached && forward.is_none() {
            return;
        }

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        let line = format!(
            "{} {:>5} {}: {}{}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            metadata.level(),
            metadata.target(),
            visitor.message,
            visitor.fields
        );

        if attached {
            self.push(line.clone());
        }
        if let Some(tx) = forward.as_ref() {
            if tx.send(line).is_err() {
                *forward = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn with_tap(tap: &LogTap, f: impl FnOnce()) {
        let subscriber = tracing_subscriber::registry().with(tap.clone());
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn test_detached_tap_records_nothing() {
        let tap = LogTap::new(8);
        with_tap(&tap, || tracing::info!("ignored"));
        assert!(tap.lines().is_empty());
    }

    #[test]
    fn test_attached_tap_formats_lines() {
        let tap = LogTap::new(8);
        assert!(tap.attach());
        with_tap(&tap, || tracing::warn!(port = 6060, addr = "::", "Admin service listening"));

        let lines = tap.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(" WARN "));
        assert!(lines[0].contains("Admin service listening port=6060 addr=::"));
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let tap = LogTap::new(2);
        tap.attach();
        with_tap(&tap, || {
            tracing::info!("one");
            tracing::info!("two");
            tracing::info!("three");
        });
        let lines = tap.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("two"));
        assert!(lines[1].ends_with("three"));
    }

    #[test]
    fn test_forward_streams_lines_while_detached() {
        let tap = LogTap::new(8);
        let mut rx = tap.forward().unwrap();
        assert!(tap.is_forwarding());
        with_tap(&tap, || tracing::info!(generation = 2, "Worker running"));

        let line = rx.try_recv().unwrap();
        assert!(line.contains("Worker running generation=2"));
        assert!(tap.lines().is_empty());

        tap.shutdown_all();
        assert!(!tap.is_forwarding());
        assert!(tap.forward().is_none());
        with_tap(&tap, || tracing::info!("after shutdown"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_shutdown_is_permanent() {
        let tap = LogTap::new(8);
        tap.attach();
        tap.shutdown_all();
        assert!(!tap.is_attached());
        assert!(!tap.attach());
        with_tap(&tap, || tracing::info!("after shutdown"));
        assert!(tap.lines().is_empty());
    }
}
