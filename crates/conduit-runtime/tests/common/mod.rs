// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for conduit-runtime integration tests.
//!
//! Provides a recording admin link, an orchestrator fixture and snapshot
//! waiting helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;

use conduit_runtime::admin::{AdminError, AdminLink, CommandHandler, LinkConnector};
use conduit_runtime::codebase::MockCodebase;
use conduit_runtime::orchestrator::{Orchestrator, OrchestratorBuilder, Snapshot};
use conduit_runtime::status::{Status, StatusHandle};
use conduit_runtime::worker::MockWorkerFactory;

/// Instance UUID used by every fixture.
pub const TEST_UUID: &str = "5f0c6a52-0000-4000-8000-000000000001";

#[derive(Default)]
struct LinkLog {
    opened: Vec<String>,
    sent: Vec<Bytes>,
    handlers: Vec<CommandHandler>,
    closed: u32,
}

/// Admin link fake shared between the connector, the links it opens and the
/// test body.
#[derive(Clone, Default)]
pub struct FakeLink {
    log: Arc<Mutex<LinkLog>>,
    connection_id: Arc<AtomicU64>,
}

impl FakeLink {
    pub fn new() -> Self {
        let link = Self::default();
        link.connection_id.store(1, Ordering::SeqCst);
        link
    }

    fn with_log<R>(&self, f: impl FnOnce(&mut LinkLog) -> R) -> R {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut log)
    }

    /// Simulate a reconnect.
    pub fn set_connection_id(&self, id: u64) {
        self.connection_id.store(id, Ordering::SeqCst);
    }

    /// Addresses the connector was asked to open.
    pub fn opened(&self) -> Vec<String> {
        self.with_log(|log| log.opened.clone())
    }

    /// Payloads sent over the link.
    pub fn sent(&self) -> Vec<Bytes> {
        self.with_log(|log| log.sent.clone())
    }

    /// Number of close calls.
    pub fn closed(&self) -> u32 {
        self.with_log(|log| log.closed)
    }

    /// Deliver a command as the repository would; returns whether any handler
    /// recognized it.
    pub fn deliver(&self, name: &str) -> bool {
        let handlers = self.with_log(|log| log.handlers.clone());
        handlers
            .iter()
            .fold(false, |handled, handler| handler(name, &Bytes::new()) || handled)
    }
}

impl AdminLink for FakeLink {
    fn connect(&self) -> u64 {
        self.connection_id.load(Ordering::SeqCst)
    }

    fn send(&self, data: Bytes) {
        self.with_log(|log| log.sent.push(data));
    }

    fn register_command_handler(&self, handler: CommandHandler) {
        self.with_log(|log| log.handlers.push(handler));
    }

    fn close(&self) {
        self.with_log(|log| log.closed += 1);
    }
}

impl LinkConnector for FakeLink {
    fn open(&self, address: &str) -> Result<Box<dyn AdminLink>, AdminError> {
        self.with_log(|log| log.opened.push(address.to_string()));
        Ok(Box::new(self.clone()))
    }
}

/// Parsed metrics report sent over the link.
pub fn parse_report(data: &Bytes) -> serde_json::Value {
    let body = data
        .strip_prefix(b"metrics\n".as_slice())
        .expect("report must start with the metrics tag");
    serde_json::from_slice(body).expect("report must be JSON")
}

/// Status record plus a builder for a worker role around it.
pub fn worker_builder(
    mode: &str,
    codebase: MockCodebase,
    factory: MockWorkerFactory,
) -> (watch::Receiver<Status>, OrchestratorBuilder) {
    let status = StatusHandle::new("test-edge", TEST_UUID, mode);
    let status_rx = status.subscribe();
    let builder = Orchestrator::builder(status).codebase(Box::new(codebase), Arc::new(factory));
    (status_rx, builder)
}

/// Wait until `predicate` holds for the orchestrator snapshot.
pub async fn wait_for(
    rx: &mut watch::Receiver<Snapshot>,
    predicate: impl FnMut(&Snapshot) -> bool,
) -> Snapshot {
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(predicate))
        .await
        .expect("timed out waiting for orchestrator state")
        .expect("orchestrator dropped its state")
        .clone()
}
