// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conduit Runtime - bootstrap and lifecycle orchestration
//!
//! This crate decides what role a conduit process plays, brings up the pieces
//! that role needs and keeps them running until the process exits.
//!
//! # Roles
//!
//! | Source argument | Role | What runs |
//! |-----------------|------|-----------|
//! | (empty) or a directory | Repository | Admin service with codebase store routes |
//! | `host:port` or `http(s)://host:port` | Repository proxy | Admin proxy to the upstream |
//! | `http(s)://host/path` | Remote worker | HTTP codebase, worker, admin link |
//! | file path or `--eval` | Local worker | Filesystem codebase, worker |
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Orchestrator                              │
//! │                                                                  │
//! │   signals ──┐                                                    │
//! │   link cmd ─┼──► event loop ──► pipeline: sync → load → start    │
//! │   timers ───┘        │                        │                  │
//! │                      │                        ▼                  │
//! │                      │            ┌──────────────────────┐       │
//! │                      │            │ Worker (replaced on  │       │
//! │                      │            │ every good reload)   │       │
//! │                      ▼            └──────────────────────┘       │
//! │   ┌──────────────┐ ┌────────────┐ ┌────────────┐ ┌───────────┐   │
//! │   │ AdminService │ │ AdminProxy │ │ AdminLink  │ │  Status   │   │
//! │   └──────────────┘ └────────────┘ └────────────┘ └───────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Signals
//!
//! | Signal | Effect |
//! |--------|--------|
//! | `SIGINT` | Shut down (a second delivery forces exit) |
//! | `SIGHUP` | Reload the codebase |
//! | `SIGTSTP` | Toggle the admin service |
//!
//! A running worker may claim any signal before the orchestrator sees it.
//!
//! # Modules
//!
//! - [`config`]: Command line and environment configuration
//! - [`mode`]: Deployment mode resolution
//! - [`orchestrator`]: Event loop and pipeline
//! - [`runtime`]: Wiring a [`config::Config`] into an orchestrator
//! - [`codebase`]: Codebase sources
//! - [`worker`]: Worker backends
//! - [`admin`]: Admin service, proxy and link

#![warn(missing_docs)]

/// Admin service, admin proxy and admin link.
pub mod admin;

/// Codebase sources: filesystem, HTTP and mock.
pub mod codebase;

/// Command line and environment configuration.
pub mod config;

/// Error types for runtime operations.
pub mod error;

/// Tracing layer that feeds the admin log endpoint.
pub mod log_tap;

/// Telemetry counters and their wire report.
pub mod metrics;

/// Deployment mode resolution.
pub mod mode;

/// Lifecycle orchestrator.
pub mod orchestrator;

/// Codebase store served by the repository role.
pub mod repo;

/// Process assembly from configuration.
pub mod runtime;

/// Operator signal subscription.
pub mod signals;

/// Process-wide status record.
pub mod status;

/// Worker backends.
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
pub use mode::Mode;
pub use orchestrator::{Orchestrator, OrchestratorHandle, RunOutcome, Snapshot, Stage};
pub use runtime::ConduitRuntime;
