// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conduit Protocol - admin link wire format
//!
//! This crate provides the wire format spoken between a remote-codebase worker
//! and the repository (or repository proxy) it pulled its codebase from.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    conduit-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Link Layer: Hello, Command/CommandAck, Data (telemetry)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost) + raw data frames          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: any AsyncRead + AsyncWrite (TCP in practice)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Link session
//!
//! ```text
//!   worker                                repository
//!     │ ── Hello { path, instance_uuid } ──► │
//!     │ ◄──────── Command { name, payload } ─ │
//!     │ ── CommandAck { name, handled } ───► │
//!     │ ── Data ("metrics\n" + report) ────► │
//! ```
//!
//! The worker opens the connection and always speaks first. After the
//! `Hello`, both directions are independent: the repository pushes commands
//! whenever it wants and the worker pushes telemetry on its own schedule.
//!
//! # Usage
//!
//! ```ignore
//! use conduit_protocol::{Frame, FramedStream, messages::Hello};
//!
//! let stream = tokio::net::TcpStream::connect("repo:6060").await?;
//! let mut framed = FramedStream::new(stream);
//! framed
//!     .write_frame(&Frame::hello(&Hello {
//!         path: "/repo/app/".to_string(),
//!         instance_uuid: uuid.to_string(),
//!     })?)
//!     .await?;
//! ```

pub mod frame;
pub mod messages;

pub use frame::{Frame, FrameError, FramedStream, MessageType};
pub use messages::{Command, CommandAck, Hello};
