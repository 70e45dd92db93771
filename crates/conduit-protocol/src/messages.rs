// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages for admin link control frames.

use bytes::Bytes;

/// First frame on every link connection, sent by the worker.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Hello {
    /// Link path derived from the remote codebase locator (ends with the instance uuid).
    #[prost(string, tag = "1")]
    pub path: String,
    /// Instance uuid of the connecting worker.
    #[prost(string, tag = "2")]
    pub instance_uuid: String,
}

/// A named command pushed by the repository.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Command {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
}

/// Worker's reply to a [`Command`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct CommandAck {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Whether any handler recognized the command.
    #[prost(bool, tag = "2")]
    pub handled: bool,
}
