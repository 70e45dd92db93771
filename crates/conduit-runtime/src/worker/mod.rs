// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker module - execution backends for entry modules.

pub mod mock;
pub mod process;
mod traits;

pub use mock::{MockWorkerFactory, MockWorkerProbe};
pub use process::{ProcessWorker, ProcessWorkerFactory};
pub use traits::*;
