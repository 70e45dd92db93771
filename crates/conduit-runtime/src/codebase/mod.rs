// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Codebase sources - where worker code comes from.

pub mod fs;
pub mod http;
pub mod mock;
mod traits;

pub use fs::FsCodebase;
pub use http::HttpCodebase;
pub use mock::MockCodebase;
pub use traits::*;
