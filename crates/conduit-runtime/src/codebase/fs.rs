// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filesystem codebase source.
//!
//! Reads run on tokio's blocking pool (`tokio::fs`), so the event loop never
//! waits on the disk; completions come back as ordinary awaits.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::traits::*;
use crate::status::Status;

/// Pseudo path of an inline (eval) entry.
pub const EVAL_ENTRY_PATH: &str = "<eval>";

#[derive(Debug, Clone)]
enum Origin {
    File(PathBuf),
    Eval(String),
}

/// Codebase backed by a local file or an inline expression.
#[derive(Debug)]
pub struct FsCodebase {
    base_dir: PathBuf,
    origin: Origin,
    entry: Option<Entry>,
    version: String,
}

impl FsCodebase {
    /// Codebase whose entry is the given file.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            base_dir,
            origin: Origin::File(path),
            entry: None,
            version: String::new(),
        }
    }

    /// Codebase whose entry is an inline expression evaluated in `base_dir`.
    pub fn from_eval(base_dir: impl Into<PathBuf>, expression: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            origin: Origin::Eval(expression.into()),
            entry: None,
            version: String::new(),
        }
    }

    /// Directory relative imports resolve against.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    async fn read_origin(&self) -> Result<Entry> {
        match &self.origin {
            Origin::File(path) => match tokio::fs::read(path).await {
                Ok(content) => Ok(Entry {
                    path: path.display().to_string(),
                    source: Bytes::from(content),
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(CodebaseError::NotFound(path.display().to_string()))
                }
                Err(e) => Err(e.into()),
            },
            Origin::Eval(expression) => Ok(Entry {
                path: EVAL_ENTRY_PATH.to_string(),
                source: Bytes::from(expression.clone()),
            }),
        }
    }
}

#[async_trait]
impl CodebaseSource for FsCodebase {
    fn kind(&self) -> &'static str {
        match self.origin {
            Origin::File(_) => "fs",
            Origin::Eval(_) => "eval",
        }
    }

    async fn sync(&mut self, _status: &Status, force: bool) -> Result<SyncOutcome> {
        let entry = self.read_origin().await?;
        let version = content_version(&entry.source);
        let changed = version != self.version;

        debug!(
            entry = %entry.path,
            version = %version,
            changed,
            force,
            "Filesystem codebase synchronized"
        );

        if !force && !changed {
            return Ok(SyncOutcome::Unchanged);
        }

        self.entry = Some(entry);
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
