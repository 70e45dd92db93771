// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Codebase store for the repository role.
//!
//! A repository serves any number of named codebases, each a tree of files
//! with one entry module ([`ENTRY_FILE`]). The store is kept in memory when
//! the repository is started without a source, or backed by a directory whose
//! immediate sub-directories are the codebases.

use std::collections::BTreeMap;
use std::path::PathBuf;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// File served when a codebase is requested without a path.
pub const ENTRY_FILE: &str = "main";

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A codebase name or file path is not acceptable.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// The codebase or file does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

type Files = BTreeMap<String, Bytes>;

#[derive(Debug)]
enum Backend {
    Memory(RwLock<BTreeMap<String, Files>>),
    Directory(PathBuf),
}

/// Store of named codebases.
#[derive(Debug)]
pub struct CodebaseStore {
    backend: Backend,
}

/// Check a single path segment.
fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains('\\')
        && !segment.contains('\0')
}

/// Normalize a file path inside a codebase; empty means the entry file.
fn normalize(path: &str) -> Result<String> {
    let path = path.trim_matches('/');
    if path.is_empty() {
        return Ok(ENTRY_FILE.to_string());
    }
    if path.split('/').all(valid_segment) {
        Ok(path.to_string())
    } else {
        Err(StoreError::InvalidPath(path.to_string()))
    }
}

fn check_name(name: &str) -> Result<()> {
    if valid_segment(name) && !name.contains('/') {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(name.to_string()))
    }
}

impl CodebaseStore {
    /// In-memory store.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(RwLock::new(BTreeMap::new())),
        }
    }

    /// Store backed by `root`.
    pub fn directory(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: Backend::Directory(root.into()),
        }
    }

    /// Backend name for logs.
    pub fn kind(&self) -> &'static str {
        match self.backend {
            Backend::Memory(_) => "memory",
            Backend::Directory(_) => "directory",
        }
    }

    /// Names of all codebases, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        match &self.backend {
            Backend::Memory(codebases) => Ok(codebases.read().await.keys().cloned().collect()),
            Backend::Directory(root) => {
                let mut names = Vec::new();
                let mut dirs = match tokio::fs::read_dir(root).await {
                    Ok(d) => d,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
                    Err(e) => return Err(e.into()),
                };
                while let Some(entry) = dirs.next_entry().await? {
                    if !entry.file_type().await?.is_dir() {
                        continue;
                    }
                    if let Some(name) = entry.file_name().to_str()
                        && !name.starts_with('.')
                    {
                        names.push(name.to_string());
                    }
                }
                names.sort();
                Ok(names)
            }
        }
    }

    /// Content of `path` in codebase `name` (the entry file when `path` is
    /// empty).
    pub async fn get_file(&self, name: &str, path: &str) -> Result<Bytes> {
        check_name(name)?;
        let path = normalize(path)?;
        let not_found = || StoreError::NotFound(format!("{name}/{path}"));

        match &self.backend {
            Backend::Memory(codebases) => codebases
                .read()
                .await
                .get(name)
                .and_then(|files| files.get(&path))
                .cloned()
                .ok_or_else(not_found),
            Backend::Directory(root) => match tokio::fs::read(root.join(name).join(&path)).await {
                Ok(content) => Ok(Bytes::from(content)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
                Err(e) if e.kind() == std::io::ErrorKind::IsADirectory => Err(not_found()),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Write `path` in codebase `name`, creating the codebase if needed.
    pub async fn put_file(&self, name: &str, path: &str, content: Bytes) -> Result<()> {
        check_name(name)?;
        let path = normalize(path)?;
        debug!(codebase = name, path = %path, bytes = content.len(), "Storing codebase file");

        match &self.backend {
            Backend::Memory(codebases) => {
                codebases
                    .write()
                    .await
                    .entry(name.to_string())
                    .or_default()
                    .insert(path, content);
                Ok(())
            }
            Backend::Directory(root) => {
                let file = root.join(name).join(&path);
                if let Some(parent) = file.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(file, content).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("").unwrap(), ENTRY_FILE);
        assert_eq!(normalize("/").unwrap(), ENTRY_FILE);
        assert_eq!(normalize("lib/util.js").unwrap(), "lib/util.js");
        assert!(normalize("../etc/passwd").is_err());
        assert!(normalize("a//b").is_err());
        assert!(normalize("a/./b").is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = CodebaseStore::in_memory();
        assert!(store.list().await.unwrap().is_empty());

        store
            .put_file("app", "", Bytes::from_static(b"entry"))
            .await
            .unwrap();
        store
            .put_file("app", "lib/x.js", Bytes::from_static(b"x"))
            .await
            .unwrap();
        store
            .put_file("alpha", "main", Bytes::from_static(b"a"))
            .await
            .unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["alpha", "app"]);
        assert_eq!(store.get_file("app", "/").await.unwrap(), "entry");
        assert_eq!(store.get_file("app", "lib/x.js").await.unwrap(), "x");
        assert!(matches!(
            store.get_file("app", "missing").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.get_file("..", "").await,
            Err(StoreError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_directory_store() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("web")).unwrap();
        std::fs::write(dir.path().join("web").join("main"), "serve()").unwrap();
        std::fs::write(dir.path().join("README"), "not a codebase").unwrap();

        let store = CodebaseStore::directory(dir.path());
        assert_eq!(store.kind(), "directory");
        assert_eq!(store.list().await.unwrap(), vec!["web"]);
        assert_eq!(store.get_file("web", "").await.unwrap(), "serve()");

        store
            .put_file("api", "lib/a.js", Bytes::from_static(b"a"))
            .await
            .unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["api", "web"]);
        assert!(dir.path().join("api/lib/a.js").exists());
        assert!(store.put_file("api", "../../x", Bytes::new()).await.is_err());
    }
}
