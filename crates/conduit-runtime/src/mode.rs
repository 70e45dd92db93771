// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment mode resolution.
//!
//! The single source argument decides which role the process takes for its
//! whole lifetime. Resolution is pure string inspection except for the final
//! step, which checks whether a path exists and whether it is a directory.
//!
//! | Source | Mode |
//! |--------|------|
//! | `--eval` given | [`Mode::Local`] with an eval source |
//! | empty | [`Mode::Repository`] backed by memory |
//! | `http(s)://host:port[/]` | [`Mode::RepositoryProxy`] to `host:port` |
//! | `http(s)://...` (anything else) | [`Mode::Remote`] |
//! | `host:port` | [`Mode::RepositoryProxy`] |
//! | existing directory | [`Mode::Repository`] backed by that directory |
//! | existing file | [`Mode::Local`] |

use std::path::{Path, PathBuf};

use crate::config::ConfigError;

/// Where a local codebase comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalSource {
    /// Entry module read from a file.
    File(PathBuf),
    /// Inline script evaluated against a base directory.
    Eval {
        base_dir: PathBuf,
        expression: String,
    },
}

/// The deployment role of this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Codebase repository server.
    Repository { store_path: Option<PathBuf> },
    /// Forwarder for admin traffic to an upstream repository.
    RepositoryProxy { target: String },
    /// Worker running a codebase fetched over HTTP(S). The URL scheme picks
    /// TLS for both the fetch and the admin link.
    Remote { url: String },
    /// Worker running a codebase from the local filesystem.
    Local { source: LocalSource },
}

impl Mode {
    /// Short name used in logs and status.
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Repository { .. } => "repository",
            Mode::RepositoryProxy { .. } => "repository-proxy",
            Mode::Remote { .. } => "remote",
            Mode::Local { .. } => "local",
        }
    }

    /// Whether this role runs a worker.
    pub fn is_worker(&self) -> bool {
        matches!(self, Mode::Remote { .. } | Mode::Local { .. })
    }

    /// Whether pipeline failures are retried instead of fatal.
    pub fn is_remote(&self) -> bool {
        matches!(self, Mode::Remote { .. })
    }
}

/// Resolve the deployment mode from the source argument and the eval flag.
pub fn resolve_mode(source: &str, eval: bool) -> Result<Mode, ConfigError> {
    if eval {
        let base_dir = absolute(Path::new("."))?;
        return Ok(Mode::Local {
            source: LocalSource::Eval {
                base_dir,
                expression: source.to_string(),
            },
        });
    }

    if source.is_empty() {
        return Ok(Mode::Repository { store_path: None });
    }

    if source.starts_with("http://") || source.starts_with("https://") {
        let authority = source
            .split_once("//")
            .map(|(_, rest)| rest)
            .unwrap_or_default();
        let authority = authority.strip_suffix('/').unwrap_or(authority);
        if is_host_port(authority) {
            return Ok(Mode::RepositoryProxy {
                target: authority.to_string(),
            });
        }
        return Ok(Mode::Remote {
            url: source.to_string(),
        });
    }

    if is_host_port(source) {
        return Ok(Mode::RepositoryProxy {
            target: source.to_string(),
        });
    }

    let path = absolute(Path::new(source))?;
    let metadata = match std::fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::SourceNotFound(path));
        }
        Err(source) => return Err(ConfigError::Inspect { path, source }),
    };

    if metadata.is_dir() {
        Ok(Mode::Repository {
            store_path: Some(path),
        })
    } else {
        Ok(Mode::Local {
            source: LocalSource::File(path),
        })
    }
}

fn absolute(path: &Path) -> Result<PathBuf, ConfigError> {
    std::path::absolute(path).map_err(|source| ConfigError::Inspect {
        path: path.to_path_buf(),
        source,
    })
}

/// Whether `value` is `host:port` with a non-empty host and a port that can
/// be dialed.
pub fn is_host_port(value: &str) -> bool {
    matches!(split_host_port(value), Some((host, port)) if !host.is_empty() && port != 0)
}

/// Split `host:port`, accepting bracketed IPv6 hosts, an empty host and
/// port 0 (bind to an ephemeral port).
pub fn split_host_port(value: &str) -> Option<(&str, u16)> {
    let (host, port) = value.rsplit_once(':')?;
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let port: u16 = port.parse().ok()?;

    if let Some(inner) = host.strip_prefix('[') {
        let inner = inner.strip_suffix(']')?;
        inner.parse::<std::net::Ipv6Addr>().ok()?;
        return Some((inner, port));
    }

    let valid = host
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_'));
    valid.then_some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_source_is_memory_repository() {
        assert_eq!(
            resolve_mode("", false).unwrap(),
            Mode::Repository { store_path: None }
        );
    }

    #[test]
    fn test_eval_wins_over_everything() {
        let mode = resolve_mode("localhost:8080", true).unwrap();
        match mode {
            Mode::Local {
                source: LocalSource::Eval { expression, base_dir },
            } => {
                assert_eq!(expression, "localhost:8080");
                assert!(base_dir.is_absolute());
            }
            other => panic!("unexpected mode: {other:?}"),
        }
    }

    #[test]
    fn test_host_port_is_proxy() {
        assert_eq!(
            resolve_mode("localhost:6060", false).unwrap(),
            Mode::RepositoryProxy {
                target: "localhost:6060".to_string()
            }
        );
        assert_eq!(
            resolve_mode("[::1]:6060", false).unwrap(),
            Mode::RepositoryProxy {
                target: "[::1]:6060".to_string()
            }
        );
    }

    #[test]
    fn test_url_with_bare_authority_is_proxy() {
        assert_eq!(
            resolve_mode("http://repo.local:6060/", false).unwrap(),
            Mode::RepositoryProxy {
                target: "repo.local:6060".to_string()
            }
        );
        assert_eq!(
            resolve_mode("https://10.0.0.1:6060", false).unwrap(),
            Mode::RepositoryProxy {
                target: "10.0.0.1:6060".to_string()
            }
        );
    }

    #[test]
    fn test_url_with_path_is_remote() {
        assert_eq!(
            resolve_mode("http://repo.local:6060/repo/app/", false).unwrap(),
            Mode::Remote {
                url: "http://repo.local:6060/repo/app/".to_string(),
            }
        );
        assert_eq!(
            resolve_mode("https://repo.example.com/app", false).unwrap(),
            Mode::Remote {
                url: "https://repo.example.com/app".to_string(),
            }
        );
    }

    #[test]
    fn test_existing_file_is_local() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("main.js");
        std::fs::write(&file, "pipeline()").unwrap();

        let mode = resolve_mode(file.to_str().unwrap(), false).unwrap();
        assert_eq!(
            mode,
            Mode::Local {
                source: LocalSource::File(file)
            }
        );
        assert!(mode.is_worker());
        assert!(!mode.is_remote());
    }

    #[test]
    fn test_existing_directory_is_repository() {
        let dir = TempDir::new().unwrap();
        let mode = resolve_mode(dir.path().to_str().unwrap(), false).unwrap();
        assert_eq!(
            mode,
            Mode::Repository {
                store_path: Some(dir.path().to_path_buf())
            }
        );
        assert!(!mode.is_worker());
    }

    #[test]
    fn test_missing_path_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.js");
        let err = resolve_mode(missing.to_str().unwrap(), false).unwrap_err();
        assert!(matches!(err, ConfigError::SourceNotFound(ref p) if p == &missing));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("a.b:80"), Some(("a.b", 80)));
        assert_eq!(split_host_port(":80"), Some(("", 80)));
        assert_eq!(split_host_port("[::1]:80"), Some(("::1", 80)));
        assert_eq!(split_host_port("host:0"), Some(("host", 0)));
        assert_eq!(split_host_port("host:http"), None);
        assert_eq!(split_host_port("host:99999"), None);
        assert_eq!(split_host_port("a/b:80"), None);
        assert_eq!(split_host_port("::1:80"), None);
        assert!(!is_host_port(":80"));
        assert!(is_host_port("repo:6060"));
        assert!(!is_host_port("repo:0"));
    }
}
