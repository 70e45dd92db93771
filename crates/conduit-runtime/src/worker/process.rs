// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Child-process worker.
//!
//! Each worker generation materializes its entry module under
//! `{DATA_DIR}/runs/{instance_uuid}/{generation}/` and runs it with the
//! configured interpreter. A monitor task waits on the child; if the child
//! exits while the worker is not being stopped, its exit code becomes the
//! process exit request.
//!
//! Run directories of stopped workers are removed on stop. Directories left
//! behind by workers that were dropped without stopping (failed loads, a
//! crashed previous run) are pruned by [`WorkerFactory::sweep`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::traits::*;
use crate::codebase::Entry;

/// Time a worker gets to exit after SIGTERM before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Environment variable carrying the original entry path to the child.
pub const ENTRY_PATH_ENV: &str = "CONDUIT_ENTRY_PATH";

type LiveSet = Arc<Mutex<HashSet<u64>>>;

fn with_live<R>(live: &LiveSet, f: impl FnOnce(&mut HashSet<u64>) -> R) -> R {
    let mut guard = live.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

/// Factory for [`ProcessWorker`]s.
#[derive(Debug)]
pub struct ProcessWorkerFactory {
    command: String,
    runs_dir: PathBuf,
    grace: Duration,
    next_generation: AtomicU64,
    live: LiveSet,
}

impl ProcessWorkerFactory {
    /// Create a factory running entries with `command`.
    pub fn new(command: impl Into<String>, data_dir: &Path, instance_uuid: &str) -> Self {
        Self {
            command: command.into(),
            runs_dir: data_dir.join("runs").join(instance_uuid),
            grace: DEFAULT_STOP_GRACE,
            next_generation: AtomicU64::new(0),
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Override the stop grace period.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Directory holding this instance's run directories.
    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    fn construct(&self, exit: ExitHandle) -> Box<dyn Worker> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        with_live(&self.live, |live| live.insert(generation));
        Box::new(ProcessWorker {
            command: self.command.clone(),
            dir: self.runs_dir.join(generation.to_string()),
            generation,
            live: self.live.clone(),
            exit,
            grace: self.grace,
            loaded: None,
            running: None,
        })
    }

    async fn sweep(&self) {
        let mut run_dirs = match tokio::fs::read_dir(&self.runs_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = %self.runs_dir.display(), error = %e, "Failed to read runs directory");
                return;
            }
        };

        let mut cleaned = 0u64;
        while let Ok(Some(run_entry)) = run_dirs.next_entry().await {
            let run_path = run_entry.path();
            let generation = run_entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok());
            let Some(generation) = generation else {
                continue;
            };
            if with_live(&self.live, |live| live.contains(&generation)) {
                continue;
            }

            match tokio::fs::remove_dir_all(&run_path).await {
                Ok(()) => {
                    debug!(path = %run_path.display(), "Removed stale run directory");
                    cleaned += 1;
                }
                Err(e) => {
                    warn!(path = %run_path.display(), error = %e, "Failed to remove stale run directory");
                }
            }
        }

        if cleaned > 0 {
            info!(cleaned, "Worker sweep completed");
        }
    }
}

#[derive(Debug)]
struct Loaded {
    file: PathBuf,
    entry_path: String,
}

#[derive(Debug)]
struct Running {
    pid: Option<u32>,
    stopping: Arc<AtomicBool>,
    monitor: JoinHandle<()>,
}

/// Worker running its entry module in a child process.
#[derive(Debug)]
pub struct ProcessWorker {
    command: String,
    dir: PathBuf,
    generation: u64,
    live: LiveSet,
    exit: ExitHandle,
    grace: Duration,
    loaded: Option<Loaded>,
    running: Option<Running>,
}

impl ProcessWorker {
    /// This worker's run directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// PID of the child, while running.
    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().and_then(|running| running.pid)
    }
}

/// File name for a materialized entry.
fn entry_file_name(entry_path: &str) -> String {
    Path::new(entry_path)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.starts_with('<') && !name.is_empty())
        .unwrap_or("main")
        .to_string()
}

#[async_trait]
impl Worker for ProcessWorker {
    fn worker_type(&self) -> &'static str {
        "process"
    }

    async fn load_entry(&mut self, entry: &Entry) -> Result<()> {
        if entry.source.is_empty() {
            return Err(WorkerError::LoadFailed {
                path: entry.path.clone(),
                reason: "entry module is empty".to_string(),
            });
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let file = self.dir.join(entry_file_name(&entry.path));
        tokio::fs::write(&file, &entry.source).await?;

        debug!(
            generation = self.generation,
            entry = %entry.path,
            file = %file.display(),
            "Entry module materialized"
        );

        self.loaded = Some(Loaded {
            file,
            entry_path: entry.path.clone(),
        });
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        let loaded = self.loaded.as_ref().ok_or(WorkerError::NotLoaded)?;

        let mut child = Command::new(&self.command)
            .arg(&loaded.file)
            .current_dir(&self.dir)
            .env(ENTRY_PATH_ENV, &loaded.entry_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::StartFailed(format!("{}: {e}", self.command)))?;

        let pid = child.id();
        let stopping = Arc::new(AtomicBool::new(false));
        let exit = self.exit.clone();
        let generation = self.generation;
        let monitor_stopping = stopping.clone();

        let monitor = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!(generation, error = %e, "Failed to wait for worker process");
                    -1
                }
            };
            if !monitor_stopping.load(Ordering::SeqCst) {
                info!(generation, code, "Worker process exited");
                exit.request_exit(code);
            }
        });

        info!(generation, pid = ?pid, command = %self.command, "Worker process started");
        self.running = Some(Running {
            pid,
            stopping,
            monitor,
        });
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stopping.store(true, Ordering::SeqCst);

            if let Some(pid) = running.pid.and_then(|pid| i32::try_from(pid).ok()) {
                match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
                    Ok(()) => debug!(pid, "Sent SIGTERM to worker process"),
                    Err(nix::errno::Errno::ESRCH) => debug!(pid, "Worker process already gone"),
                    Err(e) => warn!(pid, error = %e, "Failed to send SIGTERM to worker process"),
                }
            }

            let mut monitor = running.monitor;
            if tokio::time::timeout(self.grace, &mut monitor).await.is_err() {
                warn!(
                    generation = self.generation,
                    "Worker process ignored SIGTERM, killing"
                );
                // Dropping the child inside the aborted monitor kills it.
                monitor.abort();
                let _ = monitor.await;
            }
        }

        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.dir.display(), error = %e, "Failed to remove run directory");
        }
        self.loaded = None;
        with_live(&self.live, |live| live.remove(&self.generation));
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stopping.store(true, Ordering::SeqCst);
            running.monitor.abort();
        }
        with_live(&self.live, |live| live.remove(&self.generation));
    }
}
