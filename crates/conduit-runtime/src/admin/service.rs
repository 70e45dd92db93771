// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admin service.
//!
//! A locally bound HTTP endpoint, opened and closed at runtime. Every role
//! exposes status, metrics and tapped log lines; the repository role also
//! serves its codebases.
//!
//! | Route | Meaning |
//! |-------|---------|
//! | `GET /api/status` | status record |
//! | `GET /metrics` | full telemetry snapshot |
//! | `GET /api/log` | mirrored log lines |
//! | `GET /repo` | codebase names (repository role) |
//! | `GET /repo/{name}/` | entry module of a codebase |
//! | `GET /repo/{name}/{*path}` | file of a codebase |
//! | `POST /repo/{name}/{*path}` | store a file |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::{ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::tls::{self, TlsListener};
use super::{AdminOptions, Result, bind_tcp};
use crate::codebase::content_version;
use crate::config::AdminAddr;
use crate::log_tap::LogTap;
use crate::metrics::MetricsCollector;
use crate::repo::{CodebaseStore, StoreError};
use crate::status::Status;

/// How long close waits for in-flight requests.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state of the admin routes.
#[derive(Clone)]
pub struct AdminState {
    /// Status record.
    pub status: watch::Receiver<Status>,
    /// Telemetry source.
    pub metrics: Arc<dyn MetricsCollector>,
    /// Log mirror.
    pub log_tap: LogTap,
    /// Codebase store, in the repository role.
    pub repo: Option<Arc<CodebaseStore>>,
}

impl StoreError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            StoreError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

/// Build the admin router.
pub fn router(state: AdminState) -> Router {
    let mut router = Router::new()
        .route("/", get(index))
        .route("/api/status", get(status))
        .route("/metrics", get(metrics))
        .route("/api/log", get(log));

    if state.repo.is_some() {
        router = router
            .route("/repo", get(list_codebases))
            .route("/repo/{name}", get(get_entry))
            .route("/repo/{name}/", get(get_entry))
            .route("/repo/{name}/{*path}", get(get_file).post(put_file));
    }

    router.with_state(state)
}

async fn index() -> &'static str {
    "conduit admin\n\nGET /api/status\nGET /metrics\nGET /api/log\n"
}

async fn status(State(state): State<AdminState>) -> Json<Status> {
    Json(state.status.borrow().clone())
}

async fn metrics(State(state): State<AdminState>) -> Json<serde_json::Value> {
    state.metrics.collect_all();
    Json(state.metrics.snapshot())
}

async fn log(State(state): State<AdminState>) -> String {
    let mut lines = state.log_tap.lines().join("\n");
    if !lines.is_empty() {
        lines.push('\n');
    }
    lines
}

fn store(state: &AdminState) -> std::result::Result<&CodebaseStore, StoreError> {
    state
        .repo
        .as_deref()
        .ok_or_else(|| StoreError::NotFound("repository".to_string()))
}

async fn list_codebases(
    State(state): State<AdminState>,
) -> std::result::Result<Json<Vec<String>>, StoreError> {
    Ok(Json(store(&state)?.list().await?))
}

async fn get_entry(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> std::result::Result<Response, StoreError> {
    serve_file(&state, &name, "", &headers).await
}

async fn get_file(
    State(state): State<AdminState>,
    Path((name, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> std::result::Result<Response, StoreError> {
    serve_file(&state, &name, &path, &headers).await
}

/// Serve a file with a content-derived ETag, answering 304 when the client
/// already holds it.
async fn serve_file(
    state: &AdminState,
    name: &str,
    path: &str,
    headers: &HeaderMap,
) -> std::result::Result<Response, StoreError> {
    let content = store(state)?.get_file(name, path).await?;
    let etag = format!("\"{}\"", content_version(&content));

    let cached = headers
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == etag);

    let etag = HeaderValue::from_str(&etag).map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
    if cached {
        return Ok((StatusCode::NOT_MODIFIED, [(ETAG, etag)]).into_response());
    }
    Ok(([(ETAG, etag)], content).into_response())
}

async fn put_file(
    State(state): State<AdminState>,
    Path((name, path)): Path<(String, String)>,
    body: Bytes,
) -> std::result::Result<StatusCode, StoreError> {
    store(&state)?.put_file(&name, &path, body).await?;
    Ok(StatusCode::CREATED)
}

struct Running {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Admin service that can be opened, closed and reopened.
pub struct AdminService {
    state: AdminState,
    running: Option<Running>,
    bound_port: Option<u16>,
}

impl AdminService {
    /// Create a closed service.
    pub fn new(state: AdminState) -> Self {
        Self {
            state,
            running: None,
            bound_port: None,
        }
    }

    /// Whether the service is listening.
    pub fn is_open(&self) -> bool {
        self.running.is_some()
    }

    /// Address the service listens on, while open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// The log mirror wired to this service.
    pub fn log_tap(&self) -> &LogTap {
        &self.state.log_tap
    }

    /// Bind and start serving. A configured port of 0 is resolved on the first
    /// open; reopening binds the same port again.
    pub async fn open(&mut self, addr: &AdminAddr, options: &AdminOptions) -> Result<SocketAddr> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }

        let mut socket_addr = addr.resolve().await?;
        if socket_addr.port() == 0
            && let Some(port) = self.bound_port
        {
            socket_addr.set_port(port);
        }

        let listener = bind_tcp(socket_addr, options.reuse_port)?;
        let local_addr = listener.local_addr()?;
        self.bound_port = Some(local_addr.port());

        let router = router(self.state.clone());
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let graceful = async move {
            let _ = shutdown_rx.await;
        };

        let task = if options.tls.is_enabled() {
            let config = tls::server_config(&options.tls)?;
            let listener = TlsListener::new(listener, config);
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router)
                    .with_graceful_shutdown(graceful)
                    .await
                {
                    warn!(error = %e, "Admin service stopped with error");
                }
            })
        } else {
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router)
                    .with_graceful_shutdown(graceful)
                    .await
                {
                    warn!(error = %e, "Admin service stopped with error");
                }
            })
        };

        self.state.log_tap.attach();
        info!(addr = %local_addr, tls = options.tls.is_enabled(), "Admin service listening");
        self.running = Some(Running {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Stop serving and release the listener.
    pub async fn close(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        self.state.log_tap.detach();

        let _ = running.shutdown.send(());
        let mut task = running.task;
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
            warn!(addr = %running.local_addr, "Admin service did not drain in time, aborting");
            task.abort();
            let _ = task.await;
        }
        info!(addr = %running.local_addr, "Admin service closed");
    }
}
