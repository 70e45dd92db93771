// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle orchestrator.
//!
//! The orchestrator owns everything that changes over the life of the
//! process: the codebase source, the active worker, the admin service, the
//! admin proxy and the admin link. It runs as a single event loop; signals,
//! link commands, timer ticks and pipeline completions are all handled there,
//! one at a time.
//!
//! # Pipeline
//!
//! ```text
//! Idle -> Syncing -> Loading -> Starting -> Running
//!            \          \          \
//!             +----------+----------+--> Failed
//! ```
//!
//! A pipeline run borrows the codebase source and hands it back on
//! completion, together with the newly started worker. While a run is in
//! flight the source is absent, so a second run cannot begin: reload
//! triggers arriving in that window are coalesced. A reload that lands
//! during a background poll is deferred and runs once the poll is done.
//!
//! The new worker is started before the old one is stopped. A failed run
//! with no worker running is retried after a fixed delay in remote mode and
//! is fatal otherwise; a failed reload leaves the running worker in place.
//!
//! In remote mode the admin link also carries the process log: every line
//! the [`LogTap`] sees goes out as a `log\n` tagged data block until the
//! first interrupt.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::admin::link::{AdminLink, LinkConnector, link_address};
use crate::admin::{AdminOptions, AdminProxy, AdminService, AdminState};
use crate::codebase::{CodebaseError, CodebaseSource, SyncOutcome};
use crate::config::AdminAddr;
use crate::log_tap::LogTap;
use crate::metrics::{self, MetricsCollector, MetricsRegistry};
use crate::repo::CodebaseStore;
use crate::signals::ProcessSignal;
use crate::status::{Status, StatusHandle};
use crate::worker::{ExitHandle, Worker, WorkerError, WorkerFactory};

/// Default reload poll interval.
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(5);
/// Default metrics report interval.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);
/// Default delay before retrying a failed remote pipeline.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Default interval between worker sweeps.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Exit code requested by an interrupt or a fatal pipeline failure.
pub const FAILURE_EXIT_CODE: i32 = -1;

/// Data block tag for telemetry sent over the admin link.
const METRICS_TAG: &[u8] = b"metrics\n";
/// Data block tag for log lines sent over the admin link.
const LOG_TAG: &[u8] = b"log\n";

/// Command name that triggers a reload.
pub const RELOAD_COMMAND: &str = "reload";

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Nothing has run yet (or this role runs no worker).
    Idle,
    /// Synchronizing the codebase.
    Syncing,
    /// Loading the entry module into a new worker.
    Loading,
    /// Starting the new worker.
    Starting,
    /// A worker is serving.
    Running,
    /// The last run failed and no worker is serving.
    Failed,
}

/// Process lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Normal operation.
    Active,
    /// An interrupt was received; the process is on its way out.
    ShuttingDown,
}

/// Observable orchestrator state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Pipeline stage.
    pub stage: Stage,
    /// Lifecycle state.
    pub lifecycle: Lifecycle,
    /// Pipeline runs begun (startup, retries and reloads; polls excluded).
    pub runs_started: u32,
    /// Triggers dropped because a run was in flight.
    pub runs_coalesced: u32,
    /// Retries scheduled after failed runs.
    pub retries_scheduled: u32,
    /// Reload polls begun.
    pub polls: u32,
    /// Whether a worker is serving.
    pub worker_running: bool,
    /// Whether the admin service is listening.
    pub admin_open: bool,
    /// Where the admin service listens.
    pub admin_addr: Option<SocketAddr>,
    /// Whether the admin proxy is listening.
    pub proxy_open: bool,
    /// Whether an admin link exists.
    pub link_active: bool,
    /// Whether the reload poll timer is armed.
    pub reload_timer_armed: bool,
    /// Whether the metrics timer is armed.
    pub metrics_timer_armed: bool,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            stage: Stage::Idle,
            lifecycle: Lifecycle::Active,
            runs_started: 0,
            runs_coalesced: 0,
            retries_scheduled: 0,
            polls: 0,
            worker_running: false,
            admin_open: false,
            admin_addr: None,
            proxy_open: false,
            link_active: false,
            reload_timer_armed: false,
            metrics_timer_armed: false,
        }
    }
}

/// Why a pipeline run failed.
#[derive(Debug, Error)]
pub enum PipelineFailure {
    /// Codebase synchronization failed.
    #[error("Failed to synchronize codebase: {0}")]
    Sync(#[source] CodebaseError),

    /// The codebase synchronized without an entry module.
    #[error("Codebase has no entry module")]
    NoEntry,

    /// The entry module failed to load.
    #[error("Failed to load entry module: {0}")]
    Load(#[source] WorkerError),

    /// The worker failed to start.
    #[error("Failed to start worker: {0}")]
    Start(#[source] WorkerError),
}

/// Successful pipeline results.
enum PipelineOutcome {
    Started {
        worker: Box<dyn Worker>,
        version: String,
    },
    /// A poll found nothing new.
    Unchanged,
    /// Verify-only run loaded the entry.
    Verified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    /// Forced run: startup, retry or explicit reload.
    Pipeline,
    /// Unforced poll; loads and starts only when the source changed.
    Poll,
}

struct PipelineRun {
    codebase: Box<dyn CodebaseSource>,
    kind: RunKind,
    result: Result<PipelineOutcome, PipelineFailure>,
}

type InFlight = Pin<Box<dyn Future<Output = PipelineRun> + Send>>;

struct RunContext {
    kind: RunKind,
    factory: Arc<dyn WorkerFactory>,
    exit: ExitHandle,
    status: Status,
    verify_only: bool,
    snapshot: Arc<watch::Sender<Snapshot>>,
}

impl RunContext {
    fn stage(&self, stage: Stage) {
        self.snapshot.send_modify(|s| s.stage = stage);
    }
}

async fn run_pipeline(mut codebase: Box<dyn CodebaseSource>, ctx: RunContext) -> PipelineRun {
    let result = drive(codebase.as_mut(), &ctx).await;
    PipelineRun {
        codebase,
        kind: ctx.kind,
        result,
    }
}

async fn drive(
    codebase: &mut dyn CodebaseSource,
    ctx: &RunContext,
) -> Result<PipelineOutcome, PipelineFailure> {
    let force = ctx.kind == RunKind::Pipeline;
    let synced = codebase
        .sync(&ctx.status, force)
        .await
        .map_err(PipelineFailure::Sync)?;
    if !force && synced == SyncOutcome::Unchanged {
        return Ok(PipelineOutcome::Unchanged);
    }

    ctx.stage(Stage::Loading);
    let entry = codebase.entry().cloned().ok_or(PipelineFailure::NoEntry)?;
    let mut worker = ctx.factory.construct(ctx.exit.clone());
    debug!(
        entry = %entry.path,
        worker_type = worker.worker_type(),
        "Loading entry module"
    );
    if let Err(e) = worker.load_entry(&entry).await {
        worker.stop().await;
        return Err(PipelineFailure::Load(e));
    }

    if ctx.verify_only {
        worker.stop().await;
        return Ok(PipelineOutcome::Verified);
    }

    ctx.stage(Stage::Starting);
    if let Err(e) = worker.start().await {
        worker.stop().await;
        return Err(PipelineFailure::Start(e));
    }

    Ok(PipelineOutcome::Started {
        worker,
        version: codebase.version().to_string(),
    })
}

/// Events delivered to the loop from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Signal(ProcessSignal),
    Reload,
}

/// Handle for talking to a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    events: mpsc::UnboundedSender<Event>,
    snapshot: watch::Receiver<Snapshot>,
    exit: ExitHandle,
}

impl OrchestratorHandle {
    /// Deliver an operator signal.
    pub fn send_signal(&self, signal: ProcessSignal) {
        let _ = self.events.send(Event::Signal(signal));
    }

    /// Trigger a reload, as the admin link `reload` command does.
    pub fn request_reload(&self) {
        let _ = self.events.send(Event::Reload);
    }

    /// Current state.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    /// The process exit handle.
    pub fn exit_handle(&self) -> &ExitHandle {
        &self.exit
    }
}

/// How the orchestrator finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Most recently requested exit code.
    pub exit_code: i32,
    /// Message of the failure that ended the process, if any.
    pub fatal: Option<String>,
}

struct AdminSlot {
    service: AdminService,
    addr: AdminAddr,
    options: AdminOptions,
}

struct ProxySlot {
    proxy: AdminProxy,
    addr: AdminAddr,
    options: AdminOptions,
}

struct RemoteOrigin {
    url: String,
    connector: Arc<dyn LinkConnector>,
}

#[derive(Debug, Clone, Copy)]
struct Intervals {
    reload: Duration,
    metrics: Duration,
    retry: Duration,
    maintenance: Duration,
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    status: StatusHandle,
    exit: ExitHandle,
    metrics: Arc<MetricsRegistry>,
    log_tap: LogTap,
    codebase: Option<Box<dyn CodebaseSource>>,
    factory: Option<Arc<dyn WorkerFactory>>,
    remote: Option<RemoteOrigin>,
    admin: Option<AdminSlot>,
    proxy: Option<ProxySlot>,
    verify_only: bool,
    intervals: Intervals,
}

impl OrchestratorBuilder {
    /// Use an existing exit handle.
    pub fn exit_handle(mut self, exit: ExitHandle) -> Self {
        self.exit = exit;
        self
    }

    /// Use an existing metrics registry.
    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Use an existing log tap.
    pub fn log_tap(mut self, log_tap: LogTap) -> Self {
        self.log_tap = log_tap;
        self
    }

    /// Run workers built by `factory` from `codebase` (worker roles).
    pub fn codebase(
        mut self,
        codebase: Box<dyn CodebaseSource>,
        factory: Arc<dyn WorkerFactory>,
    ) -> Self {
        self.codebase = Some(codebase);
        self.factory = Some(factory);
        self
    }

    /// The codebase comes from the remote origin at `url`: failed runs are
    /// retried and an admin link to the origin is opened once running.
    pub fn remote(mut self, url: impl Into<String>, connector: Arc<dyn LinkConnector>) -> Self {
        self.remote = Some(RemoteOrigin {
            url: url.into(),
            connector,
        });
        self
    }

    /// Admin state wired to this orchestrator's status, metrics and log tap.
    pub fn admin_state(&self, repo: Option<Arc<CodebaseStore>>) -> AdminState {
        AdminState {
            status: self.status.subscribe(),
            metrics: self.metrics.clone() as Arc<dyn MetricsCollector>,
            log_tap: self.log_tap.clone(),
            repo,
        }
    }

    /// Configure the admin service bound to `addr`.
    pub fn admin_service(
        mut self,
        service: AdminService,
        addr: AdminAddr,
        options: AdminOptions,
    ) -> Self {
        self.admin = Some(AdminSlot {
            service,
            addr,
            options,
        });
        self
    }

    /// Configure the admin proxy bound to `addr`.
    pub fn proxy(mut self, proxy: AdminProxy, addr: AdminAddr, options: AdminOptions) -> Self {
        self.proxy = Some(ProxySlot {
            proxy,
            addr,
            options,
        });
        self
    }

    /// Load the entry module, then exit without starting.
    pub fn verify_only(mut self, verify_only: bool) -> Self {
        self.verify_only = verify_only;
        self
    }

    /// Reload poll interval.
    pub fn reload_interval(mut self, interval: Duration) -> Self {
        self.intervals.reload = interval;
        self
    }

    /// Metrics report interval.
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.intervals.metrics = interval;
        self
    }

    /// Delay before retrying a failed remote pipeline.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.intervals.retry = delay;
        self
    }

    /// Interval between worker sweeps.
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.intervals.maintenance = interval;
        self
    }

    /// Build the orchestrator and a handle to it.
    pub fn build(self) -> (Orchestrator, OrchestratorHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());

        let handle = OrchestratorHandle {
            events: events_tx.clone(),
            snapshot: snapshot_rx,
            exit: self.exit.clone(),
        };

        let orchestrator = Orchestrator {
            status: self.status,
            exit: self.exit,
            metrics: self.metrics,
            log_tap: self.log_tap,
            codebase: self.codebase,
            factory: self.factory,
            remote: self.remote,
            admin: self.admin,
            proxy: self.proxy,
            verify_only: self.verify_only,
            intervals: self.intervals,
            worker: None,
            link: None,
            link_log: None,
            last_connection_id: None,
            lifecycle: Lifecycle::Active,
            armed: false,
            fatal: None,
            in_flight: None,
            in_flight_kind: None,
            reload_pending: false,
            retry_at: None,
            poll_at: None,
            metrics_at: None,
            maintenance_at: None,
            events_tx,
            events_rx,
            snapshot: Arc::new(snapshot_tx),
        };
        (orchestrator, handle)
    }
}

/// The lifecycle orchestrator. See the module docs.
pub struct Orchestrator {
    status: StatusHandle,
    exit: ExitHandle,
    metrics: Arc<MetricsRegistry>,
    log_tap: LogTap,
    codebase: Option<Box<dyn CodebaseSource>>,
    factory: Option<Arc<dyn WorkerFactory>>,
    remote: Option<RemoteOrigin>,
    admin: Option<AdminSlot>,
    proxy: Option<ProxySlot>,
    verify_only: bool,
    intervals: Intervals,

    worker: Option<Box<dyn Worker>>,
    link: Option<Box<dyn AdminLink>>,
    link_log: Option<mpsc::UnboundedReceiver<String>>,
    last_connection_id: Option<u64>,
    lifecycle: Lifecycle,
    armed: bool,
    fatal: Option<String>,

    in_flight: Option<InFlight>,
    in_flight_kind: Option<RunKind>,
    reload_pending: bool,
    retry_at: Option<Instant>,
    poll_at: Option<Instant>,
    metrics_at: Option<Instant>,
    maintenance_at: Option<Instant>,

    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    snapshot: Arc<watch::Sender<Snapshot>>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn poll_opt<F: Future + Unpin>(future: &mut Option<F>) -> F::Output {
    match future {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

impl Orchestrator {
    /// Start building an orchestrator around the process status record.
    pub fn builder(status: StatusHandle) -> OrchestratorBuilder {
        OrchestratorBuilder {
            status,
            exit: ExitHandle::new(),
            metrics: Arc::new(MetricsRegistry::new()),
            log_tap: LogTap::default(),
            codebase: None,
            factory: None,
            remote: None,
            admin: None,
            proxy: None,
            verify_only: false,
            intervals: Intervals {
                reload: DEFAULT_RELOAD_INTERVAL,
                metrics: DEFAULT_METRICS_INTERVAL,
                retry: DEFAULT_RETRY_DELAY,
                maintenance: DEFAULT_MAINTENANCE_INTERVAL,
            },
        }
    }

    /// Run until exit is requested and every pending completion has drained,
    /// then tear down.
    pub async fn run(mut self) -> RunOutcome {
        let mut exit_rx = self.exit.subscribe();
        self.start().await;

        loop {
            if self.exit.has_exited() && self.in_flight.is_none() {
                break;
            }

            tokio::select! {
                run = poll_opt(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.in_flight_kind = None;
                    self.complete(run).await;
                    if std::mem::take(&mut self.reload_pending) {
                        self.begin(RunKind::Pipeline, "reload after poll");
                    }
                }
                Some(event) = self.events_rx.recv() => self.on_event(event).await,
                Some(line) = recv_opt(&mut self.link_log) => self.forward_log(line),
                _ = sleep_until_opt(self.retry_at) => {
                    self.retry_at = None;
                    self.begin(RunKind::Pipeline, "retry");
                }
                _ = sleep_until_opt(self.poll_at) => {
                    self.poll_at = None;
                    self.on_poll_tick();
                }
                _ = sleep_until_opt(self.metrics_at) => {
                    self.metrics_at = None;
                    self.on_metrics_tick();
                }
                _ = sleep_until_opt(self.maintenance_at) => {
                    self.maintenance_at = None;
                    self.on_maintenance_tick();
                }
                _ = exit_rx.changed() => {}
            }
            self.publish();
        }

        self.teardown().await;
        let outcome = RunOutcome {
            exit_code: self.exit.exit_code().unwrap_or(0),
            fatal: self.fatal.take(),
        };
        info!(exit_code = outcome.exit_code, "Orchestrator stopped");
        outcome
    }

    async fn start(&mut self) {
        let mut failure = None;
        if let Some(slot) = &mut self.proxy {
            if let Err(e) = slot.proxy.open(&slot.addr, &slot.options).await {
                failure = Some(format!("Cannot open admin proxy on {}: {e}", slot.addr));
            }
        }
        if failure.is_none() && self.codebase.is_none() {
            // No worker: the admin service is this role's whole purpose.
            if let Some(slot) = &mut self.admin {
                if let Err(e) = slot.service.open(&slot.addr, &slot.options).await {
                    failure = Some(format!("Cannot open admin service on {}: {e}", slot.addr));
                }
            }
        }
        if let Some(message) = failure {
            self.fail_fatally(message);
            return;
        }
        if self.codebase.is_none() {
            self.publish();
            return;
        }

        self.maintenance_at = Some(Instant::now() + self.intervals.maintenance);
        self.begin(RunKind::Pipeline, "startup");
        self.publish();
    }

    fn fail_fatally(&mut self, message: String) {
        error!("{message}");
        self.fatal = Some(message);
        self.exit.request_exit(FAILURE_EXIT_CODE);
    }

    /// Begin a run unless one is in flight or exit has been requested.
    ///
    /// A reload arriving while a poll is in flight is held in a single slot
    /// and started once the poll completes; every other overlapping trigger
    /// is coalesced.
    fn begin(&mut self, kind: RunKind, reason: &'static str) -> bool {
        if self.exit.has_exited() {
            debug!(reason, "Exit requested, not starting a run");
            return false;
        }
        let Some(factory) = self.factory.clone() else {
            debug!(reason, "No codebase in this role");
            return false;
        };
        let Some(codebase) = self.codebase.take() else {
            if kind == RunKind::Pipeline
                && self.in_flight_kind == Some(RunKind::Poll)
                && !self.reload_pending
            {
                self.reload_pending = true;
                debug!(reason, "Poll in flight, reload deferred until it completes");
                return false;
            }
            self.snapshot.send_modify(|s| s.runs_coalesced += 1);
            self.metrics.increment(metrics::COALESCED_TRIGGERS);
            debug!(reason, "Run in flight, trigger coalesced");
            return false;
        };

        match kind {
            RunKind::Pipeline => {
                self.retry_at = None;
                self.snapshot.send_modify(|s| {
                    s.runs_started += 1;
                    s.stage = Stage::Syncing;
                });
                self.metrics.increment(metrics::PIPELINE_RUNS);
                info!(reason, source = codebase.kind(), "Pipeline run started");
            }
            RunKind::Poll => {
                self.snapshot.send_modify(|s| s.polls += 1);
                self.metrics.increment(metrics::RELOAD_POLLS);
                debug!(source = codebase.kind(), "Polling codebase");
            }
        }

        let ctx = RunContext {
            kind,
            factory,
            exit: self.exit.clone(),
            status: self.status.snapshot(),
            verify_only: self.verify_only,
            snapshot: self.snapshot.clone(),
        };
        self.in_flight = Some(Box::pin(run_pipeline(codebase, ctx)));
        self.in_flight_kind = Some(kind);
        true
    }

    async fn complete(&mut self, run: PipelineRun) {
        self.codebase = Some(run.codebase);

        match run.result {
            Ok(PipelineOutcome::Started { worker, version }) => {
                if let Some(mut old) = self.worker.replace(worker) {
                    old.stop().await;
                }
                self.status.update_version(version.as_str());
                self.metrics.increment(metrics::WORKER_STARTS);
                self.snapshot.send_modify(|s| s.stage = Stage::Running);
                info!(version = %version, "Worker running");

                if !self.armed && !self.exit.has_exited() {
                    self.arm().await;
                } else if run.kind == RunKind::Poll {
                    self.schedule_poll();
                }
            }
            Ok(PipelineOutcome::Unchanged) => {
                self.schedule_poll();
            }
            Ok(PipelineOutcome::Verified) => {
                info!("Entry module verified");
                self.snapshot.send_modify(|s| s.stage = Stage::Idle);
                self.exit.request_exit(0);
            }
            Err(failure) if run.kind == RunKind::Poll => {
                debug!(error = %failure, "Poll failed");
                self.restore_stage();
                self.schedule_poll();
            }
            Err(failure) => self.on_failure(failure),
        }
    }

    fn restore_stage(&self) {
        if self.worker.is_some() {
            self.snapshot.send_modify(|s| s.stage = Stage::Running);
        }
    }

    fn on_failure(&mut self, failure: PipelineFailure) {
        self.metrics.increment(metrics::PIPELINE_FAILURES);

        if self.worker.is_some() {
            warn!(error = %failure, "Reload failed, current worker keeps serving");
            self.restore_stage();
            return;
        }

        self.snapshot.send_modify(|s| s.stage = Stage::Failed);
        if self.remote.is_some() {
            if self.exit.has_exited() {
                return;
            }
            warn!(
                error = %failure,
                retry_in_secs = self.intervals.retry.as_secs_f64(),
                "Pipeline failed, retrying"
            );
            self.retry_at = Some(Instant::now() + self.intervals.retry);
            self.snapshot.send_modify(|s| s.retries_scheduled += 1);
            self.metrics.increment(metrics::RETRIES);
        } else {
            self.fail_fatally(failure.to_string());
        }
    }

    /// First time a worker runs: wire admin surfaces and timers.
    async fn arm(&mut self) {
        self.armed = true;

        if let Some(slot) = &mut self.admin {
            if !slot.service.is_open() {
                if let Err(e) = slot.service.open(&slot.addr, &slot.options).await {
                    warn!(addr = %slot.addr, error = %e, "Cannot open admin service");
                }
            }
        }

        if let Some(remote) = &self.remote {
            let address = link_address(&remote.url, &self.status.uuid());
            match remote.connector.open(&address) {
                Ok(link) => {
                    let events = self.events_tx.clone();
                    link.register_command_handler(Arc::new(move |name, _payload| {
                        if name == RELOAD_COMMAND {
                            let _ = events.send(Event::Reload);
                            true
                        } else {
                            false
                        }
                    }));
                    self.link = Some(link);
                    self.link_log = self.log_tap.forward();
                    info!(address = %address, "Admin link opened");
                    self.metrics_at = Some(Instant::now() + self.intervals.metrics);
                }
                Err(e) => warn!(address = %address, error = %e, "Cannot open admin link"),
            }
        }

        self.schedule_poll();
    }

    fn schedule_poll(&mut self) {
        if !self.exit.has_exited() {
            self.poll_at = Some(Instant::now() + self.intervals.reload);
        }
    }

    fn on_poll_tick(&mut self) {
        if self.exit.has_exited() {
            return;
        }
        self.status.touch();
        if !self.begin(RunKind::Poll, "poll") {
            self.schedule_poll();
        }
    }

    fn on_metrics_tick(&mut self) {
        if self.exit.has_exited() {
            return;
        }
        if let Some(link) = &self.link {
            let connection_id = link.connect();
            let full = self.last_connection_id != Some(connection_id);

            self.metrics.collect_all();
            let mut buf = BytesMut::with_capacity(256);
            buf.put_slice(METRICS_TAG);
            self.metrics.serialize(&mut buf, &self.status.uuid(), full);
            link.send(buf.freeze());

            self.last_connection_id = Some(connection_id);
        }
        self.metrics_at = Some(Instant::now() + self.intervals.metrics);
    }

    fn forward_log(&self, line: String) {
        if let Some(link) = &self.link {
            let mut buf = BytesMut::with_capacity(LOG_TAG.len() + line.len() + 1);
            buf.put_slice(LOG_TAG);
            buf.put_slice(line.as_bytes());
            buf.put_u8(b'\n');
            link.send(buf.freeze());
        }
    }

    fn on_maintenance_tick(&mut self) {
        if let Some(factory) = self.factory.clone() {
            tokio::spawn(async move { factory.sweep().await });
        }
        self.maintenance_at = Some(Instant::now() + self.intervals.maintenance);
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Reload => {
                self.begin(RunKind::Pipeline, "reload command");
            }
            Event::Signal(signal) => {
                if self
                    .worker
                    .as_ref()
                    .is_some_and(|worker| worker.handles_signal(signal))
                {
                    debug!(signal = %signal, "Signal handled by worker");
                    return;
                }
                match signal {
                    ProcessSignal::Interrupt => self.interrupt().await,
                    ProcessSignal::Hangup => {
                        self.begin(RunKind::Pipeline, "hangup");
                    }
                    ProcessSignal::Toggle => self.toggle_admin().await,
                }
            }
        }
    }

    async fn interrupt(&mut self) {
        match self.lifecycle {
            Lifecycle::Active => {
                info!("Interrupted, shutting down");
                self.lifecycle = Lifecycle::ShuttingDown;
                self.snapshot
                    .send_modify(|s| s.lifecycle = Lifecycle::ShuttingDown);
                self.log_tap.shutdown_all();
                self.link_log = None;
                if let Some(link) = self.link.take() {
                    link.close();
                }
                if let Some(slot) = &mut self.admin {
                    slot.service.close().await;
                }
                self.exit.request_exit(FAILURE_EXIT_CODE);
            }
            Lifecycle::ShuttingDown => self.exit.request_exit(FAILURE_EXIT_CODE),
        }
    }

    /// Only a worker's own admin port toggles. In the repository role the
    /// admin service is the repository and stays up.
    async fn toggle_admin(&mut self) {
        if self.factory.is_none() {
            debug!("No worker in this role, toggle ignored");
            return;
        }
        let Some(slot) = &mut self.admin else {
            debug!("No admin port configured, toggle ignored");
            return;
        };
        if slot.service.is_open() {
            slot.service.close().await;
        } else if self.lifecycle == Lifecycle::Active {
            if let Err(e) = slot.service.open(&slot.addr, &slot.options).await {
                warn!(addr = %slot.addr, error = %e, "Cannot open admin service");
            }
        }
    }

    fn publish(&self) {
        let admin_open = self
            .admin
            .as_ref()
            .is_some_and(|slot| slot.service.is_open());
        let admin_addr = self
            .admin
            .as_ref()
            .and_then(|slot| slot.service.local_addr());
        let proxy_open = self
            .proxy
            .as_ref()
            .is_some_and(|slot| slot.proxy.local_addr().is_some());

        self.snapshot.send_if_modified(|s| {
            let next = Snapshot {
                worker_running: self.worker.is_some(),
                admin_open,
                admin_addr,
                proxy_open,
                link_active: self.link.is_some(),
                reload_timer_armed: self.poll_at.is_some()
                    || self.in_flight_kind == Some(RunKind::Poll),
                metrics_timer_armed: self.metrics_at.is_some(),
                ..s.clone()
            };
            if *s == next {
                false
            } else {
                *s = next;
                true
            }
        });
    }

    /// Release everything in reverse acquisition order.
    async fn teardown(&mut self) {
        self.log_tap.stop_forwarding();
        self.link_log = None;
        if let Some(link) = self.link.take() {
            link.close();
        }
        if let Some(slot) = &mut self.admin {
            slot.service.close().await;
        }
        if let Some(slot) = &mut self.proxy {
            slot.proxy.close().await;
        }
        if let Some(mut worker) = self.worker.take() {
            worker.stop().await;
        }
        self.codebase = None;
        self.retry_at = None;
        self.poll_at = None;
        self.metrics_at = None;
        self.maintenance_at = None;
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codebase::MockCodebase;
    use crate::worker::MockWorkerFactory;

    fn builder() -> OrchestratorBuilder {
        Orchestrator::builder(StatusHandle::new("test", "uuid-1", "local"))
    }

    #[test]
    fn test_snapshot_default() {
        let snapshot = Snapshot::default();
        assert_eq!(snapshot.stage, Stage::Idle);
        assert_eq!(snapshot.lifecycle, Lifecycle::Active);
        assert_eq!(snapshot.runs_started, 0);
        assert!(!snapshot.worker_running);
    }

    #[test]
    fn test_failure_messages() {
        let failure = PipelineFailure::Start(WorkerError::StartFailed("boom".to_string()));
        assert_eq!(
            failure.to_string(),
            "Failed to start worker: Worker start failed: boom"
        );
        assert_eq!(
            PipelineFailure::NoEntry.to_string(),
            "Codebase has no entry module"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_role_without_codebase_waits_for_interrupt() {
        let (orchestrator, handle) = builder().build();
        let task = tokio::spawn(orchestrator.run());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!task.is_finished());
        assert_eq!(handle.snapshot().stage, Stage::Idle);

        handle.send_signal(ProcessSignal::Hangup);
        handle.send_signal(ProcessSignal::Interrupt);
        let outcome = task.await.unwrap();
        assert_eq!(outcome.exit_code, FAILURE_EXIT_CODE);
        assert!(outcome.fatal.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_only_exits_zero_without_starting() {
        let factory = MockWorkerFactory::new();
        let probe = factory.probe();
        let (orchestrator, _handle) = builder()
            .codebase(Box::new(MockCodebase::new("v1")), Arc::new(factory))
            .verify_only(true)
            .build();

        let outcome = orchestrator.run().await;
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(probe.loaded(), 1);
        assert_eq!(probe.started(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_self_exit_ends_run() {
        let factory = MockWorkerFactory::new();
        let probe = factory.probe();
        let (orchestrator, handle) = builder()
            .codebase(Box::new(MockCodebase::new("v1")), Arc::new(factory))
            .build();
        let task = tokio::spawn(orchestrator.run());

        let mut rx = handle.watch();
        rx.wait_for(|s| s.stage == Stage::Running).await.unwrap();

        probe.exit_last(4);
        let outcome = task.await.unwrap();
        assert_eq!(outcome.exit_code, 4);
        assert_eq!(probe.stopped(), 1);
    }
}
