// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process assembly.
//!
//! [`ConduitRuntime`] turns a [`Config`] into a wired [`Orchestrator`]: it
//! resolves the deployment mode, creates the status record, picks the codebase
//! source and worker factory for worker roles, and attaches the admin
//! surfaces each role needs.
//!
//! ```rust,ignore
//! use clap::Parser;
//! use conduit_runtime::config::Config;
//! use conduit_runtime::runtime::ConduitRuntime;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = ConduitRuntime::builder(Config::parse()).build()?;
//!     let outcome = runtime.run().await;
//!     std::process::exit(outcome.exit_code);
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::admin::{AdminOptions, AdminProxy, AdminService, LinkConnector, TcpLinkConnector};
use crate::codebase::{CodebaseSource, FsCodebase, HttpCodebase};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::log_tap::LogTap;
use crate::metrics::MetricsRegistry;
use crate::mode::{LocalSource, Mode, resolve_mode};
use crate::orchestrator::{Orchestrator, OrchestratorHandle, RunOutcome};
use crate::repo::CodebaseStore;
use crate::signals::SignalSubscription;
use crate::status::StatusHandle;
use crate::worker::{ProcessWorkerFactory, WorkerFactory};

/// Builder for [`ConduitRuntime`].
pub struct ConduitRuntimeBuilder {
    config: Config,
    log_tap: LogTap,
    metrics: Arc<MetricsRegistry>,
    worker_factory: Option<Arc<dyn WorkerFactory>>,
    link_connector: Option<Arc<dyn LinkConnector>>,
    reload_interval: Option<Duration>,
    metrics_interval: Option<Duration>,
    retry_delay: Option<Duration>,
    signals: bool,
}

impl ConduitRuntimeBuilder {
    /// Share a log tap with the tracing subscriber.
    pub fn log_tap(mut self, log_tap: LogTap) -> Self {
        self.log_tap = log_tap;
        self
    }

    /// Use an existing metrics registry.
    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Override the worker factory.
    ///
    /// Default: [`ProcessWorkerFactory`] running the configured worker command.
    pub fn worker_factory(mut self, factory: Arc<dyn WorkerFactory>) -> Self {
        self.worker_factory = Some(factory);
        self
    }

    /// Override how the remote role opens its admin link.
    ///
    /// Default: [`TcpLinkConnector`] with the fetch TLS material.
    pub fn link_connector(mut self, connector: Arc<dyn LinkConnector>) -> Self {
        self.link_connector = Some(connector);
        self
    }

    /// Reload poll interval.
    pub fn reload_interval(mut self, interval: Duration) -> Self {
        self.reload_interval = Some(interval);
        self
    }

    /// Metrics report interval.
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    /// Delay before retrying a failed remote pipeline.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Whether to subscribe to process signals while running.
    ///
    /// Default: `true`
    pub fn signals(mut self, enabled: bool) -> Self {
        self.signals = enabled;
        self
    }

    /// Resolve the mode and wire the orchestrator.
    pub fn build(self) -> Result<ConduitRuntime> {
        let config = self.config;
        let mode = resolve_mode(&config.source, config.eval)?;
        let uuid = config.instance_uuid();
        let status = StatusHandle::new(config.instance_name.clone(), uuid.clone(), mode.name());

        let options = AdminOptions {
            tls: config.admin_tls(),
            reuse_port: config.reuse_port,
        };

        let mut builder = Orchestrator::builder(status)
            .metrics(self.metrics)
            .log_tap(self.log_tap)
            .verify_only(config.verify);
        if let Some(interval) = self.reload_interval {
            builder = builder.reload_interval(interval);
        }
        if let Some(interval) = self.metrics_interval {
            builder = builder.metrics_interval(interval);
        }
        if let Some(delay) = self.retry_delay {
            builder = builder.retry_delay(delay);
        }

        let codebase: Option<Box<dyn CodebaseSource>> = match &mode {
            Mode::Remote { url, .. } => Some(Box::new(HttpCodebase::new(url, &config.fetch_tls())?)),
            Mode::Local {
                source: LocalSource::File(path),
            } => Some(Box::new(FsCodebase::from_file(path.clone()))),
            Mode::Local {
                source:
                    LocalSource::Eval {
                        base_dir,
                        expression,
                    },
            } => Some(Box::new(FsCodebase::from_eval(
                base_dir.clone(),
                expression.clone(),
            ))),
            Mode::Repository { .. } | Mode::RepositoryProxy { .. } => None,
        };

        match (&mode, codebase) {
            (Mode::Repository { store_path }, _) => {
                let store = match store_path {
                    Some(path) => CodebaseStore::directory(path),
                    None => CodebaseStore::in_memory(),
                };
                let addr = config.admin_addr_or_default()?;
                info!(store = store.kind(), admin = %addr, "Starting codebase repository");
                let service = AdminService::new(builder.admin_state(Some(Arc::new(store))));
                builder = builder.admin_service(service, addr, options);
            }
            (Mode::RepositoryProxy { target }, _) => {
                let addr = config.admin_addr_or_default()?;
                info!(upstream = %target, admin = %addr, "Starting repository proxy");
                builder = builder.proxy(AdminProxy::new(target.clone()), addr, options);
            }
            (_, codebase) => {
                let Some(codebase) = codebase else {
                    return Err(Error::Other(format!("{} role has no codebase", mode.name())));
                };
                let factory: Arc<dyn WorkerFactory> = match self.worker_factory {
                    Some(factory) => factory,
                    None => Arc::new(ProcessWorkerFactory::new(
                        config.worker_command.clone(),
                        &config.data_dir,
                        &uuid,
                    )),
                };
                info!(mode = mode.name(), source = codebase.kind(), "Starting worker");
                builder = builder.codebase(codebase, factory);

                if let Mode::Remote { url, .. } = &mode {
                    let connector: Arc<dyn LinkConnector> = match self.link_connector {
                        Some(connector) => connector,
                        None => Arc::new(TcpLinkConnector::new(uuid.clone(), config.fetch_tls())),
                    };
                    builder = builder.remote(url.clone(), connector);
                }

                if let Some(addr) = config.admin_addr()? {
                    let service = AdminService::new(builder.admin_state(None));
                    builder = builder.admin_service(service, addr, options);
                }
            }
        }

        let (orchestrator, handle) = builder.build();
        Ok(ConduitRuntime {
            mode,
            orchestrator,
            handle,
            signals: self.signals,
        })
    }
}

/// A fully wired process, ready to run.
pub struct ConduitRuntime {
    mode: Mode,
    orchestrator: Orchestrator,
    handle: OrchestratorHandle,
    signals: bool,
}

impl ConduitRuntime {
    /// Start building a runtime from `config`.
    pub fn builder(config: Config) -> ConduitRuntimeBuilder {
        ConduitRuntimeBuilder {
            config,
            log_tap: LogTap::default(),
            metrics: Arc::new(MetricsRegistry::new()),
            worker_factory: None,
            link_connector: None,
            reload_interval: None,
            metrics_interval: None,
            retry_delay: None,
            signals: true,
        }
    }

    /// Resolved deployment mode.
    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Handle to the orchestrator.
    pub fn handle(&self) -> OrchestratorHandle {
        self.handle.clone()
    }

    /// Run until exit and return how the process should end.
    pub async fn run(self) -> RunOutcome {
        let _signals = if self.signals {
            let handle = self.handle.clone();
            Some(SignalSubscription::spawn(move |signal| {
                handle.send_signal(signal)
            }))
        } else {
            None
        };
        self.orchestrator.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::MockWorkerFactory;
    use clap::Parser;

    fn config(args: &[&str]) -> Config {
        let mut argv = vec!["conduit"];
        argv.extend_from_slice(args);
        Config::parse_from(argv)
    }

    #[test]
    fn test_build_repository_role() {
        let runtime = ConduitRuntime::builder(config(&[])).build().unwrap();
        assert_eq!(runtime.mode(), &Mode::Repository { store_path: None });
    }

    #[test]
    fn test_build_proxy_role() {
        let runtime = ConduitRuntime::builder(config(&["repo.example:6060"]))
            .build()
            .unwrap();
        assert_eq!(
            runtime.mode(),
            &Mode::RepositoryProxy {
                target: "repo.example:6060".to_string()
            }
        );
    }

    #[test]
    fn test_build_rejects_missing_source() {
        let result = ConduitRuntime::builder(config(&["/definitely/not/here.js"])).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_build_rejects_bad_admin_port() {
        let result = ConduitRuntime::builder(config(&["--admin-port", "nope", "-e", "1"]))
            .worker_factory(Arc::new(MockWorkerFactory::new()))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_eval_role_runs_and_verifies() {
        let factory = MockWorkerFactory::new();
        let probe = factory.probe();
        let runtime = ConduitRuntime::builder(config(&["--verify", "-e", "console.log(1)"]))
            .worker_factory(Arc::new(factory))
            .signals(false)
            .build()
            .unwrap();
        assert!(runtime.mode().is_worker());

        let outcome = runtime.run().await;
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(probe.loaded(), 1);
        assert_eq!(
            probe.last_entry().map(|entry| entry.source),
            Some(bytes::Bytes::from_static(b"console.log(1)"))
        );
    }
}
