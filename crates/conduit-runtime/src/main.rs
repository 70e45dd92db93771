// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conduit - programmable network proxy runtime
//!
//! Single binary for every role: codebase repository, repository proxy,
//! remote worker and local worker. The role is picked from the source
//! argument; see `conduit --help`.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use conduit_runtime::config::Config;
use conduit_runtime::log_tap::LogTap;
use conduit_runtime::orchestrator::RunOutcome;
use conduit_runtime::runtime::ConduitRuntime;

fn print_version() {
    println!("conduit {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}-{}",
        std::env::consts::ARCH,
        std::env::consts::OS
    );
    println!("tls: rustls (ring)");
}

async fn run(config: Config, log_tap: LogTap) -> anyhow::Result<RunOutcome> {
    let runtime = ConduitRuntime::builder(config)
        .log_tap(log_tap)
        .build()
        .context("Invalid configuration")?;
    info!(mode = runtime.mode().name(), "Runtime assembled");
    Ok(runtime.run().await)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Load .env file if present, before clap reads the environment
    let dotenv = dotenvy::dotenv();

    let config = Config::parse();
    if config.version {
        print_version();
        return ExitCode::SUCCESS;
    }

    let log_tap = LogTap::default();
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_directive())),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(log_tap.clone())
        .init();

    if let Err(e) = dotenv {
        debug!("No .env file loaded: {}", e);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        source = %config.source,
        "Starting conduit"
    );

    let outcome = match run(config, log_tap).await {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("conduit: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(message) = &outcome.fatal {
        eprintln!("conduit: {message}");
    }
    eprintln!("Done.");

    ExitCode::from(outcome.exit_code as u8)
}
