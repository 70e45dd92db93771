// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OS signal subscription.
//!
//! ## Signals
//! **Unix platforms:**
//! - `SIGINT` → [`ProcessSignal::Interrupt`] (shutdown)
//! - `SIGHUP` → [`ProcessSignal::Hangup`] (reload)
//! - `SIGTSTP` → [`ProcessSignal::Toggle`] (admin port open/close)
//!
//! **Other platforms:**
//! - `Ctrl-C` via [`tokio::signal::ctrl_c`] → [`ProcessSignal::Interrupt`]
//!
//! The subscription keeps listening after every delivery until it is dropped.

use std::fmt;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Operator signal, decoupled from platform signal numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessSignal {
    /// Shut down.
    Interrupt,
    /// Reload the codebase.
    Hangup,
    /// Toggle the admin service.
    Toggle,
}

impl ProcessSignal {
    /// Conventional signal name.
    pub fn name(&self) -> &'static str {
        match self {
            ProcessSignal::Interrupt => "SIGINT",
            ProcessSignal::Hangup => "SIGHUP",
            ProcessSignal::Toggle => "SIGTSTP",
        }
    }
}

impl fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Live signal subscription. Listening stops when this is dropped.
#[derive(Debug)]
pub struct SignalSubscription {
    task: JoinHandle<()>,
}

impl SignalSubscription {
    /// Start listening and deliver every signal to `sink`.
    pub fn spawn<F>(sink: F) -> Self
    where
        F: Fn(ProcessSignal) + Send + 'static,
    {
        Self {
            task: tokio::spawn(listen(sink)),
        }
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(unix)]
async fn listen<F>(sink: F)
where
    F: Fn(ProcessSignal) + Send + 'static,
{
    use nix::sys::signal::Signal;
    use tokio::signal::unix::{Signal as Stream, SignalKind, signal};

    fn register(kind: SignalKind, signal_name: &str) -> Option<Stream> {
        match signal(kind) {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(signal = signal_name, error = %e, "Failed to register signal handler");
                None
            }
        }
    }

    async fn next(stream: &mut Option<Stream>) -> Option<()> {
        match stream {
            Some(stream) => stream.recv().await,
            None => std::future::pending().await,
        }
    }

    let mut sigint = register(SignalKind::interrupt(), "SIGINT");
    let mut sighup = register(SignalKind::hangup(), "SIGHUP");
    let mut sigtstp = register(SignalKind::from_raw(Signal::SIGTSTP as i32), "SIGTSTP");

    loop {
        let signal = tokio::select! {
            Some(()) = next(&mut sigint) => ProcessSignal::Interrupt,
            Some(()) = next(&mut sighup) => ProcessSignal::Hangup,
            Some(()) = next(&mut sigtstp) => ProcessSignal::Toggle,
            else => break,
        };
        debug!(signal = %signal, "Signal received");
        sink(signal);
    }
}

#[cfg(not(unix))]
async fn listen<F>(sink: F)
where
    F: Fn(ProcessSignal) + Send + 'static,
{
    while tokio::signal::ctrl_c().await.is_ok() {
        debug!(signal = %ProcessSignal::Interrupt, "Signal received");
        sink(ProcessSignal::Interrupt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(ProcessSignal::Interrupt.name(), "SIGINT");
        assert_eq!(ProcessSignal::Hangup.to_string(), "SIGHUP");
        assert_eq!(ProcessSignal::Toggle.name(), "SIGTSTP");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_subscription_rearms_after_delivery() {
        use nix::sys::signal::{Signal, raise};
        use tokio::sync::mpsc;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = SignalSubscription::spawn(move |signal| {
            let _ = tx.send(signal);
        });
        // Let the listener register its handlers.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        raise(Signal::SIGHUP).unwrap();
        assert_eq!(rx.recv().await, Some(ProcessSignal::Hangup));

        raise(Signal::SIGHUP).unwrap();
        assert_eq!(rx.recv().await, Some(ProcessSignal::Hangup));
    }
}
