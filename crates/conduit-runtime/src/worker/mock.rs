// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock worker for testing.
//!
//! Simulates the worker lifecycle without spawning anything. Every
//! transition is counted in shared state readable through a
//! [`MockWorkerProbe`], and load/start failures can be switched on and off
//! while the orchestrator owns the factory.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::traits::*;
use crate::codebase::Entry;
use crate::signals::ProcessSignal;

#[derive(Debug, Default)]
struct MockWorkerState {
    constructed: u32,
    loaded: u32,
    started: u32,
    stopped: u32,
    running: u32,
    max_running: u32,
    fail_load: bool,
    fail_start: bool,
    handled_signals: Vec<ProcessSignal>,
    last_entry: Option<Entry>,
    last_exit: Option<ExitHandle>,
    /// Start counter value at each stop, in stop order.
    stop_log: Vec<(u64, u32)>,
}

type SharedState = Arc<Mutex<MockWorkerState>>;

fn with_state<R>(state: &SharedState, f: impl FnOnce(&mut MockWorkerState) -> R) -> R {
    let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

/// Factory for mock workers.
#[derive(Debug, Default)]
pub struct MockWorkerFactory {
    state: SharedState,
    /// Simulated start latency.
    pub start_delay: Duration,
}

/// Shared view into a [`MockWorkerFactory`].
#[derive(Debug, Clone)]
pub struct MockWorkerProbe {
    state: SharedState,
}

impl MockWorkerFactory {
    /// Create a factory whose workers load and start successfully.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a factory whose workers fail to load.
    pub fn failing_load() -> Self {
        let factory = Self::new();
        with_state(&factory.state, |s| s.fail_load = true);
        factory
    }

    /// Workers claim `signals` for themselves.
    pub fn handling(self, signals: &[ProcessSignal]) -> Self {
        with_state(&self.state, |s| s.handled_signals = signals.to_vec());
        self
    }

    /// Delay every start by `delay`.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Probe sharing this factory's state.
    pub fn probe(&self) -> MockWorkerProbe {
        MockWorkerProbe {
            state: self.state.clone(),
        }
    }
}

impl MockWorkerProbe {
    /// Workers constructed.
    pub fn constructed(&self) -> u32 {
        with_state(&self.state, |s| s.constructed)
    }

    /// Successful loads.
    pub fn loaded(&self) -> u32 {
        with_state(&self.state, |s| s.loaded)
    }

    /// Successful starts.
    pub fn started(&self) -> u32 {
        with_state(&self.state, |s| s.started)
    }

    /// Stops of started workers.
    pub fn stopped(&self) -> u32 {
        with_state(&self.state, |s| s.stopped)
    }

    /// Workers currently started and not stopped.
    pub fn running(&self) -> u32 {
        with_state(&self.state, |s| s.running)
    }

    /// Highest number of simultaneously running workers observed.
    pub fn max_running(&self) -> u32 {
        with_state(&self.state, |s| s.max_running)
    }

    /// Entry most recently loaded.
    pub fn last_entry(&self) -> Option<Entry> {
        with_state(&self.state, |s| s.last_entry.clone())
    }

    /// For each stop, the generation stopped and the number of starts seen at
    /// that moment.
    pub fn stop_log(&self) -> Vec<(u64, u32)> {
        with_state(&self.state, |s| s.stop_log.clone())
    }

    /// Make subsequent loads fail (or succeed).
    pub fn set_fail_load(&self, fail: bool) {
        with_state(&self.state, |s| s.fail_load = fail);
    }

    /// Make subsequent starts fail (or succeed).
    pub fn set_fail_start(&self, fail: bool) {
        with_state(&self.state, |s| s.fail_start = fail);
    }

    /// Simulate the most recently constructed worker exiting on its own.
    pub fn exit_last(&self, code: i32) {
        if let Some(exit) = with_state(&self.state, |s| s.last_exit.clone()) {
            exit.request_exit(code);
        }
    }
}

/// Mock worker.
#[derive(Debug)]
pub struct MockWorker {
    state: SharedState,
    generation: u64,
    start_delay: Duration,
    loaded: bool,
    started: bool,
    handled_signals: Vec<ProcessSignal>,
}

impl MockWorker {
    /// Construction order of this worker, starting at 0.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[async_trait]
impl WorkerFactory for MockWorkerFactory {
    fn construct(&self, exit: ExitHandle) -> Box<dyn Worker> {
        let (generation, handled_signals) = with_state(&self.state, |s| {
            s.constructed += 1;
            s.last_exit = Some(exit);
            (u64::from(s.constructed - 1), s.handled_signals.clone())
        });
        Box::new(MockWorker {
            state: self.state.clone(),
            generation,
            start_delay: self.start_delay,
            loaded: false,
            started: false,
            handled_signals,
        })
    }
}

#[async_trait]
impl Worker for MockWorker {
    fn worker_type(&self) -> &'static str {
        "mock"
    }

    async fn load_entry(&mut self, entry: &Entry) -> Result<()> {
        with_state(&self.state, |s| {
            if s.fail_load {
                return Err(WorkerError::LoadFailed {
                    path: entry.path.clone(),
                    reason: "mock load failure".to_string(),
                });
            }
            s.loaded += 1;
            s.last_entry = Some(entry.clone());
            Ok(())
        })?;
        self.loaded = true;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if !self.loaded {
            return Err(WorkerError::NotLoaded);
        }
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        with_state(&self.state, |s| {
            if s.fail_start {
                return Err(WorkerError::StartFailed("mock start failure".to_string()));
            }
            s.started += 1;
            s.running += 1;
            s.max_running = s.max_running.max(s.running);
            Ok(())
        })?;
        self.started = true;
        Ok(())
    }

    async fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        let generation = self.generation;
        with_state(&self.state, |s| {
            s.stopped += 1;
            s.running = s.running.saturating_sub(1);
            s.stop_log.push((generation, s.started));
        });
    }

    fn handles_signal(&self, signal: ProcessSignal) -> bool {
        self.handled_signals.contains(&signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn entry() -> Entry {
        Entry {
            path: "mock://main".to_string(),
            source: Bytes::from_static(b"v1"),
        }
    }

    #[tokio::test]
    async fn test_mock_worker_lifecycle() {
        let factory = MockWorkerFactory::new();
        let probe = factory.probe();
        let mut worker = factory.construct(ExitHandle::new());

        worker.load_entry(&entry()).await.unwrap();
        worker.start().await.unwrap();
        assert_eq!(probe.running(), 1);

        worker.stop().await;
        worker.stop().await;
        assert_eq!(probe.stopped(), 1);
        assert_eq!(probe.running(), 0);
        assert_eq!(probe.stop_log(), vec![(0, 1)]);
        assert_eq!(probe.last_entry(), Some(entry()));
    }

    #[tokio::test]
    async fn test_mock_worker_failures() {
        let factory = MockWorkerFactory::failing_load();
        let probe = factory.probe();
        let mut worker = factory.construct(ExitHandle::new());
        assert!(worker.load_entry(&entry()).await.is_err());

        probe.set_fail_load(false);
        probe.set_fail_start(true);
        worker.load_entry(&entry()).await.unwrap();
        assert!(worker.start().await.is_err());
        assert_eq!(probe.started(), 0);
    }

    #[test]
    fn test_mock_worker_signals_and_exit() {
        let factory = MockWorkerFactory::new().handling(&[ProcessSignal::Hangup]);
        let probe = factory.probe();
        let exit = ExitHandle::new();
        let worker = factory.construct(exit.clone());

        assert!(worker.handles_signal(ProcessSignal::Hangup));
        assert!(!worker.handles_signal(ProcessSignal::Interrupt));

        probe.exit_last(7);
        assert_eq!(exit.exit_code(), Some(7));
    }
}
