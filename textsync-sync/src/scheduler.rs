//! Cyclic driver for one session.
//!
//! ```text
//!   ┌──────────────► stopped? ── yes ──► exit
//!   │                   │ no
//!   │                enabled? ── no ──► wait(disabled poll) ─┐
//!   │                   │ yes                                 │
//!   │              documents? ── none ──► exit (flag set under │
//!   │                   │                  the session lock)  │
//!   │                   │                                     │
//!   │   lock → build_request → unlock                         │
//!   │   transmit (timeout)          ← only network suspension │
//!   │   stopped? → discard                                    │
//!   │   lock → parse_response → unlock                        │
//!   │   server unshared anything? → UnshareObserver           │
//!   │   lock → recompute → unlock                             │
//!   │                   │                                     │
//!   └──── wait(interval) or stop/wake notification ◄──────────┘
//! ```
//!
//! The session lock is never held across the network call, so shares,
//! unshares and focus events never wait on I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::checkpoint::DocumentCheckpoint;
use crate::config::SyncConfig;
use crate::session::{ResponseOutcome, SyncSession};
use crate::transport::{Transport, TransportError};

/// Flags shared between a running scheduler and its handle.
#[derive(Debug)]
pub struct SchedulerControl {
    stopped: AtomicBool,
    enabled: AtomicBool,
    exited: AtomicBool,
    wake: Notify,
}

impl SchedulerControl {
    fn new(enabled: bool) -> Self {
        Self {
            stopped: AtomicBool::new(false),
            enabled: AtomicBool::new(enabled),
            exited: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// The loop has decided to exit and will run no further cycles.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

/// Owner hook for documents the server unshared (`N:` records).
///
/// Called after the session lock is released, with the documents' final
/// state.
#[async_trait]
pub trait UnshareObserver: Send + Sync {
    async fn server_unshared(&self, checkpoints: Vec<DocumentCheckpoint>);
}

/// Result of one cycle that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleReport {
    Completed(ResponseOutcome),
    /// Stop was requested while the exchange was in flight.
    Discarded,
}

pub struct SyncScheduler {
    session: Arc<Mutex<SyncSession>>,
    transport: Arc<dyn Transport>,
    control: Arc<SchedulerControl>,
    observer: Option<Arc<dyn UnshareObserver>>,
    timeout: Duration,
    disabled_poll: Duration,
}

impl SyncScheduler {
    pub fn new(session: Arc<Mutex<SyncSession>>, transport: Arc<dyn Transport>, config: &SyncConfig) -> Self {
        Self {
            session,
            transport,
            control: Arc::new(SchedulerControl::new(config.enabled)),
            observer: None,
            timeout: config.timeout(),
            disabled_poll: config.disabled_poll(),
        }
    }

    /// Start paused or running regardless of the config default.
    pub fn enabled(self, enabled: bool) -> Self {
        self.control.enabled.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn UnshareObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn control(&self) -> &Arc<SchedulerControl> {
        &self.control
    }

    /// One build → transmit → parse exchange.
    pub async fn run_cycle(&self) -> Result<CycleReport, TransportError> {
        let request = self.session.lock().await.build_request();

        let response = if request.is_null {
            String::new()
        } else {
            if self.control.is_stopped() {
                return Ok(CycleReport::Discarded);
            }
            match tokio::time::timeout(self.timeout, self.transport.transmit(request.body)).await {
                Ok(result) => result?,
                Err(_) => return Err(TransportError::Timeout(self.timeout)),
            }
        };

        if self.control.is_stopped() {
            log::debug!("discarding response received after stop");
            return Ok(CycleReport::Discarded);
        }

        let outcome = self.session.lock().await.parse_response(&response);
        Ok(CycleReport::Completed(outcome))
    }

    async fn wait(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.control.wake.notified() => {}
        }
    }

    /// Loop until stopped or no documents remain.
    pub async fn run(self) {
        log::info!("sync scheduler started");
        loop {
            if self.control.is_stopped() {
                break;
            }
            if !self.control.is_enabled() {
                self.wait(self.disabled_poll).await;
                continue;
            }
            {
                let session = self.session.lock().await;
                if session.is_empty() {
                    // A share racing with this check either lands first or
                    // sees the flag once it holds the lock.
                    self.control.exited.store(true, Ordering::SeqCst);
                    log::info!("no shared documents left");
                    break;
                }
            }

            match self.run_cycle().await {
                Ok(CycleReport::Completed(outcome)) if !outcome.unshared.is_empty() => {
                    if let Some(observer) = &self.observer {
                        observer.server_unshared(outcome.unshared).await;
                    }
                }
                Ok(_) => {}
                Err(err) => log::warn!("sync cycle aborted: {err}"),
            }

            let delay = self.session.lock().await.recompute_interval();
            log::debug!("next sync in {delay:?}");
            self.wait(delay).await;
        }
        self.control.exited.store(true, Ordering::SeqCst);
        log::info!("sync scheduler stopped");
    }

    pub fn spawn(self) -> SchedulerHandle {
        let control = Arc::clone(&self.control);
        let task = tokio::spawn(self.run());
        SchedulerHandle { control, task }
    }
}

/// Owner's side of a spawned scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    control: Arc<SchedulerControl>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Prevent further cycles. Never waits for an in-flight exchange.
    pub fn stop(&self) {
        self.control.stopped.store(true, Ordering::SeqCst);
        self.control.wake.notify_one();
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.control.enabled.store(enabled, Ordering::SeqCst);
        self.control.wake.notify_one();
    }

    /// Cut the current wait short.
    pub fn wake(&self) {
        self.control.wake.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.control.is_stopped()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Still able to pick up newly shared documents.
    pub fn is_running(&self) -> bool {
        !self.control.has_exited() && !self.task.is_finished()
    }

    /// Wait for the loop to exit.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            log::error!("sync scheduler task failed: {err}");
        }
    }
}
