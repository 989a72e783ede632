//! Control loop driving the reconciliation engine

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::engine::ReconciliationEngine;
use crate::interface::{
    RegistryError, RegistryStream, RegistryWriter, StreamError, TelemetrySource,
};

/// Default reconciliation interval
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(30_000);

/// Default sleep between iterations that found nothing to do
pub const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(10);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoopError {
    #[error("Registry operation failed: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Shared stop flag, set by a fatal error or an external signal
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Timing for the control loop
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    /// Delay between reconciliation cycles
    pub update_interval: Duration,
    /// Sleep after an iteration that did no work
    pub idle_poll: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            update_interval: DEFAULT_UPDATE_INTERVAL,
            idle_poll: DEFAULT_IDLE_POLL,
        }
    }
}

/// Single-consumer loop owning the engine and its three collaborators
pub struct ControlLoop<T, S, W> {
    engine: ReconciliationEngine,
    telemetry: T,
    registry: S,
    writer: W,
    config: LoopConfig,
    /// `None` once the deadline no longer fits in an `Instant`
    next_cycle: Option<Instant>,
    shutdown: Shutdown,
}

/// Deadline one `interval` after `from`, if representable
fn deadline(from: Instant, interval: Duration) -> Option<Instant> {
    let due = from.checked_add(interval);
    if due.is_none() {
        warn!(
            interval_ms = interval.as_millis() as u64,
            "Update interval out of range, no further cycles will run"
        );
    }
    due
}

impl<T, S, W> ControlLoop<T, S, W>
where
    T: TelemetrySource,
    S: RegistryStream,
    W: RegistryWriter,
{
    /// Build a loop whose first cycle is due one interval after `start`
    pub fn new(
        engine: ReconciliationEngine,
        telemetry: T,
        registry: S,
        writer: W,
        config: LoopConfig,
        shutdown: Shutdown,
        start: Instant,
    ) -> Self {
        Self {
            engine,
            telemetry,
            registry,
            writer,
            config,
            next_cycle: deadline(start, config.update_interval),
            shutdown,
        }
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn next_cycle(&self) -> Option<Instant> {
        self.next_cycle
    }

    /// Run one iteration at time `now`. Returns whether any work was done.
    pub fn step(&mut self, now: Instant) -> Result<bool, LoopError> {
        let mut busy = false;

        if self.next_cycle.is_some_and(|due| now >= due) {
            self.engine.run_cycle(&mut self.writer)?;
            self.next_cycle = deadline(now, self.config.update_interval);
            busy = true;
        }

        if let Some(sample) = self.telemetry.try_next_sample()? {
            self.engine.observe_sample(&sample);
            busy = true;
        }

        loop {
            match self.registry.try_next_snapshot()? {
                Some(snapshot) => {
                    self.engine.apply_snapshot(&snapshot);
                    busy = true;
                }
                None => break,
            }
        }

        Ok(busy)
    }

    /// Drive the engine until shutdown is requested or a fatal error occurs.
    /// All three connections are closed before returning.
    pub async fn run(mut self) -> Result<(), LoopError> {
        info!(
            interval_ms = self.config.update_interval.as_millis() as u64,
            "Reconciliation loop started"
        );

        let result = loop {
            if self.shutdown.is_triggered() {
                info!("Shutdown requested");
                break Ok(());
            }

            match self.step(Instant::now()) {
                Ok(true) => tokio::task::yield_now().await,
                Ok(false) => tokio::time::sleep(self.config.idle_poll).await,
                Err(e) => {
                    match &e {
                        LoopError::Registry(_) => {
                            error!(error = %e, "Registry operation failed, shutting down")
                        }
                        LoopError::Stream(_) => {
                            warn!(error = %e, "Inbound stream ended, shutting down")
                        }
                    }
                    self.shutdown.trigger();
                    break Err(e);
                }
            }
        };

        self.close();
        result
    }

    fn close(&mut self) {
        debug!("Closing connections");
        self.telemetry.close();
        self.registry.close();
        self.writer.close();
    }
}
