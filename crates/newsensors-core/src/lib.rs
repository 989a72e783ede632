//! newsensors core - Reconciliation of unregistered devices against the world model
//!
//! This crate provides:
//! - Device keys derived from telemetry identity bytes and registry payloads
//! - Reconciliation state (registered, pending and reported keys)
//! - The reconciliation engine with its ordered removal/prune/report passes
//! - The control loop that drives the engine from its collaborators

pub mod control;
pub mod engine;
pub mod interface;
pub mod key;
pub mod state;

#[cfg(test)]
mod testing;

pub use control::{ControlLoop, LoopConfig, LoopError, Shutdown};
pub use engine::{CycleReport, ReconciliationEngine};
pub use interface::{
    Attribute, RegistryError, RegistryStream, RegistryWriter, Sample, Snapshot, StreamError,
    TelemetrySource,
};
pub use key::{DecodeError, DeviceKey};
pub use state::{KeyStatus, ReconciliationState};
