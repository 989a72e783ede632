//! newsensors GRAIL - Aggregator and world model sessions
//!
//! This crate speaks the framed GRAIL protocols and adapts each session to
//! the collaborator traits of `newsensors-core`:
//! - Aggregator solver session as a `TelemetrySource`
//! - World model solver session as a `RegistryWriter`
//! - World model client session as a `RegistryStream`

pub mod aggregator;
pub mod codec;
mod session;
pub mod world_model;

pub use aggregator::{AggregatorConnection, SubscriptionRule, DEFAULT_AGGREGATOR_PORT};
pub use codec::ProtocolError;
pub use session::KEEP_ALIVE_INTERVAL;
pub use world_model::{
    ClientConnection, SolverConnection, DEFAULT_CLIENT_PORT, DEFAULT_SOLVER_PORT,
};
