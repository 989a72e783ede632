//! World model sessions
//!
//! The world model exposes two ports speaking the same handshake: the solver
//! port accepts identifier and attribute writes, the client port serves
//! snapshot and stream requests.

pub mod client;
pub mod solver;

pub use client::{ClientConnection, StreamRequest};
pub use solver::SolverConnection;

/// Handshake string for both world model ports
pub const WORLD_MODEL_PROTOCOL: &str = "GRAIL world model protocol";

/// Default solver port on the world model
pub const DEFAULT_SOLVER_PORT: u16 = 7009;

/// Default client port on the world model
pub const DEFAULT_CLIENT_PORT: u16 = 7010;
