//! Collaborator interfaces for the telemetry feed and the registry

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

/// Identifier pattern for the registry subscription (any identifier)
pub const ANY_IDENTIFIER_PATTERN: &str = ".*";

/// Attribute pattern for the registry subscription
pub const SENSOR_ATTRIBUTE_PATTERN: &str = ".*sensor.*";

/// Substring an attribute name must contain to carry a device key
pub const SENSOR_ATTRIBUTE_MARKER: &str = "sensor";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Registry connection closed")]
    Disconnected,
    #[error("Registry rejected {operation} for {identifier}: {reason}")]
    Rejected {
        operation: &'static str,
        identifier: String,
        reason: String,
    },
}

/// Terminal error on an inbound stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{source_name} stream failed: {detail}")]
pub struct StreamError {
    pub source_name: &'static str,
    pub detail: String,
}

impl StreamError {
    pub fn new(source_name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            source_name,
            detail: detail.into(),
        }
    }
}

/// One telemetry sample, reduced to the identity of the transmitter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub physical_layer: u8,
    pub device_id: Vec<u8>,
}

/// A single attribute value inside a registry snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    /// Raw payload; `None` when the registry sent no data
    pub payload: Option<Vec<u8>>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload: Some(payload),
        }
    }

    /// Whether this attribute is on the sensor attribute stream
    pub fn is_sensor(&self) -> bool {
        self.name.contains(SENSOR_ATTRIBUTE_MARKER)
    }
}

/// Registry state for a set of identifiers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub identifiers: BTreeMap<String, Vec<Attribute>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attribute under an identifier
    pub fn push(&mut self, identifier: impl Into<String>, attribute: Attribute) {
        self.identifiers
            .entry(identifier.into())
            .or_default()
            .push(attribute);
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }
}

/// Non-blocking source of telemetry samples
pub trait TelemetrySource {
    /// Next buffered sample, `Ok(None)` when nothing is waiting
    fn try_next_sample(&mut self) -> Result<Option<Sample>, StreamError>;

    /// Shut the underlying connection down
    fn close(&mut self);
}

/// Non-blocking stream of registry snapshots
pub trait RegistryStream {
    /// Next buffered snapshot, `Ok(None)` when nothing is waiting.
    /// An error is terminal.
    fn try_next_snapshot(&mut self) -> Result<Option<Snapshot>, StreamError>;

    fn close(&mut self);
}

/// Mutations issued against the registry.
///
/// Calls are fire-and-forget: `Ok` means the request was handed to the
/// connection, not that the registry applied it.
pub trait RegistryWriter {
    fn declare_attribute(&mut self, name: &str, on_demand: bool) -> Result<(), RegistryError>;

    fn create_identifier(&mut self, identifier: &str) -> Result<(), RegistryError>;

    fn delete_identifier(&mut self, identifier: &str) -> Result<(), RegistryError>;

    fn set_attribute(
        &mut self,
        identifier: &str,
        name: &str,
        payload: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<(), RegistryError>;

    fn close(&mut self);
}
