//! In-memory collaborators for unit tests

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::interface::{
    RegistryError, RegistryStream, RegistryWriter, Sample, Snapshot, StreamError, TelemetrySource,
};

/// Shared flag observing whether a fake was closed after it was moved away
#[derive(Debug, Clone, Default)]
pub struct CloseFlag(Arc<AtomicBool>);

impl CloseFlag {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A registry call as seen by the fake writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Declare(String, bool),
    Create(String),
    Delete(String),
    Set(String, String, Vec<u8>),
}

#[derive(Debug, Default)]
pub struct RecordingWriter {
    pub commands: Vec<Command>,
    /// Fail every call once this many commands have been recorded
    pub fail_after: Option<usize>,
    pub closed: CloseFlag,
}

impl RecordingWriter {
    pub fn failing_after(count: usize) -> Self {
        Self {
            fail_after: Some(count),
            ..Self::default()
        }
    }

    pub fn creates(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::Create(id) => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn deletes(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::Delete(id) => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    fn record(&mut self, command: Command) -> Result<(), RegistryError> {
        if self.fail_after.is_some_and(|n| self.commands.len() >= n) {
            return Err(RegistryError::Disconnected);
        }
        self.commands.push(command);
        Ok(())
    }
}

impl RegistryWriter for RecordingWriter {
    fn declare_attribute(&mut self, name: &str, on_demand: bool) -> Result<(), RegistryError> {
        self.record(Command::Declare(name.to_string(), on_demand))
    }

    fn create_identifier(&mut self, identifier: &str) -> Result<(), RegistryError> {
        self.record(Command::Create(identifier.to_string()))
    }

    fn delete_identifier(&mut self, identifier: &str) -> Result<(), RegistryError> {
        self.record(Command::Delete(identifier.to_string()))
    }

    fn set_attribute(
        &mut self,
        identifier: &str,
        name: &str,
        payload: &[u8],
        _timestamp: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        self.record(Command::Set(
            identifier.to_string(),
            name.to_string(),
            payload.to_vec(),
        ))
    }

    fn close(&mut self) {
        self.closed.set();
    }
}

#[derive(Debug, Default)]
pub struct QueuedTelemetry {
    pub samples: VecDeque<Sample>,
    pub error: Option<StreamError>,
    pub closed: CloseFlag,
}

impl QueuedTelemetry {
    pub fn push(&mut self, physical_layer: u8, device_id: &[u8]) {
        self.samples.push_back(Sample {
            physical_layer,
            device_id: device_id.to_vec(),
        });
    }
}

impl TelemetrySource for QueuedTelemetry {
    fn try_next_sample(&mut self) -> Result<Option<Sample>, StreamError> {
        match self.samples.pop_front() {
            Some(sample) => Ok(Some(sample)),
            None => match &self.error {
                Some(e) => Err(e.clone()),
                None => Ok(None),
            },
        }
    }

    fn close(&mut self) {
        self.closed.set();
    }
}

#[derive(Debug, Default)]
pub struct QueuedSnapshots {
    pub snapshots: VecDeque<Snapshot>,
    pub error: Option<StreamError>,
    pub closed: CloseFlag,
}

impl RegistryStream for QueuedSnapshots {
    fn try_next_snapshot(&mut self) -> Result<Option<Snapshot>, StreamError> {
        match self.snapshots.pop_front() {
            Some(snapshot) => Ok(Some(snapshot)),
            None => match &self.error {
                Some(e) => Err(e.clone()),
                None => Ok(None),
            },
        }
    }

    fn close(&mut self) {
        self.closed.set();
    }
}
