//! Solver session with the world model: attribute announcements and writes

use chrono::{DateTime, Utc};
use newsensors_core::{RegistryError, RegistryWriter};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::WORLD_MODEL_PROTOCOL;
use crate::codec::{Frame, MessageWriter, ProtocolError};
use crate::session::{next_frame, FrameReader, Session};

/// World model solver message types
mod msg {
    pub const KEEP_ALIVE: u8 = 0;
    pub const TYPE_ANNOUNCE: u8 = 1;
    pub const START_ON_DEMAND: u8 = 2;
    pub const STOP_ON_DEMAND: u8 = 3;
    pub const SOLVER_DATA: u8 = 4;
    pub const CREATE_URI: u8 = 5;
    pub const DELETE_URI: u8 = 7;
}

/// One attribute type in a type announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSpec {
    pub alias: u32,
    pub name: String,
    pub on_demand: bool,
}

pub fn encode_type_announce(types: &[TypeSpec], origin: &str) -> Frame {
    let mut out = MessageWriter::new(msg::TYPE_ANNOUNCE);
    out.put_u32(types.len() as u32);
    for spec in types {
        out.put_u32(spec.alias)
            .put_sized_utf16(&spec.name)
            .put_u8(u8::from(spec.on_demand));
    }
    out.put_utf16(origin);
    out.finish()
}

pub fn encode_create_uri(identifier: &str, created: DateTime<Utc>, origin: &str) -> Frame {
    let mut out = MessageWriter::new(msg::CREATE_URI);
    out.put_sized_utf16(identifier)
        .put_i64(created.timestamp_millis())
        .put_utf16(origin);
    out.finish()
}

pub fn encode_delete_uri(identifier: &str, origin: &str) -> Frame {
    let mut out = MessageWriter::new(msg::DELETE_URI);
    out.put_sized_utf16(identifier).put_utf16(origin);
    out.finish()
}

/// Solver data carrying a single attribute value
pub fn encode_solver_data(
    alias: u32,
    timestamp: DateTime<Utc>,
    identifier: &str,
    payload: &[u8],
) -> Frame {
    let mut out = MessageWriter::new(msg::SOLVER_DATA);
    // Identifiers are created explicitly beforehand
    out.put_u8(0)
        .put_u32(1)
        .put_u32(alias)
        .put_i64(timestamp.timestamp_millis())
        .put_sized_utf16(identifier)
        .put_sized_bytes(payload);
    out.finish()
}

/// Solver connection to the world model
pub struct SolverConnection {
    session: Session,
    origin: String,
    aliases: HashMap<String, u32>,
}

impl SolverConnection {
    /// Connect to the solver port, writing as `origin`
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        origin: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let (mut session, frames) = Session::open(
            "world-model-solver",
            host,
            port,
            connect_timeout,
            WORLD_MODEL_PROTOCOL,
        )
        .await?;
        session.spawn_reader(read_control(frames));

        Ok(Self {
            session,
            origin: origin.into(),
            aliases: HashMap::new(),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn push(&self, frame: Frame) -> Result<(), RegistryError> {
        self.session
            .send(frame)
            .map_err(|_| RegistryError::Disconnected)
    }
}

impl RegistryWriter for SolverConnection {
    fn declare_attribute(&mut self, name: &str, on_demand: bool) -> Result<(), RegistryError> {
        if self.aliases.contains_key(name) {
            return Ok(());
        }
        let alias = self.aliases.len() as u32 + 1;
        let spec = TypeSpec {
            alias,
            name: name.to_string(),
            on_demand,
        };
        self.push(encode_type_announce(&[spec], &self.origin))?;
        self.aliases.insert(name.to_string(), alias);
        debug!(attribute = name, alias = alias, "Announced attribute type");
        Ok(())
    }

    fn create_identifier(&mut self, identifier: &str) -> Result<(), RegistryError> {
        self.push(encode_create_uri(identifier, Utc::now(), &self.origin))
    }

    fn delete_identifier(&mut self, identifier: &str) -> Result<(), RegistryError> {
        self.push(encode_delete_uri(identifier, &self.origin))
    }

    fn set_attribute(
        &mut self,
        identifier: &str,
        name: &str,
        payload: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let alias = *self
            .aliases
            .get(name)
            .ok_or_else(|| RegistryError::Rejected {
                operation: "set attribute",
                identifier: identifier.to_string(),
                reason: format!("attribute {:?} was never declared", name),
            })?;
        self.push(encode_solver_data(alias, timestamp, identifier, payload))
    }

    fn close(&mut self) {
        self.session.close();
    }
}

async fn read_control(mut frames: FrameReader) {
    loop {
        match next_frame(&mut frames).await {
            Ok(frame) => match frame.message_type {
                msg::KEEP_ALIVE => trace!("World model keep-alive"),
                msg::START_ON_DEMAND | msg::STOP_ON_DEMAND => {
                    debug!(message_type = frame.message_type, "Ignoring on-demand request")
                }
                other => debug!(message_type = other, "Unexpected world model message"),
            },
            Err(e) => {
                warn!(error = %e, "World model solver connection lost");
                return;
            }
        }
    }
}
