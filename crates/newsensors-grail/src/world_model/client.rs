//! Client session with the world model: streamed attribute snapshots

use chrono::Utc;
use newsensors_core::{Attribute, RegistryStream, Snapshot, StreamError};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::WORLD_MODEL_PROTOCOL;
use crate::codec::{Frame, MessageReader, MessageWriter, ProtocolError};
use crate::session::{next_frame, FrameReader, Session};

/// World model client message types
mod msg {
    pub const KEEP_ALIVE: u8 = 0;
    pub const STREAM_REQUEST: u8 = 3;
    pub const ATTRIBUTE_ALIAS: u8 = 4;
    pub const ORIGIN_ALIAS: u8 = 5;
    pub const REQUEST_COMPLETE: u8 = 6;
    pub const DATA_RESPONSE: u8 = 8;
}

/// Standing request for attribute updates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub ticket: u32,
    pub identifier_pattern: String,
    pub attribute_patterns: Vec<String>,
    /// Milliseconds since the Unix epoch
    pub begin: i64,
    pub interval_ms: i64,
}

impl StreamRequest {
    pub fn encode(&self) -> Frame {
        let mut out = MessageWriter::new(msg::STREAM_REQUEST);
        out.put_u32(self.ticket)
            .put_sized_utf16(&self.identifier_pattern)
            .put_u32(self.attribute_patterns.len() as u32);
        for pattern in &self.attribute_patterns {
            out.put_sized_utf16(pattern);
        }
        out.put_i64(self.begin).put_i64(self.interval_ms);
        out.finish()
    }
}

/// Attribute value as sent, before alias resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub name_alias: u32,
    pub created: i64,
    pub expires: i64,
    pub origin_alias: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataResponse {
    pub identifier: String,
    pub ticket: u32,
    pub attributes: Vec<RawAttribute>,
}

impl DataResponse {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = MessageReader::new(payload);
        let identifier = reader.get_sized_utf16()?;
        let ticket = reader.get_u32()?;
        let count = reader.get_u32()?;
        let mut attributes = Vec::new();
        for _ in 0..count {
            attributes.push(RawAttribute {
                name_alias: reader.get_u32()?,
                created: reader.get_i64()?,
                expires: reader.get_i64()?,
                origin_alias: reader.get_u32()?,
                data: reader.get_sized_bytes()?.to_vec(),
            });
        }
        Ok(Self {
            identifier,
            ticket,
            attributes,
        })
    }
}

/// Alias announcements: a count followed by (alias, sized name) pairs
pub fn decode_aliases(payload: &[u8]) -> Result<Vec<(u32, String)>, ProtocolError> {
    let mut reader = MessageReader::new(payload);
    let count = reader.get_u32()?;
    let mut aliases = Vec::new();
    for _ in 0..count {
        let alias = reader.get_u32()?;
        let name = reader.get_sized_utf16()?;
        aliases.push((alias, name));
    }
    Ok(aliases)
}

/// Names the world model has assigned to attribute and origin aliases
#[derive(Debug, Default)]
pub struct AliasTable {
    attributes: HashMap<u32, String>,
    origins: HashMap<u32, String>,
}

impl AliasTable {
    fn origin_name(&self, alias: u32) -> &str {
        self.origins.get(&alias).map(String::as_str).unwrap_or("?")
    }

    /// Resolve attribute names. Values with an unannounced alias are dropped.
    pub fn resolve(&self, response: DataResponse) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for raw in response.attributes {
            match self.attributes.get(&raw.name_alias) {
                Some(name) => {
                    trace!(
                        identifier = %response.identifier,
                        attribute = %name,
                        origin = self.origin_name(raw.origin_alias),
                        "Attribute update"
                    );
                    snapshot.push(
                        response.identifier.clone(),
                        Attribute::new(name.clone(), raw.data),
                    );
                }
                None => warn!(
                    identifier = %response.identifier,
                    alias = raw.name_alias,
                    "Attribute with unknown alias"
                ),
            }
        }
        snapshot
    }
}

/// Client connection to the world model
pub struct ClientConnection {
    session: Session,
    snapshots: mpsc::UnboundedReceiver<Result<Snapshot, String>>,
    next_ticket: u32,
}

impl ClientConnection {
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        let (mut session, frames) = Session::open(
            "world-model-client",
            host,
            port,
            connect_timeout,
            WORLD_MODEL_PROTOCOL,
        )
        .await?;
        let (tx, snapshots) = mpsc::unbounded_channel();
        session.spawn_reader(read_responses(frames, tx));

        Ok(Self {
            session,
            snapshots,
            next_ticket: 1,
        })
    }

    /// Start streaming attributes matching the patterns, beginning now.
    /// Returns the request ticket.
    pub fn stream(
        &mut self,
        identifier_pattern: &str,
        attribute_patterns: &[&str],
        interval: Duration,
    ) -> Result<u32, ProtocolError> {
        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let request = StreamRequest {
            ticket,
            identifier_pattern: identifier_pattern.to_string(),
            attribute_patterns: attribute_patterns.iter().map(|p| p.to_string()).collect(),
            begin: Utc::now().timestamp_millis(),
            interval_ms: interval.as_millis() as i64,
        };
        self.session.send(request.encode())?;
        info!(
            ticket = ticket,
            identifiers = identifier_pattern,
            attributes = ?attribute_patterns,
            "Requested attribute stream"
        );
        Ok(ticket)
    }
}

impl RegistryStream for ClientConnection {
    fn try_next_snapshot(&mut self) -> Result<Option<Snapshot>, StreamError> {
        match self.snapshots.try_recv() {
            Ok(Ok(snapshot)) => Ok(Some(snapshot)),
            Ok(Err(detail)) => Err(StreamError::new("world model", detail)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(StreamError::new("world model", "connection closed"))
            }
        }
    }

    fn close(&mut self) {
        self.session.close();
        self.snapshots.close();
    }
}

enum Inbound {
    Snapshot(Snapshot),
    Completed(u32),
    Nothing,
}

async fn read_responses(
    mut frames: FrameReader,
    tx: mpsc::UnboundedSender<Result<Snapshot, String>>,
) {
    let mut aliases = AliasTable::default();
    loop {
        let frame = match next_frame(&mut frames).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "World model client connection lost");
                let _ = tx.send(Err(e.to_string()));
                return;
            }
        };

        match handle_frame(&mut aliases, frame) {
            Ok(Inbound::Snapshot(snapshot)) => {
                if tx.send(Ok(snapshot)).is_err() {
                    return;
                }
            }
            Ok(Inbound::Completed(ticket)) => {
                let _ = tx.send(Err(format!("request {} completed by the world model", ticket)));
                return;
            }
            Ok(Inbound::Nothing) => {}
            Err(e) => warn!(error = %e, "Dropped malformed world model message"),
        }
    }
}

fn handle_frame(aliases: &mut AliasTable, frame: Frame) -> Result<Inbound, ProtocolError> {
    match frame.message_type {
        msg::ATTRIBUTE_ALIAS => {
            let entries = decode_aliases(&frame.payload)?;
            debug!(count = entries.len(), "Attribute aliases");
            aliases.attributes.extend(entries);
            Ok(Inbound::Nothing)
        }
        msg::ORIGIN_ALIAS => {
            let entries = decode_aliases(&frame.payload)?;
            debug!(count = entries.len(), "Origin aliases");
            aliases.origins.extend(entries);
            Ok(Inbound::Nothing)
        }
        msg::DATA_RESPONSE => {
            let response = DataResponse::decode(&frame.payload)?;
            let snapshot = aliases.resolve(response);
            if snapshot.is_empty() {
                Ok(Inbound::Nothing)
            } else {
                Ok(Inbound::Snapshot(snapshot))
            }
        }
        msg::REQUEST_COMPLETE => {
            let ticket = MessageReader::new(&frame.payload).get_u32()?;
            Ok(Inbound::Completed(ticket))
        }
        msg::KEEP_ALIVE => Ok(Inbound::Nothing),
        other => {
            debug!(message_type = other, "Unexpected world model message");
            Ok(Inbound::Nothing)
        }
    }
}
