//! Solver session with the aggregator: subscription and sample stream

use newsensors_core::{Sample, StreamError, TelemetrySource};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::codec::{Frame, MessageReader, MessageWriter, ProtocolError};
use crate::session::{next_frame, FrameReader, Session};

/// Handshake string for the aggregator's solver port
pub const SOLVER_PROTOCOL: &str = "GRAIL solver protocol";

/// Default solver port on the aggregator
pub const DEFAULT_AGGREGATOR_PORT: u16 = 7008;

/// Width of transmitter and receiver ids on the wire
pub const ID_LEN: usize = 16;

/// Physical layer value matching every layer
pub const ALL_PHYSICAL_LAYERS: u8 = 0;

/// Aggregator solver message types
mod msg {
    pub const KEEP_ALIVE: u8 = 0;
    pub const CERTIFICATE: u8 = 1;
    pub const ACK_CERTIFICATE: u8 = 2;
    pub const SUBSCRIPTION_REQUEST: u8 = 3;
    pub const SUBSCRIPTION_RESPONSE: u8 = 4;
    pub const DEVICE_POSITION: u8 = 5;
    pub const SERVER_SAMPLE: u8 = 6;
    pub const BUFFER_OVERRUN: u8 = 7;
}

/// Transmitter id/mask pair inside a subscription rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitterFilter {
    pub id: [u8; ID_LEN],
    pub mask: [u8; ID_LEN],
}

/// Which samples the aggregator should forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRule {
    pub physical_layer: u8,
    /// Empty means every transmitter on the layer
    pub transmitters: Vec<TransmitterFilter>,
    pub update_interval_ms: u64,
}

impl SubscriptionRule {
    /// Every transmitter on `physical_layer`
    pub fn all(physical_layer: u8, update_interval_ms: u64) -> Self {
        Self {
            physical_layer,
            transmitters: Vec::new(),
            update_interval_ms,
        }
    }
}

/// Encode a subscription request (or response, which shares the layout)
pub fn encode_subscription(message_type: u8, rules: &[SubscriptionRule]) -> Frame {
    let mut out = MessageWriter::new(message_type);
    out.put_u32(rules.len() as u32);
    for rule in rules {
        out.put_u8(rule.physical_layer);
        out.put_u32(rule.transmitters.len() as u32);
        for tx in &rule.transmitters {
            out.put_bytes(&tx.id).put_bytes(&tx.mask);
        }
        out.put_u64(rule.update_interval_ms);
    }
    out.finish()
}

/// Decode the rule list of a subscription request or response
pub fn decode_subscription(payload: &[u8]) -> Result<Vec<SubscriptionRule>, ProtocolError> {
    let mut reader = MessageReader::new(payload);
    let count = reader.get_u32()?;
    let mut rules = Vec::new();
    for _ in 0..count {
        let physical_layer = reader.get_u8()?;
        let tx_count = reader.get_u32()?;
        let mut transmitters = Vec::new();
        for _ in 0..tx_count {
            let mut id = [0u8; ID_LEN];
            let mut mask = [0u8; ID_LEN];
            id.copy_from_slice(reader.get_bytes(ID_LEN)?);
            mask.copy_from_slice(reader.get_bytes(ID_LEN)?);
            transmitters.push(TransmitterFilter { id, mask });
        }
        let update_interval_ms = reader.get_u64()?;
        rules.push(SubscriptionRule {
            physical_layer,
            transmitters,
            update_interval_ms,
        });
    }
    Ok(rules)
}

/// A sample as forwarded by the aggregator
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSample {
    pub physical_layer: u8,
    pub device_id: Vec<u8>,
    pub receiver_id: Vec<u8>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub rssi: f32,
    pub data: Vec<u8>,
}

impl ServerSample {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = MessageReader::new(payload);
        Ok(Self {
            physical_layer: reader.get_u8()?,
            device_id: reader.get_bytes(ID_LEN)?.to_vec(),
            receiver_id: reader.get_bytes(ID_LEN)?.to_vec(),
            timestamp: reader.get_i64()?,
            rssi: reader.get_f32()?,
            data: reader.get_rest().to_vec(),
        })
    }

    pub fn encode(&self) -> Frame {
        let mut out = MessageWriter::new(msg::SERVER_SAMPLE);
        out.put_u8(self.physical_layer)
            .put_bytes(&self.device_id)
            .put_bytes(&self.receiver_id)
            .put_i64(self.timestamp)
            .put_f32(self.rssi)
            .put_bytes(&self.data);
        out.finish()
    }

    /// Reduce to the identity the reconciliation engine cares about
    pub fn into_sample(self) -> Sample {
        Sample {
            physical_layer: self.physical_layer,
            device_id: self.device_id,
        }
    }
}

/// Solver connection to the aggregator
pub struct AggregatorConnection {
    session: Session,
    samples: mpsc::UnboundedReceiver<Result<Sample, String>>,
}

impl AggregatorConnection {
    /// Connect and subscribe with `rules`
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        rules: Vec<SubscriptionRule>,
    ) -> Result<Self, ProtocolError> {
        let (mut session, frames) =
            Session::open("aggregator", host, port, connect_timeout, SOLVER_PROTOCOL).await?;

        let (tx, samples) = mpsc::unbounded_channel();
        session.spawn_reader(read_samples(frames, tx));
        session.send(encode_subscription(msg::SUBSCRIPTION_REQUEST, &rules))?;
        debug!(rules = rules.len(), "Sent subscription request");

        Ok(Self { session, samples })
    }
}

impl TelemetrySource for AggregatorConnection {
    fn try_next_sample(&mut self) -> Result<Option<Sample>, StreamError> {
        match self.samples.try_recv() {
            Ok(Ok(sample)) => Ok(Some(sample)),
            Ok(Err(detail)) => Err(StreamError::new("aggregator", detail)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(StreamError::new("aggregator", "connection closed"))
            }
        }
    }

    fn close(&mut self) {
        self.session.close();
        self.samples.close();
    }
}

async fn read_samples(mut frames: FrameReader, tx: mpsc::UnboundedSender<Result<Sample, String>>) {
    loop {
        let frame = match next_frame(&mut frames).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Aggregator connection lost");
                let _ = tx.send(Err(e.to_string()));
                return;
            }
        };

        match handle_frame(frame) {
            Ok(Some(sample)) => {
                if tx.send(Ok(sample)).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Dropped malformed aggregator message"),
        }
    }
}

fn handle_frame(frame: Frame) -> Result<Option<Sample>, ProtocolError> {
    match frame.message_type {
        msg::SERVER_SAMPLE => {
            let sample = ServerSample::decode(&frame.payload)?;
            trace!(
                physical_layer = sample.physical_layer,
                rssi = sample.rssi,
                "Received sample"
            );
            Ok(Some(sample.into_sample()))
        }
        msg::SUBSCRIPTION_RESPONSE => {
            let rules = decode_subscription(&frame.payload)?;
            info!(rules = rules.len(), "Aggregator accepted subscription");
            Ok(None)
        }
        msg::BUFFER_OVERRUN => {
            warn!("Aggregator reported a buffer overrun, samples were dropped");
            Ok(None)
        }
        msg::KEEP_ALIVE => Ok(None),
        msg::CERTIFICATE | msg::ACK_CERTIFICATE | msg::DEVICE_POSITION => {
            debug!(message_type = frame.message_type, "Ignoring aggregator message");
            Ok(None)
        }
        other => {
            debug!(message_type = other, "Unknown aggregator message");
            Ok(None)
        }
    }
}
