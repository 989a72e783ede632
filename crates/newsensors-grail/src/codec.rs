//! GRAIL framing: handshakes, length-prefixed messages and field encoding
//!
//! Every message on the wire is a big-endian `u32` length (covering the type
//! byte and payload), a `u8` message type, then the payload. Strings are
//! UTF-16BE; "sized" strings carry a `u32` byte length in front.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use tracing::debug;

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Width of the length prefix
const LENGTH_FIELD_LEN: usize = 4;

/// Protocol version and extension sent in every handshake
const PROTOCOL_VERSION: u8 = 0;
const PROTOCOL_EXTENSION: u8 = 0;

/// Message type shared by every GRAIL protocol
pub const KEEP_ALIVE: u8 = 0;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timed out connecting to {0}")]
    Timeout(String),
    #[error("Handshake mismatch: expected {expected:?}, got {received:?}")]
    HandshakeMismatch { expected: String, received: String },
    #[error("Message truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("Empty frame")]
    EmptyFrame,
    #[error("Invalid UTF-16 string")]
    InvalidString,
    #[error("Connection closed")]
    Closed,
}

/// One decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: u8,
    pub payload: Bytes,
}

/// Open a TCP connection and exchange handshakes, giving up after `limit`
pub async fn connect(
    host: &str,
    port: u16,
    protocol: &str,
    limit: Duration,
) -> Result<TcpStream, ProtocolError> {
    let establish = async {
        let mut stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        exchange_handshake(&mut stream, protocol).await?;
        Ok::<_, ProtocolError>(stream)
    };
    timeout(limit, establish)
        .await
        .map_err(|_| ProtocolError::Timeout(format!("{}:{}", host, port)))?
}

/// Encode the handshake for `protocol`
pub fn handshake_bytes(protocol: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_FIELD_LEN + 2 + protocol.len());
    buf.put_u32(protocol.len() as u32);
    buf.put_slice(protocol.as_bytes());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(PROTOCOL_EXTENSION);
    buf.freeze()
}

/// Send our handshake and check that the peer answers with the same one
pub async fn exchange_handshake<S>(stream: &mut S, protocol: &str) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = handshake_bytes(protocol);
    stream.write_all(&ours).await?;
    stream.flush().await?;

    let len = stream.read_u32().await? as usize;
    if len != protocol.len() {
        return Err(ProtocolError::HandshakeMismatch {
            expected: protocol.to_string(),
            received: format!("<{} byte protocol string>", len),
        });
    }
    let mut theirs = vec![0u8; len + 2];
    stream.read_exact(&mut theirs).await?;

    if theirs[..] != ours[LENGTH_FIELD_LEN..] {
        return Err(ProtocolError::HandshakeMismatch {
            expected: protocol.to_string(),
            received: String::from_utf8_lossy(&theirs[..len]).into_owned(),
        });
    }

    debug!(protocol = protocol, "Handshake complete");
    Ok(())
}

/// Length-delimited GRAIL frames with the message type split off the body
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(LENGTH_FIELD_LEN)
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec();
        Self { inner }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        // Check the prefix first so oversized and empty frames report their length
        if src.len() >= LENGTH_FIELD_LEN {
            let len = (&src[..LENGTH_FIELD_LEN]).get_u32() as usize;
            if len == 0 {
                return Err(ProtocolError::EmptyFrame);
            }
            if len > MAX_FRAME_LEN {
                return Err(ProtocolError::FrameTooLarge(len));
            }
        }

        let Some(mut body) = self.inner.decode(src)? else {
            return Ok(None);
        };
        let message_type = body.get_u8();
        Ok(Some(Frame {
            message_type,
            payload: body.freeze(),
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(ProtocolError::Closed),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::with_capacity(1 + frame.payload.len());
        body.put_u8(frame.message_type);
        body.put_slice(&frame.payload);
        self.inner.encode(body.freeze(), dst)?;
        Ok(())
    }
}

/// The keep-alive frame, identical for every protocol
pub fn keep_alive() -> Frame {
    MessageWriter::new(KEEP_ALIVE).finish()
}

/// Builds one outbound frame
pub struct MessageWriter {
    message_type: u8,
    buf: BytesMut,
}

impl MessageWriter {
    pub fn new(message_type: u8) -> Self {
        Self {
            message_type,
            buf: BytesMut::with_capacity(64),
        }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64(value);
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    pub fn put_f32(&mut self, value: f32) -> &mut Self {
        self.buf.put_f32(value);
        self
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// `u32` length followed by the bytes
    pub fn put_sized_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.put_u32(bytes.len() as u32);
        self.put_bytes(bytes)
    }

    /// UTF-16BE string running to the end of the message
    pub fn put_utf16(&mut self, value: &str) -> &mut Self {
        for unit in value.encode_utf16() {
            self.buf.put_u16(unit);
        }
        self
    }

    /// `u32` byte length followed by a UTF-16BE string
    pub fn put_sized_utf16(&mut self, value: &str) -> &mut Self {
        let units = value.encode_utf16().count();
        self.put_u32((units * 2) as u32);
        self.put_utf16(value)
    }

    pub fn finish(self) -> Frame {
        Frame {
            message_type: self.message_type,
            payload: self.buf.freeze(),
        }
    }
}

/// Cursor over an inbound payload
pub struct MessageReader<'a> {
    data: &'a [u8],
}

impl<'a> MessageReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    fn ensure(&self, needed: usize) -> Result<(), ProtocolError> {
        if needed > self.data.remaining() {
            return Err(ProtocolError::Truncated {
                needed,
                available: self.data.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<&'a [u8], ProtocolError> {
        self.ensure(count)?;
        let (bytes, rest) = self.data.split_at(count);
        self.data = rest;
        Ok(bytes)
    }

    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        self.ensure(1)?;
        Ok(self.data.get_u8())
    }

    pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.data.get_u32())
    }

    pub fn get_i64(&mut self) -> Result<i64, ProtocolError> {
        self.ensure(8)?;
        Ok(self.data.get_i64())
    }

    pub fn get_u64(&mut self) -> Result<u64, ProtocolError> {
        self.ensure(8)?;
        Ok(self.data.get_u64())
    }

    pub fn get_f32(&mut self) -> Result<f32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.data.get_f32())
    }

    /// Everything left in the payload
    pub fn get_rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }

    pub fn get_sized_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.get_u32()? as usize;
        self.get_bytes(len)
    }

    pub fn get_sized_utf16(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.get_sized_bytes()?;
        decode_utf16(bytes)
    }

    pub fn get_utf16_rest(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.get_rest();
        decode_utf16(bytes)
    }
}

fn decode_utf16(mut bytes: &[u8]) -> Result<String, ProtocolError> {
    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::InvalidString);
    }
    let mut units = Vec::with_capacity(bytes.len() / 2);
    while bytes.has_remaining() {
        units.push(bytes.get_u16());
    }
    String::from_utf16(&units).map_err(|_| ProtocolError::InvalidString)
}
