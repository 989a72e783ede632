//! Connected GRAIL session: handshake, writer task and reader task handles

use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

use crate::codec::{connect, keep_alive, Frame, FrameCodec, ProtocolError};

/// Idle time after which a keep-alive is sent
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Inbound frames of a session
pub(crate) type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;

/// Outbound half of a session plus the background tasks serving it
pub(crate) struct Session {
    label: &'static str,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Connect and exchange handshakes within `connect_timeout`, then start
    /// the writer task. The frame reader is handed back for a
    /// protocol-specific reader task.
    pub(crate) async fn open(
        label: &'static str,
        host: &str,
        port: u16,
        connect_timeout: Duration,
        protocol: &str,
    ) -> Result<(Self, FrameReader), ProtocolError> {
        let stream = connect(host, port, protocol, connect_timeout).await?;
        info!(session = label, host = host, port = port, "Connected");

        let (read_half, write_half) = stream.into_split();
        let (outbound, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let sink = FramedWrite::new(write_half, FrameCodec::new());
        let writer = tokio::spawn(write_frames(label, sink, rx, closed.clone()));

        Ok((
            Self {
                label,
                outbound,
                closed,
                tasks: vec![writer],
            },
            FramedRead::new(read_half, FrameCodec::new()),
        ))
    }

    /// Run `reader` in the background for the lifetime of the session.
    /// The session is marked closed once it returns.
    pub(crate) fn spawn_reader<F>(&mut self, reader: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let closed = self.closed.clone();
        let label = self.label;
        self.tasks.push(tokio::spawn(async move {
            reader.await;
            debug!(session = label, "Reader stopped");
            closed.store(true, Ordering::SeqCst);
        }));
    }

    /// Queue a frame for the writer task
    pub(crate) fn send(&self, frame: Frame) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }
        self.outbound.send(frame).map_err(|_| ProtocolError::Closed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(session = self.label, "Closing session");
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Next inbound frame, with end of stream reported as `Closed`
pub(crate) async fn next_frame(reader: &mut FrameReader) -> Result<Frame, ProtocolError> {
    reader.next().await.unwrap_or(Err(ProtocolError::Closed))
}

async fn write_frames(
    label: &'static str,
    mut sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    closed: Arc<AtomicBool>,
) {
    let mut idle = tokio::time::interval(KEEP_ALIVE_INTERVAL);
    idle.tick().await;

    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = idle.tick() => {
                trace!(session = label, "Sending keep-alive");
                keep_alive()
            }
        };

        if let Err(e) = sink.send(frame).await {
            warn!(session = label, error = %e, "Write failed");
            break;
        }
        idle.reset();
    }

    closed.store(true, Ordering::SeqCst);
    let _ = sink.close().await;
}
