//! In-process transport backed by channels.
//!
//! [`MemoryTransport::pair`] returns the server end, which is handed to the
//! hub like any socket, and a [`MemoryPeer`] that plays the client.

use super::{BoxFuture, FrameReader, FrameWriter, InboundFrame, Transport};
use tokio::sync::mpsc;
use zmsg_core::{ZmsgError, ZmsgResult};

/// What the client end observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Frame(Vec<u8>),
    Ping,
    Closed,
}

/// Server end of an in-memory connection.
pub struct MemoryTransport {
    name: String,
    inbound: mpsc::UnboundedReceiver<InboundFrame>,
    outbound: mpsc::UnboundedSender<PeerEvent>,
}

/// Client end of an in-memory connection.
pub struct MemoryPeer {
    to_server: Option<mpsc::UnboundedSender<InboundFrame>>,
    from_server: mpsc::UnboundedReceiver<PeerEvent>,
}

impl MemoryTransport {
    pub fn pair(name: impl Into<String>) -> (MemoryTransport, MemoryPeer) {
        let (to_server, inbound) = mpsc::unbounded_channel();
        let (outbound, from_server) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                name: name.into(),
                inbound,
                outbound,
            },
            MemoryPeer {
                to_server: Some(to_server),
                from_server,
            },
        )
    }
}

impl Transport for MemoryTransport {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn peer(&self) -> String {
        format!("memory:{}", self.name)
    }

    fn split(self) -> (MemoryReader, MemoryWriter) {
        (
            MemoryReader {
                inbound: self.inbound,
            },
            MemoryWriter {
                outbound: self.outbound,
            },
        )
    }
}

pub struct MemoryReader {
    inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

impl FrameReader for MemoryReader {
    fn read_frame(&mut self) -> BoxFuture<'_, ZmsgResult<Option<InboundFrame>>> {
        Box::pin(async move { Ok(self.inbound.recv().await) })
    }
}

pub struct MemoryWriter {
    outbound: mpsc::UnboundedSender<PeerEvent>,
}

impl MemoryWriter {
    fn push(&self, event: PeerEvent) -> ZmsgResult<()> {
        self.outbound
            .send(event)
            .map_err(|_| ZmsgError::Transport("memory peer dropped".into()))
    }
}

impl FrameWriter for MemoryWriter {
    fn write_frame<'a>(&'a mut self, frame: &'a [u8]) -> BoxFuture<'a, ZmsgResult<()>> {
        Box::pin(async move { self.push(PeerEvent::Frame(frame.to_vec())) })
    }

    fn write_ping(&mut self) -> BoxFuture<'_, ZmsgResult<()>> {
        Box::pin(async move { self.push(PeerEvent::Ping) })
    }

    fn close(&mut self) -> BoxFuture<'_, ZmsgResult<()>> {
        Box::pin(async move {
            // The peer may already be gone; closing is best effort.
            let _ = self.outbound.send(PeerEvent::Closed);
            Ok(())
        })
    }
}

impl MemoryPeer {
    /// Send an encoded envelope to the server.
    pub fn send(&self, frame: Vec<u8>) -> ZmsgResult<()> {
        self.push(InboundFrame::Data(frame))
    }

    /// Answer a ping.
    pub fn pong(&self) -> ZmsgResult<()> {
        self.push(InboundFrame::Heartbeat)
    }

    fn push(&self, frame: InboundFrame) -> ZmsgResult<()> {
        self.to_server
            .as_ref()
            .ok_or(ZmsgError::Closed)?
            .send(frame)
            .map_err(|_| ZmsgError::Closed)
    }

    /// Next event from the server. `None` once the server end is dropped.
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        self.from_server.recv().await
    }

    /// Next data frame, skipping pings. `None` on close.
    pub async fn recv_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.from_server.recv().await? {
                PeerEvent::Frame(f) => return Some(f),
                PeerEvent::Ping => continue,
                PeerEvent::Closed => return None,
            }
        }
    }

    /// Non-blocking poll for a pending event.
    pub fn try_recv(&mut self) -> Option<PeerEvent> {
        self.from_server.try_recv().ok()
    }

    /// Close the client side; the server reads end-of-stream.
    pub fn close(&mut self) {
        self.to_server = None;
    }
}
