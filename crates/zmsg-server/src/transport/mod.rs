//! Transport abstraction.
//!
//! The core never touches a concrete socket type. A transport is split into
//! a reader driven by the inbound pump and a writer driven by the outbound
//! pump, so both directions can run concurrently.

pub mod memory;
pub mod websocket;

pub use memory::{MemoryPeer, MemoryTransport, PeerEvent};
pub use websocket::WebSocketConnection;

use std::future::Future;
use std::pin::Pin;
use zmsg_core::ZmsgResult;

/// Boxed `Send` future returned by transport methods (keeps the traits object-safe).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One unit read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// An encoded envelope.
    Data(Vec<u8>),
    /// Transport-level liveness signal (e.g. a WebSocket pong). Carries no envelope.
    Heartbeat,
}

/// Receiving half of a transport.
pub trait FrameReader: Send {
    /// Read the next frame. `Ok(None)` means the peer closed the connection.
    fn read_frame(&mut self) -> BoxFuture<'_, ZmsgResult<Option<InboundFrame>>>;
}

/// Sending half of a transport.
pub trait FrameWriter: Send {
    /// Write one encoded envelope.
    fn write_frame<'a>(&'a mut self, frame: &'a [u8]) -> BoxFuture<'a, ZmsgResult<()>>;

    /// Write a liveness probe.
    fn write_ping(&mut self) -> BoxFuture<'_, ZmsgResult<()>>;

    /// Close the connection.
    fn close(&mut self) -> BoxFuture<'_, ZmsgResult<()>>;
}

/// A physical duplex connection handed to the hub.
pub trait Transport: Send + 'static {
    type Reader: FrameReader + 'static;
    type Writer: FrameWriter + 'static;

    /// Human-readable peer description for logs.
    fn peer(&self) -> String;

    fn split(self) -> (Self::Reader, Self::Writer);
}
