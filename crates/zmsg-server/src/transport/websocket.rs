//! WebSocket transport using tokio-tungstenite.
//!
//! One binary WebSocket message carries one encoded envelope. Text messages
//! are ignored; WebSocket ping/pong control frames count as liveness.

use super::{BoxFuture, FrameReader, FrameWriter, InboundFrame, Transport};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use zmsg_core::{ZmsgError, ZmsgResult};

/// Default maximum frame size (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1_048_576;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    pub max_frame_size: usize,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
    max_frame_size: usize,
) -> ZmsgResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ZmsgError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let config = ws_config(max_frame_size);
                        match tokio_tungstenite::accept_async_with_config(stream, Some(config))
                            .await
                        {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    max_frame_size,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
            if tx.is_closed() {
                debug!("WebSocket listener stopped");
                break;
            }
        }
    });

    Ok((local_addr, rx))
}

/// Protocol limits so oversized messages are refused while being read.
fn ws_config(max_frame_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_frame_size);
    config.max_frame_size = Some(max_frame_size);
    config
}

impl Transport for WebSocketConnection {
    type Reader = WsReader;
    type Writer = WsWriter;

    fn peer(&self) -> String {
        self.remote_addr.to_string()
    }

    fn split(self) -> (WsReader, WsWriter) {
        let (sink, stream) = self.ws_stream.split();
        (
            WsReader {
                stream,
                max_frame_size: self.max_frame_size,
            },
            WsWriter { sink },
        )
    }
}

/// Receiving half of a WebSocket connection.
pub struct WsReader {
    stream: SplitStream<WebSocketStream<TcpStream>>,
    max_frame_size: usize,
}

impl FrameReader for WsReader {
    fn read_frame(&mut self) -> BoxFuture<'_, ZmsgResult<Option<InboundFrame>>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > self.max_frame_size {
                            return Err(ZmsgError::Transport(format!(
                                "WS frame too large: {} bytes (max {})",
                                data.len(),
                                self.max_frame_size
                            )));
                        }
                        return Ok(Some(InboundFrame::Data(data.into())));
                    }
                    // tungstenite queues the pong reply to a ping on its own.
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        return Ok(Some(InboundFrame::Heartbeat));
                    }
                    Some(Ok(Message::Close(_))) => return Ok(None),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Err(ZmsgError::Transport(format!("WS recv failed: {e}")));
                    }
                    None => return Ok(None),
                }
            }
        })
    }
}

/// Sending half of a WebSocket connection.
pub struct WsWriter {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
}

impl FrameWriter for WsWriter {
    fn write_frame<'a>(&'a mut self, frame: &'a [u8]) -> BoxFuture<'a, ZmsgResult<()>> {
        Box::pin(async move {
            self.sink
                .send(Message::Binary(frame.to_vec().into()))
                .await
                .map_err(|e| ZmsgError::Transport(format!("WS send failed: {e}")))
        })
    }

    fn write_ping(&mut self) -> BoxFuture<'_, ZmsgResult<()>> {
        Box::pin(async move {
            self.sink
                .send(Message::Ping(Vec::new().into()))
                .await
                .map_err(|e| ZmsgError::Transport(format!("WS ping failed: {e}")))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ZmsgResult<()>> {
        Box::pin(async move {
            self.sink
                .close()
                .await
                .map_err(|e| ZmsgError::Transport(format!("WS close failed: {e}")))
        })
    }
}
