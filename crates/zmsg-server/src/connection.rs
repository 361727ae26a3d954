//! Transport adapter: binds one session to one physical connection.
//!
//! Each connection runs two pumps. The inbound pump reads frames, refreshes
//! liveness, decodes envelopes and hands them to the router one at a time,
//! so envelopes from a single client are handled in arrival order. It also
//! owns the liveness deadline, so a peer that stops reading cannot hold it
//! back. The outbound pump drains the session's queue to the transport and
//! sends periodic pings; every write is bounded by the write timeout.
//! Either pump closing the session stops the other; the session is then
//! dropped from the registry exactly once.

use crate::router::Router;
use crate::services::{MessageService, UserService};
use crate::session::{CloseReason, OutboundQueue, Session};
use crate::transport::{FrameReader, FrameWriter, InboundFrame, Transport};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use zmsg_core::messages::error_codes;
use zmsg_core::{decode_envelope, Envelope, ZmsgError, ZmsgResult};

/// Liveness settings for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    /// How often a ping is written.
    pub ping_interval: Duration,
    /// Close the connection when nothing was received for this long.
    pub pong_timeout: Duration,
    /// Longest a single write may block before the peer counts as stalled.
    pub write_timeout: Duration,
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(300),
            write_timeout: Duration::from_secs(30),
        }
    }
}

/// Start both pumps for `session` over `transport`.
///
/// The session must already be registered. The returned task finishes after
/// the session has been unregistered and the transport released.
pub fn spawn_connection<T, U, M>(
    transport: T,
    session: Arc<Session>,
    queue: OutboundQueue,
    router: Arc<Router<U, M>>,
    liveness: Liveness,
) -> JoinHandle<()>
where
    T: Transport,
    U: UserService,
    M: MessageService,
{
    let peer = transport.peer();
    let (reader, writer) = transport.split();

    tokio::spawn(async move {
        info!(conn_id = %session.id(), peer = %peer, "connection opened");

        let outbound = tokio::spawn(outbound_pump(session.clone(), queue, writer, liveness));
        let reason = inbound_pump(&session, reader, &router, liveness.pong_timeout).await;
        session.close(reason);

        // Unregister before waiting on the writer, which may still be
        // finishing a bounded write to a slow peer.
        router.session_closed(&session).await;
        if let Err(e) = outbound.await {
            warn!(conn_id = %session.id(), error = %e, "outbound pump aborted");
        }

        info!(
            conn_id = %session.id(),
            user_id = ?session.user_id(),
            reason = %session.close_reason().unwrap_or(reason),
            age_secs = session.created_at().elapsed().as_secs(),
            "connection closed"
        );
    })
}

/// Read until the peer goes away, the session is closed elsewhere, the
/// liveness deadline passes, or a fatal error occurs. Returns the reason to
/// close with.
async fn inbound_pump<R, U, M>(
    session: &Arc<Session>,
    mut reader: R,
    router: &Router<U, M>,
    pong_timeout: Duration,
) -> CloseReason
where
    R: FrameReader,
    U: UserService,
    M: MessageService,
{
    loop {
        let deadline = session.last_seen() + pong_timeout;
        let frame = tokio::select! {
            _ = session.closed() => {
                return session.close_reason().unwrap_or(CloseReason::Disconnect);
            }
            _ = sleep_until(deadline) => {
                let err = ZmsgError::LivenessTimeout;
                info!(
                    conn_id = %session.id(),
                    idle_secs = session.idle().as_secs(),
                    error = %err,
                    "closing idle connection"
                );
                return CloseReason::from(&err);
            }
            frame = reader.read_frame() => frame,
        };

        let data = match frame {
            Ok(Some(InboundFrame::Data(data))) => {
                session.touch();
                data
            }
            Ok(Some(InboundFrame::Heartbeat)) => {
                session.touch();
                continue;
            }
            Ok(None) => return CloseReason::PeerClosed,
            Err(e) => {
                debug!(conn_id = %session.id(), error = %e, "read failed");
                return CloseReason::from(&e);
            }
        };

        let envelope = match decode_envelope(&data) {
            Ok(envelope) => envelope,
            Err(e) => {
                reject_malformed(session, 0, &e);
                return CloseReason::from(&e);
            }
        };

        let seq = envelope.seq;
        match router.dispatch(session, envelope).await {
            Ok(()) => {}
            Err(e @ ZmsgError::MalformedFrame(_)) => {
                reject_malformed(session, seq, &e);
                return CloseReason::from(&e);
            }
            Err(e) if e.is_connection_fatal() => {
                debug!(conn_id = %session.id(), error = %e, "dispatch failed fatally");
                return session.close_reason().unwrap_or(CloseReason::from(&e));
            }
            Err(e) => {
                warn!(conn_id = %session.id(), error = %e, "dispatch failed");
            }
        }
    }
}

/// Tell the client why it is being dropped. Best effort.
fn reject_malformed(session: &Session, seq: i64, err: &ZmsgError) {
    warn!(conn_id = %session.id(), error = %err, "malformed frame");
    match Envelope::error(seq, error_codes::MALFORMED_FRAME, err.to_string()) {
        Ok(envelope) => {
            if let Err(e) = session.send_envelope(&envelope) {
                debug!(conn_id = %session.id(), error = %e, "malformed-frame notice dropped");
            }
        }
        Err(e) => debug!(error = %e, "encode malformed-frame notice"),
    }
}

/// Run one transport write, failing with `Transport` if it outlives `limit`.
async fn bounded<F>(limit: Duration, what: &str, write: F) -> ZmsgResult<()>
where
    F: Future<Output = ZmsgResult<()>>,
{
    timeout(limit, write)
        .await
        .map_err(|_| ZmsgError::Transport(format!("{what} stalled for {}s", limit.as_secs())))?
}

/// Write queued frames and pings until the session closes.
async fn outbound_pump<W: FrameWriter>(
    session: Arc<Session>,
    mut queue: OutboundQueue,
    mut writer: W,
    liveness: Liveness,
) {
    let mut ticker = interval_at(
        Instant::now() + liveness.ping_interval,
        liveness.ping_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let written = tokio::select! {
            biased;
            _ = session.closed() => break,
            frame = queue.recv() => {
                let Some(frame) = frame else { break };
                bounded(liveness.write_timeout, "write", writer.write_frame(&frame)).await
            }
            _ = ticker.tick() => {
                bounded(liveness.write_timeout, "ping", writer.write_ping()).await
            }
        };
        if let Err(e) = written {
            debug!(conn_id = %session.id(), error = %e, "write failed");
            session.close(CloseReason::from(&e));
            break;
        }
    }

    // Flush what was queued before a deliberate close, e.g. a final error
    // envelope. A peer that timed out or failed a write gets nothing more.
    queue.close();
    let flush = !matches!(
        session.close_reason(),
        Some(CloseReason::TransportError) | Some(CloseReason::LivenessTimeout)
    );
    if flush {
        let drained = timeout(liveness.write_timeout, async {
            while let Ok(frame) = queue.try_recv() {
                writer.write_frame(&frame).await?;
            }
            Ok::<(), ZmsgError>(())
        })
        .await;
        if !matches!(drained, Ok(Ok(()))) {
            debug!(conn_id = %session.id(), "final flush abandoned");
        }
    }
    if let Err(e) = bounded(liveness.write_timeout, "close", writer.close()).await {
        debug!(conn_id = %session.id(), error = %e, "transport close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use crate::router::tests::{MockMessages, MockUsers};
    use crate::transport::{BoxFuture, MemoryPeer, MemoryTransport, PeerEvent};
    use zmsg_core::messages::{AuthPayload, ChatPayload, ErrorPayload};
    use zmsg_core::{encode_envelope, MsgType};

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        messages: Arc<MockMessages>,
        session: Arc<Session>,
        peer: MemoryPeer,
        task: JoinHandle<()>,
    }

    async fn spawn_on<T: Transport>(
        transport: T,
        liveness: Liveness,
    ) -> (Arc<ConnectionRegistry>, Arc<MockMessages>, Arc<Session>, JoinHandle<()>) {
        let registry = Arc::new(ConnectionRegistry::new(3));
        let messages = Arc::new(MockMessages::default());
        let router = Arc::new(Router::new(
            Arc::new(MockUsers::default()),
            messages.clone(),
            registry.clone(),
            100,
        ));
        let (session, queue) = Session::new("conn_test".into(), 16);
        registry.register(session.clone()).await;
        let task = spawn_connection(transport, session.clone(), queue, router, liveness);
        (registry, messages, session, task)
    }

    async fn start(liveness: Liveness) -> Harness {
        let (transport, peer) = MemoryTransport::pair("test");
        let (registry, messages, session, task) = spawn_on(transport, liveness).await;
        Harness {
            registry,
            messages,
            session,
            peer,
            task,
        }
    }

    /// A peer that neither sends nor reads: every read and write hangs.
    struct StalledTransport;
    struct StalledReader;
    struct StalledWriter;

    impl Transport for StalledTransport {
        type Reader = StalledReader;
        type Writer = StalledWriter;

        fn peer(&self) -> String {
            "stalled".into()
        }

        fn split(self) -> (StalledReader, StalledWriter) {
            (StalledReader, StalledWriter)
        }
    }

    impl FrameReader for StalledReader {
        fn read_frame(&mut self) -> BoxFuture<'_, ZmsgResult<Option<InboundFrame>>> {
            Box::pin(std::future::pending())
        }
    }

    impl FrameWriter for StalledWriter {
        fn write_frame<'a>(&'a mut self, _frame: &'a [u8]) -> BoxFuture<'a, ZmsgResult<()>> {
            Box::pin(std::future::pending())
        }

        fn write_ping(&mut self) -> BoxFuture<'_, ZmsgResult<()>> {
            Box::pin(std::future::pending())
        }

        fn close(&mut self) -> BoxFuture<'_, ZmsgResult<()>> {
            Box::pin(std::future::pending())
        }
    }

    fn frame(envelope: &Envelope) -> Vec<u8> {
        encode_envelope(envelope).unwrap()
    }

    #[tokio::test]
    async fn replies_in_order() {
        let mut h = start(Liveness::default()).await;
        for seq in 1..=5 {
            h.peer.send(frame(&Envelope::empty(MsgType::Ping, seq))).unwrap();
        }
        for seq in 1..=5 {
            let reply = decode_envelope(&h.peer.recv_frame().await.unwrap()).unwrap();
            assert_eq!(reply, Envelope::empty(MsgType::Pong, seq));
        }
    }

    fn auth(user_id: i64) -> Vec<u8> {
        frame(
            &Envelope::with_payload(MsgType::Auth, 1, &AuthPayload {
                token: format!("tok-{user_id}"),
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn chats_reach_the_store_in_arrival_order() {
        let mut h = start(Liveness::default()).await;
        h.peer.send(auth(10)).unwrap();
        for seq in 1..=3 {
            let chat = Envelope::with_payload(MsgType::Chat, seq, &ChatPayload {
                to: 20,
                kind: "text".into(),
                content: format!("m{seq}"),
            })
            .unwrap();
            h.peer.send(frame(&chat)).unwrap();
        }
        h.peer.send(frame(&Envelope::empty(MsgType::Ping, 4))).unwrap();

        // The pong is queued after all three chats were handled.
        loop {
            let reply = decode_envelope(&h.peer.recv_frame().await.unwrap()).unwrap();
            if reply.msg_type == MsgType::Pong {
                break;
            }
        }
        let contents: Vec<String> = h
            .messages
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(contents, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn peer_close_unregisters() {
        let mut h = start(Liveness::default()).await;
        h.peer.send(auth(10)).unwrap();
        h.peer.recv_frame().await.unwrap();
        assert!(h.registry.is_online(10).await);

        h.peer.close();
        h.task.await.unwrap();
        assert_eq!(h.session.close_reason(), Some(CloseReason::PeerClosed));
        assert!(!h.registry.is_online(10).await);
        assert_eq!(h.registry.count().await, 0);
    }

    #[tokio::test]
    async fn malformed_frame_is_reported_then_closed() {
        let mut h = start(Liveness::default()).await;
        h.peer.send(vec![0xde, 0xad, 0xbe, 0xef]).unwrap();

        let reply = decode_envelope(&h.peer.recv_frame().await.unwrap()).unwrap();
        assert_eq!(reply.msg_type, MsgType::Error);
        let payload: ErrorPayload = reply.payload_as().unwrap();
        assert_eq!(payload.code, error_codes::MALFORMED_FRAME);

        assert_eq!(h.peer.recv().await, Some(PeerEvent::Closed));
        h.task.await.unwrap();
        assert_eq!(h.session.close_reason(), Some(CloseReason::MalformedFrame));
        assert_eq!(h.registry.count().await, 0);
    }

    #[tokio::test]
    async fn server_side_close_stops_both_pumps() {
        let mut h = start(Liveness::default()).await;
        h.session.close(CloseReason::Disconnect);
        assert_eq!(h.peer.recv_frame().await, None);
        h.task.await.unwrap();
        assert_eq!(h.registry.count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pings_are_sent_and_pongs_keep_alive() {
        let liveness = Liveness {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(90),
            ..Liveness::default()
        };
        let mut h = start(liveness).await;

        for _ in 0..5 {
            assert_eq!(h.peer.recv().await, Some(PeerEvent::Ping));
            h.peer.pong().unwrap();
        }
        assert!(!h.session.is_closed());
        assert_eq!(h.registry.count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let mut h = start(Liveness {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(90),
            ..Liveness::default()
        })
        .await;

        tokio::time::sleep(Duration::from_secs(89)).await;
        assert!(!h.session.is_closed());

        tokio::time::sleep(Duration::from_secs(32)).await;
        assert_eq!(h.session.close_reason(), Some(CloseReason::LivenessTimeout));
        while let Some(event) = h.peer.recv().await {
            if event == PeerEvent::Closed {
                break;
            }
        }
        h.task.await.unwrap();
        assert_eq!(h.registry.count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_window_starts_at_last_activity() {
        let mut h = start(Liveness::default()).await;

        tokio::time::sleep(Duration::from_secs(100)).await;
        h.peer.pong().unwrap();

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(!h.session.is_closed());
        assert!(h.registry.session("conn_test").await.is_some());

        tokio::time::sleep(Duration::from_secs(32)).await;
        assert_eq!(h.session.close_reason(), Some(CloseReason::LivenessTimeout));
        assert!(h.registry.session("conn_test").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn peer_that_stops_reading_is_dropped() {
        let (registry, _messages, session, task) =
            spawn_on(StalledTransport, Liveness::default()).await;
        session.send(vec![1, 2, 3]).unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(session.close_reason(), Some(CloseReason::TransportError));
        assert_eq!(registry.count().await, 0);

        // The hung close is bounded too, so the task winds down.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_with_stalled_writer_still_times_out() {
        let liveness = Liveness {
            write_timeout: Duration::from_secs(3600),
            ..Liveness::default()
        };
        let (registry, _messages, session, task) = spawn_on(StalledTransport, liveness).await;
        session.send(vec![1, 2, 3]).unwrap();

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(registry.count().await, 1);

        tokio::time::sleep(Duration::from_secs(32)).await;
        assert_eq!(session.close_reason(), Some(CloseReason::LivenessTimeout));
        assert_eq!(registry.count().await, 0);
        task.abort();
    }
}
