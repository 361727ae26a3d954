//! Per-connection session state.
//!
//! A [`Session`] holds identity, liveness timestamps and the sending half of
//! the bounded outbound queue. It performs no I/O: the transport adapter in
//! [`crate::connection`] owns the receiving half and drives the socket.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use zmsg_core::{encode_envelope, Envelope, ZmsgError, ZmsgResult};

/// Opaque connection identifier.
pub type ConnId = String;

/// Lifecycle state derived from the session's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated(i64),
    Closed,
}

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the transport cleanly.
    PeerClosed,
    /// A read or write on the transport failed.
    TransportError,
    /// An inbound frame could not be decoded.
    MalformedFrame,
    /// No inbound activity within the pong timeout.
    LivenessTimeout,
    /// Explicit disconnect requested by the server.
    Disconnect,
    /// Whole-hub shutdown.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::PeerClosed => "peer closed",
            CloseReason::TransportError => "transport error",
            CloseReason::MalformedFrame => "malformed frame",
            CloseReason::LivenessTimeout => "liveness timeout",
            CloseReason::Disconnect => "disconnect",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

impl From<&ZmsgError> for CloseReason {
    /// Close reason for a connection-fatal error.
    fn from(err: &ZmsgError) -> Self {
        match err {
            ZmsgError::MalformedFrame(_) => CloseReason::MalformedFrame,
            ZmsgError::LivenessTimeout => CloseReason::LivenessTimeout,
            ZmsgError::Closed => CloseReason::Disconnect,
            _ => CloseReason::TransportError,
        }
    }
}

/// Receiving half of a session's outbound queue. Only the outbound pump reads it.
pub type OutboundQueue = mpsc::Receiver<Vec<u8>>;

/// Server-side state of one client connection.
pub struct Session {
    id: ConnId,
    /// 0 until authenticated; set at most once.
    user_id: AtomicI64,
    outbound: mpsc::Sender<Vec<u8>>,
    created_at: Instant,
    /// Milliseconds after `created_at` of the last inbound activity.
    last_seen_ms: AtomicU64,
    close_tx: watch::Sender<Option<CloseReason>>,
}

impl Session {
    /// Create an unauthenticated session with an outbound queue of `capacity` frames.
    pub fn new(id: ConnId, capacity: usize) -> (Arc<Self>, OutboundQueue) {
        let (outbound, queue) = mpsc::channel(capacity.max(1));
        let (close_tx, _) = watch::channel(None);
        let session = Arc::new(Self {
            id,
            user_id: AtomicI64::new(0),
            outbound,
            created_at: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
            close_tx,
        });
        (session, queue)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The authenticated user, if any.
    pub fn user_id(&self) -> Option<i64> {
        match self.user_id.load(Ordering::Acquire) {
            0 => None,
            uid => Some(uid),
        }
    }

    pub fn state(&self) -> SessionState {
        if self.is_closed() {
            return SessionState::Closed;
        }
        match self.user_id() {
            Some(uid) => SessionState::Authenticated(uid),
            None => SessionState::Unauthenticated,
        }
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Bind the session to `user_id`. Only the registry calls this, under its
    /// write lock together with the per-user cap check.
    pub(crate) fn bind_user(&self, user_id: i64) -> ZmsgResult<()> {
        if self.is_closed() {
            return Err(ZmsgError::Closed);
        }
        self.user_id
            .compare_exchange(0, user_id, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ZmsgError::AlreadyAuthenticated)
    }

    /// Queue an encoded frame without blocking.
    ///
    /// Fails with `QueueFull` when the peer is not draining fast enough and
    /// with `Closed` once the outbound pump has gone away.
    pub fn send(&self, frame: Vec<u8>) -> ZmsgResult<()> {
        if self.is_closed() {
            return Err(ZmsgError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ZmsgError::QueueFull(self.id.clone()),
            mpsc::error::TrySendError::Closed(_) => ZmsgError::Closed,
        })
    }

    /// Encode and queue an envelope.
    pub fn send_envelope(&self, envelope: &Envelope) -> ZmsgResult<()> {
        self.send(encode_envelope(envelope)?)
    }

    /// Record inbound activity (any frame, including transport-level pongs).
    pub fn touch(&self) {
        let ms = self.created_at.elapsed().as_millis() as u64;
        self.last_seen_ms.fetch_max(ms, Ordering::AcqRel);
    }

    pub fn last_seen(&self) -> Instant {
        self.created_at + Duration::from_millis(self.last_seen_ms.load(Ordering::Acquire))
    }

    /// Time since the last inbound activity.
    pub fn idle(&self) -> Duration {
        self.last_seen().elapsed()
    }

    /// Mark the session closed. Returns `true` for the call that actually
    /// closed it; later calls keep the first reason.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.close_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.close_tx.borrow().is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_tx.borrow()
    }

    /// Resolves once the session has been closed.
    pub async fn closed(&self) {
        let mut rx = self.close_tx.subscribe();
        let _ = rx.wait_for(Option::is_some).await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Generate a random connection id (`conn_` + 16 hex chars).
pub fn generate_conn_id() -> ConnId {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 8] = rng.gen();
    format!("conn_{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use zmsg_core::{decode_envelope, MsgType};

    #[test]
    fn starts_unauthenticated() {
        let (session, _queue) = Session::new("conn_a".into(), 4);
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert_eq!(session.user_id(), None);
    }

    #[test]
    fn user_is_bound_once() {
        let (session, _queue) = Session::new("conn_a".into(), 4);
        session.bind_user(10).unwrap();
        assert_eq!(session.state(), SessionState::Authenticated(10));

        let err = session.bind_user(20).unwrap_err();
        assert!(matches!(err, ZmsgError::AlreadyAuthenticated(10)));
        assert_eq!(session.user_id(), Some(10));
    }

    #[test]
    fn send_never_blocks_when_full() {
        let (session, mut queue) = Session::new("conn_a".into(), 2);
        session.send(vec![1]).unwrap();
        session.send(vec![2]).unwrap();
        assert!(matches!(session.send(vec![3]), Err(ZmsgError::QueueFull(_))));

        assert_eq!(queue.try_recv().unwrap(), vec![1]);
        session.send(vec![4]).unwrap();
    }

    #[test]
    fn send_envelope_enqueues_encoded_frame() {
        let (session, mut queue) = Session::new("conn_a".into(), 2);
        session
            .send_envelope(&Envelope::empty(MsgType::Pong, 3))
            .unwrap();
        let frame = queue.try_recv().unwrap();
        assert_eq!(decode_envelope(&frame).unwrap(), Envelope::empty(MsgType::Pong, 3));
    }

    #[test]
    fn close_is_terminal_and_keeps_first_reason() {
        let (session, _queue) = Session::new("conn_a".into(), 2);
        session.bind_user(10).unwrap();
        assert!(session.close(CloseReason::LivenessTimeout));
        assert!(!session.close(CloseReason::Disconnect));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::LivenessTimeout));
        assert!(matches!(session.send(vec![1]), Err(ZmsgError::Closed)));
    }

    #[test]
    fn closed_session_cannot_authenticate() {
        let (session, _queue) = Session::new("conn_a".into(), 2);
        session.close(CloseReason::PeerClosed);
        assert!(matches!(session.bind_user(10), Err(ZmsgError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_idle() {
        let (session, _queue) = Session::new("conn_a".into(), 2);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(session.idle() >= Duration::from_secs(10));
        session.touch();
        assert!(session.idle() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn closed_resolves_after_close() {
        let (session, _queue) = Session::new("conn_a".into(), 2);
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.closed().await })
        };
        session.close(CloseReason::Disconnect);
        waiter.await.unwrap();
    }

    #[test]
    fn close_reason_from_fatal_errors() {
        assert_eq!(
            CloseReason::from(&ZmsgError::MalformedFrame("x".into())),
            CloseReason::MalformedFrame
        );
        assert_eq!(
            CloseReason::from(&ZmsgError::LivenessTimeout),
            CloseReason::LivenessTimeout
        );
        assert_eq!(
            CloseReason::from(&ZmsgError::Transport("reset".into())),
            CloseReason::TransportError
        );
    }

    #[test]
    fn conn_ids_are_unique() {
        let a = generate_conn_id();
        let b = generate_conn_id();
        assert!(a.starts_with("conn_"));
        assert_ne!(a, b);
    }
}
