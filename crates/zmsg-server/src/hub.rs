//! The chat hub: wires registry, router and transports together.
//!
//! [`ChatHub`] is the surface the rest of the service talks to. It accepts
//! physical connections, lets other components push events to users, and
//! handles administrative disconnects and shutdown.

use crate::connection::{spawn_connection, Liveness};
use crate::registry::{ConnectionRegistry, Delivery, DEFAULT_MAX_CONNECTIONS_PER_USER};
use crate::router::{Router, DEFAULT_SYNC_PAGE_SIZE};
use crate::services::{MessageService, UserService};
use crate::session::{generate_conn_id, CloseReason, ConnId, Session};
use crate::transport::websocket::{self, DEFAULT_MAX_FRAME_SIZE};
use crate::transport::Transport;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};
use zmsg_core::messages::{ChatPushPayload, PresencePushPayload};
use zmsg_core::{Envelope, MsgType, ZmsgResult};

/// Default capacity of each session's outbound queue, in frames.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Runtime settings for a [`ChatHub`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    pub max_connections_per_user: usize,
    pub outbound_queue_capacity: usize,
    pub liveness: Liveness,
    pub sync_page_size: usize,
    pub max_frame_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: DEFAULT_MAX_CONNECTIONS_PER_USER,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            liveness: Liveness::default(),
            sync_page_size: DEFAULT_SYNC_PAGE_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// An event pushed to a user from outside the connection that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    Chat(ChatPushPayload),
    Presence(PresencePushPayload),
}

impl PushEvent {
    fn to_envelope(&self) -> ZmsgResult<Envelope> {
        match self {
            PushEvent::Chat(p) => Envelope::with_payload(MsgType::ChatPush, 0, p),
            PushEvent::Presence(p) => Envelope::with_payload(MsgType::PresencePush, 0, p),
        }
    }
}

pub struct ChatHub<U, M> {
    config: HubConfig,
    registry: Arc<ConnectionRegistry>,
    router: Arc<Router<U, M>>,
}

impl<U: UserService, M: MessageService> ChatHub<U, M> {
    pub fn new(config: HubConfig, users: Arc<U>, messages: Arc<M>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections_per_user));
        let router = Arc::new(Router::new(
            users,
            messages,
            registry.clone(),
            config.sync_page_size,
        ));
        Self {
            config,
            registry,
            router,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router<U, M>> {
        &self.router
    }

    /// Register a new unauthenticated session for `transport` and start its pumps.
    pub async fn accept_connection<T: Transport>(&self, transport: T) -> ConnId {
        let id = generate_conn_id();
        let (session, queue) = Session::new(id.clone(), self.config.outbound_queue_capacity);
        self.registry.register(session.clone()).await;
        spawn_connection(
            transport,
            session,
            queue,
            self.router.clone(),
            self.config.liveness,
        );
        id
    }

    /// Queue `event` to every live session of `user_id`.
    ///
    /// An offline user is not an error: the result reports zero deliveries.
    pub async fn push_to_user(&self, user_id: i64, event: PushEvent) -> ZmsgResult<Delivery> {
        let envelope = event.to_envelope()?;
        self.registry.broadcast(user_id, &envelope).await
    }

    /// Close one connection. Returns `false` if it was unknown or already closing.
    pub async fn disconnect(&self, conn_id: &str) -> bool {
        match self.registry.session(conn_id).await {
            Some(session) => session.close(CloseReason::Disconnect),
            None => false,
        }
    }

    /// Close every connection of `user_id`. Returns how many were closed.
    pub async fn disconnect_user(&self, user_id: i64) -> usize {
        let sessions = self.registry.unregister_user(user_id).await;
        if sessions.is_empty() {
            return 0;
        }
        let closed = sessions
            .iter()
            .filter(|s| s.close(CloseReason::Disconnect))
            .count();
        info!(user_id, closed, "user disconnected");
        self.router.mark_offline(user_id).await;
        closed
    }

    /// Close every connection and mark their users offline.
    pub async fn shutdown(&self) {
        let sessions = self.registry.drain().await;
        info!(count = sessions.len(), "closing all connections");

        let users: BTreeSet<i64> = sessions.iter().filter_map(|s| s.user_id()).collect();
        for session in &sessions {
            session.close(CloseReason::Shutdown);
        }
        for user_id in users {
            self.router.users().set_online(user_id, false).await;
        }
    }

    /// Accept WebSocket connections on `addr` until the listener stops.
    pub async fn serve_websocket(&self, addr: SocketAddr) -> ZmsgResult<()> {
        let (local_addr, mut connections) =
            websocket::start_listener(addr, self.config.max_frame_size).await?;
        info!(
            addr = %local_addr,
            max_connections_per_user = self.registry.max_per_user(),
            max_frame_size = self.config.max_frame_size,
            "accepting chat connections"
        );

        while let Some(conn) = connections.recv().await {
            let remote = conn.remote_addr;
            let conn_id = self.accept_connection(conn).await;
            debug!(conn_id = %conn_id, remote = %remote, "websocket session started");
        }
        Ok(())
    }
}
