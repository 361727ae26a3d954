//! Message router: interprets each decoded envelope for its session.
//!
//! Dispatch is an exhaustive match on [`MsgType`], so adding a message type
//! means adding one arm here and one payload struct in `zmsg-core`.
//!
//! Errors returned from [`Router::dispatch`] are classified by the caller:
//! connection-fatal ones (a payload that does not decode, a server-bound
//! code the client must not send) close the connection, everything else is
//! logged. Operation-level failures are answered with an `Error` or
//! `AuthResponse` envelope and never reach the caller.

use crate::registry::ConnectionRegistry;
use crate::services::{MessageService, NewMessage, UserService};
use crate::session::Session;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zmsg_core::messages::{
    error_codes, AckPayload, AuthPayload, AuthResponsePayload, ChatPayload, PresencePayload,
    PresencePushPayload, SyncRequestPayload, SyncResponsePayload,
};
use zmsg_core::{Envelope, MsgType, PresenceStatus, ZmsgError, ZmsgResult};

/// Default number of messages returned per sync page.
pub const DEFAULT_SYNC_PAGE_SIZE: usize = 100;

pub struct Router<U, M> {
    users: Arc<U>,
    messages: Arc<M>,
    registry: Arc<ConnectionRegistry>,
    sync_page_size: usize,
}

impl<U: UserService, M: MessageService> Router<U, M> {
    pub fn new(
        users: Arc<U>,
        messages: Arc<M>,
        registry: Arc<ConnectionRegistry>,
        sync_page_size: usize,
    ) -> Self {
        Self {
            users,
            messages,
            registry,
            sync_page_size: sync_page_size.max(1),
        }
    }

    pub fn users(&self) -> &Arc<U> {
        &self.users
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Handle one envelope received on `session`.
    pub async fn dispatch(&self, session: &Arc<Session>, envelope: Envelope) -> ZmsgResult<()> {
        debug!(
            conn_id = %session.id(),
            msg_type = ?envelope.msg_type,
            seq = envelope.seq,
            "dispatch"
        );
        match envelope.msg_type {
            MsgType::Auth => self.handle_auth(session, &envelope).await,
            MsgType::Chat => self.handle_chat(session, &envelope).await,
            MsgType::Ack => self.handle_ack(session, &envelope).await,
            MsgType::SyncRequest => self.handle_sync(session, &envelope).await,
            MsgType::Presence => self.handle_presence(session, &envelope).await,
            MsgType::Ping => {
                reply(session, Envelope::empty(MsgType::Pong, envelope.seq));
                Ok(())
            }
            MsgType::AuthResponse
            | MsgType::ChatPush
            | MsgType::SyncResponse
            | MsgType::PresencePush
            | MsgType::Pong
            | MsgType::Error => Err(ZmsgError::MalformedFrame(format!(
                "client sent server-to-client type {:?}",
                envelope.msg_type
            ))),
        }
    }

    async fn handle_auth(&self, session: &Arc<Session>, envelope: &Envelope) -> ZmsgResult<()> {
        let payload: AuthPayload = envelope.payload_as()?;
        let seq = envelope.seq;

        let user_id = match self.users.validate_token(&payload.token).await {
            Ok(uid) => uid,
            Err(e) => {
                info!(conn_id = %session.id(), error = %e, "token rejected");
                return auth_failed(session, seq, error_codes::INVALID_TOKEN);
            }
        };

        let auth = match self.registry.authenticate(session.id(), user_id).await {
            Ok(auth) => auth,
            Err(ZmsgError::TooManyConnections { .. }) => {
                return auth_failed(session, seq, error_codes::TOO_MANY_CONNECTIONS);
            }
            Err(ZmsgError::AlreadyAuthenticated(current)) => {
                info!(conn_id = %session.id(), current, requested = user_id, "re-authentication as another user refused");
                return auth_failed(session, seq, error_codes::ALREADY_AUTHENTICATED);
            }
            Err(e) => return Err(e),
        };

        let response = AuthResponsePayload {
            success: true,
            user_id,
            error: None,
        };
        reply(
            session,
            Envelope::with_payload(MsgType::AuthResponse, seq, &response)?,
        );

        if !auth.repeated {
            self.users.set_online(user_id, true).await;
            if auth.connections == 1 {
                self.announce_presence(user_id, PresenceStatus::Online).await?;
            }
        }
        Ok(())
    }

    async fn handle_chat(&self, session: &Arc<Session>, envelope: &Envelope) -> ZmsgResult<()> {
        let Some(from) = session.user_id() else {
            return reject_unauthenticated(session, envelope.seq);
        };
        let payload: ChatPayload = envelope.payload_as()?;
        let to = payload.to;

        let stored = match self
            .messages
            .send_message(NewMessage {
                from,
                to,
                kind: payload.kind,
                content: payload.content,
            })
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                warn!(conn_id = %session.id(), from, to, error = %e, "send_message failed");
                return reply_error(session, envelope.seq, error_codes::SEND_FAILED);
            }
        };

        let push = Envelope::with_payload(MsgType::ChatPush, 0, &stored.to_push())?;
        match self.registry.broadcast(to, &push).await {
            Ok(delivery) => debug!(
                message_id = stored.id,
                to,
                delivered = delivery.delivered,
                "chat pushed"
            ),
            Err(e) => warn!(message_id = stored.id, to, error = %e, "chat push degraded"),
        }
        Ok(())
    }

    async fn handle_ack(&self, session: &Arc<Session>, envelope: &Envelope) -> ZmsgResult<()> {
        let Some(user_id) = session.user_id() else {
            debug!(conn_id = %session.id(), "ack ignored: not authenticated");
            return Ok(());
        };
        let payload: AckPayload = envelope.payload_as()?;

        self.messages
            .update_message_status(payload.message_id, payload.status)
            .await
            .map_err(|e| {
                ZmsgError::Upstream(format!(
                    "user {user_id}: mark message {} {}: {e}",
                    payload.message_id, payload.status
                ))
            })
    }

    async fn handle_sync(&self, session: &Arc<Session>, envelope: &Envelope) -> ZmsgResult<()> {
        let Some(user_id) = session.user_id() else {
            return reject_unauthenticated(session, envelope.seq);
        };
        let payload: SyncRequestPayload = envelope.payload_as()?;

        let messages = match self
            .messages
            .get_messages_after(user_id, payload.last_message_id, self.sync_page_size)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!(conn_id = %session.id(), user_id, error = %e, "get_messages_after failed");
                return reply_error(session, envelope.seq, error_codes::SYNC_FAILED);
            }
        };

        let response = SyncResponsePayload {
            has_more: messages.len() >= self.sync_page_size,
            messages: messages.iter().map(|m| m.to_push()).collect(),
        };
        debug!(
            user_id,
            after = payload.last_message_id,
            count = response.messages.len(),
            has_more = response.has_more,
            "sync page"
        );
        reply(
            session,
            Envelope::with_payload(MsgType::SyncResponse, envelope.seq, &response)?,
        );
        Ok(())
    }

    async fn handle_presence(&self, session: &Arc<Session>, envelope: &Envelope) -> ZmsgResult<()> {
        let Some(user_id) = session.user_id() else {
            return Ok(());
        };
        let payload: PresencePayload = envelope.payload_as()?;

        self.users
            .set_online(user_id, payload.status == PresenceStatus::Online)
            .await;
        self.announce_presence(user_id, payload.status).await
    }

    /// Drop a finished session from the registry. When it was the user's last
    /// connection the user goes offline and the others are told.
    pub async fn session_closed(&self, session: &Session) {
        let Some(removed) = self.registry.unregister(session.id()).await else {
            return;
        };
        if !removed.user_went_offline {
            return;
        }
        if let Some(user_id) = session.user_id() {
            self.mark_offline(user_id).await;
        }
    }

    /// Mark `user_id` offline and tell the others, unless a new session for
    /// the user authenticated in the meantime.
    pub(crate) async fn mark_offline(&self, user_id: i64) {
        if self.registry.is_online(user_id).await {
            debug!(user_id, "user came back online, offline transition skipped");
            return;
        }
        self.users.set_online(user_id, false).await;
        if let Err(e) = self.announce_presence(user_id, PresenceStatus::Offline).await {
            warn!(user_id, error = %e, "offline announcement failed");
        }
    }

    /// Push `user_id`'s presence to every other online user.
    pub async fn announce_presence(&self, user_id: i64, status: PresenceStatus) -> ZmsgResult<()> {
        let push = Envelope::with_payload(
            MsgType::PresencePush,
            0,
            &PresencePushPayload { user_id, status },
        )?;
        for uid in self.registry.online_users().await {
            if uid == user_id {
                continue;
            }
            if let Err(e) = self.registry.broadcast(uid, &push).await {
                debug!(user_id, to = uid, error = %e, "presence push dropped");
            }
        }
        Ok(())
    }
}

/// Queue a reply to the originating session. A full queue only costs this reply.
fn reply(session: &Session, envelope: Envelope) {
    if let Err(e) = session.send_envelope(&envelope) {
        warn!(
            conn_id = %session.id(),
            msg_type = ?envelope.msg_type,
            error = %e,
            "reply dropped"
        );
    }
}

fn reply_error(session: &Session, seq: i64, code: &str) -> ZmsgResult<()> {
    reply(session, Envelope::error(seq, code, "")?);
    Ok(())
}

fn reject_unauthenticated(session: &Session, seq: i64) -> ZmsgResult<()> {
    let err = ZmsgError::NotAuthenticated;
    reply(
        session,
        Envelope::error(seq, error_codes::NOT_AUTHENTICATED, err.to_string())?,
    );
    Ok(())
}

fn auth_failed(session: &Session, seq: i64, code: &str) -> ZmsgResult<()> {
    let response = AuthResponsePayload {
        success: false,
        user_id: 0,
        error: Some(code.to_string()),
    };
    reply(
        session,
        Envelope::with_payload(MsgType::AuthResponse, seq, &response)?,
    );
    Ok(())
}
