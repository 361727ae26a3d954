//! Collaborator interfaces consumed by the router.
//!
//! Persistence and account management live outside the transport core; the
//! router only sees these two narrow traits. [`memory`] provides in-process
//! implementations used by the binary.

pub mod memory;

pub use memory::{InMemoryMessageStore, TokenUserService};

use std::future::Future;
use zmsg_core::messages::ChatPushPayload;
use zmsg_core::{MessageStatus, ZmsgResult};

/// A message as stored by the message service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    /// text, voice or image
    pub kind: String,
    pub content: String,
    pub status: MessageStatus,
    /// Unix seconds.
    pub created_at: i64,
}

impl StoredMessage {
    /// Wire form used by ChatPush and SyncResponse.
    pub fn to_push(&self) -> ChatPushPayload {
        ChatPushPayload {
            message_id: self.id,
            from: self.sender_id,
            to: self.receiver_id,
            kind: self.kind.clone(),
            content: self.content.clone(),
            created_at: self.created_at,
        }
    }
}

/// A message to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub from: i64,
    pub to: i64,
    pub kind: String,
    pub content: String,
}

/// Account side: token verification and the online-status cache.
pub trait UserService: Send + Sync + 'static {
    /// Resolve a bearer token to a user id.
    fn validate_token(&self, token: &str) -> impl Future<Output = ZmsgResult<i64>> + Send;

    /// Update the cached online flag for a user.
    fn set_online(&self, user_id: i64, online: bool) -> impl Future<Output = ()> + Send;

    /// Read the cached online flag. Not used for routing decisions.
    fn is_online(&self, user_id: i64) -> impl Future<Output = bool> + Send;
}

/// Message persistence.
pub trait MessageService: Send + Sync + 'static {
    fn send_message(&self, message: NewMessage)
        -> impl Future<Output = ZmsgResult<StoredMessage>> + Send;

    fn update_message_status(
        &self,
        message_id: i64,
        status: MessageStatus,
    ) -> impl Future<Output = ZmsgResult<()>> + Send;

    /// Messages received by `user_id` with id greater than `last_id`, oldest
    /// first, at most `limit`.
    fn get_messages_after(
        &self,
        user_id: i64,
        last_id: i64,
        limit: usize,
    ) -> impl Future<Output = ZmsgResult<Vec<StoredMessage>>> + Send;
}
