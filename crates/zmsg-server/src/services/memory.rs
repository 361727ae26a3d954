//! In-process collaborator implementations.

use super::{MessageService, NewMessage, StoredMessage, UserService};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::debug;
use zmsg_core::{create_token, verify_token, MessageStatus, ZmsgError, ZmsgResult};

/// Message kinds accepted by [`InMemoryMessageStore`].
pub const MESSAGE_KINDS: &[&str] = &["text", "voice", "image"];

/// Validates HMAC bearer tokens and caches online flags.
pub struct TokenUserService {
    secret: Vec<u8>,
    token_ttl: u64,
    online: RwLock<HashMap<i64, bool>>,
}

impl TokenUserService {
    pub fn new(secret: Vec<u8>, token_ttl: u64) -> Self {
        Self {
            secret,
            token_ttl,
            online: RwLock::new(HashMap::new()),
        }
    }

    /// Issue a token for `user_id` signed with this service's secret.
    pub fn issue_token(&self, user_id: i64) -> ZmsgResult<String> {
        create_token(&self.secret, user_id, self.token_ttl)
    }
}

impl UserService for TokenUserService {
    async fn validate_token(&self, token: &str) -> ZmsgResult<i64> {
        verify_token(&self.secret, token)
    }

    async fn set_online(&self, user_id: i64, online: bool) {
        self.online.write().await.insert(user_id, online);
    }

    async fn is_online(&self, user_id: i64) -> bool {
        self.online
            .read()
            .await
            .get(&user_id)
            .copied()
            .unwrap_or(false)
    }
}

/// Volatile message store. Everything is lost on restart.
pub struct InMemoryMessageStore {
    messages: RwLock<Vec<StoredMessage>>,
    next_id: AtomicI64,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl MessageService for InMemoryMessageStore {
    async fn send_message(&self, message: NewMessage) -> ZmsgResult<StoredMessage> {
        if !MESSAGE_KINDS.contains(&message.kind.as_str()) {
            return Err(ZmsgError::Upstream(format!(
                "invalid message type: {}",
                message.kind
            )));
        }
        if message.content.is_empty() {
            return Err(ZmsgError::Upstream("invalid message content".into()));
        }
        if message.from == message.to {
            return Err(ZmsgError::Upstream("cannot send message to yourself".into()));
        }

        let mut messages = self.messages.write().await;
        let stored = StoredMessage {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            sender_id: message.from,
            receiver_id: message.to,
            kind: message.kind,
            content: message.content,
            status: MessageStatus::Sent,
            created_at: unix_now(),
        };
        debug!(message_id = stored.id, from = stored.sender_id, to = stored.receiver_id, "message stored");
        messages.push(stored.clone());
        Ok(stored)
    }

    async fn update_message_status(&self, message_id: i64, status: MessageStatus) -> ZmsgResult<()> {
        let mut messages = self.messages.write().await;
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| ZmsgError::Upstream(format!("message not found: {message_id}")))?;
        message.status = status;
        Ok(())
    }

    async fn get_messages_after(
        &self,
        user_id: i64,
        last_id: i64,
        limit: usize,
    ) -> ZmsgResult<Vec<StoredMessage>> {
        let messages = self.messages.read().await;
        // Ids are assigned in push order, so the vector is already sorted.
        Ok(messages
            .iter()
            .filter(|m| m.receiver_id == user_id && m.id > last_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
