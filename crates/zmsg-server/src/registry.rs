//! Process-wide connection registry.
//!
//! Indexes live sessions by connection id and by user id. Both maps live
//! behind one reader/writer lock so a connection can never be visible in one
//! and missing from the other. No I/O happens while the lock is held:
//! envelopes are encoded before locking and `Session::send` is a non-blocking
//! queue push.

use crate::session::{ConnId, Session};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zmsg_core::{encode_envelope, Envelope, ZmsgError, ZmsgResult};

/// Default cap on simultaneous authenticated connections per user.
pub const DEFAULT_MAX_CONNECTIONS_PER_USER: usize = 3;

#[derive(Default)]
struct RegistryState {
    /// conn id → session. The registry owns every session it tracks.
    connections: HashMap<ConnId, Arc<Session>>,
    /// user id → conn ids. Derived index over `connections`.
    by_user: HashMap<i64, HashSet<ConnId>>,
}

impl RegistryState {
    fn sessions_of(&self, user_id: i64) -> Vec<Arc<Session>> {
        self.by_user
            .get(&user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.connections.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove `id` from both maps. Returns the session and whether its user
    /// has no connections left.
    fn remove(&mut self, id: &str) -> Option<Removed> {
        let session = self.connections.remove(id)?;
        let mut user_went_offline = false;
        if let Some(uid) = session.user_id() {
            if let Some(ids) = self.by_user.get_mut(&uid) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_user.remove(&uid);
                    user_went_offline = true;
                }
            }
        }
        Some(Removed {
            session,
            user_went_offline,
        })
    }
}

/// A session taken out of the registry.
#[derive(Debug)]
pub struct Removed {
    pub session: Arc<Session>,
    /// The session belonged to a user who now has no live connection.
    pub user_went_offline: bool,
}

/// Result of a successful `authenticate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authenticated {
    pub user_id: i64,
    /// Live connections of the user, this one included.
    pub connections: usize,
    /// Set when the session was already bound to this same user.
    pub repeated: bool,
}

/// Outcome of a fan-out to all of one user's sessions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Delivery {
    /// Sessions the frame was queued to.
    pub delivered: usize,
    /// Sessions whose queue was full or already closed.
    pub dropped: Vec<ConnId>,
}

impl Delivery {
    pub fn is_complete(&self) -> bool {
        self.dropped.is_empty()
    }
}

/// Registry of all live sessions.
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
    max_per_user: usize,
}

impl ConnectionRegistry {
    /// Create an empty registry enforcing `max_per_user` authenticated
    /// connections per user.
    pub fn new(max_per_user: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            max_per_user: max_per_user.max(1),
        }
    }

    pub fn max_per_user(&self) -> usize {
        self.max_per_user
    }

    /// Track a freshly accepted, unauthenticated session.
    pub async fn register(&self, session: Arc<Session>) {
        let mut state = self.state.write().await;
        debug!(conn_id = %session.id(), "connection registered");
        state.connections.insert(session.id().to_string(), session);
    }

    /// Bind connection `id` to `user_id`.
    ///
    /// The cap check and the insert into the per-user index happen under a
    /// single write lock, so concurrent logins cannot push a user past the cap.
    /// Authenticating again as the same user is a no-op; as a different user
    /// it fails with `AlreadyAuthenticated`.
    pub async fn authenticate(&self, id: &str, user_id: i64) -> ZmsgResult<Authenticated> {
        let mut state = self.state.write().await;
        let session = state
            .connections
            .get(id)
            .cloned()
            .ok_or_else(|| ZmsgError::SessionNotFound(id.to_string()))?;

        match session.user_id() {
            Some(current) if current == user_id => {
                let connections = state.by_user.get(&user_id).map_or(0, HashSet::len);
                return Ok(Authenticated {
                    user_id,
                    connections,
                    repeated: true,
                });
            }
            Some(current) => return Err(ZmsgError::AlreadyAuthenticated(current)),
            None => {}
        }

        let live = state.by_user.get(&user_id).map_or(0, HashSet::len);
        if live >= self.max_per_user {
            warn!(conn_id = %id, user_id, live, "connection cap reached");
            return Err(ZmsgError::TooManyConnections {
                user_id,
                limit: self.max_per_user,
            });
        }

        session.bind_user(user_id)?;
        let ids = state.by_user.entry(user_id).or_default();
        ids.insert(id.to_string());
        let connections = ids.len();

        info!(conn_id = %id, user_id, connections, "connection authenticated");
        Ok(Authenticated {
            user_id,
            connections,
            repeated: false,
        })
    }

    /// Look up a session by connection id.
    pub async fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.state.read().await.connections.get(id).cloned()
    }

    /// Any one of the user's live sessions.
    pub async fn get(&self, user_id: i64) -> Option<Arc<Session>> {
        let state = self.state.read().await;
        state
            .by_user
            .get(&user_id)
            .and_then(|ids| ids.iter().next())
            .and_then(|id| state.connections.get(id).cloned())
    }

    /// Every live session of the user.
    pub async fn get_all(&self, user_id: i64) -> Vec<Arc<Session>> {
        self.state.read().await.sessions_of(user_id)
    }

    /// Queue `envelope` to every live session of `user_id`.
    ///
    /// An offline user is not an error: nothing is queued and the delivery is
    /// empty. If some sessions cannot take the frame the others still get it;
    /// the caller learns about the dropped ones from `QueueFull`.
    pub async fn broadcast(&self, user_id: i64, envelope: &Envelope) -> ZmsgResult<Delivery> {
        let frame = encode_envelope(envelope)?;
        let sessions = self.get_all(user_id).await;
        let delivery = fan_out(&sessions, &frame);

        if !delivery.is_complete() {
            warn!(
                user_id,
                msg_type = ?envelope.msg_type,
                delivered = delivery.delivered,
                dropped = delivery.dropped.len(),
                "broadcast partially dropped"
            );
            return Err(ZmsgError::QueueFull(format!(
                "user {user_id}: {} of {} connections dropped the frame",
                delivery.dropped.len(),
                sessions.len()
            )));
        }
        Ok(delivery)
    }

    /// Whether the user has at least one authenticated connection.
    pub async fn is_online(&self, user_id: i64) -> bool {
        self.state
            .read()
            .await
            .by_user
            .get(&user_id)
            .is_some_and(|ids| !ids.is_empty())
    }

    /// All users with at least one authenticated connection.
    pub async fn online_users(&self) -> Vec<i64> {
        let state = self.state.read().await;
        let mut users: Vec<i64> = state
            .by_user
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(uid, _)| *uid)
            .collect();
        users.sort_unstable();
        users
    }

    /// Remove one connection from both maps. Idempotent.
    pub async fn unregister(&self, id: &str) -> Option<Removed> {
        let removed = self.state.write().await.remove(id);
        if let Some(ref r) = removed {
            debug!(
                conn_id = %id,
                user_id = r.session.user_id().unwrap_or(0),
                offline = r.user_went_offline,
                "connection unregistered"
            );
        }
        removed
    }

    /// Remove every connection of a user. Idempotent.
    pub async fn unregister_user(&self, user_id: i64) -> Vec<Arc<Session>> {
        let mut state = self.state.write().await;
        let ids: Vec<ConnId> = state
            .by_user
            .remove(&user_id)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default();
        let sessions: Vec<Arc<Session>> = ids
            .iter()
            .filter_map(|id| state.connections.remove(id))
            .collect();
        if !sessions.is_empty() {
            debug!(user_id, count = sessions.len(), "user unregistered");
        }
        sessions
    }

    /// Remove and return every tracked session.
    pub async fn drain(&self) -> Vec<Arc<Session>> {
        let mut state = self.state.write().await;
        state.by_user.clear();
        state.connections.drain().map(|(_, s)| s).collect()
    }

    /// Number of tracked connections, authenticated or not.
    pub async fn count(&self) -> usize {
        self.state.read().await.connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS_PER_USER)
    }
}

/// Push one encoded frame to each session without stopping at failures.
fn fan_out(sessions: &[Arc<Session>], frame: &[u8]) -> Delivery {
    let mut delivery = Delivery::default();
    for session in sessions {
        match session.send(frame.to_vec()) {
            Ok(()) => delivery.delivered += 1,
            Err(e) => {
                debug!(conn_id = %session.id(), error = %e, "frame dropped");
                delivery.dropped.push(session.id().to_string());
            }
        }
    }
    delivery
}
