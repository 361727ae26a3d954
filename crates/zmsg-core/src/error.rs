use thiserror::Error;

/// Errors produced by the zmsg protocol and transport layers.
#[derive(Debug, Error)]
pub enum ZmsgError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("user {user_id} already has {limit} live connections")]
    TooManyConnections { user_id: i64, limit: usize },

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("connection already authenticated as user {0}")]
    AlreadyAuthenticated(i64),

    #[error("outbound queue full: {0}")]
    QueueFull(String),

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("liveness timeout")]
    LivenessTimeout,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ZmsgError {
    /// Whether this error must tear down the connection it occurred on.
    ///
    /// Everything else is answered with an error reply (or logged) and the
    /// connection stays open.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            ZmsgError::MalformedFrame(_)
                | ZmsgError::LivenessTimeout
                | ZmsgError::Closed
                | ZmsgError::Transport(_)
                | ZmsgError::Io(_)
        )
    }
}

impl From<ciborium::de::Error<std::io::Error>> for ZmsgError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        ZmsgError::MalformedFrame(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for ZmsgError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        ZmsgError::Codec(e.to_string())
    }
}

pub type ZmsgResult<T> = Result<T, ZmsgError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(ZmsgError::MalformedFrame("x".into()).is_connection_fatal());
        assert!(ZmsgError::LivenessTimeout.is_connection_fatal());
        assert!(!ZmsgError::NotAuthenticated.is_connection_fatal());
        assert!(!ZmsgError::QueueFull("conn_1".into()).is_connection_fatal());
        assert!(!ZmsgError::Upstream("db down".into()).is_connection_fatal());
        assert!(!ZmsgError::TooManyConnections { user_id: 1, limit: 3 }.is_connection_fatal());
    }
}
