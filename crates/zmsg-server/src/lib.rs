//! zmsg-server: real-time transport for the zmsg chat service.
//!
//! Accepts client connections, authenticates them with bearer tokens,
//! routes chat, acknowledgement, sync and presence envelopes, and pushes
//! events to every live connection of a user.

pub mod config;
pub mod connection;
pub mod hub;
pub mod registry;
pub mod router;
pub mod services;
pub mod session;
pub mod transport;

pub use hub::{ChatHub, HubConfig, PushEvent};
pub use registry::{ConnectionRegistry, Delivery};
pub use router::Router;
pub use session::{CloseReason, ConnId, Session, SessionState};
