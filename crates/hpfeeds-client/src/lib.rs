//! hpfeeds-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! A client connects to a broker, waits for its INFO frame, authenticates
//! with `SHA1(nonce || secret)` and then subscribes, unsubscribes and
//! publishes on named channels.  Publishes from other clients on subscribed
//! channels come back through [`ClientSession::read`].

/// Application layer: the pre-ready operation queue.
pub mod application;

/// Infrastructure layer: socket session and session service.
pub mod infrastructure;

pub use infrastructure::network::{
    ClientSession, CloseReason, Message, SessionConfig, SessionError, SessionState,
};
pub use infrastructure::service::{parse_endpoint, ClientSessionService, Endpoint};
