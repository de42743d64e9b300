//! Infrastructure layer for the client.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `hpfeeds_core`, but MUST NOT be imported by the `application` layer.
//!
//! - **`network`** – [`ClientSession`](network::ClientSession): the socket,
//!   the handshake and the session state machine.
//! - **`service`** – [`ClientSessionService`](service::ClientSessionService):
//!   builds a session from an endpoint description and manages its lifetime.

pub mod network;
pub mod service;
