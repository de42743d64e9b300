//! # hpfeeds-core
//!
//! Shared library for the hpfeeds broker and client containing the wire
//! protocol: frame types, the streaming binary codec and the
//! challenge-response handshake helpers.
//!
//! This crate is used by both the broker and the client applications.
//! It performs no network I/O of its own; sockets live in the crates that
//! depend on it.
//!
//! # Architecture overview
//!
//! hpfeeds is a small publish/subscribe protocol.  A central *broker* accepts
//! TCP connections from *clients*.  Each client authenticates with an
//! identifier and a shared secret, then publishes events to named
//! *channels* and/or subscribes to them.  The broker forwards every publish to
//! the current subscribers of its channel, subject to per-identity access
//! lists.
//!
//! - **`protocol::frame`** – The six frame types (`ERROR`, `INFO`, `AUTH`,
//!   `PUBLISH`, `SUBSCRIBE`, `UNSUBSCRIBE`) and the wire constants.
//!
//! - **`protocol::codec`** – Length-prefixed binary encoding and a
//!   `tokio_util` codec that tolerates partial reads.
//!
//! - **`protocol::handshake`** – Nonce generation and the
//!   `SHA1(nonce || secret)` digest both sides compute.

pub mod protocol;

pub use protocol::codec::{decode_frame, encode_frame, CodecError, FrameCodec, ProtocolError};
pub use protocol::frame::{Frame, Opcode, DEFAULT_MAX_FRAME_SIZE};
