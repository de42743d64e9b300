//! All hpfeeds frame types.
//!
//! Every frame on the wire is a length-prefixed record:
//!
//! ```text
//! [length:4][opcode:1][payload:length-5]
//! ```
//!
//! `length` is a big-endian `u32` and counts the *whole* frame, including the
//! four length bytes themselves.  Strings inside payloads (identifiers,
//! channel names, the server name) are carried as a one-byte length followed
//! by that many UTF-8 bytes, so no individual string can exceed 255 bytes.

use bytes::Bytes;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Size of the big-endian length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the fixed frame header (length prefix + opcode byte).
pub const HEADER_SIZE: usize = LENGTH_PREFIX_SIZE + 1;

/// Default upper bound on a single frame, in bytes (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length of the SHA-1 digest carried in an AUTH frame.
pub const DIGEST_LEN: usize = 20;

/// Longest string that fits behind a one-byte length prefix.
pub const MAX_SHORT_STRING_LEN: usize = u8::MAX as usize;

// ── Opcodes ───────────────────────────────────────────────────────────────────

/// Opcode byte that follows the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Error = 0,
    Info = 1,
    Auth = 2,
    Publish = 3,
    Subscribe = 4,
    Unsubscribe = 5,
}

impl TryFrom<u8> for Opcode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(Opcode::Error),
            1 => Ok(Opcode::Info),
            2 => Ok(Opcode::Auth),
            3 => Ok(Opcode::Publish),
            4 => Ok(Opcode::Subscribe),
            5 => Ok(Opcode::Unsubscribe),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Opcode::Error => "ERROR",
            Opcode::Info => "INFO",
            Opcode::Auth => "AUTH",
            Opcode::Publish => "PUBLISH",
            Opcode::Subscribe => "SUBSCRIBE",
            Opcode::Unsubscribe => "UNSUBSCRIBE",
        };
        f.write_str(name)
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// One decoded protocol frame.
///
/// Frames are plain values: they are produced by the decoder, inspected by a
/// state machine and then dropped.  Binary fields use [`Bytes`] so that a
/// published payload can be shared between many subscribers without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// ERROR (0): human-readable failure description.
    Error { message: String },
    /// INFO (1): sent by the broker on accept; carries the server name and
    /// the per-connection nonce the client must sign.
    Info { name: String, nonce: Bytes },
    /// AUTH (2): identifier plus `SHA1(nonce || secret)`.
    Auth {
        ident: String,
        digest: [u8; DIGEST_LEN],
    },
    /// PUBLISH (3): an event on `channel` originating from `ident`.
    Publish {
        ident: String,
        channel: String,
        payload: Bytes,
    },
    /// SUBSCRIBE (4)
    Subscribe { ident: String, channel: String },
    /// UNSUBSCRIBE (5)
    Unsubscribe { ident: String, channel: String },
}

impl Frame {
    /// Returns the opcode this frame is encoded with.
    pub fn opcode(&self) -> Opcode {
        match self {
            Frame::Error { .. } => Opcode::Error,
            Frame::Info { .. } => Opcode::Info,
            Frame::Auth { .. } => Opcode::Auth,
            Frame::Publish { .. } => Opcode::Publish,
            Frame::Subscribe { .. } => Opcode::Subscribe,
            Frame::Unsubscribe { .. } => Opcode::Unsubscribe,
        }
    }

    /// Total number of bytes this frame occupies on the wire, header included.
    pub fn encoded_len(&self) -> usize {
        let payload = match self {
            Frame::Error { message } => message.len(),
            Frame::Info { name, nonce } => 1 + name.len() + nonce.len(),
            Frame::Auth { ident, .. } => 1 + ident.len() + DIGEST_LEN,
            Frame::Publish {
                ident,
                channel,
                payload,
            } => 1 + ident.len() + 1 + channel.len() + payload.len(),
            Frame::Subscribe { ident, channel } | Frame::Unsubscribe { ident, channel } => {
                1 + ident.len() + channel.len()
            }
        };
        HEADER_SIZE + payload
    }

    /// Convenience constructor for an ERROR frame.
    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            message: message.into(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
