//! Binary codec for encoding and decoding hpfeeds frames.
//!
//! Wire format:
//! ```text
//! [length:4][opcode:1][payload:N]      length = 5 + N, big-endian
//! ```
//!
//! Two layers live here:
//!
//! - [`encode_frame`] / [`decode_frame`] work on plain byte slices.  They are
//!   pure functions and know nothing about sockets.
//! - [`FrameCodec`] plugs those functions into `tokio_util::codec` so that a
//!   `FramedRead` can pull frames out of a TCP stream.  TCP may hand us half a
//!   frame, or three and a half frames, in a single read; the decoder keeps
//!   the leftovers in its buffer and resumes on the next call.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::protocol::frame::{
    Frame, Opcode, DEFAULT_MAX_FRAME_SIZE, DIGEST_LEN, HEADER_SIZE, LENGTH_PREFIX_SIZE,
    MAX_SHORT_STRING_LEN,
};

/// Errors that can occur while decoding bytes received from a peer.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the frame it starts.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The opcode byte is not one of the six defined opcodes.
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u8),

    /// The length prefix announces a frame larger than the configured maximum.
    #[error("frame of {declared} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { declared: usize, max: usize },

    /// The length prefix is smaller than the fixed header.
    #[error("frame length {0} is shorter than the 5-byte header")]
    FrameTooShort(usize),

    /// The payload could not be parsed (truncated field, bad UTF-8, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Errors that can occur while encoding a frame.
#[derive(Debug, Error, PartialEq)]
pub enum EncodeError {
    /// A string field does not fit behind a one-byte length prefix.
    #[error("{field} is {len} bytes long; at most 255 bytes fit in a frame")]
    FieldTooLong { field: &'static str, len: usize },
}

/// Error type of the streaming [`FrameCodec`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Frame`] into a fresh buffer, length prefix included.
///
/// # Errors
///
/// Returns [`EncodeError::FieldTooLong`] if an identifier, channel or server
/// name is longer than 255 bytes.
///
/// # Examples
///
/// ```rust
/// use hpfeeds_core::protocol::{decode_frame, encode_frame, Frame, DEFAULT_MAX_FRAME_SIZE};
///
/// let frame = Frame::Subscribe { ident: "test".into(), channel: "test-chan".into() };
/// let bytes = encode_frame(&frame).unwrap();
/// let (decoded, consumed) = decode_frame(&bytes, DEFAULT_MAX_FRAME_SIZE).unwrap();
/// assert_eq!(decoded, frame);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(frame: &Frame) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::with_capacity(frame.encoded_len());
    encode_frame_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Appends the encoding of `frame` to `dst`.
///
/// Nothing is written when an error is returned.
///
/// # Errors
///
/// See [`encode_frame`].
pub fn encode_frame_into(frame: &Frame, dst: &mut BytesMut) -> Result<(), EncodeError> {
    validate_fields(frame)?;

    let total = frame.encoded_len();
    dst.reserve(total);
    dst.put_u32(total as u32);
    dst.put_u8(frame.opcode() as u8);

    match frame {
        Frame::Error { message } => dst.put_slice(message.as_bytes()),
        Frame::Info { name, nonce } => {
            write_short_string(dst, name);
            dst.put_slice(nonce);
        }
        Frame::Auth { ident, digest } => {
            write_short_string(dst, ident);
            dst.put_slice(digest);
        }
        Frame::Publish {
            ident,
            channel,
            payload,
        } => {
            write_short_string(dst, ident);
            write_short_string(dst, channel);
            dst.put_slice(payload);
        }
        Frame::Subscribe { ident, channel } | Frame::Unsubscribe { ident, channel } => {
            write_short_string(dst, ident);
            dst.put_slice(channel.as_bytes());
        }
    }
    Ok(())
}

/// Decodes one [`Frame`] from the beginning of `bytes`.
///
/// Returns the frame and the number of bytes it occupied so the caller can
/// advance its read cursor.  An oversize frame is reported as soon as the
/// four length bytes are available, without waiting for the body.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] when `bytes` holds only part of
/// a frame; any other variant means the stream is corrupt.
pub fn decode_frame(bytes: &[u8], max_frame_size: usize) -> Result<(Frame, usize), ProtocolError> {
    if bytes.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: LENGTH_PREFIX_SIZE,
            available: bytes.len(),
        });
    }

    let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if declared > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            declared,
            max: max_frame_size,
        });
    }
    if declared < HEADER_SIZE {
        return Err(ProtocolError::FrameTooShort(declared));
    }
    if bytes.len() < declared {
        return Err(ProtocolError::InsufficientData {
            needed: declared,
            available: bytes.len(),
        });
    }

    let opcode_byte = bytes[LENGTH_PREFIX_SIZE];
    let opcode =
        Opcode::try_from(opcode_byte).map_err(|_| ProtocolError::UnknownOpcode(opcode_byte))?;

    let frame = decode_payload(opcode, &bytes[HEADER_SIZE..declared])?;
    Ok((frame, declared))
}

// ── Streaming codec ───────────────────────────────────────────────────────────

/// `tokio_util` codec that turns a byte stream into [`Frame`]s and back.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Creates a codec that rejects frames longer than `max_frame_size` bytes.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        match decode_frame(&src[..], self.max_frame_size) {
            Ok((frame, consumed)) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            Err(ProtocolError::InsufficientData { needed, available }) => {
                // Make room for the rest of the frame so the next read can
                // land it in one go.
                src.reserve(needed.saturating_sub(available));
                Ok(None)
            }
            Err(e) => {
                trace!("rejecting inbound frame: {e}");
                Err(e.into())
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let len = frame.encoded_len();
        if len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                declared: len,
                max: self.max_frame_size,
            }
            .into());
        }
        encode_frame_into(&frame, dst)?;
        Ok(())
    }
}

// ── Payload decoding ──────────────────────────────────────────────────────────

fn decode_payload(opcode: Opcode, payload: &[u8]) -> Result<Frame, ProtocolError> {
    match opcode {
        Opcode::Error => Ok(Frame::Error {
            message: String::from_utf8_lossy(payload).into_owned(),
        }),
        Opcode::Info => {
            let (name, offset) = read_short_string(payload, 0, "INFO server name")?;
            Ok(Frame::Info {
                name,
                nonce: Bytes::copy_from_slice(&payload[offset..]),
            })
        }
        Opcode::Auth => decode_auth(payload),
        Opcode::Publish => {
            let (ident, offset) = read_short_string(payload, 0, "PUBLISH identifier")?;
            let (channel, offset) = read_short_string(payload, offset, "PUBLISH channel")?;
            Ok(Frame::Publish {
                ident,
                channel,
                payload: Bytes::copy_from_slice(&payload[offset..]),
            })
        }
        Opcode::Subscribe => {
            let (ident, channel) = decode_ident_and_channel(payload, "SUBSCRIBE")?;
            Ok(Frame::Subscribe { ident, channel })
        }
        Opcode::Unsubscribe => {
            let (ident, channel) = decode_ident_and_channel(payload, "UNSUBSCRIBE")?;
            Ok(Frame::Unsubscribe { ident, channel })
        }
    }
}

fn decode_auth(p: &[u8]) -> Result<Frame, ProtocolError> {
    let (ident, offset) = read_short_string(p, 0, "AUTH identifier")?;
    let rest = &p[offset..];
    let digest: [u8; DIGEST_LEN] = rest.try_into().map_err(|_| {
        ProtocolError::MalformedPayload(format!(
            "AUTH digest must be {DIGEST_LEN} bytes, got {}",
            rest.len()
        ))
    })?;
    Ok(Frame::Auth { ident, digest })
}

fn decode_ident_and_channel(p: &[u8], context: &str) -> Result<(String, String), ProtocolError> {
    let (ident, offset) = read_short_string(p, 0, context)?;
    let channel = utf8(&p[offset..], context)?;
    Ok((ident, channel))
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn validate_fields(frame: &Frame) -> Result<(), EncodeError> {
    match frame {
        Frame::Error { .. } => Ok(()),
        Frame::Info { name, .. } => check_short_string("server name", name),
        Frame::Auth { ident, .. }
        | Frame::Subscribe { ident, .. }
        | Frame::Unsubscribe { ident, .. } => check_short_string("identifier", ident),
        Frame::Publish { ident, channel, .. } => {
            check_short_string("identifier", ident)?;
            check_short_string("channel", channel)
        }
    }
}

fn check_short_string(field: &'static str, s: &str) -> Result<(), EncodeError> {
    if s.len() > MAX_SHORT_STRING_LEN {
        Err(EncodeError::FieldTooLong {
            field,
            len: s.len(),
        })
    } else {
        Ok(())
    }
}

/// Writes a 1-byte length prefix followed by the UTF-8 string bytes.
/// Callers must have run [`validate_fields`] first.
fn write_short_string(buf: &mut BytesMut, s: &str) {
    buf.put_u8(s.len() as u8);
    buf.put_slice(s.as_bytes());
}

/// Reads a 1-byte length prefix and then that many UTF-8 bytes.
/// Returns the string and the offset of the byte after it.
fn read_short_string(
    buf: &[u8],
    offset: usize,
    context: &str,
) -> Result<(String, usize), ProtocolError> {
    let Some(&len) = buf.get(offset) else {
        return Err(ProtocolError::MalformedPayload(format!(
            "{context}: missing length byte at offset {offset}"
        )));
    };
    let start = offset + 1;
    let end = start + len as usize;
    if buf.len() < end {
        return Err(ProtocolError::MalformedPayload(format!(
            "{context}: string of length {len} at offset {start} exceeds payload of {} bytes",
            buf.len()
        )));
    }
    Ok((utf8(&buf[start..end], context)?, end))
}

fn utf8(bytes: &[u8], context: &str) -> Result<String, ProtocolError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| ProtocolError::MalformedPayload(format!("{context}: invalid UTF-8: {e}")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
