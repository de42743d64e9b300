//! Protocol module containing frame types, the binary codec and the
//! authentication handshake primitives.

pub mod codec;
pub mod frame;
pub mod handshake;

pub use codec::{
    decode_frame, encode_frame, encode_frame_into, CodecError, EncodeError, FrameCodec,
    ProtocolError,
};
pub use frame::*;
pub use handshake::{compute_digest, generate_nonce, verify_digest, AuthDigest, NONCE_LEN};
