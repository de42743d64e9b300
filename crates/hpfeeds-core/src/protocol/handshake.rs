//! Challenge-response primitives for the hpfeeds authentication handshake.
//!
//! # How the handshake works
//!
//! ```text
//! Broker                                   Client
//! ──────                                   ──────
//! nonce = 4 random bytes
//! INFO(server_name, nonce)  ─────────────►
//!                                          digest = SHA1(nonce || secret)
//!                           ◄───────────── AUTH(ident, digest)
//! look up ident, recompute digest,
//! compare in constant time
//! ```
//!
//! The secret itself never crosses the wire.  Because the nonce is fresh for
//! every connection, a captured AUTH frame cannot be replayed on another one.

use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest as _, Sha1};
use subtle::ConstantTimeEq;

use crate::protocol::frame::DIGEST_LEN;

/// Number of random bytes the broker puts in each INFO frame.
pub const NONCE_LEN: usize = 4;

/// A SHA-1 authentication digest.
pub type AuthDigest = [u8; DIGEST_LEN];

/// Draws a fresh nonce from the operating system CSPRNG.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Computes `SHA1(nonce || secret)`.
///
/// # Examples
///
/// ```rust
/// use hpfeeds_core::protocol::handshake::{compute_digest, verify_digest};
///
/// let digest = compute_digest(b"\x01\x02\x03\x04", b"secret");
/// assert!(verify_digest(b"\x01\x02\x03\x04", b"secret", &digest));
/// ```
pub fn compute_digest(nonce: &[u8], secret: &[u8]) -> AuthDigest {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(secret);
    hasher.finalize().into()
}

/// Returns `true` when `presented` equals `SHA1(nonce || secret)`.
///
/// The comparison runs in constant time.
pub fn verify_digest(nonce: &[u8], secret: &[u8], presented: &[u8]) -> bool {
    let expected = compute_digest(nonce, secret);
    expected[..].ct_eq(presented).into()
}
