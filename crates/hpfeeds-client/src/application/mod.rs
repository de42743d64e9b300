//! Application layer for the client.
//!
//! # Sub-modules
//!
//! - **`pending`** – Operations a caller issues before the session is ready.
//!   They are kept in issue order and turned into frames once the session has
//!   authenticated.

pub mod pending;
