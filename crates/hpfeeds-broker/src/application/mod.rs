//! Application layer for the broker.
//!
//! Pure routing and authorization logic.  Nothing in here touches sockets or
//! files; the infrastructure layer drives these types from connection tasks.
//!
//! # Sub-modules
//!
//! - **`identity`** – Identity records, the `Authenticator` trait every
//!   credential backend implements, and the AUTH digest check.
//!
//! - **`router`** – The connection registry and channel → subscriber index.
//!   Publish fan-out happens here.

pub mod identity;
pub mod router;
