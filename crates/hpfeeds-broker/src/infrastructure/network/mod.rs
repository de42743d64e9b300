//! Network infrastructure for the broker.
//!
//! # Sub-modules
//!
//! - **`connection`** – The per-socket state machine: sends INFO, verifies
//!   AUTH, enforces channel ACLs and forwards publishes to the router.
//!
//! - **`server`** – The [`Broker`]: TCP accept loop, connection task
//!   tracking and graceful shutdown.

pub mod connection;
pub mod server;

pub use server::{Broker, BrokerConfig, BrokerError};
