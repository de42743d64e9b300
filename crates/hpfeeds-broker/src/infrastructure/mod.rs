//! Infrastructure layer for the broker.
//!
//! Contains the adapters that touch the outside world: TCP sockets,
//! credential backends and the config file.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `hpfeeds_core`, but MUST NOT be imported by the `application` layer.

pub mod auth;
pub mod network;
pub mod storage;
