//! hpfeeds-broker library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.

pub mod application;
pub mod infrastructure;

pub use application::identity::{Authenticator, IdentityRecord, LookupError};
pub use infrastructure::auth::{EnvAuthenticator, JsonFileAuthenticator, MemoryAuthenticator};
pub use infrastructure::network::{Broker, BrokerConfig, BrokerError};
