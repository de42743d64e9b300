//! Long-running service wrapper around a [`ClientSession`].
//!
//! The service is built from an endpoint description instead of a socket
//! address, so it can be configured from a single string:
//!
//! | Form                       | Example                      |
//! |----------------------------|------------------------------|
//! | `tcp:HOST:PORT`            | `tcp:localhost:10000`        |
//! | `tcp:host=HOST:port=PORT`  | `tcp:host=10.0.0.5:port=20000` |
//! | `HOST:PORT`                | `127.0.0.1:10000`            |

use std::fmt;

use bytes::Bytes;

use crate::infrastructure::network::{
    ClientSession, Message, SessionConfig, SessionError, SessionState,
};

/// A parsed TCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses an endpoint description.
///
/// # Errors
///
/// Returns [`SessionError::InvalidEndpoint`] for anything that is not a TCP
/// endpoint with a host and a numeric port.
pub fn parse_endpoint(description: &str) -> Result<Endpoint, SessionError> {
    let invalid = || SessionError::InvalidEndpoint(description.to_string());
    let rest = description.strip_prefix("tcp:").unwrap_or(description);

    let (host, port) = if rest.contains('=') {
        let mut host = None;
        let mut port = None;
        for part in rest.split(':') {
            match part.split_once('=') {
                Some(("host", value)) => host = Some(value),
                Some(("port", value)) => port = Some(value),
                _ => return Err(invalid()),
            }
        }
        (host.ok_or_else(invalid)?, port.ok_or_else(invalid)?)
    } else {
        rest.rsplit_once(':').ok_or_else(invalid)?
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok(Endpoint {
        host: host.to_string(),
        port,
    })
}

/// Starts, stops and forwards calls to one [`ClientSession`].
pub struct ClientSessionService {
    endpoint: Endpoint,
    session: ClientSession,
}

impl ClientSessionService {
    /// Builds a service for `ident`/`secret` against `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidEndpoint`] if `endpoint` cannot be parsed.
    pub fn new(
        endpoint: &str,
        ident: impl Into<String>,
        secret: impl Into<Vec<u8>>,
    ) -> Result<Self, SessionError> {
        Self::with_config(endpoint, SessionConfig::new(ident, secret))
    }

    pub fn with_config(endpoint: &str, config: SessionConfig) -> Result<Self, SessionError> {
        Ok(Self {
            endpoint: parse_endpoint(endpoint)?,
            session: ClientSession::new(config),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Connects the session.  Does not wait for authentication.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.session.connect(&self.endpoint.to_string()).await
    }

    pub async fn stop(&self) {
        self.session.stop().await;
    }

    /// Resolves once the session is ready.
    pub async fn when_connected(&self) -> Result<(), SessionError> {
        self.session.wait_connected().await
    }

    pub async fn read(&self) -> Result<Message, SessionError> {
        self.session.read().await
    }

    pub fn subscribe(&self, channel: impl Into<String>) -> Result<(), SessionError> {
        self.session.subscribe(channel)
    }

    pub fn unsubscribe(&self, channel: impl Into<String>) -> Result<(), SessionError> {
        self.session.unsubscribe(channel)
    }

    pub fn publish(
        &self,
        channel: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<(), SessionError> {
        self.session.publish(channel, payload)
    }
}
