//! TCP broker: accept loop, connection task tracking and shutdown.
//!
//! A [`Broker`] owns one listener, one [`Router`] and the set of connection
//! tasks it spawned.  Several brokers can live in one process (tests do
//! this); nothing here is global.
//!
//! # Shutdown
//!
//! [`Broker::stop`] cancels a `CancellationToken` shared with the accept loop
//! and every connection task, then waits on a `TaskTracker` until all of them
//! have finished.  Each connection removes itself from the router before its
//! task ends, so once `stop` returns the registry is empty.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use hpfeeds_core::protocol::DEFAULT_MAX_FRAME_SIZE;

use crate::application::identity::Authenticator;
use crate::application::router::{ConnectionInfo, Router};
use crate::infrastructure::network::connection::{handle_connection, SharedState};
use crate::infrastructure::storage::config::BrokerSettings;

/// Back-off after a failed `accept()`, e.g. when the process is out of
/// file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Errors raised by the broker itself (not by individual connections).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("listener I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runtime options for one broker instance.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    /// Server name sent in INFO.
    pub name: String,
    pub max_frame_size: usize,
    pub outbound_queue_capacity: usize,
    pub echo_to_publisher: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "hpfeeds".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            outbound_queue_capacity: 1024,
            echo_to_publisher: false,
        }
    }
}

impl From<&BrokerSettings> for BrokerConfig {
    fn from(settings: &BrokerSettings) -> Self {
        Self {
            name: settings.name.clone(),
            max_frame_size: settings.max_frame_size,
            outbound_queue_capacity: settings.outbound_queue_capacity,
            echo_to_publisher: settings.echo_to_publisher,
        }
    }
}

/// An hpfeeds broker bound to one TCP listener.
pub struct Broker {
    listener: TcpListener,
    shared: Arc<SharedState>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Broker {
    /// Wraps an already bound listener.
    pub fn new(
        listener: TcpListener,
        authenticator: Arc<dyn Authenticator>,
        config: BrokerConfig,
    ) -> Self {
        let shared = SharedState {
            router: Arc::new(Router::new(config.echo_to_publisher)),
            authenticator,
            server_name: config.name,
            max_frame_size: config.max_frame_size,
            outbound_queue_capacity: config.outbound_queue_capacity,
        };
        Self {
            listener,
            shared: Arc::new(shared),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Binds a listener on `addr` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Bind`] if the address cannot be bound.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        authenticator: Arc<dyn Authenticator>,
        config: BrokerConfig,
    ) -> Result<Self, BrokerError> {
        let listener = TcpListener::bind(addr).await.map_err(BrokerError::Bind)?;
        Ok(Self::new(listener, authenticator, config))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BrokerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until [`Broker::stop`] is called.
    ///
    /// Each accepted socket is handed to its own task; a failed `accept()` is
    /// logged and retried.
    pub async fn serve_forever(&self) -> Result<(), BrokerError> {
        // Counts as a tracked task so `stop` also waits for this loop.
        let _running = self.tracker.token();
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        info!("hpfeeds broker listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested; stopping accept loop");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {peer}");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("could not set TCP_NODELAY for {peer}: {e}");
                        }
                        self.tracker.spawn(handle_connection(
                            stream,
                            peer,
                            Arc::clone(&self.shared),
                            self.shutdown.child_token(),
                        ));
                    }
                    Err(e) => {
                        error!("accept error: {e}");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
        Ok(())
    }

    /// Stops accepting, closes every connection and waits until all of them
    /// are gone.  Calling it again is a no-op.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!(
            "broker drained; {} connections left",
            self.shared.router.connection_count().await
        );
    }

    /// Snapshot of the live connections.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared.router.connections().await
    }

    pub async fn connection_count(&self) -> usize {
        self.shared.router.connection_count().await
    }

    /// Number of connections currently subscribed to `channel`.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.shared.router.subscriber_count(channel).await
    }
}
