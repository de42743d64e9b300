//! Per-socket broker connection: handshake, frame dispatch and ACL checks.
//!
//! # Lifecycle
//!
//! ```text
//!  accept ──► send INFO(name, nonce) ──► AwaitingAuth
//!                                            │ AUTH ok
//!                                            ▼
//!                                      Authenticated ◄──┐ SUBSCRIBE / UNSUBSCRIBE / PUBLISH
//!                                            │──────────┘
//!                                            │ EOF, I/O error, bad frame, shutdown
//!                                            ▼
//!                                         Closed
//! ```
//!
//! Every connection runs in its own task.  That task is the only writer on
//! the socket: it interleaves replies to its own peer with publishes other
//! connections routed into its outbound queue, so frames reach the peer in
//! the order they were queued.
//!
//! Every socket write races the shutdown token, so a peer that stops
//! reading cannot hold up [`Broker::stop`](super::Broker::stop).

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hpfeeds_core::protocol::{
    encode_frame, generate_nonce, CodecError, Frame, FrameCodec, Opcode, NONCE_LEN,
};

use crate::application::identity::{authenticate, AuthFailure, Authenticator, IdentityRecord};
use crate::application::router::{ConnectionId, Router};

/// ERROR text sent for every refused AUTH.
pub const AUTH_FAILED_MESSAGE: &str = "authfail.";
/// ERROR text sent when an ACL forbids a subscribe or publish.
pub const ACCESS_DENIED_MESSAGE: &str = "accessfail.";

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a connection closed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The peer broke the protocol in a way the decoder cannot see.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The byte stream could not be decoded, or the transport failed under it.
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("authentication failed: {0}")]
    AuthFailed(#[from] AuthFailure),

    /// A non-AUTH frame arrived before authentication.
    #[error("{0} received before AUTH")]
    Unauthenticated(Opcode),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The broker is stopping.
    #[error("broker shutting down")]
    Shutdown,
}

impl ConnectionError {
    /// ERROR frame owed to the peer before the socket is closed, if any.
    pub fn reply(&self) -> Option<Frame> {
        match self {
            Self::AuthFailed(_) => Some(Frame::error(AUTH_FAILED_MESSAGE)),
            Self::Protocol(_) | Self::Unauthenticated(_) => Some(Frame::error(self.to_string())),
            Self::Codec(CodecError::Protocol(e)) => Some(Frame::error(e.to_string())),
            Self::Codec(_) | Self::Io(_) | Self::Shutdown => None,
        }
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

/// Everything a connection task needs from its broker.
pub struct SharedState {
    pub router: Arc<Router>,
    pub authenticator: Arc<dyn Authenticator>,
    /// Server name advertised in INFO.
    pub server_name: String,
    pub max_frame_size: usize,
    pub outbound_queue_capacity: usize,
}

// ── State machine ─────────────────────────────────────────────────────────────

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// INFO sent; waiting for AUTH against this nonce.
    AwaitingAuth { nonce: [u8; NONCE_LEN] },
    /// Bound to exactly one identity for the rest of the connection.
    Authenticated(Arc<IdentityRecord>),
    Closed,
}

struct Connection<R, W> {
    id: ConnectionId,
    peer: SocketAddr,
    state: ConnectionState,
    frames: FramedRead<R, FrameCodec>,
    writer: W,
    outbound: mpsc::Receiver<Bytes>,
    shared: Arc<SharedState>,
    shutdown: CancellationToken,
}

/// Drives one accepted stream from INFO to close, then removes it from the
/// router.
///
/// Generic over the stream so tests can use an in-memory duplex pipe.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    shared: Arc<SharedState>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let id = Uuid::new_v4();
    let (read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(shared.outbound_queue_capacity);
    shared.router.register(id, peer, tx).await;

    let mut conn = Connection {
        id,
        peer,
        state: ConnectionState::AwaitingAuth {
            nonce: generate_nonce(),
        },
        frames: FramedRead::new(read_half, FrameCodec::new(shared.max_frame_size)),
        writer: write_half,
        outbound: rx,
        shared: Arc::clone(&shared),
        shutdown,
    };

    let result = conn.run().await;
    match &result {
        Ok(()) => info!("connection {id} from {peer} closed by peer"),
        Err(ConnectionError::Shutdown) => debug!("connection {id} from {peer} closed for shutdown"),
        Err(e @ ConnectionError::AuthFailed(AuthFailure::Backend { .. })) => {
            error!("connection {id} from {peer}: {e}")
        }
        Err(e) => warn!("connection {id} from {peer} closed: {e}"),
    }

    if let Some(reply) = result.as_ref().err().and_then(ConnectionError::reply) {
        if let Err(e) = conn.send_frame(&reply).await {
            debug!("connection {id}: could not deliver closing ERROR: {e}");
        }
    }

    conn.state = ConnectionState::Closed;
    if let Err(e) = conn.close_writer().await {
        debug!("connection {id}: could not shut down writer: {e}");
    }
    shared.router.remove(id).await;
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn run(&mut self) -> Result<(), ConnectionError> {
        let ConnectionState::AwaitingAuth { nonce } = self.state else {
            return Err(ConnectionError::Protocol("connection already started".to_string()));
        };
        let info = Frame::Info {
            name: self.shared.server_name.clone(),
            nonce: Bytes::copy_from_slice(&nonce),
        };
        self.send_frame(&info).await?;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(ConnectionError::Shutdown),
                Some(bytes) = self.outbound.recv() => self.write_bytes(&bytes).await?,
                next = self.frames.next() => match next {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(frame)) => self.handle_frame(frame).await?,
                },
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        let opcode = frame.opcode();
        debug!("connection {}: received {opcode}", self.id);

        let record = match &self.state {
            ConnectionState::AwaitingAuth { nonce } => {
                let nonce = *nonce;
                let Frame::Auth { ident, digest } = frame else {
                    return Err(ConnectionError::Unauthenticated(opcode));
                };
                return self.on_auth(&ident, &nonce, &digest).await;
            }
            ConnectionState::Authenticated(record) => Arc::clone(record),
            ConnectionState::Closed => {
                return Err(ConnectionError::Protocol("frame after close".to_string()))
            }
        };

        match frame {
            Frame::Auth { .. } => Err(ConnectionError::Protocol(
                "connection is already authenticated".to_string(),
            )),
            Frame::Subscribe { channel, .. } => self.on_subscribe(&record, &channel).await,
            Frame::Unsubscribe { channel, .. } => {
                if self.shared.router.unsubscribe(self.id, &channel).await {
                    debug!("{} unsubscribed from {channel}", record.ident);
                }
                Ok(())
            }
            publish @ Frame::Publish { .. } => self.on_publish(&record, publish).await,
            Frame::Info { .. } | Frame::Error { .. } => Err(ConnectionError::Protocol(format!(
                "unexpected {opcode} from client"
            ))),
        }
    }

    async fn on_auth(
        &mut self,
        ident: &str,
        nonce: &[u8],
        digest: &[u8],
    ) -> Result<(), ConnectionError> {
        let record = authenticate(self.shared.authenticator.as_ref(), ident, nonce, digest).await?;
        info!(
            "connection {} from {} authenticated as {} (owner {:?})",
            self.id, self.peer, record.ident, record.owner
        );
        self.shared.router.bind_identity(self.id, &record.ident).await;
        self.state = ConnectionState::Authenticated(Arc::new(record));
        Ok(())
    }

    async fn on_subscribe(
        &mut self,
        record: &IdentityRecord,
        channel: &str,
    ) -> Result<(), ConnectionError> {
        if !record.may_subscribe(channel) {
            warn!("{} may not subscribe to {channel}", record.ident);
            return self.send_frame(&Frame::error(ACCESS_DENIED_MESSAGE)).await;
        }
        if self.shared.router.subscribe(self.id, channel).await {
            info!("{} subscribed to {channel}", record.ident);
        }
        Ok(())
    }

    async fn on_publish(
        &mut self,
        record: &IdentityRecord,
        frame: Frame,
    ) -> Result<(), ConnectionError> {
        let Frame::Publish { ident, channel, .. } = &frame else {
            return Ok(());
        };

        if *ident != record.ident {
            warn!(
                "connection {} authenticated as {} published as {ident}",
                self.id, record.ident
            );
            let reply = Frame::error(format!("Invalid authkey in message, ident={ident}"));
            return self.send_frame(&reply).await;
        }
        if !record.may_publish(channel) {
            warn!("{} may not publish to {channel}", record.ident);
            return self.send_frame(&Frame::error(ACCESS_DENIED_MESSAGE)).await;
        }

        let encoded = encode_frame(&frame).map_err(CodecError::from)?;
        let outcome = self.shared.router.publish(self.id, channel, encoded).await;
        debug!(
            "{} published on {channel}: {} delivered, {} dropped",
            record.ident, outcome.delivered, outcome.dropped
        );
        Ok(())
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<(), ConnectionError> {
        let bytes = encode_frame(frame).map_err(CodecError::from)?;
        self.write_bytes(&bytes).await
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ConnectionError::Shutdown),
            written = self.writer.write_all(bytes) => Ok(written?),
        }
    }

    /// Flushes and shuts down the write half.  Skipped on shutdown; dropping
    /// the stream closes it.
    async fn close_writer(&mut self) -> Result<(), ConnectionError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Ok(()),
            closed = self.writer.shutdown() => Ok(closed?),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
