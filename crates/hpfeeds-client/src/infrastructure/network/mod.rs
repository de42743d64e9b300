//! Client session: one authenticated connection to an hpfeeds broker.
//!
//! Architecture:
//! - [`ClientSession`] is the caller-facing handle.  It never touches the
//!   socket itself.
//! - A background task (the *session actor*) owns the stream.  It reads
//!   frames with a `FramedRead`, writes them with a `FramedWrite`, answers
//!   INFO with AUTH and forwards inbound publishes on an `mpsc` channel.
//! - Subscribe, unsubscribe and publish requests travel to the actor over an
//!   unbounded command channel.  Until the actor has sent AUTH they are parked
//!   in a [`PendingOperations`] queue and replayed in order afterwards.
//! - The session state is published on a `watch` channel so any number of
//!   callers can wait for `Ready` or `Closed`.
//!
//! ```text
//!  Disconnected ──connect()──► Connecting ──INFO / AUTH sent──► Ready
//!        │                          │                             │
//!        └──────── stop() ──────────┴──── EOF, error, stop() ─────┴──► Closed
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hpfeeds_core::protocol::{
    compute_digest, CodecError, EncodeError, Frame, FrameCodec, DEFAULT_MAX_FRAME_SIZE,
    MAX_SHORT_STRING_LEN,
};

use crate::application::pending::{Operation, PendingOperations};

/// Inbound publishes buffered before `read()` callers pick them up.
pub const DEFAULT_INBOUND_CAPACITY: usize = 128;

// ── Public types ──────────────────────────────────────────────────────────────

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `stop()` was called or the handle was dropped.
    Stopped,
    /// The connection failed or was closed without an ERROR from the broker.
    Transport(String),
    /// The broker sent something this client cannot accept.
    Protocol(String),
    /// The broker closed the connection after sending this ERROR text.
    Remote(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Transport(detail) => write!(f, "transport: {detail}"),
            Self::Protocol(detail) => write!(f, "protocol: {detail}"),
            Self::Remote(message) => write!(f, "broker error: {message}"),
        }
    }
}

/// Lifecycle of a [`ClientSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// AUTH has been sent; operations go straight to the wire.
    Ready,
    /// Terminal.
    Closed(CloseReason),
}

/// Errors returned by [`ClientSession`] operations.
#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("session already started")]
    AlreadyStarted,

    #[error("session closed ({0})")]
    Closed(CloseReason),

    #[error("frame of {size} bytes exceeds maximum frame size of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),
}

/// A PUBLISH received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Identity of the publisher.
    pub ident: String,
    pub channel: String,
    pub payload: Bytes,
}

/// Credentials and limits for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ident: String,
    pub secret: Vec<u8>,
    pub max_frame_size: usize,
    pub inbound_capacity: usize,
}

impl SessionConfig {
    pub fn new(ident: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            ident: ident.into(),
            secret: secret.into(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }
}

// ── Session handle ────────────────────────────────────────────────────────────

/// Channel ends handed to the actor when the session starts.
struct ActorChannels {
    commands: mpsc::UnboundedReceiver<Operation>,
    inbound: mpsc::Sender<Message>,
}

/// Handle to a client session.
///
/// All methods take `&self`, so the handle can be shared behind an `Arc`.
pub struct ClientSession {
    config: SessionConfig,
    commands: mpsc::UnboundedSender<Operation>,
    channels: Mutex<Option<ActorChannels>>,
    inbound: Mutex<mpsc::Receiver<Message>>,
    state: Arc<watch::Sender<SessionState>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSession {
    pub fn new(config: SessionConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            commands: command_tx,
            channels: Mutex::new(Some(ActorChannels {
                commands: command_rx,
                inbound: inbound_tx,
            })),
            inbound: Mutex::new(inbound_rx),
            state: Arc::new(state),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn ident(&self) -> &str {
        &self.config.ident
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Resolves `addr` (`host:port`) and starts the session over TCP.
    ///
    /// Returns once the session task is running; use
    /// [`ClientSession::wait_connected`] to wait for `Ready`.
    ///
    /// # Errors
    ///
    /// - [`SessionError::AlreadyStarted`] if the session is not `Disconnected`.
    /// - [`SessionError::Closed`] if the session was stopped, or if `addr`
    ///   does not resolve (the session is closed in that case).
    pub async fn connect(&self, addr: &str) -> Result<(), SessionError> {
        let channels = self.take_channels().await?;
        self.state.send_replace(SessionState::Connecting);

        let addrs: Vec<SocketAddr> = match tokio::net::lookup_host(addr).await {
            Ok(resolved) => resolved.collect(),
            Err(e) => {
                let reason = CloseReason::Transport(format!("cannot resolve {addr}: {e}"));
                self.state.send_replace(SessionState::Closed(reason.clone()));
                return Err(SessionError::Closed(reason));
            }
        };

        info!("connecting to hpfeeds broker at {addr}");
        let actor = self.actor(channels);
        let handle = tokio::spawn(async move {
            let connected = tokio::select! {
                _ = actor.shutdown.cancelled() => Err(CloseReason::Stopped),
                result = TcpStream::connect(&addrs[..]) => {
                    result.map_err(|e| CloseReason::Transport(format!("connect failed: {e}")))
                }
            };
            match connected {
                Ok(stream) => actor.run(stream).await,
                Err(reason) => actor.finish(reason),
            }
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Starts the session over an already connected stream.
    ///
    /// # Errors
    ///
    /// Same as [`ClientSession::connect`], minus name resolution.
    pub async fn attach<S>(&self, stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let channels = self.take_channels().await?;
        self.state.send_replace(SessionState::Connecting);
        let actor = self.actor(channels);
        let handle = tokio::spawn(actor.run(stream));
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Waits until the session is `Ready`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session closes first.
    pub async fn wait_connected(&self) -> Result<(), SessionError> {
        let mut rx = self.state.subscribe();
        let state = match rx
            .wait_for(|s| matches!(s, SessionState::Ready | SessionState::Closed(_)))
            .await
        {
            Ok(state) => state.clone(),
            Err(_) => SessionState::Closed(CloseReason::Stopped),
        };
        match state {
            SessionState::Closed(reason) => Err(SessionError::Closed(reason)),
            _ => Ok(()),
        }
    }

    /// Waits for the next publish on any subscribed channel.
    ///
    /// Messages already received are still handed out after the session has
    /// closed; once they are exhausted this returns the close reason.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] when the session is closed and no
    /// buffered message is left.
    pub async fn read(&self) -> Result<Message, SessionError> {
        let mut inbound = self.inbound.lock().await;
        let mut state = self.state.subscribe();
        tokio::select! {
            biased;
            message = inbound.recv() => match message {
                Some(message) => Ok(message),
                None => Err(SessionError::Closed(self.close_reason())),
            },
            _ = state.wait_for(|s| matches!(s, SessionState::Closed(_))) => {
                // Drain anything that raced with the close.
                match inbound.try_recv() {
                    Ok(message) => Ok(message),
                    Err(_) => Err(SessionError::Closed(self.close_reason())),
                }
            }
        }
    }

    pub fn subscribe(&self, channel: impl Into<String>) -> Result<(), SessionError> {
        self.submit(Operation::Subscribe {
            channel: channel.into(),
        })
    }

    pub fn unsubscribe(&self, channel: impl Into<String>) -> Result<(), SessionError> {
        self.submit(Operation::Unsubscribe {
            channel: channel.into(),
        })
    }

    /// Publishes `payload` on `channel` under this session's identity.
    ///
    /// # Errors
    ///
    /// - [`SessionError::FrameTooLarge`] if the frame would exceed the
    ///   configured maximum frame size.
    /// - [`SessionError::Encode`] if the channel name is longer than 255 bytes.
    /// - [`SessionError::Closed`] after the session has closed.
    pub fn publish(
        &self,
        channel: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<(), SessionError> {
        self.submit(Operation::Publish {
            channel: channel.into(),
            payload: payload.into(),
        })
    }

    /// Closes the session and waits for its task to finish.
    ///
    /// Suspended `read()` and `wait_connected()` callers are released with
    /// [`SessionError::Closed`].  Calling it again is a no-op.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("session task ended abnormally: {e}");
            }
        }
        self.state.send_if_modified(|state| {
            if matches!(state, SessionState::Closed(_)) {
                false
            } else {
                *state = SessionState::Closed(CloseReason::Stopped);
                true
            }
        });
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn take_channels(&self) -> Result<ActorChannels, SessionError> {
        if let SessionState::Closed(reason) = self.state() {
            return Err(SessionError::Closed(reason));
        }
        self.channels
            .lock()
            .await
            .take()
            .ok_or(SessionError::AlreadyStarted)
    }

    fn actor(&self, channels: ActorChannels) -> SessionActor {
        SessionActor {
            ident: self.config.ident.clone(),
            secret: self.config.secret.clone(),
            max_frame_size: self.config.max_frame_size,
            commands: channels.commands,
            inbound: channels.inbound,
            state: Arc::clone(&self.state),
            shutdown: self.shutdown.clone(),
            pending: PendingOperations::new(),
            last_error: None,
        }
    }

    fn close_reason(&self) -> CloseReason {
        match self.state() {
            SessionState::Closed(reason) => reason,
            _ => CloseReason::Stopped,
        }
    }

    fn submit(&self, op: Operation) -> Result<(), SessionError> {
        if let SessionState::Closed(reason) = self.state() {
            return Err(SessionError::Closed(reason));
        }
        self.check(&op)?;
        self.commands
            .send(op)
            .map_err(|_| SessionError::Closed(self.close_reason()))
    }

    /// Rejects operations whose frame could never be encoded or accepted.
    fn check(&self, op: &Operation) -> Result<(), SessionError> {
        let channel = match op {
            Operation::Subscribe { channel }
            | Operation::Unsubscribe { channel }
            | Operation::Publish { channel, .. } => channel,
        };
        for (field, value) in [("ident", &self.config.ident), ("channel", channel)] {
            if value.len() > MAX_SHORT_STRING_LEN {
                return Err(EncodeError::FieldTooLong {
                    field,
                    len: value.len(),
                }
                .into());
            }
        }
        let size = op.clone().into_frame(&self.config.ident).encoded_len();
        if size > self.config.max_frame_size {
            return Err(SessionError::FrameTooLarge {
                size,
                max: self.config.max_frame_size,
            });
        }
        Ok(())
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ── Session actor ─────────────────────────────────────────────────────────────

struct SessionActor {
    ident: String,
    secret: Vec<u8>,
    max_frame_size: usize,
    commands: mpsc::UnboundedReceiver<Operation>,
    inbound: mpsc::Sender<Message>,
    state: Arc<watch::Sender<SessionState>>,
    shutdown: CancellationToken,
    pending: PendingOperations,
    /// Text of the most recent ERROR frame from the broker.
    last_error: Option<String>,
}

impl SessionActor {
    async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut frames = FramedRead::new(read_half, FrameCodec::new(self.max_frame_size));
        let mut sink = FramedWrite::new(write_half, FrameCodec::new(self.max_frame_size));

        let reason = self.drive(&mut frames, &mut sink).await;
        if let Err(e) = sink.close().await {
            debug!("error closing connection: {e}");
        }
        self.finish(reason);
    }

    fn finish(self, reason: CloseReason) {
        info!("hpfeeds session {} closed: {reason}", self.ident);
        self.state.send_replace(SessionState::Closed(reason));
    }

    async fn drive<R, W>(
        &mut self,
        frames: &mut FramedRead<R, FrameCodec>,
        sink: &mut FramedWrite<W, FrameCodec>,
    ) -> CloseReason
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut ready = false;
        // A received publish waiting for room in the inbound queue.  While it
        // waits the socket is not read, but commands keep flowing.
        let mut undelivered: Option<Message> = None;
        let inbound = self.inbound.clone();
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    if ready {
                        self.flush_commands(sink).await;
                    }
                    return CloseReason::Stopped;
                }
                Some(op) = self.commands.recv() => {
                    if !ready {
                        self.pending.push(op);
                        continue;
                    }
                    if let Err(e) = sink.send(op.into_frame(&self.ident)).await {
                        return self.codec_failure(e);
                    }
                }
                permit = inbound.reserve(), if undelivered.is_some() => {
                    match (permit, undelivered.take()) {
                        (Ok(permit), Some(message)) => permit.send(message),
                        _ => debug!("inbound receiver gone; dropping publish"),
                    }
                }
                next = frames.next(), if undelivered.is_none() => {
                    let frame = match next {
                        None => return self.transport_closed("connection closed by broker".to_string()),
                        Some(Err(e)) => return self.codec_failure(e),
                        Some(Ok(frame)) => frame,
                    };
                    debug!("received {}", frame.opcode());
                    match frame {
                        Frame::Info { name, nonce } if !ready => {
                            info!("broker {name:?} sent INFO; authenticating as {}", self.ident);
                            let auth = Frame::Auth {
                                ident: self.ident.clone(),
                                digest: compute_digest(&nonce, &self.secret),
                            };
                            if let Err(e) = sink.send(auth).await {
                                return self.codec_failure(e);
                            }
                            ready = true;
                            self.state.send_replace(SessionState::Ready);
                            if !self.pending.is_empty() {
                                debug!("sending {} operations issued before AUTH", self.pending.len());
                            }
                            for op in self.pending.drain() {
                                if let Err(e) = sink.send(op.into_frame(&self.ident)).await {
                                    return self.codec_failure(e);
                                }
                            }
                        }
                        Frame::Publish { ident, channel, payload } if ready => {
                            undelivered = Some(Message { ident, channel, payload });
                        }
                        Frame::Error { message } => {
                            warn!("broker error: {message}");
                            self.last_error = Some(message);
                        }
                        other => {
                            return CloseReason::Protocol(format!(
                                "unexpected {} frame from broker",
                                other.opcode()
                            ))
                        }
                    }
                }
            }
        }
    }

    /// Sends operations that were issued before `stop()`.
    async fn flush_commands<W>(&mut self, sink: &mut FramedWrite<W, FrameCodec>)
    where
        W: AsyncWrite + Unpin,
    {
        while let Ok(op) = self.commands.try_recv() {
            if let Err(e) = sink.send(op.into_frame(&self.ident)).await {
                debug!("dropping queued operations on stop: {e}");
                return;
            }
        }
    }

    /// Close reason for a lost connection, preferring the broker's last
    /// ERROR text when there is one.
    fn transport_closed(&mut self, detail: String) -> CloseReason {
        match self.last_error.take() {
            Some(message) => CloseReason::Remote(message),
            None => CloseReason::Transport(detail),
        }
    }

    fn codec_failure(&mut self, error: CodecError) -> CloseReason {
        match error {
            CodecError::Io(e) => self.transport_closed(e.to_string()),
            other => CloseReason::Protocol(other.to_string()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
