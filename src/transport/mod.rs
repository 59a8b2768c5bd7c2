//! Pub/sub transport layer.
//!
//! This module contains:
//! - `Connector` / `TransportClient` traits: the seam to a concrete pub/sub
//!   backend (publish, subscribe, quit commands plus a lifecycle event stream)
//! - `Connection`: one client handle with its ready/error/end lifecycle
//!   normalized into `when_ready()` and `close()`
//! - Implementations: Redis (single node or cluster), in-process channel hub

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ConnectionOptions, ResolvedOptions};

pub mod channel;
#[cfg(feature = "redis")]
pub mod redis;

pub use channel::ChannelHub;
#[cfg(feature = "redis")]
pub use self::redis::RedisConnector;

/// Event kind attached to fatal transport log lines.
pub const CONNECTION_ERROR_EVENT: &str = "REDIS_CONNECTION_ERROR";

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid connection options: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection closed before it became ready")]
    Closed,

    #[error("Connection not ready after {0:?}")]
    ReadyTimeout(Duration),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Lifecycle and traffic events reported by a transport client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The client can accept commands.
    Ready,
    /// A transport-level failure.
    Error(String),
    /// The client terminated, either after `quit` or unexpectedly.
    End,
    /// A message arrived on a subscribed channel.
    Message { channel: String, payload: String },
}

/// Sender half handed to transport clients for reporting events.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// A raw message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel: String,
    pub payload: String,
}

/// Command interface of an open transport client.
///
/// All commands are fire-and-forget: they are queued and never suspend the
/// caller. Outcomes surface as [`TransportEvent`]s.
pub trait TransportClient: Send + Sync {
    /// Publish a text payload on a channel.
    fn publish(&self, channel: &str, payload: String);

    /// Start receiving messages published on a channel.
    fn subscribe(&self, channel: &str);

    /// Request graceful termination. Completion is reported as `End`.
    fn quit(&self);
}

/// Opens transport clients.
///
/// Implementations must be called from within a Tokio runtime; they
/// typically spawn a driver task owning the real connection.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        options: &ResolvedOptions,
        events: EventSender,
    ) -> Result<Box<dyn TransportClient>>;
}

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Error,
    Disconnected,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// One physical connection to the pub/sub transport.
///
/// Readiness is sticky: once the transport has reported ready,
/// `when_ready()` returns immediately forever after. Errors and unplanned
/// disconnects are logged as fatal and never retried here.
pub struct Connection {
    name: &'static str,
    client: Box<dyn TransportClient>,
    ready: watch::Receiver<bool>,
    state: watch::Receiver<ConnectionState>,
    closing: Arc<AtomicBool>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
}

impl Connection {
    /// Validate `options` and open a connection through `connector`.
    ///
    /// `name` labels log lines (e.g., "publish", "subscribe"). Invalid
    /// options fail before anything is opened.
    pub fn open(
        connector: &dyn Connector,
        options: &ConnectionOptions,
        name: &'static str,
    ) -> Result<Self> {
        let resolved = options.resolve()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let client = connector.connect(&resolved, event_tx)?;

        let (ready_tx, ready) = watch::channel(false);
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));

        tokio::spawn(pump_events(
            name,
            event_rx,
            ready_tx,
            state_tx,
            inbound_tx,
            closing.clone(),
        ));

        debug!(
            connection = name,
            cluster = resolved.is_cluster(),
            "Transport connection opened"
        );

        Ok(Self {
            name,
            client,
            ready,
            state,
            closing,
            inbound: Mutex::new(Some(inbound_rx)),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn client(&self) -> &dyn TransportClient {
        self.client.as_ref()
    }

    /// Take the stream of messages received on subscribed channels.
    ///
    /// Returns `None` after the first call.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        self.inbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Wait until the transport has reported ready.
    ///
    /// Any number of callers may wait; a single ready event releases all of
    /// them. Fails with `Closed` if the connection terminates first.
    pub async fn when_ready(&self) -> Result<()> {
        let mut ready = self.ready.clone();
        let outcome = ready.wait_for(|is_ready| *is_ready).await.map(|_| ());
        outcome.map_err(|_| TransportError::Closed)
    }

    /// [`when_ready`](Self::when_ready) bounded by `timeout`.
    pub async fn when_ready_timeout(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.when_ready())
            .await
            .map_err(|_| TransportError::ReadyTimeout(timeout))?
    }

    /// Gracefully terminate the connection.
    ///
    /// Sends one quit command no matter how many callers close concurrently,
    /// and resolves for all of them once the transport confirms the end.
    pub async fn close(&self) -> Result<()> {
        if self.state().is_terminal() {
            return Ok(());
        }

        if !self.closing.swap(true, Ordering::SeqCst) {
            debug!(connection = self.name, "Closing transport connection");
            self.client.quit();
        }

        self.terminated().await;
        Ok(())
    }

    /// Resolves once the connection has reached `Disconnected`, whether
    /// through [`close`](Self::close) or because the transport went away.
    pub async fn terminated(&self) {
        let mut state = self.state.clone();
        // A dropped sender means the event pump is gone, which only happens
        // after the connection ended.
        let _ = state.wait_for(ConnectionState::is_terminal).await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Dropping the client ends the transport; that end is planned.
        self.closing.store(true, Ordering::SeqCst);
    }
}

/// Consume client events, tracking state and forwarding inbound messages.
async fn pump_events(
    name: &'static str,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ready: watch::Sender<bool>,
    state: watch::Sender<ConnectionState>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    closing: Arc<AtomicBool>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Ready => {
                state.send_replace(ConnectionState::Ready);
                ready.send_replace(true);
                info!(connection = name, "Transport connection ready");
            }
            TransportEvent::Error(reason) => {
                error!(
                    fatal = true,
                    event = CONNECTION_ERROR_EVENT,
                    connection = name,
                    error = %reason,
                    "Transport error"
                );
                state.send_replace(ConnectionState::Error);
            }
            TransportEvent::End => {
                if closing.load(Ordering::SeqCst) {
                    info!(connection = name, "Transport connection closed");
                } else {
                    error!(
                        fatal = true,
                        event = CONNECTION_ERROR_EVENT,
                        connection = name,
                        error = "disconnected",
                        "Transport error"
                    );
                }
                break;
            }
            TransportEvent::Message { channel, payload } => {
                if inbound.send(InboundMessage { channel, payload }).is_err() {
                    warn!(connection = name, "Inbound message dropped, no consumer");
                }
            }
        }
    }

    state.send_replace(ConnectionState::Disconnected);
}
