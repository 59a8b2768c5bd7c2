//! Cluster message routing.
//!
//! This module contains:
//! - `ClusterNode` trait: broadcast, direct send and topic subscription
//!   between servers of one cluster
//! - `ClusterRouter`: the implementation over a pub/sub transport, using one
//!   connection for publishing and one for receiving
//! - Wire types: `Topic`, `Message`, `Envelope`
//! - `MockClusterNode`: records sends for testing

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::config::{Config, ConnectionOptions};
use crate::transport::{self, Connection, Connector, InboundMessage, TransportError};

mod dispatch;
mod envelope;
pub mod mock;
mod topic;

pub use dispatch::{DispatchResult, DispatchTable, Listener, ListenerError, Registration};
pub use envelope::{Admission, Envelope, EnvelopeError, Message};
pub use mock::MockClusterNode;
pub use topic::{Topic, UnknownTopic};

/// Event kind attached to recoverable message errors.
pub const PLUGIN_ERROR_EVENT: &str = "PLUGIN_ERROR";

/// Messaging between the servers of one cluster.
///
/// Implementations:
/// - `ClusterRouter`: pub/sub transport backed
/// - `MockClusterNode`: in-memory mock for testing
#[async_trait]
pub trait ClusterNode: Send + Sync {
    /// Wait until the node can send and receive.
    async fn when_ready(&self) -> transport::Result<()>;

    /// Shut the node down.
    async fn close(&self) -> transport::Result<()>;

    /// Send `message` to every other server listening on its topic.
    fn send(&self, message: &Message);

    /// Send `message` to one named server.
    fn send_direct(&self, to_server: &str, message: &Message);

    /// Register `listener` for messages on `topic` sent by other servers.
    fn subscribe(&self, topic: Topic, listener: Arc<dyn Listener>);
}

/// What became of one inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Malformed,
    SelfEcho,
    OtherServer,
    UnknownTopic,
    Delivered { succeeded: usize, failed: usize },
}

/// Decode, filter and dispatch one raw payload received on `channel`.
///
/// Listeners are looked up by the topic inside the message, not by the
/// channel the payload arrived on.
pub fn handle_inbound(
    server_name: &str,
    table: &DispatchTable,
    channel: &str,
    payload: &str,
) -> InboundOutcome {
    let envelope = match Envelope::decode(payload) {
        Ok(envelope) => envelope,
        Err(EnvelopeError::UnknownTopic(code)) => {
            error!(
                event = PLUGIN_ERROR_EVENT,
                topic = code,
                "Received message for unknown topic"
            );
            return InboundOutcome::UnknownTopic;
        }
        Err(e) => {
            error!(event = PLUGIN_ERROR_EVENT, channel, error = %e, "Error parsing message");
            return InboundOutcome::Malformed;
        }
    };

    match envelope.admission(server_name) {
        Admission::SelfEcho => return InboundOutcome::SelfEcho,
        Admission::OtherServer => {
            trace!(channel, to_server = ?envelope.to_server, "Message for another server");
            return InboundOutcome::OtherServer;
        }
        Admission::Accept => {}
    }

    match table.dispatch(&envelope.message, &envelope.from_server) {
        DispatchResult::NoListeners => {
            error!(
                event = PLUGIN_ERROR_EVENT,
                topic = envelope.message.topic.code(),
                "Received message for unknown topic"
            );
            InboundOutcome::UnknownTopic
        }
        DispatchResult::Delivered { succeeded, failed } => {
            InboundOutcome::Delivered { succeeded, failed }
        }
    }
}

/// Cluster node over a pub/sub transport.
///
/// Publishing and receiving use separate connections so pushed messages
/// never contend with outgoing commands on one handle. Transport channels
/// are subscribed lazily, on the first listener per topic.
pub struct ClusterRouter {
    server_name: String,
    publisher: Connection,
    subscriber: Connection,
    table: Arc<DispatchTable>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterRouter {
    /// Open both connections and start the inbound dispatch task.
    ///
    /// Must be called from within a Tokio runtime. Invalid connection
    /// options fail here, before anything is opened.
    pub fn new(
        connector: &dyn Connector,
        options: &ConnectionOptions,
        server_name: impl Into<String>,
    ) -> transport::Result<Self> {
        let server_name = server_name.into();
        let publisher = Connection::open(connector, options, "publish")?;
        let subscriber = Connection::open(connector, options, "subscribe")?;
        let table = Arc::new(DispatchTable::new());

        let dispatcher = subscriber.take_inbound().map(|inbound| {
            tokio::spawn(run_dispatch(server_name.clone(), table.clone(), inbound))
        });

        debug!(server_name = %server_name, "Cluster router started");

        Ok(Self {
            server_name,
            publisher,
            subscriber,
            table,
            dispatcher: Mutex::new(dispatcher),
        })
    }

    pub fn from_config(connector: &dyn Connector, config: &Config) -> transport::Result<Self> {
        Self::new(connector, &config.redis, config.server_name.clone())
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Resolves once either connection has terminated.
    ///
    /// Pending for the lifetime of a healthy router. Outside of
    /// [`ClusterNode::close`] this means the transport went away and the
    /// router will not recover.
    pub async fn terminated(&self) {
        tokio::select! {
            _ = self.publisher.terminated() => {}
            _ = self.subscriber.terminated() => {}
        }
    }

    /// [`ClusterNode::when_ready`] bounded by `timeout`.
    pub async fn when_ready_timeout(&self, timeout: Duration) -> transport::Result<()> {
        tokio::time::timeout(timeout, self.when_ready())
            .await
            .map_err(|_| TransportError::ReadyTimeout(timeout))?
    }

    pub fn dispatch_table(&self) -> &DispatchTable {
        &self.table
    }

    fn publish(&self, envelope: Envelope) {
        let channel = envelope.message.topic.channel();
        match envelope.encode() {
            Ok(payload) => {
                trace!(channel = %channel, to_server = ?envelope.to_server, "Publishing envelope");
                self.publisher.client().publish(&channel, payload);
            }
            Err(e) => {
                error!(event = PLUGIN_ERROR_EVENT, channel = %channel, error = %e, "Dropping unencodable message");
            }
        }
    }
}

async fn run_dispatch(
    server_name: String,
    table: Arc<DispatchTable>,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
) {
    while let Some(message) = inbound.recv().await {
        let outcome = handle_inbound(&server_name, &table, &message.channel, &message.payload);
        trace!(channel = %message.channel, ?outcome, "Inbound message handled");
    }
    debug!(server_name = %server_name, "Cluster dispatch stopped");
}

#[async_trait]
impl ClusterNode for ClusterRouter {
    /// Both connections must be ready: without the subscribe side the node
    /// would send but silently miss everything addressed to it.
    async fn when_ready(&self) -> transport::Result<()> {
        tokio::try_join!(self.publisher.when_ready(), self.subscriber.when_ready())?;
        Ok(())
    }

    async fn close(&self) -> transport::Result<()> {
        tokio::try_join!(self.publisher.close(), self.subscriber.close())?;

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(dispatcher) = dispatcher {
            // The inbound stream ends with the subscribe connection.
            let _ = dispatcher.await;
        }
        Ok(())
    }

    fn send(&self, message: &Message) {
        self.publish(Envelope::broadcast(&self.server_name, message.clone()));
    }

    fn send_direct(&self, to_server: &str, message: &Message) {
        self.publish(Envelope::direct(&self.server_name, to_server, message.clone()));
    }

    fn subscribe(&self, topic: Topic, listener: Arc<dyn Listener>) {
        debug!(topic = %topic, "New subscription to topic");
        if self.table.register(topic, listener) == Registration::FirstForTopic {
            self.subscriber.client().subscribe(&topic.channel());
        }
    }
}

#[cfg(test)]
mod tests;
