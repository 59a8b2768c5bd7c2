//! In-memory channel-based transport.
//!
//! Uses a tokio broadcast channel as a process-local pub/sub server. Every
//! client connected to the same [`ChannelHub`] sees what the others publish
//! on the channels it subscribed to, including its own publications, the way
//! a shared Redis server behaves. Ideal for tests and single-process setups.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

use super::{Connector, EventSender, Result, TransportClient, TransportEvent};
use crate::config::ResolvedOptions;

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct HubMessage {
    channel: Arc<str>,
    payload: Arc<str>,
}

/// A process-local pub/sub server.
///
/// Cloning yields another handle to the same hub.
#[derive(Clone)]
pub struct ChannelHub {
    sender: broadcast::Sender<HubMessage>,
    clients: Arc<Mutex<Vec<EventSender>>>,
    subscribe_commands: Arc<Mutex<Vec<String>>>,
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            clients: Arc::new(Mutex::new(Vec::new())),
            subscribe_commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every channel subscribe command received so far, across all clients,
    /// in arrival order.
    pub fn subscribe_commands(&self) -> Vec<String> {
        self.subscribe_commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Simulate the server going away: every connected client reports an
    /// error followed by an unexpected end.
    pub fn sever(&self, reason: &str) {
        let clients = std::mem::take(
            &mut *self
                .clients
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for events in clients {
            let _ = events.send(TransportEvent::Error(reason.to_string()));
            let _ = events.send(TransportEvent::End);
        }
    }
}

impl Connector for ChannelHub {
    fn connect(
        &self,
        _options: &ResolvedOptions,
        events: EventSender,
    ) -> Result<Box<dyn TransportClient>> {
        let client = ChannelClient {
            sender: self.sender.clone(),
            subscriptions: Arc::new(RwLock::new(HashSet::new())),
            shutdown: Arc::new(Notify::new()),
            subscribe_commands: self.subscribe_commands.clone(),
        };

        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(events.clone());

        tokio::spawn(forward(
            self.sender.subscribe(),
            client.subscriptions.clone(),
            client.shutdown.clone(),
            events.clone(),
        ));

        let _ = events.send(TransportEvent::Ready);
        Ok(Box::new(client))
    }
}

struct ChannelClient {
    sender: broadcast::Sender<HubMessage>,
    subscriptions: Arc<RwLock<HashSet<Arc<str>>>>,
    shutdown: Arc<Notify>,
    subscribe_commands: Arc<Mutex<Vec<String>>>,
}

impl TransportClient for ChannelClient {
    fn publish(&self, channel: &str, payload: String) {
        let message = HubMessage {
            channel: channel.into(),
            payload: payload.into(),
        };
        match self.sender.send(message) {
            Ok(receivers) => debug!(channel, receivers, "Published to channel hub"),
            Err(_) => debug!(channel, "Published to channel hub (no receivers)"),
        }
    }

    fn subscribe(&self, channel: &str) {
        self.subscribe_commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(channel.to_string());
        self.subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(channel.into());
    }

    fn quit(&self) {
        self.shutdown.notify_one();
    }
}

/// Deliver hub traffic on subscribed channels until shutdown.
async fn forward(
    mut receiver: broadcast::Receiver<HubMessage>,
    subscriptions: Arc<RwLock<HashSet<Arc<str>>>>,
    shutdown: Arc<Notify>,
    events: EventSender,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            received = receiver.recv() => match received {
                Ok(message) => {
                    let subscribed = subscriptions
                        .read()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .contains(&message.channel);
                    if subscribed {
                        let _ = events.send(TransportEvent::Message {
                            channel: message.channel.to_string(),
                            payload: message.payload.to_string(),
                        });
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Channel hub client lagged, skipped messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    let _ = events.send(TransportEvent::End);
}
