//! Redis pub/sub transport.
//!
//! Each client is backed by a driver task that owns the Redis connections
//! and executes queued commands in order:
//! - single node: a multiplexed connection for PUBLISH, watched for
//!   disconnection, and a dedicated pub/sub connection, opened on the first
//!   SUBSCRIBE
//! - cluster: a cluster connection for PUBLISH and a pub/sub connection to
//!   the first reachable node (Redis Cluster propagates PUBLISH to every
//!   node, so one node sees all channel traffic)

use futures::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{
    AsyncCommands, AsyncConnectionConfig, Client, ConnectionAddr, ConnectionInfo, PushInfo,
    ProtocolVersion, PushKind, RedisConnectionInfo,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Connector, EventSender, Result, TransportClient, TransportEvent};
use crate::config::{Endpoint, NodeAddress, ResolvedOptions};

/// Opens Redis-backed transport clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisConnector;

impl Connector for RedisConnector {
    fn connect(
        &self,
        options: &ResolvedOptions,
        events: EventSender,
    ) -> Result<Box<dyn TransportClient>> {
        let target = Target::new(options)?;
        let (commands, receiver) = mpsc::unbounded_channel();

        tokio::spawn(drive(target, receiver, events));

        Ok(Box::new(RedisClient { commands }))
    }
}

#[derive(Debug)]
enum Command {
    Publish { channel: String, payload: String },
    Subscribe(String),
    Quit,
}

struct RedisClient {
    commands: mpsc::UnboundedSender<Command>,
}

impl RedisClient {
    fn enqueue(&self, command: Command) {
        if let Err(rejected) = self.commands.send(command) {
            debug!(command = ?rejected.0, "Redis driver stopped, command dropped");
        }
    }
}

impl TransportClient for RedisClient {
    fn publish(&self, channel: &str, payload: String) {
        self.enqueue(Command::Publish {
            channel: channel.to_string(),
            payload,
        });
    }

    fn subscribe(&self, channel: &str) {
        self.enqueue(Command::Subscribe(channel.to_string()));
    }

    fn quit(&self) {
        self.enqueue(Command::Quit);
    }
}

/// Where the driver connects to.
enum Target {
    Single {
        /// RESP3, so the connection can report disconnection.
        publish: Client,
        subscribe: Client,
    },
    Cluster {
        client: ClusterClient,
        nodes: Vec<Client>,
    },
}

impl Target {
    fn new(options: &ResolvedOptions) -> Result<Self> {
        match options {
            ResolvedOptions::Single(endpoint) => {
                let subscribe = endpoint_info(endpoint);
                let mut publish = subscribe.clone();
                publish.redis.protocol = ProtocolVersion::RESP3;
                Ok(Self::Single {
                    publish: Client::open(publish)?,
                    subscribe: Client::open(subscribe)?,
                })
            }
            ResolvedOptions::Cluster {
                nodes,
                username,
                password,
            } => {
                let infos: Vec<ConnectionInfo> = nodes
                    .iter()
                    .map(|node| node_info(node, username, password))
                    .collect();

                let mut builder = ClusterClient::builder(infos.clone());
                if let Some(username) = username {
                    builder = builder.username(username.clone());
                }
                if let Some(password) = password {
                    builder = builder.password(password.clone());
                }

                let nodes = infos
                    .into_iter()
                    .map(Client::open)
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                Ok(Self::Cluster {
                    client: builder.build()?,
                    nodes,
                })
            }
        }
    }

    /// Open the publish connection.
    ///
    /// For a single node the returned receiver yields the connection's push
    /// notifications, including `Disconnection` when the server goes away.
    /// The cluster connection reconnects to nodes on its own and has none.
    async fn publisher(&self) -> Result<(Publisher, Option<mpsc::UnboundedReceiver<PushInfo>>)> {
        match self {
            Self::Single { publish, .. } => {
                let (pushes, received) = mpsc::unbounded_channel();
                let config = AsyncConnectionConfig::new().set_push_sender(pushes);
                let connection = publish
                    .get_multiplexed_async_connection_with_config(&config)
                    .await?;
                Ok((Publisher::Single(connection), Some(received)))
            }
            Self::Cluster { client, .. } => Ok((
                Publisher::Cluster(client.get_async_connection().await?),
                None,
            )),
        }
    }

    async fn pubsub(&self) -> Result<PubSub> {
        match self {
            Self::Single { subscribe, .. } => Ok(subscribe.get_async_pubsub().await?),
            Self::Cluster { nodes, .. } => {
                let mut last_error = None;
                for node in nodes {
                    match node.get_async_pubsub().await {
                        Ok(pubsub) => return Ok(pubsub),
                        Err(e) => {
                            warn!(node = ?node.get_connection_info().addr, error = %e, "Cluster node unreachable for pub/sub");
                            last_error = Some(e);
                        }
                    }
                }
                Err(match last_error {
                    Some(e) => e.into(),
                    None => super::TransportError::Connection("no cluster nodes".to_string()),
                })
            }
        }
    }
}

fn endpoint_info(endpoint: &Endpoint) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(endpoint.host.clone(), endpoint.port),
        redis: RedisConnectionInfo {
            db: endpoint.db,
            username: endpoint.username.clone(),
            password: endpoint.password.clone(),
            ..Default::default()
        },
    }
}

fn node_info(
    node: &NodeAddress,
    username: &Option<String>,
    password: &Option<String>,
) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(node.host.clone(), node.port),
        redis: RedisConnectionInfo {
            username: username.clone(),
            password: password.clone(),
            ..Default::default()
        },
    }
}

enum Publisher {
    Single(MultiplexedConnection),
    Cluster(ClusterConnection),
}

impl Publisher {
    async fn publish(&mut self, channel: &str, payload: String) -> redis::RedisResult<i64> {
        match self {
            Self::Single(conn) => conn.publish(channel, payload).await,
            Self::Cluster(conn) => conn.publish(channel, payload).await,
        }
    }
}

/// Next pub/sub message, or never if nothing is subscribed yet.
async fn next_message(pubsub: &mut Option<PubSub>) -> Option<redis::Msg> {
    match pubsub {
        Some(pubsub) => pubsub.on_message().next().await,
        None => std::future::pending().await,
    }
}

/// Next push notification, or never if the connection has none.
async fn next_push(pushes: &mut Option<mpsc::UnboundedReceiver<PushInfo>>) -> Option<PushInfo> {
    match pushes {
        Some(pushes) => pushes.recv().await,
        None => std::future::pending().await,
    }
}

/// Own the Redis connections and execute commands until quit or failure.
async fn drive(
    target: Target,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: EventSender,
) {
    let (mut publisher, mut pushes) = match target.publisher().await {
        Ok(opened) => opened,
        Err(e) => {
            let _ = events.send(TransportEvent::Error(e.to_string()));
            let _ = events.send(TransportEvent::End);
            return;
        }
    };
    let _ = events.send(TransportEvent::Ready);

    let mut pubsub: Option<PubSub> = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Publish { channel, payload }) => {
                    match publisher.publish(&channel, payload).await {
                        Ok(receivers) => debug!(channel = %channel, receivers, "Published to Redis"),
                        Err(e) => {
                            let _ = events.send(TransportEvent::Error(e.to_string()));
                            break;
                        }
                    }
                }
                Some(Command::Subscribe(channel)) => {
                    if pubsub.is_none() {
                        match target.pubsub().await {
                            Ok(opened) => pubsub = Some(opened),
                            Err(e) => {
                                let _ = events.send(TransportEvent::Error(e.to_string()));
                                break;
                            }
                        }
                    }
                    if let Some(pubsub) = pubsub.as_mut() {
                        if let Err(e) = pubsub.subscribe(channel.as_str()).await {
                            let _ = events.send(TransportEvent::Error(e.to_string()));
                            break;
                        }
                        info!(channel = %channel, "Subscribed to Redis channel");
                    }
                }
                Some(Command::Quit) | None => break,
            },
            push = next_push(&mut pushes) => match push {
                Some(push) if push.kind != PushKind::Disconnection => {
                    debug!(kind = ?push.kind, "Ignoring Redis push notification");
                }
                // Disconnected, or the connection task is gone.
                _ => {
                    let _ = events.send(TransportEvent::Error(
                        "connection to Redis lost".to_string(),
                    ));
                    break;
                }
            },
            message = next_message(&mut pubsub) => match message {
                Some(message) => match message.get_payload::<String>() {
                    Ok(payload) => {
                        let _ = events.send(TransportEvent::Message {
                            channel: message.get_channel_name().to_string(),
                            payload,
                        });
                    }
                    Err(e) => {
                        warn!(channel = %message.get_channel_name(), error = %e, "Non-text payload on Redis channel");
                    }
                },
                None => {
                    let _ = events.send(TransportEvent::Error(
                        "pub/sub connection closed".to_string(),
                    ));
                    break;
                }
            },
        }
    }

    let _ = events.send(TransportEvent::End);
}
