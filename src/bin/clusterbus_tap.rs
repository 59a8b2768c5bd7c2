//! clusterbus-tap: cluster traffic logger
//!
//! Joins the cluster as its own server and logs every message it is
//! admitted on the configured topics. Useful for debugging and monitoring
//! cluster traffic. Exits with an error if the transport goes away.
//!
//! ## Architecture
//! ```text
//! [server s1] --PUBLISH--> [Redis] --message--> [clusterbus-tap]
//!                                                      |
//!                                                      v
//!                                                   tracing
//! ```
//!
//! ## Configuration
//! - CLUSTERBUS_CONFIG: Path to a YAML config file (optional)
//! - CLUSTERBUS__SERVER_NAME: Identity of the tap (default: random UUID)
//! - CLUSTERBUS__REDIS__URL / CLUSTERBUS__REDIS__HOST: Redis endpoint
//! - `tap.topics` in the config file: topic names to listen on (default: all)

use std::sync::Arc;

use tracing::info;

use clusterbus::cluster::{ClusterNode, ClusterRouter, Listener, ListenerError, Message, Topic};
use clusterbus::config::Config;
use clusterbus::transport::{RedisConnector, TransportError};
use clusterbus::utils::bootstrap::{fatal, init_tracing};

struct TrafficLogger;

impl Listener for TrafficLogger {
    fn on_message(&self, message: &Message, origin: &str) -> Result<(), ListenerError> {
        let body = serde_json::Value::Object(message.body().clone());
        info!(topic = %message.topic, origin, body = %body, "Cluster message");
        Ok(())
    }
}

fn topics(config: &Config) -> Result<Vec<Topic>, Box<dyn std::error::Error>> {
    if config.tap.topics.is_empty() {
        return Ok(Topic::ALL.to_vec());
    }
    let topics = config
        .tap
        .topics
        .iter()
        .map(|name| name.parse::<Topic>())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(topics)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(fatal)?;
    let topics = topics(&config).map_err(fatal)?;

    let router = ClusterRouter::from_config(&RedisConnector, &config).map_err(fatal)?;
    router
        .when_ready_timeout(config.ready_timeout())
        .await
        .map_err(fatal)?;

    let logger: Arc<dyn Listener> = Arc::new(TrafficLogger);
    for topic in &topics {
        router.subscribe(*topic, logger.clone());
    }

    info!(
        server_name = %router.server_name(),
        topics = topics.len(),
        "clusterbus-tap started"
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down");
            router.close().await?;
            Ok(())
        }
        _ = router.terminated() => {
            let error = TransportError::Connection("cluster transport terminated".to_string());
            Err(fatal(error).into())
        }
    }
}
