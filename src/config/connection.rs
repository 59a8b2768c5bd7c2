//! Transport connection configuration types.
//!
//! Connection options arrive loosely shaped (a URL, discrete host fields, or
//! a list of cluster nodes) and are resolved once, before anything is opened,
//! into a [`ResolvedOptions`] that the transport backends consume.

use serde::{Deserialize, Deserializer};

/// Default Redis port when neither the URL nor the options carry one.
pub const DEFAULT_PORT: u16 = 6379;

const NODES_NOT_A_LIST: &str = "nodes must be a list of connection parameters for cluster";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing option 'host' for redis connection")]
    MissingHost,

    #[error("Option {0}")]
    InvalidNodes(&'static str),

    #[error("Invalid connection url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Address of a single cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Raw connection options as supplied by configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Connection URL (e.g., redis://:secret@cache:6380/2). Overrides the
    /// discrete host/port/credential fields when present.
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: Option<i64>,
    /// Static cluster node list. When present the connection runs in
    /// clustered mode.
    #[serde(deserialize_with = "deserialize_nodes")]
    pub nodes: Option<Vec<NodeAddress>>,
}

fn deserialize_nodes<'de, D>(deserializer: D) -> Result<Option<Vec<NodeAddress>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Vec<NodeAddress>>::deserialize(deserializer)
        .map_err(|e| serde::de::Error::custom(format!("{}: {}", NODES_NOT_A_LIST, e)))
}

/// A single fully specified endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: i64,
}

/// Validated connection options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedOptions {
    /// One server.
    Single(Endpoint),
    /// Statically listed cluster nodes sharing credentials.
    Cluster {
        nodes: Vec<NodeAddress>,
        username: Option<String>,
        password: Option<String>,
    },
}

impl ResolvedOptions {
    pub fn is_cluster(&self) -> bool {
        matches!(self, Self::Cluster { .. })
    }
}

impl ConnectionOptions {
    /// Single node options from a URL.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Clustered options from a node list.
    pub fn cluster(nodes: Vec<NodeAddress>) -> Self {
        Self {
            nodes: Some(nodes),
            ..Default::default()
        }
    }

    /// Validate and normalize the options.
    ///
    /// A URL is decomposed into host, port, credentials and database, taking
    /// precedence over the discrete fields. A node list selects clustered
    /// mode and must be non-empty.
    pub fn resolve(&self) -> Result<ResolvedOptions, ConfigError> {
        let mut normalized = self.clone();
        if let Some(url) = &self.url {
            normalized.apply_url(url)?;
        }

        if let Some(nodes) = normalized.nodes {
            if nodes.is_empty() {
                return Err(ConfigError::InvalidNodes(NODES_NOT_A_LIST));
            }
            return Ok(ResolvedOptions::Cluster {
                nodes,
                username: normalized.username,
                password: normalized.password,
            });
        }

        let host = normalized
            .host
            .filter(|h| !h.is_empty())
            .ok_or(ConfigError::MissingHost)?;

        Ok(ResolvedOptions::Single(Endpoint {
            host,
            port: normalized.port.unwrap_or(DEFAULT_PORT),
            username: normalized.username,
            password: normalized.password,
            db: normalized.db.unwrap_or(0),
        }))
    }

    fn apply_url(&mut self, raw: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason,
        };

        let parsed = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("no host".to_string()))?;

        self.host = Some(host.to_string());
        self.port = Some(parsed.port().unwrap_or(DEFAULT_PORT));
        self.username = Some(parsed.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        self.password = parsed.password().map(str::to_string);

        let db = parsed.path().trim_start_matches('/');
        if !db.is_empty() {
            let db = db
                .parse()
                .map_err(|_| invalid(format!("database '{}' is not a number", db)))?;
            self.db = Some(db);
        }
        Ok(())
    }
}
