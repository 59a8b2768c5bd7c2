//! Cluster topics.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed set of logical channels shared by every cluster member.
///
/// Each topic has a stable numeric code. The code is what goes on the wire
/// inside messages, and its decimal form names the transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Topic {
    Connection,
    Auth,
    Event,
    Record,
    Rpc,
    Presence,
    Monitoring,
    Cluster,
    Lock,
    // State registry topics keep cross-server subscription bookkeeping in
    // sync and live in their own code range.
    RecordSubscriptions,
    EventSubscriptions,
    RpcSubscriptions,
    PresenceSubscriptions,
    OnlineUsers,
    EventListenPatterns,
    RecordListenPatterns,
}

/// Error for codes or names that are not a known topic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown topic '{0}'")]
pub struct UnknownTopic(pub String);

impl Topic {
    pub const ALL: [Topic; 16] = [
        Topic::Connection,
        Topic::Auth,
        Topic::Event,
        Topic::Record,
        Topic::Rpc,
        Topic::Presence,
        Topic::Monitoring,
        Topic::Cluster,
        Topic::Lock,
        Topic::RecordSubscriptions,
        Topic::EventSubscriptions,
        Topic::RpcSubscriptions,
        Topic::PresenceSubscriptions,
        Topic::OnlineUsers,
        Topic::EventListenPatterns,
        Topic::RecordListenPatterns,
    ];

    pub fn code(self) -> u32 {
        match self {
            Topic::Connection => 0,
            Topic::Auth => 1,
            Topic::Event => 2,
            Topic::Record => 3,
            Topic::Rpc => 4,
            Topic::Presence => 5,
            Topic::Monitoring => 6,
            Topic::Cluster => 7,
            Topic::Lock => 8,
            Topic::RecordSubscriptions => 100,
            Topic::EventSubscriptions => 101,
            Topic::RpcSubscriptions => 102,
            Topic::PresenceSubscriptions => 103,
            Topic::OnlineUsers => 104,
            Topic::EventListenPatterns => 105,
            Topic::RecordListenPatterns => 106,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|topic| topic.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            Topic::Connection => "connection",
            Topic::Auth => "auth",
            Topic::Event => "event",
            Topic::Record => "record",
            Topic::Rpc => "rpc",
            Topic::Presence => "presence",
            Topic::Monitoring => "monitoring",
            Topic::Cluster => "cluster",
            Topic::Lock => "lock",
            Topic::RecordSubscriptions => "record_subscriptions",
            Topic::EventSubscriptions => "event_subscriptions",
            Topic::RpcSubscriptions => "rpc_subscriptions",
            Topic::PresenceSubscriptions => "presence_subscriptions",
            Topic::OnlineUsers => "online_users",
            Topic::EventListenPatterns => "event_listen_patterns",
            Topic::RecordListenPatterns => "record_listen_patterns",
        }
    }

    /// Transport channel carrying this topic.
    pub fn channel(self) -> String {
        self.code().to_string()
    }
}

impl From<Topic> for u32 {
    fn from(topic: Topic) -> Self {
        topic.code()
    }
}

impl TryFrom<u32> for Topic {
    type Error = UnknownTopic;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| UnknownTopic(code.to_string()))
    }
}

impl FromStr for Topic {
    type Err = UnknownTopic;

    /// Accepts a topic name or its numeric code.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(code) = s.parse::<u32>() {
            return Self::try_from(code);
        }
        Self::ALL
            .into_iter()
            .find(|topic| topic.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownTopic(s.to_string()))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
