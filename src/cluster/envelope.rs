//! Wire envelope and message payloads.
//!
//! Every transmission is an [`Envelope`] encoded as JSON text:
//!
//! ```text
//! { "fromServer": "s1", "toServer": "s3", "message": { "topic": 2, ... } }
//! ```
//!
//! `toServer` is omitted for broadcasts.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Topic;

/// Errors encoding or decoding envelopes and message bodies.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Message body must be a JSON object")]
    NotAnObject,

    #[error("Unknown message topic {0}")]
    UnknownTopic(u64),
}

/// Body key carrying the topic on the wire.
const TOPIC_KEY: &str = "topic";

/// An application message: a topic plus arbitrary fields.
///
/// The body never holds a `topic` key; the topic is fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub topic: Topic,
    #[serde(flatten)]
    body: Map<String, Value>,
}

impl Message {
    /// An empty message on `topic`.
    pub fn new(topic: Topic) -> Self {
        Self {
            topic,
            body: Map::new(),
        }
    }

    /// Add a field. A `topic` key is ignored.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != TOPIC_KEY {
            self.body.insert(key, value.into());
        }
        self
    }

    /// Build a message from any serializable record. A `topic` field in the
    /// record is replaced by `topic`.
    pub fn from_payload<T: Serialize>(topic: Topic, payload: &T) -> Result<Self, EnvelopeError> {
        match serde_json::to_value(payload).map_err(EnvelopeError::Encode)? {
            Value::Object(mut body) => {
                body.remove(TOPIC_KEY);
                Ok(Self { topic, body })
            }
            _ => Err(EnvelopeError::NotAnObject),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// All fields except the topic.
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Decode the whole record, topic included, into a caller type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        let value = serde_json::to_value(self).map_err(EnvelopeError::Encode)?;
        serde_json::from_value(value).map_err(EnvelopeError::Decode)
    }
}

/// Origin and destination tagging around a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub from_server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_server: Option<String>,
    pub message: Message,
}

#[derive(Deserialize)]
struct TopicOnly {
    message: TopicCode,
}

#[derive(Deserialize)]
struct TopicCode {
    topic: u64,
}

fn unknown_topic_code(text: &str) -> Option<u64> {
    let code = serde_json::from_str::<TopicOnly>(text).ok()?.message.topic;
    let known = u32::try_from(code).ok().and_then(Topic::from_code).is_some();
    (!known).then_some(code)
}

/// Whether an envelope concerns the receiving server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Sent by the receiving server itself.
    SelfEcho,
    /// Directed at a different server.
    OtherServer,
}

impl Envelope {
    pub fn broadcast(from_server: impl Into<String>, message: Message) -> Self {
        Self {
            from_server: from_server.into(),
            to_server: None,
            message,
        }
    }

    pub fn direct(
        from_server: impl Into<String>,
        to_server: impl Into<String>,
        message: Message,
    ) -> Self {
        Self {
            from_server: from_server.into(),
            to_server: Some(to_server.into()),
            message,
        }
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Encode)
    }

    /// Decode envelope text.
    ///
    /// A well-formed envelope whose inner topic code is not a known
    /// [`Topic`] yields `UnknownTopic` rather than `Decode`.
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(text).map_err(|e| match unknown_topic_code(text) {
            Some(code) => EnvelopeError::UnknownTopic(code),
            None => EnvelopeError::Decode(e),
        })
    }

    /// Origin is checked first: a server never reacts to its own messages,
    /// even ones it addressed to itself.
    pub fn admission(&self, server_name: &str) -> Admission {
        if self.from_server == server_name {
            return Admission::SelfEcho;
        }
        match &self.to_server {
            Some(to_server) if to_server != server_name => Admission::OtherServer,
            _ => Admission::Accept,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_broadcast_omits_to_server() {
        let envelope = Envelope::broadcast("s1", Message::new(Topic::Event).with("payload", "hi"));
        let encoded: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();

        assert_eq!(
            encoded,
            json!({ "fromServer": "s1", "message": { "topic": 2, "payload": "hi" } })
        );
    }

    #[test]
    fn test_direct_round_trip() {
        let message = Message::new(Topic::Record)
            .with("name", "users/42")
            .with("version", 7)
            .with("data", json!({ "nested": [1, 2, 3] }));
        let envelope = Envelope::direct("s1", "s3", message);

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.to_server.as_deref(), Some("s3"));
        assert_eq!(decoded.message.topic, Topic::Record);
    }

    #[test]
    fn test_decode_rejects_malformed_text() {
        assert!(matches!(
            Envelope::decode("{not json"),
            Err(EnvelopeError::Decode(_))
        ));
        assert!(Envelope::decode(r#"{"message":{"topic":2}}"#).is_err());
        assert!(Envelope::decode(r#"{"fromServer":"s1","message":{"payload":1}}"#).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_topic() {
        let text = r#"{"fromServer":"s1","message":{"topic":999}}"#;
        assert!(matches!(
            Envelope::decode(text),
            Err(EnvelopeError::UnknownTopic(999))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"message":{"topic":"x"}}"#),
            Err(EnvelopeError::Decode(_))
        ));
    }

    #[test]
    fn test_admission() {
        let broadcast = Envelope::broadcast("s1", Message::new(Topic::Event));
        assert_eq!(broadcast.admission("s1"), Admission::SelfEcho);
        assert_eq!(broadcast.admission("s2"), Admission::Accept);

        let direct = Envelope::direct("s1", "s3", Message::new(Topic::Event));
        assert_eq!(direct.admission("s3"), Admission::Accept);
        assert_eq!(direct.admission("s2"), Admission::OtherServer);

        let to_self = Envelope::direct("s1", "s1", Message::new(Topic::Event));
        assert_eq!(to_self.admission("s1"), Admission::SelfEcho);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct LockRequest {
        name: String,
        ttl_ms: u64,
    }

    #[test]
    fn test_typed_payload() {
        let request = LockRequest {
            name: "jobs".to_string(),
            ttl_ms: 500,
        };
        let message = Message::from_payload(Topic::Lock, &request).unwrap();
        assert_eq!(message.get("name"), Some(&json!("jobs")));

        let decoded: LockRequest = message.decode().unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_topic_field_survives_round_trip() {
        let message = Message::new(Topic::Event)
            .with("topic", "chat")
            .with("payload", "hi");
        let envelope = Envelope::broadcast("s1", message);

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.message.topic, Topic::Event);
        assert_eq!(decoded.message.get("topic"), None);
        assert_eq!(decoded.message.body().len(), 1);
    }

    #[test]
    fn test_non_object_payload_is_rejected() {
        assert!(matches!(
            Message::from_payload(Topic::Lock, &"text"),
            Err(EnvelopeError::NotAnObject)
        ));
    }
}
