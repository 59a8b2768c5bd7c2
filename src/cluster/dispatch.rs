//! Topic to listener dispatch.
//!
//! Provides the dispatch table the router fans inbound messages out through.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tracing::error;

use super::{Message, Topic};

/// Error type listeners report failures with.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives messages for the topics it was subscribed to.
pub trait Listener: Send + Sync {
    /// Handle a message sent by `origin`.
    fn on_message(&self, message: &Message, origin: &str) -> Result<(), ListenerError>;
}

impl<F> Listener for F
where
    F: Fn(&Message, &str) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_message(&self, message: &Message, origin: &str) -> Result<(), ListenerError> {
        self(message, origin)
    }
}

/// Outcome of registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First listener for the topic; the transport channel needs subscribing.
    FirstForTopic,
    /// Added next to existing listeners.
    Added,
    /// The same listener was already registered for the topic.
    Duplicate,
}

/// Result of dispatching one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Nobody listens on the message topic.
    NoListeners,
    /// Every listener ran; `failed` of them returned an error or panicked.
    Delivered { succeeded: usize, failed: usize },
}

/// Mapping from topic to a set of listeners.
///
/// Listener identity is the `Arc` allocation: registering the same `Arc`
/// twice for one topic is a no-op.
#[derive(Default)]
pub struct DispatchTable {
    listeners: RwLock<HashMap<Topic, Vec<Arc<dyn Listener>>>>,
}

fn same_listener(a: &Arc<dyn Listener>, b: &Arc<dyn Listener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, topic: Topic, listener: Arc<dyn Listener>) -> Registration {
        let mut table = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let listeners = table.entry(topic).or_default();

        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return Registration::Duplicate;
        }
        listeners.push(listener);

        if listeners.len() == 1 {
            Registration::FirstForTopic
        } else {
            Registration::Added
        }
    }

    pub fn listener_count(&self, topic: Topic) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&topic)
            .map_or(0, Vec::len)
    }

    /// Topics with at least one listener.
    pub fn topics(&self) -> Vec<Topic> {
        let table = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut topics: Vec<Topic> = table
            .iter()
            .filter(|(_, listeners)| !listeners.is_empty())
            .map(|(topic, _)| *topic)
            .collect();
        topics.sort();
        topics
    }

    /// Invoke every listener registered for the message topic.
    ///
    /// Each listener runs in isolation: an error or a panic is logged and
    /// the remaining listeners still run. The table lock is not held while
    /// listeners run, so they may register further listeners.
    pub fn dispatch(&self, message: &Message, origin: &str) -> DispatchResult {
        let listeners: Vec<Arc<dyn Listener>> = {
            let table = self
                .listeners
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match table.get(&message.topic) {
                Some(listeners) if !listeners.is_empty() => listeners.clone(),
                _ => return DispatchResult::NoListeners,
            }
        };

        let mut failed = 0;
        for listener in &listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_message(message, origin))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(topic = %message.topic, origin, error = %e, "Listener failed");
                    failed += 1;
                }
                Err(_panic) => {
                    error!(topic = %message.topic, origin, "Listener panicked");
                    failed += 1;
                }
            }
        }

        DispatchResult::Delivered {
            succeeded: listeners.len() - failed,
            failed,
        }
    }
}
