//! Mock cluster node implementation for testing.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ClusterNode, DispatchResult, DispatchTable, Envelope, Listener, Message, Topic};
use crate::transport;

/// Mock cluster node for testing components that talk to the cluster.
///
/// Records every envelope sent and lets tests inject inbound messages.
pub struct MockClusterNode {
    server_name: String,
    sent: Mutex<Vec<Envelope>>,
    table: DispatchTable,
}

impl MockClusterNode {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            sent: Mutex::new(Vec::new()),
            table: DispatchTable::new(),
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn take_sent(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(|p| p.into_inner()))
    }

    /// Deliver `message` to local listeners as if `origin` had sent it.
    pub fn inject(&self, message: &Message, origin: &str) -> DispatchResult {
        self.table.dispatch(message, origin)
    }

    fn record(&self, envelope: Envelope) {
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(envelope);
    }
}

#[async_trait]
impl ClusterNode for MockClusterNode {
    async fn when_ready(&self) -> transport::Result<()> {
        Ok(())
    }

    async fn close(&self) -> transport::Result<()> {
        Ok(())
    }

    fn send(&self, message: &Message) {
        self.record(Envelope::broadcast(&self.server_name, message.clone()));
    }

    fn send_direct(&self, to_server: &str, message: &Message) {
        self.record(Envelope::direct(&self.server_name, to_server, message.clone()));
    }

    fn subscribe(&self, topic: Topic, listener: Arc<dyn Listener>) {
        self.table.register(topic, listener);
    }
}
