//! Substrate traits: the invocation / pub-sub sidecar and the delay queue
use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{EventResult, ReplyError};
use crate::meta::Metadata;

/// Content type of every invocation reply
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Subscription metadata key marking a raw (non-envelope) payload
pub const META_RAW_PAYLOAD: &str = "rawPayload";

/// Inbound invocation
#[derive(Debug, Clone, Default)]
pub struct InvocationEvent {
    pub data: Vec<u8>,
    pub content_type: String,
    pub data_type_url: String,
    pub metadata: Metadata,
}

impl InvocationEvent {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            content_type: CONTENT_TYPE_JSON.to_string(),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Invocation reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Content {
    pub content_type: String,
    pub data: Vec<u8>,
    pub data_type_url: String,
}

/// Inbound pub-sub message
#[derive(Debug, Clone, Default)]
pub struct TopicEvent {
    pub pubsub: String,
    pub topic: String,
    pub data: Vec<u8>,
    pub metadata: Metadata,
}

/// A topic subscription as handed to the sidecar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub pubsub_name: String,
    pub topic: String,
    pub metadata: HashMap<String, String>,
}

impl Subscription {
    pub fn new(pubsub_name: &str, topic: &str, raw_payload: bool) -> Self {
        let mut metadata = HashMap::new();
        if raw_payload {
            metadata.insert(META_RAW_PAYLOAD.to_string(), "true".to_string());
        }
        Self {
            pubsub_name: pubsub_name.to_string(),
            topic: topic.to_string(),
            metadata,
        }
    }

    pub fn is_raw(&self) -> bool {
        self.metadata.get(META_RAW_PAYLOAD).is_some_and(|v| v == "true")
    }
}

/// Invocation service function type
pub type InvocationService = dyn Fn(InvocationEvent) ->
    BoxFuture<'static, Result<Content, ReplyError>> + Send + Sync + 'static;

/// Topic service function type - `Err` with retry asks for redelivery
pub type TopicService = dyn Fn(TopicEvent) ->
    BoxFuture<'static, EventResult> + Send + Sync + 'static;

/// Health probe function type
pub type HealthProbe = dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static;

/// Invocation and pub-sub substrate
pub trait Sidecar: Send + Sync {

    /// Route calls to `method` to the service - note sync
    fn add_invocation_handler(&self, method: &str, service: Arc<InvocationService>)
                              -> Result<()>;

    /// Deliver messages matching the subscription to the service
    fn add_topic_handler(&self, subscription: Subscription, service: Arc<TopicService>)
                         -> Result<()>;

    /// Install the health probe
    fn add_health_check(&self, probe: Arc<HealthProbe>) -> Result<()>;

    /// Call a method on another app
    fn invoke(&self, app: &str, method: &str, event: InvocationEvent)
              -> BoxFuture<'static, Result<Content, ReplyError>>;

    /// Publish to a topic
    fn publish(&self, pubsub: &str, topic: &str, data: Vec<u8>,
               metadata: HashMap<String, String>) -> BoxFuture<'static, Result<()>>;

    /// Start serving
    fn start(&self) -> BoxFuture<'static, Result<()>>;

    /// Shut down
    fn shutdown(&self) -> BoxFuture<'static, Result<()>>;
}

/// Settles a delay-queue message
pub trait Acknowledger: Send {
    fn ack(self: Box<Self>) -> Result<()>;
    fn nack(self: Box<Self>) -> Result<()>;
}

/// Message delivered by a delay queue, to be acked or nacked exactly once
pub struct QueueMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl QueueMessage {
    pub fn new(topic: &str, payload: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
        Self { topic: topic.to_string(), payload, acker }
    }

    /// Consumed - remove from the queue
    pub fn ack(self) -> Result<()> {
        self.acker.ack()
    }

    /// Not consumed - return to the queue for redelivery
    pub fn nack(self) -> Result<()> {
        self.acker.nack()
    }
}

impl std::fmt::Debug for QueueMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMessage")
            .field("topic", &self.topic)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Deferred, redeliverable message queue
#[async_trait]
pub trait DelayQueue: Send + Sync {

    /// Receive messages for a topic until the token is cancelled
    async fn subscribe(&self, subscriber: &str, topic: &str, token: CancellationToken)
                       -> Result<mpsc::Receiver<QueueMessage>>;

    /// Make a message visible after `delay`
    async fn publish(&self, topic: &str, payload: Vec<u8>, delay: Duration) -> Result<()>;
}

// -- Tests --
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_subscription_carries_metadata() {
        let raw = Subscription::new("orders", "created", true);
        assert_eq!(raw.metadata.get("rawPayload").map(String::as_str), Some("true"));
        assert!(raw.is_raw());

        let wrapped = Subscription::new("orders", "created", false);
        assert!(wrapped.metadata.is_empty());
        assert!(!wrapped.is_raw());
    }
}
