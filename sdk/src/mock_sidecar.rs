//! Mock sidecar for tests - records everything and routes calls locally
use anyhow::{anyhow, Result};
use futures::future::{ready, BoxFuture};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{EventError, EventResult, ReplyError};
use crate::sidecar::{Content, HealthProbe, InvocationEvent, InvocationService, Sidecar,
                     Subscription, TopicEvent, TopicService};

pub struct PublishRecord {
    pub pubsub: String,
    pub topic: String,
    pub data: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

pub struct InvokeRecord {
    pub app: String,
    pub method: String,
    pub event: InvocationEvent,
}

pub struct MockSidecar {
    pub invocation_handlers: Arc<Mutex<HashMap<String, Arc<InvocationService>>>>,
    pub topic_handlers: Arc<Mutex<Vec<(Subscription, Arc<TopicService>)>>>,
    pub health_checks: Arc<Mutex<Vec<Arc<HealthProbe>>>>,
    pub publishes: Arc<Mutex<Vec<PublishRecord>>>,
    pub invokes: Arc<Mutex<Vec<InvokeRecord>>>,
    pub starts: Arc<Mutex<u16>>,              // just count them
    pub shutdowns: Arc<Mutex<u16>>,
}

impl MockSidecar {
    pub fn new() -> Self {
        Self {
            invocation_handlers: Arc::new(Mutex::new(HashMap::new())),
            topic_handlers: Arc::new(Mutex::new(Vec::new())),
            health_checks: Arc::new(Mutex::new(Vec::new())),
            publishes: Arc::new(Mutex::new(Vec::new())),
            invokes: Arc::new(Mutex::new(Vec::new())),
            starts: Arc::new(Mutex::new(0)),
            shutdowns: Arc::new(Mutex::new(0)),
        }
    }

    /// Registered invocation addresses, sorted
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.invocation_handlers.lock().keys().cloned().collect();
        methods.sort();
        methods
    }

    /// Registered subscriptions, in order
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.topic_handlers.lock().iter().map(|(s, _)| s.clone()).collect()
    }

    /// Deliver a message to the handler subscribed to a topic, as the
    /// substrate would
    pub async fn deliver(&self, pubsub: &str, topic: &str, data: &[u8]) -> EventResult {
        let service = self.topic_handlers.lock().iter()
            .find(|(s, _)| s.pubsub_name == pubsub && s.topic == topic)
            .map(|(_, service)| service.clone())
            .ok_or_else(|| EventError::discard(anyhow!("no subscription for {pubsub}/{topic}")))?;

        service(TopicEvent {
            pubsub: pubsub.to_string(),
            topic: topic.to_string(),
            data: data.to_vec(),
            ..TopicEvent::default()
        }).await
    }

    /// Run the installed health probe, if any
    pub async fn check_health(&self) -> Result<()> {
        let probe = self.health_checks.lock().last().cloned()
            .ok_or_else(|| anyhow!("no health check installed"))?;
        probe().await
    }
}

impl Default for MockSidecar {
    fn default() -> Self {
        Self::new()
    }
}

impl Sidecar for MockSidecar {

    fn add_invocation_handler(&self, method: &str, service: Arc<InvocationService>)
                              -> Result<()> {
        debug!("Mock invocation handler {method}");
        self.invocation_handlers.lock().insert(method.to_string(), service);
        Ok(())
    }

    fn add_topic_handler(&self, subscription: Subscription, service: Arc<TopicService>)
                         -> Result<()> {
        debug!("Mock subscribe on {}/{}", subscription.pubsub_name, subscription.topic);
        self.topic_handlers.lock().push((subscription, service));
        Ok(())
    }

    fn add_health_check(&self, probe: Arc<HealthProbe>) -> Result<()> {
        self.health_checks.lock().push(probe);
        Ok(())
    }

    /// Record, then route to a locally registered handler of the same method
    fn invoke(&self, app: &str, method: &str, event: InvocationEvent)
              -> BoxFuture<'static, Result<Content, ReplyError>> {
        debug!("Mock invoke {app} {method}");
        self.invokes.lock().push(InvokeRecord {
            app: app.to_string(),
            method: method.to_string(),
            event: event.clone(),
        });

        let service = self.invocation_handlers.lock().get(method).cloned();
        match service {
            Some(service) => service(event),
            None => Box::pin(ready(Err::<Content, _>(ReplyError::Internal(
                format!("no handler for {method}"))))),
        }
    }

    fn publish(&self, pubsub: &str, topic: &str, data: Vec<u8>,
               metadata: HashMap<String, String>) -> BoxFuture<'static, Result<()>> {
        debug!("Mock publish on {pubsub}/{topic}");
        self.publishes.lock().push(PublishRecord {
            pubsub: pubsub.to_string(),
            topic: topic.to_string(),
            data,
            metadata,
        });
        Box::pin(ready(Ok::<(), anyhow::Error>(())))
    }

    fn start(&self) -> BoxFuture<'static, Result<()>> {
        *self.starts.lock() += 1;
        Box::pin(ready(Ok::<(), anyhow::Error>(())))
    }

    fn shutdown(&self) -> BoxFuture<'static, Result<()>> {
        *self.shutdowns.lock() += 1;
        Box::pin(ready(Ok::<(), anyhow::Error>(())))
    }
}
