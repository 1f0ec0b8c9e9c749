//! Event modules and the dispatcher which runs their handlers under an ack
//! deadline
use anyhow::anyhow;
use futures::future::{BoxFuture, Future, FutureExt};
use serde::de::DeserializeOwned;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, warn};

use crate::context::BizContext;
use crate::error::{panic_message, EventError, EventResult, SdkError};
use crate::module::ModuleInfo;
use crate::payload::preview;
use crate::sidecar::{TopicEvent, TopicService};

/// Default time an event handler may run before the message is given up on.
/// Just inside the common 30 minute broker ack deadline.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(29 * 60);

/// Event handler function type - takes context and message body
pub type EventFunction = dyn Fn(BizContext, Vec<u8>) ->
    BoxFuture<'static, EventResult> + Send + Sync + 'static;

/// Handler for one topic
#[derive(Clone)]
pub struct EventHandler {
    topic: String,
    function: Arc<EventFunction>,
}

impl EventHandler {
    pub fn new<F, Fut>(topic: &str, function: F) -> Self
    where
        F: Fn(BizContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EventResult> + Send + 'static,
    {
        Self {
            topic: topic.to_string(),
            function: Arc::new(move |ctx, data| Box::pin(function(ctx, data))),
        }
    }

    pub fn topic(&self) -> &str { &self.topic }
}

/// Bundle of topic handlers on one pubsub
#[derive(Clone)]
pub struct EventModule {
    pubsub: String,
    ack_timeout: Duration,
    raw_payload: bool,
    handlers: Vec<EventHandler>,
}

impl EventModule {
    pub fn new(pubsub: &str) -> Self {
        Self {
            pubsub: pubsub.to_string(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            raw_payload: false,
            handlers: Vec::new(),
        }
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    /// Ask the sidecar for the bare message body rather than an envelope
    pub fn with_raw_payload(mut self, raw_payload: bool) -> Self {
        self.raw_payload = raw_payload;
        self
    }

    pub fn add(mut self, handler: EventHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Add a handler on raw message bytes
    pub fn subscribe<F, Fut>(self, topic: &str, function: F) -> Self
    where
        F: Fn(BizContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EventResult> + Send + 'static,
    {
        self.add(EventHandler::new(topic, function))
    }

    /// Add a handler on a JSON message.  Undecodable messages are dropped.
    pub fn subscribe_json<T, F, Fut>(self, topic: &str, function: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(BizContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EventResult> + Send + 'static,
    {
        let function = Arc::new(function);
        self.subscribe(topic, move |ctx, data| {
            let function = function.clone();
            async move {
                let message: T = serde_json::from_slice(&data)
                    .map_err(EventError::discard)?;
                function(ctx, message).await
            }
        })
    }

    pub fn pubsub(&self) -> &str { &self.pubsub }
    pub fn ack_timeout(&self) -> Duration { self.ack_timeout }
    pub fn raw_payload(&self) -> bool { self.raw_payload }
    pub fn handlers(&self) -> &[EventHandler] { &self.handlers }
}

/// Runs one topic handler per message, racing it against the ack timeout
pub struct EventDispatcher {
    app: String,
    module: String,
    topic: String,
    ack_timeout: Duration,
    function: Arc<EventFunction>,
}

impl EventDispatcher {
    pub fn new(app: &str, info: &ModuleInfo, module: &EventModule, handler: &EventHandler)
               -> Self {
        Self {
            app: app.to_string(),
            module: info.name.clone(),
            topic: handler.topic.clone(),
            ack_timeout: module.ack_timeout,
            function: handler.function.clone(),
        }
    }

    /// Handle one message.  On timeout the handler task is abandoned and
    /// whatever it later produces is discarded.
    pub async fn dispatch(&self, event: TopicEvent) -> EventResult {
        let ctx = BizContext::from_metadata(&event.metadata);
        let function = self.function.clone();
        let data = event.data.clone();
        let app = self.app.clone();
        let topic = self.topic.clone();

        let (sender, receiver) = oneshot::channel();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(async move { function(ctx, data).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(app = %app, topic = %topic,
                           "Panic in event handler: {message}\n{}",
                           Backtrace::force_capture());
                    Err(EventError::discard(SdkError::Panic(message)))
                }
            };

            // Receiver gone means we timed out
            let _ = sender.send(result);
        });

        match tokio::time::timeout(self.ack_timeout, receiver).await {
            Err(_) => {
                warn!(app = %self.app, module = %self.module, topic = %self.topic,
                      message = %preview(&event.data),
                      "Event handler not finished within {:?}, giving up", self.ack_timeout);
                Err(EventError::discard(SdkError::AckTimeout(self.ack_timeout)))
            }
            Ok(Ok(result)) => {
                if let Err(e) = &result {
                    error!(app = %self.app, module = %self.module, topic = %self.topic,
                           retry = e.retry, message = %preview(&event.data),
                           "Event handler failed: {e}");
                }
                result
            }
            Ok(Err(_)) => Err(EventError::discard(
                anyhow!("event handler task ended without a result"))),
        }
    }

    /// Wrap as a sidecar service
    pub fn into_service(self) -> Arc<TopicService> {
        let dispatcher = Arc::new(self);
        Arc::new(move |event: TopicEvent| {
            let dispatcher = dispatcher.clone();
            Box::pin(async move { dispatcher.dispatch(event).await })
        })
    }
}

// -- Tests --
#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn dispatcher(module: &EventModule) -> EventDispatcher {
        EventDispatcher::new("shop", &ModuleInfo::new(1, "audit"), module, &module.handlers()[0])
    }

    fn event(data: &[u8]) -> TopicEvent {
        TopicEvent {
            pubsub: "orders".to_string(),
            topic: "created".to_string(),
            data: data.to_vec(),
            ..TopicEvent::default()
        }
    }

    #[test]
    fn defaults() {
        let module = EventModule::new("orders");
        assert_eq!(module.ack_timeout(), Duration::from_secs(1740));
        assert!(!module.raw_payload());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out_without_retry() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let module = EventModule::new("orders")
            .with_ack_timeout(Duration::from_secs(1))
            .subscribe("created", move |_ctx, _data| {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            });

        let err = dispatcher(&module).dispatch(event(b"{}")).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.retry);
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn handler_result_returned_exactly() {
        let module = EventModule::new("orders")
            .with_ack_timeout(Duration::from_secs(5))
            .subscribe("created", |_ctx, _data| async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Err(EventError::retry(anyhow!("downstream busy")))
            });

        let err = dispatcher(&module).dispatch(event(b"{}")).await.unwrap_err();
        assert!(err.retry);
        assert!(!err.is_timeout());

        let module = EventModule::new("orders")
            .subscribe("created", |_ctx, _data| async move { Ok(()) });
        assert!(dispatcher(&module).dispatch(event(b"{}")).await.is_ok());
    }

    #[tokio::test]
    async fn panic_becomes_non_retryable_error() {
        let module = EventModule::new("orders")
            .subscribe("created", |_ctx, data| async move {
                if data.is_empty() {
                    panic!("no body");
                }
                Ok(())
            });
        let service = dispatcher(&module).into_service();

        let err = service(event(b"")).await.unwrap_err();
        assert!(!err.retry);
        assert!(format!("{err}").contains("no body"));

        // Still usable
        assert!(service(event(b"x")).await.is_ok());
    }

    #[derive(Deserialize)]
    struct Created {
        id: u64,
    }

    #[tokio::test]
    async fn json_handler_drops_bad_messages() {
        let module = EventModule::new("orders")
            .subscribe_json("created", |_ctx, msg: Created| async move {
                if msg.id == 0 {
                    Err(EventError::retry(anyhow!("id not allocated yet")))
                } else {
                    Ok(())
                }
            });
        let dispatcher = dispatcher(&module);

        assert!(dispatcher.dispatch(event(br#"{"id":1}"#)).await.is_ok());
        assert!(dispatcher.dispatch(event(br#"{"id":0}"#)).await.unwrap_err().retry);
        assert!(!dispatcher.dispatch(event(b"garbage")).await.unwrap_err().retry);
    }
}
