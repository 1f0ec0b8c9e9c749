//! Delay-event modules and the per-topic consumer loop with backoff retry
use futures::future::{BoxFuture, Future, FutureExt};
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffConfig, BackoffPolicy};
use crate::error::{panic_message, EventResult};
use crate::payload::preview;
use crate::sidecar::QueueMessage;

/// Delay-event handler function type - takes the message body
pub type DelayEventFunction = dyn Fn(Vec<u8>) ->
    BoxFuture<'static, EventResult> + Send + Sync + 'static;

/// Handler for one delay queue topic
#[derive(Clone)]
pub struct DelayEventHandler {
    topic: String,
    function: Arc<DelayEventFunction>,
}

impl DelayEventHandler {
    pub fn new<F, Fut>(topic: &str, function: F) -> Self
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EventResult> + Send + 'static,
    {
        Self {
            topic: topic.to_string(),
            function: Arc::new(move |data| Box::pin(function(data))),
        }
    }

    pub fn topic(&self) -> &str { &self.topic }
}

/// Bundle of delay-event handlers sharing one backoff configuration
#[derive(Clone, Default)]
pub struct DelayEventModule {
    backoff: BackoffConfig,
    handlers: Vec<DelayEventHandler>,
}

impl DelayEventModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn add(mut self, handler: DelayEventHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn handle<F, Fut>(self, topic: &str, function: F) -> Self
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EventResult> + Send + 'static,
    {
        self.add(DelayEventHandler::new(topic, function))
    }

    pub fn backoff(&self) -> &BackoffConfig { &self.backoff }
    pub fn handlers(&self) -> &[DelayEventHandler] { &self.handlers }
}

/// Long-running consumer for one topic.  Owns its backoff policy.
pub struct DelayEventConsumer {
    app: String,
    topic: String,
    function: Arc<DelayEventFunction>,
    policy: Box<dyn BackoffPolicy>,
}

impl DelayEventConsumer {
    pub fn new(app: &str, handler: &DelayEventHandler, policy: Box<dyn BackoffPolicy>) -> Self {
        Self {
            app: app.to_string(),
            topic: handler.topic.clone(),
            function: handler.function.clone(),
            policy,
        }
    }

    pub fn topic(&self) -> &str { &self.topic }

    /// Consume until the token is cancelled or the queue closes.  A panic
    /// ends this consumer only.
    pub async fn run(self, receiver: mpsc::Receiver<QueueMessage>, token: CancellationToken) {
        let app = self.app.clone();
        let topic = self.topic.clone();

        if let Err(panic) = AssertUnwindSafe(self.consume(receiver, token))
            .catch_unwind()
            .await
        {
            error!(app = %app, topic = %topic,
                   "Delay event consumer panicked: {}\n{}",
                   panic_message(panic.as_ref()), Backtrace::force_capture());
        }
    }

    async fn consume(mut self, mut receiver: mpsc::Receiver<QueueMessage>,
                     token: CancellationToken) {
        info!(app = %self.app, topic = %self.topic, "Delay event consumer started");

        loop {
            let message = tokio::select! {
                _ = token.cancelled() => break,
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let handled = (self.function)(message.payload.clone());
            let result = handled.await;

            let err = match result {
                Ok(()) => {
                    self.ack(message);
                    continue;
                }
                Err(err) => err,
            };

            if !err.retry {
                error!(app = %self.app, topic = %self.topic,
                       message = %preview(&message.payload),
                       "Delay event dropped: {err}");
                self.ack(message);
                continue;
            }

            match self.policy.next_backoff() {
                None => {
                    error!(app = %self.app, topic = %self.topic,
                           message = %preview(&message.payload),
                           "Delay event dropped after retries: {err}");
                    self.ack(message);
                    self.policy.reset();
                }
                Some(delay) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            // Left unsettled for the queue to redeliver
                            debug!(topic = %self.topic, "Shutdown during backoff");
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    warn!(app = %self.app, topic = %self.topic,
                          "Delay event failed, retrying after {delay:?}: {err}");
                    if let Err(e) = message.nack() {
                        error!(topic = %self.topic, "Failed to nack message: {e}");
                    }
                }
            }
        }

        info!(app = %self.app, topic = %self.topic, "Delay event consumer stopped");
    }

    /// Settle as consumed
    fn ack(&self, message: QueueMessage) {
        if let Err(e) = message.ack() {
            error!(topic = %self.topic, "Failed to ack message: {e}");
        }
    }
}

// -- Tests --
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EventError;
    use crate::sidecar::Acknowledger;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records settlements; a nack puts the message straight back
    #[derive(Clone, Default)]
    struct Tally {
        acks: Arc<AtomicUsize>,
        nacks: Arc<AtomicUsize>,
    }

    struct TestAcker {
        tally: Tally,
        payload: Vec<u8>,
        redeliver: mpsc::Sender<QueueMessage>,
    }

    impl TestAcker {
        fn message(tally: &Tally, payload: &[u8], redeliver: &mpsc::Sender<QueueMessage>)
                   -> QueueMessage {
            QueueMessage::new("expire", payload.to_vec(), Box::new(TestAcker {
                tally: tally.clone(),
                payload: payload.to_vec(),
                redeliver: redeliver.clone(),
            }))
        }
    }

    impl Acknowledger for TestAcker {
        fn ack(self: Box<Self>) -> anyhow::Result<()> {
            self.tally.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn nack(self: Box<Self>) -> anyhow::Result<()> {
            self.tally.nacks.fetch_add(1, Ordering::SeqCst);
            let again = TestAcker::message(&self.tally, &self.payload, &self.redeliver);
            self.redeliver.try_send(again).map_err(|e| anyhow!("{e}"))
        }
    }

    struct Setup {
        tally: Tally,
        calls: Arc<AtomicUsize>,
        sender: mpsc::Sender<QueueMessage>,
        token: CancellationToken,
        consumer: tokio::task::JoinHandle<()>,
    }

    fn start(retry: bool) -> Setup {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = DelayEventHandler::new("expire", move |_data| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(EventError::new(retry, anyhow!("not yet"))) }
        });

        let policy = BackoffConfig::default().with_max_retries(3).build().unwrap();
        let consumer = DelayEventConsumer::new("shop", &handler, Box::new(policy));
        let (sender, receiver) = mpsc::channel(16);
        let token = CancellationToken::new();
        let consumer = tokio::spawn(consumer.run(receiver, token.clone()));

        Setup { tally: Tally::default(), calls, sender, token, consumer }
    }

    async fn wait_for_acks(tally: &Tally, n: usize) {
        while tally.acks.load(Ordering::SeqCst) < n {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_runs_max_retries_plus_one() {
        let setup = start(true);
        setup.sender.send(TestAcker::message(&setup.tally, b"order-1", &setup.sender))
            .await.unwrap();

        wait_for_acks(&setup.tally, 1).await;
        assert_eq!(setup.calls.load(Ordering::SeqCst), 4);
        assert_eq!(setup.tally.nacks.load(Ordering::SeqCst), 3);

        // Budget restored for the next message
        setup.sender.send(TestAcker::message(&setup.tally, b"order-2", &setup.sender))
            .await.unwrap();
        wait_for_acks(&setup.tally, 2).await;
        assert_eq!(setup.calls.load(Ordering::SeqCst), 8);

        setup.token.cancel();
        setup.consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn successes_do_not_extend_retries_of_failing_message() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = DelayEventHandler::new("expire", move |data| {
            let failing = data == b"unpaid";
            if failing {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            async move {
                if failing {
                    Err(EventError::retry(anyhow!("not yet")))
                } else {
                    Ok(())
                }
            }
        });

        let policy = BackoffConfig::default().with_max_retries(3).build().unwrap();
        let consumer = DelayEventConsumer::new("shop", &handler, Box::new(policy));
        let (sender, receiver) = mpsc::channel(16);
        let token = CancellationToken::new();
        let task = tokio::spawn(consumer.run(receiver, token.clone()));

        let tally = Tally::default();
        sender.send(TestAcker::message(&tally, b"unpaid", &sender)).await.unwrap();
        for _ in 0..8 {
            sender.send(TestAcker::message(&tally, b"paid", &sender)).await.unwrap();
        }

        // Eight successes plus the dropped failure
        wait_for_acks(&tally, 9).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(tally.nacks.load(Ordering::SeqCst), 3);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_runs_once() {
        let setup = start(false);
        setup.sender.send(TestAcker::message(&setup.tally, b"order-1", &setup.sender))
            .await.unwrap();

        wait_for_acks(&setup.tally, 1).await;
        assert_eq!(setup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(setup.tally.nacks.load(Ordering::SeqCst), 0);

        setup.token.cancel();
        setup.consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_backoff_leaves_message_unsettled() {
        let setup = start(true);
        setup.sender.send(TestAcker::message(&setup.tally, b"order-1", &setup.sender))
            .await.unwrap();

        // Consumer is now in its first 3s backoff
        tokio::time::sleep(Duration::from_millis(10)).await;
        setup.token.cancel();
        setup.consumer.await.unwrap();

        assert_eq!(setup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(setup.tally.acks.load(Ordering::SeqCst), 0);
        assert_eq!(setup.tally.nacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_acks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = DelayEventHandler::new("expire", move |data| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                assert_eq!(data, b"order-1");
                Ok(())
            }
        });
        let consumer = DelayEventConsumer::new("shop", &handler,
                                               Box::new(BackoffConfig::default().build().unwrap()));
        let (sender, receiver) = mpsc::channel(4);
        let token = CancellationToken::new();
        let task = tokio::spawn(consumer.run(receiver, token.clone()));

        let tally = Tally::default();
        sender.send(TestAcker::message(&tally, b"order-1", &sender)).await.unwrap();
        wait_for_acks(&tally, 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Closing the queue also ends the consumer
        drop(sender);
        task.await.unwrap();
    }
}
