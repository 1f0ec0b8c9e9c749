// In-memory delay queue: per-topic backlogs, delayed publish and nack
// redelivery
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use plinth_sdk::sidecar::{Acknowledger, DelayQueue, QueueMessage};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const fn default_capacity() -> usize { 100 }

/// `[delay-queue]` configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InMemoryQueueConfig {
    /// Messages buffered between the queue and each consumer
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Time a nacked message stays invisible before redelivery
    #[serde(default)]
    pub redelivery_delay_ms: u64,
}

impl Default for InMemoryQueueConfig {
    fn default() -> Self {
        Self { capacity: default_capacity(), redelivery_delay_ms: 0 }
    }
}

/// Settlement counters
#[derive(Debug, Default)]
pub struct QueueStats {
    pub published: AtomicU64,
    pub acks: AtomicU64,
    pub nacks: AtomicU64,
}

struct TopicBacklog {
    sender: mpsc::UnboundedSender<Vec<u8>>,

    // Taken while a subscriber is attached
    receiver: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl TopicBacklog {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self { sender, receiver: Some(receiver) }
    }
}

type Topics = Arc<Mutex<HashMap<String, TopicBacklog>>>;

pub struct InMemoryDelayQueue {
    config: InMemoryQueueConfig,
    topics: Topics,
    stats: Arc<QueueStats>,
}

impl InMemoryDelayQueue {
    pub fn new(config: InMemoryQueueConfig) -> Self {
        info!("Creating in-memory delay queue, redelivery delay {}ms",
              config.redelivery_delay_ms);
        Self {
            config,
            topics: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(QueueStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }

    fn backlog_sender(&self, topic: &str) -> mpsc::UnboundedSender<Vec<u8>> {
        self.topics.lock()
            .entry(topic.to_string())
            .or_insert_with(TopicBacklog::new)
            .sender
            .clone()
    }
}

/// Send to a backlog now or after `delay`.  Without a runtime to wait on
/// it goes back immediately.
fn enqueue(backlog: mpsc::UnboundedSender<Vec<u8>>, payload: Vec<u8>, delay: Duration) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) if !delay.is_zero() => {
            runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = backlog.send(payload);
            });
        }
        _ => {
            let _ = backlog.send(payload);
        }
    }
}

/// Settles one delivery.  Dropped unsettled, it returns the message to the
/// backlog like a nack.
struct InMemoryAcker {
    payload: Vec<u8>,
    backlog: mpsc::UnboundedSender<Vec<u8>>,
    redelivery_delay: Duration,
    stats: Arc<QueueStats>,
    settled: bool,
}

impl InMemoryAcker {
    fn requeue(&mut self) {
        enqueue(self.backlog.clone(), std::mem::take(&mut self.payload),
                self.redelivery_delay);
    }
}

impl Acknowledger for InMemoryAcker {
    fn ack(mut self: Box<Self>) -> Result<()> {
        self.settled = true;
        self.stats.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn nack(mut self: Box<Self>) -> Result<()> {
        self.settled = true;
        self.stats.nacks.fetch_add(1, Ordering::SeqCst);
        self.requeue();
        Ok(())
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        if !self.settled {
            debug!("Unsettled message returned to backlog");
            self.requeue();
        }
    }
}

#[async_trait]
impl DelayQueue for InMemoryDelayQueue {

    /// One subscriber per topic.  Cancelling the token detaches it, keeping
    /// undelivered messages for the next subscriber.
    async fn subscribe(&self, subscriber: &str, topic: &str, token: CancellationToken)
                       -> Result<mpsc::Receiver<QueueMessage>> {
        let (backlog, mut backlog_rx) = {
            let mut topics = self.topics.lock();
            let entry = topics.entry(topic.to_string()).or_insert_with(TopicBacklog::new);
            let receiver = entry.receiver.take()
                .ok_or_else(|| anyhow!("Topic {topic} already has a subscriber"))?;
            (entry.sender.clone(), receiver)
        };

        debug!("{subscriber} subscribed to delay topic {topic}");

        let (sender, receiver) = mpsc::channel(self.config.capacity.max(1));
        let topics = self.topics.clone();
        let stats = self.stats.clone();
        let redelivery_delay = Duration::from_millis(self.config.redelivery_delay_ms);
        let topic = topic.to_string();

        tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = token.cancelled() => break,
                    payload = backlog_rx.recv() => match payload {
                        Some(payload) => payload,
                        None => break,
                    },
                };

                let acker = InMemoryAcker {
                    payload: payload.clone(),
                    backlog: backlog.clone(),
                    redelivery_delay,
                    stats: stats.clone(),
                    settled: false,
                };
                let message = QueueMessage::new(&topic, payload, Box::new(acker));

                // An undelivered message goes back to the backlog as it drops
                tokio::select! {
                    _ = token.cancelled() => break,
                    sent = sender.send(message) => if sent.is_err() {
                        break;
                    },
                }
            }

            // Detach, leaving the backlog for a later subscriber
            if let Some(entry) = topics.lock().get_mut(&topic) {
                entry.receiver = Some(backlog_rx);
            }
        });

        Ok(receiver)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, delay: Duration) -> Result<()> {
        self.stats.published.fetch_add(1, Ordering::SeqCst);
        enqueue(self.backlog_sender(topic), payload, delay);
        Ok(())
    }
}

// -- Tests --
#[cfg(test)]
mod tests {
    use super::*;

    fn queue(redelivery_delay_ms: u64) -> InMemoryDelayQueue {
        InMemoryDelayQueue::new(InMemoryQueueConfig { redelivery_delay_ms,
                                                      ..InMemoryQueueConfig::default() })
    }

    #[tokio::test]
    async fn delivers_published_messages() {
        let queue = queue(0);
        queue.publish("expire", b"early".to_vec(), Duration::ZERO).await.unwrap();

        let mut receiver = queue.subscribe("shop", "expire", CancellationToken::new())
            .await.unwrap();
        queue.publish("expire", b"late".to_vec(), Duration::ZERO).await.unwrap();

        let first = receiver.recv().await.unwrap();
        assert_eq!(first.payload, b"early");
        first.ack().unwrap();
        let second = receiver.recv().await.unwrap();
        assert_eq!(second.topic, "expire");
        assert_eq!(second.payload, b"late");
        second.ack().unwrap();

        assert_eq!(queue.stats().acks.load(Ordering::SeqCst), 2);
        assert_eq!(queue.stats().published.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_publish_waits() {
        let queue = queue(0);
        let mut receiver = queue.subscribe("shop", "expire", CancellationToken::new())
            .await.unwrap();
        queue.publish("expire", b"later".to_vec(), Duration::from_secs(30)).await.unwrap();

        let early = tokio::time::timeout(Duration::from_secs(29), receiver.recv()).await;
        assert!(early.is_err());
        let message = receiver.recv().await.unwrap();
        assert_eq!(message.payload, b"later");
    }

    #[tokio::test(start_paused = true)]
    async fn nack_redelivers_after_visibility_delay() {
        let queue = queue(5_000);
        let mut receiver = queue.subscribe("shop", "expire", CancellationToken::new())
            .await.unwrap();
        queue.publish("expire", b"again".to_vec(), Duration::ZERO).await.unwrap();

        receiver.recv().await.unwrap().nack().unwrap();
        let start = tokio::time::Instant::now();
        let again = receiver.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(again.payload, b"again");
        assert_eq!(queue.stats().nacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsettled_message_redelivered_to_next_subscriber() {
        let queue = queue(0);
        let token = CancellationToken::new();
        let mut receiver = queue.subscribe("shop", "expire", token.clone()).await.unwrap();
        queue.publish("expire", b"order-3".to_vec(), Duration::ZERO).await.unwrap();

        // Consumer stops holding the message without settling it
        let message = receiver.recv().await.unwrap();
        drop(message);
        token.cancel();
        drop(receiver);

        let mut receiver = None;
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if let Ok(r) = queue.subscribe("shop", "expire", CancellationToken::new()).await {
                receiver = Some(r);
                break;
            }
        }
        let mut receiver = receiver.expect("topic never detached");

        let again = tokio::time::timeout(Duration::from_millis(500), receiver.recv())
            .await.unwrap().unwrap();
        assert_eq!(again.payload, b"order-3");
        again.ack().unwrap();
        assert_eq!(queue.stats().acks.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().nacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn one_subscriber_per_topic_until_cancelled() {
        let queue = queue(0);
        let token = CancellationToken::new();
        let _receiver = queue.subscribe("shop", "expire", token.clone()).await.unwrap();
        assert!(queue.subscribe("shop", "expire", CancellationToken::new()).await.is_err());

        token.cancel();
        // Let the pump detach
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if queue.subscribe("shop", "expire", CancellationToken::new()).await.is_ok() {
                return;
            }
        }
        panic!("topic never detached");
    }
}
