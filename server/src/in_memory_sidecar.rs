// In-memory sidecar with multi-threaded async pub-sub workers
use anyhow::{anyhow, Result};
use config::Config;
use futures::future::{ready, BoxFuture};
use parking_lot::RwLock;
use plinth_sdk::error::ReplyError;
use plinth_sdk::sidecar::{Content, HealthProbe, InvocationEvent, InvocationService, Sidecar,
                          Subscription, TopicEvent, TopicService};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_WORKERS: i64 = 4;
const DEFAULT_REDELIVERIES: i64 = 3;

type SubscriberMap = HashMap<(String, String), Vec<Arc<TopicService>>>;

pub struct InMemorySidecar {

    // Invocation services by canonical address
    invocation_handlers: Arc<RwLock<HashMap<String, Arc<InvocationService>>>>,

    // Topic services by (pubsub, topic)
    subscribers: Arc<RwLock<SubscriberMap>>,

    health_check: RwLock<Option<Arc<HealthProbe>>>,

    // Sender for published messages
    sender: mpsc::Sender<TopicEvent>,

    started: AtomicBool,
    token: CancellationToken,
}

impl InMemorySidecar {
    pub fn new(config: &Config) -> Self {
        let num_workers = config.get_int("workers")
            .unwrap_or(DEFAULT_WORKERS)
            .max(1) as usize;
        let redeliveries = config.get_int("redeliveries")
            .unwrap_or(DEFAULT_REDELIVERIES)
            .max(0) as u32;

        let (sender, mut receiver) = mpsc::channel::<TopicEvent>(100);

        info!("Creating in-memory sidecar with {num_workers} workers, \
               {redeliveries} redeliveries");

        let subscribers: Arc<RwLock<SubscriberMap>> = Arc::new(RwLock::new(HashMap::new()));
        let token = CancellationToken::new();

        // Create a task queue channel for each worker
        let mut worker_txs = Vec::new();
        for _ in 0..num_workers {
            let (worker_tx, mut worker_rx) =
                mpsc::channel::<(Arc<TopicService>, TopicEvent)>(100);
            worker_txs.push(worker_tx);

            // Spawn worker tasks that handle individual deliveries
            tokio::spawn(async move {
                while let Some((service, event)) = worker_rx.recv().await {
                    deliver(service, event, redeliveries).await;
                }
            });
        }

        // Single receiver task to fan messages out to workers
        let subs_clone = subscribers.clone();
        let dispatch_token = token.clone();
        tokio::spawn(async move {
            let mut round_robin_index = 0;

            loop {
                let event = tokio::select! {
                    _ = dispatch_token.cancelled() => break,
                    event = receiver.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                // Copy out the services so the lock isn't held over sends
                let services = subs_clone.read()
                    .get(&(event.pubsub.clone(), event.topic.clone()))
                    .cloned()
                    .unwrap_or_default();
                if services.is_empty() {
                    debug!("No subscribers for {}/{}", event.pubsub, event.topic);
                }

                // For each subscriber, dispatch the delivery to a worker
                for service in services {
                    let worker_tx = &worker_txs[round_robin_index % num_workers];
                    if let Err(e) = worker_tx.send((service, event.clone())).await {
                        error!("Failed to send message to worker: {}", e);
                    }
                    round_robin_index += 1;
                }
            }
        });

        InMemorySidecar {
            invocation_handlers: Arc::new(RwLock::new(HashMap::new())),
            subscribers,
            health_check: RwLock::new(None),
            sender,
            started: AtomicBool::new(false),
            token,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Run the installed health probe
    pub async fn check_health(&self) -> Result<()> {
        let probe = self.health_check.read().clone();
        match probe {
            Some(probe) => probe().await,
            None => Err(anyhow!("No health check installed")),
        }
    }
}

/// Run one delivery, redelivering retryable failures up to `redeliveries`
/// more times
async fn deliver(service: Arc<TopicService>, event: TopicEvent, redeliveries: u32) {
    let mut attempt = 0;
    loop {
        match service(event.clone()).await {
            Ok(()) => return,
            Err(e) if e.retry && attempt < redeliveries => {
                attempt += 1;
                warn!("Redelivering {}/{} (attempt {attempt}): {e}", event.pubsub, event.topic);
            }
            Err(e) => {
                if e.retry {
                    error!("Giving up on {}/{} after {attempt} redeliveries: {e}",
                           event.pubsub, event.topic);
                }
                return;
            }
        }
    }
}

impl Sidecar for InMemorySidecar {

    fn add_invocation_handler(&self, method: &str, service: Arc<InvocationService>)
                              -> Result<()> {
        let mut handlers = self.invocation_handlers.write();
        if handlers.contains_key(method) {
            return Err(anyhow!("Invocation handler for {method} already added"));
        }
        handlers.insert(method.to_string(), service);
        Ok(())
    }

    fn add_topic_handler(&self, subscription: Subscription, service: Arc<TopicService>)
                         -> Result<()> {
        self.subscribers.write()
            .entry((subscription.pubsub_name, subscription.topic))
            .or_default()
            .push(service);
        Ok(())
    }

    fn add_health_check(&self, probe: Arc<HealthProbe>) -> Result<()> {
        *self.health_check.write() = Some(probe);
        Ok(())
    }

    /// Exact-address routing to a local handler; `app` is informational
    fn invoke(&self, app: &str, method: &str, event: InvocationEvent)
              -> BoxFuture<'static, Result<Content, ReplyError>> {
        let service = self.invocation_handlers.read().get(method).cloned();
        match service {
            Some(service) => service(event),
            None => {
                let message = format!("No handler for {app} {method}");
                Box::pin(ready(Err::<Content, _>(ReplyError::Internal(message))))
            }
        }
    }

    /// Publish a message on a given topic
    fn publish(&self, pubsub: &str, topic: &str, data: Vec<u8>,
               metadata: HashMap<String, String>) -> BoxFuture<'static, Result<()>> {
        let sender = self.sender.clone();
        let event = TopicEvent {
            pubsub: pubsub.to_string(),
            topic: topic.to_string(),
            data,
            metadata: metadata.into_iter().map(|(k, v)| (k, vec![v])).collect(),
        };

        Box::pin(async move {
            sender.send(event).await?;
            Ok::<(), anyhow::Error>(())
        })
    }

    fn start(&self) -> BoxFuture<'static, Result<()>> {
        self.started.store(true, Ordering::SeqCst);
        let handlers = self.invocation_handlers.read().len();
        let topics = self.subscribers.read().len();
        Box::pin(async move {
            info!("In-memory sidecar serving {handlers} methods, {topics} topics");
            Ok(())
        })
    }

    /// Shut down, stopping workers and clearing all handlers
    fn shutdown(&self) -> BoxFuture<'static, Result<()>> {
        self.started.store(false, Ordering::SeqCst);
        self.token.cancel();
        self.subscribers.write().clear();
        self.invocation_handlers.write().clear();
        Box::pin(ready(Ok::<(), anyhow::Error>(())))
    }
}

// -- Tests --
#[cfg(test)]
mod tests {
    use super::*;
    use plinth_sdk::error::EventError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tracing::Level;

    fn setup(config_str: &str) -> InMemorySidecar {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_test_writer()
            .try_init();

        let config = Config::builder()
            .add_source(config::File::from_str(config_str, config::FileFormat::Toml))
            .build()
            .unwrap();
        InMemorySidecar::new(&config)
    }

    fn counting(counter: Arc<AtomicUsize>, retry: bool) -> Arc<TopicService> {
        Arc::new(move |_event: TopicEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(ready(Err::<(), _>(EventError::new(retry, anyhow!("failed")))))
        })
    }

    async fn wait_for(counter: &AtomicUsize, n: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn invoke_routes_by_exact_address() {
        let sidecar = setup("");
        let service: Arc<InvocationService> = Arc::new(|event: InvocationEvent| {
            Box::pin(ready(Ok::<_, ReplyError>(Content { data: event.data, ..Content::default() })))
        });
        sidecar.add_invocation_handler("v1:order:create", service.clone()).unwrap();
        assert!(sidecar.add_invocation_handler("v1:order:create", service).is_err());

        let reply = sidecar.invoke("shop", "v1:order:create", InvocationEvent::new(b"x".to_vec()))
            .await.unwrap();
        assert_eq!(reply.data, b"x");

        assert!(sidecar.invoke("shop", "v1:order:Create", InvocationEvent::default())
                .await.is_err());
    }

    #[tokio::test]
    async fn retryable_failures_redelivered() {
        let sidecar = setup("redeliveries = 2");
        let calls = Arc::new(AtomicUsize::new(0));
        sidecar.add_topic_handler(Subscription::new("orders", "created", false),
                                  counting(calls.clone(), true)).unwrap();

        sidecar.publish("orders", "created", b"{}".to_vec(), HashMap::new()).await.unwrap();
        wait_for(&calls, 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_failures_delivered_once() {
        let sidecar = setup("");
        let calls = Arc::new(AtomicUsize::new(0));
        sidecar.add_topic_handler(Subscription::new("orders", "created", false),
                                  counting(calls.clone(), false)).unwrap();

        sidecar.publish("orders", "created", b"{}".to_vec(), HashMap::new()).await.unwrap();
        wait_for(&calls, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delivery_is_by_pubsub_and_topic() {
        let sidecar = setup("workers = 2");
        let orders = Arc::new(AtomicUsize::new(0));
        let payments = Arc::new(AtomicUsize::new(0));
        sidecar.add_topic_handler(Subscription::new("orders", "created", false),
                                  counting(orders.clone(), false)).unwrap();
        sidecar.add_topic_handler(Subscription::new("payments", "created", false),
                                  counting(payments.clone(), false)).unwrap();

        sidecar.publish("payments", "created", vec![], HashMap::new()).await.unwrap();
        wait_for(&payments, 1).await;
        assert_eq!(payments.load(Ordering::SeqCst), 1);
        assert_eq!(orders.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn health_and_lifecycle() {
        let sidecar = setup("");
        assert!(sidecar.check_health().await.is_err());
        sidecar.add_health_check(Arc::new(|| {
            Box::pin(ready(Ok::<(), anyhow::Error>(())))
        })).unwrap();
        assert!(sidecar.check_health().await.is_ok());

        sidecar.start().await.unwrap();
        assert!(sidecar.is_started());
        sidecar.shutdown().await.unwrap();
        assert!(!sidecar.is_started());
    }
}
