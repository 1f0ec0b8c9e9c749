//! Plinth server process
//! Attaches registered modules to the sidecar and delay queue, and runs them

use anyhow::{bail, Context as _, Result};
use config::Config;
use futures::future::{BoxFuture, Future};
use plinth_sdk::config::get_section;
use plinth_sdk::health;
use plinth_sdk::namespace;
use plinth_sdk::{DelayEventConsumer, DelayEventModule, DelayQueue, EventDispatcher,
                 EventModule, HealthModule, InvocationDispatcher, InvocationModule, Module,
                 ModuleRegistry, Registry, SdkError, Sidecar, Subscription};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod in_memory_sidecar;
pub use in_memory_sidecar::InMemorySidecar;

mod in_memory_queue;
pub use in_memory_queue::{InMemoryDelayQueue, InMemoryQueueConfig, QueueStats};

mod routes;
pub use routes::{gateway_register, load_routes, ExposedHandler, RegisterFunction,
                 UpdateRouteRequest};

/// Lifecycle hook function type
pub type Hook = dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static;

fn default_gateway_app() -> String {
    "gateway".to_string()
}

const fn default_stop_timeout() -> f64 {
    10.0
}

/// `[server]` configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// JSON route table announced to the gateway when no handlers are given
    #[serde(default)]
    pub route_file: Option<PathBuf>,

    #[serde(default = "default_gateway_app")]
    pub gateway_app: String,

    /// How long to wait for delay-event consumers on stop
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            route_file: None,
            gateway_app: default_gateway_app(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

/// Main Server structure
pub struct Server {
    /// App id
    app: String,

    /// Global configuration
    config: Arc<Config>,
    server_config: ServerConfig,

    /// Collaborators
    sidecar: Arc<dyn Sidecar>,
    delay_queue: Option<Arc<dyn DelayQueue>>,

    /// Registered modules
    registry: Registry,

    register_function: Option<Arc<RegisterFunction>>,
    exposed_handlers: Vec<ExposedHandler>,

    pre_start: Vec<Arc<Hook>>,
    pre_stop: Vec<Arc<Hook>>,

    /// Stops delay-event consumers
    shutdown: CancellationToken,
    consumers: Vec<JoinHandle<()>>,

    stop_timeout: Duration,
    init_state: InitState,
}

/// Initialisation is one-shot: a failure leaves the server unusable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    Pending,
    Done,
    Failed,
}

impl Server {
    /// Create a server for an app with the given config and sidecar
    pub fn create(app: &str, config: Arc<Config>, sidecar: Arc<dyn Sidecar>) -> Result<Self> {
        let server_config = get_section::<ServerConfig>(&config, "server")?;
        let stop_timeout = Duration::try_from_secs_f64(server_config.stop_timeout_secs)
            .map_err(|e| SdkError::InvalidConfig(
                format!("stop-timeout-secs {}: {e}", server_config.stop_timeout_secs)))?;

        Ok(Self {
            app: app.to_string(),
            config,
            server_config,
            sidecar,
            delay_queue: None,
            registry: Registry::new(),
            register_function: None,
            exposed_handlers: Vec::new(),
            pre_start: Vec::new(),
            pre_stop: Vec::new(),
            shutdown: CancellationToken::new(),
            consumers: Vec::new(),
            stop_timeout,
            init_state: InitState::Pending,
        })
    }

    pub fn with_delay_queue(mut self, delay_queue: Arc<dyn DelayQueue>) -> Self {
        self.delay_queue = Some(delay_queue);
        self
    }

    /// Replace the default gateway registration
    pub fn with_register_function(mut self, register_function: Arc<RegisterFunction>) -> Self {
        self.register_function = Some(register_function);
        self
    }

    pub fn with_exposed_handlers(mut self, handlers: Vec<ExposedHandler>) -> Self {
        self.exposed_handlers = handlers;
        self
    }

    /// Run before anything is announced or served; an error aborts start
    pub fn hook_pre_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.pre_start.push(Arc::new(move || Box::pin(hook())));
        self
    }

    /// Run first thing on stop; errors are logged
    pub fn hook_pre_stop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.pre_stop.push(Arc::new(move || Box::pin(hook())));
        self
    }

    pub fn app(&self) -> &str { &self.app }
    pub fn config(&self) -> Arc<Config> { self.config.clone() }
    pub fn sidecar(&self) -> Arc<dyn Sidecar> { self.sidecar.clone() }
    pub fn registry(&self) -> &Registry { &self.registry }

    /// Freeze the registry and attach every module.  Called by start() if
    /// not called before.  After a failure the sidecar may be partly wired,
    /// so later calls fail too.
    pub async fn initialize(&mut self) -> Result<()> {
        match self.init_state {
            InitState::Done => return Ok(()),
            InitState::Failed => bail!("{} already failed to initialise", self.app),
            InitState::Pending => {}
        }
        info!("Initialising {}...", self.app);
        self.init_state = InitState::Failed;
        self.registry.freeze();

        self.add_health_check().context("adding health check handler")?;
        self.add_event_handlers().context("adding event handlers")?;
        self.subscribe_delay_events().await.context("subscribing delay events")?;
        self.add_invocation_handlers().context("adding invocation handlers")?;

        self.init_state = InitState::Done;
        Ok(())
    }

    fn add_health_check(&self) -> Result<()> {
        let probe = health::aggregate(self.registry.get::<HealthModule>());
        self.sidecar.add_health_check(probe)
    }

    fn add_event_handlers(&self) -> Result<()> {
        for module in self.registry.get::<EventModule>() {
            let pubsub = namespace::encapsulate(module.pubsub());
            for handler in module.handlers() {
                let subscription = Subscription::new(&pubsub, handler.topic(),
                                                     module.raw_payload());
                debug!("Subscribing {}/{} for module {}", pubsub, handler.topic(),
                       module.info().name);
                let dispatcher = EventDispatcher::new(module.app(), module.info(), &module,
                                                      handler);
                self.sidecar.add_topic_handler(subscription, dispatcher.into_service())?;
            }
        }
        Ok(())
    }

    async fn subscribe_delay_events(&mut self) -> Result<()> {
        let mut consumers = Vec::new();
        for module in self.registry.get::<DelayEventModule>() {
            for handler in module.handlers() {
                let policy = module.backoff().build()
                    .with_context(|| format!("backoff for delay topic {}", handler.topic()))?;
                consumers.push(DelayEventConsumer::new(module.app(), handler, Box::new(policy)));
            }
        }

        if consumers.is_empty() {
            return Ok(());
        }

        // The app id names the queue subscriber
        if self.app.is_empty() {
            return Err(SdkError::MissingCollaborator("app id").into());
        }
        let delay_queue = self.delay_queue.clone()
            .ok_or(SdkError::MissingCollaborator("delay queue"))?;

        for consumer in consumers {
            let topic = consumer.topic().to_string();
            let receiver = delay_queue
                .subscribe(&self.app, &topic, self.shutdown.child_token())
                .await
                .with_context(|| format!("subscribing topic {topic}"))?;

            debug!("Subscribed delay event topic {topic}");
            self.consumers.push(tokio::spawn(consumer.run(receiver, self.shutdown.clone())));
        }
        Ok(())
    }

    fn add_invocation_handlers(&self) -> Result<()> {
        for module in self.registry.get::<InvocationModule>() {
            for handler in module.handlers() {
                let dispatcher = InvocationDispatcher::new(module.app(), module.info(), handler);
                let address = dispatcher.address()?;
                debug!("Adding invocation handler {address}");
                self.sidecar.add_invocation_handler(&address, dispatcher.into_service())?;
            }
        }
        Ok(())
    }

    /// Handlers to announce: those given, else the route file's
    fn exposed_handlers(&self) -> Vec<ExposedHandler> {
        if !self.exposed_handlers.is_empty() {
            return self.exposed_handlers.clone();
        }

        match &self.server_config.route_file {
            Some(path) => load_routes(path).unwrap_or_else(|e| {
                warn!("Can't load exposed handlers: {e:#}");
                Vec::new()
            }),
            None => Vec::new(),
        }
    }

    /// Run pre-start hooks, announce exposed handlers and start serving
    pub async fn start(&mut self) -> Result<()> {
        self.initialize().await?;

        for hook in &self.pre_start {
            hook().await.context("pre-start hook")?;
        }

        let register = self.register_function.clone()
            .unwrap_or_else(|| gateway_register(&self.server_config.gateway_app));
        register(self.sidecar.clone(), self.app.clone(), self.exposed_handlers())
            .await
            .context("registering app")?;

        self.sidecar.start().await?;
        info!("Running...");
        Ok(())
    }

    /// Run pre-stop hooks, then stop consumers and the sidecar
    pub async fn stop(&mut self) -> Result<()> {
        for hook in &self.pre_stop {
            if let Err(e) = hook().await {
                error!("Pre-stop hook failed: {e:#}");
            }
        }

        self.shutdown.cancel();

        if let Err(e) = self.sidecar.shutdown().await {
            error!("Sidecar shutdown failed: {e:#}");
        }

        let timeout = self.stop_timeout;
        for consumer in self.consumers.drain(..) {
            match tokio::time::timeout(timeout, consumer).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Delay event consumer failed: {e}"),
                Err(_) => warn!("Delay event consumer did not stop within {timeout:?}"),
            }
        }

        Ok(())
    }

    /// Start, wait for SIGTERM or Ctrl-C, then stop
    pub async fn run(mut self) -> Result<()> {
        self.start().await?;

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received. Shutting down..."),
            _ = tokio::signal::ctrl_c() => info!("Interrupted. Shutting down..."),
        }

        self.stop().await
    }
}

/// Module registry implementation
impl ModuleRegistry for Server {
    /// Register a module
    fn register(&mut self, module: Module) -> Result<(), SdkError> {
        info!("Registering {} module {} v{}", module.kind(), module.name(),
              module.info().api_version);
        self.registry.register(module)
    }
}
