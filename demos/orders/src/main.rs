//! Demo 'main' for a Plinth process
//! Serves an order book with invocation, event, delay event and health
//! modules over the in-memory sidecar

use anyhow::Result;
use config::{Config, Environment, File};
use plinth_sdk::config::{get_section, get_sub_config};
use plinth_sdk::{Api, BizContext};
use plinth_server::{InMemoryDelayQueue, InMemoryQueueConfig, InMemorySidecar, Server};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

mod store;
mod v1;

/// App id of this process
const APP: &str = "orders";

/// Standard main
#[tokio::main]
pub async fn main() -> Result<()> {

    // Initialise tracing
    tracing_subscriber::fmt::init();

    info!("Plinth - orders demo process");

    // Read the config
    let config = Arc::new(Config::builder()
        .add_source(File::with_name("orders"))
        .add_source(Environment::with_prefix("PLINTH").separator("__"))
        .build()?);

    // Collaborators
    let sidecar = Arc::new(InMemorySidecar::new(&get_sub_config(&config, "sidecar")?));
    let queue_config: InMemoryQueueConfig = get_section(&config, "delay-queue")?;
    let delay_queue = Arc::new(InMemoryDelayQueue::new(queue_config));

    // Create the server, placing a test order once it is up
    let driver_sidecar = sidecar.clone();
    let mut server = Server::create(APP, config.clone(), sidecar)?
        .with_delay_queue(delay_queue.clone())
        .hook_pre_start(move || {
            let sidecar = driver_sidecar.clone();
            async move {
                tokio::spawn(place_test_order(sidecar));
                Ok(())
            }
        });

    // Register modules
    v1::register(&mut server, &config, delay_queue)?;

    // Run it
    server.run().await?;

    // Bye!
    info!("Exiting");
    Ok(())
}

/// Call our own create handler through the sidecar
async fn place_test_order(sidecar: Arc<InMemorySidecar>) {
    tokio::time::sleep(Duration::from_millis(100)).await;

    let api = Api::new(&BizContext::new().with_tenant(1).with_user(42), sidecar);
    let request = v1::CreateOrder { item: "widget".to_string(), quantity: 3 };
    match api.invoke_json::<_, store::Order>(APP, 1, "order", "create", &request).await {
        Ok(order) => info!("Placed order {} for {} x {}", order.id, order.quantity, order.item),
        Err(e) => error!("Test order failed: {e:#}"),
    }
}
