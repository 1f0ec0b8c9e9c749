//! Version 1 modules of the orders app
use anyhow::Result;
use config::Config;
use plinth_sdk::config::get_section;
use plinth_sdk::{BackoffConfig, DelayQueue, Module, ModuleInfo, ModuleRegistry};
use plinth_server::Server;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::store::OrderBook;

mod audit;
mod expiry;
mod health;
mod order;
mod route;

/// Topic on the `orders` pubsub announcing new orders
pub const CREATED_TOPIC: &str = "created";

/// Delay queue topic for unpaid orders
pub const EXPIRE_TOPIC: &str = "expire";

pub const PUBSUB: &str = "orders";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrder {
    pub item: String,
    pub quantity: u32,
}

const fn default_expire_after_secs() -> u64 { 30 * 60 }
const fn default_max_orders() -> usize { 10_000 }

/// `[orders]` configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OrdersConfig {
    #[serde(default = "default_expire_after_secs")]
    pub expire_after_secs: u64,

    /// Beyond this the app reports unhealthy
    #[serde(default = "default_max_orders")]
    pub max_orders: usize,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self { expire_after_secs: default_expire_after_secs(), max_orders: default_max_orders() }
    }
}

/// Register all v1 modules with the server
pub fn register(server: &mut Server, config: &Config, delay_queue: Arc<dyn DelayQueue>)
                -> Result<()> {
    let orders_config: OrdersConfig = get_section(config, "orders")?;
    let backoff: BackoffConfig = get_section(config, "backoff")?;
    let book = OrderBook::new();
    let app = server.app().to_string();

    let orders = order::OrderModule {
        book: book.clone(),
        sidecar: server.sidecar(),
        delay_queue,
        expire_after: Duration::from_secs(orders_config.expire_after_secs),
    };
    let info = ModuleInfo::of::<order::OrderModule>(module_path!())?;
    server.register(Module::new(&app, info, orders.body()))?;

    let info = ModuleInfo::of::<audit::AuditModule>(module_path!())?;
    server.register(Module::new(&app, info, audit::AuditModule.body()))?;

    let expiry = expiry::ExpiryModule { book: book.clone() };
    let info = ModuleInfo::of::<expiry::ExpiryModule>(module_path!())?;
    server.register(Module::new(&app, info, expiry.body(backoff)))?;

    let health = health::BookHealthModule { book, max_orders: orders_config.max_orders };
    let info = ModuleInfo::of::<health::BookHealthModule>(module_path!())?;
    server.register(Module::new(&app, info, health.body()))?;

    // Local stand-in for the gateway's route update method
    let info = ModuleInfo::of::<route::RouteModule>(module_path!())?;
    server.register(Module::new(&app, info, route::RouteModule.body()))?;
    Ok(())
}
