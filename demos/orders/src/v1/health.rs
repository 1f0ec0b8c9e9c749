//! Health module - unhealthy once the order book is full
use anyhow::bail;
use plinth_sdk::HealthModule;

use crate::store::OrderBook;

pub struct BookHealthModule {
    pub book: OrderBook,
    pub max_orders: usize,
}

impl BookHealthModule {
    pub fn body(self) -> HealthModule {
        let Self { book, max_orders } = self;
        HealthModule::new(move || {
            let held = book.len();
            async move {
                if held > max_orders {
                    bail!("order book full: {held} orders");
                }
                Ok(())
            }
        })
    }
}
