//! Expiry delay event module - expires orders left unpaid
use anyhow::anyhow;
use plinth_sdk::{BackoffConfig, DelayEventModule, EventError};
use tracing::info;

use super::EXPIRE_TOPIC;
use crate::store::{OrderBook, OrderStatus};

pub struct ExpiryModule {
    pub book: OrderBook,
}

impl ExpiryModule {
    pub fn body(self, backoff: BackoffConfig) -> DelayEventModule {
        let book = self.book;
        DelayEventModule::new()
            .with_backoff(backoff)
            .handle(EXPIRE_TOPIC, move |data| {
                let outcome = expire(&book, &data);
                async move { outcome }
            })
    }
}

fn expire(book: &OrderBook, data: &[u8]) -> Result<(), EventError> {
    let id: u64 = std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| EventError::discard(anyhow!("bad order id {:?}", data)))?;

    match book.settle(id, OrderStatus::Expired) {
        Some(OrderStatus::Pending) => {
            info!("Order {id} expired unpaid");
            Ok(())
        }
        Some(_) => Ok(()),

        // Not visible yet - try again later
        None => Err(EventError::retry(anyhow!("unknown order {id}"))),
    }
}

// -- Tests --
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_only_pending_orders() {
        let book = OrderBook::new();
        let pending = book.create(1, "widget", 1);
        let paid = book.create(1, "gadget", 1);
        book.settle(paid.id, OrderStatus::Paid);

        expire(&book, pending.id.to_string().as_bytes()).unwrap();
        expire(&book, paid.id.to_string().as_bytes()).unwrap();

        assert_eq!(book.get(pending.id).unwrap().status, OrderStatus::Expired);
        assert_eq!(book.get(paid.id).unwrap().status, OrderStatus::Paid);
    }

    #[test]
    fn unknown_orders_retry_and_garbage_is_dropped() {
        let book = OrderBook::new();
        assert!(expire(&book, b"42").unwrap_err().retry);
        assert!(!expire(&book, b"not a number").unwrap_err().retry);
    }
}
