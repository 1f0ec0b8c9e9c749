//! In-memory order book shared by the demo modules
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub tenant: i64,
    pub item: String,
    pub quantity: u32,
    pub status: OrderStatus,
}

#[derive(Default)]
struct Book {
    next_id: u64,
    orders: HashMap<u64, Order>,
}

#[derive(Clone, Default)]
pub struct OrderBook {
    book: Arc<Mutex<Book>>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, tenant: i64, item: &str, quantity: u32) -> Order {
        let mut book = self.book.lock();
        book.next_id += 1;
        let order = Order {
            id: book.next_id,
            tenant,
            item: item.to_string(),
            quantity,
            status: OrderStatus::Pending,
        };
        book.orders.insert(order.id, order.clone());
        order
    }

    pub fn get(&self, id: u64) -> Option<Order> {
        self.book.lock().orders.get(&id).cloned()
    }

    /// Move a pending order to `status`; returns the previous status
    pub fn settle(&self, id: u64, status: OrderStatus) -> Option<OrderStatus> {
        let mut book = self.book.lock();
        let order = book.orders.get_mut(&id)?;
        let previous = order.status;
        if previous == OrderStatus::Pending {
            order.status = status;
        }
        Some(previous)
    }

    pub fn len(&self) -> usize {
        self.book.lock().orders.len()
    }
}

// -- Tests --
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pending_orders_settle() {
        let book = OrderBook::new();
        let order = book.create(1, "widget", 2);
        assert_eq!(order.id, 1);

        assert_eq!(book.settle(order.id, OrderStatus::Paid), Some(OrderStatus::Pending));
        assert_eq!(book.settle(order.id, OrderStatus::Expired), Some(OrderStatus::Paid));
        assert_eq!(book.get(order.id).unwrap().status, OrderStatus::Paid);
        assert_eq!(book.settle(99, OrderStatus::Paid), None);
    }
}
