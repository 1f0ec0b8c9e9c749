//! Order invocation module: create, get and pay
use anyhow::Result;
use plinth_sdk::{Api, BizContext, BizError, DelayQueue, InvocationModule, Sidecar};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{CreateOrder, CREATED_TOPIC, EXPIRE_TOPIC, PUBSUB};
use crate::store::{Order, OrderBook, OrderStatus};

/// Business error codes
pub const NOT_FOUND: i32 = 404;
pub const NOT_PENDING: i32 = 409;
pub const BAD_QUANTITY: i32 = 422;

#[derive(Debug, Deserialize)]
pub struct OrderId {
    pub id: u64,
}

pub struct OrderModule {
    pub book: OrderBook,
    pub sidecar: Arc<dyn Sidecar>,
    pub delay_queue: Arc<dyn DelayQueue>,
    pub expire_after: Duration,
}

impl OrderModule {
    pub fn body(self) -> InvocationModule {
        let Self { book, sidecar, delay_queue, expire_after } = self;
        let (get_book, pay_book) = (book.clone(), book.clone());

        InvocationModule::new()
            .handle_json("create", move |ctx: BizContext, request: CreateOrder| {
                let (book, sidecar, delay_queue) =
                    (book.clone(), sidecar.clone(), delay_queue.clone());
                async move {
                    if request.quantity == 0 {
                        return Err(anyhow::Error::new(
                            BizError::new(BAD_QUANTITY, "quantity must be positive")));
                    }

                    let order = book.create(ctx.tid(), &request.item, request.quantity);
                    info!("Created order {} for tenant {}", order.id, order.tenant);

                    Api::new(&ctx, sidecar)
                        .publish(PUBSUB, CREATED_TOPIC, &order, false)
                        .await?;
                    delay_queue
                        .publish(EXPIRE_TOPIC, order.id.to_string().into_bytes(), expire_after)
                        .await?;
                    Ok::<_, anyhow::Error>(order)
                }
            })
            .handle_json("get", move |_ctx: BizContext, request: OrderId| {
                let order = find(&get_book, request.id);
                async move { order }
            })
            .handle_json("pay", move |_ctx: BizContext, request: OrderId| {
                let order = pay(&pay_book, request.id);
                async move { order }
            })
    }
}

fn find(book: &OrderBook, id: u64) -> Result<Order> {
    book.get(id)
        .ok_or_else(|| BizError::new(NOT_FOUND, format!("no order {id}")).into())
}

fn pay(book: &OrderBook, id: u64) -> Result<Order> {
    match book.settle(id, OrderStatus::Paid) {
        Some(OrderStatus::Pending) => find(book, id),
        Some(status) => Err(BizError::new(NOT_PENDING,
                                          format!("order {id} is {status:?}")).into()),
        None => find(book, id),
    }
}
