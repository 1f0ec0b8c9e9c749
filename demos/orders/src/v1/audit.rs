//! Audit event module - logs every new order
use plinth_sdk::{BizContext, EventModule};
use tracing::info;

use super::{CREATED_TOPIC, PUBSUB};
use crate::store::Order;

pub struct AuditModule;

impl AuditModule {
    pub fn body(self) -> EventModule {
        EventModule::new(PUBSUB)
            .subscribe_json(CREATED_TOPIC, |ctx: BizContext, order: Order| async move {
                info!("Audit: user {} placed order {} ({} x {})", ctx.uid(), order.id,
                      order.quantity, order.item);
                Ok(())
            })
    }
}
