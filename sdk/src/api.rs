//! Outbound calls from handler code: invoke other apps, publish events
use anyhow::{Context as _, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::BizContext;
use crate::error::BizError;
use crate::naming;
use crate::namespace;
use crate::payload::Payload;
use crate::sidecar::{InvocationEvent, Sidecar, Subscription};

/// Outbound API bound to one request context
pub struct Api {
    ctx: BizContext,
    sidecar: Arc<dyn Sidecar>,
}

impl Api {
    pub fn new(ctx: &BizContext, sidecar: Arc<dyn Sidecar>) -> Self {
        Self { ctx: ctx.clone(), sidecar }
    }

    /// Call `module.handler` on another app with a JSON request, returning
    /// the raw reply.  A business error reply comes back as `BizError`.
    pub async fn invoke<T: Serialize + ?Sized>(&self, app: &str, version: u32, module: &str,
                                              handler: &str, request: &T) -> Result<Vec<u8>> {
        self.invoke_payload(app, version, module, handler, None, Payload::json(request)?).await
    }

    /// As `invoke`, decoding a JSON reply
    pub async fn invoke_json<T, R>(&self, app: &str, version: u32, module: &str,
                                   handler: &str, request: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let reply = self.invoke(app, version, module, handler, request).await?;
        serde_json::from_slice(&reply).context("decoding reply")
    }

    /// Call with an explicit payload and optional origin
    pub async fn invoke_payload(&self, app: &str, version: u32, module: &str, handler: &str,
                                origin: Option<&str>, request: Payload) -> Result<Vec<u8>> {
        let app_id = namespace::encapsulate(app);
        let method = naming::resolve(version, module, handler, origin)?;
        let event = InvocationEvent::new(request.into_bytes()?)
            .with_metadata(self.ctx.to_metadata());

        match self.sidecar.invoke(&app_id, &method, event).await {
            Ok(content) => Ok(content.data),
            Err(reply) => Err(anyhow::Error::new(BizError::from_reply(&reply))
                .context(format!("invoking {app_id} {method}"))),
        }
    }

    /// Publish a JSON message.  `raw_payload` skips the substrate's envelope.
    pub async fn publish<T: Serialize + ?Sized>(&self, pubsub: &str, topic: &str, message: &T,
                                               raw_payload: bool) -> Result<()> {
        let data = serde_json::to_vec(message).context("encoding message")?;
        let metadata = if raw_payload {
            Subscription::new(pubsub, topic, true).metadata
        } else {
            HashMap::new()
        };

        self.sidecar.publish(&namespace::encapsulate(pubsub), topic, data, metadata).await
    }
}

// -- Tests --
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplyError;
    use crate::meta;
    use crate::mock_sidecar::MockSidecar;
    use crate::sidecar::{Content, InvocationService};
    use futures::future::ready;
    use serde_json::json;

    fn setup() -> (Arc<MockSidecar>, Api) {
        let mock = Arc::new(MockSidecar::new());
        let ctx = BizContext::new().with_tenant(11);
        let api = Api::new(&ctx, mock.clone());
        (mock, api)
    }

    #[tokio::test]
    async fn invoke_carries_context_and_address() {
        let (mock, api) = setup();
        let echo: Arc<InvocationService> = Arc::new(|event: InvocationEvent| {
            Box::pin(ready(Ok::<_, ReplyError>(Content { data: event.data, ..Content::default() })))
        });
        mock.add_invocation_handler("v2:stock:reserve", echo).unwrap();

        let reply: serde_json::Value = api.invoke_json("inventory", 2, "Stock", "Reserve",
                                                       &json!({"sku": "A1"})).await.unwrap();
        assert_eq!(reply, json!({"sku": "A1"}));

        let invokes = mock.invokes.lock();
        assert_eq!(invokes[0].method, "v2:stock:reserve");
        assert_eq!(meta::first_value(&invokes[0].event.metadata, meta::KEY_TID), Some("11"));
    }

    #[tokio::test]
    async fn business_reply_becomes_biz_error() {
        let (mock, api) = setup();
        let refuse: Arc<InvocationService> = Arc::new(|_event: InvocationEvent| {
            Box::pin(ready(Err::<Content, _>(ReplyError::Business {
                code: 30001, msg: "out of stock".into() })))
        });
        mock.add_invocation_handler("v1:stock:reserve", refuse).unwrap();

        let err = api.invoke("inventory", 1, "stock", "reserve", "A1").await.unwrap_err();
        let biz = err.downcast_ref::<BizError>().unwrap();
        assert_eq!(biz.code, 30001);
    }

    #[tokio::test]
    async fn publish_raw_sets_metadata() {
        let (mock, api) = setup();
        api.publish("orders", "created", &json!({"id": 1}), true).await.unwrap();
        api.publish("orders", "created", &json!({"id": 2}), false).await.unwrap();

        let publishes = mock.publishes.lock();
        assert_eq!(publishes[0].metadata.get("rawPayload").map(String::as_str), Some("true"));
        assert!(publishes[1].metadata.is_empty());
        assert_eq!(publishes[1].data, br#"{"id":2}"#);
    }
}
