//! Invocation modules and the dispatcher which runs their handlers
use anyhow::{Context as _, Result};
use futures::future::{BoxFuture, Future, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::error;

use crate::context::BizContext;
use crate::error::{panic_message, ReplyError, SdkError};
use crate::module::ModuleInfo;
use crate::naming;
use crate::payload::{preview, Payload};
use crate::sidecar::{Content, InvocationEvent, InvocationService, CONTENT_TYPE_JSON};

/// Invocation handler function type - takes context and raw request
pub type InvocationFunction = dyn Fn(BizContext, Vec<u8>) ->
    BoxFuture<'static, Result<Payload>> + Send + Sync + 'static;

/// One callable handler of an invocation module
#[derive(Clone)]
pub struct InvocationHandler {
    alias: String,
    internal_name: String,
    function: Arc<InvocationFunction>,
}

impl InvocationHandler {
    pub fn new<F, Fut>(alias: &str, function: F) -> Self
    where
        F: Fn(BizContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        let internal_name = std::any::type_name::<F>();
        Self::from_function(alias, internal_name, Arc::new(move |ctx, data| {
            Box::pin(function(ctx, data))
        }))
    }

    pub fn from_function(alias: &str, internal_name: &str, function: Arc<InvocationFunction>)
                         -> Self {
        Self {
            alias: alias.to_string(),
            internal_name: internal_name.to_string(),
            function,
        }
    }

    /// Public name, used in the address
    pub fn alias(&self) -> &str { &self.alias }

    /// Name of the implementing function, for logs
    pub fn internal_name(&self) -> &str { &self.internal_name }

    pub fn function(&self) -> Arc<InvocationFunction> {
        self.function.clone()
    }
}

/// Bundle of invocation handlers, registered together under one ModuleInfo
#[derive(Clone, Default)]
pub struct InvocationModule {
    handlers: Vec<InvocationHandler>,
}

impl InvocationModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, handler: InvocationHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Add a handler on raw request bytes
    pub fn handle<F, Fut>(self, alias: &str, function: F) -> Self
    where
        F: Fn(BizContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.add(InvocationHandler::new(alias, function))
    }

    /// Add a handler taking a JSON request and returning a JSON response
    pub fn handle_json<Req, Resp, F, Fut>(self, alias: &str, function: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(BizContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        let internal_name = std::any::type_name::<F>();
        let function = Arc::new(function);
        let wrapped: Arc<InvocationFunction> = Arc::new(move |ctx, data: Vec<u8>| {
            let function = function.clone();
            Box::pin(async move {
                let request: Req = serde_json::from_slice(&data)
                    .context("decoding request")?;
                let response = function(ctx, request).await?;
                Payload::json(&response)
            })
        });
        self.add(InvocationHandler::from_function(alias, internal_name, wrapped))
    }

    pub fn handlers(&self) -> &[InvocationHandler] {
        &self.handlers
    }
}

/// Runs one handler for inbound calls: builds the context, isolates panics
/// and translates errors into replies
pub struct InvocationDispatcher {
    app: String,
    info: ModuleInfo,
    handler: InvocationHandler,
}

impl InvocationDispatcher {
    pub fn new(app: &str, info: &ModuleInfo, handler: &InvocationHandler) -> Self {
        Self {
            app: app.to_string(),
            info: info.clone(),
            handler: handler.clone(),
        }
    }

    /// Canonical address this dispatcher serves
    pub fn address(&self) -> Result<String, SdkError> {
        naming::resolve(self.info.api_version, &self.info.name, self.handler.alias(),
                        self.info.origin.as_deref())
    }

    /// Handle one call
    pub async fn dispatch(&self, event: InvocationEvent) -> Result<Content, ReplyError> {
        let ctx = BizContext::from_metadata(&event.metadata);
        let function = self.handler.function();
        let data = event.data.clone();

        let outcome = AssertUnwindSafe(async move { function(ctx, data).await })
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(app = %self.app, module = %self.info.name,
                       handler = %self.handler.internal_name(),
                       "Panic in invocation handler: {message}\n{}",
                       Backtrace::force_capture());
                Err(SdkError::Panic(message).into())
            }
        };

        match result.and_then(Payload::into_bytes) {
            Ok(data) => Ok(Content {
                content_type: CONTENT_TYPE_JSON.to_string(),
                data,
                data_type_url: event.data_type_url,
            }),
            Err(e) => {
                error!(app = %self.app,
                       origin = %self.info.origin.as_deref().unwrap_or_default(),
                       module = %self.info.name,
                       handler = %self.handler.internal_name(),
                       request = %preview(&event.data),
                       "Invocation failed: {e:#}");
                Err(ReplyError::from_error(&e))
            }
        }
    }

    /// Wrap as a sidecar service
    pub fn into_service(self) -> Arc<InvocationService> {
        let dispatcher = Arc::new(self);
        Arc::new(move |event: InvocationEvent| {
            let dispatcher = dispatcher.clone();
            Box::pin(async move { dispatcher.dispatch(event).await })
        })
    }
}
