//! Route module - accepts route updates in place of a real gateway
use plinth_sdk::{BizContext, InvocationModule};
use plinth_server::UpdateRouteRequest;
use tracing::info;

pub struct RouteModule;

impl RouteModule {
    pub fn body(self) -> InvocationModule {
        InvocationModule::new()
            .handle_json("update", |_ctx: BizContext, request: UpdateRouteRequest| async move {
                for handler in &request.handlers {
                    info!("Route {} -> {} {:?}", handler.address, request.app,
                          handler.http_methods);
                }
                Ok(serde_json::json!({ "routes": request.handlers.len() }))
            })
    }
}
