//! Exposed handler route table and registration with the gateway
use anyhow::{Context as _, Result};
use futures::future::BoxFuture;
use plinth_sdk::{naming, Api, BizContext, Sidecar};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Gateway method receiving route updates
pub const ROUTE_UPDATE_MODULE: &str = "route";
pub const ROUTE_UPDATE_HANDLER: &str = "update";
pub const ROUTE_UPDATE_VERSION: u32 = 1;

/// One externally exposed invocation handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposedHandler {
    pub module: String,
    pub api_version: u32,
    pub handler: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    /// Canonical address - filled in on load if absent
    #[serde(default)]
    pub address: String,

    /// Gateway endpoint, if it differs from the address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub http_methods: Vec<String>,

    #[serde(default)]
    pub permissions: Vec<String>,

    #[serde(default)]
    pub public: bool,

    #[serde(default)]
    pub raw_response: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

impl ExposedHandler {
    pub fn new(api_version: u32, module: &str, handler: &str) -> Result<Self> {
        let mut exposed = Self {
            module: module.to_string(),
            api_version,
            handler: handler.to_string(),
            origin: None,
            address: String::new(),
            endpoint: None,
            http_methods: Vec::new(),
            permissions: Vec::new(),
            public: false,
            raw_response: false,
            comment: String::new(),
        };
        exposed.resolve_address()?;
        Ok(exposed)
    }

    fn resolve_address(&mut self) -> Result<()> {
        self.address = naming::resolve(self.api_version, &self.module, &self.handler,
                                       self.origin.as_deref())?;
        Ok(())
    }
}

/// Body of a gateway route update
#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateRouteRequest {
    pub app: String,
    pub handlers: Vec<ExposedHandler>,
}

/// Load the route table, computing any missing addresses
pub fn load_routes(path: &Path) -> Result<Vec<ExposedHandler>> {
    let data = std::fs::read(path)
        .with_context(|| format!("reading route file {}", path.display()))?;
    let mut handlers: Vec<ExposedHandler> = serde_json::from_slice(&data)
        .with_context(|| format!("parsing route file {}", path.display()))?;
    for handler in handlers.iter_mut().filter(|h| h.address.is_empty()) {
        handler.resolve_address()?;
    }
    Ok(handlers)
}

/// Register function type - announces the app's exposed handlers
pub type RegisterFunction = dyn Fn(Arc<dyn Sidecar>, String, Vec<ExposedHandler>) ->
    BoxFuture<'static, Result<()>> + Send + Sync + 'static;

/// Default register function: push the handlers to the gateway app's route
/// update method.  Nothing is sent for an empty list.
pub fn gateway_register(gateway_app: &str) -> Arc<RegisterFunction> {
    let gateway_app = gateway_app.to_string();
    Arc::new(move |sidecar: Arc<dyn Sidecar>, app: String, handlers: Vec<ExposedHandler>| {
        let gateway_app = gateway_app.clone();
        Box::pin(async move {
            if handlers.is_empty() {
                return Ok(());
            }

            info!("Registering {} handlers of {app} with {gateway_app}", handlers.len());
            let request = UpdateRouteRequest { app, handlers };
            Api::new(&BizContext::new(), sidecar)
                .invoke(&gateway_app, ROUTE_UPDATE_VERSION, ROUTE_UPDATE_MODULE,
                        ROUTE_UPDATE_HANDLER, &request)
                .await?;
            Ok::<(), anyhow::Error>(())
        })
    })
}

// -- Tests --
#[cfg(test)]
mod tests {
    use super::*;
    use plinth_sdk::mock_sidecar::MockSidecar;
    use std::io::Write;

    #[test]
    fn route_file_fills_addresses() {
        let mut path = std::env::temp_dir();
        path.push(format!("plinth-routes-{}.json", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(br#"[
            {"module": "Order", "apiVersion": 1, "handler": "create",
             "httpMethods": ["POST"], "public": true},
            {"module": "order", "apiVersion": 2, "handler": "list", "origin": "pc",
             "address": "custom"}
        ]"#).unwrap();

        let routes = load_routes(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(routes[0].address, "v1:order:create");
        assert!(routes[0].public);
        assert_eq!(routes[1].address, "custom");
    }

    #[test]
    fn missing_route_file_is_an_error() {
        assert!(load_routes(Path::new("/nonexistent/routes.json")).is_err());
    }

    #[tokio::test]
    async fn gateway_register_pushes_update() {
        let mock = Arc::new(MockSidecar::new());
        let register = gateway_register("gateway");

        // Nothing to push
        register(mock.clone(), "shop".to_string(), Vec::new()).await.unwrap();
        assert!(mock.invokes.lock().is_empty());

        // No gateway handler in the mock, so the call itself fails
        let handlers = vec![ExposedHandler::new(1, "order", "create").unwrap()];
        assert!(register(mock.clone(), "shop".to_string(), handlers).await.is_err());

        let invokes = mock.invokes.lock();
        assert_eq!(invokes.len(), 1);
        assert_eq!(invokes[0].method, "v1:route:update");
        let body: UpdateRouteRequest = serde_json::from_slice(&invokes[0].event.data).unwrap();
        assert_eq!(body.app, "shop");
        assert_eq!(body.handlers[0].address, "v1:order:create");
    }
}
