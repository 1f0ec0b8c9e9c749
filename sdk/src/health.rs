//! Health probe modules
use anyhow::Result;
use futures::future::{ready, Future};
use std::sync::Arc;

use crate::module::Registered;
use crate::sidecar::HealthProbe;

/// Module wrapping a single health probe
#[derive(Clone)]
pub struct HealthModule {
    probe: Arc<HealthProbe>,
}

impl HealthModule {
    pub fn new<F, Fut>(probe: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self { probe: Arc::new(move || Box::pin(probe())) }
    }

    pub fn probe(&self) -> Arc<HealthProbe> {
        self.probe.clone()
    }
}

/// Always healthy
impl Default for HealthModule {
    fn default() -> Self {
        Self { probe: always_healthy() }
    }
}

fn always_healthy() -> Arc<HealthProbe> {
    Arc::new(|| Box::pin(ready(Ok::<(), anyhow::Error>(()))))
}

/// The probe to install: the first registered one, or one that always
/// succeeds
pub fn aggregate<'a>(modules: impl IntoIterator<Item = Registered<'a, HealthModule>>)
                     -> Arc<HealthProbe> {
    modules.into_iter()
        .next()
        .map(|module| module.probe())
        .unwrap_or_else(always_healthy)
}
