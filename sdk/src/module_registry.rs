//! Module registry trait and the in-process registry

use std::collections::HashSet;
use crate::delay_event::DelayEventModule;
use crate::error::SdkError;
use crate::event::EventModule;
use crate::invocation::InvocationModule;
use crate::module::{Capability, Module, ModuleBody, ModuleKind, Registered};
use crate::naming;

/// Module registry trait
pub trait ModuleRegistry {

    // Register a module
    fn register(&mut self, module: Module) -> Result<(), SdkError>;
}

/// Modules bucketed by kind, in registration order
#[derive(Default)]
pub struct Registry {
    invocation: Vec<Module>,
    event: Vec<Module>,
    health: Vec<Module>,
    delay_event: Vec<Module>,

    addresses: HashSet<String>,
    subscriptions: HashSet<(String, String)>,
    delay_topics: HashSet<String>,

    frozen: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse any further registration
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// All modules of one kind, in registration order
    pub fn get<T: Capability>(&self) -> Vec<Registered<'_, T>> {
        self.bucket(T::KIND)
            .iter()
            .filter_map(Registered::from_module)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.invocation.len() + self.event.len() + self.health.len() + self.delay_event.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket(&self, kind: ModuleKind) -> &Vec<Module> {
        match kind {
            ModuleKind::Invocation => &self.invocation,
            ModuleKind::Event => &self.event,
            ModuleKind::Health => &self.health,
            ModuleKind::DelayEvent => &self.delay_event,
        }
    }

    /// Addresses a new invocation module would claim
    fn new_addresses(&self, module: &Module, body: &InvocationModule)
                     -> Result<Vec<String>, SdkError> {
        let info = module.info();
        let mut claimed = Vec::new();
        for handler in body.handlers() {
            let address = naming::resolve(info.api_version, &info.name, handler.alias(),
                                          info.origin.as_deref())?;
            if self.addresses.contains(&address) || claimed.contains(&address) {
                return Err(SdkError::DuplicateAddress {
                    address,
                    module: info.name.clone(),
                });
            }
            claimed.push(address);
        }
        Ok(claimed)
    }

    fn new_subscriptions(&self, body: &EventModule)
                         -> Result<Vec<(String, String)>, SdkError> {
        let mut claimed = Vec::new();
        for handler in body.handlers() {
            let key = (body.pubsub().to_string(), handler.topic().to_string());
            if self.subscriptions.contains(&key) || claimed.contains(&key) {
                return Err(SdkError::DuplicateSubscription { pubsub: key.0, topic: key.1 });
            }
            claimed.push(key);
        }
        Ok(claimed)
    }

    fn new_delay_topics(&self, body: &DelayEventModule) -> Result<Vec<String>, SdkError> {
        let mut claimed = Vec::new();
        for handler in body.handlers() {
            let topic = handler.topic().to_string();
            if self.delay_topics.contains(&topic) || claimed.contains(&topic) {
                return Err(SdkError::DuplicateTopic(topic));
            }
            claimed.push(topic);
        }
        Ok(claimed)
    }
}

impl ModuleRegistry for Registry {

    /// Validate and append.  Nothing is stored if any check fails.
    fn register(&mut self, module: Module) -> Result<(), SdkError> {
        if self.frozen {
            return Err(SdkError::RegistryFrozen(module.name().to_string()));
        }

        match module.body() {
            ModuleBody::Invocation(body) => {
                let claimed = self.new_addresses(&module, body)?;
                self.addresses.extend(claimed);
                self.invocation.push(module);
            }
            ModuleBody::Event(body) => {
                let claimed = self.new_subscriptions(body)?;
                self.subscriptions.extend(claimed);
                self.event.push(module);
            }
            ModuleBody::DelayEvent(body) => {
                let claimed = self.new_delay_topics(body)?;
                self.delay_topics.extend(claimed);
                self.delay_event.push(module);
            }
            ModuleBody::Health(_) => self.health.push(module),
        }

        Ok(())
    }
}
