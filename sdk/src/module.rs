// Definition of a Plinth module - a bundle of handlers of one kind

use std::fmt;
use std::ops::Deref;
use crate::delay_event::DelayEventModule;
use crate::error::SdkError;
use crate::event::EventModule;
use crate::health::HealthModule;
use crate::invocation::InvocationModule;

const MODULE_SUFFIX: &str = "module";

/// Kind tag, used to bucket modules in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    Invocation,
    Event,
    Health,
    DelayEvent,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModuleKind::Invocation => "invocation",
            ModuleKind::Event => "event",
            ModuleKind::Health => "health",
            ModuleKind::DelayEvent => "delay-event",
        })
    }
}

/// Identity of a module, which feeds its handlers' addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub api_version: u32,
    pub name: String,
    pub origin: Option<String>,
}

impl ModuleInfo {
    pub fn new(api_version: u32, name: &str) -> Self {
        Self { api_version, name: name.to_string(), origin: None }
    }

    pub fn with_origin(mut self, origin: &str) -> Self {
        self.origin = Some(origin.to_string()).filter(|o| !o.is_empty());
        self
    }

    /// Derive the identity of module type `T` declared in the Rust module at
    /// `path` - call with `module_path!()`
    pub fn of<T: ?Sized>(path: &str) -> Result<Self, SdkError> {
        Self::from_module_path(path, std::any::type_name::<T>())
    }

    /// Derive identity from a module path and type name.
    ///
    /// The last `v<N>` segment of the path gives the api version; at most one
    /// segment may follow it, which becomes the origin.  The name is the bare
    /// type name with any trailing `Module` removed:
    ///
    /// `("app::service::v2::wxmp", "app::service::v2::wxmp::OrderModule")`
    /// gives `{2, "Order", Some("wxmp")}`
    pub fn from_module_path(path: &str, type_name: &str) -> Result<Self, SdkError> {
        let segments: Vec<&str> = path.split("::").collect();
        let position = segments.iter()
            .rposition(|s| parse_version(s).is_some())
            .ok_or_else(|| SdkError::InvalidModule(
                format!("no version segment in module path '{path}'")))?;

        let api_version = parse_version(segments[position])
            .ok_or_else(|| SdkError::InvalidModule(path.to_string()))?;

        let origin = match &segments[position + 1..] {
            [] => None,
            [origin] => Some(origin.to_string()),
            _ => return Err(SdkError::InvalidModule(
                format!("more than one segment after version in '{path}'"))),
        };

        // Bare type name without generics or path
        let bare = type_name.split('<').next().unwrap_or_default();
        let bare = bare.rsplit("::").next().unwrap_or_default();
        let name = match bare.len().checked_sub(MODULE_SUFFIX.len()) {
            Some(cut) if bare.get(cut..)
                .is_some_and(|tail| tail.eq_ignore_ascii_case(MODULE_SUFFIX)) => &bare[..cut],
            _ => bare,
        };
        if name.is_empty() {
            return Err(SdkError::InvalidModule(
                format!("cannot derive module name from type '{type_name}'")));
        }

        Ok(Self { api_version, name: name.to_string(), origin })
    }
}

fn parse_version(segment: &str) -> Option<u32> {
    let digits = segment.strip_prefix(['v', 'V'])?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Kind-specific content of a module
pub enum ModuleBody {
    Invocation(InvocationModule),
    Event(EventModule),
    Health(HealthModule),
    DelayEvent(DelayEventModule),
}

impl From<InvocationModule> for ModuleBody {
    fn from(m: InvocationModule) -> Self { ModuleBody::Invocation(m) }
}

impl From<EventModule> for ModuleBody {
    fn from(m: EventModule) -> Self { ModuleBody::Event(m) }
}

impl From<HealthModule> for ModuleBody {
    fn from(m: HealthModule) -> Self { ModuleBody::Health(m) }
}

impl From<DelayEventModule> for ModuleBody {
    fn from(m: DelayEventModule) -> Self { ModuleBody::DelayEvent(m) }
}

/// A registered module: owning app, identity and handlers
pub struct Module {
    app: String,
    info: ModuleInfo,
    body: ModuleBody,
}

impl Module {
    pub fn new(app: &str, info: ModuleInfo, body: impl Into<ModuleBody>) -> Self {
        Self { app: app.to_string(), info, body: body.into() }
    }

    pub fn kind(&self) -> ModuleKind {
        match self.body {
            ModuleBody::Invocation(_) => ModuleKind::Invocation,
            ModuleBody::Event(_) => ModuleKind::Event,
            ModuleBody::Health(_) => ModuleKind::Health,
            ModuleBody::DelayEvent(_) => ModuleKind::DelayEvent,
        }
    }

    pub fn app(&self) -> &str { &self.app }
    pub fn info(&self) -> &ModuleInfo { &self.info }
    pub fn name(&self) -> &str { &self.info.name }
    pub fn body(&self) -> &ModuleBody { &self.body }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("app", &self.app)
            .field("kind", &self.kind())
            .field("info", &self.info)
            .finish()
    }
}

/// Module body types retrievable by kind from a registry
pub trait Capability: Sized + 'static {
    const KIND: ModuleKind;
    fn from_body(body: &ModuleBody) -> Option<&Self>;
}

impl Capability for InvocationModule {
    const KIND: ModuleKind = ModuleKind::Invocation;
    fn from_body(body: &ModuleBody) -> Option<&Self> {
        match body { ModuleBody::Invocation(m) => Some(m), _ => None }
    }
}

impl Capability for EventModule {
    const KIND: ModuleKind = ModuleKind::Event;
    fn from_body(body: &ModuleBody) -> Option<&Self> {
        match body { ModuleBody::Event(m) => Some(m), _ => None }
    }
}

impl Capability for HealthModule {
    const KIND: ModuleKind = ModuleKind::Health;
    fn from_body(body: &ModuleBody) -> Option<&Self> {
        match body { ModuleBody::Health(m) => Some(m), _ => None }
    }
}

impl Capability for DelayEventModule {
    const KIND: ModuleKind = ModuleKind::DelayEvent;
    fn from_body(body: &ModuleBody) -> Option<&Self> {
        match body { ModuleBody::DelayEvent(m) => Some(m), _ => None }
    }
}

/// Typed view of a registered module
pub struct Registered<'a, T> {
    module: &'a Module,
    body: &'a T,
}

impl<'a, T: Capability> Registered<'a, T> {
    pub fn from_module(module: &'a Module) -> Option<Self> {
        T::from_body(&module.body).map(|body| Self { module, body })
    }

    pub fn app(&self) -> &'a str { &self.module.app }
    pub fn info(&self) -> &'a ModuleInfo { &self.module.info }
    pub fn module(&self) -> &'a Module { self.module }
}

impl<T> Deref for Registered<'_, T> {
    type Target = T;
    fn deref(&self) -> &T { self.body }
}
