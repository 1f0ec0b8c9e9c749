// Plinth service SDK - main library exports
pub mod api;
pub mod backoff;
pub mod config;
pub mod context;
pub mod delay_event;
pub mod error;
pub mod event;
pub mod health;
pub mod invocation;
pub mod meta;
pub mod mock_sidecar;
pub mod module;
pub mod module_registry;
pub mod naming;
pub mod namespace;
pub mod payload;
pub mod sidecar;
pub mod transactor;

// Flattened re-exports
pub use self::api::Api;
pub use self::backoff::{BackoffConfig, BackoffPolicy, ExponentialBackoff};
pub use self::context::BizContext;
pub use self::delay_event::{DelayEventConsumer, DelayEventModule};
pub use self::error::{BizError, EventError, EventResult, ReplyError, SdkError};
pub use self::event::{EventDispatcher, EventModule};
pub use self::health::HealthModule;
pub use self::invocation::{InvocationDispatcher, InvocationModule};
pub use self::module::{Module, ModuleInfo, ModuleKind};
pub use self::module_registry::{ModuleRegistry, Registry};
pub use self::payload::Payload;
pub use self::sidecar::{DelayQueue, QueueMessage, Sidecar, Subscription};
pub use self::transactor::{Transactor, TxHandle, UnitOfWork};
