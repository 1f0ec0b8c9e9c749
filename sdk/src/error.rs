//! Error types shared by dispatchers, the registry and callers
use std::time::Duration;
use thiserror::Error;

/// Start of the business error code range
pub const ERR_CODE_START: i32 = 10000;

/// Internal error code
pub const ERR_CODE_INTERNAL: i32 = ERR_CODE_START + 1;

/// Framework errors
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SdkError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid module: {0}")]
    InvalidModule(String),

    #[error("duplicate invocation address {address} (module {module})")]
    DuplicateAddress { address: String, module: String },

    #[error("duplicate subscription {pubsub}/{topic}")]
    DuplicateSubscription { pubsub: String, topic: String },

    #[error("duplicate delay event topic {0}")]
    DuplicateTopic(String),

    #[error("module registry is frozen, module {0} registered too late")]
    RegistryFrozen(String),

    #[error("event not acknowledged within {0:?}")]
    AckTimeout(Duration),

    #[error("panic: {0}")]
    Panic(String),

    #[error("{0} not configured")]
    MissingCollaborator(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Business error with a numeric code, raised deliberately by handler code
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[error("{msg}")]
pub struct BizError {
    pub code: i32,
    pub msg: String,
}

impl BizError {
    pub fn new(code: impl Into<i32>, msg: impl Into<String>) -> Self {
        Self { code: code.into(), msg: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ERR_CODE_INTERNAL, msg)
    }

    /// Recover the business error from a call reply - anything other than a
    /// structured business reply becomes an internal error
    pub fn from_reply(reply: &ReplyError) -> Self {
        match reply {
            ReplyError::Business { code, msg } => Self::new(*code, msg.clone()),
            ReplyError::Internal(msg) => Self::internal(msg.clone()),
        }
    }
}

/// Error envelope returned to an invocation caller through the sidecar
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    /// Structured error detail: business code and message
    #[error("business error {code}: {msg}")]
    Business { code: i32, msg: String },

    /// Opaque internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReplyError {

    /// Translate a handler error, looking for a business error anywhere in
    /// the chain
    pub fn from_error(err: &anyhow::Error) -> Self {
        match err.chain().find_map(|e| e.downcast_ref::<BizError>()) {
            Some(be) => ReplyError::Business { code: be.code, msg: be.msg.clone() },
            None => ReplyError::Internal(format!("{err:#}")),
        }
    }
}

/// Failure outcome of an event or delay-event handler.  `retry` asks the
/// substrate to redeliver; success is `Ok(())` whatever the caller intended
#[derive(Debug, Error)]
#[error("{source:#} (retry={retry})")]
pub struct EventError {
    pub retry: bool,
    #[source]
    pub source: anyhow::Error,
}

impl EventError {
    pub fn new(retry: bool, source: impl Into<anyhow::Error>) -> Self {
        Self { retry, source: source.into() }
    }

    /// Failure which should be redelivered
    pub fn retry(source: impl Into<anyhow::Error>) -> Self {
        Self::new(true, source)
    }

    /// Failure which should be dropped
    pub fn discard(source: impl Into<anyhow::Error>) -> Self {
        Self::new(false, source)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.source.downcast_ref::<SdkError>(), Some(SdkError::AckTimeout(_)))
    }
}

/// Result of an event or delay-event handler
pub type EventResult = std::result::Result<(), EventError>;

/// Text of a caught panic payload
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
