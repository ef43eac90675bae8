//! Error types for redimq.

use std::fmt;

/// Error returned by any redimq operation.
///
/// Every surfaced variant carries enough context (the operation and the
/// key involved) for diagnosis; see the `context` field on each variant.
#[derive(Debug)]
pub enum RediMqError {
    /// Connection, timeout, or other transient store failure. Caller may retry.
    TransientStore { context: String, source: String },
    /// The store returned a shape the adapter did not expect. Fatal for that call.
    StoreProtocol { context: String, detail: String },
    /// Group or consumer already existed. Never surfaced to callers; logged and swallowed.
    AlreadyExists { context: String },
    /// Acknowledge was attempted for an id not in the caller's pending list.
    NotOwned { context: String, id: String },
    /// A duration or other option string could not be parsed.
    ConfigInvalid { context: String, detail: String },
    /// `Consumer::start_*` was called twice for the same topic.
    AlreadyRunning { topic: String },
}

impl std::error::Error for RediMqError {}

impl fmt::Display for RediMqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RediMqError::TransientStore { context, source } => {
                write!(f, "{context}: transient store error: {source}")
            }
            RediMqError::StoreProtocol { context, detail } => {
                write!(f, "{context}: unexpected store response: {detail}")
            }
            RediMqError::AlreadyExists { context } => {
                write!(f, "{context}: already exists")
            }
            RediMqError::NotOwned { context, id } => {
                write!(f, "{context}: message {id} is not in the caller's pending list")
            }
            RediMqError::ConfigInvalid { context, detail } => {
                write!(f, "{context}: invalid configuration: {detail}")
            }
            RediMqError::AlreadyRunning { topic } => {
                write!(f, "consumer is already running for topic '{topic}'")
            }
        }
    }
}

impl RediMqError {
    pub(crate) fn transient(context: impl Into<String>, source: impl fmt::Display) -> Self {
        RediMqError::TransientStore {
            context: context.into(),
            source: source.to_string(),
        }
    }

    pub(crate) fn protocol(context: impl Into<String>, detail: impl Into<String>) -> Self {
        RediMqError::StoreProtocol {
            context: context.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn already_exists(context: impl Into<String>) -> Self {
        RediMqError::AlreadyExists {
            context: context.into(),
        }
    }

    pub(crate) fn config_invalid(context: impl Into<String>, detail: impl Into<String>) -> Self {
        RediMqError::ConfigInvalid {
            context: context.into(),
            detail: detail.into(),
        }
    }

    /// True for the one kind that call sites are expected to swallow (idempotent creation).
    pub fn is_already_exists(&self) -> bool {
        matches!(self, RediMqError::AlreadyExists { .. })
    }
}

impl From<deadpool_redis::PoolError> for RediMqError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        RediMqError::transient("redis pool checkout", err)
    }
}

impl From<deadpool_redis::redis::RedisError> for RediMqError {
    fn from(err: deadpool_redis::redis::RedisError) -> Self {
        RediMqError::transient("redis command", err)
    }
}
