//! Error types for adapters, bindings and stores.

use std::fmt;
use thiserror::Error;

/// Error categories map failures onto the lifecycle stage they belong to.
///
/// # Categories
///
/// - **Configuration**: bad or missing configuration, reported by `configure`
/// - **Connection**: dial or protocol setup failure, reported by `configure`/`start`
/// - **Delivery**: the receive loop died, reported once on the terminal signal
/// - **Store**: dedup or cursor store trouble, degrades instead of failing
/// - **Publish**: a publish call failed, returned to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Connection,
    Delivery,
    Store,
    Publish,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Connection => write!(f, "connection"),
            ErrorCategory::Delivery => write!(f, "delivery"),
            ErrorCategory::Store => write!(f, "store"),
            ErrorCategory::Publish => write!(f, "publish"),
        }
    }
}

/// Configuration validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A mandatory key is absent.
    #[error("Key Missing : {0}")]
    MissingKey(String),

    /// A key is present but its value does not fit the field.
    #[error("Invalid value for '{key}': {details}")]
    InvalidType { key: String, details: String },

    /// Semantically invalid configuration.
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// No configuration map was supplied.
    #[error("No configuration supplied")]
    Empty,

    /// Unknown adapter name.
    #[error("Unknown adapter kind: {0}")]
    UnknownKind(String),
}

/// Error raised by any adapter, binding or store.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Dial failure
    #[error("Connection error: {0}")]
    Connect(String),

    /// Exchange/queue/topic/script setup failure
    #[error("Setup error: {0}")]
    Setup(String),

    /// Transport went away while running
    #[error("{0}")]
    Disconnected(String),

    /// Receive call failed
    #[error("Receive error: {0}")]
    Receive(String),

    #[error("Publish error: {0}")]
    Publish(String),

    /// Dedup or cursor store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Request/reply peer answered with something other than OK
    #[error("Invalid ack. Please send 'OK'")]
    InvalidAck,

    /// Operation needs a configured/started adapter
    #[error("Not configured: {0}")]
    NotConfigured(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CourierError {
    pub fn connect(err: impl fmt::Display) -> Self {
        Self::Connect(err.to_string())
    }

    pub fn setup(err: impl fmt::Display) -> Self {
        Self::Setup(err.to_string())
    }

    pub fn receive(err: impl fmt::Display) -> Self {
        Self::Receive(err.to_string())
    }

    pub fn publish(err: impl fmt::Display) -> Self {
        Self::Publish(err.to_string())
    }

    pub fn store(err: impl fmt::Display) -> Self {
        Self::Store(err.to_string())
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CourierError::Config(_) => ErrorCategory::Configuration,
            CourierError::NotConfigured(_) => ErrorCategory::Configuration,
            CourierError::Connect(_) | CourierError::Setup(_) => ErrorCategory::Connection,
            CourierError::Disconnected(_) | CourierError::Receive(_) => ErrorCategory::Delivery,
            CourierError::Store(_) | CourierError::Io(_) => ErrorCategory::Store,
            CourierError::Publish(_)
            | CourierError::InvalidAck
            | CourierError::Serialization(_) => ErrorCategory::Publish,
            CourierError::Redis(e) if e.is_connection_dropped() || e.is_io_error() => {
                ErrorCategory::Connection
            }
            CourierError::Redis(_) => ErrorCategory::Store,
        }
    }
}

pub type Result<T, E = CourierError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_message_names_key() {
        let err = CourierError::from(ConfigError::MissingKey("endpoint".into()));
        assert_eq!(err.to_string(), "Key Missing : endpoint");
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            CourierError::connect("refused").category(),
            ErrorCategory::Connection
        );
        assert_eq!(
            CourierError::Disconnected("gone".into()).category(),
            ErrorCategory::Delivery
        );
        assert_eq!(CourierError::InvalidAck.category(), ErrorCategory::Publish);
        assert_eq!(CourierError::store("down").category(), ErrorCategory::Store);
    }

    #[test]
    fn test_category_labels() {
        assert_eq!(ErrorCategory::Publish.to_string(), "publish");
        assert_eq!(
            CourierError::Disconnected("gone".into()).category().to_string(),
            "delivery"
        );
    }
}
