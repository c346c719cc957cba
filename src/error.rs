//! Crate-wide error type.

use crate::envelope::EnvelopeError;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Boxed error used at handler boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected to the broker; call connect() first")]
    NotConnected,

    #[error("Invalid durable name '{0}': must not contain '.'")]
    InvalidDurableName(String),

    #[error("Invalid consumer options: {0}")]
    InvalidOptions(String),

    #[error("Reconciling {resource} failed: {message}")]
    Reconciliation { resource: String, message: String },

    #[error("Consumer '{0}' already exists")]
    ConsumerAlreadyExists(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error(transparent)]
    MalformedEnvelope(#[from] EnvelopeError),

    #[error("Ack failed: {0}")]
    Ack(String),
}

impl BusError {
    /// Build a reconciliation error for a named stream or consumer.
    pub fn reconciliation(resource: impl Into<String>, message: impl std::fmt::Display) -> Self {
        BusError::Reconciliation {
            resource: resource.into(),
            message: message.to_string(),
        }
    }
}
