// src/rabbitmq/errors.rs

use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Failed to declare queue '{queue}': {reason}")]
    DeclarationError { queue: String, reason: String },

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    // Only ever produced and swallowed inside the consumer.
    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("Event dispatch error: {0}")]
    DispatchError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),
}

// Custom Result type for sensor operations
pub type Result<T> = std::result::Result<T, SensorError>;

impl From<Elapsed> for SensorError {
    fn from(_: Elapsed) -> Self {
        SensorError::TimeoutError("Broker did not answer in time".to_string())
    }
}

impl From<serde_json::Error> for SensorError {
    fn from(error: serde_json::Error) -> Self {
        SensorError::DeserializationError(error.to_string())
    }
}

impl From<serde_pickle::Error> for SensorError {
    fn from(error: serde_pickle::Error) -> Self {
        SensorError::DeserializationError(error.to_string())
    }
}
