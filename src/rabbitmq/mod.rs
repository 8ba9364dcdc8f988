// src/rabbitmq/mod.rs
// RabbitMQ side of the sensor: connection, consumers and the lapin transport.

pub mod errors;
pub mod connection;
pub mod consumer;
pub mod message;
pub mod transport;
pub mod amqp_client;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::LapinConnector;
pub use connection::{BrokerEndpoint, ConnectionManager, Credentials, PREFETCH_COUNT};
pub use consumer::{
    in_delivery_order, QueueConsumer, QueueSubscription, RoutedDeliveries, SubscriptionHandle,
};
pub use errors::{Result, SensorError};
pub use message::{
    DeliveryHandle, DeserializationMethod, ForwardedEvent, InboundMessage, NEW_MESSAGE_TRIGGER,
};
pub use transport::{BrokerChannel, BrokerConnector, DeliveryStream};
