// src/rabbitmq/transport.rs
// Seam between the sensor and whatever speaks AMQP on its behalf.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::connection::BrokerEndpoint;
use super::errors::Result;
use super::message::{DeliveryHandle, InboundMessage};

/// Deliveries for a single consumer, each already tagged with its queue name.
pub type DeliveryStream = BoxStream<'static, Result<InboundMessage>>;

/// Opens a broker connection together with its single channel.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerChannel>>;
}

/// Operations the sensor needs from an open channel.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Caps unacknowledged deliveries across every consumer on the channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;

    /// Asserts a durable queue exists. No exchanges or bindings are touched.
    async fn queue_declare(&self, queue: &str) -> Result<()>;

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn basic_ack(&self, handle: DeliveryHandle) -> Result<()>;

    /// Closes the channel and the connection that owns it.
    async fn close(&self) -> Result<()>;
}
