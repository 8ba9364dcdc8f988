// src/rabbitmq/amqp_client.rs
// lapin-backed implementation of the broker transport.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions},
    types::FieldTable,
    uri::{AMQPUri, AMQPUserInfo},
    Channel, Connection, ConnectionProperties,
};
use tracing::{debug, warn};

use super::connection::BrokerEndpoint;
use super::errors::{Result, SensorError};
use super::message::{DeliveryHandle, InboundMessage};
use super::transport::{BrokerChannel, BrokerConnector, DeliveryStream};

const REPLY_SUCCESS: u16 = 200;

/// Connects with lapin.
#[derive(Debug, Clone)]
pub struct LapinConnector {
    connection_name: String,
}

impl LapinConnector {
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
        }
    }
}

impl Default for LapinConnector {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"))
    }
}

/// QoS scoped to the whole channel, so the prefetch limit is shared by every
/// consumer on it rather than granted to each one.
pub fn channel_qos() -> BasicQosOptions {
    BasicQosOptions { global: true }
}

/// Maps an endpoint onto the URI structure lapin connects with.
pub fn amqp_uri(endpoint: &BrokerEndpoint) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.authority.host = endpoint.host.clone();
    uri.authority.port = endpoint.port;

    if let Some(credentials) = &endpoint.credentials {
        uri.authority.userinfo = AMQPUserInfo {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        };
    }

    if let Some(vhost) = &endpoint.vhost {
        uri.vhost = vhost.clone();
    }

    let heartbeat = endpoint.heartbeat.as_secs().min(u64::from(u16::MAX)) as u16;
    uri.query.heartbeat = Some(heartbeat);
    uri.query.connection_timeout = Some(endpoint.socket_timeout.as_millis() as u64);
    uri
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerChannel>> {
        let properties =
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into());

        let connection = tokio::time::timeout(
            endpoint.socket_timeout,
            Connection::connect_uri(amqp_uri(endpoint), properties),
        )
        .await
        .map_err(|_| {
            SensorError::ConnectionError(format!(
                "No connection to {}:{} within {:?}",
                endpoint.host, endpoint.port, endpoint.socket_timeout
            ))
        })?
        .map_err(|e| SensorError::ConnectionError(format!("Failed to connect: {}", e)))?;

        debug!("Opening channel on RabbitMQ");
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) =
                    connection.close(REPLY_SUCCESS, "Channel could not be opened").await
                {
                    warn!("Closing RabbitMQ connection failed: {}", close_err);
                }
                return Err(SensorError::ChannelError(format!("Failed to create channel: {}", e)));
            }
        };

        Ok(Arc::new(LapinChannel {
            connection,
            channel,
            rpc_timeout: endpoint.blocked_connection_timeout,
        }))
    }
}

/// A lapin connection paired with the one channel opened on it.
pub struct LapinChannel {
    connection: Connection,
    channel: Channel,
    rpc_timeout: Duration,
}

impl LapinChannel {
    // A blocked connection stops answering; bound every RPC so it surfaces.
    async fn bounded<T, F>(&self, what: &str, rpc: F) -> Result<T>
    where
        F: Future<Output = lapin::Result<T>>,
    {
        tokio::time::timeout(self.rpc_timeout, rpc)
            .await
            .map_err(|_| {
                SensorError::TimeoutError(format!("{} took longer than {:?}", what, self.rpc_timeout))
            })?
            .map_err(|e| SensorError::ChannelError(format!("{} failed: {}", what, e)))
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.bounded(
            "basic.qos",
            self.channel.basic_qos(prefetch_count, channel_qos()),
        )
        .await
    }

    async fn queue_declare(&self, queue: &str) -> Result<()> {
        let declared = self
            .bounded(
                "queue.declare",
                self.channel.queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                ),
            )
            .await
            .map_err(|e| SensorError::DeclarationError {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        debug!(
            queue,
            messages = declared.message_count(),
            consumers = declared.consumer_count(),
            "Queue declared"
        );
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                SensorError::ConsumeError(format!("basic.consume on '{}' failed: {}", queue, e))
            })?;

        let queue_name = queue.to_string();
        let deliveries = consumer.map(move |delivery| match delivery {
            Ok(delivery) => Ok(InboundMessage {
                queue: queue_name.clone(),
                body: delivery.data,
                handle: DeliveryHandle::new(delivery.delivery_tag),
            }),
            Err(e) => Err(SensorError::ConsumeError(e.to_string())),
        });

        Ok(deliveries.boxed())
    }

    async fn basic_ack(&self, handle: DeliveryHandle) -> Result<()> {
        self.bounded(
            "basic.ack",
            self.channel
                .basic_ack(handle.delivery_tag(), BasicAckOptions::default()),
        )
        .await
        .map_err(|e| SensorError::AckError(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            if let Err(e) = self
                .bounded("channel.close", self.channel.close(REPLY_SUCCESS, "Sensor shutting down"))
                .await
            {
                warn!("Closing RabbitMQ channel failed: {}", e);
            }
        }

        if self.connection.status().connected() {
            tokio::time::timeout(
                self.rpc_timeout,
                self.connection.close(REPLY_SUCCESS, "Sensor shutting down"),
            )
            .await?
            .map_err(|e| SensorError::ConnectionError(format!("Failed to close connection: {}", e)))?;
        }
        Ok(())
    }
}
