// src/sensor.rs
//! Lifecycle of the queue sensor.
//!
//! A host drives a [`Sensor`] through `setup`, `run` and `cleanup`; [`drive`]
//! does exactly that and guarantees `cleanup` runs however `run` ends.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::StreamExt;
use tracing::{error, info};

use crate::config::SensorSettings;
use crate::dispatch::EventDispatcher;
use crate::rabbitmq::{
    in_delivery_order, BrokerConnector, ConnectionManager, QueueConsumer, QueueSubscription,
    Result, RoutedDeliveries, SensorError, SubscriptionHandle,
};

/// Resolves when the sensor should stop consuming.
pub type Shutdown = BoxFuture<'static, ()>;

#[async_trait]
pub trait Sensor: Send {
    async fn setup(&mut self) -> Result<()>;

    /// Blocks until every consumer is cancelled, a delivery fails fatally, or
    /// `shutdown` resolves.
    async fn run(&mut self, shutdown: Shutdown) -> Result<()>;

    async fn cleanup(&mut self) -> Result<()>;
}

/// Runs a sensor to completion. `cleanup` always runs; the first error wins.
pub async fn drive<S>(sensor: &mut S, shutdown: Shutdown) -> Result<()>
where
    S: Sensor + ?Sized,
{
    let outcome = match sensor.setup().await {
        Ok(()) => sensor.run(shutdown).await,
        Err(e) => Err(e),
    };

    let cleaned = sensor.cleanup().await;
    if let Err(e) = &cleaned {
        error!("Cleanup failed: {}", e);
    }

    outcome.and(cleaned)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerPhase {
    Idle,
    Consuming,
}

/// Consumes from every configured queue and forwards each message to the host
/// as a `rabbitmq.new_message` event.
pub struct RabbitMqQueueSensor {
    connection: ConnectionManager,
    subscriptions: Vec<QueueSubscription>,
    dispatcher: Arc<dyn EventDispatcher>,
    handles: Vec<SubscriptionHandle>,
    deliveries: Option<RoutedDeliveries>,
    phase: ConsumerPhase,
}

impl RabbitMqQueueSensor {
    pub fn new(
        settings: SensorSettings,
        connector: Arc<dyn BrokerConnector>,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> Self {
        Self {
            connection: ConnectionManager::new(settings.endpoint, connector),
            subscriptions: settings.subscriptions,
            dispatcher,
            handles: Vec::new(),
            deliveries: None,
            phase: ConsumerPhase::Idle,
        }
    }

    pub fn phase(&self) -> ConsumerPhase {
        self.phase
    }

    pub fn subscriptions(&self) -> &[SubscriptionHandle] {
        &self.handles
    }

    fn queue_names(&self) -> Vec<&str> {
        self.subscriptions.iter().map(|s| s.queue.as_str()).collect()
    }
}

#[async_trait]
impl Sensor for RabbitMqQueueSensor {
    async fn setup(&mut self) -> Result<()> {
        let channel = self.connection.connect().await?;

        let mut streams = Vec::with_capacity(self.subscriptions.len());
        for subscription in &self.subscriptions {
            info!("Consuming queue {}", subscription.queue);
            self.connection.declare_queue(&subscription.queue).await?;

            // Each consumer owns its own copy of the subscription.
            let consumer = QueueConsumer::new(
                subscription.clone(),
                channel.clone(),
                self.dispatcher.clone(),
            );
            let (handle, deliveries) = consumer.subscribe().await?;
            self.handles.push(handle);
            streams.push(deliveries);
        }

        self.deliveries = Some(in_delivery_order(streams));
        self.phase = ConsumerPhase::Consuming;
        Ok(())
    }

    async fn run(&mut self, shutdown: Shutdown) -> Result<()> {
        let mut deliveries = self.deliveries.take().ok_or_else(|| {
            SensorError::ChannelError("run() called before a successful setup()".to_string())
        })?;

        let endpoint = self.connection.endpoint();
        info!(
            "Starting to consume messages from RabbitMQ on {}:{} for {:?}",
            endpoint.host,
            endpoint.port,
            self.queue_names()
        );

        let mut shutdown = shutdown;
        loop {
            // Shutdown is only observed between deliveries, never mid-message.
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping consumption");
                    break;
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok((consumer, message))) => consumer.on_message(message).await?,
                Some(Err(e)) => {
                    error!("Error receiving message: {}", e);
                    return Err(e);
                }
                None => {
                    info!("All consumers were cancelled by the broker");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn cleanup(&mut self) -> Result<()> {
        self.deliveries = None;
        self.handles.clear();
        self.phase = ConsumerPhase::Idle;
        self.connection.close().await
    }
}
