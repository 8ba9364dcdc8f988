// src/rabbitmq/consumer.rs

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, SelectAll, Stream, StreamExt};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::errors::{Result, SensorError};
use super::message::{
    render_body, DeserializationMethod, ForwardedEvent, InboundMessage, NEW_MESSAGE_TRIGGER,
};
use super::transport::BrokerChannel;
use crate::dispatch::EventDispatcher;

/// One configured queue and how its bodies are decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSubscription {
    pub queue: String,
    pub deserialization: Option<DeserializationMethod>,
}

impl QueueSubscription {
    pub fn new(queue: impl Into<String>, deserialization: Option<DeserializationMethod>) -> Self {
        Self {
            queue: queue.into(),
            deserialization,
        }
    }
}

/// Identifies a registered consumer on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub queue: String,
    pub consumer_tag: String,
}

/// Deliveries paired with the consumer that must handle them.
pub type RoutedDeliveries = BoxStream<'static, Result<(Arc<QueueConsumer>, InboundMessage)>>;

/// Merges the deliveries of every consumer on a channel into delivery order.
///
/// Delivery tags increase along a channel. Whatever is already buffered across
/// the consumers is drained first and handed out lowest tag first, so the
/// order never depends on which consumer happened to be polled first.
pub fn in_delivery_order(consumers: Vec<RoutedDeliveries>) -> RoutedDeliveries {
    DeliveryOrder {
        inner: stream::select_all(consumers),
        ready: BinaryHeap::new(),
        exhausted: false,
    }
    .boxed()
}

struct Buffered(Arc<QueueConsumer>, InboundMessage);

impl Buffered {
    fn tag(&self) -> u64 {
        self.1.handle.delivery_tag()
    }
}

impl PartialEq for Buffered {
    fn eq(&self, other: &Self) -> bool {
        self.tag() == other.tag()
    }
}

impl Eq for Buffered {}

impl PartialOrd for Buffered {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Buffered {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tag().cmp(&other.tag())
    }
}

struct DeliveryOrder {
    inner: SelectAll<RoutedDeliveries>,
    ready: BinaryHeap<Reverse<Buffered>>,
    exhausted: bool,
}

impl Stream for DeliveryOrder {
    type Item = Result<(Arc<QueueConsumer>, InboundMessage)>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        while !this.exhausted {
            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok((consumer, message)))) => {
                    this.ready.push(Reverse(Buffered(consumer, message)));
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => this.exhausted = true,
                Poll::Pending => break,
            }
        }

        match this.ready.pop() {
            Some(Reverse(Buffered(consumer, message))) => {
                Poll::Ready(Some(Ok((consumer, message))))
            }
            None if this.exhausted => Poll::Ready(None),
            None => Poll::Pending,
        }
    }
}

/// Forwards the messages of a single queue to the host.
pub struct QueueConsumer {
    subscription: QueueSubscription,
    channel: Arc<dyn BrokerChannel>,
    dispatcher: Arc<dyn EventDispatcher>,
}

impl QueueConsumer {
    pub fn new(
        subscription: QueueSubscription,
        channel: Arc<dyn BrokerChannel>,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            subscription,
            channel,
            dispatcher,
        })
    }

    pub fn queue(&self) -> &str {
        &self.subscription.queue
    }

    /// Registers a broker consumer for this queue.
    ///
    /// Every delivery on the returned stream is paired with this consumer, so
    /// routing never depends on anything but the subscription it came from.
    pub async fn subscribe(self: &Arc<Self>) -> Result<(SubscriptionHandle, RoutedDeliveries)> {
        let consumer_tag = format!(
            "{}-{}-{}",
            env!("CARGO_PKG_NAME"),
            self.subscription.queue,
            &Uuid::new_v4().simple().to_string()[..8]
        );

        let deliveries = self
            .channel
            .basic_consume(&self.subscription.queue, &consumer_tag)
            .await?;

        let owner = Arc::clone(self);
        let routed = deliveries
            .map(move |delivery| delivery.map(|message| (Arc::clone(&owner), message)))
            .boxed();

        Ok((
            SubscriptionHandle {
                queue: self.subscription.queue.clone(),
                consumer_tag,
            },
            routed,
        ))
    }

    /// Builds the event forwarded for a raw body, falling back to the raw text
    /// when the configured decoding fails.
    pub fn forwarded_event(&self, body: &[u8]) -> ForwardedEvent {
        let (body, decode_error) = render_body(self.subscription.deserialization, body);
        if let Some(e) = decode_error {
            warn!(
                queue = %self.subscription.queue,
                "Forwarding raw body, deserialization failed: {}", e
            );
        }
        ForwardedEvent {
            queue: self.subscription.queue.clone(),
            body,
        }
    }

    /// Forwards one delivery and acknowledges it.
    ///
    /// The ack is sent whether or not dispatch succeeded. A dispatch failure is
    /// returned afterwards.
    pub async fn on_message(&self, message: InboundMessage) -> Result<()> {
        let event = self.forwarded_event(&message.body);
        debug!(
            "Received message for queue {} with body {}",
            event.queue, event.body
        );

        let dispatched = self
            .dispatcher
            .dispatch(NEW_MESSAGE_TRIGGER, event)
            .await
            .map_err(|e| SensorError::DispatchError(format!("{:#}", e)));

        let acked = self.channel.basic_ack(message.handle).await;

        match (dispatched, acked) {
            (Ok(()), Ok(())) => {
                debug!(
                    queue = %self.subscription.queue,
                    delivery_tag = message.handle.delivery_tag(),
                    "Message acknowledged"
                );
                Ok(())
            }
            (Err(dispatch_err), Ok(())) => {
                error!(queue = %self.subscription.queue, "Dispatch failed: {}", dispatch_err);
                Err(dispatch_err)
            }
            (Ok(()), Err(ack_err)) => {
                error!(
                    queue = %self.subscription.queue,
                    "Failed to acknowledge message: {}", ack_err
                );
                Err(ack_err)
            }
            (Err(dispatch_err), Err(ack_err)) => {
                error!(queue = %self.subscription.queue, "Dispatch failed: {}", dispatch_err);
                error!(
                    queue = %self.subscription.queue,
                    "Failed to acknowledge message: {}", ack_err
                );
                Err(dispatch_err)
            }
        }
    }
}
