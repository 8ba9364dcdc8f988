// In-memory broker used by the integration tests.
//
// It behaves like a channel with prefetch 1: the next scripted delivery is
// only pushed once everything in flight has been acknowledged. `deliver`
// bypasses the limit to stand in for a broker that lets each consumer hold
// its own unacked message.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use rabbitmq_queue_sensor::rabbitmq::{
    BrokerChannel, BrokerConnector, BrokerEndpoint, DeliveryHandle, DeliveryStream,
    InboundMessage, Result, SensorError,
};
use tokio::sync::mpsc;

#[derive(Default)]
struct State {
    script: VecDeque<(String, Vec<u8>)>,
    senders: HashMap<String, mpsc::UnboundedSender<Result<InboundMessage>>>,
    next_tag: u64,
    in_flight: VecDeque<(u64, String)>,
    acks: Vec<(u64, String)>,
    out_of_order_acks: usize,
    declared: Vec<String>,
    consumer_tags: Vec<String>,
    prefetch: Option<u16>,
    connects: usize,
    closes: usize,
    refuse_connections: bool,
    start_on_consume: bool,
}

#[derive(Clone, Default)]
pub struct ScriptedBroker {
    state: Arc<Mutex<State>>,
}

impl ScriptedBroker {
    pub fn new<I, Q, B>(script: I) -> Self
    where
        I: IntoIterator<Item = (Q, B)>,
        Q: Into<String>,
        B: Into<Vec<u8>>,
    {
        let broker = Self::default();
        broker.state.lock().unwrap().script = script
            .into_iter()
            .map(|(queue, body)| (queue.into(), body.into()))
            .collect();
        broker
    }

    pub fn refusing_connections() -> Self {
        let broker = Self::default();
        broker.state.lock().unwrap().refuse_connections = true;
        broker
    }

    /// Pushes the first delivery as soon as its queue gets a consumer.
    pub fn starting_on_consume(self) -> Self {
        self.state.lock().unwrap().start_on_consume = true;
        self
    }

    /// Pushes the first scripted delivery. Later ones follow each ack.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        Self::release_next(&mut state);
    }

    /// Makes the consumer of `queue` fail with a delivery error.
    pub fn break_consumer(&self, queue: &str) {
        let state = self.state.lock().unwrap();
        let sender = state.senders.get(queue).expect("queue is not consumed");
        sender
            .send(Err(SensorError::ConsumeError("consumer cancelled".to_string())))
            .expect("consumer stream dropped");
    }

    /// Pushes a delivery to the consumer of `queue` right away, even while
    /// other deliveries are unacked.
    pub fn deliver(&self, queue: &str, body: &str) {
        let mut state = self.state.lock().unwrap();
        Self::push(&mut state, queue.to_string(), body.as_bytes().to_vec());
    }

    fn push(state: &mut State, queue: String, body: Vec<u8>) {
        state.next_tag += 1;
        let tag = state.next_tag;
        state.in_flight.push_back((tag, queue.clone()));
        let sender = state
            .senders
            .get(&queue)
            .unwrap_or_else(|| panic!("no consumer registered for {queue}"));
        let _ = sender.send(Ok(InboundMessage {
            queue,
            body,
            handle: DeliveryHandle::new(tag),
        }));
    }

    fn release_next(state: &mut State) {
        match state.script.pop_front() {
            Some((queue, body)) => Self::push(state, queue, body),
            // Nothing left: cancel every consumer so the loop ends.
            None => state.senders.clear(),
        }
    }

    pub fn acks(&self) -> Vec<(u64, String)> {
        self.state.lock().unwrap().acks.clone()
    }

    pub fn out_of_order_acks(&self) -> usize {
        self.state.lock().unwrap().out_of_order_acks
    }

    pub fn declared(&self) -> Vec<String> {
        self.state.lock().unwrap().declared.clone()
    }

    pub fn consumer_tags(&self) -> Vec<String> {
        self.state.lock().unwrap().consumer_tags.clone()
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.state.lock().unwrap().prefetch
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

#[async_trait]
impl BrokerConnector for ScriptedBroker {
    async fn connect(&self, _endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.refuse_connections {
            return Err(SensorError::ConnectionError("connection refused".to_string()));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl BrokerChannel for ScriptedBroker {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.state.lock().unwrap().prefetch = Some(prefetch_count);
        Ok(())
    }

    async fn queue_declare(&self, queue: &str) -> Result<()> {
        self.state.lock().unwrap().declared.push(queue.to_string());
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        state.senders.insert(queue.to_string(), tx);
        state.consumer_tags.push(consumer_tag.to_string());

        let front_is_consumed = state
            .script
            .front()
            .map_or(false, |(queue, _)| state.senders.contains_key(queue));
        if state.start_on_consume && state.in_flight.is_empty() && front_is_consumed {
            Self::release_next(&mut state);
        }

        let deliveries = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(deliveries.boxed())
    }

    async fn basic_ack(&self, handle: DeliveryHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let oldest = state.in_flight.front().map(|(tag, _)| *tag);
        if oldest != Some(handle.delivery_tag()) {
            state.out_of_order_acks += 1;
            return Err(SensorError::AckError(format!(
                "unexpected delivery tag {}",
                handle.delivery_tag()
            )));
        }

        if let Some(acked) = state.in_flight.pop_front() {
            state.acks.push(acked);
        }
        if state.in_flight.is_empty() {
            Self::release_next(&mut state);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.closes += 1;
        state.senders.clear();
        Ok(())
    }
}
