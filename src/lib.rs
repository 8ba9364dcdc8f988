//! Consumes messages from RabbitMQ queues and forwards each one to a host as a
//! `rabbitmq.new_message` event.
//!
//! Messages are handled one at a time per channel (prefetch 1) and every
//! delivered message is acknowledged exactly once, whether or not the host
//! accepted the event.

pub mod config;
pub mod dispatch;
pub mod rabbitmq;
pub mod sensor;

pub use config::{SensorConfig, SensorSettings};
pub use dispatch::{ChannelDispatcher, EventDispatcher, StdoutDispatcher};
pub use rabbitmq::{ForwardedEvent, LapinConnector, SensorError};
pub use sensor::{drive, RabbitMqQueueSensor, Sensor, Shutdown};
