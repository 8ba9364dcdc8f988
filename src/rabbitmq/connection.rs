// src/rabbitmq/connection.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use super::errors::{Result, SensorError};
use super::transport::{BrokerChannel, BrokerConnector};

/// Unacknowledged messages allowed in flight per consumer.
pub const PREFETCH_COUNT: u16 = 1;

pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_BLOCKED_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(600);

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where and how to reach the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub vhost: Option<String>,
    pub socket_timeout: Duration,
    pub blocked_connection_timeout: Duration,
    pub heartbeat: Duration,
}

impl BrokerEndpoint {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            credentials: None,
            vhost: None,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            blocked_connection_timeout: DEFAULT_BLOCKED_CONNECTION_TIMEOUT,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = Some(vhost.into());
        self
    }

    pub fn with_timeouts(
        mut self,
        socket_timeout: Duration,
        blocked_connection_timeout: Duration,
    ) -> Self {
        self.socket_timeout = socket_timeout;
        self.blocked_connection_timeout = blocked_connection_timeout;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Logs every connection parameter at debug level, password redacted.
    fn log_parameters(&self) {
        debug!("Connecting to RabbitMQ with host = {:?}", self.host);
        debug!("Connecting to RabbitMQ with port = {}", self.port);
        debug!("Connecting to RabbitMQ with socket_timeout = {:?}", self.socket_timeout);
        debug!(
            "Connecting to RabbitMQ with blocked_connection_timeout = {:?}",
            self.blocked_connection_timeout
        );
        debug!("Connecting to RabbitMQ with heartbeat = {:?}", self.heartbeat);
        if let Some(credentials) = &self.credentials {
            debug!("Connecting to RabbitMQ with credentials = {:?}", credentials);
        }
        if let Some(vhost) = &self.vhost {
            debug!("Connecting to RabbitMQ with virtual_host = {:?}", vhost);
        }
    }
}

/// Owns the broker connection and its one channel.
pub struct ConnectionManager {
    endpoint: BrokerEndpoint,
    connector: Arc<dyn BrokerConnector>,
    channel: Option<Arc<dyn BrokerChannel>>,
}

impl ConnectionManager {
    pub fn new(endpoint: BrokerEndpoint, connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            endpoint,
            connector,
            channel: None,
        }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Opens the connection and channel and limits it to one message in flight.
    ///
    /// A failure is reported once and never retried here; restarting is up to
    /// whoever supervises the sensor.
    pub async fn connect(&mut self) -> Result<Arc<dyn BrokerChannel>> {
        if let Some(channel) = &self.channel {
            return Ok(channel.clone());
        }

        self.endpoint.log_parameters();
        info!("Connecting to RabbitMQ on {}:{}", self.endpoint.host, self.endpoint.port);

        let channel = match self.connector.connect(&self.endpoint).await {
            Ok(channel) => channel,
            Err(e) => {
                error!("Connecting to RabbitMQ failed: {}", e);
                return Err(match e {
                    SensorError::ConnectionError(_) => e,
                    other => SensorError::ConnectionError(other.to_string()),
                });
            }
        };

        // Keep the channel before configuring it so close() still reaches it on failure.
        self.channel = Some(channel.clone());

        debug!("Setting QOS on RabbitMQ Channel");
        channel.basic_qos(PREFETCH_COUNT).await?;

        info!("Connected to RabbitMQ on {}:{}", self.endpoint.host, self.endpoint.port);
        Ok(channel)
    }

    pub fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.channel
            .clone()
            .ok_or_else(|| SensorError::ChannelError("No open channel".to_string()))
    }

    pub async fn declare_queue(&self, queue: &str) -> Result<()> {
        let channel = self.channel()?;
        channel.queue_declare(queue).await.map_err(|e| match e {
            SensorError::DeclarationError { .. } => e,
            other => SensorError::DeclarationError {
                queue: queue.to_string(),
                reason: other.to_string(),
            },
        })
    }

    /// Closes the connection if one is open. Later calls do nothing.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.take() {
            info!("Closing RabbitMQ connection to {}:{}", self.endpoint.host, self.endpoint.port);
            channel.close().await?;
        }
        Ok(())
    }
}
