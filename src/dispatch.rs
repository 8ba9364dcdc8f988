// src/dispatch.rs
// Host side of the pipeline: where forwarded events end up.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::{mpsc, Mutex};

use crate::rabbitmq::ForwardedEvent;

/// Receives every forwarded event. Errors are the host's own and are passed
/// back to the consumption loop after the message has been acknowledged.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn dispatch(&self, trigger: &str, event: ForwardedEvent) -> anyhow::Result<()>;
}

/// Hands events to an embedding host over a bounded channel.
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<(String, ForwardedEvent)>,
}

impl ChannelDispatcher {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<(String, ForwardedEvent)>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventDispatcher for ChannelDispatcher {
    async fn dispatch(&self, trigger: &str, event: ForwardedEvent) -> anyhow::Result<()> {
        self.tx
            .send((trigger.to_string(), event))
            .await
            .map_err(|_| anyhow::anyhow!("event receiver has been dropped"))
    }
}

#[derive(Debug, Serialize)]
struct DispatchRecord<'a> {
    trigger: &'a str,
    payload: &'a ForwardedEvent,
    dispatched_at: DateTime<Utc>,
}

/// Writes one JSON line per event to stdout.
pub struct StdoutDispatcher {
    out: Mutex<Stdout>,
}

impl StdoutDispatcher {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }

    fn render(trigger: &str, event: &ForwardedEvent, at: DateTime<Utc>) -> anyhow::Result<String> {
        let record = DispatchRecord {
            trigger,
            payload: event,
            dispatched_at: at,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        Ok(line)
    }
}

impl Default for StdoutDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventDispatcher for StdoutDispatcher {
    async fn dispatch(&self, trigger: &str, event: ForwardedEvent) -> anyhow::Result<()> {
        let line = Self::render(trigger, &event, Utc::now())?;
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        out.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn channel_dispatcher_delivers_in_order() {
        let (dispatcher, mut rx) = ChannelDispatcher::new(4);
        for body in ["1", "2"] {
            dispatcher
                .dispatch(
                    "rabbitmq.new_message",
                    ForwardedEvent {
                        queue: "q".to_string(),
                        body: body.to_string(),
                    },
                )
                .await
                .unwrap();
        }

        assert_eq!(rx.recv().await.unwrap().1.body, "1");
        assert_eq!(rx.recv().await.unwrap().1.body, "2");
    }

    #[tokio::test]
    async fn channel_dispatcher_fails_once_receiver_is_gone() {
        let (dispatcher, rx) = ChannelDispatcher::new(1);
        drop(rx);

        let result = dispatcher
            .dispatch(
                "rabbitmq.new_message",
                ForwardedEvent {
                    queue: "q".to_string(),
                    body: String::new(),
                },
            )
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn stdout_record_is_one_json_line() {
        let event = ForwardedEvent {
            queue: "orders".to_string(),
            body: "hello".to_string(),
        };
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let line = StdoutDispatcher::render("rabbitmq.new_message", &event, at).unwrap();

        assert!(line.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed["trigger"], "rabbitmq.new_message");
        assert_eq!(parsed["payload"]["queue"], "orders");
        assert_eq!(parsed["payload"]["body"], "hello");
        assert_eq!(parsed["dispatched_at"], "2024-05-01T12:00:00Z");
    }
}
