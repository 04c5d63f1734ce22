//! NATS JetStream [`MessageBus`].
//!
//! A channel maps to a subject captured by one stream. Every subscription is
//! a pull consumer with explicit acks; a durable name makes the consumer
//! durable, so its position survives restarts until it is deleted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::connection::State;
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use orderflow_core::config::NatsConfig;

use crate::bus::{BusMessage, MessageBus, MessageHandler, Subscription};
use crate::error::BusError;

/// Backoff after a failed pull grows from this base.
const PULL_RETRY_BASE: Duration = Duration::from_millis(200);
const PULL_RETRY_CAP: Duration = Duration::from_secs(30);
/// A delivery loop gives up after this many failed pulls in a row.
const MAX_CONSECUTIVE_PULL_ERRORS: u32 = 10;

pub struct NatsBus {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    stream: String,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl NatsBus {
    /// Connect to the server at `config.url`.
    pub async fn connect(config: &NatsConfig) -> Result<Self, BusError> {
        info!(url = %config.url, stream = %config.stream, "connecting to NATS");
        let client = async_nats::ConnectOptions::new()
            .name(config.client_name.as_str())
            .connect(config.url.as_str())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            jetstream: jetstream::new(client.clone()),
            client,
            stream: config.stream.clone(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Whether the underlying connection is currently up.
    pub fn is_connected(&self) -> bool {
        matches!(self.client.connection_state(), State::Connected)
    }

    async fn stream_for(&self, channel: &str) -> Result<jetstream::stream::Stream, BusError> {
        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: self.stream.clone(),
                subjects: vec![channel.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Subscribe {
                channel: channel.to_string(),
                reason: e.to_string(),
            })
    }
}

fn consumer_config(channel: &str, durable_name: Option<&str>) -> pull::Config {
    pull::Config {
        durable_name: durable_name.map(str::to_string),
        ack_policy: AckPolicy::Explicit,
        filter_subject: channel.to_string(),
        ..Default::default()
    }
}

fn pull_backoff(consecutive_errors: u32) -> Duration {
    PULL_RETRY_BASE
        .saturating_mul(2u32.pow(consecutive_errors.min(8)))
        .min(PULL_RETRY_CAP)
}

/// JetStream counts deliveries from 1; anything else is treated as a first delivery.
fn delivery_count(delivered: i64) -> u64 {
    u64::try_from(delivered).ok().filter(|n| *n > 0).unwrap_or(1)
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn subscribe(
        &self,
        channel: &str,
        durable_name: Option<&str>,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let subscribe_err = |e: &dyn std::fmt::Display| BusError::Subscribe {
            channel: channel.to_string(),
            reason: e.to_string(),
        };

        let stream = self.stream_for(channel).await?;
        let config = consumer_config(channel, durable_name);
        let consumer: jetstream::consumer::Consumer<pull::Config> = match durable_name {
            Some(name) => stream.get_or_create_consumer(name, config).await,
            None => stream.create_consumer(config).await,
        }
        .map_err(|e| subscribe_err(&e))?;
        let consumer_name = consumer.cached_info().name.clone();

        let messages = consumer.messages().await.map_err(|e| subscribe_err(&e))?;

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(deliver(
            messages,
            handler,
            stop_rx,
            self.shutdown.subscribe(),
        ));
        self.tasks.lock().await.push(task);

        info!(channel, consumer = %consumer_name, durable = durable_name.is_some(), "subscribed");
        Ok(Box::new(NatsSubscription {
            channel: channel.to_string(),
            consumer_name,
            stream,
            stop,
        }))
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(true);

        // Delivery loops exit between messages; wait for in-flight handlers.
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "delivery task ended abnormally");
            }
        }

        // Drain flushes pending publishes, then closes the connection for
        // every clone of the client, including the JetStream contexts.
        self.client
            .drain()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        info!("NATS connection closed");
        Ok(())
    }
}

/// Serial delivery loop for one consumer.
///
/// The handler runs outside the `select!`, so a stop signal never cancels
/// it mid-message. The message is acked after the handler returns. Failed
/// pulls back off exponentially; the loop stops after
/// [`MAX_CONSECUTIVE_PULL_ERRORS`] of them in a row.
async fn deliver(
    mut messages: pull::Stream,
    handler: MessageHandler,
    mut stop: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut consecutive_errors: u32 = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = shutdown.changed() => break,
            next = messages.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => {
                consecutive_errors = 0;
                message
            }
            Some(Err(e)) => {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_PULL_ERRORS {
                    error!(error = %e, consecutive_errors, "pull keeps failing, stopping delivery");
                    break;
                }
                let backoff = pull_backoff(consecutive_errors);
                warn!(
                    error = %e,
                    consecutive_errors,
                    backoff_ms = backoff.as_millis() as u64,
                    "failed to pull message"
                );
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(backoff) => continue,
                }
            }
            None => break,
        };

        let (sequence, deliveries) = match message.info() {
            Ok(info) => (Some(info.stream_sequence), delivery_count(info.delivered)),
            Err(_) => (None, 1),
        };
        let delivered = BusMessage {
            subject: message.subject.to_string(),
            payload: message.payload.clone(),
            sequence,
            delivery_count: deliveries,
        };
        debug!(%delivered, "message received");

        handler(delivered).await;

        if let Err(e) = message.ack().await {
            warn!(error = %e, ?sequence, "failed to acknowledge message");
        }
    }
    debug!("delivery loop stopped");
}

/// Dropping the handle stops delivery but leaves the consumer on the server.
pub struct NatsSubscription {
    channel: String,
    consumer_name: String,
    stream: jetstream::stream::Stream,
    stop: watch::Sender<bool>,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn unsubscribe(&self) -> Result<(), BusError> {
        self.stop.send_replace(true);
        self.stream
            .delete_consumer(&self.consumer_name)
            .await
            .map_err(|e| BusError::Unsubscribe(e.to_string()))?;
        info!(channel = %self.channel, consumer = %self.consumer_name, "unsubscribed");
        Ok(())
    }

    fn channel(&self) -> &str {
        &self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durable_consumer_config() {
        let config = consumer_config("orders", Some("orders-durable"));
        assert_eq!(config.durable_name.as_deref(), Some("orders-durable"));
        assert_eq!(config.filter_subject, "orders");
        assert_eq!(config.ack_policy, AckPolicy::Explicit);
    }

    #[test]
    fn ephemeral_consumer_config() {
        let config = consumer_config("orders", None);
        assert!(config.durable_name.is_none());
        assert_eq!(config.ack_policy, AckPolicy::Explicit);
    }

    #[test]
    fn pull_backoff_grows_and_is_capped() {
        assert_eq!(pull_backoff(1), Duration::from_millis(400));
        assert_eq!(pull_backoff(2), Duration::from_millis(800));
        assert!(pull_backoff(3) > pull_backoff(2));
        assert_eq!(pull_backoff(9), PULL_RETRY_CAP);
        assert_eq!(pull_backoff(u32::MAX), PULL_RETRY_CAP);
    }

    #[test]
    fn delivery_count_is_at_least_one() {
        assert_eq!(delivery_count(1), 1);
        assert_eq!(delivery_count(3), 3);
        assert_eq!(delivery_count(0), 1);
        assert_eq!(delivery_count(-4), 1);
    }

    #[tokio::test]
    async fn connect_to_unreachable_server_fails() {
        let config = NatsConfig {
            url: "nats://127.0.0.1:1".into(),
            stream: "ORDERS".into(),
            channel: "orders".into(),
            durable_name: None,
            client_name: "test".into(),
        };
        let result = NatsBus::connect(&config).await;
        assert!(matches!(result, Err(BusError::Connection(_))));
    }
}
