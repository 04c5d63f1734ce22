//! Message bus trait and types.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BusError;

/// A raw message delivered by the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Subject (channel) the message was published on.
    pub subject: String,
    /// Raw payload, expected to be an order JSON document.
    pub payload: Bytes,
    /// Provider sequence number, when the bus assigns one.
    pub sequence: Option<u64>,
    /// Number of times this message has been delivered (1 = first time).
    pub delivery_count: u64,
}

impl BusMessage {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BusMessage {{ subject: {}, seq: {:?}, bytes: {}, deliveries: {} }}",
            self.subject,
            self.sequence,
            self.payload.len(),
            self.delivery_count
        )
    }
}

/// Boxed async callback invoked once per delivered message.
///
/// The bus acknowledges the message after the returned future completes,
/// whatever happened inside it.
pub type MessageHandler =
    Arc<dyn Fn(BusMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(BusMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg| -> Pin<Box<dyn Future<Output = ()> + Send>> { Box::pin(f(msg)) })
}

/// Trait for message bus backends.
///
/// A backend owns one connection. Each subscription gets its own delivery
/// loop that runs the handler for one message at a time.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Start delivering messages published on `channel` to `handler`.
    ///
    /// With a `durable_name` the delivery position is kept server-side under
    /// that name and survives restarts; without one the subscription is
    /// ephemeral.
    async fn subscribe(
        &self,
        channel: &str,
        durable_name: Option<&str>,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>, BusError>;

    /// Stop all deliveries and close the connection.
    ///
    /// A handler already running is allowed to finish. Closing twice is a no-op.
    async fn close(&self) -> Result<(), BusError>;
}

/// Handle to one active subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Stop delivery and remove the subscription's server-side state,
    /// including a durable position if there is one.
    async fn unsubscribe(&self) -> Result<(), BusError>;

    fn channel(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(count: u64) -> BusMessage {
        BusMessage {
            subject: "orders".into(),
            payload: Bytes::from_static(b"{}"),
            sequence: Some(7),
            delivery_count: count,
        }
    }

    #[test]
    fn redelivery_flag() {
        assert!(!message(1).is_redelivery());
        assert!(message(2).is_redelivery());
    }

    #[test]
    fn display_omits_payload() {
        let shown = message(1).to_string();
        assert!(shown.contains("subject: orders"));
        assert!(shown.contains("bytes: 2"));
    }

    #[tokio::test]
    async fn handler_wraps_async_closure() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let h = handler(move |msg| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(msg.payload.len(), Ordering::SeqCst);
            }
        });
        h(message(1)).await;
        h(message(1)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }
}
