//! In-process [`MessageBus`].
//!
//! Delivers published payloads to every live subscription on the same
//! subject, one message at a time per subscription. Nothing is durable: a
//! durable name is accepted but positions do not survive the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::{BusMessage, MessageBus, MessageHandler, Subscription};
use crate::error::BusError;

#[derive(Default)]
struct Registry {
    closed: bool,
    next_id: u64,
    sequence: u64,
    subscribers: HashMap<u64, Subscriber>,
}

struct Subscriber {
    channel: String,
    tx: mpsc::UnboundedSender<BusMessage>,
    stopped: Arc<AtomicBool>,
}

impl Subscriber {
    fn stop(self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Dropping `tx` wakes an idle delivery loop.
    }
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `payload` on `subject`; returns how many subscriptions got it.
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<usize, BusError> {
        let mut registry = self.lock();
        if registry.closed {
            return Err(BusError::Closed);
        }
        registry.sequence += 1;
        let message = BusMessage {
            subject: subject.to_string(),
            payload: payload.into(),
            sequence: Some(registry.sequence),
            delivery_count: 1,
        };

        let delivered = registry
            .subscribers
            .values()
            .filter(|s| s.channel == subject)
            .filter(|s| s.tx.send(message.clone()).is_ok())
            .count();
        Ok(delivered)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn subscribe(
        &self,
        channel: &str,
        durable_name: Option<&str>,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<BusMessage>();
        let stopped = Arc::new(AtomicBool::new(false));

        let id = {
            let mut registry = self.lock();
            if registry.closed {
                return Err(BusError::Closed);
            }
            registry.next_id += 1;
            let id = registry.next_id;
            registry.subscribers.insert(
                id,
                Subscriber {
                    channel: channel.to_string(),
                    tx,
                    stopped: stopped.clone(),
                },
            );
            id
        };

        let flag = stopped.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                handler(message).await;
            }
        });

        debug!(channel, durable = durable_name.unwrap_or("(none)"), "memory subscription started");
        Ok(Box::new(MemorySubscription {
            id,
            channel: channel.to_string(),
            registry: self.registry.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BusError> {
        let mut registry = self.lock();
        if registry.closed {
            return Ok(());
        }
        registry.closed = true;
        for (_, subscriber) in registry.subscribers.drain() {
            subscriber.stop();
        }
        Ok(())
    }
}

struct MemorySubscription {
    id: u64,
    channel: String,
    registry: Arc<Mutex<Registry>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn unsubscribe(&self) -> Result<(), BusError> {
        let removed = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .remove(&self.id);
        if let Some(subscriber) = removed {
            subscriber.stop();
        }
        Ok(())
    }

    fn channel(&self) -> &str {
        &self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::{oneshot, Notify};
    use tokio::time::timeout;

    fn counting() -> (MessageHandler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let h = handler(move |_msg| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (h, count)
    }

    async fn wait_for(count: &AtomicUsize, expected: usize) {
        timeout(Duration::from_secs(2), async {
            while count.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handler never reached expected count");
    }

    #[tokio::test]
    async fn delivers_only_matching_subject() {
        let bus = MemoryBus::new();
        let (h, count) = counting();
        let _sub = bus.subscribe("orders", None, h).await.unwrap();

        assert_eq!(bus.publish("orders", "{}").unwrap(), 1);
        assert_eq!(bus.publish("other", "{}").unwrap(), 0);
        wait_for(&count, 1).await;
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = MemoryBus::new();
        let (h, count) = counting();
        let sub = bus.subscribe("orders", Some("durable"), h).await.unwrap();
        assert_eq!(sub.channel(), "orders");

        sub.unsubscribe().await.unwrap();
        assert_eq!(bus.subscription_count(), 0);
        assert_eq!(bus.publish("orders", "{}").unwrap(), 0);
        // Second unsubscribe is harmless.
        sub.unsubscribe().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_rejects_new_work_and_is_idempotent() {
        let bus = MemoryBus::new();
        let (h, _) = counting();
        let _sub = bus.subscribe("orders", None, h.clone()).await.unwrap();

        bus.close().await.unwrap();
        bus.close().await.unwrap();
        assert!(bus.is_closed());
        assert!(matches!(bus.publish("orders", "{}"), Err(BusError::Closed)));
        assert!(matches!(bus.subscribe("orders", None, h).await, Err(BusError::Closed)));
    }

    #[tokio::test]
    async fn close_lets_running_handler_finish() {
        let bus = MemoryBus::new();
        let started = Arc::new(Notify::new());
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let done_tx = Arc::new(Mutex::new(Some(done_tx)));

        let h = {
            let started = started.clone();
            handler(move |_msg| {
                let started = started.clone();
                let release_rx = release_rx.clone();
                let done_tx = done_tx.clone();
                async move {
                    started.notify_one();
                    if let Some(rx) = release_rx.lock().await.take() {
                        let _ = rx.await;
                    }
                    if let Some(tx) = done_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                }
            })
        };

        let _sub = bus.subscribe("orders", None, h).await.unwrap();
        bus.publish("orders", "first").unwrap();
        bus.publish("orders", "second").unwrap();
        started.notified().await;

        bus.close().await.unwrap();
        release_tx.send(()).unwrap();
        timeout(Duration::from_secs(2), done_rx)
            .await
            .expect("in-flight handler was cancelled")
            .unwrap();
    }
}
