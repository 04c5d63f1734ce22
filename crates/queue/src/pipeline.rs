//! Order ingestion pipeline.
//!
//! Each delivered message goes through decode → validate → store insert →
//! cache mirror. Every step is fail-fast and none is retried: a rejected or
//! unpersisted message is logged and dropped, and the bus acknowledges it
//! once the handler returns.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use orderflow_core::{DocumentError, Order, OrderId};
use orderflow_storage::{OrderCache, OrderStore, StorageError};

use crate::bus::{BusMessage, MessageBus, MessageHandler, Subscription};
use crate::error::BusError;

// ── Lifecycle state ──────────────────────────────────────────────────

/// Lifecycle of a pipeline and its bus connection.
///
/// `Idle → Subscribed → {Processing → Subscribed}* → ShuttingDown →
/// (Unsubscribed | DurableKept) → ConnectionClosed → Done`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Subscribed,
    Processing,
    ShuttingDown,
    Unsubscribed,
    DurableKept,
    ConnectionClosed,
    Done,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Subscribed => "subscribed",
            Self::Processing => "processing",
            Self::ShuttingDown => "shutting_down",
            Self::Unsubscribed => "unsubscribed",
            Self::DurableKept => "durable_kept",
            Self::ConnectionClosed => "connection_closed",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Shared, observable [`PipelineState`].
#[derive(Debug)]
pub struct PipelineStatus {
    tx: watch::Sender<PipelineState>,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStatus {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PipelineState::Idle);
        Self { tx }
    }

    pub fn current(&self) -> PipelineState {
        *self.tx.borrow()
    }

    pub fn set(&self, state: PipelineState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "pipeline state");
        }
    }

    /// Move to `to` only if the current state is `from`.
    pub fn transition(&self, from: PipelineState, to: PipelineState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    pub fn watch(&self) -> watch::Receiver<PipelineState> {
        self.tx.subscribe()
    }
}

// ── Metrics ──────────────────────────────────────────────────────────

/// Monotonic per-pipeline counters.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    received: AtomicU64,
    stored: AtomicU64,
    rejected: AtomicU64,
    persist_failures: AtomicU64,
    cache_failures: AtomicU64,
}

/// Point-in-time copy of [`IngestMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub received: u64,
    pub stored: u64,
    pub rejected: u64,
    pub persist_failures: u64,
    pub cache_failures: u64,
}

impl IngestSnapshot {
    /// Messages whose handling has finished, whatever the outcome.
    pub fn handled(&self) -> u64 {
        self.stored + self.rejected + self.persist_failures
    }
}

impl IngestMetrics {
    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            received: self.received.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            cache_failures: self.cache_failures.load(Ordering::Relaxed),
        }
    }
}

// ── Outcome ──────────────────────────────────────────────────────────

/// What happened to one message.
#[derive(Debug)]
pub enum Outcome {
    /// Persisted and mirrored into the cache.
    Stored(OrderId),
    /// Persisted, but the cache write failed. The store row is kept.
    StoredUncached(OrderId, StorageError),
    /// Failed decode or validation; nothing was written.
    Rejected(DocumentError),
    /// Valid, but the store write failed; the order is dropped.
    PersistFailed(StorageError),
}

impl Outcome {
    /// Id assigned by the store, if the order reached it.
    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            Self::Stored(id) | Self::StoredUncached(id, _) => Some(*id),
            Self::Rejected(_) | Self::PersistFailed(_) => None,
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────

/// Decodes bus messages into orders and writes them to store and cache.
pub struct IngestPipeline {
    store: Arc<dyn OrderStore>,
    cache: Arc<dyn OrderCache>,
    metrics: Arc<IngestMetrics>,
    status: Arc<PipelineStatus>,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn OrderStore>, cache: Arc<dyn OrderCache>) -> Self {
        Self {
            store,
            cache,
            metrics: Arc::new(IngestMetrics::default()),
            status: Arc::new(PipelineStatus::new()),
        }
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        self.metrics.clone()
    }

    pub fn status(&self) -> Arc<PipelineStatus> {
        self.status.clone()
    }

    /// Process one raw payload to completion.
    pub async fn handle(&self, payload: &[u8]) -> Outcome {
        self.metrics.received.fetch_add(1, Ordering::Relaxed);

        let order = match Order::from_slice(payload) {
            Ok(order) => order,
            Err(e) => {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                if e.is_malformed() {
                    warn!(error = %e, bytes = payload.len(), "dropping malformed message");
                } else {
                    warn!(error = %e, "dropping invalid order");
                }
                return Outcome::Rejected(e);
            }
        };

        let id = match self.store.insert(&order).await {
            Ok(id) => id,
            Err(e) => {
                self.metrics.persist_failures.fetch_add(1, Ordering::Relaxed);
                error!(order_uid = %order.order_uid, error = %e, "store insert failed, order dropped");
                return Outcome::PersistFailed(e);
            }
        };

        self.metrics.stored.fetch_add(1, Ordering::Relaxed);
        match self.cache.set(id, Arc::new(order)) {
            Ok(()) => {
                debug!(order_id = id, "order stored and cached");
                Outcome::Stored(id)
            }
            Err(e) => {
                self.metrics.cache_failures.fetch_add(1, Ordering::Relaxed);
                error!(order_id = id, error = %e, "cache write failed, order is stored only");
                Outcome::StoredUncached(id, e)
            }
        }
    }

    /// Adapt this pipeline to the bus callback shape.
    pub fn handler(self: &Arc<Self>) -> MessageHandler {
        let pipeline = Arc::clone(self);
        crate::bus::handler(move |msg: BusMessage| {
            let pipeline = pipeline.clone();
            async move {
                if msg.is_redelivery() {
                    debug!(message = %msg, "redelivered message");
                }
                pipeline
                    .status
                    .transition(PipelineState::Subscribed, PipelineState::Processing);
                pipeline.handle(&msg.payload).await;
                pipeline
                    .status
                    .transition(PipelineState::Processing, PipelineState::Subscribed);
            }
        })
    }

    /// Subscribe this pipeline to `channel`. Moves `Idle → Subscribed`.
    pub async fn subscribe(
        self: &Arc<Self>,
        bus: &dyn MessageBus,
        channel: &str,
        durable_name: Option<&str>,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let subscription = bus.subscribe(channel, durable_name, self.handler()).await?;
        self.status.set(PipelineState::Subscribed);
        info!(channel, durable = durable_name.unwrap_or("(none)"), "listening for orders");
        Ok(subscription)
    }
}
