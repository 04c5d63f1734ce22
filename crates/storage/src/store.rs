//! The durable store seam.

use std::collections::HashMap;

use async_trait::async_trait;

use orderflow_core::{Order, OrderId};

use crate::error::StorageError;

/// Id-indexed persistence for orders.
///
/// Implementations must be safe for concurrent callers; every operation is a
/// single atomic statement, so callers need no extra locking.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persist an order and return its freshly assigned, unique id.
    ///
    /// Any backend failure is reported as [`StorageError::Persistence`].
    async fn insert(&self, order: &Order) -> Result<OrderId, StorageError>;

    /// Fetch one order. A missing row is [`StorageError::NotFound`].
    async fn get(&self, id: OrderId) -> Result<Order, StorageError>;

    /// Fetch every stored order, keyed by id.
    ///
    /// An empty store is reported as `NotFound(None)`.
    async fn get_all(&self) -> Result<HashMap<OrderId, Order>, StorageError>;
}
