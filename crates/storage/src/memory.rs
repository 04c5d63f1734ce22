//! In-process [`OrderStore`] with the same id and miss semantics as Postgres.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use orderflow_core::{Order, OrderId};

use crate::error::StorageError;
use crate::store::OrderStore;

/// Non-durable store handing out sequential ids from 1, like a `BIGSERIAL`.
#[derive(Debug, Default)]
pub struct MemoryOrderStore {
    inner: RwLock<Rows>,
}

#[derive(Debug, Default)]
struct Rows {
    last_id: OrderId,
    orders: HashMap<OrderId, Order>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.orders.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn insert(&self, order: &Order) -> Result<OrderId, StorageError> {
        let mut rows = self.inner.write().await;
        rows.last_id += 1;
        let id = rows.last_id;
        rows.orders.insert(id, order.clone());
        Ok(id)
    }

    async fn get(&self, id: OrderId) -> Result<Order, StorageError> {
        self.inner
            .read()
            .await
            .orders
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound(Some(id)))
    }

    async fn get_all(&self) -> Result<HashMap<OrderId, Order>, StorageError> {
        let rows = self.inner.read().await;
        if rows.orders.is_empty() {
            return Err(StorageError::NotFound(None));
        }
        Ok(rows.orders.clone())
    }
}
