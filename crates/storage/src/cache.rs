//! Read-through order cache.
//!
//! One reader/writer lock guards the whole map: reads run concurrently,
//! writes are exclusive. Writes are last-write-wins with no versioning.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

use orderflow_core::{Order, OrderId};

use crate::error::StorageError;
use crate::store::OrderStore;

/// Id-indexed read interface shared with the HTTP layer, plus the write side
/// used by the ingestion pipeline.
pub trait OrderCache: Send + Sync {
    /// A miss is [`StorageError::NotFound`], the same kind the store reports.
    fn get(&self, id: OrderId) -> Result<Arc<Order>, StorageError>;

    /// Insert or overwrite.
    fn set(&self, id: OrderId, order: Arc<Order>) -> Result<(), StorageError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    orders: RwLock<HashMap<OrderId, Arc<Order>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_orders(orders: HashMap<OrderId, Order>) -> Self {
        let orders = orders
            .into_iter()
            .map(|(id, order)| (id, Arc::new(order)))
            .collect();
        Self {
            orders: RwLock::new(orders),
        }
    }

    /// Build the startup cache from a full store scan.
    ///
    /// An empty store yields an empty cache. Any other store error is returned.
    pub async fn seed_from(store: &dyn OrderStore) -> Result<Self, StorageError> {
        match store.get_all().await {
            Ok(orders) => {
                info!(count = orders.len(), "cache seeded from store");
                Ok(Self::from_orders(orders))
            }
            Err(e) if e.is_not_found() => {
                info!("store is empty, starting with an empty cache");
                Ok(Self::new())
            }
            Err(e) => Err(e),
        }
    }
}

impl OrderCache for MemoryCache {
    fn get(&self, id: OrderId) -> Result<Arc<Order>, StorageError> {
        // Entries are replaced whole, so a poisoned map is still consistent.
        let orders = self.orders.read().unwrap_or_else(PoisonError::into_inner);
        orders.get(&id).cloned().ok_or(StorageError::NotFound(Some(id)))
    }

    fn set(&self, id: OrderId, order: Arc<Order>) -> Result<(), StorageError> {
        let mut orders = self.orders.write().unwrap_or_else(|poisoned| {
            warn!(order_id = id, "cache lock was poisoned, recovering");
            poisoned.into_inner()
        });
        orders.insert(id, order);
        Ok(())
    }

    fn len(&self) -> usize {
        self.orders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
