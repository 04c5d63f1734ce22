//! Order persistence: the durable store, its startup bootstrap, and the
//! in-memory read cache that mirrors it.

pub mod bootstrap;
pub mod cache;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use bootstrap::{connect_with_retry, RetryPolicy};
pub use cache::{MemoryCache, OrderCache};
pub use error::StorageError;
pub use memory::MemoryOrderStore;
pub use postgres::{PgOrderStore, PoolSettings};
pub use store::OrderStore;
