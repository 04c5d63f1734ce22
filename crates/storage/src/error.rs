use std::time::Duration;

use thiserror::Error;

use orderflow_core::OrderId;

/// Errors shared by the durable store and the in-memory cache.
///
/// A miss is always [`StorageError::NotFound`], whichever layer reported it,
/// so readers can map it to a client error without knowing the source.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("store unreachable: gave up after {attempts} attempt(s) in {budget:?}")]
    StartupTimeout { budget: Duration, attempts: u32 },

    #[error("{}", describe_miss(.0))]
    NotFound(Option<OrderId>),

    #[error("persistence failure: {0}")]
    Persistence(#[source] sqlx::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cache write failed: {0}")]
    CacheWrite(String),
}

fn describe_miss(id: &Option<OrderId>) -> String {
    match id {
        Some(id) => format!("order {id} not found"),
        None => "no orders stored".to_string(),
    }
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
