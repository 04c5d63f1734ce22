//! Message bus error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("subscribe error on '{channel}': {reason}")]
    Subscribe { channel: String, reason: String },

    #[error("unsubscribe error: {0}")]
    Unsubscribe(String),

    #[error("bus connection is closed")]
    Closed,
}
