use thiserror::Error;

/// Why an inbound payload was not turned into an [`Order`](crate::Order).
///
/// None of these are retryable: the same bytes fail the same way on redelivery.
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("malformed JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("type mismatch: {0}")]
    TypeMismatch(#[source] serde_json::Error),

    #[error("missing required field '{0}' (only 'internal_signature' may be empty)")]
    MissingField(&'static str),
}

impl DocumentError {
    /// Syntax-level failure, as opposed to a well-formed but invalid document.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}
