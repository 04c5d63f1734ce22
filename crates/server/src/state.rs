use std::sync::Arc;

use orderflow_queue::{IngestMetrics, PipelineStatus};
use orderflow_storage::OrderCache;

/// Shared handles the HTTP layer reads from. The server never writes orders.
pub struct AppState {
    pub cache: Arc<dyn OrderCache>,
    pub metrics: Arc<IngestMetrics>,
    pub status: Arc<PipelineStatus>,
}
