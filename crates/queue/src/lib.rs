pub mod bus;
pub mod error;
pub mod memory;
pub mod nats;
pub mod pipeline;
pub mod shutdown;

pub use bus::{handler, BusMessage, MessageBus, MessageHandler, Subscription};
pub use error::BusError;
pub use memory::MemoryBus;
pub use nats::{NatsBus, NatsSubscription};
pub use pipeline::{IngestMetrics, IngestPipeline, IngestSnapshot, Outcome, PipelineState, PipelineStatus};
pub use shutdown::{termination_signal, ShutdownCoordinator};
