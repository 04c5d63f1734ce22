//! Signal-driven shutdown of the ingestion side.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::bus::{MessageBus, Subscription};
use crate::pipeline::{PipelineState, PipelineStatus};

/// Resolve on SIGINT or SIGTERM (Unix) or Ctrl+C elsewhere.
///
/// If the handlers cannot be registered the failure is logged and the
/// future falls back to Ctrl+C.
pub async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "failed to register signal handlers, using ctrl_c");
                ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C"),
        Err(e) => {
            error!(error = %e, "failed to listen for ctrl_c, signal shutdown disabled");
            std::future::pending::<()>().await;
        }
    }
}

/// Tears down one subscription and its bus once a signal arrives.
///
/// Without a durable name the subscription is removed server-side; with one
/// it is left in place so the next run resumes from the stored position.
/// The connection is closed exactly once either way. Failures are logged and
/// never stop the sequence.
pub struct ShutdownCoordinator {
    bus: Arc<dyn MessageBus>,
    subscription: Box<dyn Subscription>,
    durable_name: Option<String>,
    status: Arc<PipelineStatus>,
}

impl ShutdownCoordinator {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        subscription: Box<dyn Subscription>,
        durable_name: Option<String>,
        status: Arc<PipelineStatus>,
    ) -> Self {
        Self {
            bus,
            subscription,
            durable_name,
            status,
        }
    }

    /// Run [`Self::run`] once `signal` resolves. The receiver fires when
    /// teardown is complete.
    pub fn spawn<S>(self, signal: S) -> oneshot::Receiver<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            signal.await;
            self.run().await;
            let _ = done_tx.send(());
        });
        done_rx
    }

    pub async fn run(self) {
        info!(channel = self.subscription.channel(), "shutting down ingestion");
        self.status.set(PipelineState::ShuttingDown);

        match &self.durable_name {
            None => match self.subscription.unsubscribe().await {
                Ok(()) => self.status.set(PipelineState::Unsubscribed),
                Err(e) => error!(error = %e, "unsubscribe failed"),
            },
            Some(name) => {
                info!(durable = %name, "keeping durable subscription");
                self.status.set(PipelineState::DurableKept);
            }
        }

        if let Err(e) = self.bus.close().await {
            error!(error = %e, "closing bus connection failed");
        }
        self.status.set(PipelineState::ConnectionClosed);

        self.status.set(PipelineState::Done);
        info!("ingestion shutdown complete");
    }
}
