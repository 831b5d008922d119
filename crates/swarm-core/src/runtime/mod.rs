//! Orchestrator runtime: owns the long-lived dispatcher and result
//! processor loops and their shared cancellation token.
//!
//! Each loop observes the token between iterations and between
//! timeout-bounded dequeues, so shutdown latency is bounded by the dequeue
//! timeout.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SwarmConfig;
use crate::coord::CoordStore;
use crate::dispatch::Dispatcher;
use crate::registry::Registry;
use crate::results::ResultProcessor;
use crate::worker_client::{WorkerClient, WorkerClientError};

/// Handle to the running loop set.
pub struct OrchestratorRuntime {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl OrchestratorRuntime {
    /// Spawn `dispatcher_concurrency` dispatchers and
    /// `result_processor_concurrency` result processors.
    pub fn start(
        pool: PgPool,
        coord: Arc<dyn CoordStore>,
        registry: Arc<Registry>,
        config: SwarmConfig,
    ) -> Result<Self, WorkerClientError> {
        let cancel = CancellationToken::new();
        let client = WorkerClient::new(config.dispatch_timeout())?;
        let mut handles = Vec::new();

        for instance in 0..config.dispatcher_concurrency {
            let dispatcher = Dispatcher::new(
                pool.clone(),
                Arc::clone(&coord),
                Arc::clone(&registry),
                client.clone(),
                config.clone(),
            );
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                tracing::info!(instance, "dispatcher loop started");
                dispatcher.run(token).await;
            }));
        }

        for instance in 0..config.result_processor_concurrency {
            let processor = ResultProcessor::new(
                pool.clone(),
                Arc::clone(&coord),
                Arc::clone(&registry),
                config.clone(),
            );
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                tracing::info!(instance, "result processor loop started");
                processor.run(token).await;
            }));
        }

        Ok(Self { cancel, handles })
    }

    /// A child token that is cancelled when the runtime shuts down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Signal every loop to stop and wait for them to drain.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "loop task panicked during shutdown");
            }
        }
        tracing::info!("orchestrator runtime stopped");
    }
}
