//! Graceful shutdown via `CancellationToken`.
//!
//! Cancelling the token stops the HTTP listener and the queue bridges. The
//! coordinator then removes every session so each conversation gets its final
//! flush, and waits for the background tasks to wind down.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::manager::ConnectionManager;

/// Default timeout for graceful shutdown before giving up on tasks.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinates shutdown across the listener, bridges and sessions.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel, flush every session, then wait up to `timeout` for `handles`.
    pub async fn graceful_shutdown(
        &self,
        manager: &ConnectionManager,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.shutdown();

        let sessions = manager.session_count();
        if tokio::time::timeout(timeout, manager.drain()).await.is_err() {
            warn!(sessions, "session drain timed out after {timeout:?}");
        }

        info!(task_count = handles.len(), timeout_secs = timeout.as_secs(), "waiting for tasks to complete");
        if tokio::time::timeout(timeout, futures::future::join_all(handles)).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
        }
    }
}
