//! Graceful shutdown handling for the control plane.
//!
//! Shutdown runs in phases:
//! 1. Signal the aggregator and flush loops, then wait for them to exit
//! 2. Stop the presence monitor and close every dashboard session
//! 3. Run one final usage flush, bounded by a deadline

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;

use crate::bridge::EventBridge;
use crate::connection_manager::TenantConnectionRegistry;
use crate::usage::{FlushPipeline, FlushReport};

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for background loops to exit (default: 5 seconds)
    pub task_timeout: Duration,
    /// Upper bound for the final usage flush (default: 5 seconds)
    pub final_flush_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(5),
            final_flush_timeout: Duration::from_secs(5),
        }
    }
}

pub struct GracefulShutdown {
    registry: Arc<TenantConnectionRegistry>,
    bridge: Arc<EventBridge>,
    flush: FlushPipeline,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(
        registry: Arc<TenantConnectionRegistry>,
        bridge: Arc<EventBridge>,
        flush: FlushPipeline,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self::with_config(registry, bridge, flush, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        registry: Arc<TenantConnectionRegistry>,
        bridge: Arc<EventBridge>,
        flush: FlushPipeline,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            registry,
            bridge,
            flush,
            shutdown_tx,
            config,
        }
    }

    /// Execute the shutdown sequence. `tasks` are the background loops
    /// listening on the shutdown channel.
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self, tasks),
        fields(total_sessions = self.registry.session_count())
    )]
    pub async fn execute(&self, reason: &str, tasks: Vec<JoinHandle<()>>) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Stopping background tasks");
        // No receivers left is fine; the loops may already be gone.
        let _ = self.shutdown_tx.send(());
        result.tasks_stopped = self.wait_for_tasks(tasks).await;

        tracing::info!("Phase 2: Closing dashboard sessions");
        self.bridge.stop_monitor().await;
        result.sessions_closed = self.close_sessions();

        tracing::info!("Phase 3: Final usage flush");
        result.final_flush = self.flush.final_flush(self.config.final_flush_timeout).await;

        result.duration = start.elapsed();
        result.success = result
            .final_flush
            .as_ref()
            .map(FlushReport::is_clean)
            .unwrap_or(false);

        tracing::info!(
            tasks_stopped = result.tasks_stopped,
            sessions_closed = result.sessions_closed,
            flushed = result.final_flush.as_ref().map(|r| r.flushed.len()).unwrap_or(0),
            success = result.success,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }

    /// Wait for `tasks` to exit; those still running at the timeout are aborted.
    async fn wait_for_tasks(&self, tasks: Vec<JoinHandle<()>>) -> usize {
        let total = tasks.len();
        let aborts: Vec<AbortHandle> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let mut stopped = 0;

        let wait = async {
            for task in tasks {
                match task.await {
                    Ok(()) => stopped += 1,
                    Err(e) => tracing::warn!(error = %e, "Background task ended abnormally"),
                }
            }
        };

        if timeout(self.config.task_timeout, wait).await.is_err() {
            tracing::warn!(
                total = total,
                stopped = stopped,
                "Timed out waiting for background tasks to stop, aborting the rest"
            );
            for handle in &aborts {
                handle.abort();
            }
        }

        stopped
    }

    /// Close every live session; each pump releases its own subscriptions.
    fn close_sessions(&self) -> usize {
        let sessions = self.registry.all_sessions();
        for session in &sessions {
            session.close();
        }
        sessions.len()
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether the final flush completed without failures
    pub success: bool,
    /// Background tasks that exited before the timeout
    pub tasks_stopped: usize,
    /// Sessions told to close
    pub sessions_closed: usize,
    /// `None` when the final flush missed its deadline
    pub final_flush: Option<FlushReport>,
    pub duration: Duration,
}
