use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;

use ara_control_plane::config::Settings;
use ara_control_plane::server::{create_app, AppState};
use ara_control_plane::shutdown::{GracefulShutdown, ShutdownConfig};
use ara_control_plane::telemetry::init_telemetry;
use ara_control_plane::usage::{LiveStateSource, MetricsAggregator, SysinfoSampler};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing; the guard flushes spans on drop
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    // Create application state
    let state = AppState::new(settings.clone()).await;
    tracing::info!(
        broker = state.broker.backend_name(),
        usage_store = state.store.backend_name(),
        "Application state initialized"
    );

    // Presence monitor feeds the aggregator; without it only connection
    // counts are metered.
    if let Err(e) = state.bridge.start_monitor().await {
        tracing::error!(error = %e, "Failed to start presence monitor");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Start metrics aggregator in background
    let live: Arc<dyn LiveStateSource> = state.bridge.presence();
    let aggregator = MetricsAggregator::new(
        state.counters.clone(),
        state.registry.clone(),
        live,
        settings.usage.collection_period(),
        shutdown_tx.subscribe(),
    )
    .with_sampler(Arc::new(SysinfoSampler::new()));
    let aggregator_handle = tokio::spawn(aggregator.run());

    // Start flush pipeline in background
    let flush_handle = tokio::spawn(
        state
            .flush
            .clone()
            .run(settings.usage.flush_period(), shutdown_tx.subscribe()),
    );

    let shutdown = GracefulShutdown::with_config(
        state.registry.clone(),
        state.bridge.clone(),
        state.flush.clone(),
        shutdown_tx,
        ShutdownConfig {
            final_flush_timeout: settings.usage.final_flush_deadline(),
            ..ShutdownConfig::default()
        },
    );

    // Create Axum app
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Run server until a shutdown signal arrives
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler())
        .await?;

    let result = shutdown
        .execute("server shutdown", vec![aggregator_handle, flush_handle])
        .await;
    if !result.success {
        tracing::warn!("Usage counters were not fully persisted at shutdown");
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
